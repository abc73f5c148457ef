//! Reader: source text -> forms
//!
//! Tokenizes and parses Clove source into runtime values, keeping a
//! parallel position tree so later phases can anchor errors at the exact
//! operand that failed. Lines and columns are 0-indexed internally; lines
//! display 1-indexed.

use clove_runtime::error::{Error, Phase, Result};
use clove_runtime::heap::Heap;
use clove_runtime::value::Value;
use num_bigint::BigInt;

/// A token with source position information.
#[derive(Debug, Clone)]
pub struct Token {
    pub text: String,
    /// Line number (0-indexed)
    pub line: u32,
    /// Column number (0-indexed)
    pub col: u32,
}

/// A read form: the value plus the positions of it and its children.
///
/// `children` is populated for collection forms, flattened key/value for
/// maps. `meta` carries `^` metadata normalized to a map value.
#[derive(Debug, Clone)]
pub struct Form {
    pub value: Value,
    pub line: u32,
    pub col: u32,
    pub children: Vec<Form>,
    pub meta: Option<Value>,
}

impl Form {
    fn leaf(value: Value, line: u32, col: u32) -> Form {
        Form {
            value,
            line,
            col,
            children: Vec::new(),
            meta: None,
        }
    }

    /// Rebuild a form tree from a bare value, anchoring every node at the
    /// given position. Used for macro-expansion results, whose positions
    /// degrade to the call site.
    pub fn from_value(value: Value, line: u32, col: u32) -> Form {
        use clove_runtime::value::HeapObj;
        let mut children = Vec::new();
        if value.is_heap() {
            match value.obj() {
                HeapObj::List(items) | HeapObj::Vector(items) => {
                    children = items
                        .iter()
                        .map(|v| Form::from_value(*v, line, col))
                        .collect();
                }
                HeapObj::ArrayMap(_) | HeapObj::Map(_) => {
                    for (k, v) in clove_runtime::collections::map_entries(value) {
                        children.push(Form::from_value(k, line, col));
                        children.push(Form::from_value(v, line, col));
                    }
                }
                HeapObj::Set(_) => {
                    children = clove_runtime::collections::set_elements(value)
                        .into_iter()
                        .map(|v| Form::from_value(v, line, col))
                        .collect();
                }
                _ => {}
            }
        }
        Form {
            value,
            line,
            col,
            children,
            meta: None,
        }
    }
}

fn read_error(msg: impl Into<String>, line: u32, col: u32) -> Error {
    Error::value_error(msg)
        .with_phase(Phase::Read)
        .at(line, col)
}

// =============================================================================
// Tokenizer
// =============================================================================

// A quote is a symbol character except at token start (the promoting
// arithmetic names +' -' *' depend on this), where the dispatch loop
// treats it as the quote macro.
fn is_symbol_char(c: char) -> bool {
    !c.is_whitespace()
        && !matches!(
            c,
            '(' | ')' | '[' | ']' | '{' | '}' | '"' | ';' | ',' | '@' | '^' | '`' | '~'
        )
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut line: u32 = 0;
    let mut col: u32 = 0;
    let mut chars = source.chars().peekable();

    macro_rules! bump {
        ($c:expr) => {
            if $c == '\n' {
                line += 1;
                col = 0;
            } else {
                col += 1;
            }
        };
    }

    while let Some(&c) = chars.peek() {
        // Whitespace and commas separate tokens
        if c.is_whitespace() || c == ',' {
            chars.next();
            bump!(c);
            continue;
        }
        // Line comments
        if c == ';' {
            for c in chars.by_ref() {
                bump!(c);
                if c == '\n' {
                    break;
                }
            }
            continue;
        }
        let start_line = line;
        let start_col = col;

        match c {
            '(' | ')' | '[' | ']' | '{' | '}' | '\'' | '@' | '^' | '`' => {
                chars.next();
                bump!(c);
                tokens.push(Token {
                    text: c.to_string(),
                    line: start_line,
                    col: start_col,
                });
            }
            '#' => {
                chars.next();
                bump!(c);
                match chars.peek() {
                    Some('{') => {
                        chars.next();
                        bump!('{');
                        tokens.push(Token {
                            text: "#{".to_string(),
                            line: start_line,
                            col: start_col,
                        });
                    }
                    Some('_') => {
                        chars.next();
                        bump!('_');
                        tokens.push(Token {
                            text: "#_".to_string(),
                            line: start_line,
                            col: start_col,
                        });
                    }
                    Some('"') => {
                        chars.next();
                        bump!('"');
                        let mut pat = String::from("#\"");
                        let mut closed = false;
                        while let Some(c) = chars.next() {
                            bump!(c);
                            if c == '\\' {
                                pat.push(c);
                                if let Some(e) = chars.next() {
                                    bump!(e);
                                    pat.push(e);
                                }
                                continue;
                            }
                            if c == '"' {
                                closed = true;
                                break;
                            }
                            pat.push(c);
                        }
                        if !closed {
                            return Err(read_error(
                                "unclosed regex literal, missing closing quote",
                                start_line,
                                start_col,
                            ));
                        }
                        pat.push('"');
                        tokens.push(Token {
                            text: pat,
                            line: start_line,
                            col: start_col,
                        });
                    }
                    _ => {
                        return Err(read_error("unsupported dispatch macro", start_line, start_col));
                    }
                }
            }
            '"' => {
                chars.next();
                bump!(c);
                let mut text = String::from("\"");
                let mut closed = false;
                while let Some(c) = chars.next() {
                    bump!(c);
                    if c == '\\' {
                        text.push(c);
                        if let Some(e) = chars.next() {
                            bump!(e);
                            text.push(e);
                        }
                        continue;
                    }
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    text.push(c);
                }
                if !closed {
                    return Err(read_error(
                        "unclosed string literal, missing closing quote",
                        start_line,
                        start_col,
                    ));
                }
                text.push('"');
                tokens.push(Token {
                    text,
                    line: start_line,
                    col: start_col,
                });
            }
            '\\' => {
                chars.next();
                bump!(c);
                let mut text = String::from("\\");
                // First char after the backslash is always part of the literal
                if let Some(&first) = chars.peek() {
                    chars.next();
                    bump!(first);
                    text.push(first);
                    if first.is_alphanumeric() {
                        while let Some(&cc) = chars.peek() {
                            if cc.is_alphanumeric() || cc == '-' {
                                chars.next();
                                bump!(cc);
                                text.push(cc);
                            } else {
                                break;
                            }
                        }
                    }
                }
                tokens.push(Token {
                    text,
                    line: start_line,
                    col: start_col,
                });
            }
            _ => {
                let mut text = String::new();
                while let Some(&cc) = chars.peek() {
                    if is_symbol_char(cc) {
                        chars.next();
                        bump!(cc);
                        text.push(cc);
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    text,
                    line: start_line,
                    col: start_col,
                });
            }
        }
    }
    Ok(tokens)
}

// =============================================================================
// Reader
// =============================================================================

pub struct Reader<'h> {
    heap: &'h Heap,
    tokens: Vec<Token>,
    pos: usize,
    /// Namespace view for syntax resolution; the pipeline refreshes this
    /// between top-level forms so reads after an `ns` form resolve there.
    pub current_ns: String,
}

impl<'h> Reader<'h> {
    pub fn new(heap: &'h Heap, source: &str) -> Result<Reader<'h>> {
        Ok(Reader {
            heap,
            tokens: tokenize(source)?,
            pos: 0,
            current_ns: "user".to_string(),
        })
    }

    pub fn set_current_ns(&mut self, ns: &str) {
        self.current_ns = ns.to_string();
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    /// Read the next top-level form, or `None` at end of input.
    pub fn next_form(&mut self) -> Result<Option<Form>> {
        if self.peek().is_none() {
            return Ok(None);
        }
        self.read_form().map(Some)
    }

    fn read_form(&mut self) -> Result<Form> {
        let token = self
            .advance()
            .ok_or_else(|| read_error("unexpected end of input", 0, 0))?;
        let (line, col) = (token.line, token.col);

        match token.text.as_str() {
            "(" => self.read_delimited(")", line, col).map(|forms| {
                let items: Vec<Value> = forms.iter().map(|f| f.value).collect();
                Form {
                    value: self.heap.list_from(items),
                    line,
                    col,
                    children: forms,
                    meta: None,
                }
            }),
            "[" => self.read_delimited("]", line, col).map(|forms| {
                let items: Vec<Value> = forms.iter().map(|f| f.value).collect();
                Form {
                    value: self.heap.vector_from(items),
                    line,
                    col,
                    children: forms,
                    meta: None,
                }
            }),
            "{" => {
                let forms = self.read_delimited("}", line, col)?;
                if forms.len() % 2 != 0 {
                    return Err(read_error("map literal needs an even number of forms", line, col));
                }
                let pairs: Vec<(Value, Value)> = forms
                    .chunks(2)
                    .map(|pair| (pair[0].value, pair[1].value))
                    .collect();
                Ok(Form {
                    value: clove_runtime::collections::map_from_pairs(self.heap, pairs),
                    line,
                    col,
                    children: forms,
                    meta: None,
                })
            }
            "#{" => {
                let forms = self.read_delimited("}", line, col)?;
                let items: Vec<Value> = forms.iter().map(|f| f.value).collect();
                Ok(Form {
                    value: clove_runtime::collections::set_from_items(self.heap, items),
                    line,
                    col,
                    children: forms,
                    meta: None,
                })
            }
            ")" | "]" | "}" => Err(read_error(format!("unmatched '{}'", token.text), line, col)),
            "'" => {
                let quoted = self.read_form()?;
                let quote_sym = self.heap.symbol(None, "quote");
                Ok(Form {
                    value: self.heap.list_from(vec![quote_sym, quoted.value]),
                    line,
                    col,
                    children: vec![Form::leaf(quote_sym, line, col), quoted],
                    meta: None,
                })
            }
            "@" => {
                let target = self.read_form()?;
                let deref_sym = self.heap.symbol(None, "deref");
                Ok(Form {
                    value: self.heap.list_from(vec![deref_sym, target.value]),
                    line,
                    col,
                    children: vec![Form::leaf(deref_sym, line, col), target],
                    meta: None,
                })
            }
            "^" => {
                let meta_form = self.read_form()?;
                let mut target = self.read_form()?;
                target.meta = Some(normalize_meta(self.heap, meta_form.value));
                Ok(target)
            }
            "#_" => {
                // Discard the next form, then read the one after it
                self.read_form()?;
                self.read_form()
            }
            "`" => Err(read_error("syntax-quote is not supported", line, col)),
            text => self.read_atom(text, line, col),
        }
    }

    fn read_delimited(&mut self, close: &str, line: u32, col: u32) -> Result<Vec<Form>> {
        let mut forms = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(read_error(
                        format!("unclosed collection, expected '{close}'"),
                        line,
                        col,
                    ));
                }
                Some(t) if t.text == close => {
                    self.pos += 1;
                    return Ok(forms);
                }
                Some(t) if t.text == "#_" => {
                    self.pos += 1;
                    self.read_form()?;
                }
                Some(_) => forms.push(self.read_form()?),
            }
        }
    }

    fn read_atom(&mut self, text: &str, line: u32, col: u32) -> Result<Form> {
        // Strings
        if let Some(body) = text.strip_prefix('"') {
            let body = body.strip_suffix('"').unwrap_or(body);
            let unescaped = unescape(body, line, col)?;
            return Ok(Form::leaf(self.heap.str_value(unescaped), line, col));
        }
        // Regex literals
        if let Some(pat) = text.strip_prefix("#\"") {
            let pat = pat.strip_suffix('"').unwrap_or(pat);
            let re = regex::Regex::new(pat)
                .map_err(|e| read_error(format!("invalid regex: {e}"), line, col))?;
            return Ok(Form::leaf(self.heap.regex(re), line, col));
        }
        // Character literals
        if let Some(name) = text.strip_prefix('\\') {
            let c = match name {
                "newline" => '\n',
                "space" => ' ',
                "tab" => '\t',
                "return" => '\r',
                "backspace" => '\u{8}',
                "formfeed" => '\u{c}',
                _ => {
                    if let Some(hex) = name.strip_prefix('u') {
                        let code = u32::from_str_radix(hex, 16).map_err(|_| {
                            read_error(format!("invalid character literal \\{name}"), line, col)
                        })?;
                        char::from_u32(code).ok_or_else(|| {
                            read_error(format!("invalid character literal \\{name}"), line, col)
                        })?
                    } else {
                        let mut cs = name.chars();
                        let c = cs.next().ok_or_else(|| {
                            read_error("empty character literal", line, col)
                        })?;
                        if cs.next().is_some() {
                            return Err(read_error(
                                format!("invalid character literal \\{name}"),
                                line,
                                col,
                            ));
                        }
                        c
                    }
                }
            };
            return Ok(Form::leaf(Value::char_val(c), line, col));
        }
        // Keywords
        if let Some(name) = text.strip_prefix(':') {
            let (ns, short) = split_qualified(name);
            return Ok(Form::leaf(self.heap.keyword(ns, short), line, col));
        }
        // nil / booleans
        match text {
            "nil" => return Ok(Form::leaf(Value::nil(), line, col)),
            "true" => return Ok(Form::leaf(Value::bool_val(true), line, col)),
            "false" => return Ok(Form::leaf(Value::bool_val(false), line, col)),
            _ => {}
        }
        // Numbers
        if looks_numeric(text) {
            return self.read_number(text, line, col).map(|v| Form::leaf(v, line, col));
        }
        // Symbols
        let (ns, short) = split_qualified(text);
        Ok(Form::leaf(self.heap.symbol(ns, short), line, col))
    }

    fn read_number(&self, text: &str, line: u32, col: u32) -> Result<Value> {
        // Ratio literals
        if let Some((n, d)) = text.split_once('/') {
            let num: BigInt = n
                .parse()
                .map_err(|_| read_error(format!("invalid ratio literal '{text}'"), line, col))?;
            let den: BigInt = d
                .parse()
                .map_err(|_| read_error(format!("invalid ratio literal '{text}'"), line, col))?;
            return clove_runtime::arith::make_ratio(self.heap, num, den)
                .map_err(|e| read_error(e.message, line, col));
        }
        // Big-int suffix
        if let Some(digits) = text.strip_suffix('N') {
            let n: BigInt = digits
                .parse()
                .map_err(|_| read_error(format!("invalid integer literal '{text}'"), line, col))?;
            return Ok(self.heap.big(n));
        }
        // Big-decimal suffix
        if let Some(digits) = text.strip_suffix('M') {
            return parse_big_dec(self.heap, digits)
                .ok_or_else(|| read_error(format!("invalid decimal literal '{text}'"), line, col));
        }
        // Floats
        if text.contains('.') || text.contains('e') || text.contains('E') {
            return text
                .parse::<f64>()
                .map(Value::float)
                .map_err(|_| read_error(format!("invalid float literal '{text}'"), line, col));
        }
        // Integers, auto-promoting wide literals
        match text.parse::<i64>() {
            Ok(n) => Ok(self.heap.int(n)),
            Err(_) => {
                let n: BigInt = text.parse().map_err(|_| {
                    read_error(format!("invalid integer literal '{text}'"), line, col)
                })?;
                Ok(self.heap.big(n))
            }
        }
    }
}

fn looks_numeric(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('-') | Some('+') => matches!(chars.next(), Some(c) if c.is_ascii_digit()),
        _ => false,
    }
}

fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        // A bare "/" is the division symbol
        Some((ns, short)) if !ns.is_empty() && !short.is_empty() => (Some(ns), short),
        _ => (None, name),
    }
}

fn unescape(body: &str, line: u32, col: u32) -> Result<String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('0') => out.push('\0'),
            Some(other) => {
                return Err(read_error(
                    format!("unsupported string escape '\\{other}'"),
                    line,
                    col,
                ));
            }
            None => return Err(read_error("dangling escape in string", line, col)),
        }
    }
    Ok(out)
}

/// Normalize `^:kw` shorthand to `{:kw true}`; maps pass through.
fn normalize_meta(heap: &Heap, meta: Value) -> Value {
    use clove_runtime::value::{HeapObj, ValueKind};
    if meta.kind() == ValueKind::Keyword {
        return heap.array_map(vec![(meta, Value::bool_val(true))]);
    }
    if meta.is_heap() {
        if let HeapObj::Str(_) = meta.obj() {
            // ^"doc string"
            return heap.array_map(vec![(heap.keyword(None, "doc"), meta)]);
        }
    }
    meta
}

fn parse_big_dec(heap: &Heap, digits: &str) -> Option<Value> {
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    let joined = format!("{int_part}{frac_part}");
    let unscaled: BigInt = joined.parse().ok()?;
    Some(heap.big_dec(unscaled, frac_part.len() as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clove_runtime::value::ValueKind;

    fn read_one(heap: &Heap, src: &str) -> Form {
        let mut reader = Reader::new(heap, src).unwrap();
        reader.next_form().unwrap().unwrap()
    }

    #[test]
    fn test_numbers() {
        let h = Heap::new();
        assert_eq!(read_one(&h, "42").value.as_int(), 42);
        assert_eq!(read_one(&h, "-17").value.as_int(), -17);
        assert_eq!(read_one(&h, "2.5").value.as_float(), 2.5);
        assert_eq!(read_one(&h, "7N").value.kind(), ValueKind::BigInt);
        assert_eq!(read_one(&h, "1.25M").value.kind(), ValueKind::BigDec);
        assert_eq!(read_one(&h, "1/4").value.kind(), ValueKind::Ratio);
        // Integral ratio literals reduce to integers
        assert_eq!(read_one(&h, "4/2").value.as_int(), 2);
        // Literals wider than the immediate range promote
        assert_eq!(
            read_one(&h, "9223372036854775807").value.kind(),
            ValueKind::BigInt
        );
    }

    #[test]
    fn test_strings_and_chars() {
        let h = Heap::new();
        assert_eq!(read_one(&h, "\"hi\\n\"").value.as_str(), "hi\n");
        assert_eq!(read_one(&h, "\\a").value.as_char(), 'a');
        assert_eq!(read_one(&h, "\\newline").value.as_char(), '\n');
        assert_eq!(read_one(&h, "\\u0041").value.as_char(), 'A');
    }

    #[test]
    fn test_symbols_and_keywords() {
        let h = Heap::new();
        let sym = read_one(&h, "foo/bar");
        assert_eq!(sym.value.kind(), ValueKind::Symbol);
        assert_eq!(sym.value.as_symbol().ns.as_deref(), Some("foo"));
        assert_eq!(sym.value.as_symbol().name, "bar");

        let kw = read_one(&h, ":baz");
        assert_eq!(kw.value.kind(), ValueKind::Keyword);

        // Bare slash is the division symbol
        let div = read_one(&h, "/");
        assert_eq!(div.value.as_symbol().name, "/");
    }

    #[test]
    fn test_collections() {
        let h = Heap::new();
        let l = read_one(&h, "(1 2 3)");
        assert_eq!(l.value.kind(), ValueKind::List);
        assert_eq!(l.children.len(), 3);

        let v = read_one(&h, "[1 [2]]");
        assert_eq!(v.value.kind(), ValueKind::Vector);
        assert_eq!(v.children[1].children.len(), 1);

        let m = read_one(&h, "{:a 1, :b 2}");
        assert!(clove_runtime::collections::is_map(m.value));

        let s = read_one(&h, "#{1 2}");
        assert_eq!(s.value.kind(), ValueKind::HashSet);
    }

    #[test]
    fn test_positions_are_zero_indexed() {
        let h = Heap::new();
        let f = read_one(&h, "(+ 1 \"hello\")");
        assert_eq!(f.col, 0);
        assert_eq!(f.children[0].col, 1);
        assert_eq!(f.children[1].col, 3);
        assert_eq!(f.children[2].col, 5);
    }

    #[test]
    fn test_multiline_positions() {
        let h = Heap::new();
        let mut reader = Reader::new(&h, "1\n  (inc 2)").unwrap();
        reader.next_form().unwrap();
        let f = reader.next_form().unwrap().unwrap();
        assert_eq!(f.line, 1);
        assert_eq!(f.col, 2);
        assert_eq!(f.children[1].col, 7);
    }

    #[test]
    fn test_quote_and_deref_sugar() {
        let h = Heap::new();
        let q = read_one(&h, "'x");
        let items = q.value.as_seq_items();
        assert_eq!(items[0].as_symbol().name, "quote");

        let d = read_one(&h, "@a");
        let items = d.value.as_seq_items();
        assert_eq!(items[0].as_symbol().name, "deref");
    }

    #[test]
    fn test_discard_and_comments() {
        let h = Heap::new();
        let mut reader = Reader::new(&h, "; comment\n#_ignored 42").unwrap();
        let f = reader.next_form().unwrap().unwrap();
        assert_eq!(f.value.as_int(), 42);
        assert!(reader.next_form().unwrap().is_none());

        let v = read_one(&h, "[1 #_2 3]");
        assert_eq!(v.children.len(), 2);
    }

    #[test]
    fn test_meta_shorthand() {
        let h = Heap::new();
        let f = read_one(&h, "^:dynamic *out*");
        assert_eq!(f.value.as_symbol().name, "*out*");
        let meta = f.meta.unwrap();
        let flag =
            clove_runtime::collections::map_get(meta, h.keyword(None, "dynamic")).unwrap();
        assert!(flag.as_bool());
    }

    #[test]
    fn test_regex_literal() {
        let h = Heap::new();
        let f = read_one(&h, "#\"\\d+\"");
        assert_eq!(f.value.kind(), ValueKind::Regex);
    }

    #[test]
    fn test_unclosed_errors() {
        let h = Heap::new();
        assert!(Reader::new(&h, "\"oops").is_err());
        let mut reader = Reader::new(&h, "(1 2").unwrap();
        let err = reader.next_form().unwrap_err();
        assert_eq!(err.phase, Phase::Read);
        assert!(err.message.contains("unclosed"));
    }
}
