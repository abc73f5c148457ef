//! Process-wide keyword intern table
//!
//! Records which keywords exist anywhere in the process. One mutex guards
//! the table; operations are O(1) amortized. Concurrent interning from
//! worker threads is expected, so no single-threaded shortcut is taken.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

fn table() -> &'static Mutex<HashSet<String>> {
    static TABLE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashSet::new()))
}

fn key(ns: Option<&str>, name: &str) -> String {
    match ns {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

/// Record a keyword's presence. Idempotent.
pub fn intern(ns: Option<&str>, name: &str) {
    table()
        .lock()
        .expect("keyword table poisoned")
        .insert(key(ns, name));
}

/// Whether a keyword has ever been interned in this process.
pub fn is_interned(ns: Option<&str>, name: &str) -> bool {
    table()
        .lock()
        .expect("keyword table poisoned")
        .contains(&key(ns, name))
}

/// Number of distinct keywords interned so far.
pub fn count() -> usize {
    table().lock().expect("keyword table poisoned").len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_idempotent() {
        intern(None, "intern-idem-test");
        let before = count();
        intern(None, "intern-idem-test");
        assert_eq!(count(), before);
        assert!(is_interned(None, "intern-idem-test"));
    }

    #[test]
    fn test_namespaced_distinct_from_bare() {
        intern(Some("db"), "intern-ns-test");
        assert!(is_interned(Some("db"), "intern-ns-test"));
        assert!(!is_interned(None, "db-intern-ns-test-unseen"));
    }

    #[test]
    fn test_concurrent_intern() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    for j in 0..100 {
                        intern(Some("conc"), &format!("k{}-{}", i, j));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(is_interned(Some("conc"), "k0-0"));
        assert!(is_interned(Some("conc"), "k7-99"));
    }
}
