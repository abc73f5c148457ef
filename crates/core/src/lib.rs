//! Clove core: shared foundation for the Clove runtime and compiler.
//!
//! Deliberately tiny. This crate holds the pieces both the runtime and the
//! compiler need without dragging either's dependency set along:
//! - `mix`: Murmur3 hash building blocks used by value hashing and the
//!   persistent collections
//! - `codepoint`: UTF-8 codepoint indexing primitives

pub mod codepoint;
pub mod mix;

pub use mix::{fmix, hash_long, hash_string, mix_coll_hash, mix_h1, mix_k1};
