//! String interning for per-host keys.
//!
//! Grounded on the teacher crate's `storage/interner.rs`, reused here as
//! the "string interning" capability spec.md §6 calls out: a process-stable
//! index for a host string. Unlike the teacher's interner (which exists to
//! shrink serialized snapshots) this one exists purely to give
//! [`crate::hoststats::HostTable`] a dense, hashable key.

use std::collections::HashMap;
use xxhash_rust::xxh3::xxh3_64;

/// Interns strings to a stable `u64` id, with reverse lookup.
#[derive(Default)]
pub struct Interner {
    strings: HashMap<u64, String>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `s`, returning its id. Interning the same string twice
    /// returns the same id.
    pub fn intern(&mut self, s: &str) -> u64 {
        let id = xxh3_64(s.as_bytes());
        self.strings.entry(id).or_insert_with(|| s.to_string());
        id
    }

    pub fn resolve(&self, id: u64) -> Option<&str> {
        self.strings.get(&id).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut interner = Interner::new();
        let a = interner.intern("10.0.0.1");
        let b = interner.intern("10.0.0.1");
        assert_eq!(a, b);
        assert_eq!(interner.resolve(a), Some("10.0.0.1"));
    }

    #[test]
    fn distinct_strings_get_distinct_ids() {
        let mut interner = Interner::new();
        let a = interner.intern("host-a");
        let b = interner.intern("host-b");
        assert_ne!(a, b);
    }
}
