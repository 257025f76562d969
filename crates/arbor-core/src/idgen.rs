//! Deterministic id derivation for occurrence clones.
//!
//! An [`IdAllocator`] maps `(template id, occurrence index)` to the id of the
//! clone. Implementations must be pure and must never produce the same id
//! for two different inputs.

use std::sync::LazyLock;

use num_bigint::BigUint;
use num_traits::Zero;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Base36 alphabet (0-9, a-z).
const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Converts a byte slice to a base36 string of exactly `length` characters,
/// keeping the least significant digits.
pub fn encode_base36(data: &[u8], length: usize) -> String {
    let mut num = BigUint::from_bytes_be(data);
    let base = BigUint::from(36u32);

    let mut digits: Vec<char> = Vec::with_capacity(length);
    while !num.is_zero() {
        let rem = &num % &base;
        num /= &base;
        let i = rem.to_u32_digits().first().copied().unwrap_or(0) as usize;
        digits.push(char::from(BASE36_ALPHABET[i]));
    }
    digits.reverse();

    let mut s: String = digits.into_iter().collect();
    if s.len() < length {
        s = "0".repeat(length - s.len()) + &s;
    }
    if s.len() > length {
        s = s[s.len() - length..].to_owned();
    }
    s
}

/// A trailing occurrence suffix: `-<1 to 6 digits>`, possibly repeated.
static OCCURRENCE_SUFFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:-\d{1,6})+$").ok());

/// Strips any trailing occurrence suffix (`a-1-2` becomes `a`).
///
/// A 12-digit UUID tail is not a suffix, so plain UUIDs pass through.
pub fn strip_occurrence_suffix(id: &str) -> &str {
    let Some(re) = OCCURRENCE_SUFFIX.as_ref() else {
        return id;
    };
    match re.find(id) {
        Some(m) if m.start() > 0 => &id[..m.start()],
        _ => id,
    }
}

// ---------------------------------------------------------------------------
// IdAllocator
// ---------------------------------------------------------------------------

/// Strategy for naming clones.
pub trait IdAllocator: Send + Sync {
    /// Id of the clone of `template_id` in occurrence `occurrence`.
    fn derive(&self, template_id: &str, occurrence: u32) -> String;

    /// Whether `id` looks like something this strategy produced. Used to
    /// avoid treating a prior clone as a template.
    fn is_derived(&self, id: &str) -> bool;

    /// Short name for logs and configuration.
    fn name(&self) -> &'static str;
}

/// `<template>-<n>`, the historical convention.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuffixIds;

impl IdAllocator for SuffixIds {
    fn derive(&self, template_id: &str, occurrence: u32) -> String {
        format!("{template_id}-{occurrence}")
    }

    fn is_derived(&self, id: &str) -> bool {
        strip_occurrence_suffix(id).len() != id.len()
    }

    fn name(&self) -> &'static str {
        "suffix"
    }
}

/// `<prefix><base36(sha256(template|n))>`: opaque ids that do not leak the
/// template id.
#[derive(Debug, Clone)]
pub struct HashedIds {
    prefix: String,
    length: usize,
}

impl HashedIds {
    pub fn new(prefix: impl Into<String>, length: usize) -> Self {
        Self {
            prefix: prefix.into(),
            length: length.clamp(8, 24),
        }
    }
}

impl Default for HashedIds {
    fn default() -> Self {
        Self::new("occ-", 12)
    }
}

impl IdAllocator for HashedIds {
    fn derive(&self, template_id: &str, occurrence: u32) -> String {
        let hash = Sha256::digest(format!("{template_id}|{occurrence}").as_bytes());
        // 16 bytes (128 bits) comfortably covers 24 base36 digits.
        format!("{}{}", self.prefix, encode_base36(&hash[..16], self.length))
    }

    fn is_derived(&self, id: &str) -> bool {
        id.strip_prefix(self.prefix.as_str()).is_some_and(|rest| {
            rest.len() == self.length && rest.bytes().all(|b| BASE36_ALPHABET.contains(&b))
        })
    }

    fn name(&self) -> &'static str {
        "hashed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encode_base36_pads_and_truncates() {
        assert_eq!(encode_base36(&[], 4), "0000");
        assert_eq!(encode_base36(&[35], 2), "0z");
        assert_eq!(encode_base36(&[0xFF, 0xFF, 0xFF, 0xFF], 3).len(), 3);
    }

    #[test]
    fn suffix_derivation() {
        let ids = SuffixIds;
        assert_eq!(ids.derive("node_a", 1), "node_a-1");
        assert_eq!(ids.derive("node_a", 12), "node_a-12");
        assert_ne!(ids.derive("node_a", 1), ids.derive("node_a", 2));
    }

    #[test]
    fn suffix_detection() {
        let ids = SuffixIds;
        assert!(ids.is_derived("node_a-1"));
        assert!(ids.is_derived("node_a-1-2"));
        assert!(!ids.is_derived("node_a"));
        assert!(!ids.is_derived("7f3c2a10-1b2c-4d5e-8f90-123456789012"));
        assert!(ids.is_derived("7f3c2a10-1b2c-4d5e-8f90-123456789012-3"));
    }

    #[test]
    fn strip_suffix() {
        assert_eq!(strip_occurrence_suffix("v1-1-2"), "v1");
        assert_eq!(strip_occurrence_suffix("v1"), "v1");
        assert_eq!(strip_occurrence_suffix("-1"), "-1");
    }

    #[test]
    fn hashed_ids_are_stable_and_distinct() {
        let ids = HashedIds::default();
        let a1 = ids.derive("a", 1);
        assert_eq!(a1, ids.derive("a", 1));
        assert_ne!(a1, ids.derive("a", 2));
        assert_ne!(a1, ids.derive("b", 1));
        assert!(a1.starts_with("occ-"));
        assert!(ids.is_derived(&a1));
        assert!(!ids.is_derived("a"));
    }
}
