//! Identifier generation.
//!
//! Every registry owns its own [`IdGenerator`]; there is no process-wide
//! generator. An identifier is random letters followed by a per-generator
//! sequence number written in the same alphabet, so two identifiers from one
//! generator differ whenever their sequence numbers are less than 52^k apart
//! (k trailing letters). Callers still check their registry and retry a
//! bounded number of times.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default identifier length.
pub const DEFAULT_ID_LENGTH: usize = 8;

/// Retries after the first collision before giving up.
pub const MAX_ID_RETRIES: usize = 3;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Base-52 digits that fit in a u64.
const LETTERS_PER_WORD: usize = 11;

/// Most trailing letters given to the sequence number.
const SEQUENCE_LETTERS: usize = 3;

/// Thread-safe generator of short alphabetic identifiers.
#[derive(Debug)]
pub struct IdGenerator {
    length: usize,
    sequence: AtomicU64,
}

impl IdGenerator {
    /// Create a generator producing identifiers of `length` letters.
    #[must_use]
    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(1),
            sequence: AtomicU64::new(u64::from(rand::rng().random::<u32>())),
        }
    }

    /// Produce the next identifier.
    ///
    /// Up to half of the letters (at most three) encode the sequence number;
    /// the rest are random.
    #[must_use]
    pub fn next_id(&self) -> String {
        let mut seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let seq_letters = (self.length / 2).min(SEQUENCE_LETTERS);

        let mut rng = rand::rng();
        let mut out = String::with_capacity(self.length);
        let mut bits = 0;
        for i in 0..self.length - seq_letters {
            if i % LETTERS_PER_WORD == 0 {
                bits = rng.random::<u64>();
            }
            push_letter(&mut out, &mut bits);
        }
        for _ in 0..seq_letters {
            push_letter(&mut out, &mut seq);
        }
        out
    }

    /// Produce an identifier not yet `taken`.
    ///
    /// `format` turns the raw random part into the final identifier. Returns
    /// `None` if the first attempt and [`MAX_ID_RETRIES`] retries all collide.
    pub fn next_unique(
        &self,
        format: impl Fn(&str) -> String,
        taken: impl Fn(&str) -> bool,
    ) -> Option<String> {
        (0..=MAX_ID_RETRIES)
            .map(|_| format(&self.next_id()))
            .find(|id| !taken(id))
    }
}

fn push_letter(out: &mut String, value: &mut u64) {
    let base = LETTERS.len() as u64;
    out.push(LETTERS[(*value % base) as usize] as char);
    *value /= base;
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_ID_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashSet;

    #[test]
    fn test_id_shape() {
        let ids = IdGenerator::new(8);
        let id = ids.next_id();
        assert_eq!(id.len(), 8);
        assert!(id.bytes().all(|b| b.is_ascii_alphabetic()));

        let long = IdGenerator::new(30).next_id();
        assert_eq!(long.len(), 30);
    }

    #[test]
    fn test_ids_distinct() {
        let ids = IdGenerator::default();
        let seen: HashSet<String> = (0..10_000).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn test_sequence_letters_never_repeat_within_window() {
        // One random letter, one sequence letter.
        let ids = IdGenerator::new(2);
        let tails: HashSet<char> = (0..52)
            .map(|_| ids.next_id().chars().last().unwrap())
            .collect();
        assert_eq!(tails.len(), 52);

        let ids = IdGenerator::default();
        let tails: HashSet<String> = (0..5_000).map(|_| ids.next_id()[5..].to_string()).collect();
        assert_eq!(tails.len(), 5_000);
    }

    #[test]
    fn test_next_unique_retries_then_gives_up() {
        let ids = IdGenerator::default();

        let attempts = Cell::new(0);
        let id = ids.next_unique(
            |raw| format!("x-{}", raw),
            |_| {
                attempts.set(attempts.get() + 1);
                attempts.get() < 3
            },
        );
        assert!(id.unwrap().starts_with("x-"));
        assert_eq!(attempts.get(), 3);

        let attempts = Cell::new(0);
        let id = ids.next_unique(
            |raw| raw.to_string(),
            |_| {
                attempts.set(attempts.get() + 1);
                true
            },
        );
        assert!(id.is_none());
        assert_eq!(attempts.get(), 1 + MAX_ID_RETRIES);
    }

    #[test]
    fn test_concurrent_generation() {
        let ids = std::sync::Arc::new(IdGenerator::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
    }
}
