use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::IdSettings;

const MAX_HASH_LENGTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("id space exhausted: {attempts} collisions at length {length}")]
    SpaceExhausted { attempts: u32, length: usize },
}

#[derive(Debug, Clone)]
pub struct IdGenerator {
    prefix: String,
    base_length: usize,
    thresholds: Vec<u64>,
    max_attempts: u32,
}

impl IdGenerator {
    pub fn new(settings: &IdSettings) -> Self {
        Self {
            prefix: normalize_prefix(&settings.prefix),
            base_length: settings.base_length,
            thresholds: settings.thresholds.clone(),
            max_attempts: settings.max_attempts,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hex length for a corpus of `population` known issues: one extra
    /// character per crossed threshold.
    pub fn hash_length(&self, population: u64) -> usize {
        let crossed = self
            .thresholds
            .iter()
            .filter(|threshold| population >= **threshold)
            .count();
        (self.base_length + crossed).min(MAX_HASH_LENGTH)
    }

    /// Generates a fresh `<prefix>-<hex>` id, retrying with a new random seed
    /// while `exists` reports a collision.
    pub fn next_id<F, E>(&self, population: u64, content: &str, mut exists: F) -> Result<String, E>
    where
        F: FnMut(&str) -> Result<bool, E>,
        E: From<IdError>,
    {
        let length = self.hash_length(population);
        for attempt in 0..self.max_attempts {
            let candidate = format!("{}-{}", self.prefix, hash_hex(content, attempt, length));
            if !exists(&candidate)? {
                return Ok(candidate);
            }
            debug!(candidate = %candidate, attempt, "IDCollisionRetry");
        }

        Err(IdError::SpaceExhausted {
            attempts: self.max_attempts,
            length,
        }
        .into())
    }
}

fn hash_hex(content: &str, attempt: u32, length: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(Uuid::now_v7().as_bytes());
    hasher.update(attempt.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..length].to_string()
}

pub fn child_id(parent_id: &str, child_number: u64) -> String {
    format!("{parent_id}.{child_number}")
}

/// Splits `bd-a1b2.3` into (`bd-a1b2`, 3). Only the last dotted segment is
/// considered, so grandchildren resolve to their immediate parent.
pub fn split_child_id(id: &str) -> Option<(&str, u64)> {
    let (parent, suffix) = id.rsplit_once('.')?;
    let number = suffix.parse::<u64>().ok()?;
    if parent.is_empty() {
        return None;
    }
    Some((parent, number))
}

fn normalize_prefix(raw: &str) -> String {
    let normalized = raw
        .chars()
        .map(|ch| ch.to_ascii_lowercase())
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .collect::<String>();
    if normalized.is_empty() {
        "bd".to_string()
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{child_id, split_child_id, IdError, IdGenerator};
    use crate::config::IdSettings;

    fn generator() -> IdGenerator {
        IdGenerator::new(&IdSettings::default())
    }

    fn fresh(gen: &IdGenerator, population: u64) -> String {
        gen.next_id(population, "title", |_| Ok::<_, IdError>(false))
            .expect("id should generate")
    }

    #[test]
    fn generated_ids_follow_prefix_hex_shape() {
        let id = fresh(&generator(), 0);
        let (prefix, hex) = id.split_once('-').expect("id should contain a dash");
        assert_eq!(prefix, "bd");
        assert_eq!(hex.len(), 4);
        assert!(hex.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn length_grows_once_per_crossed_threshold() {
        let gen = generator();
        assert_eq!(gen.hash_length(0), 4);
        assert_eq!(gen.hash_length(499), 4);
        assert_eq!(gen.hash_length(500), 5);
        assert_eq!(gen.hash_length(1499), 5);
        assert_eq!(gen.hash_length(1500), 6);

        let before = fresh(&gen, 10);
        let after = fresh(&gen, 600);
        assert!(after.len() > before.len());
    }

    #[test]
    fn retries_on_collision_then_succeeds() {
        let mut calls = 0;
        let id = generator()
            .next_id(0, "retry", |_| {
                calls += 1;
                Ok::<_, IdError>(calls < 3)
            })
            .expect("third candidate should be accepted");
        assert_eq!(calls, 3);
        assert!(id.starts_with("bd-"));
    }

    #[test]
    fn exhausts_after_bounded_attempts() {
        let settings = IdSettings {
            max_attempts: 5,
            ..IdSettings::default()
        };
        let err = IdGenerator::new(&settings)
            .next_id(0, "full", |_| Ok::<_, IdError>(true))
            .expect_err("every candidate collides");
        assert_eq!(
            err,
            IdError::SpaceExhausted {
                attempts: 5,
                length: 4
            }
        );
    }

    #[test]
    fn ids_stay_unique_against_a_growing_store() {
        let gen = generator();
        let mut seen = HashSet::new();
        for n in 0..2_000u64 {
            let id = gen
                .next_id(n, "bulk", |candidate| Ok::<_, IdError>(seen.contains(candidate)))
                .expect("id should generate");
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn child_ids_round_trip() {
        let id = child_id("bd-a1b2", 7);
        assert_eq!(id, "bd-a1b2.7");
        assert_eq!(split_child_id(&id), Some(("bd-a1b2", 7)));
        assert_eq!(split_child_id("bd-a1b2.3.1"), Some(("bd-a1b2.3", 1)));
        assert_eq!(split_child_id("bd-a1b2"), None);
    }

    #[test]
    fn prefix_is_normalized() {
        let settings = IdSettings {
            prefix: "Proj!".to_string(),
            ..IdSettings::default()
        };
        assert_eq!(IdGenerator::new(&settings).prefix(), "proj");
    }
}
