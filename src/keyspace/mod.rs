//! Keyspace model
//!
//! Computes the total candidate space of a resolved attack plan and carves
//! contiguous slices out of it. Each attack mode is a tagged variant with two
//! pure functions — [`AttackPlan::keyspace`] and [`AttackPlan::next_slice`] —
//! there are no per-mode handler types.
//!
//! Positions are 64-bit signed with saturating semantics: a keyspace that
//! would exceed `i64::MAX` is clamped and flagged unbounded, and such jobs
//! only terminate by user action.

use serde::{Deserialize, Serialize};

use crate::types::AttackMode;

pub mod mask;

pub use mask::{Mask, MaskToken};

/// Inclusive mask-length range for brute-force increment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementRange {
    pub min_len: u32,
    pub max_len: u32,
}

/// Total candidate space of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keyspace {
    /// Candidate count, clamped to `i64::MAX` when `unbounded`.
    pub total: i64,
    pub unbounded: bool,
}

impl Keyspace {
    fn bounded(total: i64) -> Self {
        Self {
            total,
            unbounded: false,
        }
    }

    fn from_saturating(total: i64) -> Self {
        Self {
            total,
            unbounded: total == i64::MAX,
        }
    }
}

/// A contiguous half-open slice `[start, end)` of a job's keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceRange {
    pub start: i64,
    pub end: i64,
}

impl KeyspaceRange {
    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// A resolved attack plan: file references replaced by their captured line
/// counts, masks parsed. This is what keyspace math runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AttackPlan {
    Dictionary {
        wordlist_lines: i64,
        rule_count: i64,
    },
    Combination {
        left_lines: i64,
        right_lines: i64,
    },
    BruteForce {
        mask: Mask,
        increment: Option<IncrementRange>,
    },
    HybridWordlistMask {
        wordlist_lines: i64,
        mask: Mask,
    },
    HybridMaskWordlist {
        mask: Mask,
        wordlist_lines: i64,
    },
    Association {
        hash_count: i64,
    },
}

impl AttackPlan {
    pub fn attack_mode(&self) -> AttackMode {
        match self {
            AttackPlan::Dictionary { .. } => AttackMode::Dictionary,
            AttackPlan::Combination { .. } => AttackMode::Combination,
            AttackPlan::BruteForce { .. } => AttackMode::BruteForce,
            AttackPlan::HybridWordlistMask { .. } => AttackMode::HybridWordlistMask,
            AttackPlan::HybridMaskWordlist { .. } => AttackMode::HybridMaskWordlist,
            AttackPlan::Association { .. } => AttackMode::Association,
        }
    }

    /// Total candidate space of this plan.
    pub fn keyspace(&self) -> Keyspace {
        match self {
            AttackPlan::Dictionary {
                wordlist_lines,
                rule_count,
            } => Keyspace::from_saturating(wordlist_lines.saturating_mul((*rule_count).max(1))),
            AttackPlan::Combination {
                left_lines,
                right_lines,
            } => Keyspace::from_saturating(left_lines.saturating_mul(*right_lines)),
            AttackPlan::BruteForce { mask, increment } => match increment {
                None => Keyspace::from_saturating(mask.combinations()),
                Some(range) => {
                    let mut total: i64 = 0;
                    for len in range.min_len..=range.max_len.min(mask.len()) {
                        total = total.saturating_add(mask.combinations_for_len(len));
                    }
                    Keyspace::from_saturating(total)
                }
            },
            AttackPlan::HybridWordlistMask {
                wordlist_lines,
                mask,
            }
            | AttackPlan::HybridMaskWordlist {
                mask,
                wordlist_lines,
            } => Keyspace::from_saturating(wordlist_lines.saturating_mul(mask.combinations())),
            AttackPlan::Association { hash_count } => Keyspace::bounded(*hash_count),
        }
    }

    /// Carve the next slice of at most `size` candidates starting at
    /// `cursor`. Returns `None` once the keyspace is exhausted.
    pub fn next_slice(&self, cursor: i64, size: i64) -> Option<KeyspaceRange> {
        let ks = self.keyspace();
        if cursor >= ks.total {
            return None;
        }
        let size = size.max(1);
        let end = cursor.saturating_add(size).min(ks.total);
        Some(KeyspaceRange { start: cursor, end })
    }

    /// Wordlist line count for modes where the wordlist is the chunked axis.
    pub fn wordlist_lines(&self) -> Option<i64> {
        match self {
            AttackPlan::Dictionary { wordlist_lines, .. }
            | AttackPlan::HybridWordlistMask { wordlist_lines, .. }
            | AttackPlan::HybridMaskWordlist { wordlist_lines, .. } => Some(*wordlist_lines),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(s: &str) -> Mask {
        Mask::parse(s, &[]).unwrap()
    }

    #[test]
    fn dictionary_keyspace_multiplies_rules() {
        let plan = AttackPlan::Dictionary {
            wordlist_lines: 1_000_000,
            rule_count: 64,
        };
        assert_eq!(plan.keyspace().total, 64_000_000);

        // No rules behaves like a single identity rule.
        let plain = AttackPlan::Dictionary {
            wordlist_lines: 1_000_000,
            rule_count: 0,
        };
        assert_eq!(plain.keyspace().total, 1_000_000);
    }

    #[test]
    fn combination_keyspace_is_cross_product() {
        let plan = AttackPlan::Combination {
            left_lines: 5_000,
            right_lines: 2_000,
        };
        assert_eq!(plan.keyspace().total, 10_000_000);
    }

    #[test]
    fn brute_force_increment_sums_prefix_lengths() {
        let plan = AttackPlan::BruteForce {
            mask: mask("?d?d?d?d"),
            increment: Some(IncrementRange {
                min_len: 2,
                max_len: 4,
            }),
        };
        assert_eq!(plan.keyspace().total, 100 + 1_000 + 10_000);
    }

    #[test]
    fn hybrid_keyspace_expands_mask_per_word() {
        let plan = AttackPlan::HybridWordlistMask {
            wordlist_lines: 500,
            mask: mask("?d?d"),
        };
        assert_eq!(plan.keyspace().total, 50_000);
    }

    #[test]
    fn association_keyspace_equals_hash_count() {
        let plan = AttackPlan::Association { hash_count: 4_242 };
        let ks = plan.keyspace();
        assert_eq!(ks.total, 4_242);
        assert!(!ks.unbounded);
    }

    #[test]
    fn oversized_keyspace_saturates_and_flags_unbounded() {
        let plan = AttackPlan::Combination {
            left_lines: i64::MAX / 2,
            right_lines: i64::MAX / 2,
        };
        let ks = plan.keyspace();
        assert_eq!(ks.total, i64::MAX);
        assert!(ks.unbounded);
    }

    #[test]
    fn next_slice_clamps_to_keyspace_end() {
        let plan = AttackPlan::Dictionary {
            wordlist_lines: 1_000,
            rule_count: 0,
        };
        let slice = plan.next_slice(900, 500).unwrap();
        assert_eq!(slice.start, 900);
        assert_eq!(slice.end, 1_000);
        assert!(plan.next_slice(1_000, 500).is_none());
    }

    #[test]
    fn unbounded_plan_always_has_a_next_slice() {
        let plan = AttackPlan::Combination {
            left_lines: i64::MAX,
            right_lines: 2,
        };
        let slice = plan.next_slice(i64::MAX - 10, 1_000_000).unwrap();
        assert_eq!(slice.end, i64::MAX);
    }
}
