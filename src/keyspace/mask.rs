//! Hashcat-style mask parsing and charset-product counting
//!
//! A mask is a sequence of positions, each drawing from a charset: built-in
//! classes (`?l ?u ?d ?s ?a ?b ?h ?H`), user charsets (`?1`..`?4`) or literal
//! characters. `??` escapes a literal question mark. All products saturate at
//! `i64::MAX`.

use serde::{Deserialize, Serialize};

use crate::types::KeyspaceError;

const LOWER: i64 = 26;
const UPPER: i64 = 26;
const DIGITS: i64 = 10;
const SYMBOLS: i64 = 33;
const PRINTABLE: i64 = 95;
const BYTES: i64 = 256;
const HEX: i64 = 16;

/// One mask position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskToken {
    /// `?l ?u ?d ?s ?a ?b ?h ?H`
    Builtin(char),
    /// `?1`..`?4`, resolved against the job's custom charsets.
    Custom(u8),
    Literal(char),
}

/// A parsed mask with its custom charset sizes captured at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask {
    tokens: Vec<MaskToken>,
    /// Charset size per custom slot 1..=4, where provided.
    custom_sizes: [Option<i64>; 4],
}

impl Mask {
    /// Parse a mask string, resolving `?1`..`?4` against `custom_charsets`
    /// (slot 1 is `custom_charsets[0]`). Custom charsets may themselves use
    /// built-in classes, e.g. `?l?d` for lowercase+digits.
    pub fn parse(mask: &str, custom_charsets: &[String]) -> Result<Self, KeyspaceError> {
        if mask.is_empty() {
            return Err(KeyspaceError::InvalidMask("empty mask".to_string()));
        }

        let mut custom_sizes = [None; 4];
        for (i, charset) in custom_charsets.iter().take(4).enumerate() {
            custom_sizes[i] = Some(charset_expanded_size(charset)?);
        }

        let mut tokens = Vec::new();
        let mut chars = mask.chars();
        while let Some(c) = chars.next() {
            if c != '?' {
                tokens.push(MaskToken::Literal(c));
                continue;
            }
            let class = chars.next().ok_or_else(|| {
                KeyspaceError::InvalidMask(format!("trailing '?' in mask {:?}", mask))
            })?;
            match class {
                'l' | 'u' | 'd' | 's' | 'a' | 'b' | 'h' | 'H' => {
                    tokens.push(MaskToken::Builtin(class));
                }
                '1'..='4' => {
                    let slot = class as u8 - b'0';
                    if custom_sizes[(slot - 1) as usize].is_none() {
                        return Err(KeyspaceError::MissingCustomCharset { index: slot });
                    }
                    tokens.push(MaskToken::Custom(slot));
                }
                '?' => tokens.push(MaskToken::Literal('?')),
                other => {
                    return Err(KeyspaceError::InvalidMask(format!(
                        "unknown charset class '?{}'",
                        other
                    )))
                }
            }
        }

        Ok(Self {
            tokens,
            custom_sizes,
        })
    }

    /// Number of positions in the mask.
    pub fn len(&self) -> u32 {
        self.tokens.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn charset_size(&self, token: &MaskToken) -> i64 {
        match token {
            MaskToken::Builtin('l') => LOWER,
            MaskToken::Builtin('u') => UPPER,
            MaskToken::Builtin('d') => DIGITS,
            MaskToken::Builtin('s') => SYMBOLS,
            MaskToken::Builtin('a') => PRINTABLE,
            MaskToken::Builtin('b') => BYTES,
            MaskToken::Builtin('h') | MaskToken::Builtin('H') => HEX,
            MaskToken::Builtin(_) => 1,
            MaskToken::Custom(slot) => self.custom_sizes[(*slot - 1) as usize].unwrap_or(1),
            MaskToken::Literal(_) => 1,
        }
    }

    /// Candidate count for the full mask, saturating at `i64::MAX`.
    pub fn combinations(&self) -> i64 {
        self.combinations_for_len(self.len())
    }

    /// Candidate count for the prefix of `len` positions (increment mode
    /// enumerates these). Saturates at `i64::MAX`.
    pub fn combinations_for_len(&self, len: u32) -> i64 {
        self.tokens
            .iter()
            .take(len as usize)
            .fold(1i64, |acc, t| acc.saturating_mul(self.charset_size(t)))
    }
}

/// Size of a custom charset after expanding built-in class references.
fn charset_expanded_size(charset: &str) -> Result<i64, KeyspaceError> {
    let mut size: i64 = 0;
    let mut chars = charset.chars();
    while let Some(c) = chars.next() {
        if c != '?' {
            size = size.saturating_add(1);
            continue;
        }
        let class = chars.next().ok_or_else(|| {
            KeyspaceError::InvalidMask(format!("trailing '?' in charset {:?}", charset))
        })?;
        let n = match class {
            'l' => LOWER,
            'u' => UPPER,
            'd' => DIGITS,
            's' => SYMBOLS,
            'a' => PRINTABLE,
            'b' => BYTES,
            'h' | 'H' => HEX,
            '?' => 1,
            other => {
                return Err(KeyspaceError::InvalidMask(format!(
                    "unknown charset class '?{}' in custom charset",
                    other
                )))
            }
        };
        size = size.saturating_add(n);
    }
    if size == 0 {
        return Err(KeyspaceError::InvalidMask("empty custom charset".to_string()));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_builtin_classes() {
        let mask = Mask::parse("?l?l?d?d", &[]).unwrap();
        assert_eq!(mask.len(), 4);
        assert_eq!(mask.combinations(), 26 * 26 * 10 * 10);
    }

    #[test]
    fn literals_count_as_one() {
        let mask = Mask::parse("pass?d?d", &[]).unwrap();
        assert_eq!(mask.len(), 6);
        assert_eq!(mask.combinations(), 100);
    }

    #[test]
    fn escaped_question_mark() {
        let mask = Mask::parse("??" , &[]).unwrap();
        assert_eq!(mask.len(), 1);
        assert_eq!(mask.combinations(), 1);
    }

    #[test]
    fn custom_charsets_expand_builtins() {
        // ?1 = lowercase + digits = 36 symbols
        let mask = Mask::parse("?1?1", &["?l?d".to_string()]).unwrap();
        assert_eq!(mask.combinations(), 36 * 36);
    }

    #[test]
    fn missing_custom_charset_is_rejected() {
        let err = Mask::parse("?2", &["abc".to_string()]).unwrap_err();
        assert_eq!(err, KeyspaceError::MissingCustomCharset { index: 2 });
    }

    #[test]
    fn unknown_class_is_rejected() {
        assert!(Mask::parse("?x", &[]).is_err());
        assert!(Mask::parse("?l?", &[]).is_err());
    }

    #[test]
    fn prefix_combinations_for_increment_mode() {
        let mask = Mask::parse("?d?d?d", &[]).unwrap();
        assert_eq!(mask.combinations_for_len(1), 10);
        assert_eq!(mask.combinations_for_len(2), 100);
        assert_eq!(mask.combinations_for_len(3), 1_000);
    }

    #[test]
    fn huge_mask_saturates() {
        // 256^16 far exceeds i64::MAX.
        let mask = Mask::parse(&"?b".repeat(16), &[]).unwrap();
        assert_eq!(mask.combinations(), i64::MAX);
    }
}
