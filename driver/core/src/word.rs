//! Machine Word and Drum Address Formats
//!
//! A machine word is exactly ten decimal digits with a sign character, either
//! leading (`+0000001234`) or trailing (`0000001234+`). The normalized form is
//! always the ten digits followed by the sign.
//!
//! A drum address is one to four decimal digits, normalized by left-padding
//! with zeros to exactly four digits.
//!
//! Validation happens here, before any command text is built, so malformed
//! values never reach the engine.

use thiserror::Error;

/// Number of digits in a machine word
pub const WORD_DIGITS: usize = 10;

/// Number of digits in a normalized drum address
pub const ADDRESS_DIGITS: usize = 4;

/// The all-zero positive word
pub const ZERO_WORD: &str = "0000000000+";

/// The all-zero drum address
pub const ZERO_ADDRESS: &str = "0000";

/// A word or address string broke one of the format rules
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Nothing left after trimming
    #[error("{what} is empty")]
    Empty {
        /// "word" or "address"
        what: &'static str,
    },

    /// A word without a `+`/`-` at either end
    #[error("word {input:?} has no sign (expected a leading or trailing + or -)")]
    MissingSign {
        /// The rejected input
        input: String,
    },

    /// A word with a sign at both ends
    #[error("word {input:?} has more than one sign")]
    ExtraSign {
        /// The rejected input
        input: String,
    },

    /// A non-digit character where a digit was required
    #[error("{what} {input:?} contains non-digit character {found:?}")]
    NonDigit {
        /// "word" or "address"
        what: &'static str,
        /// The rejected input
        input: String,
        /// The offending character
        found: char,
    },

    /// A word with the wrong number of digits
    #[error("word {input:?} has {digits} digits (expected 10)")]
    WordLength {
        /// The rejected input
        input: String,
        /// Digits actually present
        digits: usize,
    },

    /// A switch flag that is neither `0` nor `1`
    #[error("flag {input:?} must be 0 or 1")]
    Flag {
        /// The rejected input
        input: String,
    },

    /// An address longer than four digits
    #[error("address {input:?} has {digits} digits (expected 1 to 4)")]
    AddressLength {
        /// The rejected input
        input: String,
        /// Digits actually present
        digits: usize,
    },
}

/// Normalize a signed word to `dddddddddd±`
///
/// # Errors
///
/// Returns a [`ValidationError`] naming the rule the input broke.
pub fn normalize_word(input: &str) -> Result<String, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty { what: "word" });
    }

    let is_sign = |c: char| c == '+' || c == '-';
    let first = trimmed.chars().next();
    let last = trimmed.chars().last();

    let (sign, digits) = match (first, last) {
        (Some(f), Some(l)) if is_sign(f) && is_sign(l) && trimmed.len() > 1 => {
            return Err(ValidationError::ExtraSign {
                input: input.to_string(),
            })
        }
        (Some(f), _) if is_sign(f) => (f, &trimmed[1..]),
        (_, Some(l)) if is_sign(l) => (l, &trimmed[..trimmed.len() - 1]),
        _ => {
            return Err(ValidationError::MissingSign {
                input: input.to_string(),
            })
        }
    };

    if let Some(found) = digits.chars().find(|c| !c.is_ascii_digit()) {
        return Err(ValidationError::NonDigit {
            what: "word",
            input: input.to_string(),
            found,
        });
    }

    if digits.len() != WORD_DIGITS {
        return Err(ValidationError::WordLength {
            input: input.to_string(),
            digits: digits.len(),
        });
    }

    Ok(format!("{digits}{sign}"))
}

/// Normalize a drum address to exactly four digits
///
/// # Errors
///
/// Returns a [`ValidationError`] for empty input, any non-digit (signs
/// included) or more than four digits.
pub fn normalize_address(input: &str) -> Result<String, ValidationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty { what: "address" });
    }

    if let Some(found) = trimmed.chars().find(|c| !c.is_ascii_digit()) {
        return Err(ValidationError::NonDigit {
            what: "address",
            input: input.to_string(),
            found,
        });
    }

    if trimmed.len() > ADDRESS_DIGITS {
        return Err(ValidationError::AddressLength {
            input: input.to_string(),
            digits: trimmed.len(),
        });
    }

    Ok(format!("{trimmed:0>width$}", width = ADDRESS_DIGITS))
}

/// Normalize a switch flag to `0` or `1`
///
/// # Errors
///
/// Returns [`ValidationError::Flag`] for anything else.
pub fn normalize_flag(input: &str) -> Result<String, ValidationError> {
    match input.trim() {
        "0" => Ok("0".to_string()),
        "1" => Ok("1".to_string()),
        _ => Err(ValidationError::Flag {
            input: input.to_string(),
        }),
    }
}

/// Split a normalized word into its digits and sign
///
/// Returns `None` if `word` is not in normalized form.
#[must_use]
pub fn split_word(word: &str) -> Option<(&str, char)> {
    if word.len() != WORD_DIGITS + 1 || !word.is_ascii() {
        return None;
    }
    let (digits, sign) = word.split_at(WORD_DIGITS);
    let sign = sign.chars().next()?;
    if digits.chars().all(|c| c.is_ascii_digit()) && (sign == '+' || sign == '-') {
        Some((digits, sign))
    } else {
        None
    }
}
