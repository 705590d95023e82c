//! # Cell Address
//!
//! Canonical identifier for a warehouse storage cell and the parser for the
//! location dialects found in spreadsheets and scanner input.
//!
//! ## Canonical Form
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          A01 - 01 - 01 - A                              │
//! │                           │     │    │    │                             │
//! │            alley ─────────┘     │    │    └──── position (A..C)         │
//! │            (letter + 2 digits)  │    │                                  │
//! │            section ─────────────┘    └───────── tier (2 digits)         │
//! │            (2 digits)                                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Accepted Dialects (tried in this order)
//! ```text
//! 1. Dash form        A01-01-01-A        a01 - 01 - 01 - a
//! 2. Space form       A01 01 01 A
//! 3. Compact form     A010101A
//! 4. Numeric triple   OS NA 002 010 049  → A02-10-49-A
//! ```
//!
//! Leading `OS` / `NA` tokens are dropped before matching. Only the shape is
//! checked (digit counts, alphabet), never the range: `Z99-99-99-C` is a
//! valid address even if no such rack exists.
//!
//! ## Example
//! ```rust
//! use cellsync_core::CellAddress;
//!
//! let addr = CellAddress::parse(" a01 01 01 a ").unwrap();
//! assert_eq!(addr.to_string(), "A01-01-01-A");
//! assert_eq!(CellAddress::parse(&addr.to_string()).unwrap(), addr);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// Position letters a rack level can carry.
pub const POSITION_LETTERS: std::ops::RangeInclusive<char> = 'A'..='C';

/// Prefix tokens emitted by the WMS export in front of location codes.
const PREFIX_TOKENS: [&str; 2] = ["OS", "NA"];

/// Position assigned to addresses from the numeric triple dialect.
const TRIPLE_DEFAULT_POSITION: char = 'A';

// =============================================================================
// Cell Address
// =============================================================================

/// A parsed warehouse cell location.
///
/// Ordering is lexicographic by alley, section, tier, position, which matches
/// the physical walking order inside an alley.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellAddress {
    alley: String,
    section: String,
    tier: String,
    position: char,
}

impl CellAddress {
    /// Builds an address from already separated parts.
    ///
    /// Parts are upper-cased and checked for shape only.
    pub fn new(alley: &str, section: &str, tier: &str, position: &str) -> Result<Self, AddressError> {
        let input = format!("{alley}-{section}-{tier}-{position}");
        Self::from_parts(&input, alley, section, tier, position)
    }

    /// Parses a location string in any supported dialect.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let upper = raw.trim().to_uppercase();
        if upper.is_empty() {
            return Err(AddressError::Empty);
        }

        let mut tokens: Vec<&str> = upper.split_whitespace().collect();
        while tokens
            .first()
            .is_some_and(|t| PREFIX_TOKENS.contains(t))
        {
            tokens.remove(0);
        }
        if tokens.is_empty() {
            return Err(unrecognized(raw));
        }
        let body = tokens.join(" ");

        // 1. Dash form. Anything containing a dash can only be this dialect.
        if body.contains('-') {
            let parts: Vec<&str> = body.split('-').map(str::trim).collect();
            return match parts.as_slice() {
                [alley, section, tier, position] => {
                    Self::from_parts(raw, alley, section, tier, position)
                }
                _ => Err(unrecognized(raw)),
            };
        }

        match tokens.as_slice() {
            // 2. Space form.
            [alley, section, tier, position] => Self::from_parts(raw, alley, section, tier, position),

            // 3. Compact form: letter, six digits, letter.
            [compact] if compact.len() == 8 && compact.is_ascii() => Self::from_parts(
                raw,
                &compact[0..3],
                &compact[3..5],
                &compact[5..7],
                &compact[7..8],
            ),

            // 4. Numeric triple, each part zero-padded to three digits.
            [a, s, t] if [a, s, t].iter().all(|p| is_padded_triple(p)) => Self::from_parts(
                raw,
                &format!("A{}", &a[1..]),
                &s[1..],
                &t[1..],
                &TRIPLE_DEFAULT_POSITION.to_string(),
            ),

            _ => Err(unrecognized(raw)),
        }
    }

    fn from_parts(
        input: &str,
        alley: &str,
        section: &str,
        tier: &str,
        position: &str,
    ) -> Result<Self, AddressError> {
        let alley = alley.trim().to_uppercase();
        let section = section.trim().to_string();
        let tier = tier.trim().to_string();
        let position = position.trim().to_uppercase();

        let invalid = |part: &'static str, value: &str| AddressError::InvalidPart {
            input: input.trim().to_string(),
            part,
            value: value.to_string(),
        };

        let mut alley_chars = alley.chars();
        let alley_ok = alley.len() == 3
            && alley_chars.next().is_some_and(|c| c.is_ascii_uppercase())
            && alley_chars.all(|c| c.is_ascii_digit());
        if !alley_ok {
            return Err(invalid("alley", &alley));
        }
        if !is_two_digits(&section) {
            return Err(invalid("section", &section));
        }
        if !is_two_digits(&tier) {
            return Err(invalid("tier", &tier));
        }

        let mut position_chars = position.chars();
        let position_char = match (position_chars.next(), position_chars.next()) {
            (Some(c), None) if POSITION_LETTERS.contains(&c) => c,
            _ => return Err(invalid("position", &position)),
        };

        Ok(CellAddress {
            alley,
            section,
            tier,
            position: position_char,
        })
    }

    /// Alley code, e.g. `A01`.
    pub fn alley(&self) -> &str {
        &self.alley
    }

    /// Section code, e.g. `01`.
    pub fn section(&self) -> &str {
        &self.section
    }

    /// Tier code, e.g. `01`.
    pub fn tier(&self) -> &str {
        &self.tier
    }

    /// Position letter.
    pub fn position(&self) -> char {
        self.position
    }

    /// Tier as a number (always succeeds: tiers are two digits).
    pub fn tier_number(&self) -> u8 {
        self.tier.parse().unwrap_or_default()
    }
}

fn unrecognized(raw: &str) -> AddressError {
    AddressError::Unrecognized {
        input: raw.trim().to_string(),
    }
}

fn is_two_digits(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_digit())
}

fn is_padded_triple(s: &str) -> bool {
    s.len() == 3 && s.starts_with('0') && s.chars().all(|c| c.is_ascii_digit())
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.alley, self.section, self.tier, self.position
        )
    }
}

impl FromStr for CellAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CellAddress::parse(s)
    }
}

impl TryFrom<String> for CellAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CellAddress::parse(&value)
    }
}

impl From<CellAddress> for String {
    fn from(addr: CellAddress) -> Self {
        addr.to_string()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
