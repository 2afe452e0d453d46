//! Device tokens.
//!
//! Every StageLinq device identifies itself with 16 raw bytes that are
//! conventionally rendered as a hyphenated UUID. This module wraps
//! `uuid::Uuid` so that a token is validated exactly once, at the boundary
//! where it enters the program, and is never re-validated downstream.
//!
//! # Example
//! ```
//! use std::str::FromStr;
//! use stagelinq::token::Token;
//!
//! let token = Token::from_str("52fdfc07-2182-654f-163f-5f0f9a621d72").unwrap();
//! let same = Token::from_bytes(token.as_bytes()).unwrap();
//! assert_eq!(token, same);
//! ```

use std::{fmt, ops::Deref, str::FromStr};

use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::error::{Error, Result};

/// A 16 byte device token.
///
/// This type implements `Deref` to `uuid::Uuid`, allowing transparent access
/// to the raw bytes through [`uuid::Uuid::as_bytes`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub struct Token(uuid::Uuid);

/// Provides transparent access to all methods of the underlying `uuid::Uuid` type.
impl Deref for Token {
    type Target = uuid::Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Token {
    /// Length of a token on the wire.
    pub const LENGTH: usize = 16;

    /// Constructs a token from raw wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::invalid_argument`] if `bytes` is not exactly
    /// [`Token::LENGTH`] bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LENGTH {
            return Err(Error::invalid_argument(format!(
                "token should be {} bytes but is {}",
                Self::LENGTH,
                bytes.len()
            )));
        }

        uuid::Uuid::from_slice(bytes).map(Self).map_err(Into::into)
    }

    /// Generates a random token using a fast random number generator.
    ///
    /// Not suitable where token predictability matters; StageLinq tokens
    /// are plain identifiers.
    #[must_use]
    pub fn fast_v4() -> Self {
        let random_bytes = fastrand::u128(..).to_ne_bytes();
        let uuid = uuid::Builder::from_random_bytes(random_bytes).into_uuid();
        Self(uuid)
    }

    /// Derives a stable token from some machine identifier.
    #[must_use]
    pub fn from_machine_id(machine_id: &str) -> Self {
        let namespace = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_DNS, b"stagelinq");
        Self(uuid::Uuid::new_v5(&namespace, machine_id.as_bytes()))
    }
}

/// Formats as `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`.
impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Parses the canonical hyphenated form only.
///
/// # Errors
///
/// Returns [`Error::invalid_argument`] for the simple, braced or URN forms
/// that `uuid` would otherwise accept, and for anything that is not a UUID.
impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() != uuid::fmt::Hyphenated::LENGTH {
            return Err(Error::invalid_argument(format!(
                "token `{s}` is not in hyphenated form"
            )));
        }

        uuid::Uuid::try_parse(s).map(Self).map_err(Into::into)
    }
}

impl From<Token> for uuid::Uuid {
    fn from(value: Token) -> Self {
        *value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BYTES: [u8; 16] = [
        82, 253, 252, 7, 33, 130, 101, 79, 22, 63, 95, 15, 154, 98, 29, 114,
    ];

    #[test]
    fn renders_bytes_as_hyphenated_uuid() {
        let token = Token::from_bytes(&BYTES).unwrap();
        assert_eq!(token.to_string(), "52fdfc07-2182-654f-163f-5f0f9a621d72");
        assert_eq!(token.as_bytes(), &BYTES);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Token::from_bytes(&BYTES[..15]).is_err());
        assert!(Token::from_bytes(&[0; 17]).is_err());
    }

    #[test]
    fn rejects_non_hyphenated_strings() {
        assert!("52fdfc072182654f163f5f0f9a621d72".parse::<Token>().is_err());
        assert!("{52fdfc07-2182-654f-163f-5f0f9a621d72}"
            .parse::<Token>()
            .is_err());
        assert!("52fdfc07-2182-654f-163f-5f0f9a621dzz"
            .parse::<Token>()
            .is_err());
    }

    #[test]
    fn machine_tokens_are_stable() {
        assert_eq!(
            Token::from_machine_id("abc"),
            Token::from_machine_id("abc")
        );
        assert_ne!(
            Token::from_machine_id("abc"),
            Token::from_machine_id("abd")
        );
    }
}
