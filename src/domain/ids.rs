//! Identifier newtypes with proper encapsulation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Venue-assigned order identifier.
///
/// The inner string is private so all construction goes through the
/// defined constructors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(String);

impl OrderId {
    /// Create a new `OrderId` from anything convertible to a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for OrderId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Venue-assigned fill/trade identifier, used for duplicate suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FillId(String);

impl FillId {
    /// Create a new `FillId` from anything convertible to a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FillId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for FillId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// An asset symbol such as `BTC`, `USDT` or `ETH`.
///
/// Kept as an owned, case-preserved string: venues disagree on casing in
/// wire payloads but agree within a single venue, so normalization lives
/// at the venue adapter boundary, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Asset(String);

impl Asset {
    /// Create a new `Asset` from anything convertible to a string.
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    /// Get the asset symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Asset {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Asset {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
