use crate::error::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// An instant rendered as RFC 3339 on the wire (`transactionTime`, `_since`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(pub OffsetDateTime);

impl Instant {
    pub fn new(datetime: OffsetDateTime) -> Self {
        Self(datetime)
    }

    pub fn inner(&self) -> &OffsetDateTime {
        &self.0
    }

    pub fn into_inner(self) -> OffsetDateTime {
        self.0
    }
}

impl From<OffsetDateTime> for Instant {
    fn from(value: OffsetDateTime) -> Self {
        Self(value)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = self.0.format(&Rfc3339).map_err(|_| fmt::Error)?;
        write!(f, "{formatted}")
    }
}

impl FromStr for Instant {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        parse_instant(s).map(Instant)
    }
}

impl Serialize for Instant {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let formatted = self.0.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }
}

impl<'de> Deserialize<'de> for Instant {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Instant::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Parses an RFC 3339 instant with optional fractional seconds and an offset.
///
/// A space in place of the `+` of a positive offset is accepted, since an
/// unescaped `+` in a query string decodes to a space.
pub fn parse_instant(s: &str) -> Result<OffsetDateTime> {
    let candidate = s.trim_end();
    let repaired;
    let candidate = if candidate.contains(' ') {
        repaired = candidate.replace(' ', "+");
        repaired.as_str()
    } else {
        candidate
    };

    OffsetDateTime::parse(candidate, &Rfc3339).map_err(|_| {
        CoreError::invalid_date_format("Date must be in FHIR Instant format.")
    })
}

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Formats an instant as RFC 3339, falling back to the unix timestamp.
pub fn format_rfc3339(datetime: OffsetDateTime) -> String {
    datetime
        .format(&Rfc3339)
        .unwrap_or_else(|_| datetime.unix_timestamp().to_string())
}
