use crate::error::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// UTC instant stored on every resource's `meta.lastUpdated`.
///
/// Wire form is RFC 3339; ordering and hashing delegate to the inner
/// [`OffsetDateTime`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FhirInstant(pub OffsetDateTime);

impl FhirInstant {
    pub fn new(datetime: OffsetDateTime) -> Self {
        Self(datetime)
    }

    pub fn inner(&self) -> &OffsetDateTime {
        &self.0
    }

    pub fn timestamp(&self) -> i64 {
        self.0.unix_timestamp()
    }
}

impl fmt::Display for FhirInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = self
            .0
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|_| fmt::Error)?;
        write!(f, "{formatted}")
    }
}

impl FromStr for FhirInstant {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let datetime = OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
            .map_err(|e| CoreError::invalid_instant(format!("failed to parse instant '{s}': {e}")))?;
        Ok(FhirInstant(datetime))
    }
}

impl Serialize for FhirInstant {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let formatted = self
            .0
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }
}

impl<'de> Deserialize<'de> for FhirInstant {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FhirInstant::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// The current UTC instant.
pub fn now_utc() -> FhirInstant {
    FhirInstant(OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn display_is_rfc3339() {
        let instant = FhirInstant::new(datetime!(2024-05-15 14:30:00 UTC));
        assert_eq!(instant.to_string(), "2024-05-15T14:30:00Z");
    }

    #[test]
    fn parses_offsets_back_to_utc_equivalence() {
        let instant = FhirInstant::from_str("2024-05-15T14:30:00+02:00").unwrap();
        let expected = datetime!(2024-05-15 12:30:00 UTC);
        assert_eq!(instant.0.to_offset(time::UtcOffset::UTC), expected);
    }

    #[test]
    fn rejects_garbage() {
        assert!(FhirInstant::from_str("not-a-date").is_err());
        assert!(FhirInstant::from_str("2024-13-01T00:00:00Z").is_err());
        assert!(FhirInstant::from_str("").is_err());
    }

    #[test]
    fn serde_round_trip() {
        let instant = FhirInstant::new(datetime!(2024-05-15 14:30:00 UTC));
        let json = serde_json::to_string(&instant).unwrap();
        assert_eq!(json, "\"2024-05-15T14:30:00Z\"");
        let back: FhirInstant = serde_json::from_str(&json).unwrap();
        assert_eq!(back, instant);
    }

    #[test]
    fn now_is_monotonic_enough() {
        let a = now_utc();
        let b = now_utc();
        assert!(b.0 >= a.0);
    }

    #[test]
    fn ordering_follows_the_clock() {
        let earlier = FhirInstant::new(datetime!(2024-05-15 14:30:00 UTC));
        let later = FhirInstant::new(datetime!(2024-05-15 14:30:01 UTC));
        assert!(earlier < later);
    }
}
