//! Strongly-typed identifiers used across the pipeline.
//!
//! Job and client identifiers are assigned outside this system (by producers and by
//! the session layer), so they are opaque strings rather than generated UUIDs.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::IdError;

/// Identifier of a job, assigned by the producer.
///
/// Used for correlation between a job and its completion events and as the
/// de-duplication key for consumers of those events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Identifier of a connected client/session that should receive notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Wrap an existing identifier without validation.
            ///
            /// Prefer `parse`/`FromStr` at trust boundaries; empty identifiers are
            /// rejected there.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl FromStr for $t {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(IdError::Empty($name));
                }
                Ok(Self(s.to_string()))
            }
        }
    };
}

impl_string_newtype!(JobId, "JobId");
impl_string_newtype!(ClientId, "ClientId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_blank_ids() {
        assert!("".parse::<JobId>().is_err());
        assert!("   ".parse::<ClientId>().is_err());
        assert_eq!("j1".parse::<JobId>().unwrap().as_str(), "j1");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = JobId::new("job-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"job-42\"");

        let back: JobId = serde_json::from_str("\"job-42\"").unwrap();
        assert_eq!(back, id);
    }
}
