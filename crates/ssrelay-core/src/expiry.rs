//! Relay expiry policies.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// How long a relay stays valid after it is created or edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryPolicy {
    #[default]
    Permanent,
    Days(u32),
}

impl ExpiryPolicy {
    /// Absolute expiry timestamp, `None` for permanent relays.
    pub fn expires_at(self, now: u64) -> Option<u64> {
        match self {
            Self::Permanent => None,
            Self::Days(days) => Some(now + u64::from(days) * SECS_PER_DAY),
        }
    }
}

impl FromStr for ExpiryPolicy {
    type Err = Error;

    /// Accepts `permanent`, `7days`, `30days`, `90days` and `custom:<N>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "permanent" => Ok(Self::Permanent),
            "7days" => Ok(Self::Days(7)),
            "30days" => Ok(Self::Days(30)),
            "90days" => Ok(Self::Days(90)),
            other => {
                let days = other
                    .strip_prefix("custom:")
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "unknown expiry {other:?} (expected permanent, 7days, 30days, 90days or custom:<days>)"
                        ))
                    })?;
                Ok(Self::Days(days))
            }
        }
    }
}

impl fmt::Display for ExpiryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent => f.write_str("permanent"),
            Self::Days(days @ (7 | 30 | 90)) => write!(f, "{days}days"),
            Self::Days(days) => write!(f, "custom:{days}"),
        }
    }
}
