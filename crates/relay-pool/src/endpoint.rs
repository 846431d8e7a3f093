use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::PoolError;

/// A validated relay endpoint (`ws://` or `wss://`).
///
/// A bare trailing slash is dropped so `wss://relay.example` and
/// `wss://relay.example/` name the same relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayUrl(String);

impl RelayUrl {
    pub fn parse(value: &str) -> Result<Self, PoolError> {
        let value = value.trim();
        let url = Url::parse(value).map_err(|e| PoolError::InvalidUrl {
            url: value.to_string(),
            reason: e.to_string(),
        })?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(PoolError::InvalidUrl {
                url: value.to_string(),
                reason: format!("scheme must be ws or wss, got {}", url.scheme()),
            });
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(PoolError::InvalidUrl {
                url: value.to_string(),
                reason: "missing host".to_string(),
            });
        }

        let mut normalized = url.to_string();
        if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
            normalized.pop();
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RelayUrl {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RelayUrl {
    type Error = PoolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
