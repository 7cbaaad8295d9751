// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Host;
use uuid::Uuid;

/// A fully qualified agent identifier of the form `<name>.<issuer-domain>`.
///
/// The issuer domain is the domain of the access point that signed the
/// agent's certificate. An [`Aid`] is globally unique and immutable once
/// created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Aid {
    name: String,
    issuer: String,
}

#[derive(Debug, Clone, Error)]
pub enum AidError {
    #[error("The given string does not represent a valid agent id.")]
    InvalidAid,
    #[error(transparent)]
    UrlError(#[from] url::ParseError),
}

impl Aid {
    /// The leading label, i.e. the agent's name within its issuer domain.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The issuer domain, i.e. everything after the first label.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The AID of the group authority serving this agent's issuer domain.
    ///
    /// Cross-AP groups address a different authority; callers pass that
    /// target explicitly instead of deriving it.
    pub fn group_authority(&self) -> Aid {
        Aid {
            name: "group".to_string(),
            issuer: self.issuer.clone(),
        }
    }
}

impl fmt::Display for Aid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.issuer)
    }
}

impl From<Aid> for String {
    fn from(value: Aid) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Aid {
    type Error = AidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for Aid {
    type Err = AidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Arbitrary upper limit so identifiers stay filesystem- and
        // wire-friendly.
        if s.len() > 253 {
            return Err(AidError::InvalidAid);
        }
        // AIDs are domain-shaped; IP addresses are not acceptable.
        match Host::parse(s)? {
            Host::Domain(_) => {}
            Host::Ipv4(_) | Host::Ipv6(_) => return Err(AidError::InvalidAid),
        }
        let (name, issuer) = s.split_once('.').ok_or(AidError::InvalidAid)?;
        // The issuer must itself be a domain, so it needs at least two
        // labels of its own.
        if name.is_empty() || !issuer.contains('.') {
            debug!("agent id {s} has no issuer domain");
            return Err(AidError::InvalidAid);
        }
        Ok(Self {
            name: name.to_string(),
            issuer: issuer.to_string(),
        })
    }
}

/// Server-assigned identifier of a P2P session.
///
/// While the message channel is down, locally created sessions carry a
/// `session-<ms>-<counter>` fallback id; the server will not route those.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn local(now_ms: i64, counter: u64) -> Self {
        Self(format!("session-{now_ms}-{counter}"))
    }

    /// Whether this id was generated locally as an offline fallback.
    pub fn is_local(&self) -> bool {
        self.0.starts_with("session-")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Server-assigned identifier of a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for GroupId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Correlation id attached to every request frame, 32 lowercase hex chars.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_aid() {
        let aid: Aid = "alice.ex.com".parse().unwrap();
        assert_eq!(aid.name(), "alice");
        assert_eq!(aid.issuer(), "ex.com");
        assert_eq!(aid.to_string(), "alice.ex.com");
    }

    #[test]
    fn group_authority_derivation() {
        let aid: Aid = "alice.ex.com".parse().unwrap();
        assert_eq!(aid.group_authority().to_string(), "group.ex.com");
    }

    #[test]
    fn invalid_aid() {
        assert!("alice".parse::<Aid>().is_err());
        assert!("alice.com".parse::<Aid>().is_err());
        assert!("192.168.0.1".parse::<Aid>().is_err());
        assert!("inva#lid.ex.com".parse::<Aid>().is_err());
    }

    #[test]
    fn aid_serde_round_trip() {
        let aid: Aid = "bob.ap.example.org".parse().unwrap();
        let json = serde_json::to_string(&aid).unwrap();
        assert_eq!(json, "\"bob.ap.example.org\"");
        let back: Aid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, aid);
    }

    #[test]
    fn local_session_ids() {
        let id = SessionId::local(1700000000000, 7);
        assert!(id.is_local());
        assert_eq!(id.as_str(), "session-1700000000000-7");
    }

    #[test]
    fn request_id_is_hex_uuid() {
        let id = RequestId::random();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
