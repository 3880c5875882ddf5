//! Visitor identity hashing
//!
//! A visitor is the pair (client address, user agent). The pair is never stored;
//! only its SHA-256 digest is kept, rendered as lowercase hex on the wire.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Substituted for a missing address or user agent
pub const UNKNOWN: &str = "unknown";

/// Length of the digest in bytes
pub const DIGEST_LEN: usize = 32;

/// Opaque, fixed-length visitor identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; DIGEST_LEN]);

impl Identity {
    /// Hash request metadata into an identity.
    ///
    /// Missing fields fall back to [`UNKNOWN`] so that every request maps to a
    /// stable identity.
    pub fn from_request(address: Option<&str>, user_agent: Option<&str>) -> Self {
        let address = address.filter(|s| !s.is_empty()).unwrap_or(UNKNOWN);
        let user_agent = user_agent.filter(|s| !s.is_empty()).unwrap_or(UNKNOWN);

        let mut hasher = Sha256::new();
        hasher.update(address.as_bytes());
        hasher.update(b"|");
        hasher.update(user_agent.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell visitors apart in logs
        write!(f, "Identity({}…)", &self.to_hex()[..12])
    }
}

impl FromStr for Identity {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_request_same_identity() {
        let a = Identity::from_request(Some("203.0.113.7"), Some("Mozilla/5.0"));
        let b = Identity::from_request(Some("203.0.113.7"), Some("Mozilla/5.0"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_agent_or_address_change_identity() {
        let base = Identity::from_request(Some("203.0.113.7"), Some("Mozilla/5.0"));
        assert_ne!(base, Identity::from_request(Some("203.0.113.8"), Some("Mozilla/5.0")));
        assert_ne!(base, Identity::from_request(Some("203.0.113.7"), Some("curl/8.0")));
    }

    #[test]
    fn test_missing_fields_use_placeholder() {
        let missing = Identity::from_request(None, None);
        let explicit = Identity::from_request(Some(UNKNOWN), Some(UNKNOWN));
        assert_eq!(missing, explicit);
        assert_eq!(Identity::from_request(Some(""), None), explicit);
    }

    #[test]
    fn test_digest_matches_sha256_of_joined_pair() {
        let id = Identity::from_request(Some("1.2.3.4"), Some("ua"));
        let expected = hex::encode(Sha256::digest(b"1.2.3.4|ua"));
        assert_eq!(id.to_hex(), expected);
        assert_eq!(id.to_hex().len(), DIGEST_LEN * 2);
    }

    #[test]
    fn test_hex_serde() {
        let id = Identity::from_request(Some("1.2.3.4"), Some("ua"));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));

        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<Identity>("\"not-hex\"").is_err());
        assert!(serde_json::from_str::<Identity>("\"abcd\"").is_err());
    }
}
