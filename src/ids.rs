//! Type-safe identifiers for connections, sessions, servers and requests.
//!
//! Each identifier wraps a [`Uuid`] in a distinct newtype so the compiler
//! rejects, say, passing a `ServerId` where a `SessionId` was expected.

use http::Request;
use std::fmt;
use std::str::FromStr;
use tower_http::request_id::{MakeRequestId, RequestId as TowerRequestId};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier (UUIDv4).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                self.0.serialize(serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                Ok(Self(Uuid::deserialize(deserializer)?))
            }
        }
    };
}

uuid_id!(
    ConnectionId,
    "Identifies one live socket connection on this server instance."
);
uuid_id!(
    SessionId,
    "Identifies a Local or Cluster user session (keyed by `origin` in the wire contract)."
);
uuid_id!(
    ServerId,
    "Identifies a server instance within the cluster, used to scope Local sessions and the publish-hook's `allServers` flag."
);

/// A request identifier attached to inbound HTTP requests for log correlation.
///
/// Unlike `ConnectionId`/`SessionId`/`ServerId`, this one is rendered with an
/// `req_` prefix on the wire (header value / log field) but carries no
/// TypeID-style type checksum; it is a plain random UUID underneath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new random request ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Renders the ID as `req_<uuid>`.
    #[must_use]
    pub fn as_string(&self) -> String {
        format!("req_{}", self.0)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl FromStr for RequestId {
    type Err = RequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("req_")
            .ok_or_else(|| RequestIdError::InvalidPrefix(s.to_string()))?;
        Ok(Self(Uuid::parse_str(rest).map_err(RequestIdError::Parse)?))
    }
}

/// Error parsing a [`RequestId`] from its string form.
#[derive(Debug, thiserror::Error)]
pub enum RequestIdError {
    /// The string did not start with the `req_` prefix.
    #[error("missing 'req_' prefix: {0}")]
    InvalidPrefix(String),

    /// The suffix was not a valid UUID.
    #[error("failed to parse request ID: {0}")]
    Parse(#[from] uuid::Error),
}

/// A [`MakeRequestId`] implementation that stamps each inbound request with a
/// fresh [`RequestId`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeTypedRequestId;

impl MakeRequestId for MakeTypedRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<TowerRequestId> {
        let id = RequestId::new();
        let header_value = http::HeaderValue::from_str(&id.as_string()).ok()?;
        Some(TowerRequestId::new(header_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_uniqueness() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn session_id_roundtrips_through_string() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn request_id_format() {
        let id = RequestId::new();
        assert!(id.as_string().starts_with("req_"));
    }

    #[test]
    fn request_id_parse_roundtrip() {
        let id = RequestId::new();
        let parsed: RequestId = id.as_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn request_id_rejects_missing_prefix() {
        let result = "01h455vb4pex5vsknk084sn02q".parse::<RequestId>();
        assert!(result.is_err());
    }

    #[test]
    fn make_typed_request_id_sets_header() {
        let mut maker = MakeTypedRequestId;
        let request = http::Request::builder().body(()).unwrap();
        let id = maker.make_request_id(&request);
        assert!(id.is_some());
        let header_value = id.unwrap().into_header_value();
        assert!(header_value.to_str().unwrap().starts_with("req_"));
    }
}
