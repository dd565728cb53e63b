//! Prefixed identifier newtypes.
//!
//! Session and connection ids are opaque tokens of the form
//! `<prefix>_<uuid v7>`. The prefix makes ids self-describing in logs and in
//! the session journal; the v7 suffix keeps them time-ordered.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix carried by freshly generated ids.
            pub const PREFIX: &'static str = $prefix;

            /// Generate a new id.
            #[must_use]
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7().simple()))
            }

            /// Wrap an existing token without validation.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Borrow the token.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

prefixed_id! {
    /// Identity of one logical client session.
    SessionId, "sess"
}

prefixed_id! {
    /// Identity of one accepted transport connection.
    ConnectionId, "conn"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_carries_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"));
    }

    #[test]
    fn suffix_is_uuid_v7() {
        let id = ConnectionId::new();
        let suffix = id.as_str().trim_start_matches("conn_");
        let parsed = Uuid::parse_str(suffix).unwrap();
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn ids_sort_by_creation() {
        let a = SessionId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = SessionId::new();
        assert!(a < b);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = SessionId::from("sess_abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sess_abc\"");
        let back: SessionId = serde_json::from_str("\"sess_abc\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn display_matches_token() {
        let id = SessionId::from("sess_display");
        assert_eq!(format!("{id}"), "sess_display");
        let s: String = id.into();
        assert_eq!(s, "sess_display");
    }
}
