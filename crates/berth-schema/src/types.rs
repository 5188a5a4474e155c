//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Opaque identifier of a workspace; the key of the engine registry.
    WorkspaceId
);

string_newtype!(
    /// Runtime-assigned identifier of a created machine (e.g. a container id).
    MachineId
);

string_newtype!(
    /// Reference to a machine image, such as `postgres:16` or a locally built tag.
    ImageRef
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_id_display_and_as_ref() {
        let id = WorkspaceId::new("ws-1");
        assert_eq!(id.to_string(), "ws-1");
        assert_eq!(id.as_str(), "ws-1");
        assert_eq!(AsRef::<str>::as_ref(&id), "ws-1");
    }

    #[test]
    fn workspace_id_serde_roundtrip() {
        let id = WorkspaceId::new("ws-deadbeef");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ws-deadbeef\"");
        let back: WorkspaceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn machine_id_compares_with_str() {
        let id = MachineId::from("c0ffee");
        assert_eq!(id, "c0ffee");
        assert_eq!(id.into_inner(), "c0ffee");
    }

    #[test]
    fn image_ref_from_string() {
        let s = String::from("postgres:16");
        let image: ImageRef = s.into();
        assert_eq!(image.as_str(), "postgres:16");
    }
}
