//! UUID-backed identity values.
//!
//! Only the hyphenated `8-4-4-4-12` form is accepted, in either case. Parsing
//! is eager: an invalid string never becomes an id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdError;

/// Offsets of the four hyphens in a canonical UUID string.
const HYPHENS: [usize; 4] = [8, 13, 18, 23];

/// Canonical UUID string length.
const UUID_LEN: usize = 36;

fn parse_hyphenated(kind: &'static str, value: &str) -> Result<Uuid, IdError> {
    let invalid = || IdError::Invalid {
        kind,
        value: value.chars().take(UUID_LEN.saturating_add(4)).collect(),
    };

    if value.len() != UUID_LEN {
        return Err(invalid());
    }
    let well_formed = value.bytes().enumerate().all(|(i, b)| {
        if HYPHENS.contains(&i) {
            b == b'-'
        } else {
            b.is_ascii_hexdigit()
        }
    });
    if !well_formed {
        return Err(invalid());
    }

    Uuid::parse_str(value).map_err(|_| invalid())
}

macro_rules! define_id {
    ($name:ident, $kind:literal, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random (v4) id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parses a hyphenated UUID string, case-insensitively.
            ///
            /// # Errors
            ///
            /// Returns [`IdError::Invalid`] if `value` is not a hyphenated UUID.
            pub fn parse(value: &str) -> Result<Self, IdError> {
                parse_hyphenated($kind, value).map(Self)
            }

            /// Returns the inner UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

define_id!(VaultId, "vault id", "Identity of a [`Vault`](crate::vault::Vault).");
define_id!(
    AuditLogId,
    "audit log id",
    "Identity of an [`AuditLog`](crate::audit::AuditLog) entry."
);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const LOWER: &str = "3f2504e0-4f89-11d3-9a0c-0305e82c3301";
    const UPPER: &str = "3F2504E0-4F89-11D3-9A0C-0305E82C3301";

    #[test]
    fn rejects_garbage() {
        let err = VaultId::parse("not-a-uuid").unwrap_err();
        assert!(matches!(err, IdError::Invalid { kind: "vault id", .. }));
    }

    #[test]
    fn rejects_non_hyphenated_forms() {
        assert!(VaultId::parse("3f2504e04f8911d39a0c0305e82c3301").is_err());
        assert!(VaultId::parse("{3f2504e0-4f89-11d3-9a0c-0305e82c3301}").is_err());
        assert!(AuditLogId::parse("urn:uuid:3f2504e0-4f89-11d3-9a0c-0305e82c3301").is_err());
        assert!(AuditLogId::parse("3f2504e0-4f89-11d3-9a0c-0305e82c330g").is_err());
        assert!(AuditLogId::parse("").is_err());
    }

    #[test]
    fn accepts_lower_and_upper_case_and_compares_equal() {
        let a = VaultId::parse(LOWER).unwrap();
        let b = VaultId::parse(UPPER).unwrap();
        assert_eq!(a, b);
        assert_eq!(b.to_string(), LOWER);
    }

    #[test]
    fn from_str_matches_parse() {
        let id: AuditLogId = LOWER.parse().unwrap();
        assert_eq!(id, AuditLogId::parse(LOWER).unwrap());
    }

    #[test]
    fn serde_rejects_invalid_ids() {
        let ok: VaultId = serde_json::from_str(&format!("\"{UPPER}\"")).unwrap();
        assert_eq!(serde_json::to_string(&ok).unwrap(), format!("\"{LOWER}\""));
        assert!(serde_json::from_str::<VaultId>("\"not-a-uuid\"").is_err());
    }

    #[test]
    fn new_ids_are_distinct() {
        assert_ne!(VaultId::new(), VaultId::new());
    }
}
