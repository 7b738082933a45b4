//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::InvalidOrganization;

/// Maximum organization name length
pub const MAX_ORGANIZATION_LEN: usize = 64;

/// Characters that may not appear in an organization name.
///
/// Names end up in file paths and URLs, so anything path- or URL-significant
/// is excluded.
const UNSAFE_CHARACTERS: &[char] = &[
    '?', '*', '/', '\\', '%', '!', '@', '#', '$', '^', '&', '|', '<', '>', '[', ']', ':', ';',
];

/// Unique name identifying one managed master.
///
/// Can only be constructed through [`Organization::parse`], so every value
/// in circulation satisfies the safe-name policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Organization(String);

impl Organization {
    /// Validate and normalise (trim) an organization name
    pub fn parse(name: &str) -> Result<Self, InvalidOrganization> {
        let name = name.trim();

        if name.is_empty() {
            return Err(InvalidOrganization::Empty);
        }
        if name.chars().count() > MAX_ORGANIZATION_LEN {
            return Err(InvalidOrganization::TooLong {
                max: MAX_ORGANIZATION_LEN,
            });
        }
        if name == "." || name == ".." {
            return Err(InvalidOrganization::Reserved(name.to_string()));
        }
        if let Some(ch) = name
            .chars()
            .find(|c| c.is_control() || UNSAFE_CHARACTERS.contains(c))
        {
            return Err(InvalidOrganization::UnsafeCharacter {
                name: name.to_string(),
                ch,
            });
        }

        Ok(Self(name.to_string()))
    }

    /// Get the raw name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Organization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Organization {
    type Err = InvalidOrganization;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Organization {
    type Error = InvalidOrganization;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Organization> for String {
    fn from(org: Organization) -> Self {
        org.0
    }
}

impl AsRef<str> for Organization {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims() {
        let org = Organization::parse("  acme ").unwrap();
        assert_eq!(org.as_str(), "acme");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert_eq!(Organization::parse("   "), Err(InvalidOrganization::Empty));
    }

    #[test]
    fn test_parse_rejects_traversal() {
        assert!(matches!(
            Organization::parse(".."),
            Err(InvalidOrganization::Reserved(_))
        ));
        assert!(matches!(
            Organization::parse("../etc"),
            Err(InvalidOrganization::UnsafeCharacter { ch: '/', .. })
        ));
        assert!(matches!(
            Organization::parse("a\\b"),
            Err(InvalidOrganization::UnsafeCharacter { ch: '\\', .. })
        ));
    }

    #[test]
    fn test_parse_rejects_control_characters() {
        assert!(Organization::parse("ac\nme").is_err());
    }

    #[test]
    fn test_parse_length_limit() {
        let long = "a".repeat(MAX_ORGANIZATION_LEN + 1);
        assert!(matches!(
            Organization::parse(&long),
            Err(InvalidOrganization::TooLong { .. })
        ));
        assert!(Organization::parse(&"a".repeat(MAX_ORGANIZATION_LEN)).is_ok());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Organization = serde_json::from_str("\"acme-corp.eu\"").unwrap();
        assert_eq!(ok.as_str(), "acme-corp.eu");
        assert!(serde_json::from_str::<Organization>("\"a/b\"").is_err());
    }
}
