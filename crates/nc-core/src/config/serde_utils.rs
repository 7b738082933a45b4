//! Shared serialization/deserialization utilities for configuration

/// Serialize `std::time::Duration` as whole seconds.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "nc_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a Duration as seconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize a Duration from seconds (u64)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_secs")]
        handshake: Duration,
    }

    #[test]
    fn test_duration_secs_serialize() {
        let t = Timeouts {
            handshake: Duration::from_secs(30),
        };
        assert_eq!(serde_json::to_string(&t).unwrap(), r#"{"handshake":30}"#);
    }

    #[test]
    fn test_duration_secs_deserialize() {
        let t: Timeouts = serde_json::from_str(r#"{"handshake":60}"#).unwrap();
        assert_eq!(t.handshake, Duration::from_secs(60));
    }
}
