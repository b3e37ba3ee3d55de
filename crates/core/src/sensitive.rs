//! Wrapper for secret material.
//!
//! `Sensitive<T>` keeps credential values out of logs and event payloads:
//! `Debug`, `Display` and `Serialize` all produce the redaction placeholder.
//! Code that genuinely needs the value calls `reveal()` at the use site.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Placeholder written wherever a sensitive value would otherwise appear.
pub const REDACTED: &str = "[REDACTED]";

/// A value that must not leak into serialized output.
#[derive(Clone, PartialEq, Eq)]
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    /// Wrap a secret value.
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Access the secret value. Call sites are the audit surface.
    pub fn reveal(&self) -> &T {
        &self.0
    }

    /// Consume the wrapper and return the secret value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Sensitive<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T> std::fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> std::fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> Serialize for Sensitive<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Sensitive<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Sensitive::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts() {
        let secret = Sensitive::new("hunter2".to_string());
        assert_eq!(format!("{:?}", secret), REDACTED);
        assert_eq!(format!("{}", secret), REDACTED);
    }

    #[test]
    fn test_serialize_redacts() {
        let secret = Sensitive::new("hunter2".to_string());
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, format!("\"{}\"", REDACTED));
    }

    #[test]
    fn test_reveal() {
        let secret = Sensitive::new("hunter2".to_string());
        assert_eq!(secret.reveal(), "hunter2");
        assert_eq!(secret.into_inner(), "hunter2");
    }

    #[test]
    fn test_deserialize_keeps_value() {
        let secret: Sensitive<String> = serde_json::from_str("\"tok\"").unwrap();
        assert_eq!(secret.reveal(), "tok");
    }
}
