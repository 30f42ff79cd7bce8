use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// A wrapper around `String` that redacts its content in `Debug`/`Display`
/// output, so a registry credential can't leak into a log line or panic
/// message by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***REDACTED***")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***REDACTED***")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        SecretString(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let secret = SecretString::new("super_secret_password".to_string());
        let debug_output = format!("{:?}", secret);
        assert_eq!(debug_output, "***REDACTED***");
        assert!(!debug_output.contains("super_secret"));
    }

    #[test]
    fn display_is_redacted() {
        let secret = SecretString::new("super_secret_password".to_string());
        assert_eq!(format!("{}", secret), "***REDACTED***");
    }

    #[test]
    fn expose_secret_returns_inner_value() {
        let secret = SecretString::new("my_password".to_string());
        assert_eq!(secret.expose_secret(), "my_password");
    }

    #[test]
    fn deserializes_from_plain_string() {
        let secret: SecretString = serde_json::from_str(r#""my_secret""#).unwrap();
        assert_eq!(secret.expose_secret(), "my_secret");
    }
}
