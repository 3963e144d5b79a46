//! Secret types for values that must never reach a log line.
//!
//! Re-exports [`secrecy`]. A document-store URL such as
//! `redis://:password@host:6379` carries credentials, so configuration keeps
//! it as a [`SecretString`] and only calls `expose_secret()` at the point the
//! connection is opened.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct StoreSettings {
//!     url: SecretString,
//!     doc_id: String,
//! }
//!
//! let settings = StoreSettings {
//!     url: SecretString::from("redis://:hunter2@cache:6379"),
//!     doc_id: "active".to_string(),
//! };
//!
//! assert!(!format!("{settings:?}").contains("hunter2"));
//! assert!(settings.url.expose_secret().starts_with("redis://"));
//! ```

pub use secrecy::{ExposeSecret, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_store_url_debug_is_redacted() {
        let url = SecretString::from("redis://:pa55word@10.0.0.4:6379");
        let debug_str = format!("{url:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("pa55word"));
        assert!(!debug_str.contains("10.0.0.4"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let url = SecretString::from("redis://localhost:6379");
        assert_eq!(url.expose_secret(), "redis://localhost:6379");
    }

    #[test]
    fn test_deserialized_settings_stay_redacted() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct Settings {
            doc_id: String,
            url: SecretString,
        }

        let json = r#"{"doc_id": "active", "url": "redis://:s3cret@host:6379"}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        let debug_str = format!("{settings:?}");
        assert!(debug_str.contains("active"));
        assert!(!debug_str.contains("s3cret"));
        assert_eq!(settings.url.expose_secret(), "redis://:s3cret@host:6379");
    }
}
