//! Connection configuration

use crate::model::CharSet;
use serde::{Deserialize, Serialize};

/// Settings used to build a dialect's connection string
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub unix_socket: String,
    pub charset: Option<CharSet>,
}

impl Config {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Default::default()
        }
    }

    /// Trim whitespace, lowercase the host and fill in the default charset
    pub fn normalize(&mut self) {
        self.username = self.username.trim().to_string();
        self.host = self.host.trim().to_lowercase();
        self.database = self.database.trim().to_string();
        self.unix_socket = self.unix_socket.trim().to_string();
        self.charset = match self.charset.take() {
            Some(cs) if !cs.is_empty() => Some(CharSet::new(
                cs.encoding.trim(),
                cs.collation.trim(),
            )),
            _ => Some(CharSet::default()),
        };
    }

    /// Character set in effect, `utf8mb4` unless configured
    pub fn charset(&self) -> CharSet {
        self.charset
            .clone()
            .filter(|cs| !cs.is_empty())
            .unwrap_or_default()
    }

    pub fn host_or<'a>(&'a self, default: &'a str) -> &'a str {
        if self.host.is_empty() {
            default
        } else {
            &self.host
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        let mut config = Config {
            username: " root ".into(),
            host: " DB.Example.com ".into(),
            database: " app\n".into(),
            ..Default::default()
        };
        config.normalize();

        assert_eq!(config.username, "root");
        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.database, "app");
        assert_eq!(config.charset, Some(CharSet::default()));
    }

    #[test]
    fn test_normalize_keeps_explicit_charset() {
        let mut config = Config {
            charset: Some(CharSet::new(" latin1 ", "latin1_bin ")),
            ..Default::default()
        };
        config.normalize();
        assert_eq!(config.charset(), CharSet::latin1());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config =
            serde_json::from_str(r#"{"database":"app","port":3307}"#).unwrap();
        assert_eq!(config.port, Some(3307));
        assert!(config.username.is_empty());
        assert_eq!(config.charset().encoding, "utf8mb4");
    }
}
