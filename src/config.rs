//! Configuration for one TextNow account

use crate::error::{Error, Result};
use crate::phone::format_phone;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Vendor web endpoint
pub const DEFAULT_BASE_URL: &str = "https://www.textnow.com";

/// Seconds between poll cycles
pub const DEFAULT_POLLING_INTERVAL: u64 = 30;

/// Seconds a menu waits for a reply
pub const DEFAULT_MENU_TIMEOUT: u64 = 300;

pub const DEFAULT_MENU_HEADER: &str = "Please choose an option:";
pub const DEFAULT_MENU_FOOTER: &str = "Reply with the number of your choice.";

/// Menu line template; `{n}` is the 1-based number, `{option}` the text
pub const DEFAULT_NUMBER_FORMAT: &str = "{n}. {option}";

/// Account credentials, polling and menu settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stable id for this integration instance (names the state file)
    pub instance_id: String,
    pub username: String,
    /// `connect.sid` session cookie
    pub connect_sid: String,
    /// `_csrf` cookie; may be URL-encoded
    pub csrf: String,
    /// Optional `XSRF-TOKEN` cookie
    pub xsrf_token: Option<String>,
    pub base_url: String,
    pub polling_interval_secs: u64,
    /// Only these senders produce events; empty means everyone
    pub allowed_phones: Vec<String>,
    pub state_dir: PathBuf,
    /// Root for `/local/...` attachment paths
    pub media_dir: PathBuf,
    pub default_ttl_secs: u64,
    pub menu_header: String,
    pub menu_footer: String,
    pub menu_timeout_secs: u64,
    pub number_format: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("textnow-bridge");

        Self {
            instance_id: "default".to_string(),
            username: String::new(),
            connect_sid: String::new(),
            csrf: String::new(),
            xsrf_token: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            polling_interval_secs: DEFAULT_POLLING_INTERVAL,
            allowed_phones: Vec::new(),
            state_dir: data_dir.join("state"),
            media_dir: data_dir.join("www"),
            default_ttl_secs: crate::store::DEFAULT_TTL_SECONDS,
            menu_header: DEFAULT_MENU_HEADER.to_string(),
            menu_footer: DEFAULT_MENU_FOOTER.to_string(),
            menu_timeout_secs: DEFAULT_MENU_TIMEOUT,
            number_format: DEFAULT_NUMBER_FORMAT.to_string(),
        }
    }
}

impl Config {
    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &Path) -> Self {
        Self {
            instance_id: "test".to_string(),
            username: "tester".to_string(),
            connect_sid: "sid".to_string(),
            csrf: "csrf".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            state_dir: temp_dir.join("state"),
            media_dir: temp_dir.join("www"),
            ..Self::default()
        }
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("textnow-bridge/config.json")
    }

    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check required credentials and canonicalize the allow-list in place
    pub fn validate(&mut self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(Error::Config("username is required".to_string()));
        }
        if self.connect_sid.trim().is_empty() {
            return Err(Error::Config("connect_sid is required".to_string()));
        }
        if self.csrf.trim().is_empty() {
            return Err(Error::Config("csrf is required".to_string()));
        }
        if self.polling_interval_secs == 0 {
            return Err(Error::Config(
                "polling_interval_secs must be at least 1".to_string(),
            ));
        }

        self.allowed_phones = self
            .allowed_phones
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(format_phone)
            .collect::<Result<_>>()?;

        Ok(())
    }

    /// Parse a comma-separated allow-list as typed into a setup form
    pub fn parse_allowed_phones(list: &str) -> Result<Vec<String>> {
        list.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(format_phone)
            .collect()
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    /// Is this sender permitted to trigger inbound processing?
    pub fn is_allowed(&self, phone: &str) -> bool {
        self.allowed_phones.is_empty() || self.allowed_phones.iter().any(|p| p == phone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.polling_interval(), Duration::from_secs(30));
        assert_eq!(config.menu_timeout_secs, 300);
        assert!(config.state_dir.to_string_lossy().contains("textnow-bridge"));
    }

    #[test]
    fn test_test_config() {
        let temp = std::env::temp_dir();
        let mut config = Config::for_test(&temp);
        assert_eq!(config.state_dir, temp.join("state"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_credentials() {
        let mut config = Config::for_test(Path::new("/tmp"));
        config.csrf = "  ".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_canonicalizes_allow_list() {
        let mut config = Config::for_test(Path::new("/tmp"));
        config.allowed_phones = vec!["(617) 555-1234".into(), "".into()];
        config.validate().unwrap();
        assert_eq!(config.allowed_phones, vec!["+16175551234"]);

        config.allowed_phones = vec!["12345".into()];
        assert!(matches!(config.validate(), Err(Error::InvalidPhone(_))));
    }

    #[test]
    fn test_parse_allowed_phones() {
        let phones = Config::parse_allowed_phones("617-555-1234, 1 (555) 123-4567,").unwrap();
        assert_eq!(phones, vec!["+16175551234", "+15551234567"]);
    }

    #[test]
    fn test_is_allowed() {
        let mut config = Config::for_test(Path::new("/tmp"));
        assert!(config.is_allowed("+19998887777"));
        config.allowed_phones = vec!["+16175551234".into()];
        assert!(config.is_allowed("+16175551234"));
        assert!(!config.is_allowed("+19998887777"));
    }

    #[test]
    fn test_load_from_file_with_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"username":"me","connect_sid":"s","csrf":"c","allowed_phones":["6175551234"]}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.username, "me");
        assert_eq!(config.polling_interval_secs, DEFAULT_POLLING_INTERVAL);
        assert_eq!(config.allowed_phones, vec!["+16175551234"]);
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let result = Config::load(&temp.path().join("nope.json"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
