//! Account configuration: TOML file, `${VAR}` env substitution, one file
//! may describe several Accounts (§2 ambient Configuration note).

use serde::Deserialize;

use crate::model::{Account, SecurityMode};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub account: Vec<AccountConfig>,
}

/// One configured identity plus the fields that never belong on
/// [`Account`] itself: the plaintext password (read once at startup,
/// handed to the Supervisor, then dropped) and the MUC room roster
/// supplied as a convenience list at config time.
#[derive(Debug, Deserialize, Clone)]
pub struct AccountConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub jid: String,
    /// Supports `${ENV_VAR}` substitution.
    pub password: String,
    #[serde(default = "default_resource")]
    pub resource: String,
    #[serde(default)]
    pub security: SecurityMode,
    #[serde(default = "default_nickname")]
    pub nickname: String,
    #[serde(default)]
    pub conference_domain: Option<String>,
    #[serde(default)]
    pub rooms: Vec<String>,
    #[serde(default)]
    pub dm_nicknames: Vec<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_hint: Option<String>,
}

fn default_port() -> u16 {
    5222
}

fn default_resource() -> String {
    "xmpbee".to_string()
}

fn default_nickname() -> String {
    "xmpbee".to_string()
}

impl AccountConfig {
    pub fn into_account(self) -> (Account, String) {
        let account = Account {
            host: self.host,
            port: self.port,
            jid: self.jid,
            resource: self.resource,
            security: self.security,
            nickname: self.nickname,
            conference_domain: self.conference_domain,
            rooms: self.rooms,
            dm_nicknames: self.dm_nicknames,
            display_name: self.display_name,
            avatar_hint: self.avatar_hint,
        };
        (account, self.password)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_single_account_with_defaults() {
        let toml = r#"
[[account]]
host = "example.org"
jid = "alice@example.org"
password = "hunter2"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.account.len(), 1);
        let acc = &config.account[0];
        assert_eq!(acc.port, 5222);
        assert_eq!(acc.resource, "xmpbee");
        assert_eq!(acc.security, SecurityMode::RequireTls);
    }

    #[test]
    fn loads_multiple_accounts_with_rooms() {
        let toml = r#"
[[account]]
host = "example.org"
jid = "alice@example.org"
password = "hunter2"
conference_domain = "conference.example.org"
rooms = ["lobby@conference.example.org"]

[[account]]
host = "other.org"
jid = "bob@other.org"
password = "swordfish"
security = "direct_tls"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.account.len(), 2);
        assert_eq!(config.account[0].rooms, vec!["lobby@conference.example.org"]);
        assert_eq!(config.account[1].security, SecurityMode::DirectTls);
    }

    #[test]
    fn into_account_splits_password_out() {
        let toml = r#"
[[account]]
host = "example.org"
jid = "alice@example.org"
password = "hunter2"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let (account, password) = config.account[0].clone().into_account();
        assert_eq!(account.jid, "alice@example.org");
        assert_eq!(password, "hunter2");
    }

    #[test]
    fn env_var_substitution_expands_password() {
        std::env::set_var("XMPBEE_TEST_PASSWORD", "secret-from-env");
        let raw = r#"
[[account]]
host = "example.org"
jid = "alice@example.org"
password = "${XMPBEE_TEST_PASSWORD}"
"#;
        let expanded = shellexpand::env(raw).unwrap();
        let config: Config = toml::from_str(&expanded).unwrap();
        assert_eq!(config.account[0].password, "secret-from-env");
        std::env::remove_var("XMPBEE_TEST_PASSWORD");
    }
}
