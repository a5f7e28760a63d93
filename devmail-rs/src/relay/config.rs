use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Outgoing relay settings, replaceable at runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutgoingConfig {
    /// Relay is disabled while this is empty
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Implicit TLS instead of opportunistic STARTTLS
    pub secure: bool,
    pub auto_relay: bool,
    pub auto_relay_addr: String,
    pub allow_rules: Vec<String>,
    pub deny_rules: Vec<String>,
    /// JSON rules file merged into the allow/deny lists at startup
    pub rules_file: Option<PathBuf>,
}

impl Default for OutgoingConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 25,
            user: String::new(),
            password: String::new(),
            secure: false,
            auto_relay: false,
            auto_relay_addr: String::new(),
            allow_rules: Vec::new(),
            deny_rules: Vec::new(),
            rules_file: None,
        }
    }
}

impl OutgoingConfig {
    pub fn is_enabled(&self) -> bool {
        !self.host.is_empty()
    }

    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty()
    }

    /// Append the rules from `rules_file`, if one is configured
    pub fn load_rules_file(&mut self) -> Result<()> {
        if let Some(path) = self.rules_file.clone() {
            let (allow, deny) = load_auto_relay_rules(&path)?;
            self.allow_rules.extend(allow);
            self.deny_rules.extend(deny);
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AutoRelayRule {
    allow: Option<String>,
    deny: Option<String>,
}

/// Read `[{"allow": "..."}, {"deny": "..."}]` into ordered allow and deny lists
pub fn load_auto_relay_rules<P: AsRef<Path>>(path: P) -> Result<(Vec<String>, Vec<String>)> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        MailError::Config(format!(
            "failed to read rules file {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;

    let rules: Vec<AutoRelayRule> = serde_json::from_str(&content)
        .map_err(|e| MailError::Config(format!("failed to parse rules JSON: {}", e)))?;

    let mut allow_rules = Vec::new();
    let mut deny_rules = Vec::new();
    for rule in rules {
        if let Some(allow) = rule.allow.filter(|r| !r.is_empty()) {
            allow_rules.push(allow);
        }
        if let Some(deny) = rule.deny.filter(|r| !r.is_empty()) {
            deny_rules.push(deny);
        }
    }

    Ok((allow_rules, deny_rules))
}
