//! Gateway configuration (C10, ambient): a YAML file naming the tool set,
//! policy rules, backend services, and guardian channel, with `${VAR}`
//! substitution against the process environment so secrets never sit in
//! the file itself — the same substitution shape
//! `original_source/src/agent_gate/config.py` applies before parsing.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::domain::policy::PolicyRule;
use crate::domain::tool::ToolDefinition;
use crate::error::WardenError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessengerKind {
    Logging,
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessengerConfig {
    pub kind: MessengerKind,
    pub webhook_url: Option<String>,
}

/// `gateway.tls` (spec.md §6): optional transport security cert/key pair.
/// Parsed so the config surface is complete; wiring an actual TLS listener
/// is left to a deployment-specific `axum-server`-style binary per
/// `DESIGN.md`, since the teacher's own stack has no TLS-terminating crate.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub agent_token: String,
    pub database_path: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(with = "humantime_serde", default = "default_approval_ttl")]
    pub approval_ttl: Duration,
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: usize,
    #[serde(with = "humantime_serde", default = "default_rate_limit_window")]
    pub rate_limit_window: Duration,
    /// `rate_limit.max_pending_approvals` (spec.md §6): concurrent ASK cap
    /// enforced by the session before it ever calls `ApprovalCoordinator::request`.
    #[serde(default = "default_max_pending_approvals")]
    pub max_pending_approvals: usize,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub policy_rules: Vec<PolicyRule>,
    #[serde(default)]
    pub policy_defaults: Vec<PolicyRule>,
    #[serde(default)]
    pub services: HashMap<String, String>,
    pub messenger: MessengerConfig,
}

fn default_approval_ttl() -> Duration {
    Duration::from_secs(900)
}

fn default_rate_limit_capacity() -> usize {
    60
}

fn default_rate_limit_window() -> Duration {
    Duration::from_secs(60)
}

fn default_max_pending_approvals() -> usize {
    10
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, WardenError> {
        let raw = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&raw)?;
        serde_yaml::from_str(&expanded).map_err(|e| WardenError::Config(e.to_string()))
    }
}

/// Substitute every `${VAR}` with the process environment's value, failing
/// the whole load if `VAR` is unset — matching
/// `original_source/src/agent_gate/config.py`'s `substitute_env_vars`,
/// which raises rather than silently interpolating an empty string (a
/// blanked agent token or webhook URL would otherwise fail much later and
/// far more confusingly than a config-load error).
fn expand_env_vars(input: &str) -> Result<String, WardenError> {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern is valid");
    let mut missing = None;
    let expanded = pattern.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match std::env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(var_name) => Err(WardenError::Config(format!(
            "environment variable {var_name} is not set"
        ))),
        None => Ok(expanded.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_vars_substitutes_known_variable() {
        std::env::set_var("WARDENGATE_TEST_TOKEN", "secret123");
        let out = expand_env_vars("token: ${WARDENGATE_TEST_TOKEN}").unwrap();
        assert_eq!(out, "token: secret123");
    }

    #[test]
    fn expand_env_vars_leaves_unmatched_text_alone() {
        let out = expand_env_vars("plain: value").unwrap();
        assert_eq!(out, "plain: value");
    }

    #[test]
    fn expand_env_vars_fails_on_unset_variable() {
        std::env::remove_var("WARDENGATE_DEFINITELY_UNSET");
        assert!(expand_env_vars("token: ${WARDENGATE_DEFINITELY_UNSET}").is_err());
    }
}
