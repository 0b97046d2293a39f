use std::{env, sync::Arc, time::Duration};

use reqwest::Client;
use serde_json::json;
use tracing::{Level, debug, error, info, trace, warn};

use crate::{
    config::RulesConfig,
    error::{Result, StoreError},
};

use super::{Alert, Channel, Rule, Severity, secrets::SecretResolver};

/// Delivers alerts to the channel named by a rule's action.
#[derive(Clone)]
pub struct Dispatcher {
    client: Client,
    secrets: Arc<dyn SecretResolver>,
}

impl Dispatcher {
    pub fn new(config: &RulesConfig, secrets: Arc<dyn SecretResolver>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.webhook_timeout_secs.max(1)))
            .build()
            .map_err(|err| StoreError::Config(format!("failed to build webhook client: {err}")))?;
        Ok(Self { client, secrets })
    }

    /// Turns an action target into its concrete value: `env:NAME` and
    /// `${NAME}` read the environment, `secret:<ref>` goes through the secret
    /// resolver, anything else is used verbatim.
    pub async fn resolve_target(&self, target: &str) -> Result<String> {
        let target = target.trim();
        if let Some(name) = target.strip_prefix("env:") {
            return read_env(name);
        }
        if let Some(name) = target
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        {
            return read_env(name);
        }
        if let Some(reference) = target.strip_prefix("secret:") {
            return self.secrets.resolve(reference.trim()).await;
        }
        Ok(target.to_string())
    }

    pub async fn dispatch(&self, rule: &Rule, alert: &Alert) -> Result<()> {
        match rule.action.channel {
            Channel::Webhook => {
                let target = rule.action.target.as_deref().ok_or_else(|| {
                    StoreError::Dispatch(format!("rule {} has a webhook without a target", rule.id))
                })?;
                let url = self.resolve_target(target).await?;
                self.post(&url, rule, alert).await
            }
            Channel::Log => {
                let level = match rule.action.target.as_deref() {
                    Some(target) => log_level(&self.resolve_target(target).await?)?,
                    None => default_level(alert.severity),
                };
                emit(level, rule, alert);
                Ok(())
            }
        }
    }

    async fn post(&self, url: &str, rule: &Rule, alert: &Alert) -> Result<()> {
        let body = json!({ "alert": alert, "ruleId": rule.id });
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| StoreError::Dispatch(format!("webhook for rule {} failed: {err}", rule.id)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Dispatch(format!(
                "webhook for rule {} answered {status}",
                rule.id
            )));
        }
        debug!(rule = %rule.id, alert = %alert.id, %status, "webhook delivered");
        Ok(())
    }
}

fn read_env(name: &str) -> Result<String> {
    let name = name.trim();
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(StoreError::Secret(format!(
            "environment variable {name} is not set"
        ))),
    }
}

fn log_level(value: &str) -> Result<Level> {
    match value.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(StoreError::Dispatch(format!(
            "unsupported log level '{other}'"
        ))),
    }
}

fn default_level(severity: Severity) -> Level {
    match severity {
        Severity::Info => Level::INFO,
        Severity::Warning => Level::WARN,
        Severity::Critical => Level::ERROR,
    }
}

fn emit(level: Level, rule: &Rule, alert: &Alert) {
    let entity = format!("{}/{}/{}", alert.env, alert.entity_type, alert.entity_id);
    match level {
        Level::TRACE => trace!(target: "bucketdb.alerts", rule = %rule.id, %entity, "{}", alert.message),
        Level::DEBUG => debug!(target: "bucketdb.alerts", rule = %rule.id, %entity, "{}", alert.message),
        Level::INFO => info!(target: "bucketdb.alerts", rule = %rule.id, %entity, "{}", alert.message),
        Level::WARN => warn!(target: "bucketdb.alerts", rule = %rule.id, %entity, "{}", alert.message),
        Level::ERROR => error!(target: "bucketdb.alerts", rule = %rule.id, %entity, "{}", alert.message),
    }
}
