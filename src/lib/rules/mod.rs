pub mod condition;
pub mod dispatch;
pub mod secrets;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use condition::{Condition, MetricThreshold, parse_condition};
pub use dispatch::Dispatcher;
pub use secrets::SecretResolver;

use crate::{
    config::RulesConfig,
    entity::{EntityType, Env, validate_id},
    error::{Result, StoreError},
    events::ChangeNotification,
    object_store::{Precondition, SharedStore, read_json, write_json},
    observability, paths,
    retry::RetryPolicy,
    snapshot::{Snapshot, SnapshotMaterializer},
};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([A-Za-z_$][A-Za-z0-9_.$]*)\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    #[serde(alias = "warn")]
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Webhook,
    Log,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Webhook => "webhook",
            Channel::Log => "log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A rule as stored under `env/{env}/rules/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Env>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<MetricThreshold>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub action: RuleAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A parsed, ready-to-evaluate rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub env: Option<Env>,
    pub entity: Option<EntityType>,
    pub condition: Condition,
    pub severity: Severity,
    pub message: Option<String>,
    pub action: RuleAction,
    pub enabled: bool,
}

impl RuleDefinition {
    pub fn compile(self) -> Result<Rule> {
        validate_id(&self.id).map_err(|err| StoreError::InvalidRule(err.to_string()))?;
        let condition = match (&self.condition, &self.metric) {
            (Some(source), None) => parse_condition(source)?,
            (None, Some(metric)) => metric.to_condition()?,
            (Some(_), Some(_)) => {
                return Err(StoreError::InvalidRule(format!(
                    "rule {} sets both condition and metric",
                    self.id
                )));
            }
            (None, None) => {
                return Err(StoreError::InvalidRule(format!(
                    "rule {} has neither condition nor metric",
                    self.id
                )));
            }
        };
        if self.action.channel == Channel::Webhook && self.action.target.is_none() {
            return Err(StoreError::InvalidRule(format!(
                "rule {} has a webhook action without a target",
                self.id
            )));
        }
        Ok(Rule {
            id: self.id,
            env: self.env,
            entity: self.entity,
            condition,
            severity: self.severity,
            message: self.message,
            action: self.action,
            enabled: self.enabled,
        })
    }
}

impl Rule {
    pub fn applies_to(&self, snapshot: &Snapshot) -> bool {
        self.enabled
            && self.env.is_none_or(|env| env == snapshot.key.env)
            && self
                .entity
                .is_none_or(|entity| entity == snapshot.key.entity_type)
    }

    /// Fills `{id}`, `{entity}`, `{env}`, `{rule}` and `{<field>}`
    /// placeholders; unknown fields are left as written.
    pub fn render_message(&self, snapshot: &Snapshot) -> String {
        let template = self
            .message
            .as_deref()
            .unwrap_or("rule {rule} matched {entity} {id}");
        PLACEHOLDER
            .replace_all(template, |caps: &Captures<'_>| {
                let name = &caps[1];
                match name {
                    "id" => snapshot.key.id.clone(),
                    "entity" => snapshot.key.entity_type.as_str().to_string(),
                    "env" => snapshot.key.env.as_str().to_string(),
                    "rule" => self.id.clone(),
                    field => match snapshot.field(field) {
                        Some(Value::String(text)) => text.clone(),
                        Some(value) => value.to_string(),
                        None => caps[0].to_string(),
                    },
                }
            })
            .into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub env: Env,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub snapshot_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RulesOutcome {
    Evaluated,
    Ignored,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertOutcome {
    pub rule_id: String,
    pub alert_id: String,
    pub path: String,
    pub persisted: bool,
    /// The alert already existed, so it was not dispatched again.
    pub duplicate: bool,
    pub dispatched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RulesReport {
    pub outcome: RulesOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub evaluated: usize,
    pub matched: usize,
    pub alerts: Vec<AlertOutcome>,
}

impl RulesReport {
    fn empty(outcome: RulesOutcome, reason: &str) -> Self {
        Self {
            outcome,
            reason: Some(reason.to_string()),
            evaluated: 0,
            matched: 0,
            alerts: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct RulesEngine {
    store: SharedStore,
    snapshots: SnapshotMaterializer,
    config: RulesConfig,
    dispatcher: Dispatcher,
}

impl RulesEngine {
    pub fn new(
        store: SharedStore,
        retry: RetryPolicy,
        config: RulesConfig,
        dispatcher: Dispatcher,
    ) -> Self {
        let snapshots = SnapshotMaterializer::new(store.clone(), retry);
        Self {
            store,
            snapshots,
            config,
            dispatcher,
        }
    }

    /// Loads every rule stored for `env`. Files that fail to decode or
    /// compile are logged and left out.
    pub async fn load_rules(&self, env: Env) -> Result<Vec<Rule>> {
        let prefix = paths::rules_prefix(env);
        let mut rules = Vec::new();
        for object in self.store.list(&prefix).await? {
            if !object.name.ends_with(".json") {
                continue;
            }
            let definition = match read_json::<RuleDefinition>(self.store.as_ref(), &object.name).await {
                Ok(Some((definition, _))) => definition,
                Ok(None) => continue,
                Err(err) => {
                    warn!(path = %object.name, error = %err, "skipping unreadable rule");
                    continue;
                }
            };
            match definition.compile() {
                Ok(rule) => rules.push(rule),
                Err(err) => warn!(path = %object.name, error = %err, "skipping invalid rule"),
            }
        }
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    pub async fn handle(&self, notification: &ChangeNotification) -> Result<RulesReport> {
        if let Some(expected) = self.store.bucket() {
            if !notification.bucket.is_empty() && notification.bucket != expected {
                return Ok(RulesReport::empty(RulesOutcome::Ignored, "foreign_bucket"));
            }
        }
        let Some(key) = paths::parse_snapshot_path(&notification.name) else {
            debug!(object = %notification.name, "ignoring non-snapshot object");
            return Ok(RulesReport::empty(RulesOutcome::Ignored, "not_a_snapshot"));
        };
        match self.snapshots.read(&key).await? {
            Some(snapshot) => self.evaluate(&snapshot).await,
            None => Ok(RulesReport::empty(RulesOutcome::Skipped, "snapshot_missing")),
        }
    }

    /// Evaluates every applicable rule; a failure on one rule never stops
    /// the others.
    pub async fn evaluate(&self, snapshot: &Snapshot) -> Result<RulesReport> {
        let rules = self.load_rules(snapshot.key.env).await?;
        let mut report = RulesReport {
            outcome: RulesOutcome::Evaluated,
            reason: None,
            evaluated: 0,
            matched: 0,
            alerts: Vec::new(),
        };

        for rule in rules.iter().filter(|rule| rule.applies_to(snapshot)) {
            report.evaluated += 1;
            if !rule.condition.matches(snapshot) {
                continue;
            }
            report.matched += 1;
            report.alerts.push(self.raise(rule, snapshot).await);
        }

        info!(
            entity = %snapshot.key,
            evaluated = report.evaluated,
            matched = report.matched,
            "rules evaluated"
        );
        Ok(report)
    }

    async fn raise(&self, rule: &Rule, snapshot: &Snapshot) -> AlertOutcome {
        let alert = Alert {
            id: self.alert_id(rule, snapshot),
            rule_id: rule.id.clone(),
            entity_id: snapshot.key.id.clone(),
            entity_type: snapshot.key.entity_type,
            env: snapshot.key.env,
            severity: rule.severity,
            message: rule.render_message(snapshot),
            timestamp: Utc::now(),
            snapshot_updated_at: snapshot.updated_at,
        };
        let path = paths::alert_path(alert.env, &rule.id, &alert.entity_id, &alert.id);
        let mut outcome = AlertOutcome {
            rule_id: rule.id.clone(),
            alert_id: alert.id.clone(),
            path: path.clone(),
            persisted: false,
            duplicate: false,
            dispatched: false,
            error: None,
        };

        match write_json(
            self.store.as_ref(),
            &path,
            &alert,
            Some(Precondition::DoesNotExist),
        )
        .await
        {
            Ok(_) => {
                outcome.persisted = true;
                observability::record_alert(&rule.id, rule.severity.as_str());
                info!(rule = %rule.id, entity = %snapshot.key, alert = %alert.id, "alert raised");
            }
            Err(err) if err.is_precondition_failed() => {
                debug!(rule = %rule.id, entity = %snapshot.key, alert = %alert.id, "alert already raised");
                outcome.duplicate = true;
                return outcome;
            }
            Err(err) => {
                warn!(rule = %rule.id, entity = %snapshot.key, error = %err, "failed to persist alert");
                outcome.error = Some(err.to_string());
                return outcome;
            }
        }

        match self.dispatcher.dispatch(rule, &alert).await {
            Ok(()) => outcome.dispatched = true,
            Err(err) => {
                observability::record_dispatch_failure(&rule.id, rule.action.channel.as_str());
                warn!(
                    rule = %rule.id,
                    channel = rule.action.channel.as_str(),
                    alert = %alert.id,
                    error = %err,
                    "alert dispatch failed"
                );
                outcome.error = Some(err.to_string());
            }
        }
        outcome
    }

    fn alert_id(&self, rule: &Rule, snapshot: &Snapshot) -> String {
        if !self.config.dedupe_alerts {
            return Uuid::new_v4().to_string();
        }
        let mut hasher = Sha256::new();
        hasher.update(rule.id.as_bytes());
        hasher.update([0]);
        hasher.update(snapshot.key.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(snapshot.updated_at.timestamp_micros().to_be_bytes());
        hasher
            .finalize()
            .iter()
            .take(16)
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}
