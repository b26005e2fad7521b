//! Policy evaluation.
//!
//! A policy is an ordered list of rule IDs. Rules are registered separately and may be
//! created after the policy that names them; references are resolved at evaluation time.
//! The first rule in policy order whose condition matches the context decides. When no
//! rule matches, access is denied with the reason `"No matching rule"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use starport_core::environment::Environment;
use starport_core::error::LifecycleError;
use starport_core::history::BoundedLog;
use starport_core::lifecycle::{Applied, Feature, Operation};
use starport_core::registry::{Entity, Registry};
use starport_core::status::{transition, GateStatus};
use starport_core::telemetry::TelemetryEvent;
use starport_runtime::Dispatcher;
use std::collections::BTreeMap;

/// Reason recorded when no rule matched
pub const NO_MATCHING_RULE: &str = "No matching rule";

/// Evaluation input: attribute name to value
pub type Context = BTreeMap<String, Value>;

/// Rule outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Grant access
    #[default]
    Allow,
    /// Refuse access
    Deny,
}

/// Predicate over a [`Context`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Matches every context
    #[default]
    Always,
    /// `context[field] == value`
    Equals {
        /// Attribute name
        field: String,
        /// Expected value
        value: Value,
    },
    /// `context[field]` is one of `values`
    OneOf {
        /// Attribute name
        field: String,
        /// Accepted values
        values: Vec<Value>,
    },
    /// `field` is present and not null
    Exists {
        /// Attribute name
        field: String,
    },
    /// Every nested condition matches
    All {
        /// Nested conditions
        conditions: Vec<Condition>,
    },
    /// At least one nested condition matches
    Any {
        /// Nested conditions
        conditions: Vec<Condition>,
    },
    /// The nested condition does not match
    Not {
        /// Negated condition
        condition: Box<Condition>,
    },
}

impl Condition {
    /// `context[field] == value`
    #[must_use]
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Whether the condition holds for `context`
    #[must_use]
    pub fn matches(&self, context: &Context) -> bool {
        match self {
            Self::Always => true,
            Self::Equals { field, value } => context.get(field) == Some(value),
            Self::OneOf { field, values } => context.get(field).is_some_and(|v| values.contains(v)),
            Self::Exists { field } => context.get(field).is_some_and(|v| !v.is_null()),
            Self::All { conditions } => conditions.iter().all(|c| c.matches(context)),
            Self::Any { conditions } => conditions.iter().any(|c| c.matches(context)),
            Self::Not { condition } => !condition.matches(context),
        }
    }
}

/// Input for [`PolicyService::create_rule`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSpec {
    /// Outcome when the condition matches (defaults to allow)
    pub effect: Effect,
    /// Condition (defaults to always)
    pub condition: Condition,
    /// Free-form description
    pub description: Option<String>,
}

impl RuleSpec {
    /// Rule with the given effect that matches every context
    #[must_use]
    pub fn with_effect(effect: Effect) -> Self {
        Self {
            effect,
            ..Self::default()
        }
    }

    /// Replace the condition
    #[must_use]
    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }
}

/// A registered rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule ID
    pub id: String,
    /// Outcome on match
    pub effect: Effect,
    /// Condition
    pub condition: Condition,
    /// Description
    pub description: String,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl Entity for Rule {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Input for [`PolicyService::create_policy`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySpec {
    /// Display name (defaults to the policy ID)
    pub name: Option<String>,
    /// Rule IDs in evaluation order
    pub rules: Vec<String>,
}

impl PolicySpec {
    /// Spec naming `rules` in order
    #[must_use]
    pub fn with_rules<I, R>(rules: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self {
            name: None,
            rules: rules.into_iter().map(Into::into).collect(),
        }
    }
}

/// A registered policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy ID
    pub id: String,
    /// Display name
    pub name: String,
    /// Rule IDs in evaluation order
    pub rules: Vec<String>,
    /// `open` while enabled, `closed` once disabled
    pub status: GateStatus,
    /// Evaluations performed
    pub evaluations: u64,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// When the policy was disabled
    pub disabled_at: Option<DateTime<Utc>>,
}

impl Entity for Policy {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Evaluated policy
    pub policy_id: String,
    /// Whether access is granted
    pub allowed: bool,
    /// Deciding rule, if any
    pub rule_id: Option<String>,
    /// Human-readable reason
    pub reason: String,
    /// Evaluation time
    pub evaluated_at: DateTime<Utc>,
}

/// Policy feature state
#[derive(Debug, Clone)]
pub struct PolicyState {
    policies: Registry<Policy>,
    rules: Registry<Rule>,
    decisions: BoundedLog<Decision>,
}

impl PolicyState {
    /// Empty state keeping the last `decision_limit` decisions
    #[must_use]
    pub fn new(decision_limit: usize) -> Self {
        Self {
            policies: Registry::new("Policy"),
            rules: Registry::new("Rule"),
            decisions: BoundedLog::new(decision_limit),
        }
    }
}

impl Feature for PolicyState {
    const NAME: &'static str = "policy";
}

/// Register or overwrite a policy
#[derive(Debug, Clone)]
pub struct CreatePolicy {
    /// Policy ID
    pub id: String,
    /// Policy details
    pub spec: PolicySpec,
}

impl Operation<PolicyState> for CreatePolicy {
    type Output = Policy;
    const NAME: &'static str = "create_policy";

    fn apply(self, state: &mut PolicyState, env: &Environment) -> Result<Applied<Policy>, LifecycleError> {
        let policy = Policy {
            name: self.spec.name.unwrap_or_else(|| self.id.clone()),
            rules: self.spec.rules,
            status: GateStatus::Open,
            evaluations: 0,
            created_at: env.now(),
            disabled_at: None,
            id: self.id,
        };
        let policy = state.policies.insert(policy).clone();
        let event = TelemetryEvent::new("created")
            .with("policy_id", policy.id.as_str())
            .with("rules", policy.rules.len());
        Ok(Applied::new(policy).with_event(event))
    }
}

/// Register or overwrite a rule
#[derive(Debug, Clone)]
pub struct CreateRule {
    /// Rule ID
    pub id: String,
    /// Rule details
    pub spec: RuleSpec,
}

impl Operation<PolicyState> for CreateRule {
    type Output = Rule;
    const NAME: &'static str = "create_rule";

    fn apply(self, state: &mut PolicyState, env: &Environment) -> Result<Applied<Rule>, LifecycleError> {
        let rule = Rule {
            id: self.id,
            effect: self.spec.effect,
            condition: self.spec.condition,
            description: self.spec.description.unwrap_or_default(),
            created_at: env.now(),
        };
        let rule = state.rules.insert(rule).clone();
        let event = TelemetryEvent::new("rule_created").with("rule_id", rule.id.as_str());
        Ok(Applied::new(rule).with_event(event))
    }
}

/// Append a rule to a policy's evaluation order
#[derive(Debug, Clone)]
pub struct AttachRule {
    /// Policy ID
    pub policy_id: String,
    /// Rule ID
    pub rule_id: String,
}

impl Operation<PolicyState> for AttachRule {
    type Output = Policy;
    const NAME: &'static str = "attach_rule";

    fn apply(self, state: &mut PolicyState, _env: &Environment) -> Result<Applied<Policy>, LifecycleError> {
        state.rules.require(&self.rule_id)?;
        let policy = state.policies.require_mut(&self.policy_id)?;
        if policy.status == GateStatus::Closed {
            return Err(LifecycleError::validation(format!("policy {} is disabled", policy.id)));
        }
        let attached = !policy.rules.contains(&self.rule_id);
        if attached {
            policy.rules.push(self.rule_id.clone());
        }
        let policy = policy.clone();
        Ok(Applied::new(policy).with_event_if(attached, || {
            TelemetryEvent::new("rule_attached")
                .with("policy_id", self.policy_id.as_str())
                .with("rule_id", self.rule_id.as_str())
        }))
    }
}

/// Disable a policy for good
#[derive(Debug, Clone)]
pub struct DisablePolicy {
    /// Policy ID
    pub policy_id: String,
}

impl Operation<PolicyState> for DisablePolicy {
    type Output = Policy;
    const NAME: &'static str = "disable_policy";

    fn apply(self, state: &mut PolicyState, env: &Environment) -> Result<Applied<Policy>, LifecycleError> {
        let policy = state.policies.require_mut(&self.policy_id)?;
        policy.status = transition("Policy", &policy.id, policy.status, GateStatus::Closed)?;
        policy.disabled_at = Some(env.now());
        let policy = policy.clone();
        let event = TelemetryEvent::new("disabled").with("policy_id", policy.id.as_str());
        Ok(Applied::new(policy).with_event(event))
    }
}

/// Evaluate a policy against a context
#[derive(Debug, Clone)]
pub struct Evaluate {
    /// Policy ID
    pub policy_id: String,
    /// Attributes of the request
    pub context: Context,
}

impl Operation<PolicyState> for Evaluate {
    type Output = Decision;
    const NAME: &'static str = "evaluate";

    fn apply(self, state: &mut PolicyState, env: &Environment) -> Result<Applied<Decision>, LifecycleError> {
        let policy = state.policies.require(&self.policy_id)?;

        let (allowed, rule_id, reason) = if policy.status == GateStatus::Closed {
            (false, None, "Policy disabled".to_string())
        } else {
            let mut matched = None;
            for rule_id in &policy.rules {
                let Some(rule) = state.rules.get(rule_id) else {
                    tracing::warn!(policy_id = %policy.id, rule_id = %rule_id, "Policy names an unknown rule, skipping");
                    continue;
                };
                if rule.condition.matches(&self.context) {
                    matched = Some(rule);
                    break;
                }
            }
            match matched {
                Some(rule) => (
                    rule.effect == Effect::Allow,
                    Some(rule.id.clone()),
                    format!("Matched rule {}", rule.id),
                ),
                None => (false, None, NO_MATCHING_RULE.to_string()),
            }
        };

        let decision = Decision {
            policy_id: self.policy_id.clone(),
            allowed,
            rule_id,
            reason,
            evaluated_at: env.now(),
        };
        state.policies.update(&self.policy_id, |p| p.evaluations += 1)?;
        state.decisions.push(decision.clone());

        let mut event = TelemetryEvent::new("evaluated")
            .with("policy_id", self.policy_id.as_str())
            .with("allowed", allowed);
        if let Some(rule_id) = &decision.rule_id {
            event = event.with("rule_id", rule_id.as_str());
        }
        Ok(Applied::new(decision).with_event(event))
    }
}

/// Policy service
#[derive(Debug, Clone)]
pub struct PolicyService {
    dispatcher: Dispatcher<PolicyState>,
}

impl PolicyService {
    /// Empty service keeping the last `decision_limit` decisions
    #[must_use]
    pub fn new(env: Environment, decision_limit: usize) -> Self {
        Self {
            dispatcher: Dispatcher::new(PolicyState::new(decision_limit), env),
        }
    }

    /// Register or overwrite a policy. Rule IDs are not checked here.
    ///
    /// # Errors
    ///
    /// Does not fail today; the signature matches the other lifecycle operations.
    pub async fn create_policy(&self, id: impl Into<String>, spec: PolicySpec) -> Result<Policy, LifecycleError> {
        self.dispatcher.send(CreatePolicy { id: id.into(), spec }).await
    }

    /// Register or overwrite a rule.
    ///
    /// # Errors
    ///
    /// Does not fail today; the signature matches the other lifecycle operations.
    pub async fn create_rule(&self, id: impl Into<String>, spec: RuleSpec) -> Result<Rule, LifecycleError> {
        self.dispatcher.send(CreateRule { id: id.into(), spec }).await
    }

    /// Append a rule to a policy; attaching twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown policy or rule, and a validation error for a
    /// disabled policy.
    pub async fn attach_rule(
        &self,
        policy_id: impl Into<String>,
        rule_id: impl Into<String>,
    ) -> Result<Policy, LifecycleError> {
        self.dispatcher
            .send(AttachRule {
                policy_id: policy_id.into(),
                rule_id: rule_id.into(),
            })
            .await
    }

    /// Disable a policy.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown policy and `InvalidTransition` when it is
    /// already disabled.
    pub async fn disable_policy(&self, policy_id: impl Into<String>) -> Result<Policy, LifecycleError> {
        self.dispatcher
            .send(DisablePolicy {
                policy_id: policy_id.into(),
            })
            .await
    }

    /// Evaluate a policy.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown policy. Unknown rule IDs are skipped.
    pub async fn evaluate(&self, policy_id: impl Into<String>, context: Context) -> Result<Decision, LifecycleError> {
        self.dispatcher
            .send(Evaluate {
                policy_id: policy_id.into(),
                context,
            })
            .await
    }

    /// Look up a policy
    pub async fn get_policy(&self, id: &str) -> Option<Policy> {
        self.dispatcher.state(|s| s.policies.get_cloned(id)).await
    }

    /// Look up a rule
    pub async fn get_rule(&self, id: &str) -> Option<Rule> {
        self.dispatcher.state(|s| s.rules.get_cloned(id)).await
    }

    /// Up to `n` decisions, newest first
    pub async fn recent_decisions(&self, n: usize) -> Vec<Decision> {
        self.dispatcher.state(|s| s.decisions.recent(n)).await
    }
}
