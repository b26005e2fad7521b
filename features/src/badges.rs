//! Badge catalogue, per-user unlocks and milestone trackers.
//!
//! Badges are registered once under a caller-chosen ID and unlocked per user. Unlocking
//! is idempotent: a user holds a badge at most once and `unlocked_count` only moves on
//! the first unlock. Progress trackers map a metric (`planets_claimed`, `scans`, ...) to
//! ascending milestones, each of which unlocks a badge when the user's value reaches it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use starport_core::environment::Environment;
use starport_core::error::LifecycleError;
use starport_core::lifecycle::{Applied, Feature, Operation};
use starport_core::registry::{Entity, Registry};
use starport_core::telemetry::TelemetryEvent;
use starport_core::view::count_by;
use starport_runtime::Dispatcher;
use std::collections::BTreeMap;

/// Category assigned when a badge is registered without one
pub const DEFAULT_CATEGORY: &str = "general";

/// Input for [`BadgeService::register_badge`]; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BadgeSpec {
    /// Display name (defaults to the badge ID)
    pub name: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// Category (defaults to [`DEFAULT_CATEGORY`])
    pub category: Option<String>,
    /// Loyalty points granted on unlock
    pub points_reward: u64,
}

impl BadgeSpec {
    /// Spec with only a category set
    #[must_use]
    pub fn in_category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            ..Self::default()
        }
    }
}

/// A registered badge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    /// Badge ID
    pub id: String,
    /// Display name
    pub name: String,
    /// Description
    pub description: String,
    /// Category
    pub category: String,
    /// Points granted on unlock
    pub points_reward: u64,
    /// Distinct users holding the badge
    pub unlocked_count: u64,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl Entity for Badge {
    fn id(&self) -> &str {
        &self.id
    }
}

/// One badge held by one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unlock {
    /// Badge ID
    pub badge_id: String,
    /// When the user earned it
    pub unlocked_at: DateTime<Utc>,
}

/// Per-user badge and metric state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProgress {
    /// Unlocks in the order they happened
    pub unlocks: Vec<Unlock>,
    /// Latest reported value per tracked metric
    pub metrics: BTreeMap<String, u64>,
}

impl UserProgress {
    fn holds(&self, badge_id: &str) -> bool {
        self.unlocks.iter().any(|u| u.badge_id == badge_id)
    }
}

/// A milestone on a tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    /// Value at which the badge unlocks
    pub threshold: u64,
    /// Badge to unlock
    pub badge_id: String,
}

impl Milestone {
    /// Milestone unlocking `badge_id` at `threshold`
    #[must_use]
    pub fn new(threshold: u64, badge_id: impl Into<String>) -> Self {
        Self {
            threshold,
            badge_id: badge_id.into(),
        }
    }
}

/// Milestones for one metric, sorted by threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressTracker {
    /// Tracked metric
    pub metric: String,
    /// Ascending milestones
    pub milestones: Vec<Milestone>,
}

/// Result of [`BadgeService::unlock_badge`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockOutcome {
    /// The badge after the call
    pub badge: Badge,
    /// `false` when the user already held it
    pub newly_unlocked: bool,
}

/// Result of [`BadgeService::track_progress`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Tracked metric
    pub metric: String,
    /// Value just reported
    pub current: u64,
    /// Next milestone above `current`, if any
    pub next_milestone: Option<u64>,
    /// Percentage of the way to the next milestone (100 once all are reached)
    pub progress_pct: f64,
    /// Badges unlocked by this report
    pub newly_unlocked: Vec<String>,
}

/// Catalogue-wide counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeStats {
    /// Registered badges
    pub total_badges: usize,
    /// Unlocks across every user
    pub total_unlocks: u64,
    /// Users holding at least one badge
    pub users_with_badges: usize,
    /// Badges per category
    pub by_category: BTreeMap<String, usize>,
    /// Badge with the most holders
    pub most_unlocked: Option<String>,
}

/// Badge feature state
#[derive(Debug, Clone)]
pub struct BadgeState {
    badges: Registry<Badge>,
    users: Registry<UserProgress>,
    trackers: Registry<ProgressTracker>,
}

impl Default for BadgeState {
    fn default() -> Self {
        Self {
            badges: Registry::new("Badge"),
            users: Registry::new("User"),
            trackers: Registry::new("ProgressTracker"),
        }
    }
}

impl Feature for BadgeState {
    const NAME: &'static str = "badges";
}

impl BadgeState {
    /// Look up a badge
    #[must_use]
    pub fn badge(&self, id: &str) -> Option<Badge> {
        self.badges.get_cloned(id)
    }

    /// Badges held by `user_id`, in unlock order
    #[must_use]
    pub fn user_badges(&self, user_id: &str) -> Vec<Badge> {
        self.users
            .get(user_id)
            .map(|progress| {
                progress
                    .unlocks
                    .iter()
                    .filter_map(|u| self.badges.get_cloned(&u.badge_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Badges in `category`, in registration order
    #[must_use]
    pub fn by_category(&self, category: &str) -> Vec<Badge> {
        self.badges.list(|b| b.category == category)
    }

    /// Catalogue counters
    #[must_use]
    pub fn stats(&self) -> BadgeStats {
        let most_unlocked = self
            .badges
            .iter()
            .filter(|b| b.unlocked_count > 0)
            .max_by_key(|b| b.unlocked_count)
            .map(|b| b.id.clone());
        BadgeStats {
            total_badges: self.badges.len(),
            total_unlocks: self.badges.iter().map(|b| b.unlocked_count).sum(),
            users_with_badges: self.users.iter().filter(|u| !u.unlocks.is_empty()).count(),
            by_category: count_by(self.badges.iter(), |b| b.category.clone()),
            most_unlocked,
        }
    }

    /// Give `badge_id` to `user_id` unless they hold it already; returns whether it was new
    fn grant(&mut self, user_id: &str, badge_id: &str, now: DateTime<Utc>) -> Result<bool, LifecycleError> {
        self.badges.require(badge_id)?;
        if self.users.get(user_id).is_some_and(|p| p.holds(badge_id)) {
            return Ok(false);
        }
        if !self.users.contains(user_id) {
            self.users.put(user_id, UserProgress::default());
        }
        self.users.update(user_id, |progress| {
            progress.unlocks.push(Unlock {
                badge_id: badge_id.to_string(),
                unlocked_at: now,
            });
        })?;
        self.badges.update(badge_id, |badge| badge.unlocked_count += 1)?;
        Ok(true)
    }
}

fn unlocked_event(user_id: &str, badge: &Badge) -> TelemetryEvent {
    TelemetryEvent::new("unlocked")
        .with("user_id", user_id)
        .with("badge_id", badge.id.as_str())
        .with("category", badge.category.as_str())
        .with("points_reward", badge.points_reward)
}

/// Register (or overwrite) a badge
#[derive(Debug, Clone)]
pub struct RegisterBadge {
    /// Badge ID
    pub id: String,
    /// Badge details
    pub spec: BadgeSpec,
}

impl Operation<BadgeState> for RegisterBadge {
    type Output = Badge;
    const NAME: &'static str = "register_badge";

    fn apply(self, state: &mut BadgeState, env: &Environment) -> Result<Applied<Badge>, LifecycleError> {
        if self.id.trim().is_empty() {
            return Err(LifecycleError::validation("badge id must not be empty"));
        }
        let previous_count = state.badges.get(&self.id).map_or(0, |b| b.unlocked_count);
        let badge = Badge {
            name: self.spec.name.unwrap_or_else(|| self.id.clone()),
            description: self.spec.description.unwrap_or_default(),
            category: self.spec.category.unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            points_reward: self.spec.points_reward,
            unlocked_count: previous_count,
            created_at: env.now(),
            id: self.id,
        };
        let badge = state.badges.insert(badge).clone();
        let event = TelemetryEvent::new("registered")
            .with("badge_id", badge.id.as_str())
            .with("category", badge.category.as_str());
        Ok(Applied::new(badge).with_event(event))
    }
}

/// Unlock a badge for a user; a repeat unlock is a no-op
#[derive(Debug, Clone)]
pub struct UnlockBadge {
    /// User ID
    pub user_id: String,
    /// Badge ID
    pub badge_id: String,
}

impl Operation<BadgeState> for UnlockBadge {
    type Output = UnlockOutcome;
    const NAME: &'static str = "unlock_badge";

    fn apply(self, state: &mut BadgeState, env: &Environment) -> Result<Applied<UnlockOutcome>, LifecycleError> {
        let newly_unlocked = state.grant(&self.user_id, &self.badge_id, env.now())?;
        let badge = state.badges.require(&self.badge_id)?.clone();
        if !newly_unlocked {
            tracing::debug!(user_id = %self.user_id, badge_id = %self.badge_id, "Badge already unlocked");
        }
        let event = unlocked_event(&self.user_id, &badge);
        Ok(Applied::new(UnlockOutcome {
            badge,
            newly_unlocked,
        })
        .with_event_if(newly_unlocked, || event))
    }
}

/// Register milestones for a metric
#[derive(Debug, Clone)]
pub struct RegisterTracker {
    /// Metric name
    pub metric: String,
    /// Milestones, in any order
    pub milestones: Vec<Milestone>,
}

impl Operation<BadgeState> for RegisterTracker {
    type Output = ProgressTracker;
    const NAME: &'static str = "register_tracker";

    fn apply(self, state: &mut BadgeState, _env: &Environment) -> Result<Applied<ProgressTracker>, LifecycleError> {
        if self.milestones.is_empty() {
            return Err(LifecycleError::validation(format!(
                "tracker {} needs at least one milestone",
                self.metric
            )));
        }
        for milestone in &self.milestones {
            state.badges.require(&milestone.badge_id)?;
        }
        let mut milestones = self.milestones;
        milestones.sort_by_key(|m| m.threshold);

        let tracker = ProgressTracker {
            metric: self.metric.clone(),
            milestones,
        };
        let tracker = state.trackers.put(self.metric, tracker).clone();
        let event = TelemetryEvent::new("tracker_registered")
            .with("metric", tracker.metric.as_str())
            .with("milestones", tracker.milestones.len());
        Ok(Applied::new(tracker).with_event(event))
    }
}

/// Report a user's current value for a tracked metric
#[derive(Debug, Clone)]
pub struct TrackProgress {
    /// User ID
    pub user_id: String,
    /// Metric name
    pub metric: String,
    /// Current value (absolute, not a delta)
    pub value: u64,
}

impl Operation<BadgeState> for TrackProgress {
    type Output = ProgressReport;
    const NAME: &'static str = "track_progress";

    #[allow(clippy::cast_precision_loss)]
    fn apply(self, state: &mut BadgeState, env: &Environment) -> Result<Applied<ProgressReport>, LifecycleError> {
        let tracker = state.trackers.require(&self.metric)?.clone();
        let now = env.now();

        if !state.users.contains(&self.user_id) {
            state.users.put(self.user_id.clone(), UserProgress::default());
        }
        state.users.update(&self.user_id, |progress| {
            progress.metrics.insert(self.metric.clone(), self.value);
        })?;

        let mut newly_unlocked = Vec::new();
        let mut events = Vec::new();
        for milestone in tracker.milestones.iter().filter(|m| m.threshold <= self.value) {
            match state.grant(&self.user_id, &milestone.badge_id, now) {
                Ok(true) => {
                    if let Some(badge) = state.badges.get(&milestone.badge_id) {
                        events.push(unlocked_event(&self.user_id, badge).with("metric", self.metric.as_str()));
                    }
                    newly_unlocked.push(milestone.badge_id.clone());
                }
                Ok(false) => {}
                Err(error) => tracing::warn!(metric = %self.metric, %error, "Skipping milestone"),
            }
        }

        let next_milestone = tracker
            .milestones
            .iter()
            .map(|m| m.threshold)
            .find(|threshold| *threshold > self.value);
        let progress_pct = next_milestone.map_or(100.0, |next| self.value as f64 / next as f64 * 100.0);

        let report = ProgressReport {
            metric: self.metric.clone(),
            current: self.value,
            next_milestone,
            progress_pct,
            newly_unlocked,
        };
        let mut applied = Applied::new(report).with_event(
            TelemetryEvent::new("progress_tracked")
                .with_value(self.value as f64)
                .with("user_id", self.user_id.as_str())
                .with("metric", self.metric.as_str()),
        );
        applied.events.extend(events);
        Ok(applied)
    }
}

/// Badge service
#[derive(Debug, Clone)]
pub struct BadgeService {
    dispatcher: Dispatcher<BadgeState>,
}

impl BadgeService {
    /// Empty catalogue
    #[must_use]
    pub fn new(env: Environment) -> Self {
        Self {
            dispatcher: Dispatcher::new(BadgeState::default(), env),
        }
    }

    /// Register or overwrite a badge.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty ID.
    pub async fn register_badge(&self, id: impl Into<String>, spec: BadgeSpec) -> Result<Badge, LifecycleError> {
        self.dispatcher.send(RegisterBadge { id: id.into(), spec }).await
    }

    /// Unlock a badge for a user.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the badge is not registered.
    pub async fn unlock_badge(
        &self,
        user_id: impl Into<String>,
        badge_id: impl Into<String>,
    ) -> Result<UnlockOutcome, LifecycleError> {
        self.dispatcher
            .send(UnlockBadge {
                user_id: user_id.into(),
                badge_id: badge_id.into(),
            })
            .await
    }

    /// Register milestones for a metric.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown badge and a validation error for no milestones.
    pub async fn register_tracker(
        &self,
        metric: impl Into<String>,
        milestones: Vec<Milestone>,
    ) -> Result<ProgressTracker, LifecycleError> {
        self.dispatcher
            .send(RegisterTracker {
                metric: metric.into(),
                milestones,
            })
            .await
    }

    /// Report progress and unlock every milestone reached.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no tracker exists for `metric`.
    pub async fn track_progress(
        &self,
        user_id: impl Into<String>,
        metric: impl Into<String>,
        value: u64,
    ) -> Result<ProgressReport, LifecycleError> {
        self.dispatcher
            .send(TrackProgress {
                user_id: user_id.into(),
                metric: metric.into(),
                value,
            })
            .await
    }

    /// Look up a badge
    pub async fn get_badge(&self, id: &str) -> Option<Badge> {
        self.dispatcher.state(|s| s.badge(id)).await
    }

    /// Badges a user holds; empty for unknown users
    pub async fn get_user_badges(&self, user_id: &str) -> Vec<Badge> {
        self.dispatcher.state(|s| s.user_badges(user_id)).await
    }

    /// Badges in a category
    pub async fn badges_by_category(&self, category: &str) -> Vec<Badge> {
        self.dispatcher.state(|s| s.by_category(category)).await
    }

    /// Catalogue counters
    pub async fn stats(&self) -> BadgeStats {
        self.dispatcher.state(BadgeState::stats).await
    }
}
