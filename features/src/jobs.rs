//! "As-a-service" job simulator.
//!
//! Simulated services accept jobs and process them with a random latency, a random chance
//! of failure and a random quality score, all drawn from the injected
//! [`RandomSource`](starport_core::environment::RandomSource). Runs go through real
//! resilience machinery: every service has its own circuit breaker, attempts are retried
//! with backoff, and an optional per-attempt timeout cancels slow attempts.
//!
//! Job lifecycle: `pending → running → {completed | failed}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use starport_core::environment::{Environment, RandomSource};
use starport_core::error::LifecycleError;
use starport_core::lifecycle::{Applied, Feature, Operation};
use starport_core::registry::{Entity, Registry};
use starport_core::status::{transition, RunStatus};
use starport_core::telemetry::TelemetryEvent;
use starport_core::view::{average_by, ratio};
use starport_runtime::circuit_breaker::{BreakerRegistry, BreakerState, CircuitBreakerConfig, CircuitBreakerError};
use starport_runtime::config::RuntimeConfig;
use starport_runtime::retry::{Retrier, RetryPolicy};
use starport_runtime::timeout::with_timeout;
use starport_runtime::{Dispatcher, HealthReport};
use std::sync::Arc;
use std::time::Duration;

/// Input for [`JobService::register_service`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    /// Display name (defaults to the service ID)
    pub name: Option<String>,
    /// Probability that an attempt fails, `0.0..=1.0`
    pub failure_rate: f64,
    /// Fastest simulated attempt, in milliseconds
    pub min_latency_ms: u64,
    /// Slowest simulated attempt (defaults to the configured maximum)
    pub max_latency_ms: Option<u64>,
    /// Per-attempt timeout; none when unset
    pub timeout_ms: Option<u64>,
    /// Breaker settings (defaults to the configured breaker)
    pub breaker: Option<CircuitBreakerConfig>,
    /// Retry settings (defaults to the configured policy)
    pub retry: Option<RetryPolicy>,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            name: None,
            failure_rate: 0.1,
            min_latency_ms: 5,
            max_latency_ms: None,
            timeout_ms: None,
            breaker: None,
            retry: None,
        }
    }
}

/// A registered simulated service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedService {
    /// Service ID (also its breaker name)
    pub id: String,
    /// Display name
    pub name: String,
    /// Probability that an attempt fails
    pub failure_rate: f64,
    /// Fastest attempt, in milliseconds
    pub min_latency_ms: u64,
    /// Slowest attempt, in milliseconds
    pub max_latency_ms: u64,
    /// Per-attempt timeout
    pub timeout: Option<Duration>,
    /// Retry policy for runs
    pub retry: RetryPolicy,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl Entity for SimulatedService {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Output of a successful run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Quality score in `[0, 1)`
    pub score: f64,
    /// Simulated latency of the successful attempt
    pub latency_ms: u64,
    /// Attempts used
    pub attempts: usize,
}

/// A unit of work submitted to a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID
    pub id: String,
    /// Target service
    pub service_id: String,
    /// Caller payload
    pub input: Value,
    /// Lifecycle status
    pub status: RunStatus,
    /// Attempts used by the last run
    pub attempts: usize,
    /// Result once completed
    pub result: Option<JobResult>,
    /// Failure description once failed
    pub error: Option<String>,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
    /// Start time
    pub started_at: Option<DateTime<Utc>>,
    /// Finish time
    pub finished_at: Option<DateTime<Utc>>,
}

impl Entity for Job {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Per-service counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Service ID
    pub service_id: String,
    /// Jobs submitted
    pub total_jobs: usize,
    /// Jobs waiting
    pub pending: usize,
    /// Jobs in flight
    pub running: usize,
    /// Jobs completed
    pub completed: usize,
    /// Jobs failed
    pub failed: usize,
    /// `completed / (completed + failed)`
    pub success_rate: f64,
    /// Mean score of completed jobs
    pub average_score: Option<f64>,
    /// Mean latency of completed jobs, in milliseconds
    pub average_latency_ms: Option<f64>,
    /// Breaker state, when the service has a breaker
    pub breaker_state: Option<BreakerState>,
}

/// Defaults applied to services registered without explicit settings
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefaults {
    /// Slowest simulated attempt, in milliseconds
    pub max_latency_ms: u64,
    /// Retry policy
    pub retry: RetryPolicy,
}

/// Job feature state
#[derive(Debug, Clone)]
pub struct JobState {
    services: Registry<SimulatedService>,
    jobs: Registry<Job>,
    defaults: JobDefaults,
}

impl JobState {
    /// Empty state
    #[must_use]
    pub fn new(defaults: JobDefaults) -> Self {
        Self {
            services: Registry::new("Service"),
            jobs: Registry::new("Job"),
            defaults,
        }
    }

    /// The service a job was submitted to
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown job, or for a job whose service is gone.
    pub fn service_for(&self, job_id: &str) -> Result<SimulatedService, LifecycleError> {
        let job = self.jobs.require(job_id)?;
        self.services.require(&job.service_id).cloned()
    }

    /// Counters for one service, without breaker state
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown service.
    #[allow(clippy::cast_precision_loss)]
    pub fn service_stats(&self, service_id: &str) -> Result<ServiceStats, LifecycleError> {
        self.services.require(service_id)?;
        let jobs: Vec<&Job> = self.jobs.iter().filter(|j| j.service_id == service_id).collect();
        let count = |status: RunStatus| jobs.iter().filter(|j| j.status == status).count();
        let completed = count(RunStatus::Completed);
        let failed = count(RunStatus::Failed);
        let results: Vec<JobResult> = jobs.iter().filter_map(|j| j.result).collect();

        Ok(ServiceStats {
            service_id: service_id.to_string(),
            total_jobs: jobs.len(),
            pending: count(RunStatus::Pending),
            running: count(RunStatus::Running),
            completed,
            failed,
            success_rate: ratio(completed, completed + failed),
            average_score: average_by(&results, |r| r.score),
            average_latency_ms: average_by(&results, |r| r.latency_ms as f64),
            breaker_state: None,
        })
    }
}

impl Feature for JobState {
    const NAME: &'static str = "jobs";
}

fn job_event(name: &str, job: &Job) -> TelemetryEvent {
    TelemetryEvent::new(name)
        .with("job_id", job.id.as_str())
        .with("service_id", job.service_id.as_str())
}

fn move_job(job: &mut Job, next: RunStatus) -> Result<(), LifecycleError> {
    job.status = transition("Job", &job.id, job.status, next)?;
    Ok(())
}

/// Register or overwrite a simulated service
#[derive(Debug, Clone)]
pub struct RegisterService {
    /// Service ID
    pub id: String,
    /// Service settings
    pub spec: ServiceSpec,
}

impl Operation<JobState> for RegisterService {
    type Output = SimulatedService;
    const NAME: &'static str = "register_service";

    fn apply(self, state: &mut JobState, env: &Environment) -> Result<Applied<SimulatedService>, LifecycleError> {
        let spec = self.spec;
        if !(0.0..=1.0).contains(&spec.failure_rate) {
            return Err(LifecycleError::validation(format!(
                "failure rate must be within 0..=1, got {}",
                spec.failure_rate
            )));
        }
        let max_latency_ms = spec.max_latency_ms.unwrap_or(state.defaults.max_latency_ms);
        if spec.min_latency_ms > max_latency_ms {
            return Err(LifecycleError::validation(format!(
                "min latency {}ms exceeds max latency {max_latency_ms}ms",
                spec.min_latency_ms
            )));
        }

        let service = SimulatedService {
            name: spec.name.unwrap_or_else(|| self.id.clone()),
            failure_rate: spec.failure_rate,
            min_latency_ms: spec.min_latency_ms,
            max_latency_ms,
            timeout: spec.timeout_ms.map(Duration::from_millis),
            retry: spec.retry.unwrap_or_else(|| state.defaults.retry.clone()),
            created_at: env.now(),
            id: self.id,
        };
        let service = state.services.insert(service).clone();
        let event = TelemetryEvent::new("service_registered")
            .with("service_id", service.id.as_str())
            .with("failure_rate", service.failure_rate);
        Ok(Applied::new(service).with_event(event))
    }
}

/// Queue a job on a service
#[derive(Debug, Clone)]
pub struct SubmitJob {
    /// Target service
    pub service_id: String,
    /// Caller payload
    pub input: Value,
}

impl Operation<JobState> for SubmitJob {
    type Output = Job;
    const NAME: &'static str = "submit_job";

    fn apply(self, state: &mut JobState, env: &Environment) -> Result<Applied<Job>, LifecycleError> {
        state.services.require(&self.service_id)?;
        let job = state
            .jobs
            .insert(Job {
                id: env.next_id("job"),
                service_id: self.service_id,
                input: self.input,
                status: RunStatus::Pending,
                attempts: 0,
                result: None,
                error: None,
                submitted_at: env.now(),
                started_at: None,
                finished_at: None,
            })
            .clone();
        let event = job_event("submitted", &job);
        Ok(Applied::new(job).with_event(event))
    }
}

/// Move a pending job to running
#[derive(Debug, Clone)]
pub struct StartJob {
    /// Job ID
    pub job_id: String,
}

impl Operation<JobState> for StartJob {
    type Output = Job;
    const NAME: &'static str = "start";

    fn apply(self, state: &mut JobState, env: &Environment) -> Result<Applied<Job>, LifecycleError> {
        let job = state.jobs.require_mut(&self.job_id)?;
        move_job(job, RunStatus::Running)?;
        job.started_at = Some(env.now());
        let job = job.clone();
        let event = job_event("started", &job);
        Ok(Applied::new(job).with_event(event))
    }
}

/// Record a running job's result
#[derive(Debug, Clone)]
pub struct CompleteJob {
    /// Job ID
    pub job_id: String,
    /// Result
    pub result: JobResult,
}

impl Operation<JobState> for CompleteJob {
    type Output = Job;
    const NAME: &'static str = "complete";

    #[allow(clippy::cast_precision_loss)]
    fn apply(self, state: &mut JobState, env: &Environment) -> Result<Applied<Job>, LifecycleError> {
        if !(0.0..=1.0).contains(&self.result.score) {
            return Err(LifecycleError::validation(format!(
                "score must be within 0..=1, got {}",
                self.result.score
            )));
        }
        let job = state.jobs.require_mut(&self.job_id)?;
        move_job(job, RunStatus::Completed)?;
        job.attempts = self.result.attempts;
        job.result = Some(self.result);
        job.finished_at = Some(env.now());
        let job = job.clone();
        let event = job_event("completed", &job)
            .with_value(self.result.latency_ms as f64)
            .with("score", self.result.score)
            .with("attempts", self.result.attempts);
        Ok(Applied::new(job).with_event(event))
    }
}

/// Fail a pending or running job
#[derive(Debug, Clone)]
pub struct FailJob {
    /// Job ID
    pub job_id: String,
    /// Failure description
    pub reason: String,
    /// Attempts used, when the failure came from a run
    pub attempts: Option<usize>,
}

impl Operation<JobState> for FailJob {
    type Output = Job;
    const NAME: &'static str = "fail";

    fn apply(self, state: &mut JobState, env: &Environment) -> Result<Applied<Job>, LifecycleError> {
        let job = state.jobs.require_mut(&self.job_id)?;
        move_job(job, RunStatus::Failed)?;
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        job.error = Some(self.reason);
        job.finished_at = Some(env.now());
        let job = job.clone();
        let event = job_event("failed", &job).with("attempts", job.attempts);
        Ok(Applied::new(job).with_event(event))
    }
}

/// Value produced by one simulated attempt
#[derive(Debug, Clone, Copy)]
struct Simulated {
    score: f64,
    latency_ms: u64,
}

/// One attempt: wait out a random latency, then fail or produce a score
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
async fn simulate(service: &SimulatedService, random: &dyn RandomSource) -> Result<Simulated, LifecycleError> {
    let latency_ms = random
        .range(service.min_latency_ms as f64, service.max_latency_ms as f64)
        .round() as u64;
    tokio::time::sleep(Duration::from_millis(latency_ms)).await;

    if random.chance(service.failure_rate) {
        return Err(LifecycleError::Unavailable(format!(
            "{} failed to process the job",
            service.name
        )));
    }
    Ok(Simulated {
        score: random.next_f64(),
        latency_ms,
    })
}

async fn attempt(service: &SimulatedService, random: &dyn RandomSource) -> Result<Simulated, LifecycleError> {
    match service.timeout {
        Some(limit) => with_timeout(limit, simulate(service, random)).await?,
        None => simulate(service, random).await,
    }
}

/// Job service
#[derive(Debug, Clone)]
pub struct JobService {
    dispatcher: Dispatcher<JobState>,
    breakers: BreakerRegistry,
}

impl JobService {
    /// Empty service; breaker, retry and latency defaults come from `config`
    #[must_use]
    pub fn new(env: Environment, config: &RuntimeConfig) -> Self {
        let defaults = JobDefaults {
            max_latency_ms: config.job_max_latency_ms,
            retry: config.retry_policy(),
        };
        Self {
            breakers: BreakerRegistry::new(config.breaker_config(), env.clone()),
            dispatcher: Dispatcher::new(JobState::new(defaults), env),
        }
    }

    /// Register or overwrite a service; its breaker starts closed.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a failure rate outside `0..=1` or a latency range
    /// whose minimum exceeds its maximum.
    pub async fn register_service(
        &self,
        id: impl Into<String>,
        spec: ServiceSpec,
    ) -> Result<SimulatedService, LifecycleError> {
        let breaker = spec.breaker.clone();
        let service = self.dispatcher.send(RegisterService { id: id.into(), spec }).await?;
        self.breakers.create_breaker(service.id.clone(), breaker).await;
        Ok(service)
    }

    /// Queue a job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown service.
    pub async fn submit_job(&self, service_id: impl Into<String>, input: Value) -> Result<Job, LifecycleError> {
        self.dispatcher
            .send(SubmitJob {
                service_id: service_id.into(),
                input,
            })
            .await
    }

    /// Mark a job as running.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidTransition`.
    pub async fn start(&self, job_id: impl Into<String>) -> Result<Job, LifecycleError> {
        self.dispatcher.send(StartJob { job_id: job_id.into() }).await
    }

    /// Record a result for a running job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `InvalidTransition`, or a validation error for a score outside
    /// `0..=1`.
    pub async fn complete(&self, job_id: impl Into<String>, result: JobResult) -> Result<Job, LifecycleError> {
        self.dispatcher
            .send(CompleteJob {
                job_id: job_id.into(),
                result,
            })
            .await
    }

    /// Fail a job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidTransition`.
    pub async fn fail(&self, job_id: impl Into<String>, reason: impl Into<String>) -> Result<Job, LifecycleError> {
        self.dispatcher
            .send(FailJob {
                job_id: job_id.into(),
                reason: reason.into(),
                attempts: None,
            })
            .await
    }

    /// Run a pending job to completion or failure.
    ///
    /// Attempts go through the service's circuit breaker and are retried under its retry
    /// policy; a rejection by an open breaker ends the run without further retries. A
    /// simulated failure is recorded on the job, which is returned with status `failed`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown job and `InvalidTransition` for a job that is not
    /// pending.
    pub async fn run_job(&self, job_id: &str) -> Result<Job, LifecycleError> {
        let service = self.dispatcher.state(|s| s.service_for(job_id)).await?;
        self.start(job_id).await?;

        let random = Arc::clone(&self.dispatcher.environment().random);
        let retrier = Retrier::new(service.retry.clone()).with_random(Arc::clone(&random));
        let outcome = retrier
            .run_if(
                || {
                    let breakers = self.breakers.clone();
                    let service = service.clone();
                    let random = Arc::clone(&random);
                    async move {
                        breakers
                            .call(&service.id, || attempt(&service, random.as_ref()))
                            .await
                    }
                },
                |error: &CircuitBreakerError<LifecycleError>| matches!(error, CircuitBreakerError::Inner(_)),
            )
            .await;

        match outcome {
            Ok(done) => {
                tracing::info!(job_id, service_id = %service.id, attempts = done.attempts, "Job completed");
                self.complete(
                    job_id,
                    JobResult {
                        score: done.value.score,
                        latency_ms: done.value.latency_ms,
                        attempts: done.attempts,
                    },
                )
                .await
            }
            Err(failure) => {
                let reason = failure.error.into_lifecycle().to_string();
                tracing::warn!(job_id, service_id = %service.id, attempts = failure.attempts, %reason, "Job failed");
                self.dispatcher
                    .send(FailJob {
                        job_id: job_id.to_string(),
                        reason,
                        attempts: Some(failure.attempts),
                    })
                    .await
            }
        }
    }

    /// Look up a job
    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.dispatcher.state(|s| s.jobs.get_cloned(job_id)).await
    }

    /// Jobs submitted to a service, in submission order
    pub async fn jobs_for(&self, service_id: &str) -> Vec<Job> {
        self.dispatcher
            .state(|s| s.jobs.list(|j| j.service_id == service_id))
            .await
    }

    /// Counters for one service, including its breaker state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown service.
    pub async fn service_stats(&self, service_id: &str) -> Result<ServiceStats, LifecycleError> {
        let mut stats = self.dispatcher.state(|s| s.service_stats(service_id)).await?;
        if let Some(breaker) = self.breakers.get(service_id).await {
            stats.breaker_state = Some(breaker.state().await);
        }
        Ok(stats)
    }

    /// Breaker health of every service
    pub async fn health(&self) -> HealthReport {
        self.breakers.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use starport_testing::{assertions, recording_environment, test_environment, LifecycleTest, ScriptedRandom};

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            breaker_failure_threshold: 5,
            retry_max_retries: 2,
            retry_initial_delay_ms: 10,
            retry_max_delay_ms: 100,
            retry_jitter: 0.0,
            job_max_latency_ms: 30,
            ..RuntimeConfig::default()
        }
    }

    fn spec(failure_rate: f64) -> ServiceSpec {
        ServiceSpec {
            failure_rate,
            min_latency_ms: 10,
            ..ServiceSpec::default()
        }
    }

    fn scripted(script: Vec<f64>) -> Environment {
        test_environment().with_random(Arc::new(ScriptedRandom::new(script)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_job_completes_with_drawn_values() {
        let (env, sink) = recording_environment();
        let jobs = JobService::new(env.with_random(Arc::new(ScriptedRandom::constant(0.5))), &config());
        jobs.register_service("geocoder", spec(0.2)).await.unwrap();
        let job = jobs.submit_job("geocoder", json!({"planet": "Kepler-22b"})).await.unwrap();

        let done = jobs.run_job(&job.id).await.unwrap();

        assert_eq!(done.status, RunStatus::Completed);
        let result = done.result.unwrap();
        assert_eq!(result.latency_ms, 20);
        assert!((result.score - 0.5).abs() < f64::EPSILON);
        assert_eq!(result.attempts, 1);
        assert_eq!(
            sink.names(),
            vec!["jobs_service_registered", "jobs_submitted", "jobs_started", "jobs_completed"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_job_retries_then_succeeds() {
        // latency, failure roll (fails), latency, failure roll (passes), score
        let jobs = JobService::new(scripted(vec![0.0, 0.1, 0.0, 0.9, 0.7]), &config());
        jobs.register_service("ocr", spec(0.5)).await.unwrap();
        let job = jobs.submit_job("ocr", Value::Null).await.unwrap();

        let done = jobs.run_job(&job.id).await.unwrap();

        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.attempts, 2);
        assert!((done.result.unwrap().score - 0.7).abs() < f64::EPSILON);
        let stats = jobs.service_stats("ocr").await.unwrap();
        assert_eq!(stats.breaker_state, Some(BreakerState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_job() {
        let jobs = JobService::new(scripted(vec![0.0]), &config());
        jobs.register_service("flaky", spec(1.0)).await.unwrap();
        let job = jobs.submit_job("flaky", Value::Null).await.unwrap();

        let done = jobs.run_job(&job.id).await.unwrap();

        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.attempts, 3);
        assert!(done.error.unwrap().contains("flaky failed to process the job"));

        let err = jobs.run_job(&job.id).await.unwrap_err();
        assertions::assert_invalid_transition(&err, "running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_stops_retries_and_later_runs() {
        let jobs = JobService::new(scripted(vec![0.0]), &config());
        let breaker = CircuitBreakerConfig::builder()
            .failure_threshold(2)
            .timeout(Duration::from_secs(60))
            .build();
        jobs.register_service(
            "down",
            ServiceSpec {
                breaker: Some(breaker),
                retry: Some(RetryPolicy::builder().max_retries(5).initial_delay(Duration::from_millis(1)).build()),
                ..spec(1.0)
            },
        )
        .await
        .unwrap();

        let first = jobs.submit_job("down", Value::Null).await.unwrap();
        let done = jobs.run_job(&first.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.attempts, 3);
        assert!(done.error.unwrap().contains("open"));

        let second = jobs.submit_job("down", Value::Null).await.unwrap();
        let done = jobs.run_job(&second.id).await.unwrap();
        assert_eq!(done.attempts, 1);

        let stats = jobs.service_stats("down").await.unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.breaker_state, Some(BreakerState::Open));
        assert!(!jobs.health().await.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let jobs = JobService::new(scripted(vec![0.99]), &config());
        jobs.register_service(
            "slow",
            ServiceSpec {
                failure_rate: 0.0,
                min_latency_ms: 100,
                max_latency_ms: Some(200),
                timeout_ms: Some(50),
                retry: Some(RetryPolicy::builder().max_retries(1).build()),
                ..ServiceSpec::default()
            },
        )
        .await
        .unwrap();
        let job = jobs.submit_job("slow", Value::Null).await.unwrap();

        let done = jobs.run_job(&job.id).await.unwrap();

        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.attempts, 2);
        assert!(done.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_submit_to_unknown_service_is_not_found() {
        let jobs = JobService::new(test_environment(), &config());
        let err = jobs.submit_job("nowhere", Value::Null).await.unwrap_err();
        assertions::assert_not_found(&err, "Service", "nowhere");
        let err = jobs.service_stats("nowhere").await.unwrap_err();
        assertions::assert_not_found(&err, "Service", "nowhere");
    }

    #[tokio::test]
    async fn test_manual_lifecycle_and_stats() {
        let jobs = JobService::new(test_environment(), &config());
        jobs.register_service("render", ServiceSpec::default()).await.unwrap();
        let a = jobs.submit_job("render", json!(1)).await.unwrap();
        let b = jobs.submit_job("render", json!(2)).await.unwrap();
        jobs.submit_job("render", json!(3)).await.unwrap();

        jobs.start(&a.id).await.unwrap();
        jobs.complete(
            &a.id,
            JobResult {
                score: 0.8,
                latency_ms: 12,
                attempts: 1,
            },
        )
        .await
        .unwrap();
        jobs.fail(&b.id, "cancelled by operator").await.unwrap();

        let stats = jobs.service_stats("render").await.unwrap();
        assert_eq!(stats.total_jobs, 3);
        assert_eq!((stats.pending, stats.completed, stats.failed), (1, 1, 1));
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.average_latency_ms, Some(12.0));
        assert_eq!(jobs.jobs_for("render").await.len(), 3);

        let err = jobs
            .complete(
                &b.id,
                JobResult {
                    score: 0.1,
                    latency_ms: 1,
                    attempts: 1,
                },
            )
            .await
            .unwrap_err();
        assertions::assert_invalid_transition(&err, "completed");
        assert_eq!(jobs.get_job(&b.id).await.unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn test_register_rejects_bad_failure_rate() {
        let state = JobState::new(JobDefaults {
            max_latency_ms: 10,
            retry: RetryPolicy::default(),
        });
        LifecycleTest::new(test_environment())
            .given_state(state)
            .when(RegisterService {
                id: "bad".to_string(),
                spec: spec(1.5),
            })
            .then_error(|error| assert!(matches!(error, LifecycleError::Validation(_))))
            .then_state(|state| assert!(state.services.is_empty()))
            .run();
    }
}
