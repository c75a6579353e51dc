//! Orchestrator (C8).
//!
//! Binds the router (C3) + pool (C5) + quota (C4) + resilience (circuit
//! breaker + bulkhead) + the generation loop (C6) into the stable
//! `infer`/`inferStream`/`batchInfer`/async-job surface. One struct owns
//! every process-wide collaborator, constructed once at startup via
//! explicit init rather than a lazily-initialized global.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::{
    backend::{RunnerBackend, RunnerInstance, RunnerInstanceConfig},
    bulkhead::{Bulkhead, SharedBulkhead},
    circuit_breaker::CircuitBreaker,
    config::CoreConfig,
    error::CoreError,
    hardware::HardwareProbe,
    metrics::MetricsStore,
    plugins::PluginRegistry,
    pool::{Pool, PoolKey},
    quota::QuotaLimiter,
    run::{self, CancelSignal, TemplateRenderer},
    selection::{SelectionPolicy, Strategy},
    AsyncJob, CoreResult, ExecutionStatus, ExecutionToken, InferenceRequest, InferenceResponse, JobStatus, ModelManifest, Phase,
    RunnerMetadata, TenantContext,
};

/// Injected model registry lookup (§1/lib.rs doc: "the model registry...
/// [is an] external collaborator; this crate specifies only the
/// interface it consumes from [it]").
#[async_trait]
pub trait ManifestProvider: Send + Sync {
    async fn manifest(&self, model_id: &str, tenant_id: &str) -> CoreResult<ModelManifest>;
}

/// Best-effort audit outbox (§5 "Audit records: database-persisted
/// outside the hot path; failures to persist do not fail the
/// inference", §9). Never awaited on the hot path beyond handing the
/// event off.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub request_id: String,
    pub tenant_id: String,
    pub model_id: String,
    pub runner_name: Option<String>,
    pub phase: Phase,
    pub status: ExecutionStatus,
    pub error_kind: Option<String>,
}

struct NoopAuditSink;
#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _event: AuditEvent) {}
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Tracks submitted async jobs (§4.8 `submitAsyncJob`/`getJobStatus`/
/// `cancelJob`), retaining completed results for a bounded period
/// (default 24h) before a sweep drops them.
pub struct AsyncJobStore {
    jobs: DashMap<String, AsyncJob>,
    cancel_flags: DashMap<String, CancelSignal>,
    retention: Duration,
}

impl AsyncJobStore {
    pub fn new(retention: Duration) -> Self {
        Self { jobs: DashMap::new(), cancel_flags: DashMap::new(), retention }
    }

    fn submit(&self, request: InferenceRequest) -> (String, CancelSignal) {
        let job_id = Uuid::new_v4().to_string();
        let job = AsyncJob { job_id: job_id.clone(), request, status: JobStatus::Pending, result: None, error: None, submitted_at_ms: now_ms(), completed_at_ms: None };
        self.jobs.insert(job_id.clone(), job);
        let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
        self.cancel_flags.insert(job_id.clone(), cancel.clone());
        (job_id, cancel)
    }

    fn mark_running(&self, job_id: &str) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.status = JobStatus::Running;
        }
    }

    fn complete(&self, job_id: &str, result: InferenceResponse) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.status = JobStatus::Completed;
            job.result = Some(result);
            job.completed_at_ms = Some(now_ms());
        }
        self.cancel_flags.remove(job_id);
    }

    fn fail(&self, job_id: &str, error: &CoreError) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.status = if matches!(error, CoreError::Cancelled) { JobStatus::Cancelled } else { JobStatus::Failed };
            job.error = Some(error.to_string());
            job.completed_at_ms = Some(now_ms());
        }
        self.cancel_flags.remove(job_id);
    }

    /// Signals cooperative cancellation. A job already completed is
    /// unaffected (cancelling is a no-op past completion, not an error,
    /// since the race is inherent to async cancellation).
    pub fn cancel(&self, job_id: &str) -> CoreResult<()> {
        match self.jobs.get(job_id) {
            None => Err(CoreError::BadRequest(format!("unknown job {job_id}"))),
            Some(job) if matches!(job.status, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled) => Ok(()),
            Some(_) => {
                if let Some(flag) = self.cancel_flags.get(job_id) {
                    flag.store(true, Ordering::Relaxed);
                }
                Ok(())
            }
        }
    }

    pub fn get(&self, job_id: &str, _tenant_id: &str) -> CoreResult<AsyncJob> {
        let job = self.jobs.get(job_id).ok_or_else(|| CoreError::BadRequest(format!("unknown job {job_id}")))?;
        Ok(job.clone())
    }

    /// Drops completed jobs older than `retention`. Callers run this
    /// periodically (e.g. alongside the pool's own maintenance sweep);
    /// it is not triggered automatically on every call to keep job
    /// lookups O(1) and lock-free.
    pub fn sweep(&self) {
        let now = now_ms();
        let retention_ms = self.retention.as_millis() as u64;
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|entry| entry.completed_at_ms.map(|at| now.saturating_sub(at) >= retention_ms).unwrap_or(false))
            .map(|entry| entry.job_id.clone())
            .collect();
        for job_id in expired {
            self.jobs.remove(&job_id);
        }
    }
}

/// Default async job retention (§4.8: "Job results are retained for a
/// bounded period (default 24h)").
const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Process-wide object binding every collaborator C8 needs. Constructed
/// once at startup (explicit-init, §9) and shared behind an `Arc` so
/// `submit_async_job` can spawn background work against it.
pub struct Orchestrator {
    config: CoreConfig,
    hardware: HardwareProbe,
    metrics: Arc<MetricsStore>,
    quota: QuotaLimiter,
    pool: Pool<RunnerInstance>,
    backends: DashMap<String, Arc<dyn RunnerBackend>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    bulkhead: SharedBulkhead,
    manifests: Arc<dyn ManifestProvider>,
    audit: Arc<dyn AuditSink>,
    renderer: Option<Arc<TemplateRenderer>>,
    plugins: Arc<PluginRegistry>,
    runner_config: RunnerInstanceConfig,
    pub jobs: AsyncJobStore,
}

impl Orchestrator {
    pub fn new(config: CoreConfig, manifests: Arc<dyn ManifestProvider>, plugins: Arc<PluginRegistry>) -> Self {
        let bulkhead = Arc::new(Bulkhead::new(config.bulkhead.clone()));
        Self {
            pool: Pool::new(config.pool.clone()),
            quota: QuotaLimiter::new(config.quota.clone()),
            hardware: HardwareProbe::new(),
            metrics: Arc::new(MetricsStore::new()),
            backends: DashMap::new(),
            breakers: DashMap::new(),
            bulkhead,
            manifests,
            audit: Arc::new(NoopAuditSink),
            renderer: None,
            plugins,
            runner_config: RunnerInstanceConfig::default(),
            jobs: AsyncJobStore::new(DEFAULT_JOB_RETENTION),
            config,
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<TemplateRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Registers a runner backend under its declared name, making it a
    /// selection candidate. Called at startup once per configured
    /// runner (GGUF, LiteRT, ONNX, remote, ...).
    pub fn register_backend(&self, backend: Arc<dyn RunnerBackend>) {
        let name = backend.metadata().name.clone();
        self.breakers.entry(name.clone()).or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.resilience.clone())));
        self.backends.insert(name, backend);
    }

    fn breaker_for(&self, runner_name: &str) -> Arc<CircuitBreaker> {
        self.breakers.entry(runner_name.to_string()).or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.resilience.clone()))).clone()
    }

    fn candidate_metadata(&self) -> Vec<RunnerMetadata> {
        self.backends.iter().map(|e| e.value().metadata().clone()).collect()
    }

    async fn audit(&self, event: AuditEvent) {
        self.audit.record(event).await;
    }

    /// §4.8 "Validate tenant exists and is ACTIVE". Existence is the
    /// caller's responsibility (tenant lookup is an external
    /// collaborator); here we only check the `active` bit it asserts.
    fn require_active_tenant(tenant: &TenantContext) -> CoreResult<()> {
        if !tenant.active {
            return Err(CoreError::Forbidden);
        }
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.resilience.backoff_base_ms;
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(base.saturating_mul(factor))
    }

    /// Shared setup for every entrypoint: quota gates, manifest lookup,
    /// ranked candidate selection, and the PREPARE/ROUTE plugin
    /// boundaries (§4.9, consulted "during C8's flow" at
    /// PREPARE/ROUTE/EXECUTE/COMPLETE). The tenant-active check runs in
    /// each entrypoint before concurrency is acquired, so callers here
    /// are already known active. Returns the ranked candidates, the
    /// request context, and the token — now at `Phase::Route` —
    /// threaded on into [`Self::run_attempts`] for the remaining two
    /// boundaries.
    async fn prepare(&self, model_id: &str, request: &InferenceRequest, tenant: &TenantContext) -> CoreResult<(crate::RequestContext, ModelManifest, Vec<crate::selection::RankedCandidate>, ExecutionToken)> {
        let mut ctx = crate::RequestContext::new(tenant.tenant_id.clone());
        ctx.preferred_device = tenant.preferred_device.clone();
        ctx.cost_sensitive = tenant.cost_sensitive;
        ctx.max_attempts = self.config.resilience.max_attempts;
        ctx.timeout = Duration::from_millis(request.parameters.inference_timeout_ms);

        let token = ExecutionToken::new(ctx.request_id.clone());
        let token = self.plugins.invoke(Phase::Prepare, token).await?;

        self.quota.check_quota(&tenant.tenant_id, request.parameters.max_tokens as f64)?;

        let manifest = self.manifests.manifest(model_id, &tenant.tenant_id).await?;
        let hardware = self.hardware.detect();
        let strategy = Strategy::parse(&self.config.router.strategy);
        let policy = SelectionPolicy::new(strategy, self.config.router.balanced_weights, &hardware, &self.metrics);
        let ranked = policy.select(&self.candidate_metadata(), &manifest, &ctx);

        let token = token.transition(Phase::Route, ExecutionStatus::Processing);
        let token = self.plugins.invoke(Phase::Route, token).await?;

        if ranked.is_empty() {
            return Err(CoreError::DeviceUnavailable);
        }

        Ok((ctx, manifest, ranked, token))
    }

    async fn resolve_instance(&self, runner_name: &str, tenant_id: &str, model_id: &str) -> CoreResult<Arc<RunnerInstance>> {
        let backend = self.backends.get(runner_name).map(|e| e.value().clone()).ok_or_else(|| CoreError::Internal(format!("no backend registered for runner {runner_name}")))?;
        let key = PoolKey { tenant_id: tenant_id.to_string(), model_id: model_id.to_string(), runner_name: runner_name.to_string() };
        let runner_config = self.runner_config.clone();
        self.pool
            .get_or_create(key.clone(), move || {
                let backend = backend.clone();
                let key = key.clone();
                async move { RunnerInstance::new(key, backend, &runner_config, 1).await }
            })
            .await
    }

    /// Runs the attempt loop (selection failover + retryable-error
    /// backoff) common to `infer` and `inferAsync`. `cancel` is threaded
    /// through to the generation loop so `cancelJob` can interrupt it.
    async fn run_attempts(
        &self,
        model_id: &str,
        request: &InferenceRequest,
        ctx: &crate::RequestContext,
        ranked: &[crate::selection::RankedCandidate],
        mut token: ExecutionToken,
        cancel: Option<&CancelSignal>,
    ) -> CoreResult<InferenceResponse> {
        let mut candidate_idx = 0usize;
        let mut last_err = CoreError::DeviceUnavailable;

        for attempt in 1..=ctx.max_attempts.max(1) {
            if candidate_idx >= ranked.len() {
                let completed = token.transition(Phase::Complete, ExecutionStatus::Failed);
                let _ = self.plugins.invoke(Phase::Complete, completed).await;
                return Err(last_err);
            }
            let candidate = &ranked[candidate_idx];
            let breaker = self.breaker_for(&candidate.runner_name);

            if !breaker.allow() {
                candidate_idx += 1;
                continue;
            }

            let _bulkhead_guard = match self.bulkhead.acquire().await {
                Ok(guard) => guard,
                Err(err) => return Err(err),
            };

            let instance = match self.resolve_instance(&candidate.runner_name, &ctx.tenant_id, model_id).await {
                Ok(instance) => instance,
                Err(err) => {
                    breaker.on_failure();
                    last_err = err;
                    candidate_idx += 1;
                    continue;
                }
            };

            self.metrics.begin_request(&candidate.runner_name);
            let started = std::time::Instant::now();

            token = token.transition(Phase::Execute, ExecutionStatus::Processing);
            token = match self.plugins.invoke(Phase::Execute, token).await {
                Ok(token) => token,
                Err(err) => {
                    self.metrics.end_request(&candidate.runner_name, 0, false);
                    return Err(err);
                }
            };
            self.audit(AuditEvent {
                request_id: ctx.request_id.clone(),
                tenant_id: ctx.tenant_id.clone(),
                model_id: model_id.to_string(),
                runner_name: Some(candidate.runner_name.clone()),
                phase: Phase::Execute,
                status: ExecutionStatus::Processing,
                error_kind: None,
            })
            .await;

            let renderer_ref = self.renderer.as_deref();
            let result = run::generate(&instance, request, ctx, renderer_ref, cancel).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(response) => {
                    self.metrics.end_request(&candidate.runner_name, latency_ms, true);
                    self.metrics.set_healthy(&candidate.runner_name, true);
                    breaker.on_success();
                    let completed = token.transition(Phase::Complete, ExecutionStatus::Completed);
                    self.plugins.invoke(Phase::Complete, completed).await?;
                    self.audit(AuditEvent {
                        request_id: ctx.request_id.clone(),
                        tenant_id: ctx.tenant_id.clone(),
                        model_id: model_id.to_string(),
                        runner_name: Some(candidate.runner_name.clone()),
                        phase: Phase::Complete,
                        status: ExecutionStatus::Completed,
                        error_kind: None,
                    })
                    .await;
                    return Ok(response);
                }
                Err(err) => {
                    self.metrics.end_request(&candidate.runner_name, latency_ms, false);
                    breaker.on_failure();
                    if breaker.state() == crate::circuit_breaker::CircuitState::Open {
                        self.metrics.set_healthy(&candidate.runner_name, false);
                    }
                    self.audit(AuditEvent {
                        request_id: ctx.request_id.clone(),
                        tenant_id: ctx.tenant_id.clone(),
                        model_id: model_id.to_string(),
                        runner_name: Some(candidate.runner_name.clone()),
                        phase: Phase::Complete,
                        status: ExecutionStatus::Failed,
                        error_kind: Some(err.kind().to_string()),
                    })
                    .await;

                    let is_failover_trigger = matches!(err, CoreError::RunnerInitFailed(_) | CoreError::CircuitOpen(_));
                    last_err = err.clone();
                    if is_failover_trigger {
                        candidate_idx += 1;
                        continue;
                    }
                    if !err.retryable() {
                        let completed = token.transition(Phase::Complete, ExecutionStatus::Failed);
                        let _ = self.plugins.invoke(Phase::Complete, completed).await;
                        return Err(err);
                    }
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
            }
        }

        let completed = token.transition(Phase::Complete, ExecutionStatus::Failed);
        let _ = self.plugins.invoke(Phase::Complete, completed).await;
        Err(last_err)
    }

    /// Blocking entrypoint (§4.8 `infer`).
    pub async fn infer(&self, model_id: &str, mut request: InferenceRequest, tenant: &TenantContext) -> CoreResult<InferenceResponse> {
        Self::require_active_tenant(tenant)?;
        request.model_id = model_id.to_string();
        let _concurrency = self.quota.acquire_concurrency(&tenant.tenant_id).await?;
        let (ctx, _manifest, ranked, token) = self.prepare(model_id, &request, tenant).await?;
        self.run_attempts(model_id, &request, &ctx, &ranked, token, None).await
    }

    /// `inferAsync` — identical flow to `infer`, exposed as a distinct
    /// name because a transport adapter may choose to spawn it onto a
    /// task pool rather than awaiting inline; the core itself does not
    /// need two implementations since `infer` is already non-blocking at
    /// the `async fn` level.
    pub async fn infer_async(&self, model_id: &str, request: InferenceRequest, tenant: &TenantContext) -> CoreResult<InferenceResponse> {
        self.infer(model_id, request, tenant).await
    }

    /// Streaming entrypoint (§4.8 `inferStream`). Runs exactly one
    /// selection attempt: once bytes have started flowing to the
    /// caller, failing over to a different runner would require
    /// retracting already-sent chunks, which the stream contract (§6:
    /// "any error aborts the stream before `isFinal`") does not permit.
    pub async fn infer_stream(&self, model_id: &str, mut request: InferenceRequest, tenant: &TenantContext) -> CoreResult<flume::Receiver<CoreResult<crate::StreamChunk>>> {
        Self::require_active_tenant(tenant)?;
        request.model_id = model_id.to_string();
        request.parameters.stream = true;
        let _concurrency = self.quota.acquire_concurrency(&tenant.tenant_id).await?;
        let (ctx, _manifest, ranked, token) = self.prepare(model_id, &request, tenant).await?;
        let token = token.transition(Phase::Execute, ExecutionStatus::Processing);
        let token = self.plugins.invoke(Phase::Execute, token).await?;

        let candidate = ranked.into_iter().find(|c| self.breaker_for(&c.runner_name).allow()).ok_or(CoreError::DeviceUnavailable)?;
        // An owned guard, not the borrowed `BulkheadGuard`, since it must
        // outlive this call and be moved into the forwarding task below.
        let guard = self.bulkhead.acquire_owned().await?;
        let breaker = self.breaker_for(&candidate.runner_name);

        let instance = match self.resolve_instance(&candidate.runner_name, &ctx.tenant_id, model_id).await {
            Ok(instance) => instance,
            Err(err) => {
                breaker.on_failure();
                return Err(err);
            }
        };
        self.metrics.begin_request(&candidate.runner_name);
        let started = std::time::Instant::now();
        let renderer = self.renderer.clone();
        let runner_name = candidate.runner_name.clone();
        let metrics = self.metrics.clone();

        let inner_rx = run::generate_stream(instance, request, ctx, renderer, None);
        let (tx, rx) = flume::bounded(64);
        let plugins = self.plugins.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let mut succeeded = true;
            while let Ok(item) = inner_rx.recv_async().await {
                if item.is_err() {
                    succeeded = false;
                }
                if tx.send_async(item).await.is_err() {
                    break;
                }
            }
            let latency_ms = started.elapsed().as_millis() as u64;
            metrics.end_request(&runner_name, latency_ms, succeeded);
            if succeeded {
                breaker.on_success();
            } else {
                breaker.on_failure();
            }
            let status = if succeeded { ExecutionStatus::Completed } else { ExecutionStatus::Failed };
            let completed = token.transition(Phase::Complete, status);
            let _ = plugins.invoke(Phase::Complete, completed).await;
        });
        Ok(rx)
    }

    /// `batchInfer`: preserves input order; a failing request becomes an
    /// `Err` at its slot instead of aborting the rest of the batch. Runs
    /// sequentially — concurrent execution is not required here, and
    /// sequential keeps per-tenant quota/concurrency accounting exact.
    pub async fn batch_infer(&self, model_id: &str, requests: Vec<InferenceRequest>, tenant: &TenantContext) -> Vec<CoreResult<InferenceResponse>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.infer(model_id, request, tenant).await);
        }
        results
    }

    /// `submitAsyncJob` (§4.8). Spawns the work on a background task and
    /// returns the job id immediately; `self` must be held behind an
    /// `Arc` so the spawned task can outlive this call.
    pub fn submit_async_job(self: &Arc<Self>, model_id: String, request: InferenceRequest, tenant: TenantContext) -> String {
        let (job_id, cancel) = self.jobs.submit(request.clone());
        let orchestrator = self.clone();
        let job_id_for_task = job_id.clone();
        tokio::spawn(async move {
            orchestrator.jobs.mark_running(&job_id_for_task);
            match orchestrator.infer_with_cancel(&model_id, request, &tenant, Some(&cancel)).await {
                Ok(response) => orchestrator.jobs.complete(&job_id_for_task, response),
                Err(err) => orchestrator.jobs.fail(&job_id_for_task, &err),
            }
        });
        job_id
    }

    async fn infer_with_cancel(&self, model_id: &str, mut request: InferenceRequest, tenant: &TenantContext, cancel: Option<&CancelSignal>) -> CoreResult<InferenceResponse> {
        Self::require_active_tenant(tenant)?;
        request.model_id = model_id.to_string();
        let _concurrency = self.quota.acquire_concurrency(&tenant.tenant_id).await?;
        let (ctx, _manifest, ranked, token) = self.prepare(model_id, &request, tenant).await?;
        self.run_attempts(model_id, &request, &ctx, &ranked, token, cancel).await
    }

    /// `getJobStatus` (§4.8).
    pub fn get_job_status(&self, job_id: &str, tenant_id: &str) -> CoreResult<AsyncJob> {
        self.jobs.get(job_id, tenant_id)
    }

    /// `cancelJob` (§4.8). Cooperative: the running job observes the
    /// flag at its next deadline/decode check point (§5).
    pub fn cancel_job(&self, job_id: &str) -> CoreResult<()> {
        self.jobs.cancel(job_id)
    }

    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }

    pub fn sweep_jobs(&self) {
        self.jobs.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArtifactDescriptor, ArtifactFormat, ResourceRequirements};
    use std::collections::HashMap;

    struct FixedManifest;
    #[async_trait]
    impl ManifestProvider for FixedManifest {
        async fn manifest(&self, model_id: &str, tenant_id: &str) -> CoreResult<ModelManifest> {
            let mut artifacts = HashMap::new();
            artifacts.insert(ArtifactFormat::Other("remote".into()), ArtifactDescriptor { uri: "remote://m".into(), checksum: "x".into(), size_bytes: 0 });
            Ok(ModelManifest {
                model_id: model_id.to_string(),
                tenant_id: tenant_id.to_string(),
                version: "1".into(),
                artifacts,
                resource_requirements: ResourceRequirements::default(),
                supported_formats: vec![ArtifactFormat::Other("remote".into())],
            })
        }
    }

    fn orchestrator() -> Arc<Orchestrator> {
        let orch = Orchestrator::new(CoreConfig::default(), Arc::new(FixedManifest), Arc::new(PluginRegistry::new()));
        orch.register_backend(Arc::new(crate::backend::remote::RemoteBackend::new("openai-compat", None)));
        Arc::new(orch)
    }

    #[tokio::test]
    async fn inactive_tenant_is_forbidden() {
        let orch = orchestrator();
        let mut tenant = TenantContext::new("acme");
        tenant.active = false;
        let request = InferenceRequest { model_id: "m1".into(), prompt: Some("hi".into()), ..Default::default() };
        let err = orch.infer("m1", request, &tenant).await.unwrap_err();
        assert_eq!(err.kind(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn remote_backend_runner_init_failure_surfaces_as_device_unavailable_after_exhausting_candidates() {
        let orch = orchestrator();
        let tenant = TenantContext::new("acme");
        let request = InferenceRequest { model_id: "m1".into(), prompt: Some("hi".into()), ..Default::default() };
        let err = orch.infer("m1", request, &tenant).await.unwrap_err();
        // Only one candidate (remote, which always fails RUNNER_INIT_FAILED);
        // once exhausted, run_attempts surfaces the last observed error.
        assert_eq!(err.kind(), "RUNNER_INIT_FAILED");
    }

    #[tokio::test]
    async fn job_lifecycle_tracks_submission_through_completion() {
        let orch = orchestrator();
        let tenant = TenantContext::new("acme");
        let request = InferenceRequest { model_id: "m1".into(), prompt: Some("hi".into()), ..Default::default() };
        let job_id = orch.submit_async_job("m1".into(), request, tenant);
        // allow the spawned task to run
        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = orch.get_job_status(&job_id, "acme").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.is_some());
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_bad_request() {
        let orch = orchestrator();
        let err = orch.cancel_job("nonexistent").unwrap_err();
        assert_eq!(err.kind(), "BAD_REQUEST");
    }
}
