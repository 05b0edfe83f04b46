//! The job execution engine.
//!
//! Drives each configured job through its lifecycle: pre-load images, create
//! namespaces, submit rendered objects at the configured rate, wait for
//! readiness, verify counts, churn, clean up, and emit a summary document.
//! Jobs run sequentially in declared order; a failed job does not stop the
//! run.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, bail, Context as _, Result};
use k8s_openapi::chrono::{DateTime, Utc};
use kiln_common::{
    config::{ChurnDeletionStrategy, Job, JobType, ObjectSpec, WaitOptions},
    documents::{JobSummary, Metadata, JOB_SUMMARY_METRIC},
};
use kube::{
    api::DynamicObject,
    core::TypeMeta,
    Client,
};
use rand::seq::index::sample;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    client::{ApiError, ClusterClient},
    config::Config,
    indexer::{self, Indexer, IndexingOpts},
    labels,
    limiter::RateLimiter,
    measurements::{MeasurementContext, MeasurementRegistry},
    pool::{WorkItem, WorkerPool},
    template::{MissingKeyPolicy, Renderer},
    wait,
};

mod pre_load;

/// Most workers a single job will run, regardless of qps.
const MAX_WORKERS: usize = 64;
/// Poll period of readiness waits.
const READY_POLL: Duration = Duration::from_millis(100);

/// Outcome of a whole run.
pub struct RunReport {
    /// False when any job failed or failed verification.
    pub passed: bool,
    /// One summary per executed job.
    pub summaries: Vec<JobSummary>,
}

/// Execute every job of `config` sequentially and index the results.
pub async fn run(
    config: Config,
    uuid_override: Option<String>,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let uuid = uuid_override
        .or_else(|| config.global.uuid.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(%uuid, jobs = config.jobs.len(), "starting run");

    let client = Client::try_default().await.context("building kube client")?;
    let cluster = Arc::new(
        ClusterClient::try_new(client.clone())
            .await
            .context("discovering cluster APIs")?,
    );
    let indexer: Option<Box<dyn Indexer>> = match config.metrics_endpoints.first() {
        Some(endpoint) => Some(indexer::from_config(&endpoint.indexer)?),
        None => None,
    };
    let registry = MeasurementRegistry::new(&config.global.measurements);

    let mut summaries = Vec::new();
    let mut passed = true;
    for job in &config.jobs {
        // Setup problems (unreadable or unrenderable templates) fail the
        // job before anything is submitted; the run continues.
        let mut executor = match JobExecutor::new(
            cluster.clone(),
            &config,
            job.clone(),
            uuid.clone(),
            cancel.clone(),
        ) {
            Ok(executor) => executor,
            Err(err) => {
                error!(job = %job.name, %err, "job setup failed");
                passed = false;
                summaries.push(setup_failure_summary(job, &uuid, &config, &err));
                continue;
            }
        };

        let ctx = MeasurementContext {
            client: client.clone(),
            uuid: uuid.clone(),
            job_name: job.name.clone(),
            selector: labels::run_selector(&uuid),
            metadata: config.global.metadata.clone(),
            pod_wait_options: pod_wait_options(job),
        };
        let mut active = registry.start(&ctx).await?;

        let summary = executor.run().await;

        active.collect().await;
        active
            .stop_and_index(&job.name, indexer.as_deref(), job.skip_indexing)
            .await;

        passed &= summary.passed;
        summaries.push(summary);
        if cancel.is_cancelled() {
            warn!("run interrupted, skipping remaining jobs");
            break;
        }
    }

    if let Some(indexer) = indexer.as_deref() {
        let documents: Vec<serde_json::Value> = summaries
            .iter()
            .filter(|summary| !summary.job_config.skip_indexing)
            .map(|summary| serde_json::to_value(summary).expect("summary serializes"))
            .collect();
        info!("indexing job summaries");
        let opts = IndexingOpts {
            metric_name: JOB_SUMMARY_METRIC.to_owned(),
        };
        match indexer.index(&documents, &opts) {
            Ok(resp) => info!(%resp, "indexed"),
            Err(err) => error!(%err, "indexing job summaries failed"),
        }
    }

    if config.global.gc {
        if let Err(err) = destroy(&cluster, &uuid, &cancel).await {
            error!(%err, "garbage collection failed");
        }
    }
    Ok(RunReport { passed, summaries })
}

/// Delete every namespace labelled with the given run id and wait for the
/// deletions to finish.
pub async fn destroy(
    cluster: &ClusterClient,
    uuid: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(4 * 3600);
    let namespaces = cluster
        .list_namespaces(&labels::run_selector(uuid), deadline, cancel)
        .await?;
    info!(%uuid, count = namespaces.len(), "deleting namespaces");
    for namespace in &namespaces {
        let Some(name) = namespace.metadata.name.as_deref() else {
            continue;
        };
        cluster.delete_namespace(name, true, deadline, cancel).await?;
    }
    Ok(())
}

/// Summary of a job that failed before submission could begin.
fn setup_failure_summary(
    job: &Job,
    uuid: &str,
    config: &Config,
    err: &anyhow::Error,
) -> JobSummary {
    let now = Utc::now();
    JobSummary {
        timestamp: now,
        end_timestamp: now,
        elapsed_time: 0.0,
        churn_start_timestamp: None,
        churn_end_timestamp: None,
        uuid: uuid.to_owned(),
        metric_name: JOB_SUMMARY_METRIC.to_owned(),
        job_config: job.clone(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        passed: false,
        execution_errors: format!("{err:#}"),
        observed_qps: 0.0,
        requests_sent: 0,
        metadata: config.global.metadata.clone(),
    }
}

/// The first custom pod readiness predicate defined by the job's objects.
fn pod_wait_options(job: &Job) -> Option<WaitOptions> {
    job.objects
        .iter()
        .filter_map(|spec| spec.wait_options.clone())
        .find(|opts| opts.kind.as_deref().map_or(true, |kind| kind == "Pod"))
}

struct LoadedSpec {
    spec: ObjectSpec,
    template: String,
    types: TypeMeta,
    kind: String,
}

struct SubmitCtx {
    cluster: Arc<ClusterClient>,
    renderer: Arc<Renderer>,
    specs: Arc<Vec<LoadedSpec>>,
    job: Job,
    uuid: String,
    limiter: RateLimiter,
    requests_sent: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Executes one job from start to summary.
pub struct JobExecutor {
    cluster: Arc<ClusterClient>,
    renderer: Arc<Renderer>,
    specs: Arc<Vec<LoadedSpec>>,
    job: Job,
    uuid: String,
    metadata: Metadata,
    cancel: CancellationToken,
    requests_sent: Arc<AtomicU64>,
    execution_errors: Vec<String>,
    churn_start: Option<DateTime<Utc>>,
    churn_end: Option<DateTime<Utc>>,
}

impl JobExecutor {
    /// Load and validate the job's templates. Render problems fail here,
    /// before anything is submitted.
    pub fn new(
        cluster: Arc<ClusterClient>,
        config: &Config,
        job: Job,
        uuid: String,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let renderer = Arc::new(Renderer::new(MissingKeyPolicy::Error));
        let mut specs = Vec::with_capacity(job.objects.len());
        for spec in &job.objects {
            let path = config.template_path(&spec.object_template);
            let template = std::fs::read_to_string(&path)
                .with_context(|| format!("reading template {}", path.display()))?;
            renderer.validate(&template)?;
            // A probe render catches missing variables and determines the
            // kind before any submission happens.
            let data = render_data(spec, &job.name, &uuid, 1, 1);
            let rendered = renderer
                .render(&template, &data)
                .with_context(|| format!("rendering template {}", path.display()))?;
            let probe = parse_manifest(&rendered)
                .map_err(|err| anyhow!("parsing template {}: {err}", path.display()))?;
            let types = probe
                .types
                .clone()
                .ok_or_else(|| anyhow!("template {} lacks apiVersion/kind", path.display()))?;
            let kind = types.kind.clone();
            specs.push(LoadedSpec {
                spec: spec.clone(),
                template,
                types,
                kind,
            });
        }
        Ok(Self {
            cluster,
            renderer,
            specs: Arc::new(specs),
            metadata: config.global.metadata.clone(),
            job,
            uuid,
            cancel,
            requests_sent: Arc::new(AtomicU64::new(0)),
            execution_errors: Vec::new(),
            churn_start: None,
            churn_end: None,
        })
    }

    /// Drive the job to completion and build its summary.
    pub async fn run(&mut self) -> JobSummary {
        let start = Utc::now();
        info!(
            job = %self.job.name,
            job_type = ?self.job.job_type,
            iterations = self.job.job_iterations,
            qps = self.job.qps,
            burst = self.job.burst,
            "triggering job"
        );
        let fatal = match self.execute().await {
            Ok(()) => None,
            Err(err) => {
                error!(job = %self.job.name, %err, "job failed");
                Some(format!("{err:#}"))
            }
        };
        let end = Utc::now();
        let elapsed = (end - start).num_milliseconds() as f64 / 1000.0;
        let requests_sent = self.requests_sent.load(Ordering::SeqCst);
        let mut errors = std::mem::take(&mut self.execution_errors);
        let passed =
            fatal.is_none() && (!self.job.error_on_verify || errors.is_empty());
        if let Some(fatal) = fatal {
            errors.push(fatal);
        }
        let observed_qps = if elapsed > 0.0 {
            requests_sent as f64 / elapsed
        } else {
            0.0
        };
        info!(
            job = %self.job.name,
            elapsed,
            requests_sent,
            observed_qps,
            passed,
            "job finished"
        );
        JobSummary {
            timestamp: start,
            end_timestamp: end,
            elapsed_time: elapsed,
            churn_start_timestamp: self.churn_start,
            churn_end_timestamp: self.churn_end,
            uuid: self.uuid.clone(),
            metric_name: JOB_SUMMARY_METRIC.to_owned(),
            job_config: self.job.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            passed,
            execution_errors: errors.join("\n"),
            observed_qps,
            requests_sent,
            metadata: self.metadata.clone(),
        }
    }

    async fn execute(&mut self) -> Result<()> {
        match self.job.job_type {
            JobType::Create | JobType::Kubevirt => self.execute_create().await,
            JobType::Patch | JobType::Delete | JobType::Read => self.execute_mutation().await,
        }
    }

    async fn execute_create(&mut self) -> Result<()> {
        if self.job.pre_load_images {
            pre_load::pre_load(self).await?;
        }
        self.create_namespaces().await?;
        let iterations: Vec<u32> = (1..=self.job.job_iterations).collect();
        self.submit_iterations(&iterations).await?;
        if self.job.wait_when_finished {
            self.wait_for_ready(&self.target_namespaces(&iterations))
                .await?;
        }
        if self.job.verify_objects {
            self.verify_objects(&iterations).await?;
        }
        if self.job.churn {
            self.churn().await?;
        }
        if self.job.cleanup {
            self.cleanup().await?;
        }
        Ok(())
    }

    /// Patch, delete and read jobs walk the same submission machinery; the
    /// per-item operation differs inside the workers.
    async fn execute_mutation(&mut self) -> Result<()> {
        let iterations: Vec<u32> = (1..=self.job.job_iterations).collect();
        self.submit_iterations(&iterations).await
    }

    fn iteration_namespace(&self, iteration: u32) -> String {
        if self.job.namespaced_iterations {
            format!("{}-{}", self.job.namespace, iteration)
        } else {
            self.job.namespace.clone()
        }
    }

    fn target_namespaces(&self, iterations: &[u32]) -> BTreeSet<String> {
        iterations
            .iter()
            .map(|&iteration| self.iteration_namespace(iteration))
            .collect()
    }

    fn namespace_labels(&self) -> BTreeMap<String, String> {
        let mut namespace_labels = labels::managed_labels(&self.uuid, &self.job.name);
        namespace_labels.extend(self.job.namespace_labels.clone());
        namespace_labels
    }

    async fn create_namespaces(&mut self) -> Result<()> {
        let iterations: Vec<u32> = (1..=self.job.job_iterations).collect();
        for namespace in self.target_namespaces(&iterations) {
            self.cluster
                .create_namespace(
                    &namespace,
                    self.namespace_labels(),
                    self.deadline(),
                    &self.cancel,
                )
                .await?;
        }
        Ok(())
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.job.max_wait_timeout
    }

    async fn submit_iterations(&mut self, iterations: &[u32]) -> Result<()> {
        let workers = (self.job.qps.ceil() as usize).clamp(1, MAX_WORKERS);
        let ctx = Arc::new(SubmitCtx {
            cluster: self.cluster.clone(),
            renderer: self.renderer.clone(),
            specs: self.specs.clone(),
            job: self.job.clone(),
            uuid: self.uuid.clone(),
            limiter: RateLimiter::new(self.job.qps, self.job.burst),
            requests_sent: self.requests_sent.clone(),
            cancel: self.cancel.clone(),
        });
        let handler = {
            let ctx = ctx.clone();
            move |item: WorkItem| {
                let ctx = ctx.clone();
                async move { submit_one(ctx, item).await }
            }
        };
        let pool = WorkerPool::start(workers, handler, self.cancel.clone());
        'iterations: for &iteration in iterations {
            for (spec_index, loaded) in self.specs.iter().enumerate() {
                if loaded.spec.run_once && iteration != 1 {
                    continue;
                }
                for replica in 1..=loaded.spec.replicas {
                    let dispatched = pool
                        .dispatch(WorkItem {
                            iteration,
                            spec_index,
                            replica,
                        })
                        .await;
                    if !dispatched {
                        break 'iterations;
                    }
                }
            }
            if !self.job.job_iteration_delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'iterations,
                    _ = tokio::time::sleep(self.job.job_iteration_delay) => {}
                }
            }
        }
        let errors = pool.drain().await;
        if !errors.is_empty() {
            warn!(job = %self.job.name, count = errors.len(), "execution errors");
        }
        self.execution_errors.extend(errors);
        if self.cancel.is_cancelled() {
            bail!("job cancelled during submission");
        }
        Ok(())
    }

    /// Block until every waitable object of the job is ready in every given
    /// namespace, or the job's wait budget runs out (fatal).
    async fn wait_for_ready(&self, namespaces: &BTreeSet<String>) -> Result<()> {
        let deadline = self.deadline();
        let selector = labels::job_selector(&self.uuid, &self.job.name);
        for loaded in self.specs.iter() {
            if !wait::kind_is_waitable(&loaded.kind) {
                continue;
            }
            for namespace in namespaces {
                loop {
                    let objects = self
                        .cluster
                        .list(
                            &loaded.types,
                            Some(namespace.as_str()),
                            &selector,
                            deadline,
                            &self.cancel,
                        )
                        .await?;
                    let ready = objects.iter().all(|obj| {
                        wait::is_ready(&loaded.kind, &obj.data, loaded.spec.wait_options.as_ref())
                    });
                    if ready {
                        break;
                    }
                    if Instant::now() >= deadline {
                        bail!(
                            "timed out waiting for {} objects in {namespace}",
                            loaded.kind
                        );
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => bail!("cancelled waiting for readiness"),
                        _ = tokio::time::sleep(READY_POLL) => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Compare observed object counts against the expected ones.
    async fn verify_objects(&mut self, iterations: &[u32]) -> Result<()> {
        let deadline = self.deadline();
        let selector = labels::job_selector(&self.uuid, &self.job.name);
        let expected = expected_counts(&self.job, &self.specs, iterations);
        let mut mismatches = Vec::new();
        for ((namespace, kind), want) in &expected {
            let types = self
                .specs
                .iter()
                .find(|loaded| &loaded.kind == kind)
                .map(|loaded| loaded.types.clone())
                .expect("expected counts derive from specs");
            let got = self
                .cluster
                .list(
                    &types,
                    Some(namespace.as_str()),
                    &selector,
                    deadline,
                    &self.cancel,
                )
                .await?
                .len() as u64;
            if got != *want {
                warn!(
                    job = %self.job.name,
                    %namespace,
                    %kind,
                    expected = want,
                    observed = got,
                    "object count mismatch"
                );
                mismatches.push(format!(
                    "expected {want} {kind} in {namespace}, observed {got}"
                ));
            }
        }
        if !mismatches.is_empty() && self.job.error_on_verify {
            self.execution_errors.extend(mismatches);
        }
        Ok(())
    }

    async fn churn(&mut self) -> Result<()> {
        self.churn_start = Some(Utc::now());
        let result = self.churn_cycles().await;
        self.churn_end = Some(Utc::now());
        result
    }

    async fn churn_cycles(&mut self) -> Result<()> {
        for cycle in 1..=self.job.churn_cycles {
            let cycle_started = Instant::now();
            let victims = pick_victims(self.job.job_iterations, self.job.churn_percent);
            info!(job = %self.job.name, cycle, ?victims, "churn cycle");
            match self.job.churn_deletion_strategy {
                ChurnDeletionStrategy::Default => {
                    for &victim in &victims {
                        let namespace = self.iteration_namespace(victim);
                        self.cluster
                            .delete_namespace(&namespace, true, self.deadline(), &self.cancel)
                            .await?;
                    }
                }
                ChurnDeletionStrategy::Gvr => {
                    self.delete_objects_in_place(&victims).await?;
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => bail!("cancelled during churn delay"),
                _ = tokio::time::sleep(self.job.churn_delay) => {}
            }
            if self.job.churn_deletion_strategy == ChurnDeletionStrategy::Default {
                for &victim in &victims {
                    let namespace = self.iteration_namespace(victim);
                    self.cluster
                        .create_namespace(
                            &namespace,
                            self.namespace_labels(),
                            self.deadline(),
                            &self.cancel,
                        )
                        .await?;
                }
            }
            self.submit_iterations(&victims).await?;
            if self.job.wait_when_finished {
                self.wait_for_ready(&self.target_namespaces(&victims)).await?;
            }
            let elapsed = cycle_started.elapsed();
            if elapsed < self.job.churn_duration {
                tokio::select! {
                    _ = self.cancel.cancelled() => bail!("cancelled during churn cycle"),
                    _ = tokio::time::sleep(self.job.churn_duration - elapsed) => {}
                }
            }
        }
        Ok(())
    }

    /// The `gvr` churn strategy: delete the job's objects kind by kind,
    /// leaving the namespaces in place.
    async fn delete_objects_in_place(&self, victims: &[u32]) -> Result<()> {
        let deadline = self.deadline();
        let selector = labels::job_selector(&self.uuid, &self.job.name);
        for &victim in victims {
            let namespace = self.iteration_namespace(victim);
            for loaded in self.specs.iter() {
                let objects = self
                    .cluster
                    .list(
                        &loaded.types,
                        Some(namespace.as_str()),
                        &selector,
                        deadline,
                        &self.cancel,
                    )
                    .await?;
                for object in objects {
                    self.cluster
                        .delete(
                            &object,
                            Some(namespace.as_str()),
                            Some(0),
                            deadline,
                            &self.cancel,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let selector = labels::job_selector(&self.uuid, &self.job.name);
        let deadline = self.deadline();
        let namespaces = self
            .cluster
            .list_namespaces(&selector, deadline, &self.cancel)
            .await?;
        info!(job = %self.job.name, count = namespaces.len(), "cleaning up namespaces");
        for namespace in &namespaces {
            let Some(name) = namespace.metadata.name.as_deref() else {
                continue;
            };
            self.cluster
                .delete_namespace(name, true, deadline, &self.cancel)
                .await?;
        }
        Ok(())
    }
}

async fn submit_one(ctx: Arc<SubmitCtx>, item: WorkItem) -> Result<(), String> {
    ctx.limiter
        .acquire(&ctx.cancel)
        .await
        .map_err(|err| err.to_string())?;
    let loaded = &ctx.specs[item.spec_index];
    let namespace = loaded
        .spec
        .namespace
        .clone()
        .unwrap_or_else(|| match ctx.job.namespaced_iterations {
            true => format!("{}-{}", ctx.job.namespace, item.iteration),
            false => ctx.job.namespace.clone(),
        });
    let data = render_data(&loaded.spec, &ctx.job.name, &ctx.uuid, item.iteration, item.replica);
    let rendered = ctx
        .renderer
        .render(&loaded.template, &data)
        .map_err(|err| err.to_string())?;
    let mut obj = parse_manifest(&rendered)?;
    stamp_labels(&mut obj, &ctx.uuid, &ctx.job.name);

    let deadline = Instant::now() + ctx.job.max_wait_timeout;
    ctx.requests_sent.fetch_add(1, Ordering::SeqCst);
    let outcome = match ctx.job.job_type {
        JobType::Create | JobType::Kubevirt => ctx
            .cluster
            .create(&obj, Some(namespace.as_str()), deadline, &ctx.cancel)
            .await
            .map(|_| ()),
        JobType::Patch => ctx
            .cluster
            .patch(&obj, Some(namespace.as_str()), deadline, &ctx.cancel)
            .await
            .map(|_| ()),
        JobType::Delete => ctx
            .cluster
            .delete(&obj, Some(namespace.as_str()), None, deadline, &ctx.cancel)
            .await,
        JobType::Read => ctx
            .cluster
            .get(&obj, Some(namespace.as_str()), deadline, &ctx.cancel)
            .await
            .map(|_| ()),
    };
    match outcome {
        Ok(()) => {}
        Err(ApiError::AlreadyExists { kind, name }) if loaded.spec.run_once => {
            warn!(%kind, %name, "already exists");
        }
        Err(ApiError::Cancelled) => return Err("cancelled".to_owned()),
        Err(err) => return Err(err.to_string()),
    }

    if ctx.job.pod_wait && loaded.kind == "Pod" && matches!(ctx.job.job_type, JobType::Create) {
        let deadline = Instant::now() + ctx.job.max_wait_timeout;
        loop {
            let current = ctx
                .cluster
                .get(&obj, Some(namespace.as_str()), deadline, &ctx.cancel)
                .await
                .map_err(|err| err.to_string())?;
            if wait::is_ready("Pod", &current.data, loaded.spec.wait_options.as_ref()) {
                break;
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "timed out waiting for pod {}/{}",
                    namespace,
                    obj.metadata.name.as_deref().unwrap_or_default()
                ));
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err("cancelled".to_owned()),
                _ = tokio::time::sleep(READY_POLL) => {}
            }
        }
    }
    Ok(())
}

fn render_data(
    spec: &ObjectSpec,
    job_name: &str,
    uuid: &str,
    iteration: u32,
    replica: u32,
) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, value) in &spec.input_vars {
        map.insert(key.clone(), value.clone());
    }
    map.insert("Iteration".to_owned(), iteration.into());
    map.insert("Replica".to_owned(), replica.into());
    map.insert("JobName".to_owned(), job_name.into());
    map.insert("UUID".to_owned(), uuid.into());
    map.insert("RunID".to_owned(), uuid.into());
    serde_json::Value::Object(map)
}

fn parse_manifest(rendered: &str) -> Result<DynamicObject, String> {
    let value: serde_json::Value = serde_yaml::from_str(rendered)
        .map_err(|err| format!("manifest is not valid YAML: {err}"))?;
    serde_json::from_value(value).map_err(|err| format!("manifest is not an object: {err}"))
}

fn stamp_labels(obj: &mut DynamicObject, uuid: &str, job_name: &str) {
    let stamped = obj.metadata.labels.get_or_insert_with(Default::default);
    for (key, value) in labels::managed_labels(uuid, job_name) {
        stamped.insert(key, value);
    }
}

/// Pick `churn_percent` percent of the iterations, at least one, without
/// repetition.
fn pick_victims(iterations: u32, churn_percent: u32) -> Vec<u32> {
    let count = ((iterations as u64 * churn_percent as u64) / 100).max(1) as usize;
    let count = count.min(iterations as usize);
    let mut rng = rand::thread_rng();
    let mut victims: Vec<u32> = sample(&mut rng, iterations as usize, count)
        .into_iter()
        .map(|index| index as u32 + 1)
        .collect();
    victims.sort_unstable();
    victims
}

/// Expected object count per (namespace, kind) after one full submission
/// pass over `iterations`.
fn expected_counts(
    job: &Job,
    specs: &[LoadedSpec],
    iterations: &[u32],
) -> BTreeMap<(String, String), u64> {
    let mut expected = BTreeMap::new();
    for &iteration in iterations {
        for loaded in specs {
            if loaded.spec.run_once && iteration != 1 {
                continue;
            }
            let namespace = loaded.spec.namespace.clone().unwrap_or_else(|| {
                if job.namespaced_iterations {
                    format!("{}-{}", job.namespace, iteration)
                } else {
                    job.namespace.clone()
                }
            });
            *expected
                .entry((namespace, loaded.kind.clone()))
                .or_insert(0u64) += u64::from(loaded.spec.replicas);
        }
    }
    expected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(kind: &str, replicas: u32, run_once: bool) -> LoadedSpec {
        LoadedSpec {
            spec: ObjectSpec {
                object_template: format!("{kind}.yaml"),
                replicas,
                run_once,
                ..Default::default()
            },
            template: String::new(),
            types: TypeMeta {
                api_version: "v1".to_owned(),
                kind: kind.to_owned(),
            },
            kind: kind.to_owned(),
        }
    }

    #[test]
    fn victims_are_distinct_and_within_range() {
        for _ in 0..50 {
            let victims = pick_victims(10, 20);
            assert_eq!(victims.len(), 2);
            let unique: BTreeSet<u32> = victims.iter().copied().collect();
            assert_eq!(unique.len(), 2);
            assert!(victims.iter().all(|v| (1..=10).contains(v)));
        }
    }

    #[test]
    fn at_least_one_victim_even_for_tiny_jobs() {
        assert_eq!(pick_victims(1, 10).len(), 1);
        assert_eq!(pick_victims(3, 1).len(), 1);
    }

    #[test]
    fn expected_counts_respect_run_once_and_namespacing() {
        let job = Job {
            name: "accounting".to_owned(),
            namespace: "kiln".to_owned(),
            job_iterations: 2,
            ..Default::default()
        };
        let specs = vec![
            loaded("Deployment", 1, false),
            loaded("Pod", 1, false),
            loaded("Service", 1, false),
            loaded("Secret", 1, true),
        ];
        let expected = expected_counts(&job, &specs, &[1, 2]);
        // 2 namespaces, 3 kinds each, plus the run-once secret in the first.
        assert_eq!(expected.len(), 7);
        assert_eq!(expected[&("kiln-1".to_owned(), "Secret".to_owned())], 1);
        assert_eq!(expected.get(&("kiln-2".to_owned(), "Secret".to_owned())), None);
        let total: u64 = expected.values().sum();
        assert_eq!(total, job.expected_requests());
    }

    #[test]
    fn expected_counts_in_a_single_namespace() {
        let job = Job {
            name: "flat".to_owned(),
            namespace: "kiln".to_owned(),
            namespaced_iterations: false,
            job_iterations: 3,
            ..Default::default()
        };
        let specs = vec![loaded("ConfigMap", 2, false)];
        let expected = expected_counts(&job, &specs, &[1, 2, 3]);
        assert_eq!(expected.len(), 1);
        assert_eq!(expected[&("kiln".to_owned(), "ConfigMap".to_owned())], 6);
    }

    #[test]
    fn setup_failures_produce_a_failed_summary() {
        let job = Job {
            name: "broken".to_owned(),
            ..Default::default()
        };
        let summary = setup_failure_summary(
            &job,
            "run-uuid",
            &Config::default(),
            &anyhow!("rendering template deployment.yaml: missing template variable: UNSET"),
        );
        assert!(!summary.passed);
        assert_eq!(summary.requests_sent, 0);
        assert_eq!(summary.uuid, "run-uuid");
        assert_eq!(summary.metric_name, JOB_SUMMARY_METRIC);
        assert!(summary.execution_errors.contains("missing template variable"));
    }

    #[test]
    fn manifests_are_stamped_with_run_labels() {
        let mut obj = parse_manifest(
            "apiVersion: v1\nkind: Pod\nmetadata:\n  name: perf-1\n  labels:\n    app: perf\n",
        )
        .unwrap();
        stamp_labels(&mut obj, "run-uuid", "api-intensive");
        let stamped = obj.metadata.labels.as_ref().unwrap();
        assert_eq!(stamped["kiln-runid"], "run-uuid");
        assert_eq!(stamped["kiln-job"], "api-intensive");
        assert_eq!(stamped["app"], "perf");
    }

    #[test]
    fn render_data_exposes_loop_variables_and_input_vars() {
        let spec = ObjectSpec {
            input_vars: [("image".to_owned(), serde_json::json!("nginx:1.25"))]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let data = render_data(&spec, "api-intensive", "run-uuid", 4, 2);
        assert_eq!(data["Iteration"], 4);
        assert_eq!(data["Replica"], 2);
        assert_eq!(data["JobName"], "api-intensive");
        assert_eq!(data["UUID"], "run-uuid");
        assert_eq!(data["image"], "nginx:1.25");
    }

    #[test]
    fn pod_wait_options_prefer_pod_scoped_predicates() {
        let mut job = Job {
            name: "waits".to_owned(),
            ..Default::default()
        };
        job.objects = vec![
            ObjectSpec {
                wait_options: Some(WaitOptions {
                    kind: Some("Deployment".to_owned()),
                    status_path: "status.readyReplicas".to_owned(),
                    expected_value: "1".to_owned(),
                }),
                ..Default::default()
            },
            ObjectSpec {
                wait_options: Some(WaitOptions {
                    kind: None,
                    status_path: "status.phase".to_owned(),
                    expected_value: "Running".to_owned(),
                }),
                ..Default::default()
            },
        ];
        let opts = pod_wait_options(&job).unwrap();
        assert_eq!(opts.status_path, "status.phase");
    }
}
