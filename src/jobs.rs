use crate::config::Settings;
use crate::enhancer::{self, Enhancer};
use crate::optimizer::{self, Optimizer};
use crate::paths::AppPaths;
use crate::sessions::{self, ScanStore};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;
const RUNNER_IDLE_POLL_MS: u64 = 250;

/// Per-job lifecycle: `Pending -> Processing -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub image_id: String,
    pub batch_id: Option<String>,
    pub scale: u32,
    pub status: JobStatus,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub original_size: Option<u64>,
    pub optimized_size: Option<u64>,
    pub size_reduction_percent: Option<f64>,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
}

/// Jobs are keyed by the image they enhance: re-enhancing an image reuses
/// (and overwrites) its job slot.
pub fn job_id_for_image(image_id: &str) -> String {
    format!("job_{image_id}")
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub output_path: PathBuf,
    pub original_size: u64,
    pub optimized_size: u64,
    pub size_reduction_percent: f64,
}

/// Job storage seam. Transition methods enforce the state machine: `claim`
/// applies only to Pending jobs, `complete`/`fail` only to Processing ones;
/// an inapplicable transition returns `false` and changes nothing.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: JobRecord) -> Result<()>;
    fn get(&self, job_id: &str) -> Result<Option<JobRecord>>;
    fn list(&self) -> Result<Vec<JobRecord>>;
    fn claim(&self, job_id: &str) -> Result<bool>;
    fn complete(&self, job_id: &str, outcome: JobOutcome) -> Result<bool>;
    fn fail(&self, job_id: &str, error: &str) -> Result<bool>;
    fn clear(&self) -> Result<usize>;
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, job: JobRecord) -> Result<()> {
        let mut inner = self.inner.lock().expect("job store lock poisoned");
        inner.insert(job.id.clone(), job);
        Ok(())
    }

    fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let inner = self.inner.lock().expect("job store lock poisoned");
        Ok(inner.get(job_id).cloned())
    }

    fn list(&self) -> Result<Vec<JobRecord>> {
        let inner = self.inner.lock().expect("job store lock poisoned");
        let mut jobs: Vec<JobRecord> = inner.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        Ok(jobs)
    }

    fn claim(&self, job_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().expect("job store lock poisoned");
        let Some(job) = inner.get_mut(job_id) else {
            return Ok(false);
        };
        if !job.status.can_transition_to(JobStatus::Processing) {
            return Ok(false);
        }
        job.status = JobStatus::Processing;
        job.started_at_ms = Some(now_ms());
        Ok(true)
    }

    fn complete(&self, job_id: &str, outcome: JobOutcome) -> Result<bool> {
        let mut inner = self.inner.lock().expect("job store lock poisoned");
        let Some(job) = inner.get_mut(job_id) else {
            return Ok(false);
        };
        if !job.status.can_transition_to(JobStatus::Completed) {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.error = None;
        job.output_path = Some(outcome.output_path);
        job.original_size = Some(outcome.original_size);
        job.optimized_size = Some(outcome.optimized_size);
        job.size_reduction_percent = Some(outcome.size_reduction_percent);
        job.finished_at_ms = Some(now_ms());
        Ok(true)
    }

    fn fail(&self, job_id: &str, error: &str) -> Result<bool> {
        let mut inner = self.inner.lock().expect("job store lock poisoned");
        let Some(job) = inner.get_mut(job_id) else {
            return Ok(false);
        };
        if !job.status.can_transition_to(JobStatus::Failed) {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.finished_at_ms = Some(now_ms());
        Ok(true)
    }

    fn clear(&self) -> Result<usize> {
        let mut inner = self.inner.lock().expect("job store lock poisoned");
        let removed = inner.len();
        inner.clear();
        Ok(removed)
    }
}

/// Enqueues enhancement of a single downloaded image. Enqueueing is
/// idempotent while a job for the image is still in flight.
pub fn enqueue_enhance_image(
    scan_store: &dyn ScanStore,
    job_store: &dyn JobStore,
    image_id: &str,
    scale: u32,
) -> Result<JobRecord> {
    enqueue_with_batch(scan_store, job_store, image_id, scale, None)
}

/// Enqueues enhancement of every downloaded image in a scan under a shared
/// batch id.
pub fn enqueue_enhance_batch(
    scan_store: &dyn ScanStore,
    job_store: &dyn JobStore,
    scan_id: &str,
    scale: u32,
) -> Result<Vec<JobRecord>> {
    let session = scan_store
        .get(scan_id)?
        .ok_or_else(|| EngineError::NotFound(format!("scan {scan_id}")))?;

    let batch_id = Uuid::new_v4().to_string();
    let mut jobs = Vec::new();
    for image in &session.images {
        if image.local_path.is_none() {
            continue;
        }
        jobs.push(enqueue_with_batch(
            scan_store,
            job_store,
            &image.id,
            scale,
            Some(batch_id.clone()),
        )?);
    }
    Ok(jobs)
}

fn enqueue_with_batch(
    scan_store: &dyn ScanStore,
    job_store: &dyn JobStore,
    image_id: &str,
    scale: u32,
    batch_id: Option<String>,
) -> Result<JobRecord> {
    let image = sessions::find_image(scan_store, image_id)?
        .ok_or_else(|| EngineError::NotFound(format!("image {image_id}")))?;
    if image.local_path.is_none() {
        return Err(EngineError::NotFound(format!(
            "image {image_id} has not been downloaded"
        )));
    }

    let job_id = job_id_for_image(image_id);
    if let Some(existing) = job_store.get(&job_id)? {
        if !existing.status.is_terminal() {
            return Ok(existing);
        }
    }

    let job = JobRecord {
        id: job_id,
        image_id: image_id.to_string(),
        batch_id,
        scale,
        status: JobStatus::Pending,
        error: None,
        output_path: None,
        original_size: None,
        optimized_size: None,
        size_reduction_percent: None,
        created_at_ms: now_ms(),
        started_at_ms: None,
        finished_at_ms: None,
    };
    job_store.insert(job.clone())?;
    Ok(job)
}

/// Pure lookup; an unknown id is `None`, never a failure.
pub fn get_job(job_store: &dyn JobStore, job_id: &str) -> Result<Option<JobRecord>> {
    job_store.get(job_id)
}

pub fn list_jobs(job_store: &dyn JobStore) -> Result<Vec<JobRecord>> {
    job_store.list()
}

#[derive(Clone)]
pub struct JobRunnerHandle {
    stop: Arc<AtomicBool>,
}

impl JobRunnerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Starts the background runner: polls for Pending jobs, claims them, and
/// executes each on a worker thread with bounded concurrency. The triggering
/// caller returns immediately; completion is observed via `get_job`.
pub fn start_runner(
    paths: AppPaths,
    settings: Settings,
    scan_store: Arc<dyn ScanStore>,
    job_store: Arc<dyn JobStore>,
) -> Result<JobRunnerHandle> {
    paths.ensure_dirs()?;
    let enhancer: Arc<dyn Enhancer> = Arc::from(enhancer::from_settings(&paths, &settings)?);
    let optimizer = Optimizer::from_settings(&settings);

    let stop = Arc::new(AtomicBool::new(false));
    let running = Arc::new(AtomicUsize::new(0));

    let stop_thread = stop.clone();
    thread::spawn(move || {
        runner_loop(
            paths,
            enhancer,
            optimizer,
            scan_store,
            job_store,
            stop_thread,
            running,
        )
    });

    Ok(JobRunnerHandle { stop })
}

fn runner_loop(
    paths: AppPaths,
    enhancer: Arc<dyn Enhancer>,
    optimizer: Optimizer,
    scan_store: Arc<dyn ScanStore>,
    job_store: Arc<dyn JobStore>,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicUsize>,
) {
    while !stop.load(Ordering::SeqCst) {
        let available = DEFAULT_MAX_CONCURRENT_JOBS.saturating_sub(running.load(Ordering::SeqCst));
        if available == 0 {
            thread::sleep(Duration::from_millis(RUNNER_IDLE_POLL_MS));
            continue;
        }

        let pending: Vec<JobRecord> = match job_store.list() {
            Ok(jobs) => jobs
                .into_iter()
                .filter(|job| job.status == JobStatus::Pending)
                .take(available)
                .collect(),
            Err(_) => {
                thread::sleep(Duration::from_millis(RUNNER_IDLE_POLL_MS));
                continue;
            }
        };

        if pending.is_empty() {
            thread::sleep(Duration::from_millis(RUNNER_IDLE_POLL_MS));
            continue;
        }

        for job in pending {
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let claimed = job_store.claim(&job.id).unwrap_or(false);
            if !claimed {
                continue;
            }

            running.fetch_add(1, Ordering::SeqCst);
            let paths_worker = paths.clone();
            let enhancer_worker = enhancer.clone();
            let optimizer_worker = optimizer.clone();
            let scan_store_worker = scan_store.clone();
            let job_store_worker = job_store.clone();
            let running_worker = running.clone();
            thread::spawn(move || {
                let outcome = execute_job(
                    &paths_worker,
                    enhancer_worker.as_ref(),
                    &optimizer_worker,
                    scan_store_worker.as_ref(),
                    job_store_worker.as_ref(),
                    &job,
                );
                if let Err(e) = outcome {
                    let _ = job_store_worker.fail(&job.id, &e.to_string());
                    let _ = log_line(
                        &paths_worker,
                        &job.id,
                        "error",
                        "job_failed",
                        serde_json::json!({ "error": e.to_string() }),
                    );
                }
                running_worker.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }
}

fn execute_job(
    paths: &AppPaths,
    enhancer: &dyn Enhancer,
    optimizer: &Optimizer,
    scan_store: &dyn ScanStore,
    job_store: &dyn JobStore,
    job: &JobRecord,
) -> Result<()> {
    log_line(
        paths,
        &job.id,
        "info",
        "job_started",
        serde_json::json!({ "image_id": job.image_id, "scale": job.scale }),
    )?;

    let image = sessions::find_image(scan_store, &job.image_id)?
        .ok_or_else(|| EngineError::NotFound(format!("image {}", job.image_id)))?;
    let local_path = image.local_path.ok_or_else(|| {
        EngineError::NotFound(format!("image {} has no local copy", job.image_id))
    })?;

    let enhanced = enhancer.enhance(&local_path, job.scale)?;
    let result = optimizer.optimize_bytes(
        paths,
        &enhanced,
        &optimizer::enhanced_output_name(&job.image_id),
    )?;

    let reduction = result.size_reduction_percent();
    job_store.complete(
        &job.id,
        JobOutcome {
            output_path: result.output_path.clone(),
            original_size: result.original_size,
            optimized_size: result.optimized_size,
            size_reduction_percent: reduction,
        },
    )?;

    log_line(
        paths,
        &job.id,
        "info",
        "job_completed",
        serde_json::json!({
            "output_path": result.output_path.to_string_lossy().to_string(),
            "size_reduction_percent": reduction,
        }),
    )?;
    Ok(())
}

fn log_line(
    paths: &AppPaths,
    job_id: &str,
    level: &str,
    event: &str,
    data: serde_json::Value,
) -> Result<()> {
    let line = serde_json::json!({
        "ts_ms": now_ms(),
        "job_id": job_id,
        "level": level,
        "event": event,
        "data": data
    })
    .to_string();

    let path = paths.job_logs_dir().join(format!("{job_id}.jsonl"));
    std::fs::create_dir_all(paths.job_logs_dir())?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(format!("{line}\n").as_bytes())?;
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
