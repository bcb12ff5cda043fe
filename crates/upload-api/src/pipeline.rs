//! Asynchronous build/deploy pipeline.
//!
//! Each accepted job gets its own task that drives it through
//! `BUILD_IN_PROGRESS`, `DEPLOY_IN_PROGRESS` and finally `READY` or
//! `FAILED`. Tasks are never cancelled and never retried.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::error::{DeployError, DeployResult};
use crate::store::JobStore;
use crate::types::{DeploymentJob, JobId, JobStatus};

/// Output recorded by mock mode at each step.
pub const MOCK_OUTPUT: &str = "mock deploy executed";

/// Revision reported by mock mode.
pub const MOCK_REVISION: &str = "mock-revision-00001";

/// Everything the build/deploy executable needs to know about a job.
#[derive(Debug, Clone)]
pub struct BuildInvocation {
    /// Directory holding the extracted sources.
    pub app_dir: PathBuf,
    /// Service to deploy.
    pub service_name: String,
    /// Target namespace.
    pub namespace: String,
    /// Job identifier.
    pub job_id: JobId,
    /// Tag for the built image.
    pub image_tag: String,
}

impl BuildInvocation {
    /// Describe the build for a job; the image is tagged with the job ID.
    #[must_use]
    pub fn for_job(job: &DeploymentJob) -> Self {
        Self {
            app_dir: job.extracted_path.clone(),
            service_name: job.service_name.clone(),
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            image_tag: job.id.to_string(),
        }
    }

    /// Environment passed to the build/deploy executable.
    #[must_use]
    pub fn env(&self) -> [(&'static str, String); 5] {
        [
            ("APP_DIR", self.app_dir.display().to_string()),
            ("SERVICE_NAME", self.service_name.clone()),
            ("NAMESPACE", self.namespace.clone()),
            ("DEPLOYMENT_ID", self.job_id.to_string()),
            ("IMAGE_TAG", self.image_tag.clone()),
        ]
    }
}

/// Result of running the build/deploy executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// Exit code; `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    /// Interleaved stdout and stderr.
    pub output: String,
}

impl RunOutput {
    /// Whether the executable exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs the external build/deploy step for a job.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Run the build and capture its combined output.
    ///
    /// `Err` means the build could not be started at all.
    async fn run(&self, invocation: &BuildInvocation) -> DeployResult<RunOutput>;
}

/// Lists deployed revisions of a service.
#[async_trait]
pub trait RevisionLookup: Send + Sync {
    /// Return revision names, one per line, in no particular order.
    async fn list(&self, service: &str, namespace: &str) -> DeployResult<String>;
}

/// Runs a build/deploy script as a subprocess.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    program: PathBuf,
}

impl ScriptRunner {
    /// Create a runner for the given executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Path of the executable.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl BuildRunner for ScriptRunner {
    async fn run(&self, invocation: &BuildInvocation) -> DeployResult<RunOutput> {
        let mut child = Command::new(&self.program)
            .envs(invocation.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DeployError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Both streams feed one channel so output keeps its arrival order.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout = child.stdout.take().map(|s| forward(s, tx.clone()));
        let stderr = child.stderr.take().map(|s| forward(s, tx));

        let mut combined = Vec::new();
        while let Some(chunk) = rx.recv().await {
            combined.extend_from_slice(&chunk);
        }
        for reader in [stdout, stderr].into_iter().flatten() {
            reader.await.ok();
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DeployError::Internal(format!("failed to wait for build: {e}")))?;

        Ok(RunOutput {
            exit_code: status.code(),
            output: String::from_utf8_lossy(&combined).into_owned(),
        })
    }
}

fn forward<R>(mut stream: R, tx: mpsc::UnboundedSender<Vec<u8>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Looks up Knative revisions through `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlRevisions {
    program: PathBuf,
}

impl KubectlRevisions {
    /// Create a lookup using the given `kubectl`-compatible command.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl RevisionLookup for KubectlRevisions {
    async fn list(&self, service: &str, namespace: &str) -> DeployResult<String> {
        let output = Command::new(&self.program)
            .args(["get", "revision", "-n", namespace, "-l"])
            .arg(format!("serving.knative.dev/service={service}"))
            .args(["-o", "jsonpath={range .items[*]}{.metadata.name}{\"\\n\"}{end}"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeployError::RevisionLookup(e.to_string()))?;

        if !output.status.success() {
            return Err(DeployError::RevisionLookup(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Pick the lexicographically greatest revision name from lookup output.
///
/// Blank lines are ignored; no revisions yields an empty string.
#[must_use]
pub fn latest_revision(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .max()
        .unwrap_or_default()
        .to_owned()
}

/// How the pipeline performs builds.
#[derive(Clone)]
pub enum PipelineMode {
    /// Simulate build and deploy with fixed delays.
    Mock {
        /// Delay before each simulated step.
        step_delay: Duration,
    },
    /// Run the external build/deploy executable.
    Real {
        /// Build/deploy backend.
        runner: Arc<dyn BuildRunner>,
        /// Revision lookup backend.
        revisions: Arc<dyn RevisionLookup>,
    },
}

impl std::fmt::Debug for PipelineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mock { step_delay } => f
                .debug_struct("Mock")
                .field("step_delay", step_delay)
                .finish(),
            Self::Real { .. } => f.debug_struct("Real").finish_non_exhaustive(),
        }
    }
}

/// Launches and drives one task per accepted job.
#[derive(Debug)]
pub struct Pipeline {
    store: Arc<JobStore>,
    mode: PipelineMode,
    tasks: TaskTracker,
}

impl Pipeline {
    /// Create a pipeline writing job progress into `store`.
    #[must_use]
    pub fn new(store: Arc<JobStore>, mode: PipelineMode) -> Self {
        Self {
            store,
            mode,
            tasks: TaskTracker::new(),
        }
    }

    /// Spawn the pipeline task for a job and return immediately.
    pub fn launch(self: &Arc<Self>, id: JobId) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        self.tasks.spawn(async move { pipeline.run(id).await })
    }

    /// Number of pipeline tasks still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every launched task to finish. No new tasks are accepted
    /// afterwards.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Drive a job to a terminal state.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn run(&self, id: JobId) {
        let Some(job) = self.store.get(&id) else {
            warn!("job disappeared before its pipeline started");
            return;
        };

        self.store.update(&id, JobStatus::BuildInProgress, "", "");
        debug!("build started");

        match &self.mode {
            PipelineMode::Mock { step_delay } => self.run_mock(&id, *step_delay).await,
            PipelineMode::Real { runner, revisions } => {
                self.run_real(&job, runner.as_ref(), revisions.as_ref()).await;
            }
        }
    }

    async fn run_mock(&self, id: &JobId, step_delay: Duration) {
        tokio::time::sleep(step_delay).await;
        self.store
            .update(id, JobStatus::DeployInProgress, MOCK_OUTPUT, "");
        tokio::time::sleep(step_delay).await;
        self.store.mark_ready(id, MOCK_OUTPUT, MOCK_REVISION);
        info!(revision = MOCK_REVISION, "mock deployment ready");
    }

    async fn run_real(
        &self,
        job: &DeploymentJob,
        runner: &dyn BuildRunner,
        revisions: &dyn RevisionLookup,
    ) {
        let invocation = BuildInvocation::for_job(job);
        let run = match runner.run(&invocation).await {
            Ok(run) => run,
            Err(err) => {
                self.fail(&job.id, "", &err);
                return;
            }
        };
        if !run.success() {
            let err = DeployError::BuildFailed {
                exit_code: run.exit_code,
            };
            self.fail(&job.id, &run.output, &err);
            return;
        }
        let output = run.output;

        self.store
            .update(&job.id, JobStatus::DeployInProgress, &output, "");

        let revision = match revisions.list(&job.service_name, &job.namespace).await {
            Ok(listing) => latest_revision(&listing),
            Err(e) => {
                debug!(error = %e, "revision lookup failed, leaving revision empty");
                String::new()
            }
        };

        self.store.mark_ready(&job.id, &output, &revision);
        info!(revision = %revision, "deployment ready");
    }

    fn fail(&self, id: &JobId, output: &str, err: &DeployError) {
        warn!(error = %err, "build/deploy failed");
        self.store
            .update(id, JobStatus::Failed, output, &err.to_string());
    }
}
