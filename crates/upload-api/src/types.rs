//! Core types for the upload service.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a deployment job.
///
/// IDs order by their sequence number, so `dep-1000000` sorts after
/// `dep-999999`. IDs without a numeric suffix sort first, by text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a job ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Render the ID for a sequence number.
    #[must_use]
    pub fn from_sequence(n: u64) -> Self {
        Self(format!("dep-{n:06}"))
    }

    /// Return the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sequence number the ID was issued for, if it has the `dep-N` form.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.0.strip_prefix("dep-")?.parse().ok()
    }
}

impl Ord for JobId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence()
            .cmp(&other.sequence())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for JobId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Current status of a deployment job.
///
/// Jobs only move forward through these states; `Ready` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Bundle accepted and extracted, pipeline not yet started.
    PendingUploadValidation,
    /// The build/deploy executable is running.
    BuildInProgress,
    /// Build finished, waiting for the deployed revision.
    DeployInProgress,
    /// Deployed successfully.
    Ready,
    /// Build or deploy failed.
    Failed,
}

impl JobStatus {
    /// Check if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::PendingUploadValidation => 0,
            Self::BuildInProgress => 1,
            Self::DeployInProgress => 2,
            Self::Ready | Self::Failed => 3,
        }
    }

    /// Check whether moving from `self` to `next` is a forward transition.
    ///
    /// `Ready` is only reachable once deployment has started; `Failed` is
    /// reachable from any non-terminal state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Ready => matches!(self, Self::DeployInProgress),
            Self::Failed => true,
            _ => next.rank() > self.rank(),
        }
    }

    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingUploadValidation => "PENDING_UPLOAD_VALIDATION",
            Self::BuildInProgress => "BUILD_IN_PROGRESS",
            Self::DeployInProgress => "DEPLOY_IN_PROGRESS",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deployment attempt, from accepted upload to build/deploy outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentJob {
    /// Unique job identifier.
    pub id: JobId,
    /// Sanitised service name.
    pub service_name: String,
    /// Sanitised namespace.
    pub namespace: String,
    /// Location of the uploaded bundle.
    pub bundle_path: PathBuf,
    /// Directory holding the extracted sources.
    pub extracted_path: PathBuf,
    /// Current status.
    pub status: JobStatus,
    /// Deployed revision, set once the job is ready.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    /// Command for tailing the service's runtime logs.
    pub logs_hint: String,
    /// Failure detail, set only when the job failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Combined output of the build/deploy executable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl DeploymentJob {
    /// Create a job in `PENDING_UPLOAD_VALIDATION` for an extracted bundle.
    #[must_use]
    pub fn new(
        id: JobId,
        service_name: impl Into<String>,
        namespace: impl Into<String>,
        bundle_path: impl Into<PathBuf>,
        extracted_path: impl Into<PathBuf>,
    ) -> Self {
        let service_name = service_name.into();
        let namespace = namespace.into();
        let now = Utc::now();
        Self {
            logs_hint: logs_hint(&service_name, &namespace),
            id,
            service_name,
            namespace,
            bundle_path: bundle_path.into(),
            extracted_path: extracted_path.into(),
            status: JobStatus::PendingUploadValidation,
            revision: String::new(),
            error: String::new(),
            output: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Hint for locating the runtime logs of a deployed service.
#[must_use]
pub fn logs_hint(service: &str, namespace: &str) -> String {
    format!("kubectl logs -n {namespace} -l serving.knative.dev/service={service} --tail=100")
}
