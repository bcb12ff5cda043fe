//! Bundle receiving: upload validation, persistence and job creation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument};

use crate::error::{DeployError, DeployResult};
use crate::extract;
use crate::store::JobStore;
use crate::types::DeploymentJob;

/// Default service name when the form leaves `service` empty.
pub const DEFAULT_SERVICE: &str = "uploaded-app";

/// Default namespace when the form leaves `namespace` empty.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Fallback used when sanitising leaves nothing behind.
pub const FALLBACK_NAME: &str = "default-name";

/// Maximum length of a sanitised identifier.
pub const MAX_NAME_LEN: usize = 63;

const SUPPORTED_SUFFIXES: [&str; 4] = [".zip", ".tar", ".tar.gz", ".tgz"];

/// Subdirectory of a job's work directory that receives extracted sources.
const EXTRACT_DIR: &str = "src";

/// A validated multipart upload, ready to be persisted.
#[derive(Debug, Clone)]
pub struct BundleUpload {
    /// Raw `service` form value.
    pub service: Option<String>,
    /// Raw `namespace` form value.
    pub namespace: Option<String>,
    /// Client-supplied bundle filename.
    pub file_name: String,
    /// Bundle contents.
    pub bytes: Vec<u8>,
}

/// Check whether a filename carries a supported archive extension.
#[must_use]
pub fn is_supported_bundle(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SUPPORTED_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// Normalise user input into a lowercase DNS-label style identifier.
///
/// The result matches `[a-z0-9-]{1,63}` without leading or trailing hyphens,
/// or is [`FALLBACK_NAME`]. Applying it twice yields the same value.
#[must_use]
pub fn sanitize_name(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '_' | '.' | ' ' => '-',
            c => c,
        })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();

    let trimmed = mapped.trim_matches('-');
    // Only ASCII remains, so byte truncation is safe.
    let truncated = &trimmed[..trimmed.len().min(MAX_NAME_LEN)];
    let result = truncated.trim_matches('-');

    if result.is_empty() {
        FALLBACK_NAME.to_owned()
    } else {
        result.to_owned()
    }
}

/// Sanitised service name, defaulting to [`DEFAULT_SERVICE`].
#[must_use]
pub fn service_name(raw: Option<&str>) -> String {
    name_or_default(raw, DEFAULT_SERVICE)
}

/// Sanitised namespace, defaulting to [`DEFAULT_NAMESPACE`].
#[must_use]
pub fn namespace(raw: Option<&str>) -> String {
    name_or_default(raw, DEFAULT_NAMESPACE)
}

fn name_or_default(raw: Option<&str>, default: &str) -> String {
    match raw {
        Some(value) if !value.is_empty() => sanitize_name(value),
        _ => default.to_owned(),
    }
}

/// Base name of a client-supplied filename, with any directory part dropped.
#[must_use]
pub fn bundle_file_name(raw: &str) -> Option<&str> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    match base {
        "" | "." | ".." => None,
        base => Some(base),
    }
}

/// Accepts uploads, unpacks them and registers the resulting jobs.
#[derive(Debug, Clone)]
pub struct BundleReceiver {
    upload_root: PathBuf,
    max_upload_bytes: usize,
    store: Arc<JobStore>,
}

impl BundleReceiver {
    /// Create a receiver writing work directories under `upload_root`.
    pub fn new(upload_root: impl Into<PathBuf>, max_upload_bytes: usize, store: Arc<JobStore>) -> Self {
        Self {
            upload_root: upload_root.into(),
            max_upload_bytes,
            store,
        }
    }

    /// Root directory for per-job work directories.
    #[must_use]
    pub fn upload_root(&self) -> &Path {
        &self.upload_root
    }

    /// Upload ceiling in bytes.
    #[must_use]
    pub const fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Persist and extract an upload, then register a pending job.
    ///
    /// No job is created unless extraction succeeds.
    #[instrument(skip(self, upload), fields(file = %upload.file_name, size = upload.bytes.len()))]
    pub async fn accept(&self, upload: BundleUpload) -> DeployResult<DeploymentJob> {
        if upload.bytes.len() > self.max_upload_bytes {
            return Err(DeployError::PayloadTooLarge {
                limit: self.max_upload_bytes,
            });
        }
        if !is_supported_bundle(&upload.file_name) {
            return Err(DeployError::UnsupportedBundle);
        }
        let file_name = bundle_file_name(&upload.file_name).ok_or(DeployError::UnsupportedBundle)?;

        let service = service_name(upload.service.as_deref());
        let namespace = namespace(upload.namespace.as_deref());

        let id = self.store.next_id();
        let work_dir = self.upload_root.join(id.as_str());
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| DeployError::io("failed to create workdir", e))?;

        let bundle_path = work_dir.join(file_name);
        tokio::fs::write(&bundle_path, &upload.bytes)
            .await
            .map_err(|e| DeployError::io("failed to save bundle", e))?;

        let extract_path = work_dir.join(EXTRACT_DIR);
        tokio::fs::create_dir_all(&extract_path)
            .await
            .map_err(|e| DeployError::io("failed to create extract path", e))?;

        extract::extract_bundle_blocking(&bundle_path, &extract_path).await?;

        let job = DeploymentJob::new(id, service, namespace, bundle_path, extract_path);
        self.store.create(job.clone())?;

        info!(
            job_id = %job.id,
            service = %job.service_name,
            namespace = %job.namespace,
            "bundle accepted"
        );
        Ok(job)
    }
}
