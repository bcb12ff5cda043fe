//! Bundle upload and deployment service.
//!
//! This crate provides:
//! - Multipart bundle uploads over HTTP
//! - Safe extraction of zip, tar and gzipped tar archives
//! - An in-memory registry of deployment jobs
//! - An asynchronous build/deploy pipeline driving an external executable
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │  HTTP API    │───▶│   Receiver   │───▶│   Extract    │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!        │                   │
//!        │                   ▼
//!        │            ┌──────────────┐    ┌──────────────┐
//!        └───────────▶│  Job Store   │◀───│   Pipeline   │
//!                     └──────────────┘    └──────────────┘
//!                                                │
//!                                                ▼
//!                                      build/deploy executable
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod receiver;
pub mod store;
pub mod types;

// Re-export error types
pub use error::{DeployError, DeployResult, ErrorResponse};

// Re-export core types
pub use types::{DeploymentJob, JobId, JobStatus};

// Re-export configuration
pub use config::ServiceConfig;

// Re-export service components
pub use pipeline::{
    BuildInvocation, BuildRunner, KubectlRevisions, Pipeline, PipelineMode, RevisionLookup,
    RunOutput, ScriptRunner,
};
pub use receiver::{BundleReceiver, BundleUpload};
pub use store::JobStore;

// Re-export API types
pub use api::{router as api_router, AppState as ApiAppState};
