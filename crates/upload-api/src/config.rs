//! Service configuration.
//!
//! Values come from built-in defaults, an optional TOML file and the
//! process environment, later sources taking precedence.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer};

use crate::error::DeployResult;

/// Default config file, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "upload-api.toml";

/// Environment variable naming an alternative config file.
pub const CONFIG_FILE_ENV: &str = "UPLOAD_API_CONFIG";

/// Environment variables read as configuration keys.
const ENV_KEYS: [&str; 7] = [
    "UPLOAD_ROOT",
    "PORT",
    "BUILD_DEPLOY_SCRIPT",
    "MOCK_DEPLOY",
    "MAX_UPLOAD_BYTES",
    "MOCK_STEP_DELAY_MS",
    "REVISION_COMMAND",
];

/// Locations probed for the build/deploy script when none is configured.
pub const SCRIPT_CANDIDATES: [&str; 6] = [
    "scripts/build-deploy-local.sh",
    "../scripts/build-deploy-local.sh",
    "../../scripts/build-deploy-local.sh",
    "scripts/func-build-deploy.sh",
    "../scripts/func-build-deploy.sh",
    "../../scripts/func-build-deploy.sh",
];

/// Upload service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Directory under which per-job work directories are created.
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,

    /// TCP port for the HTTP API.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Build/deploy executable; auto-detected when unset.
    #[serde(default)]
    pub build_deploy_script: Option<PathBuf>,

    /// Simulate builds instead of running the script. Only `true`, in any
    /// case, enables it.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub mock_deploy: bool,

    /// Upload ceiling in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Delay of each simulated step in mock mode, in milliseconds.
    #[serde(default = "default_mock_step_delay_ms")]
    pub mock_step_delay_ms: u64,

    /// Command used to list deployed revisions.
    #[serde(default = "default_revision_command")]
    pub revision_command: PathBuf,
}

impl ServiceConfig {
    /// Load configuration from the default file location and environment.
    pub fn load() -> DeployResult<Self> {
        let path = std::env::var(CONFIG_FILE_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_owned());
        Self::load_from(path)
    }

    /// Load configuration from a specific file and the environment.
    pub fn load_from(path: impl AsRef<Path>) -> DeployResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(env_provider())
    }

    /// Address the HTTP server binds to.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    /// Delay of each simulated step in mock mode.
    #[must_use]
    pub const fn mock_step_delay(&self) -> Duration {
        Duration::from_millis(self.mock_step_delay_ms)
    }

    /// The configured build/deploy script, or the first candidate found on
    /// disk.
    #[must_use]
    pub fn script_path(&self) -> PathBuf {
        self.build_deploy_script
            .clone()
            .unwrap_or_else(|| detect_script_path(Path::new(".")))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            upload_root: default_upload_root(),
            port: default_port(),
            build_deploy_script: None,
            mock_deploy: false,
            max_upload_bytes: default_max_upload_bytes(),
            mock_step_delay_ms: default_mock_step_delay_ms(),
            revision_command: default_revision_command(),
        }
    }
}

/// Environment provider over [`ENV_KEYS`]. Blank variables count as unset.
fn env_provider() -> Env {
    let present: Vec<&str> = ENV_KEYS
        .iter()
        .copied()
        .filter(|key| std::env::var(key).is_ok_and(|value| !value.trim().is_empty()))
        .collect();
    Env::raw().only(&present)
}

/// Accepts a boolean, or a string that is `true` when it equals "true"
/// ignoring case and surrounding whitespace. Anything else is `false`.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
        Other(IgnoredAny),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Text(text) => text.trim().eq_ignore_ascii_case("true"),
        Flag::Other(_) => false,
    })
}

/// Probe [`SCRIPT_CANDIDATES`] relative to `base`.
///
/// Falls back to the first candidate when none exists.
#[must_use]
pub fn detect_script_path(base: &Path) -> PathBuf {
    SCRIPT_CANDIDATES
        .iter()
        .find(|candidate| base.join(candidate).is_file())
        .map_or_else(
            || PathBuf::from(SCRIPT_CANDIDATES[0]),
            |candidate| base.join(candidate),
        )
}

fn default_upload_root() -> PathBuf {
    std::env::temp_dir().join("knative-appdev").join("uploads")
}

const fn default_port() -> u16 {
    8080
}

const fn default_max_upload_bytes() -> usize {
    50 << 20
}

const fn default_mock_step_delay_ms() -> u64 {
    1000
}

fn default_revision_command() -> PathBuf {
    PathBuf::from("kubectl")
}
