//! Executor configuration.
//!
//! The whole tree deserializes from YAML with serde defaults, so a partial
//! file only overrides what it names. Environment overrides for the handful
//! of deploy-time knobs are applied after the file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{PullPolicy, Quantity};

/// Error loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("read config file {path}: {source}")]
    Read {
        /// Path attempted.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The document could not be parsed.
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Root configuration for the script executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Cluster and workload settings.
    pub cluster: ClusterConfig,
    /// Image resolution and validation settings.
    pub image: ImageConfig,
    /// Script validation and pod security settings.
    pub security: SecurityConfig,
    /// Approval workflow settings.
    pub approval: ApprovalConfig,
    /// Audit sink settings.
    pub audit: AuditConfig,
    /// Hosting surface settings.
    pub server: ServerConfig,
}

impl ExecutorConfig {
    /// Parses a YAML document over the defaults.
    pub fn from_yaml(document: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(document)?)
    }

    /// Loads from a file, then applies environment overrides. A missing
    /// path yields the defaults.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let document =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.display().to_string(),
                        source,
                    })?;
                Self::from_yaml(&document)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(namespace) = std::env::var("EXECUTOR_NAMESPACE") {
            if !namespace.is_empty() {
                self.cluster.namespace = namespace;
            }
        }
        if let Ok(image) = std::env::var("DEFAULT_IMAGE") {
            if !image.is_empty() {
                self.image.default_image = image;
            }
        }
        if let Ok(port) = std::env::var("HTTP_PORT") {
            if let Ok(port) = port.parse() {
                self.server.http_port = port;
            }
        }
    }
}

/// Cluster and workload defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Namespace workloads and fixed configmaps live in.
    pub namespace: String,
    /// Service account assigned to workload pods.
    pub service_account: String,
    /// Workload lifecycle defaults.
    pub job_defaults: JobDefaults,
    /// Resources applied when the request names none.
    pub default_resources: ResourcesConfig,
    /// Per-component ceilings that clamp request limits.
    pub max_resources: ResourcesConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "opscontrolroom-system".into(),
            service_account: "script-executor-runner".into(),
            job_defaults: JobDefaults::default(),
            default_resources: ResourcesConfig {
                requests: ResourceValues {
                    cpu: quantity("100m"),
                    memory: quantity("64Mi"),
                    ephemeral_storage: None,
                },
                limits: ResourceValues {
                    cpu: quantity("500m"),
                    memory: quantity("256Mi"),
                    ephemeral_storage: quantity("1Gi"),
                },
            },
            max_resources: ResourcesConfig {
                requests: ResourceValues::default(),
                limits: ResourceValues {
                    cpu: quantity("4000m"),
                    memory: quantity("8Gi"),
                    ephemeral_storage: quantity("20Gi"),
                },
            },
        }
    }
}

/// Workload lifecycle defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    /// Seconds the platform keeps a finished workload before cleanup.
    pub ttl_seconds_after_finished: u32,
    /// Default retry budget.
    pub backoff_limit: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            ttl_seconds_after_finished: 300,
            backoff_limit: 0,
        }
    }
}

/// Optional quantities per resource component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceValues {
    /// CPU quantity.
    pub cpu: Option<Quantity>,
    /// Memory quantity.
    pub memory: Option<Quantity>,
    /// Ephemeral-storage quantity.
    pub ephemeral_storage: Option<Quantity>,
}

/// Requests and limits pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Scheduling requests.
    pub requests: ResourceValues,
    /// Hard limits.
    pub limits: ResourceValues,
}

/// Image resolution and validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Image used when the request names none.
    pub default_image: String,
    /// Pull secret used when neither catalog nor request names one.
    pub default_image_pull_secret: String,
    /// Pull policy used when the request names none.
    pub default_image_pull_policy: PullPolicy,
    /// Approved image patterns; empty disables the approval check.
    pub approved_images: Vec<String>,
    /// Blocked image patterns.
    pub blocked_images: Vec<String>,
    /// Configmap holding the image catalog.
    pub catalog_config_map: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            default_image: "alpine:latest".into(),
            default_image_pull_secret: String::new(),
            default_image_pull_policy: PullPolicy::IfNotPresent,
            approved_images: Vec::new(),
            blocked_images: Vec::new(),
            catalog_config_map: "script-image-catalog".into(),
        }
    }
}

/// Script validation and pod security settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Command patterns scripts may not invoke.
    pub blocked_commands: Vec<String>,
    /// When non-empty, the only command patterns scripts may invoke.
    pub allowed_commands: Vec<String>,
    /// Byte cap for in-band script content.
    pub max_script_size: usize,
    /// Line cap for in-band script content.
    pub max_script_lines: usize,
    /// Timeout applied when the request names none.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Ceiling on any requested timeout.
    #[serde(with = "humantime_serde")]
    pub max_timeout: Duration,
    /// UID workload processes run as.
    pub run_as_user: i64,
    /// Group owning workload volumes.
    pub fs_group: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            blocked_commands: [
                "rm", "dd", "mkfs", "fdisk", "mkswap", "setuid", "reboot", "shutdown", "init",
                "systemctl", "nmap", "masscan", "kill", "killall", "pkill",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            allowed_commands: Vec::new(),
            max_script_size: crate::security::DEFAULT_MAX_SCRIPT_SIZE,
            max_script_lines: crate::security::DEFAULT_MAX_SCRIPT_LINES,
            default_timeout: Duration::from_secs(5 * 60),
            max_timeout: Duration::from_secs(30 * 60),
            run_as_user: 65_534,
            fs_group: 65_534,
        }
    }
}

/// Approval workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Whether approval gating is available at all.
    pub enabled: bool,
    /// Configmap backing the approval store.
    pub config_map: String,
    /// How long a pending record stays decidable.
    #[serde(with = "humantime_serde")]
    pub expiry: Duration,
    /// Approvers applied when the request names none.
    pub default_approvers: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            config_map: "script-approvals".into(),
            expiry: crate::approval::DEFAULT_EXPIRY,
            default_approvers: vec!["sre-leads".into()],
        }
    }
}

/// Audit sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Whether audit records are written.
    pub enabled: bool,
    /// JSONL file the sink appends to.
    pub log_file: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_file: PathBuf::from("/var/log/ocr/script-audit.log"),
        }
    }
}

/// Hosting surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for the approval/health/metrics HTTP listener.
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { http_port: 8080 }
    }
}

/// Parses a built-in default quantity.
fn quantity(raw: &'static str) -> Option<Quantity> {
    match Quantity::parse(raw) {
        Ok(q) => Some(q),
        // Built-in literals parse; a typo here shows up in unit tests.
        Err(_) => None,
    }
}
