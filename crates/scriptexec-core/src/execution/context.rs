//! Normalizing step parameters into a typed execution context.
//!
//! The context is everything the workload builder consumes: resolved
//! script, image, timeout, environment, volumes, scheduling hints, and the
//! clamped resources. Clamping happens here so the builder stays a pure
//! translation.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::cluster::types::{KeyToPath, PullPolicy, ResourceName, ResourceRequirements, Toleration};
use crate::cluster::Quantity;
use crate::config::{ExecutorConfig, ResourceValues};
use crate::image::ResolvedImage;
use crate::params::{ParamError, Params};
use crate::script::ScriptSource;

use super::types::StepContext;

/// Default interpreter when the request names none.
const DEFAULT_INTERPRETER: &str = "/bin/bash";

/// Default working directory when the request names none.
const DEFAULT_WORKING_DIR: &str = "/workspace";

/// Ceiling on the retry budget.
const MAX_BACKOFF_LIMIT: u32 = 3;

/// A `name`/`key` reference into a secret or configmap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRef {
    /// Object name.
    pub name: String,
    /// Key within the object.
    pub key: String,
    /// Whether the reference may be absent.
    pub optional: bool,
}

/// A requested secret or configmap volume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeRequest {
    /// Backing object name.
    pub name: String,
    /// Mount point inside the container.
    pub mount_path: String,
    /// Whether the backing object may be absent.
    pub optional: bool,
    /// Optional key-to-path projections with mode bits.
    pub items: Vec<KeyToPath>,
}

/// Everything the workload builder needs for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Execution id.
    pub execution_id: String,
    /// Runbook id.
    pub runbook_id: String,
    /// Requesting user.
    pub user: String,
    /// Step name.
    pub step_name: String,

    /// Script body; empty for path-mode runs.
    pub script: String,
    /// Resolved script source.
    pub source: ScriptSource,
    /// SHA-256 of the script body; empty for path-mode runs.
    pub script_hash: String,

    /// Resolved image reference.
    pub image: String,
    /// Pull policy.
    pub image_pull_policy: PullPolicy,
    /// Pull-secret name; empty when none applies.
    pub image_pull_secret: String,

    /// Interpreter path.
    pub interpreter: String,
    /// Extra arguments appended to the command.
    pub args: Vec<String>,
    /// Working directory.
    pub working_dir: String,
    /// Resolved timeout, capped at the configured maximum.
    pub timeout: Duration,
    /// Standard-input payload; empty for none.
    pub stdin: String,

    /// Literal environment variables.
    pub env: BTreeMap<String, String>,
    /// Per-key secret references.
    pub env_from_secret: BTreeMap<String, KeyRef>,
    /// Per-key configmap references.
    pub env_from_config_map: BTreeMap<String, KeyRef>,
    /// Whole-secret environment imports.
    pub secret_env_all: Vec<String>,
    /// Whole-configmap environment imports.
    pub config_map_env_all: Vec<String>,

    /// Secret-backed volume requests.
    pub volumes_from_secret: Vec<VolumeRequest>,
    /// Configmap-backed volume requests.
    pub volumes_from_config_map: Vec<VolumeRequest>,

    /// Node-selection constraints.
    pub node_selector: BTreeMap<String, String>,
    /// Taint tolerations.
    pub tolerations: Vec<Toleration>,
    /// Opaque affinity expression.
    pub affinity: Option<Value>,
    /// Priority class name.
    pub priority_class_name: String,

    /// Clamped resource requests and limits.
    pub resources: ResourceRequirements,

    /// Service account identity.
    pub service_account: String,
    /// Seconds the platform keeps the finished workload.
    pub ttl_seconds_after_finished: u32,
    /// Retry budget, clamped to `0..=3`.
    pub backoff_limit: u32,
    /// User-supplied labels merged onto the workload.
    pub labels: BTreeMap<String, String>,
    /// User-supplied annotations merged onto the workload.
    pub annotations: BTreeMap<String, String>,
}

/// Builds the execution context from the parameter bag.
///
/// `timeout_override` is the request-level override and wins over the
/// `timeout` parameter; both are capped at the configured maximum.
pub fn build_context(
    params: Params<'_>,
    step: &StepContext,
    source: ScriptSource,
    script_hash: String,
    image: &ResolvedImage,
    timeout_override: Option<Duration>,
    config: &ExecutorConfig,
) -> Result<ExecutionContext, ParamError> {
    let timeout = resolve_timeout(params, timeout_override, config)?;

    let backoff_limit = params
        .int("backoff_limit")
        .map_or(config.cluster.job_defaults.backoff_limit, |raw| {
            u32::try_from(raw.max(0)).unwrap_or(MAX_BACKOFF_LIMIT)
        })
        .min(MAX_BACKOFF_LIMIT);

    let ttl_seconds_after_finished = params
        .int("ttl_seconds_after_finished")
        .filter(|ttl| *ttl > 0)
        .and_then(|ttl| u32::try_from(ttl).ok())
        .unwrap_or(config.cluster.job_defaults.ttl_seconds_after_finished);

    Ok(ExecutionContext {
        execution_id: step.execution_id.clone(),
        runbook_id: step.runbook_id.clone(),
        user: step.user.clone(),
        step_name: step.step_name.clone(),
        script: source.content().unwrap_or_default().to_string(),
        source,
        script_hash,
        image: image.image.clone(),
        image_pull_policy: image.pull_policy,
        image_pull_secret: image.pull_secret.clone(),
        interpreter: params.string("interpreter", DEFAULT_INTERPRETER),
        args: params.string_list("args"),
        working_dir: params.string("working_dir", DEFAULT_WORKING_DIR),
        timeout,
        stdin: params.string("stdin", ""),
        env: params.string_map("env").into_iter().collect(),
        env_from_secret: key_refs(params.map("env_from_secret"), "secret_name"),
        env_from_config_map: key_refs(params.map("env_from_configmap"), "configmap_name"),
        secret_env_all: params.string_list("secret_env_all"),
        config_map_env_all: params.string_list("configmap_env_all"),
        volumes_from_secret: volume_requests(params, "volumes_from_secret", "secret_name"),
        volumes_from_config_map: volume_requests(params, "volumes_from_configmap", "configmap_name"),
        node_selector: params.string_map("node_selector").into_iter().collect(),
        tolerations: params
            .raw("tolerations")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default(),
        affinity: params.raw("affinity").cloned(),
        priority_class_name: params.string("priority_class_name", ""),
        resources: build_resources(params, config),
        service_account: config.cluster.service_account.clone(),
        ttl_seconds_after_finished,
        backoff_limit,
        labels: params.string_map("labels").into_iter().collect(),
        annotations: params.string_map("annotations").into_iter().collect(),
    })
}

fn resolve_timeout(
    params: Params<'_>,
    timeout_override: Option<Duration>,
    config: &ExecutorConfig,
) -> Result<Duration, ParamError> {
    let requested = match timeout_override {
        Some(timeout) if !timeout.is_zero() => Some(timeout),
        _ => params.duration("timeout")?,
    };
    let timeout = requested.unwrap_or(config.security.default_timeout);
    Ok(timeout.min(config.security.max_timeout))
}

/// Reads a `{name: {<name_field>, key, optional}}` sub-bag.
fn key_refs(bag: Params<'_>, name_field: &str) -> BTreeMap<String, KeyRef> {
    let mut refs = BTreeMap::new();
    for (variable, value) in bag.entries() {
        let entry = Params::new(value);
        let name = entry.string(name_field, "");
        let key = entry.string("key", "");
        if name.is_empty() || key.is_empty() {
            continue;
        }
        refs.insert(
            variable.to_string(),
            KeyRef {
                name,
                key,
                optional: entry.bool("optional"),
            },
        );
    }
    refs
}

/// Reads a `[{<name_field>, mount_path, optional, items}]` list.
fn volume_requests(params: Params<'_>, key: &str, name_field: &str) -> Vec<VolumeRequest> {
    params
        .list(key)
        .iter()
        .filter_map(|value| {
            let entry = Params::new(value);
            let name = entry.string(name_field, "");
            let mount_path = entry.string("mount_path", "");
            if name.is_empty() || mount_path.is_empty() {
                return None;
            }
            let items = entry
                .list("items")
                .iter()
                .filter_map(|item| {
                    let item = Params::new(item);
                    let key = item.string("key", "");
                    let path = item.string("path", "");
                    if key.is_empty() || path.is_empty() {
                        return None;
                    }
                    Some(KeyToPath {
                        key,
                        path,
                        mode: item.int("mode").and_then(|mode| i32::try_from(mode).ok()),
                    })
                })
                .collect();
            Some(VolumeRequest {
                name,
                mount_path,
                optional: entry.bool("optional"),
                items,
            })
        })
        .collect()
}

/// Merges configured defaults with request resources, then clamps limits
/// component-wise at the configured maxima.
fn build_resources(params: Params<'_>, config: &ExecutorConfig) -> ResourceRequirements {
    let mut resources = ResourceRequirements::default();
    apply_values(
        &mut resources.requests,
        &config.cluster.default_resources.requests,
    );
    apply_values(
        &mut resources.limits,
        &config.cluster.default_resources.limits,
    );

    let requested = params.map("resources");
    for (component, bag) in [
        (&mut resources.requests, requested.map("requests")),
        (&mut resources.limits, requested.map("limits")),
    ] {
        for (name, key) in [
            (ResourceName::Cpu, "cpu"),
            (ResourceName::Memory, "memory"),
            (ResourceName::EphemeralStorage, "ephemeral_storage"),
        ] {
            let raw = bag.string(key, "");
            if raw.is_empty() {
                continue;
            }
            if let Ok(quantity) = Quantity::parse(&raw) {
                component.insert(name, quantity);
            }
        }
    }

    let maxima = &config.cluster.max_resources.limits;
    for (name, max) in [
        (ResourceName::Cpu, &maxima.cpu),
        (ResourceName::Memory, &maxima.memory),
        (ResourceName::EphemeralStorage, &maxima.ephemeral_storage),
    ] {
        let Some(max) = max else { continue };
        if let Some(limit) = resources.limits.get(&name) {
            if limit > max {
                resources.limits.insert(name, max.clone());
            }
        }
    }

    resources
}

fn apply_values(target: &mut BTreeMap<ResourceName, Quantity>, values: &ResourceValues) {
    if let Some(cpu) = &values.cpu {
        target.insert(ResourceName::Cpu, cpu.clone());
    }
    if let Some(memory) = &values.memory {
        target.insert(ResourceName::Memory, memory.clone());
    }
    if let Some(storage) = &values.ephemeral_storage {
        target.insert(ResourceName::EphemeralStorage, storage.clone());
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn image() -> ResolvedImage {
        ResolvedImage {
            image: "alpine:3.20".into(),
            pull_secret: String::new(),
            pull_policy: PullPolicy::IfNotPresent,
        }
    }

    fn step() -> StepContext {
        StepContext {
            execution_id: "exec-1".into(),
            runbook_id: "rb-1".into(),
            user: "alice".into(),
            step_name: "step-a".into(),
        }
    }

    fn build(doc: serde_json::Value) -> ExecutionContext {
        build_context(
            Params::new(&doc),
            &step(),
            ScriptSource::Inline {
                content: "echo hi".into(),
            },
            "hash".into(),
            &image(),
            None,
            &ExecutorConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_unnamed_settings() {
        let ctx = build(json!({}));
        assert_eq!(ctx.interpreter, "/bin/bash");
        assert_eq!(ctx.working_dir, "/workspace");
        assert_eq!(ctx.timeout, Duration::from_secs(300));
        assert_eq!(ctx.backoff_limit, 0);
        assert_eq!(ctx.ttl_seconds_after_finished, 300);
        assert_eq!(
            ctx.resources.limits[&ResourceName::Cpu],
            Quantity::parse("500m").unwrap()
        );
    }

    #[test]
    fn timeout_is_capped_at_the_maximum() {
        let ctx = build(json!({"timeout": "2h"}));
        assert_eq!(ctx.timeout, Duration::from_secs(1800));
    }

    #[test]
    fn request_override_beats_parameter_timeout() {
        let doc = json!({"timeout": "10m"});
        let ctx = build_context(
            Params::new(&doc),
            &step(),
            ScriptSource::Inline {
                content: String::new(),
            },
            String::new(),
            &image(),
            Some(Duration::from_secs(60)),
            &ExecutorConfig::default(),
        )
        .unwrap();
        assert_eq!(ctx.timeout, Duration::from_secs(60));
    }

    #[test]
    fn invalid_timeout_is_a_client_error() {
        let doc = json!({"timeout": "whenever"});
        let err = build_context(
            Params::new(&doc),
            &step(),
            ScriptSource::Inline {
                content: String::new(),
            },
            String::new(),
            &image(),
            None,
            &ExecutorConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ParamError::InvalidDuration { .. }));
    }

    #[test]
    fn backoff_limit_clamped_to_three() {
        assert_eq!(build(json!({"backoff_limit": 7})).backoff_limit, 3);
        assert_eq!(build(json!({"backoff_limit": 2})).backoff_limit, 2);
        assert_eq!(build(json!({"backoff_limit": -1})).backoff_limit, 0);
    }

    #[test]
    fn limits_clamp_at_configured_maxima() {
        let ctx = build(json!({
            "resources": {"limits": {"cpu": "16", "memory": "64Gi", "ephemeral_storage": "50Gi"}}
        }));
        assert_eq!(
            ctx.resources.limits[&ResourceName::Cpu],
            Quantity::parse("4000m").unwrap()
        );
        assert_eq!(
            ctx.resources.limits[&ResourceName::Memory],
            Quantity::parse("8Gi").unwrap()
        );
        assert_eq!(
            ctx.resources.limits[&ResourceName::EphemeralStorage],
            Quantity::parse("20Gi").unwrap()
        );
    }

    #[test]
    fn limits_below_maxima_pass_through() {
        let ctx = build(json!({"resources": {"limits": {"cpu": "1", "memory": "512Mi"}}}));
        assert_eq!(
            ctx.resources.limits[&ResourceName::Cpu],
            Quantity::parse("1").unwrap()
        );
        assert_eq!(
            ctx.resources.limits[&ResourceName::Memory],
            Quantity::parse("512Mi").unwrap()
        );
    }

    #[test]
    fn environment_and_volume_requests_parse() {
        let ctx = build(json!({
            "env": {"REGION": "us-east-1"},
            "env_from_secret": {
                "DB_PASSWORD": {"secret_name": "db-creds", "key": "password", "optional": true},
                "IGNORED": {"key": "no-name"},
            },
            "env_from_configmap": {"APP_MODE": {"configmap_name": "app-config", "key": "mode"}},
            "secret_env_all": ["bulk-secret"],
            "volumes_from_secret": [{
                "secret_name": "tls",
                "mount_path": "/etc/tls",
                "items": [{"key": "cert.pem", "path": "tls.crt", "mode": 256}],
            }],
        }));
        assert_eq!(ctx.env["REGION"], "us-east-1");
        assert_eq!(
            ctx.env_from_secret["DB_PASSWORD"],
            KeyRef {
                name: "db-creds".into(),
                key: "password".into(),
                optional: true,
            }
        );
        assert!(!ctx.env_from_secret.contains_key("IGNORED"));
        assert_eq!(ctx.env_from_config_map["APP_MODE"].name, "app-config");
        assert_eq!(ctx.secret_env_all, vec!["bulk-secret".to_string()]);
        assert_eq!(ctx.volumes_from_secret.len(), 1);
        assert_eq!(ctx.volumes_from_secret[0].items[0].mode, Some(256));
    }

    #[test]
    fn scheduling_hints_pass_through() {
        let ctx = build(json!({
            "node_selector": {"disktype": "ssd"},
            "tolerations": [{"key": "dedicated", "operator": "Equal", "value": "ops", "effect": "NoSchedule"}],
            "affinity": {"nodeAffinity": {}},
            "priority_class_name": "ops-high",
        }));
        assert_eq!(ctx.node_selector["disktype"], "ssd");
        assert_eq!(ctx.tolerations.len(), 1);
        assert_eq!(ctx.tolerations[0].key.as_deref(), Some("dedicated"));
        assert!(ctx.affinity.is_some());
        assert_eq!(ctx.priority_class_name, "ops-high");
    }
}
