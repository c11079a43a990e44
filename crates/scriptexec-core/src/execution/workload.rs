//! Workload manifest construction.
//!
//! A pure translation from [`ExecutionContext`] to a single-shot Job. The
//! builder has no side effects; the same context always produces the same
//! manifest.

use std::collections::BTreeMap;

use crate::cluster::types::{
    Capabilities, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvFromSource, EnvVar,
    EnvVarSource, Job, JobSpec, KeySelector, LocalObjectReference, ObjectMeta, PodSecurityContext,
    PodSpec, PodTemplateSpec, SeccompProfile, SecretVolumeSource, SecurityContext, Volume,
    VolumeMount,
};
use crate::cluster::{Quantity, ResourceName};
use crate::config::SecurityConfig;
use crate::script::APPROVED_SCRIPTS_CONFIG_MAP;

use super::context::ExecutionContext;

/// Prefix of every workload name this executor creates.
pub const JOB_NAME_PREFIX: &str = "script-exec-";

/// Container name running the script.
pub const SCRIPT_CONTAINER_NAME: &str = "script";

/// Size cap for the `/tmp` scratch volume.
const TMP_VOLUME_SIZE: &str = "100Mi";

/// Fallback size for the workspace volume when no ephemeral-storage limit
/// is set.
const WORKSPACE_FALLBACK_SIZE: &str = "1Gi";

/// Maximum label value length the platform accepts.
const MAX_LABEL_LENGTH: usize = 63;

/// Builds Job manifests for script executions.
#[derive(Debug, Clone)]
pub struct WorkloadBuilder {
    namespace: String,
    security: SecurityConfig,
}

impl WorkloadBuilder {
    /// Creates a builder for the executor namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>, security: SecurityConfig) -> Self {
        Self {
            namespace: namespace.into(),
            security,
        }
    }

    /// Translates an execution context into a Job manifest.
    #[must_use]
    pub fn build(&self, ctx: &ExecutionContext) -> Job {
        let name = format!("{JOB_NAME_PREFIX}{}", ctx.execution_id);

        let mut labels: BTreeMap<String, String> = [
            ("executor".to_string(), "script".to_string()),
            ("execution-id".to_string(), sanitize_label(&ctx.execution_id)),
            ("runbook-id".to_string(), sanitize_label(&ctx.runbook_id)),
            ("user".to_string(), sanitize_label(&ctx.user)),
            ("managed-by".to_string(), "opscontrolroom".to_string()),
        ]
        .into();
        labels.extend(ctx.labels.clone());

        let mut annotations: BTreeMap<String, String> = [
            ("script-hash".to_string(), ctx.script_hash.clone()),
            ("execution-id".to_string(), ctx.execution_id.clone()),
            ("runbook-id".to_string(), ctx.runbook_id.clone()),
            ("user".to_string(), ctx.user.clone()),
            ("image".to_string(), ctx.image.clone()),
            ("created-by".to_string(), "script-executor".to_string()),
        ]
        .into();
        annotations.extend(ctx.annotations.clone());

        Job {
            metadata: ObjectMeta {
                name,
                namespace: self.namespace.clone(),
                labels,
                annotations,
            },
            spec: JobSpec {
                backoff_limit: Some(ctx.backoff_limit),
                ttl_seconds_after_finished: Some(ctx.ttl_seconds_after_finished),
                active_deadline_seconds: Some(ctx.timeout.as_secs()),
                template: PodTemplateSpec {
                    metadata: ObjectMeta {
                        labels: [
                            ("executor".to_string(), "script".to_string()),
                            ("execution-id".to_string(), sanitize_label(&ctx.execution_id)),
                        ]
                        .into(),
                        annotations: ctx.annotations.clone(),
                        ..ObjectMeta::default()
                    },
                    spec: PodSpec {
                        restart_policy: "Never".into(),
                        service_account_name: ctx.service_account.clone(),
                        security_context: Some(PodSecurityContext {
                            run_as_non_root: Some(true),
                            run_as_user: Some(self.security.run_as_user),
                            fs_group: Some(self.security.fs_group),
                            seccomp_profile: Some(SeccompProfile::runtime_default()),
                        }),
                        node_selector: ctx.node_selector.clone(),
                        tolerations: ctx.tolerations.clone(),
                        affinity: ctx.affinity.clone(),
                        priority_class_name: ctx.priority_class_name.clone(),
                        image_pull_secrets: if ctx.image_pull_secret.is_empty() {
                            Vec::new()
                        } else {
                            vec![LocalObjectReference {
                                name: ctx.image_pull_secret.clone(),
                            }]
                        },
                        containers: vec![self.build_container(ctx)],
                        volumes: build_volumes(ctx),
                    },
                },
            },
            ..Job::default()
        }
    }

    fn build_container(&self, ctx: &ExecutionContext) -> Container {
        let command = match ctx.source.path() {
            Some(path) => vec![ctx.interpreter.clone(), path.to_string()],
            None => vec![ctx.interpreter.clone(), "-c".into(), ctx.script.clone()],
        };
        let has_stdin = !ctx.stdin.is_empty();

        Container {
            name: SCRIPT_CONTAINER_NAME.into(),
            image: ctx.image.clone(),
            image_pull_policy: ctx.image_pull_policy,
            command,
            args: ctx.args.clone(),
            working_dir: ctx.working_dir.clone(),
            env: build_env(ctx),
            env_from: build_env_from(ctx),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                read_only_root_filesystem: Some(true),
                run_as_non_root: Some(true),
                run_as_user: Some(self.security.run_as_user),
                capabilities: Some(Capabilities {
                    drop: vec!["ALL".into()],
                }),
            }),
            resources: ctx.resources.clone(),
            volume_mounts: build_volume_mounts(ctx),
            stdin: has_stdin,
            stdin_once: has_stdin,
        }
    }
}

fn build_env(ctx: &ExecutionContext) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = ctx
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            value_from: None,
        })
        .collect();

    for (name, key_ref) in &ctx.env_from_secret {
        env.push(EnvVar {
            name: name.clone(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(KeySelector {
                    name: key_ref.name.clone(),
                    key: key_ref.key.clone(),
                    optional: Some(key_ref.optional),
                }),
                config_map_key_ref: None,
            }),
        });
    }
    for (name, key_ref) in &ctx.env_from_config_map {
        env.push(EnvVar {
            name: name.clone(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: None,
                config_map_key_ref: Some(KeySelector {
                    name: key_ref.name.clone(),
                    key: key_ref.key.clone(),
                    optional: Some(key_ref.optional),
                }),
            }),
        });
    }
    env
}

fn build_env_from(ctx: &ExecutionContext) -> Vec<EnvFromSource> {
    let mut env_from = Vec::new();
    for name in &ctx.secret_env_all {
        if name.is_empty() {
            continue;
        }
        env_from.push(EnvFromSource {
            secret_ref: Some(LocalObjectReference { name: name.clone() }),
            config_map_ref: None,
        });
    }
    for name in &ctx.config_map_env_all {
        if name.is_empty() {
            continue;
        }
        env_from.push(EnvFromSource {
            secret_ref: None,
            config_map_ref: Some(LocalObjectReference { name: name.clone() }),
        });
    }
    env_from
}

fn build_volumes(ctx: &ExecutionContext) -> Vec<Volume> {
    let workspace_size = ctx
        .resources
        .limits
        .get(&ResourceName::EphemeralStorage)
        .cloned()
        .or_else(|| Quantity::parse(WORKSPACE_FALLBACK_SIZE).ok());

    let mut volumes = vec![
        Volume {
            name: "workspace".into(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: workspace_size,
            }),
            ..Volume::default()
        },
        Volume {
            name: "tmp".into(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: Quantity::parse(TMP_VOLUME_SIZE).ok(),
            }),
            ..Volume::default()
        },
    ];

    if ctx.source.path().is_some() {
        volumes.push(Volume {
            name: "scripts".into(),
            config_map: Some(ConfigMapVolumeSource {
                name: APPROVED_SCRIPTS_CONFIG_MAP.into(),
                optional: None,
                items: Vec::new(),
            }),
            ..Volume::default()
        });
    }

    for (index, request) in ctx.volumes_from_secret.iter().enumerate() {
        volumes.push(Volume {
            name: format!("secret-{index}"),
            secret: Some(SecretVolumeSource {
                secret_name: request.name.clone(),
                optional: Some(request.optional),
                items: request.items.clone(),
            }),
            ..Volume::default()
        });
    }
    for (index, request) in ctx.volumes_from_config_map.iter().enumerate() {
        volumes.push(Volume {
            name: format!("configmap-{index}"),
            config_map: Some(ConfigMapVolumeSource {
                name: request.name.clone(),
                optional: Some(request.optional),
                items: request.items.clone(),
            }),
            ..Volume::default()
        });
    }

    volumes
}

fn build_volume_mounts(ctx: &ExecutionContext) -> Vec<VolumeMount> {
    let mut mounts = vec![
        VolumeMount {
            name: "workspace".into(),
            mount_path: "/workspace".into(),
            read_only: false,
        },
        VolumeMount {
            name: "tmp".into(),
            mount_path: "/tmp".into(),
            read_only: false,
        },
    ];

    if ctx.source.path().is_some() {
        mounts.push(VolumeMount {
            name: "scripts".into(),
            mount_path: "/scripts".into(),
            read_only: true,
        });
    }

    for (index, request) in ctx.volumes_from_secret.iter().enumerate() {
        mounts.push(VolumeMount {
            name: format!("secret-{index}"),
            mount_path: request.mount_path.clone(),
            read_only: true,
        });
    }
    for (index, request) in ctx.volumes_from_config_map.iter().enumerate() {
        mounts.push(VolumeMount {
            name: format!("configmap-{index}"),
            mount_path: request.mount_path.clone(),
            read_only: true,
        });
    }

    mounts
}

/// Folds a free-form value into the platform's label grammar: `/` and `.`
/// become `-`, truncated to 63 characters.
fn sanitize_label(value: &str) -> String {
    let mut sanitized: String = value
        .chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .collect();
    sanitized.truncate(MAX_LABEL_LENGTH);
    sanitized
}
