//! Pipeline coordinator.

use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::{Checker, ConfigMapStore, Status};
use crate::audit::{AuditRecord, AuditSink, NullSink};
use crate::cluster::ClusterApi;
use crate::config::ExecutorConfig;
use crate::image::{Catalog, ImageValidator, ResolvedImage, Resolver, ResolverDefaults};
use crate::params::Params;
use crate::script::{Loader, ScriptSource};
use crate::security::ScriptValidator;

use super::context::build_context;
use super::monitor::{ExecutionResult, Monitor};
use super::types::{
    ExecStatus, ExecuteRequest, ExecuteResponse, ExecutionOutput, STEP_TYPE_SCRIPT_RUN,
    StepContext,
};
use super::workload::WorkloadBuilder;
use super::ExecuteError;

/// Orchestrates the execution pipeline for `script.run` steps.
pub struct Manager {
    config: ExecutorConfig,
    cluster: Arc<dyn ClusterApi>,
    loader: Loader,
    script_validator: ScriptValidator,
    resolver: Resolver,
    image_validator: ImageValidator,
    approval: Option<Arc<Checker>>,
    builder: WorkloadBuilder,
    monitor: Monitor,
    audit: Arc<dyn AuditSink>,
}

impl Manager {
    /// Wires the pipeline from configuration and a cluster client. Audit
    /// records are dropped until [`Manager::with_audit_sink`] installs a
    /// sink.
    #[must_use]
    pub fn new(config: ExecutorConfig, cluster: Arc<dyn ClusterApi>) -> Self {
        let namespace = config.cluster.namespace.clone();

        let catalog = Catalog::new(
            Arc::clone(&cluster),
            namespace.clone(),
            config.image.catalog_config_map.clone(),
        );
        let resolver = Resolver::new(
            catalog,
            ResolverDefaults {
                image: config.image.default_image.clone(),
                pull_secret: config.image.default_image_pull_secret.clone(),
                pull_policy: config.image.default_image_pull_policy,
            },
        );

        let approval = config.approval.enabled.then(|| {
            let store = ConfigMapStore::with_expiry(
                Arc::clone(&cluster),
                namespace.clone(),
                config.approval.config_map.clone(),
                config.approval.expiry,
            );
            Arc::new(Checker::new(
                Arc::new(store),
                config.approval.default_approvers.clone(),
            ))
        });

        Self {
            loader: Loader::new(Arc::clone(&cluster), namespace.clone()),
            script_validator: ScriptValidator::new(
                config.security.blocked_commands.clone(),
                config.security.allowed_commands.clone(),
                config.security.max_script_size,
                config.security.max_script_lines,
            ),
            resolver,
            image_validator: ImageValidator::new(
                config.image.approved_images.clone(),
                config.image.blocked_images.clone(),
            ),
            approval,
            builder: WorkloadBuilder::new(namespace.clone(), config.security.clone()),
            monitor: Monitor::new(Arc::clone(&cluster), namespace),
            audit: Arc::new(NullSink),
            cluster,
            config,
        }
    }

    /// Installs an audit sink.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// The approval coordinator, for wiring the human-facing surface.
    /// `None` when approval gating is disabled.
    #[must_use]
    pub fn approval_checker(&self) -> Option<Arc<Checker>> {
        self.approval.clone()
    }

    /// Runs one `script.run` step to a terminal response.
    ///
    /// Errors become failed responses; only approval gating produces the
    /// pending status. An audit record is emitted for every terminal
    /// outcome, approval short-circuits included.
    pub async fn execute(
        &self,
        request: &ExecuteRequest,
        cancel: CancellationToken,
    ) -> ExecuteResponse {
        let started = Instant::now();
        let step = normalize_step(&request.context);

        let pipeline = self.run_pipeline(request, &step, &cancel, started);
        tokio::select! {
            () = cancel.cancelled() => {
                self.emit_audit(&step, None, "", "failed", None).await;
                failed_response(started, "execution cancelled".into())
            }
            response = pipeline => response,
        }
    }

    async fn run_pipeline(
        &self,
        request: &ExecuteRequest,
        step: &StepContext,
        cancel: &CancellationToken,
        started: Instant,
    ) -> ExecuteResponse {
        if request.step_type != STEP_TYPE_SCRIPT_RUN {
            let err = ExecuteError::UnsupportedStepType(request.step_type.clone());
            return self.finish_failed(started, step, None, "", err).await;
        }

        let params = Params::new(&request.parameters);

        // Resolve the script.
        let source = match self.loader.load(params).await {
            Ok(source) => source,
            Err(err) => return self.finish_failed(started, step, None, "", err.into()).await,
        };

        // Validate in-band content; path mode has none to check.
        if let Some(content) = source.content() {
            if !content.is_empty() {
                if let Err(err) = self.script_validator.validate(content) {
                    return self
                        .finish_failed(started, step, Some(&source), "", err.into())
                        .await;
                }
            }
        }

        // Content hash over the raw bytes, before any transformation.
        let script_hash = source
            .content()
            .filter(|content| !content.is_empty())
            .map(sha256_hex)
            .unwrap_or_default();

        // Resolve and validate the image.
        let resolved = match self.resolve_image(params).await {
            Ok(resolved) => resolved,
            Err(err) => {
                return self
                    .finish_failed(started, step, Some(&source), &script_hash, err)
                    .await;
            }
        };

        // Gate on approval when required.
        if params.bool("approval_required") {
            if let Some(checker) = &self.approval {
                match checker.check(&step.execution_id, &step.step_name).await {
                    Ok(Status::Approved) => {}
                    Ok(Status::Denied) => {
                        return self
                            .finish_failed(
                                started,
                                step,
                                Some(&source),
                                &script_hash,
                                ExecuteError::Denied,
                            )
                            .await;
                    }
                    Ok(_) => {
                        return self
                            .await_approval(started, step, params, &source, &script_hash)
                            .await;
                    }
                    Err(err) => {
                        return self
                            .finish_failed(started, step, Some(&source), &script_hash, err.into())
                            .await;
                    }
                }
            }
        }

        // Normalize everything the builder needs.
        let ctx = match build_context(
            params,
            step,
            source.clone(),
            script_hash.clone(),
            &resolved,
            request.timeout,
            &self.config,
        ) {
            Ok(ctx) => ctx,
            Err(err) => {
                return self
                    .finish_failed(started, step, Some(&source), &script_hash, err.into())
                    .await;
            }
        };

        // Build and submit the workload.
        let job = self.builder.build(&ctx);
        if let Err(err) = self
            .cluster
            .create_job(&self.config.cluster.namespace, &job)
            .await
        {
            return self
                .finish_failed(
                    started,
                    step,
                    Some(&ctx.source),
                    &ctx.script_hash,
                    ExecuteError::Submit(err),
                )
                .await;
        }
        info!(
            execution_id = %step.execution_id,
            job = %job.metadata.name,
            image = %ctx.image,
            source = ctx.source.kind(),
            "workload submitted"
        );

        // Watch to terminal state.
        let result = match self.monitor.wait(&job.metadata.name, ctx.timeout, cancel).await {
            Ok(result) => result,
            Err(err) => {
                return self
                    .finish_failed(started, step, Some(&ctx.source), &ctx.script_hash, err.into())
                    .await;
            }
        };

        self.finish_terminal(started, step, &ctx.source, &ctx.script_hash, &result)
            .await
    }

    async fn resolve_image(&self, params: Params<'_>) -> Result<ResolvedImage, ExecuteError> {
        let resolved = self
            .resolver
            .resolve(
                &params.string("image", ""),
                &params.string("image_ref", ""),
                &params.string("image_pull_policy", ""),
                &params.string("image_pull_secret", ""),
            )
            .await?;
        self.image_validator.validate(&resolved.image)?;
        Ok(resolved)
    }

    /// Creates the pending approval record and reports the step pending.
    async fn await_approval(
        &self,
        started: Instant,
        step: &StepContext,
        params: Params<'_>,
        source: &ScriptSource,
        script_hash: &str,
    ) -> ExecuteResponse {
        let Some(checker) = &self.approval else {
            // Unreachable from run_pipeline; kept total.
            return failed_response(started, "approval gating disabled".into());
        };
        if let Err(err) = checker
            .create_request(
                &step.execution_id,
                &step.step_name,
                &step.runbook_id,
                &step.user,
                source.content().unwrap_or_default(),
                script_hash,
                params.string_list("approvers"),
            )
            .await
        {
            return self
                .finish_failed(started, step, Some(source), script_hash, err.into())
                .await;
        }

        info!(
            execution_id = %step.execution_id,
            step = %step.step_name,
            "execution awaiting approval"
        );
        self.emit_audit(step, Some(source), script_hash, "pending", None)
            .await;
        ExecuteResponse {
            status: ExecStatus::Pending,
            output: None,
            error: Some("Awaiting approval".into()),
            duration: started.elapsed(),
        }
    }

    async fn finish_terminal(
        &self,
        started: Instant,
        step: &StepContext,
        source: &ScriptSource,
        script_hash: &str,
        result: &ExecutionResult,
    ) -> ExecuteResponse {
        let outcome = if result.succeeded { "succeeded" } else { "failed" };
        self.emit_audit(step, Some(source), script_hash, outcome, Some(result))
            .await;

        let output = ExecutionOutput {
            exit_code: result.exit_code,
            output: result.output.clone(),
            duration_seconds: result.duration.as_secs_f64(),
            script_hash: script_hash.to_string(),
            job_name: result.job_name.clone(),
            pod_name: result.pod_name.clone(),
        };
        ExecuteResponse {
            status: if result.succeeded {
                ExecStatus::Succeeded
            } else {
                ExecStatus::Failed
            },
            error: (!result.succeeded).then(|| format!("exit code {}", result.exit_code)),
            output: Some(output),
            duration: started.elapsed(),
        }
    }

    async fn finish_failed(
        &self,
        started: Instant,
        step: &StepContext,
        source: Option<&ScriptSource>,
        script_hash: &str,
        error: ExecuteError,
    ) -> ExecuteResponse {
        let outcome = match error {
            ExecuteError::Denied => "denied",
            _ => "failed",
        };
        warn!(
            execution_id = %step.execution_id,
            step = %step.step_name,
            error = %error,
            "execution did not run to completion"
        );
        self.emit_audit(step, source, script_hash, outcome, None).await;
        failed_response(started, error.to_string())
    }

    async fn emit_audit(
        &self,
        step: &StepContext,
        source: Option<&ScriptSource>,
        script_hash: &str,
        outcome: &str,
        result: Option<&ExecutionResult>,
    ) {
        let mut record = AuditRecord::new(
            &step.execution_id,
            &step.user,
            &step.runbook_id,
            outcome,
        );
        record.script_hash = script_hash.to_string();
        if let Some(source) = source {
            record = record.with_source(source);
        }
        if let Some(result) = result {
            record.duration_seconds = Some(result.duration.as_secs_f64());
            record.exit_code = Some(result.exit_code);
        }
        self.audit.emit(&record).await;
    }
}

fn normalize_step(context: &StepContext) -> StepContext {
    let mut step = context.clone();
    if step.execution_id.is_empty() {
        step.execution_id = format!("exec-{}", Uuid::new_v4().simple());
    }
    if step.step_name.is_empty() {
        step.step_name = "default".into();
    }
    step
}

fn failed_response(started: Instant, error: String) -> ExecuteResponse {
    ExecuteResponse {
        status: ExecStatus::Failed,
        output: None,
        error: Some(error),
        duration: started.elapsed(),
    }
}

/// Hex SHA-256 of the raw script bytes.
fn sha256_hex(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn step_normalization_fills_blanks() {
        let step = normalize_step(&StepContext::default());
        assert!(step.execution_id.starts_with("exec-"));
        assert_eq!(step.step_name, "default");

        let named = normalize_step(&StepContext {
            execution_id: "exec-7".into(),
            step_name: "deploy".into(),
            ..StepContext::default()
        });
        assert_eq!(named.execution_id, "exec-7");
        assert_eq!(named.step_name, "deploy");
    }
}
