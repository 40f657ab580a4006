//! Step executor.
//!
//! Drives one job through the resolved plan: gating, prompt rendering,
//! provider invocation with per-step timeout and retry, stop-condition
//! checks, branching capture, encrypted persistence of every attempt,
//! cost accounting, and monotone progress updates. Terminal results are
//! explicit [`PipelineOutcome`] variants; only infrastructure failures
//! surface as errors.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::time::timeout;
use tracing::{info, warn};

use klartext_db::{
    ConfigSnapshot, Database, DbError, Job, ModelSpec, NewCostEntry, NewStepExecution,
    PipelineStep,
};
use klartext_llm::{ChatRequest, ChatResponse, LlmError, ProviderRegistry};
use klartext_protocol::defaults::{
    DEFAULT_RETRY_BASE_MS, DEFAULT_RETRY_CAP_MS, DEFAULT_STEP_TIMEOUT_SECS, ERROR_CANCELLED,
};
use klartext_protocol::{CancellationToken, OutputFormat, PipelineOutcome, StepStatus};

use crate::context::{RunContext, KEY_SOURCE_LANGUAGE};
use crate::error::Result;
use crate::plan::ExecutionPlan;

/// Timing knobs, overridable for tests.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Wall-clock budget per LLM invocation.
    pub step_timeout: Duration,
    /// Exponential backoff base between retry attempts.
    pub retry_base: Duration,
    /// Backoff ceiling.
    pub retry_cap: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            retry_cap: Duration::from_millis(DEFAULT_RETRY_CAP_MS),
        }
    }
}

/// Executes resolved plans against LLM providers for one job at a time.
pub struct PipelineExecutor {
    db: Database,
    providers: Arc<ProviderRegistry>,
    config: ExecutorConfig,
}

/// Disposition of one step after the retry loop.
enum StepRun {
    Completed(String),
    Skipped,
    Terminated {
        reason: String,
        message: String,
        token: String,
    },
    Failed {
        error: String,
    },
}

/// Short-circuit signal from step handling back to the segment walk.
enum Flow {
    Continue,
    Finish(PipelineOutcome),
}

struct RunState {
    job_id: i64,
    total_steps: usize,
    resolved_steps: usize,
}

impl PipelineExecutor {
    pub fn new(db: Database, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            db,
            providers,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute the pipeline for one job over the PII-scrubbed text.
    ///
    /// The snapshot was taken at job start; configuration changes made
    /// mid-flight do not apply.
    pub async fn execute(
        &self,
        job: &Job,
        scrubbed_text: &str,
        snapshot: &ConfigSnapshot,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let plan = ExecutionPlan::resolve(snapshot)?;
        let mut ctx = RunContext::seed(scrubbed_text, &job.processing_options);
        let hinted = job.processing_options.normalized_hint();
        if let Some(hint) = &hinted {
            ctx.set_document_type(hint);
            info!(job_id = job.id, document_type = %hint, "Classification seeded from hint");
        }

        let mut state = RunState {
            job_id: job.id,
            total_steps: plan.total_steps(),
            resolved_steps: 0,
        };

        for step in plan.pre_branch() {
            match self
                .drive_step(&mut state, &mut ctx, step, snapshot, cancel, false)
                .await?
            {
                Flow::Continue => {}
                Flow::Finish(outcome) => return Ok(outcome),
            }
        }

        if let Some(branch) = plan.branching() {
            match self
                .drive_step(&mut state, &mut ctx, branch, snapshot, cancel, true)
                .await?
            {
                Flow::Continue => {}
                Flow::Finish(outcome) => return Ok(outcome),
            }
        }

        for step in plan.pre_post_branch() {
            match self
                .drive_step(&mut state, &mut ctx, step, snapshot, cancel, false)
                .await?
            {
                Flow::Continue => {}
                Flow::Finish(outcome) => return Ok(outcome),
            }
        }

        let selected = ctx.document_type().map(str::to_string);
        for (class_key, step) in plan.class_steps_ordered() {
            if selected.as_deref() == Some(class_key) {
                match self
                    .drive_step(&mut state, &mut ctx, step, snapshot, cancel, false)
                    .await?
                {
                    Flow::Continue => {}
                    Flow::Finish(outcome) => return Ok(outcome),
                }
            } else {
                self.record_skip(
                    &mut state,
                    step,
                    format!("document class {class_key} not selected"),
                )
                .await?;
            }
        }

        for step in plan.post() {
            match self
                .drive_step(&mut state, &mut ctx, step, snapshot, cancel, false)
                .await?
            {
                Flow::Continue => {}
                Flow::Finish(outcome) => return Ok(outcome),
            }
        }

        let mut result = Map::new();
        if let Some(document_type) = ctx.document_type() {
            result.insert("document_type".into(), json!(document_type));
        }
        result.insert("final_text".into(), json!(ctx.input_text()));
        Ok(PipelineOutcome::Completed { result })
    }

    /// Run one step and fold its disposition into the walk. The
    /// branching step is the only step whose failure does not fail the
    /// job: the class segment is skipped and execution continues.
    async fn drive_step(
        &self,
        state: &mut RunState,
        ctx: &mut RunContext,
        step: &PipelineStep,
        snapshot: &ConfigSnapshot,
        cancel: &CancellationToken,
        is_branch: bool,
    ) -> Result<Flow> {
        // Cancellation is cooperative and observed between steps only.
        if cancel.is_cancelled() {
            info!(job_id = state.job_id, step = %step.name, "Cancellation observed between steps");
            return Ok(Flow::Finish(PipelineOutcome::failed(ERROR_CANCELLED)));
        }

        match self.run_step(state, ctx, step, snapshot).await? {
            StepRun::Completed(output) => {
                // A hint seeded the classification already; the
                // classifier then runs for audit only.
                if is_branch && ctx.document_type().is_none() {
                    match parse_classification(&output, step.branching_field.as_deref()) {
                        Some(class_key) => {
                            info!(job_id = state.job_id, document_type = %class_key, "Document classified");
                            ctx.set_document_type(&class_key);
                        }
                        None => warn!(
                            job_id = state.job_id,
                            step = %step.name,
                            "No classification obtained; class segment will be skipped"
                        ),
                    }
                }
                ctx.set_input_text(output);
                self.step_resolved(state).await;
                Ok(Flow::Continue)
            }
            StepRun::Skipped => {
                self.step_resolved(state).await;
                Ok(Flow::Continue)
            }
            StepRun::Terminated {
                reason,
                message,
                token,
            } => {
                let mut result = Map::new();
                result.insert("termination_reason".into(), json!(reason));
                result.insert("termination_message".into(), json!(message));
                result.insert("matched_token".into(), json!(token));
                if let Some(document_type) = ctx.document_type() {
                    result.insert("document_type".into(), json!(document_type));
                }
                Ok(Flow::Finish(PipelineOutcome::Terminated {
                    reason,
                    message,
                    result,
                }))
            }
            StepRun::Failed { error } => {
                if is_branch {
                    warn!(
                        job_id = state.job_id,
                        step = %step.name,
                        %error,
                        "Branching step failed; continuing without classification"
                    );
                    self.step_resolved(state).await;
                    Ok(Flow::Continue)
                } else {
                    Ok(Flow::Finish(PipelineOutcome::failed_step(&step.name, error)))
                }
            }
        }
    }

    /// Gate, render, invoke with retry, parse, and persist one step.
    async fn run_step(
        &self,
        state: &mut RunState,
        ctx: &mut RunContext,
        step: &PipelineStep,
        snapshot: &ConfigSnapshot,
    ) -> Result<StepRun> {
        let missing = ctx.missing_vars(&step.required_context_variables);
        if !missing.is_empty() {
            let reason = format!("missing required context: {}", missing.join(", "));
            info!(job_id = state.job_id, step = %step.name, %reason, "Step skipped");
            self.persist_attempt(NewStepExecution {
                job_id: state.job_id,
                step_name: step.name.clone(),
                step_order: step.order,
                attempt: 1,
                input_text: None,
                output_text: None,
                status: StepStatus::Skipped,
                started_at: Some(Utc::now()),
                finished_at: Some(Utc::now()),
                error_message: Some(reason),
            })
            .await?;
            return Ok(StepRun::Skipped);
        }

        if let Some(language) = &step.source_language {
            ctx.set(KEY_SOURCE_LANGUAGE, language.clone());
        }

        let prompt = ctx.render(&step.prompt_template);
        let input_snapshot = ctx.input_text().to_string();

        // Resolver guarantees the model exists and is enabled.
        let model = snapshot
            .models
            .get(&step.model_id)
            .ok_or_else(|| crate::PipelineError::config(format!(
                "step '{}' references unknown model id {}",
                step.name, step.model_id
            )))?;

        let Some(provider) = self.providers.get(&model.provider) else {
            let error = format!("no provider registered for '{}'", model.provider);
            self.persist_attempt(self.attempt_row(
                state,
                step,
                1,
                Some(input_snapshot),
                None,
                StepStatus::Failed,
                Some(error.clone()),
            ))
            .await?;
            return Ok(StepRun::Failed { error });
        };

        let request = ChatRequest {
            model: model.name.clone(),
            system: step.system_prompt.clone(),
            prompt,
            temperature: step.temperature as f32,
            max_tokens: step.max_tokens,
        };
        let max_attempts = if step.retry_on_failure {
            u64::from(step.max_retries) + 1
        } else {
            1
        };

        let mut attempt: u64 = 1;
        loop {
            let started = Utc::now();
            let outcome: std::result::Result<ChatResponse, LlmError> =
                match timeout(self.config.step_timeout, provider.complete(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout),
                };
            let finished = Utc::now();
            let elapsed_secs = (finished - started).num_milliseconds().max(0) as f64 / 1000.0;

            match outcome {
                Ok(response) => {
                    // Classify the response first; the attempt row is
                    // inserted with its final status, and the ledger row
                    // follows it (tokens were consumed either way).
                    let json_failure = step.output_format == OutputFormat::Json
                        && parse_json_lenient(&response.text).is_none();
                    let stop_token = if json_failure {
                        None
                    } else {
                        step.stop_conditions
                            .as_ref()
                            .and_then(|stop| stop.matches(&response.text))
                    };

                    let (status, error_message) = if json_failure {
                        (StepStatus::Failed, Some("output is not valid JSON".to_string()))
                    } else if stop_token.is_some() {
                        (StepStatus::Terminated, None)
                    } else {
                        (StepStatus::Completed, None)
                    };

                    self.persist_attempt(self.attempt_row(
                        state,
                        step,
                        attempt as i64,
                        Some(input_snapshot.clone()),
                        Some(response.text.clone()),
                        status,
                        error_message.clone(),
                    ))
                    .await?;
                    self.log_cost(state, step, model, &response, elapsed_secs, ctx, attempt)
                        .await;

                    if let Some(error) = error_message {
                        if attempt < max_attempts {
                            warn!(
                                job_id = state.job_id,
                                step = %step.name,
                                attempt,
                                "JSON parse failure; retrying"
                            );
                            tokio::time::sleep(self.backoff_delay(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Ok(StepRun::Failed { error });
                    }

                    if let (Some(token), Some(stop)) = (stop_token, &step.stop_conditions) {
                        info!(
                            job_id = state.job_id,
                            step = %step.name,
                            %token,
                            "Stop condition matched; terminating pipeline"
                        );
                        return Ok(StepRun::Terminated {
                            reason: stop.termination_reason.clone(),
                            message: stop.termination_message.clone(),
                            token,
                        });
                    }

                    info!(
                        job_id = state.job_id,
                        step = %step.name,
                        attempt,
                        output_len = response.text.len(),
                        "Step completed"
                    );
                    return Ok(StepRun::Completed(response.text));
                }
                Err(err) => {
                    let error = err.to_string();
                    self.persist_attempt(self.attempt_row(
                        state,
                        step,
                        attempt as i64,
                        Some(input_snapshot.clone()),
                        None,
                        StepStatus::Failed,
                        Some(error.clone()),
                    ))
                    .await?;

                    if err.is_retryable() && attempt < max_attempts {
                        warn!(
                            job_id = state.job_id,
                            step = %step.name,
                            attempt,
                            %error,
                            "Transient step failure; retrying"
                        );
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(StepRun::Failed { error });
                }
            }
        }
    }

    fn attempt_row(
        &self,
        state: &RunState,
        step: &PipelineStep,
        attempt: i64,
        input_text: Option<String>,
        output_text: Option<String>,
        status: StepStatus,
        error_message: Option<String>,
    ) -> NewStepExecution {
        NewStepExecution {
            job_id: state.job_id,
            step_name: step.name.clone(),
            step_order: step.order,
            attempt,
            input_text,
            output_text,
            status,
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
            error_message,
        }
    }

    /// Record a class-mismatch skip.
    async fn record_skip(
        &self,
        state: &mut RunState,
        step: &PipelineStep,
        reason: String,
    ) -> Result<()> {
        self.persist_attempt(NewStepExecution {
            job_id: state.job_id,
            step_name: step.name.clone(),
            step_order: step.order,
            attempt: 1,
            input_text: None,
            output_text: None,
            status: StepStatus::Skipped,
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
            error_message: Some(reason),
        })
        .await?;
        self.step_resolved(state).await;
        Ok(())
    }

    /// Persist an attempt row, retrying transport failures a bounded
    /// number of times before failing the job.
    async fn persist_attempt(&self, new: NewStepExecution) -> Result<()> {
        let mut tries = 0u32;
        loop {
            match self.db.steps().record(new.clone()).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    let transient = matches!(err, DbError::Sqlx(_) | DbError::Io(_));
                    if transient && tries < 2 {
                        tries += 1;
                        warn!(error = %err, tries, "Step persistence failed; retrying");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }

    /// Append a cost ledger row. Never fails the pipeline: failures are
    /// logged and swallowed.
    #[allow(clippy::too_many_arguments)]
    async fn log_cost(
        &self,
        state: &RunState,
        step: &PipelineStep,
        model: &ModelSpec,
        response: &ChatResponse,
        elapsed_secs: f64,
        ctx: &RunContext,
        attempt: u64,
    ) {
        let mut metadata = Map::new();
        metadata.insert("attempt".into(), json!(attempt));

        let entry = NewCostEntry {
            job_id: state.job_id,
            step_name: step.name.clone(),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            model_provider: model.provider.clone(),
            model_name: model.name.clone(),
            price_input_per_1m_tokens: model.price_input_per_1m_tokens,
            price_output_per_1m_tokens: model.price_output_per_1m_tokens,
            processing_time_seconds: elapsed_secs,
            document_type: ctx.document_type().map(str::to_string),
            metadata,
        };

        if let Err(err) = self.db.ledger().log(entry).await {
            warn!(
                job_id = state.job_id,
                step = %step.name,
                error = %err,
                "Cost ledger write failed; continuing"
            );
        }
    }

    /// Count a resolved (completed, skipped, or tolerated-failed) step
    /// and push the monotone progress update. Progress is cosmetic:
    /// write failures are logged and swallowed.
    async fn step_resolved(&self, state: &mut RunState) {
        state.resolved_steps += 1;
        let percent = (100 * state.resolved_steps / state.total_steps.max(1)) as i64;
        if let Err(err) = self.db.jobs().advance_progress(state.job_id, percent).await {
            warn!(job_id = state.job_id, error = %err, "Progress update failed; continuing");
        }
    }

    fn backoff_delay(&self, attempt: u64) -> Duration {
        backoff_delay(self.config.retry_base, self.config.retry_cap, attempt)
    }
}

/// `base * 2^(attempt-1)`, capped. No jitter: deterministic backoff
/// keeps retry timing testable.
fn backoff_delay(base: Duration, cap: Duration, attempt: u64) -> Duration {
    let factor = 1u32 << (attempt.min(16) as u32).saturating_sub(1);
    base.saturating_mul(factor).min(cap)
}

/// Best-effort JSON parse: as-is first, then with Markdown code fences
/// stripped.
fn parse_json_lenient(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    serde_json::from_str(strip_code_fences(trimmed)).ok()
}

/// Read the classification out of a branching step's output.
fn parse_classification(output: &str, branching_field: Option<&str>) -> Option<String> {
    let field = branching_field?;
    let value = parse_json_lenient(output)?;
    let class = value.get(field)?.as_str()?.trim().to_uppercase();
    (!class.is_empty()).then_some(class)
}

fn strip_code_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the optional language tag on the opening fence line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
