//! End-to-end scenarios: enqueue -> claim -> extract -> scrub -> execute ->
//! finalize, against an in-memory store and a scripted mock provider.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use klartext_crypto::FieldCipher;
use klartext_db::{Database, DocumentClass, ModelSpec, NewJob, NewPipelineStep};
use klartext_llm::{LlmError, MockProvider, MockResponse, ProviderRegistry};
use klartext_protocol::defaults::{ERROR_CANCELLED, ERROR_ORPHANED, ERROR_TIMEOUT};
use klartext_protocol::{
    JobStatus, OutputFormat, ProcessingOptions, StepStatus, StopConditions, SystemConfig,
};
use klartext_worker::maintenance::{sweep_orphans, sweep_retention};
use klartext_worker::{
    CancelRegistry, JobDispatcher, PlainTextExtractor, RegexScrubber, WorkerPool,
};

struct Harness {
    db: Database,
    mock: Arc<MockProvider>,
    dispatcher: JobDispatcher,
    pool: WorkerPool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    model_id: i64,
}

async fn harness() -> Harness {
    let db = Database::open_in_memory(FieldCipher::from_key_bytes(&[11u8; 32]))
        .await
        .unwrap();

    let model_id = db
        .config()
        .insert_model(&ModelSpec {
            id: 0,
            provider: "mock".into(),
            name: "mock-model".into(),
            display_name: "Mock".into(),
            max_tokens: 4096,
            supports_vision: false,
            is_enabled: true,
            price_input_per_1m_tokens: Some(3.0),
            price_output_per_1m_tokens: Some(15.0),
        })
        .await
        .unwrap();
    db.config()
        .insert_class(&DocumentClass {
            class_key: "ARZTBRIEF".into(),
            display_name: "Arztbrief".into(),
            is_enabled: true,
            is_system_class: true,
        })
        .await
        .unwrap();

    let mock = Arc::new(MockProvider::new());
    let registry = Arc::new(ProviderRegistry::new().with(mock.clone()));
    let cancels = Arc::new(CancelRegistry::new());

    let config = SystemConfig {
        workers: 1,
        job_timeout: Duration::from_secs(10),
        step_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(50),
        queue_poll: Duration::from_millis(20),
        ..SystemConfig::default()
    };

    let dispatcher = JobDispatcher::new(db.clone(), Arc::clone(&cancels));
    let pool = WorkerPool::new(
        db.clone(),
        registry,
        Arc::new(PlainTextExtractor),
        Arc::new(RegexScrubber::new()),
        cancels,
        config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    Harness {
        db,
        mock,
        dispatcher,
        pool,
        shutdown_tx,
        shutdown_rx,
        model_id,
    }
}

impl Harness {
    async fn seed_standard_pipeline(&self) {
        let cfg = self.db.config();

        let mut classify = NewPipelineStep::basic(1, "classify", self.model_id);
        classify.is_branching_step = true;
        classify.branching_field = Some("document_type".into());
        classify.output_format = OutputFormat::Json;
        classify.prompt_template = "Classify:\n{input_text}".into();
        cfg.insert_step(&classify).await.unwrap();

        let mut translate = NewPipelineStep::basic(2, "translate", self.model_id);
        translate.document_class_key = Some("ARZTBRIEF".into());
        translate.prompt_template = "Translate:\n{input_text}".into();
        cfg.insert_step(&translate).await.unwrap();

        let mut format = NewPipelineStep::basic(3, "format", self.model_id);
        format.post_branching = true;
        format.prompt_template = "Format:\n{input_text}".into();
        cfg.insert_step(&format).await.unwrap();
    }

    async fn create_job(&self, pid: &str, content: &[u8], options: ProcessingOptions) -> i64 {
        self.db
            .jobs()
            .create(NewJob {
                processing_id: pid.into(),
                filename: "brief.txt".into(),
                mime_type: "text/plain".into(),
                file_content: content.to_vec(),
                processing_options: options,
            })
            .await
            .unwrap()
            .id
    }

    /// Run the pool until the job reaches a terminal state (or panic
    /// after `secs` seconds).
    async fn run_until_terminal(&self, pid: &str, secs: u64) -> JobStatus {
        let mut units = self.pool.spawn(self.shutdown_rx.clone());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);

        let status = loop {
            let job = self.db.jobs().get_by_processing_id(pid).await.unwrap();
            if job.status.is_terminal() {
                break job.status;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job {pid} did not reach a terminal state, stuck at {}", job.status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        self.shutdown_tx.send(true).unwrap();
        while units.join_next().await.is_some() {}
        status
    }
}

#[tokio::test]
async fn full_run_completes_and_preserves_ciphertext() {
    let h = harness().await;
    h.seed_standard_pipeline().await;

    let original = b"Sehr geehrte Kollegin, wir berichten ueber Ihren Patienten.".to_vec();
    let job_id = h.create_job("s1", &original, ProcessingOptions::default()).await;
    let ciphertext_before = h.db.jobs().file_ciphertext(job_id).await.unwrap();

    h.mock.queue_response(MockResponse::text(r#"{"document_type":"ARZTBRIEF"}"#));
    h.mock.queue_response(MockResponse::text("translated"));
    h.mock.queue_response(MockResponse::text("formatted"));

    h.dispatcher.enqueue("s1", &ProcessingOptions::default()).await.unwrap();
    let status = h.run_until_terminal("s1", 5).await;
    assert_eq!(status, JobStatus::Completed);

    let job = h.db.jobs().get_by_processing_id("s1").await.unwrap();
    assert_eq!(job.progress_percent, 100);
    assert_eq!(job.result_data["document_type"], "ARZTBRIEF");
    assert_eq!(job.result_data["final_text"], "formatted");

    // Document bytes were written exactly once: the at-rest ciphertext
    // is byte-identical across the whole run, and still decrypts.
    let ciphertext_after = h.db.jobs().file_ciphertext(job_id).await.unwrap();
    assert_eq!(ciphertext_before, ciphertext_after);
    assert_eq!(job.file_content, original);

    let executions = h.db.steps().for_job(job_id).await.unwrap();
    assert_eq!(executions.len(), 3);
    assert!(executions.iter().all(|e| e.status == StepStatus::Completed));
    assert_eq!(h.db.ledger().for_job(job_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn duplicate_enqueue_runs_job_once() {
    let h = harness().await;
    let mut step = NewPipelineStep::basic(1, "summarize", h.model_id);
    step.prompt_template = "Summarize: {input_text}".into();
    h.db.config().insert_step(&step).await.unwrap();

    h.create_job("dup", b"inhalt", ProcessingOptions::default()).await;
    h.mock.queue_response(MockResponse::text("summary"));
    h.mock.queue_response(MockResponse::text("unexpected second run"));

    let opts = ProcessingOptions::default();
    h.dispatcher.enqueue("dup", &opts).await.unwrap();
    h.dispatcher.enqueue("dup", &opts).await.unwrap();

    let status = h.run_until_terminal("dup", 5).await;
    assert_eq!(status, JobStatus::Completed);

    // Exactly one provider call happened; the duplicate was suppressed.
    assert_eq!(h.mock.requests().len(), 1);
    assert_eq!(h.mock.remaining(), 1);
}

#[tokio::test]
async fn stop_condition_terminates_job() {
    let h = harness().await;
    let mut gate = NewPipelineStep::basic(1, "triage", h.model_id);
    gate.stop_conditions = Some(StopConditions {
        stop_on_values: ["NON_MEDICAL".to_string()].into_iter().collect(),
        termination_reason: "non_medical_document".into(),
        termination_message: "Das Dokument ist kein medizinisches Dokument.".into(),
    });
    gate.prompt_template = "Triage: {input_text}".into();
    h.db.config().insert_step(&gate).await.unwrap();
    let mut translate = NewPipelineStep::basic(2, "translate", h.model_id);
    translate.prompt_template = "Translate: {input_text}".into();
    h.db.config().insert_step(&translate).await.unwrap();

    h.create_job("s3", b"Rechnung Nr. 42", ProcessingOptions::default()).await;
    h.mock.queue_response(MockResponse::text("NON_MEDICAL - invoice"));

    h.dispatcher.enqueue("s3", &ProcessingOptions::default()).await.unwrap();
    let status = h.run_until_terminal("s3", 5).await;
    assert_eq!(status, JobStatus::Terminated);

    let job = h.db.jobs().get_by_processing_id("s3").await.unwrap();
    assert_eq!(job.result_data["termination_reason"], "non_medical_document");
    assert_eq!(
        job.result_data["termination_message"],
        "Das Dokument ist kein medizinisches Dokument."
    );
    // The translate step never ran.
    assert_eq!(h.db.steps().for_job(job.id).await.unwrap().len(), 1);
    assert_eq!(h.mock.requests().len(), 1);
}

#[tokio::test]
async fn gated_step_skipped_without_target_language() {
    let h = harness().await;
    let mut translate = NewPipelineStep::basic(1, "translate", h.model_id);
    translate.required_context_variables = vec!["target_language".to_string()];
    translate.prompt_template = "To {target_language}: {input_text}".into();
    h.db.config().insert_step(&translate).await.unwrap();

    // Empty document text exercises the empty-OCR boundary too.
    h.create_job("s4", b"", ProcessingOptions::default()).await;
    h.dispatcher.enqueue("s4", &ProcessingOptions::default()).await.unwrap();

    let status = h.run_until_terminal("s4", 5).await;
    assert_eq!(status, JobStatus::Completed);

    let job = h.db.jobs().get_by_processing_id("s4").await.unwrap();
    let executions = h.db.steps().for_job(job.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, StepStatus::Skipped);
    // No LLM call was made at all.
    assert_eq!(h.mock.requests().len(), 0);
}

#[tokio::test]
async fn retry_exhaustion_fails_job_with_step_name() {
    let h = harness().await;
    let mut step = NewPipelineStep::basic(1, "clean", h.model_id);
    step.max_retries = 3;
    step.prompt_template = "Clean: {input_text}".into();
    h.db.config().insert_step(&step).await.unwrap();

    h.create_job("s5", b"inhalt", ProcessingOptions::default()).await;
    h.mock.queue_errors(5, || LlmError::Provider {
        provider: "mock".into(),
        status: 503,
        message: "unavailable".into(),
    });

    h.dispatcher.enqueue("s5", &ProcessingOptions::default()).await.unwrap();
    let status = h.run_until_terminal("s5", 30).await;
    assert_eq!(status, JobStatus::Failed);

    let job = h.db.jobs().get_by_processing_id("s5").await.unwrap();
    let error = job.error_message.unwrap();
    assert!(error.contains("clean"), "error should name the step: {error}");

    // 1 initial + 3 retries.
    assert_eq!(h.db.steps().for_job(job.id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn cancellation_between_steps_fails_job() {
    let h = harness().await;
    let cfg = h.db.config();
    let mut slow = NewPipelineStep::basic(1, "slow", h.model_id);
    slow.prompt_template = "Slow: {input_text}".into();
    cfg.insert_step(&slow).await.unwrap();
    let mut second = NewPipelineStep::basic(2, "second", h.model_id);
    second.prompt_template = "Second: {input_text}".into();
    cfg.insert_step(&second).await.unwrap();

    h.create_job("cx", b"inhalt", ProcessingOptions::default()).await;
    h.mock.queue_response(MockResponse::text("slow done").with_delay(300));
    h.mock.queue_response(MockResponse::text("never used"));

    h.dispatcher.enqueue("cx", &ProcessingOptions::default()).await.unwrap();
    let mut units = h.pool.spawn(h.shutdown_rx.clone());

    // Wait until the first step is in flight, then cancel mid-step.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !h.mock.requests().is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "step never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.dispatcher.cancel("cx").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let job = loop {
        let job = h.db.jobs().get_by_processing_id("cx").await.unwrap();
        if job.status.is_terminal() {
            break job;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    h.shutdown_tx.send(true).unwrap();
    while units.join_next().await.is_some() {}

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some(ERROR_CANCELLED));

    // The in-flight step completed; the second step never started.
    let executions = h.db.steps().for_job(job.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].step_name, "slow");
    assert_eq!(executions[0].status, StepStatus::Completed);
}

#[tokio::test]
async fn job_exceeding_wall_clock_budget_fails_with_timeout() {
    let h = harness().await;
    let mut slow = NewPipelineStep::basic(1, "slow", h.model_id);
    slow.prompt_template = "Slow: {input_text}".into();
    h.db.config().insert_step(&slow).await.unwrap();

    h.create_job("deadline", b"inhalt", ProcessingOptions::default()).await;
    h.mock.queue_response(MockResponse::text("too late").with_delay(600));
    h.dispatcher.enqueue("deadline", &ProcessingOptions::default()).await.unwrap();

    // A pool with a budget shorter than the single step.
    let config = SystemConfig {
        workers: 1,
        job_timeout: Duration::from_millis(150),
        step_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(50),
        queue_poll: Duration::from_millis(20),
        ..SystemConfig::default()
    };
    let registry = Arc::new(ProviderRegistry::new().with(h.mock.clone()));
    let pool = WorkerPool::new(
        h.db.clone(),
        registry,
        Arc::new(PlainTextExtractor),
        Arc::new(RegexScrubber::new()),
        Arc::new(CancelRegistry::new()),
        config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut units = pool.spawn(shutdown_rx);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let job = loop {
        let job = h.db.jobs().get_by_processing_id("deadline").await.unwrap();
        if job.status.is_terminal() {
            break job;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    shutdown_tx.send(true).unwrap();
    while units.join_next().await.is_some() {}

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some(ERROR_TIMEOUT));
}

#[tokio::test]
async fn orphaned_job_is_failed_and_task_redelivered() {
    let h = harness().await;
    h.create_job("lost", b"inhalt", ProcessingOptions::default()).await;
    h.dispatcher.enqueue("lost", &ProcessingOptions::default()).await.unwrap();

    // Simulate a worker that claimed the task, marked the job RUNNING,
    // and died mid-step without acknowledging.
    let task = h.db.queue().claim("w-dead").await.unwrap().unwrap();
    assert!(h.db.jobs().mark_running("lost").await.unwrap());

    // Backdate both the task heartbeat and the job activity.
    sqlx::query("UPDATE kx_task_queue SET last_heartbeat = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::seconds(600))
        .bind(task.id)
        .execute(h.db.pool())
        .await
        .unwrap();
    sqlx::query("UPDATE kx_jobs SET updated_at = ? WHERE processing_id = 'lost'")
        .bind(Utc::now() - chrono::Duration::seconds(7200))
        .execute(h.db.pool())
        .await
        .unwrap();

    let config = SystemConfig {
        stale_task_after: Duration::from_secs(60),
        stale_job_after: Duration::from_secs(3600),
        ..SystemConfig::default()
    };
    let (requeued, orphaned) = sweep_orphans(&h.db, &config).await.unwrap();
    assert_eq!(requeued, 1);
    assert_eq!(orphaned, 1);

    let job = h.db.jobs().get_by_processing_id("lost").await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some(ERROR_ORPHANED));

    // The redelivered task is claimable again; pickup then observes the
    // terminal job and drops the duplicate.
    let redelivered = h.db.queue().claim("w-2").await.unwrap().unwrap();
    assert_eq!(redelivered.id, task.id);
}

#[tokio::test]
async fn corrupted_ciphertext_fails_job_immediately() {
    let h = harness().await;
    let mut step = NewPipelineStep::basic(1, "summarize", h.model_id);
    step.prompt_template = "Summarize: {input_text}".into();
    h.db.config().insert_step(&step).await.unwrap();

    let job_id = h.create_job("corrupt", b"inhalt", ProcessingOptions::default()).await;
    h.dispatcher.enqueue("corrupt", &ProcessingOptions::default()).await.unwrap();

    // Flip bytes in the stored envelope; authentication must now fail.
    sqlx::query("UPDATE kx_jobs SET file_content = ? WHERE id = ?")
        .bind(vec![0u8; 4])
        .bind(job_id)
        .execute(h.db.pool())
        .await
        .unwrap();

    // The job value can no longer be loaded, so poll the raw status.
    let mut units = h.pool.spawn(h.shutdown_rx.clone());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status: String = sqlx::query_scalar("SELECT status FROM kx_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(h.db.pool())
            .await
            .unwrap();
        if status == "FAILED" {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job stuck at {status}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    h.shutdown_tx.send(true).unwrap();
    while units.join_next().await.is_some() {}

    let job_error: Option<String> =
        sqlx::query_scalar("SELECT error_message FROM kx_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(h.db.pool())
            .await
            .unwrap();
    assert!(job_error.unwrap().contains("decryption error"));
    // No step ran and no tokens were spent.
    assert_eq!(h.mock.requests().len(), 0);
}

#[tokio::test]
async fn retention_sweep_removes_old_jobs_keeps_recent_ledger() {
    let h = harness().await;
    let job_id = h.create_job("old", b"inhalt", ProcessingOptions::default()).await;

    // Backdate the job past the 7-day window; its ledger row stays
    // within the 90-day window.
    sqlx::query("UPDATE kx_jobs SET created_at = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::days(10))
        .bind(job_id)
        .execute(h.db.pool())
        .await
        .unwrap();
    h.db.ledger()
        .log(klartext_db::NewCostEntry {
            job_id,
            step_name: "translate".into(),
            input_tokens: 10,
            output_tokens: 10,
            model_provider: "mock".into(),
            model_name: "mock-model".into(),
            price_input_per_1m_tokens: Some(3.0),
            price_output_per_1m_tokens: Some(15.0),
            processing_time_seconds: 0.5,
            document_type: None,
            metadata: serde_json::Map::new(),
        })
        .await
        .unwrap();

    let (jobs, ledger) = sweep_retention(&h.db, &SystemConfig::default()).await.unwrap();
    assert_eq!(jobs, 1);
    assert_eq!(ledger, 0);
    assert!(h.db.jobs().get(job_id).await.is_err());
    assert_eq!(h.db.ledger().for_job(job_id).await.unwrap().len(), 1);
}
