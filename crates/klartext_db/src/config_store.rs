//! Pipeline configuration store.
//!
//! PipelineStep, DocumentClass and ModelSpec are read-mostly global
//! configuration managed outside the core. The executor takes an
//! immutable [`ConfigSnapshot`] at job start; changes made mid-flight do
//! not affect a running job.

use std::collections::HashMap;

use sqlx::{Pool, Sqlite};

use klartext_protocol::{OutputFormat, StopConditions};

use crate::error::Result;
use crate::models::{DocumentClass, ModelSpec, PipelineStep, PipelineStepRow};

pub struct ConfigStore {
    pool: Pool<Sqlite>,
}

/// Immutable view of the configuration taken at job start.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Enabled steps, sorted by `(order, id)`.
    pub steps: Vec<PipelineStep>,
    /// Enabled classes, keyed by class key.
    pub classes: HashMap<String, DocumentClass>,
    /// All models (enabled flag included), keyed by id.
    pub models: HashMap<i64, ModelSpec>,
}

/// Insert payload for seeding step configuration.
#[derive(Debug, Clone)]
pub struct NewPipelineStep {
    pub order: i64,
    pub name: String,
    pub enabled: bool,
    pub prompt_template: String,
    pub system_prompt: Option<String>,
    pub model_id: i64,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub output_format: OutputFormat,
    pub document_class_key: Option<String>,
    pub is_branching_step: bool,
    pub branching_field: Option<String>,
    pub post_branching: bool,
    pub source_language: Option<String>,
    pub required_context_variables: Vec<String>,
    pub stop_conditions: Option<StopConditions>,
}

impl NewPipelineStep {
    /// A minimal enabled text step; tests and seeds adjust from here.
    pub fn basic(order: i64, name: &str, model_id: i64) -> Self {
        Self {
            order,
            name: name.to_string(),
            enabled: true,
            prompt_template: "{input_text}".to_string(),
            system_prompt: None,
            model_id,
            temperature: 0.2,
            max_tokens: None,
            retry_on_failure: true,
            max_retries: 2,
            output_format: OutputFormat::Text,
            document_class_key: None,
            is_branching_step: false,
            branching_field: None,
            post_branching: false,
            source_language: None,
            required_context_variables: Vec::new(),
            stop_conditions: None,
        }
    }
}

impl ConfigStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Load the immutable configuration snapshot handed to the executor.
    pub async fn load_snapshot(&self) -> Result<ConfigSnapshot> {
        let step_rows: Vec<PipelineStepRow> = sqlx::query_as(
            r#"
            SELECT * FROM kx_pipeline_steps
            WHERE enabled = 1
            ORDER BY step_order ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let steps = step_rows
            .into_iter()
            .map(PipelineStep::try_from)
            .collect::<Result<Vec<_>>>()?;

        let class_rows: Vec<DocumentClass> =
            sqlx::query_as("SELECT * FROM kx_document_classes WHERE is_enabled = 1")
                .fetch_all(&self.pool)
                .await?;
        let classes = class_rows
            .into_iter()
            .map(|c| (c.class_key.clone(), c))
            .collect();

        let model_rows: Vec<ModelSpec> = sqlx::query_as("SELECT * FROM kx_model_specs")
            .fetch_all(&self.pool)
            .await?;
        let models = model_rows.into_iter().map(|m| (m.id, m)).collect();

        Ok(ConfigSnapshot {
            steps,
            classes,
            models,
        })
    }

    pub async fn insert_model(&self, spec: &ModelSpec) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO kx_model_specs
                (provider, name, display_name, max_tokens, supports_vision,
                 is_enabled, price_input_per_1m_tokens, price_output_per_1m_tokens)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&spec.provider)
        .bind(&spec.name)
        .bind(&spec.display_name)
        .bind(spec.max_tokens)
        .bind(spec.supports_vision)
        .bind(spec.is_enabled)
        .bind(spec.price_input_per_1m_tokens)
        .bind(spec.price_output_per_1m_tokens)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn insert_class(&self, class: &DocumentClass) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kx_document_classes
                (class_key, display_name, is_enabled, is_system_class)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&class.class_key)
        .bind(&class.display_name)
        .bind(class.is_enabled)
        .bind(class.is_system_class)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_step(&self, step: &NewPipelineStep) -> Result<i64> {
        let required = serde_json::to_string(&step.required_context_variables)?;
        let stop_conditions = step
            .stop_conditions
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let id = sqlx::query(
            r#"
            INSERT INTO kx_pipeline_steps
                (step_order, name, enabled, prompt_template, system_prompt, model_id,
                 temperature, max_tokens, retry_on_failure, max_retries, output_format,
                 document_class_key, is_branching_step, branching_field, post_branching,
                 source_language, required_context_variables, stop_conditions)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(step.order)
        .bind(&step.name)
        .bind(step.enabled)
        .bind(&step.prompt_template)
        .bind(&step.system_prompt)
        .bind(step.model_id)
        .bind(step.temperature)
        .bind(step.max_tokens.map(|v| v as i64))
        .bind(step.retry_on_failure)
        .bind(step.max_retries as i64)
        .bind(step.output_format)
        .bind(&step.document_class_key)
        .bind(step.is_branching_step)
        .bind(&step.branching_field)
        .bind(step.post_branching)
        .bind(&step.source_language)
        .bind(&required)
        .bind(&stop_conditions)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use klartext_crypto::FieldCipher;

    fn model(provider: &str, name: &str, enabled: bool) -> ModelSpec {
        ModelSpec {
            id: 0,
            provider: provider.into(),
            name: name.into(),
            display_name: name.into(),
            max_tokens: 4096,
            supports_vision: false,
            is_enabled: enabled,
            price_input_per_1m_tokens: Some(3.0),
            price_output_per_1m_tokens: Some(15.0),
        }
    }

    #[tokio::test]
    async fn snapshot_filters_disabled_and_sorts() {
        let db = Database::open_in_memory(FieldCipher::from_key_bytes(&[1u8; 32]))
            .await
            .unwrap();
        let cfg = db.config();

        let model_id = cfg.insert_model(&model("anthropic", "claude", true)).await.unwrap();
        cfg.insert_class(&DocumentClass {
            class_key: "ARZTBRIEF".into(),
            display_name: "Arztbrief".into(),
            is_enabled: true,
            is_system_class: true,
        })
        .await
        .unwrap();
        cfg.insert_class(&DocumentClass {
            class_key: "LABOR".into(),
            display_name: "Laborbericht".into(),
            is_enabled: false,
            is_system_class: false,
        })
        .await
        .unwrap();

        // Same order; id breaks the tie deterministically.
        cfg.insert_step(&NewPipelineStep::basic(2, "b", model_id)).await.unwrap();
        cfg.insert_step(&NewPipelineStep::basic(2, "c", model_id)).await.unwrap();
        cfg.insert_step(&NewPipelineStep::basic(1, "a", model_id)).await.unwrap();
        let mut disabled = NewPipelineStep::basic(0, "off", model_id);
        disabled.enabled = false;
        cfg.insert_step(&disabled).await.unwrap();

        let snapshot = cfg.load_snapshot().await.unwrap();
        let names: Vec<_> = snapshot.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(snapshot.classes.contains_key("ARZTBRIEF"));
        assert!(!snapshot.classes.contains_key("LABOR"));
        assert_eq!(snapshot.models.len(), 1);
    }
}
