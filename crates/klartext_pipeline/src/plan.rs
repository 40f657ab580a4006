//! Pipeline resolver.
//!
//! Flattens the configured steps into an execution plan the executor
//! walks: pre-branch steps, the single optional branching step, the
//! pre steps ordered after it, the class-specific segments, and the
//! post-branch steps. Structural violations are rejected here, before
//! any LLM call is made.

use std::collections::BTreeMap;

use tracing::warn;

use klartext_db::{ConfigSnapshot, ModelSpec, PipelineStep};

use crate::error::{PipelineError, Result};

/// Tagged step kind derived from the row flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// Class-independent, runs before the class segment.
    Pre,
    /// The single classification step.
    Branch,
    /// Bound to one document class.
    Class(String),
    /// Class-independent, runs after the class segment.
    Post,
}

/// Classify a step's role and reject contradictory flag combinations.
pub fn kind_of(step: &PipelineStep) -> Result<StepKind> {
    if let Some(class_key) = &step.document_class_key {
        if step.is_branching_step {
            return Err(PipelineError::config(format!(
                "step '{}' is marked branching but bound to class {class_key}",
                step.name
            )));
        }
        if step.post_branching {
            return Err(PipelineError::config(format!(
                "step '{}' is marked post-branching but bound to class {class_key}",
                step.name
            )));
        }
        return Ok(StepKind::Class(class_key.to_uppercase()));
    }
    if step.is_branching_step {
        if step.post_branching {
            return Err(PipelineError::config(format!(
                "branching step '{}' cannot be post-branching",
                step.name
            )));
        }
        if step.branching_field.as_deref().map_or(true, str::is_empty) {
            return Err(PipelineError::config(format!(
                "branching step '{}' has no branching_field",
                step.name
            )));
        }
        return Ok(StepKind::Branch);
    }
    if step.post_branching {
        return Ok(StepKind::Post);
    }
    Ok(StepKind::Pre)
}

/// The resolved, immutable plan for one job.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Pre steps with order ≤ the branching step's order (all pre steps
    /// when there is no branching step).
    pre_branch: Vec<PipelineStep>,
    branching: Option<PipelineStep>,
    /// Pre steps ordered after the branching step; they run once the
    /// classification is known but are class-independent.
    pre_post_branch: Vec<PipelineStep>,
    /// Class segments, keyed by uppercase class key.
    by_class: BTreeMap<String, Vec<PipelineStep>>,
    post: Vec<PipelineStep>,
}

impl ExecutionPlan {
    /// Resolve the snapshot into a plan.
    ///
    /// Rejected here: more than one branching step, contradictory step
    /// flags, templates without `{input_text}`, and steps referencing a
    /// missing or disabled model. Steps bound to a disabled class are
    /// dropped with a warning: disabling a class disables its segment.
    pub fn resolve(snapshot: &ConfigSnapshot) -> Result<Self> {
        let mut pre: Vec<PipelineStep> = Vec::new();
        let mut branching: Option<PipelineStep> = None;
        let mut by_class: BTreeMap<String, Vec<PipelineStep>> = BTreeMap::new();
        let mut post: Vec<PipelineStep> = Vec::new();

        // Snapshot steps arrive sorted by (order, id) and enabled-only.
        for step in &snapshot.steps {
            if !step.prompt_template.contains("{input_text}") {
                return Err(PipelineError::config(format!(
                    "step '{}' prompt template lacks the {{input_text}} placeholder",
                    step.name
                )));
            }
            validate_model(step, snapshot)?;

            match kind_of(step)? {
                StepKind::Pre => pre.push(step.clone()),
                StepKind::Post => post.push(step.clone()),
                StepKind::Branch => {
                    if let Some(existing) = &branching {
                        return Err(PipelineError::config(format!(
                            "multiple branching steps configured: '{}' and '{}'",
                            existing.name, step.name
                        )));
                    }
                    branching = Some(step.clone());
                }
                StepKind::Class(class_key) => {
                    if !snapshot.classes.contains_key(&class_key) {
                        warn!(
                            step = %step.name,
                            class = %class_key,
                            "Dropping step bound to a disabled or unknown document class"
                        );
                        continue;
                    }
                    by_class.entry(class_key).or_default().push(step.clone());
                }
            }
        }

        // Split the pre list around the branching step.
        let (pre_branch, pre_post_branch) = match &branching {
            Some(branch) => {
                let split = pre.iter().position(|s| s.order > branch.order);
                match split {
                    Some(idx) => {
                        let tail = pre.split_off(idx);
                        (pre, tail)
                    }
                    None => (pre, Vec::new()),
                }
            }
            None => (pre, Vec::new()),
        };

        Ok(Self {
            pre_branch,
            branching,
            pre_post_branch,
            by_class,
            post,
        })
    }

    pub fn pre_branch(&self) -> &[PipelineStep] {
        &self.pre_branch
    }

    pub fn branching(&self) -> Option<&PipelineStep> {
        self.branching.as_ref()
    }

    pub fn pre_post_branch(&self) -> &[PipelineStep] {
        &self.pre_post_branch
    }

    pub fn post(&self) -> &[PipelineStep] {
        &self.post
    }

    pub fn has_class(&self, class_key: &str) -> bool {
        self.by_class.contains_key(class_key)
    }

    /// All class-bound steps in global `(order, id)` order, each with its
    /// class key. The executor runs the selected class and records the
    /// rest as skipped, preserving insertion order across classes.
    pub fn class_steps_ordered(&self) -> Vec<(&str, &PipelineStep)> {
        let mut steps: Vec<(&str, &PipelineStep)> = self
            .by_class
            .iter()
            .flat_map(|(key, steps)| steps.iter().map(move |s| (key.as_str(), s)))
            .collect();
        steps.sort_by_key(|(_, s)| (s.order, s.id));
        steps
    }

    /// Total number of steps a job will resolve (run or skip). Constant
    /// for the lifetime of the plan, so progress is monotone.
    pub fn total_steps(&self) -> usize {
        self.pre_branch.len()
            + usize::from(self.branching.is_some())
            + self.pre_post_branch.len()
            + self.by_class.values().map(Vec::len).sum::<usize>()
            + self.post.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_steps() == 0
    }
}

fn validate_model(step: &PipelineStep, snapshot: &ConfigSnapshot) -> Result<()> {
    match snapshot.models.get(&step.model_id) {
        None => Err(PipelineError::config(format!(
            "step '{}' references unknown model id {}",
            step.name, step.model_id
        ))),
        Some(ModelSpec { is_enabled: false, name, .. }) => Err(PipelineError::config(format!(
            "step '{}' references disabled model '{}'",
            step.name, name
        ))),
        Some(_) => Ok(()),
    }
}
