//! Run context and prompt template rendering.
//!
//! The run context is the mapping of named variables threaded through a
//! job's steps. `input_text` is overwritten by each completed step;
//! `original_text` and `ocr_text` are immutable across the run.

use std::collections::HashMap;

use klartext_protocol::ProcessingOptions;

/// Context keys that must not change after seeding.
const IMMUTABLE_KEYS: &[&str] = &["original_text", "ocr_text"];

pub const KEY_INPUT_TEXT: &str = "input_text";
pub const KEY_DOCUMENT_TYPE: &str = "document_type";
pub const KEY_TARGET_LANGUAGE: &str = "target_language";
pub const KEY_SOURCE_LANGUAGE: &str = "source_language";

/// Mutable variable mapping threaded through one job's steps.
#[derive(Debug, Clone)]
pub struct RunContext {
    vars: HashMap<String, String>,
}

impl RunContext {
    /// Seed the context from the PII-scrubbed OCR text and the job's
    /// processing options.
    pub fn seed(scrubbed_text: &str, options: &ProcessingOptions) -> Self {
        let mut vars = HashMap::new();
        vars.insert(KEY_INPUT_TEXT.to_string(), scrubbed_text.to_string());
        vars.insert("original_text".to_string(), scrubbed_text.to_string());
        vars.insert("ocr_text".to_string(), scrubbed_text.to_string());
        if let Some(lang) = options.target_language.as_deref() {
            vars.insert(KEY_TARGET_LANGUAGE.to_string(), lang.to_string());
        }
        Self { vars }
    }

    pub fn input_text(&self) -> &str {
        self.vars.get(KEY_INPUT_TEXT).map(String::as_str).unwrap_or("")
    }

    /// Overwrite `input_text` with a completed step's output.
    pub fn set_input_text(&mut self, output: impl Into<String>) {
        self.vars.insert(KEY_INPUT_TEXT.to_string(), output.into());
    }

    pub fn document_type(&self) -> Option<&str> {
        self.vars.get(KEY_DOCUMENT_TYPE).map(String::as_str)
    }

    /// Record the classification; normalized uppercase.
    pub fn set_document_type(&mut self, class_key: &str) {
        self.vars
            .insert(KEY_DOCUMENT_TYPE.to_string(), class_key.trim().to_uppercase());
    }

    /// Set an arbitrary variable. Immutable keys are refused.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> bool {
        if IMMUTABLE_KEYS.contains(&name) {
            return false;
        }
        self.vars.insert(name.to_string(), value.into());
        true
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Names from `required` that are absent. Non-empty means the step
    /// is gated off and must be skipped.
    pub fn missing_vars<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .map(String::as_str)
            .filter(|name| !self.vars.contains_key(*name))
            .collect()
    }

    /// Substitute `{name}` placeholders from the context. Unknown names
    /// render as empty string (required ones were caught by gating);
    /// `{{` and `}}` escape literal braces.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    if chars.peek() == Some(&'{') {
                        chars.next();
                        out.push('{');
                        continue;
                    }
                    let mut name = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        name.push(inner);
                    }
                    if closed {
                        if let Some(value) = self.vars.get(&name) {
                            out.push_str(value);
                        }
                        // Unknown placeholder: empty string.
                    } else {
                        // Unterminated placeholder renders literally.
                        out.push('{');
                        out.push_str(&name);
                    }
                }
                '}' => {
                    if chars.peek() == Some(&'}') {
                        chars.next();
                    }
                    out.push('}');
                }
                other => out.push(other),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext::seed(
            "scrubbed report text",
            &ProcessingOptions {
                target_language: Some("de".into()),
                document_type_hint: None,
            },
        )
    }

    #[test]
    fn seeding_populates_canonical_keys() {
        let ctx = ctx();
        assert_eq!(ctx.input_text(), "scrubbed report text");
        assert_eq!(ctx.get("original_text"), Some("scrubbed report text"));
        assert_eq!(ctx.get("ocr_text"), Some("scrubbed report text"));
        assert_eq!(ctx.get("target_language"), Some("de"));
        assert!(ctx.document_type().is_none());
    }

    #[test]
    fn input_text_advances_but_originals_do_not() {
        let mut ctx = ctx();
        ctx.set_input_text("translated");
        assert_eq!(ctx.input_text(), "translated");
        assert_eq!(ctx.get("original_text"), Some("scrubbed report text"));

        assert!(!ctx.set("original_text", "overwritten"));
        assert!(!ctx.set("ocr_text", "overwritten"));
        assert_eq!(ctx.get("ocr_text"), Some("scrubbed report text"));
    }

    #[test]
    fn document_type_is_normalized() {
        let mut ctx = ctx();
        ctx.set_document_type("  arztbrief ");
        assert_eq!(ctx.document_type(), Some("ARZTBRIEF"));
    }

    #[test]
    fn gating_reports_missing_vars() {
        let ctx = RunContext::seed("text", &ProcessingOptions::default());
        let required = vec!["target_language".to_string(), "input_text".to_string()];
        assert_eq!(ctx.missing_vars(&required), vec!["target_language"]);
    }

    #[test]
    fn render_substitutes_known_and_blanks_unknown() {
        let mut ctx = ctx();
        ctx.set_document_type("LABOR");
        let rendered = ctx.render(
            "Translate to {target_language} ({document_type}):\n{input_text}\n[{nonexistent}]",
        );
        assert_eq!(
            rendered,
            "Translate to de (LABOR):\nscrubbed report text\n[]"
        );
    }

    #[test]
    fn render_escapes_braces() {
        let ctx = ctx();
        assert_eq!(ctx.render("emit {{\"k\": 1}}"), "emit {\"k\": 1}");
        assert_eq!(ctx.render("dangling {unterminated"), "dangling {unterminated");
    }
}
