//! OCR and PII-filter seams.
//!
//! The pipeline consumes only scrubbed text; the worker owns the call
//! order extract -> scrub -> execute. Real OCR engines and the privacy
//! filter are external collaborators behind these traits; the shipped
//! implementations cover native text documents and a conservative
//! pattern-based scrub.

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported mime type: {0}")]
    UnsupportedMime(String),

    #[error("document is not valid UTF-8 text")]
    Encoding,

    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Extracted text plus the engine's confidence in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub confidence: f32,
}

/// Turns document bytes into text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<Extraction, ExtractError>;
}

/// Removes personally identifying information before any text leaves
/// the process.
#[async_trait]
pub trait PiiScrubber: Send + Sync {
    async fn scrub(&self, text: &str) -> Result<String, ExtractError>;
}

// ============================================================================
// Shipped implementations
// ============================================================================

/// Extractor for native text documents; scanned formats need a real OCR
/// engine plugged in behind the trait.
#[derive(Debug, Default)]
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<Extraction, ExtractError> {
        let base = mime_type
            .split(';')
            .next()
            .unwrap_or(mime_type)
            .trim()
            .to_ascii_lowercase();
        if !(base.starts_with("text/") || base == "application/json") {
            return Err(ExtractError::UnsupportedMime(mime_type.to_string()));
        }
        let text = std::str::from_utf8(bytes).map_err(|_| ExtractError::Encoding)?;
        Ok(Extraction {
            text: text.to_string(),
            confidence: 1.0,
        })
    }
}

const REDACTION: &str = "[REDACTED]";

/// Pattern-based scrubber masking emails, phone-like digit runs and
/// insurance numbers. Deliberately over-eager: a false positive costs a
/// placeholder, a false negative leaks PII to the provider.
pub struct RegexScrubber {
    patterns: Vec<Regex>,
}

impl Default for RegexScrubber {
    fn default() -> Self {
        Self::new()
    }
}

impl RegexScrubber {
    pub fn new() -> Self {
        let sources = [
            // Email addresses
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            // Phone numbers: international or local digit runs
            r"\+?\d[\d\s()/-]{7,}\d",
            // German health insurance numbers (letter + 9 digits)
            r"\b[A-Z]\d{9}\b",
        ];
        let patterns = sources
            .iter()
            .map(|source| Regex::new(source).expect("invalid scrub pattern"))
            .collect();
        Self { patterns }
    }
}

#[async_trait]
impl PiiScrubber for RegexScrubber {
    async fn scrub(&self, text: &str) -> Result<String, ExtractError> {
        let mut scrubbed = text.to_string();
        for pattern in &self.patterns {
            scrubbed = pattern.replace_all(&scrubbed, REDACTION).into_owned();
        }
        Ok(scrubbed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_extraction() {
        let extractor = PlainTextExtractor;
        let extraction = extractor
            .extract("Befund: unauff\u{e4}llig".as_bytes(), "text/plain; charset=utf-8")
            .await
            .unwrap();
        assert_eq!(extraction.text, "Befund: unauffällig");
        assert_eq!(extraction.confidence, 1.0);

        assert!(matches!(
            extractor.extract(b"%PDF-1.7", "application/pdf").await,
            Err(ExtractError::UnsupportedMime(_))
        ));
        assert!(matches!(
            extractor.extract(&[0xff, 0xfe, 0x00], "text/plain").await,
            Err(ExtractError::Encoding)
        ));
    }

    #[tokio::test]
    async fn scrubber_masks_contact_data() {
        let scrubber = RegexScrubber::new();
        let scrubbed = scrubber
            .scrub("Patient erreichbar unter max.muster@example.org oder +49 30 1234567.")
            .await
            .unwrap();
        assert!(!scrubbed.contains("max.muster"));
        assert!(!scrubbed.contains("1234567"));
        assert!(scrubbed.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn scrubber_masks_insurance_numbers() {
        let scrubber = RegexScrubber::new();
        let scrubbed = scrubber
            .scrub("Versichertennummer A123456789, Diagnose unverändert.")
            .await
            .unwrap();
        assert!(!scrubbed.contains("A123456789"));
        assert!(scrubbed.contains("Diagnose"));
    }
}
