//! Format-dispatched text extraction engine.
//!
//! Each recognized format maps to one handler producing `(text, metadata)`.
//! Extraction errors are classified into exactly two kinds: permanent
//! failures (malformed input, unsupported payloads, empty results where
//! non-empty is required) are terminal for the workflow retry policy, while
//! transient failures are retryable.

mod docx;
mod html;
mod image;
mod pdf;
mod text;

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors that can occur during text extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Malformed input, unsupported format, or an empty result where
    /// non-empty is required. Never retried.
    #[error("permanent extraction failure: {0}")]
    Permanent(String),

    /// Any other runtime failure. Retryable.
    #[error("transient extraction failure: {0}")]
    Transient(#[from] anyhow::Error),
}

impl ExtractError {
    /// True for the non-retryable variant.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Successful extraction output.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Extraction {
    /// Extracted UTF-8 text.
    pub text: String,
    /// Handler-specific metadata. `type` is always set.
    pub metadata: BTreeMap<String, String>,
}

/// Closed set of recognized document formats.
///
/// Adding a format means adding a variant here and a handler arm in
/// [`Extractor::extract`]; unknown tags fall back to [`Format::Text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Html,
    Pdf,
    Docx,
    Image,
}

impl Format {
    /// Map a lowercased format tag to its handler variant. Unknown tags
    /// fall back to the text handler.
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "html" => Self::Html,
            "pdf" => Self::Pdf,
            "docx" | "doc" => Self::Docx,
            "png" | "jpg" | "jpeg" | "tiff" | "bmp" | "gif" => Self::Image,
            // `text`, `txt`, and anything unrecognized
            _ => Self::Text,
        }
    }

    /// Canonical tag emitted in extraction metadata.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Html => "html",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Image => "image",
        }
    }
}

/// Extractor configuration.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Page ceiling for PDF extraction.
    pub max_pdf_pages: usize,
    /// Whether image OCR is enabled.
    pub ocr_enabled: bool,
    /// Tesseract language setting.
    pub ocr_language: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_pdf_pages: 500,
            ocr_enabled: true,
            ocr_language: "eng".to_string(),
        }
    }
}

/// Type-dispatched text extractor.
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    config: ExtractorConfig,
}

impl Extractor {
    /// Create an extractor with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an extractor with explicit configuration.
    pub fn with_config(config: ExtractorConfig) -> Self {
        Self { config }
    }

    /// Extract text and metadata from raw content.
    ///
    /// On success the returned metadata always carries a `type` key naming
    /// the handler that ran.
    pub fn extract(&self, content: &[u8], format: Format) -> Result<Extraction, ExtractError> {
        let mut extraction = match format {
            Format::Text => text::extract(content)?,
            Format::Html => html::extract(content)?,
            Format::Pdf => pdf::extract(content, &self.config)?,
            Format::Docx => docx::extract(content)?,
            Format::Image => image::extract(content, &self.config)?,
        };
        extraction
            .metadata
            .insert("type".to_string(), format.tag().to_string());
        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_tag() {
        assert_eq!(Format::from_tag("HTML"), Format::Html);
        assert_eq!(Format::from_tag("pdf"), Format::Pdf);
        assert_eq!(Format::from_tag("doc"), Format::Docx);
        assert_eq!(Format::from_tag("jpeg"), Format::Image);
        assert_eq!(Format::from_tag("txt"), Format::Text);
        // Unknown tags fall back to the text handler
        assert_eq!(Format::from_tag("mystery"), Format::Text);
    }

    #[test]
    fn test_extract_sets_type_metadata() {
        let extractor = Extractor::new();
        let result = extractor.extract(b"plain body", Format::Text).unwrap();
        assert_eq!(result.metadata.get("type").map(String::as_str), Some("text"));
    }

    #[test]
    fn test_permanent_classification() {
        let err = ExtractError::Permanent("bad magic".to_string());
        assert!(err.is_permanent());
        let err = ExtractError::Transient(anyhow::anyhow!("io hiccup"));
        assert!(!err.is_permanent());
    }
}
