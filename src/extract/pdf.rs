//! PDF text extraction via in-process page iteration.

use std::collections::BTreeMap;

use pdf::file::FileOptions;

use super::{ExtractError, Extraction, ExtractorConfig};

/// Extract text from a PDF, concatenating per-page text up to the
/// configured page ceiling.
///
/// A payload without the `%PDF` magic, an unparseable document, or a
/// document yielding no text at all are permanent failures.
pub fn extract(content: &[u8], config: &ExtractorConfig) -> Result<Extraction, ExtractError> {
    if !content.starts_with(b"%PDF") {
        return Err(ExtractError::Permanent(
            "missing %PDF magic bytes".to_string(),
        ));
    }

    let file = FileOptions::cached()
        .load(content)
        .map_err(|e| ExtractError::Permanent(format!("unparseable PDF: {e}")))?;
    let resolver = file.resolver();

    let total_pages = file.num_pages();
    let page_limit = (total_pages as usize).min(config.max_pdf_pages);

    let mut pages: Vec<String> = Vec::with_capacity(page_limit);
    let mut extracted_pages = 0usize;

    for page_num in 0..page_limit as u32 {
        let page = file
            .get_page(page_num)
            .map_err(|e| ExtractError::Permanent(format!("page {page_num}: {e}")))?;

        let mut page_text = String::new();
        if let Some(contents) = &page.contents {
            let operations = contents
                .operations(&resolver)
                .map_err(|e| ExtractError::Permanent(format!("page {page_num} content: {e}")))?;
            for op in operations.iter() {
                if let pdf::content::Op::TextDraw { text } = op {
                    page_text.push_str(&text.to_string_lossy());
                }
            }
        }

        if !page_text.trim().is_empty() {
            extracted_pages += 1;
        }
        pages.push(page_text);
    }

    let text = pages.join("\n");

    if text.trim().is_empty() {
        let diagnostic = if config.ocr_enabled {
            "PDF contains no extractable text; image-only PDFs are not OCR-processed"
        } else {
            "PDF contains no extractable text and OCR is disabled"
        };
        return Err(ExtractError::Permanent(diagnostic.to_string()));
    }

    let mut metadata = BTreeMap::new();
    metadata.insert("pages".to_string(), total_pages.to_string());
    metadata.insert(
        "extracted_pages".to_string(),
        extracted_pages.to_string(),
    );
    metadata.insert("text_length".to_string(), text.len().to_string());
    metadata.insert("ocr_enabled".to_string(), config.ocr_enabled.to_string());
    metadata.insert("status".to_string(), "success".to_string());

    Ok(Extraction { text, metadata })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_magic_is_permanent() {
        let err = extract(b"not a pdf", &ExtractorConfig::default()).unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("%PDF"));
    }

    #[test]
    fn test_truncated_pdf_is_permanent() {
        // Valid magic, garbage body
        let err = extract(b"%PDF-1.7\ngarbage", &ExtractorConfig::default()).unwrap_err();
        assert!(err.is_permanent());
    }
}
