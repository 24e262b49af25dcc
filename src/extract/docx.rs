//! Office Open XML (docx) text extraction.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use quick_xml::events::Event;
use quick_xml::Reader;
use zip::ZipArchive;

use super::{ExtractError, Extraction};

/// Extract paragraph text from a docx payload.
///
/// The payload must carry the ZIP signature and contain the standard
/// `word/document.xml` body part; anything else is a permanent failure.
pub fn extract(content: &[u8]) -> Result<Extraction, ExtractError> {
    if !content.starts_with(b"PK") {
        return Err(ExtractError::Permanent(
            "missing ZIP signature; not a docx payload".to_string(),
        ));
    }

    let mut archive = ZipArchive::new(Cursor::new(content))
        .map_err(|e| ExtractError::Permanent(format!("unreadable docx container: {e}")))?;

    let mut body_xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::Permanent(format!("missing word/document.xml: {e}")))?
        .read_to_string(&mut body_xml)
        .map_err(|e| ExtractError::Permanent(format!("unreadable document body: {e}")))?;

    let text = parse_body(&body_xml)?;
    let text = text.replace("\r\n", "\n");

    let mut metadata = BTreeMap::new();
    metadata.insert("text_length".to_string(), text.len().to_string());
    metadata.insert(
        "word_count".to_string(),
        text.split_whitespace().count().to_string(),
    );
    metadata.insert("line_count".to_string(), text.lines().count().to_string());
    metadata.insert("status".to_string(), "success".to_string());

    Ok(Extraction { text, metadata })
}

/// Pull run text out of the document body, with newlines at paragraph
/// boundaries and explicit breaks, tabs for `<w:tab/>`.
fn parse_body(xml: &str) -> Result<String, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut in_run_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_run_text = true;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_run_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"br" => out.push('\n'),
                b"tab" => out.push('\t'),
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if in_run_text {
                    let unescaped = t
                        .unescape()
                        .map_err(|e| ExtractError::Permanent(format!("malformed body XML: {e}")))?;
                    out.push_str(&unescaped);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ExtractError::Permanent(format!("malformed body XML: {e}")));
            }
        }
    }

    // Trim the trailing paragraph newline so single-paragraph documents
    // round-trip cleanly.
    while out.ends_with('\n') {
        out.pop();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn docx_with_body(body: &str) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file("word/document.xml", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_paragraphs_extracted() {
        let body = r#"<?xml version="1.0"?>
            <w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
              <w:body>
                <w:p><w:r><w:t>First paragraph</w:t></w:r></w:p>
                <w:p><w:r><w:t>Second</w:t></w:r><w:r><w:t> paragraph</w:t></w:r></w:p>
              </w:body>
            </w:document>"#;
        let result = extract(&docx_with_body(body)).unwrap();
        assert_eq!(result.text, "First paragraph\nSecond paragraph");
        assert_eq!(result.metadata.get("word_count").unwrap(), "4");
        assert_eq!(result.metadata.get("line_count").unwrap(), "2");
    }

    #[test]
    fn test_tabs_and_breaks() {
        let body = r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
            <w:body><w:p><w:r><w:t>a</w:t><w:tab/><w:t>b</w:t><w:br/><w:t>c</w:t></w:r></w:p></w:body>
        </w:document>"#;
        let result = extract(&docx_with_body(body)).unwrap();
        assert_eq!(result.text, "a\tb\nc");
    }

    #[test]
    fn test_missing_zip_signature_is_permanent() {
        let err = extract(b"plain bytes").unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("ZIP signature"));
    }

    #[test]
    fn test_zip_without_body_is_permanent() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file("unrelated.txt", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"hi").unwrap();
            writer.finish().unwrap();
        }
        let err = extract(&buf.into_inner()).unwrap_err();
        assert!(err.is_permanent());
    }
}
