//! Image OCR via the system tesseract binary.

use std::collections::BTreeMap;
use std::io::Write;
use std::process::Command;

use super::{ExtractError, Extraction, ExtractorConfig};

/// OCR an image payload with the configured language.
///
/// When OCR is disabled or the tesseract binary is not installed, this is
/// a permanent failure carrying a diagnostic.
pub fn extract(content: &[u8], config: &ExtractorConfig) -> Result<Extraction, ExtractError> {
    if !config.ocr_enabled {
        return Err(ExtractError::Permanent(
            "OCR is disabled; image extraction unavailable".to_string(),
        ));
    }
    if which::which("tesseract").is_err() {
        return Err(ExtractError::Permanent(
            "OCR unavailable: tesseract not found in PATH (install tesseract-ocr)".to_string(),
        ));
    }

    let mut image_file = tempfile::NamedTempFile::new()
        .map_err(|e| ExtractError::Transient(anyhow::anyhow!("temp file: {e}")))?;
    image_file
        .write_all(content)
        .map_err(|e| ExtractError::Transient(anyhow::anyhow!("temp file write: {e}")))?;

    // TSV output carries per-word confidence alongside the text.
    let output = Command::new("tesseract")
        .arg(image_file.path())
        .arg("stdout")
        .args(["-l", &config.ocr_language])
        .arg("tsv")
        .output()
        .map_err(|e| ExtractError::Transient(anyhow::anyhow!("tesseract spawn: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExtractError::Permanent(format!(
            "tesseract failed: {}",
            stderr.trim()
        )));
    }

    let (text, confidence) = parse_tsv(&String::from_utf8_lossy(&output.stdout));

    let mut metadata = BTreeMap::new();
    metadata.insert("language".to_string(), config.ocr_language.clone());
    metadata.insert("engine".to_string(), "tesseract".to_string());
    metadata.insert("confidence".to_string(), format!("{confidence:.1}"));
    metadata.insert(
        "word_count".to_string(),
        text.split_whitespace().count().to_string(),
    );
    metadata.insert("line_count".to_string(), text.lines().count().to_string());
    metadata.insert("status".to_string(), "success".to_string());

    Ok(Extraction { text, metadata })
}

/// Reassemble line text from tesseract TSV rows and average the per-word
/// confidence.
fn parse_tsv(tsv: &str) -> (String, f64) {
    let mut text = String::new();
    let mut current_line: Option<(String, String, String)> = None;
    let mut conf_sum = 0.0;
    let mut conf_count = 0usize;

    for row in tsv.lines().skip(1) {
        let fields: Vec<&str> = row.split('\t').collect();
        if fields.len() < 12 || fields[0] != "5" {
            continue;
        }
        let conf: f64 = fields[10].parse().unwrap_or(-1.0);
        let word = fields[11].trim();
        if conf < 0.0 || word.is_empty() {
            continue;
        }

        let line_key = (
            fields[2].to_string(),
            fields[3].to_string(),
            fields[4].to_string(),
        );
        match &current_line {
            Some(previous) if *previous == line_key => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        current_line = Some(line_key);

        text.push_str(word);
        conf_sum += conf;
        conf_count += 1;
    }

    let confidence = if conf_count > 0 {
        conf_sum / conf_count as f64
    } else {
        0.0
    };
    (text, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_ocr_is_permanent() {
        let config = ExtractorConfig {
            ocr_enabled: false,
            ..Default::default()
        };
        let err = extract(b"fake image", &config).unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn test_parse_tsv_lines_and_confidence() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t90\tHello\n\
                   5\t1\t1\t1\t1\t2\t12\t0\t10\t10\t80\tworld\n\
                   5\t1\t1\t1\t2\t1\t0\t14\t10\t10\t70\tbye\n";
        let (text, confidence) = parse_tsv(tsv);
        assert_eq!(text, "Hello world\nbye");
        assert!((confidence - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tsv_skips_low_level_rows() {
        let tsv = "header\n4\t1\t1\t1\t1\t0\t0\t0\t10\t10\t-1\t\n";
        let (text, confidence) = parse_tsv(tsv);
        assert!(text.is_empty());
        assert_eq!(confidence, 0.0);
    }
}
