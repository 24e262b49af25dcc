//! Plain-text pass-through handler.

use std::collections::BTreeMap;

use super::{ExtractError, Extraction};

/// Pass content through as UTF-8 text, counting characters and lines.
pub fn extract(content: &[u8]) -> Result<Extraction, ExtractError> {
    let text = String::from_utf8_lossy(content).into_owned();

    let mut metadata = BTreeMap::new();
    metadata.insert(
        "characters".to_string(),
        text.chars().count().to_string(),
    );
    metadata.insert("lines".to_string(), text.lines().count().to_string());

    Ok(Extraction { text, metadata })
}
