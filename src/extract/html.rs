//! HTML text extraction.
//!
//! Strips script/style and chrome elements, emits newlines around
//! block-level elements, collapses whitespace, and drops common navigation
//! noise lines.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::RegexSet;
use scraper::{Html, Node, Selector};

use super::{ExtractError, Extraction};

/// Elements whose entire subtree is skipped.
const SKIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "nav", "header", "footer", "aside",
];

/// Block-level elements that get surrounding newlines.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "li", "blockquote", "article", "section",
    "main", "pre", "td", "th", "dt", "dd",
];

fn noise_patterns() -> &'static RegexSet {
    static PATTERNS: OnceLock<RegexSet> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        RegexSet::new([
            r"^(home|menu|search|share|print|login|log in|sign in|sign up|subscribe)$",
            r"^skip to (main )?content$",
            r"(?i)cookie (policy|settings|preferences)",
            r"^(privacy policy|terms of (use|service)|all rights reserved)$",
            r"^©",
        ])
        .expect("static noise patterns are valid")
    })
}

/// Extract visible text and the first `<title>` from an HTML document.
pub fn extract(content: &[u8]) -> Result<Extraction, ExtractError> {
    let html = String::from_utf8_lossy(content);
    let document = Html::parse_document(&html);

    let title = document
        .select(&Selector::parse("title").expect("static selector"))
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let mut raw = String::new();
    collect_text(document.tree.root(), &mut raw);

    let mut lines: Vec<String> = Vec::new();
    for line in raw.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            continue;
        }
        if noise_patterns().is_match(&collapsed.to_lowercase()) {
            continue;
        }
        lines.push(collapsed);
    }
    let text = lines.join("\n");

    let mut metadata = BTreeMap::new();
    if let Some(title) = title {
        metadata.insert("title".to_string(), title);
    }
    metadata.insert(
        "characters".to_string(),
        text.chars().count().to_string(),
    );

    Ok(Extraction { text, metadata })
}

/// Walk the node tree accumulating text, skipping chrome subtrees and
/// inserting newlines around block-level elements.
fn collect_text(node: ego_tree::NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => out.push_str(&text.text),
        Node::Element(element) => {
            let name = element.name();
            if SKIPPED_ELEMENTS.contains(&name) {
                return;
            }
            if name == "br" {
                out.push('\n');
                return;
            }
            let is_block = BLOCK_ELEMENTS.contains(&name);
            if is_block {
                out.push('\n');
            }
            for child in node.children() {
                collect_text(child, out);
            }
            if is_block {
                out.push('\n');
            }
        }
        _ => {
            for child in node.children() {
                collect_text(child, out);
            }
        }
    }
}
