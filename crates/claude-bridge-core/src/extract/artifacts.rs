//! Artifact harvesting
//!
//! Claude renders generated files (codebooks, documents) as code blocks.
//! JSON blocks and Markdown documents are collected so they can travel
//! with the response text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;

use crate::error::BridgeResult;
use crate::page::{selectors, ElementSnapshot, PageSurface};

const MIN_JSON_LEN: usize = 100;
const MIN_MARKDOWN_LEN: usize = 200;
const MAX_TITLE_SOURCE_LEN: usize = 100;

static MARKDOWN_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#+\s|\*\*|##|###|\n-\s|\n\d+\.\s").unwrap());

static TITLE_UNSAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_-]").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Json,
    Markdown,
}

impl ArtifactKind {
    fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Json => "json",
            ArtifactKind::Markdown => "md",
        }
    }

    fn default_stem(&self) -> &'static str {
        match self {
            ArtifactKind::Json => "artifact",
            ArtifactKind::Markdown => "document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub title: String,
    pub content: String,
    pub kind: ArtifactKind,
}

/// Title from the preceding sibling's text, else `{stem}_{n}.{ext}`
fn artifact_title(block: &ElementSnapshot, index: usize, kind: ArtifactKind) -> String {
    let stem = block
        .prev_text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty() && t.chars().count() < MAX_TITLE_SOURCE_LEN)
        .map(|t| TITLE_UNSAFE.replace_all(t, "_").into_owned());

    match stem {
        Some(stem) => format!("{}.{}", stem, kind.extension()),
        None => format!("{}_{}.{}", kind.default_stem(), index + 1, kind.extension()),
    }
}

fn is_json_artifact(content: &str) -> bool {
    content.chars().count() > MIN_JSON_LEN
        && (content.starts_with('{') || content.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(content).is_ok()
}

fn is_markdown_artifact(content: &str) -> bool {
    content.chars().count() > MIN_MARKDOWN_LEN
        && !content.starts_with('{')
        && !content.starts_with('[')
        && MARKDOWN_HINT.is_match(content)
}

/// Collect artifacts from code blocks and `pre` blocks.
///
/// Nested matches (`pre` and `pre code`) carry the same content, so
/// artifacts are deduplicated by content, first occurrence wins.
pub fn artifacts_from_blocks(code_blocks: &[ElementSnapshot], pre_blocks: &[ElementSnapshot]) -> Vec<Artifact> {
    let mut seen = HashSet::new();
    let mut artifacts = Vec::new();

    let mut push = |artifact: Artifact| {
        if seen.insert(artifact.content.clone()) {
            artifacts.push(artifact);
        }
    };

    for (index, block) in code_blocks.iter().enumerate() {
        let content = block.text.trim();
        if is_json_artifact(content) {
            push(Artifact {
                title: artifact_title(block, index, ArtifactKind::Json),
                content: content.to_string(),
                kind: ArtifactKind::Json,
            });
        }
    }

    for (index, block) in pre_blocks.iter().enumerate() {
        let content = block.text.trim();
        if is_markdown_artifact(content) {
            push(Artifact {
                title: artifact_title(block, index, ArtifactKind::Markdown),
                content: content.to_string(),
                kind: ArtifactKind::Markdown,
            });
        }
    }

    artifacts
}

/// Query the page and collect its artifacts
pub async fn collect_artifacts(page: &dyn PageSurface) -> BridgeResult<Vec<Artifact>> {
    let code_blocks = page.query_all(selectors::CODE_BLOCKS).await?;
    let pre_blocks = page.query_all(selectors::PRE_BLOCKS).await?;
    Ok(artifacts_from_blocks(&code_blocks, &pre_blocks))
}
