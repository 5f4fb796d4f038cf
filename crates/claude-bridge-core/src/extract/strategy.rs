//! Extraction strategies
//!
//! Each strategy looks for the latest reply in its own way; the extractor
//! runs them in order and takes the first hit.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::error::BridgeResult;
use crate::page::{selectors, ElementRef, ElementSnapshot, PageSurface};
use crate::semantic::PromptClassifier;

/// Blocks examined by the visible-block strategy, newest first
const BLOCK_SCAN_LIMIT: usize = 10;
const BLOCK_MIN_LEN: usize = 100;
const BLOCK_MAX_LEN: usize = 50_000;

/// Left-sidebar region as a fraction of the viewport width
const SIDEBAR_LEFT_RATIO: f64 = 0.3;
const SIDEBAR_WIDTH_RATIO: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    AssistantRole,
    VisibleBlocks,
    Fallback,
    StrictAssistant,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::AssistantRole => "assistant_role",
            StrategyKind::VisibleBlocks => "visible_blocks",
            StrategyKind::Fallback => "fallback",
            StrategyKind::StrictAssistant => "strict_assistant",
        }
    }
}

/// Raw text picked by a strategy, before cleanup
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub text: String,
    pub element: ElementRef,
}

impl Candidate {
    fn from_snapshot(snapshot: ElementSnapshot) -> Self {
        Self {
            text: snapshot.text,
            element: snapshot.handle,
        }
    }
}

#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn find(&self, page: &dyn PageSurface) -> BridgeResult<Option<Candidate>>;
}

/// Last element of the first selector whose last match is long enough
pub struct SelectorStrategy {
    kind: StrategyKind,
    selectors: &'static [&'static str],
    min_len: usize,
}

impl SelectorStrategy {
    pub fn assistant_role(min_len: usize) -> Self {
        Self {
            kind: StrategyKind::AssistantRole,
            selectors: selectors::ASSISTANT,
            min_len,
        }
    }

    pub fn fallback(min_len: usize) -> Self {
        Self {
            kind: StrategyKind::Fallback,
            selectors: selectors::FALLBACK,
            min_len,
        }
    }

    pub fn strict(min_len: usize) -> Self {
        Self {
            kind: StrategyKind::StrictAssistant,
            selectors: selectors::STRICT_ASSISTANT,
            min_len,
        }
    }
}

#[async_trait]
impl ExtractionStrategy for SelectorStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    async fn find(&self, page: &dyn PageSurface) -> BridgeResult<Option<Candidate>> {
        let min_len = self.min_len;
        let found = crate::page::last_match(page, self.selectors, move |el| {
            el.text.chars().count() > min_len
        })
        .await?;
        Ok(found.map(Candidate::from_snapshot))
    }
}

/// Newest sizable visible block that is not the outbound prompt
pub struct VisibleBlockStrategy {
    classifier: Arc<dyn PromptClassifier>,
}

impl VisibleBlockStrategy {
    pub fn new(classifier: Arc<dyn PromptClassifier>) -> Self {
        Self { classifier }
    }

    fn in_left_sidebar(el: &ElementSnapshot, viewport_width: f64) -> bool {
        el.rect.left < viewport_width * SIDEBAR_LEFT_RATIO
            && el.rect.width < viewport_width * SIDEBAR_WIDTH_RATIO
    }

    /// Candidate blocks sorted bottom-first
    fn candidate_blocks(&self, blocks: Vec<ElementSnapshot>, viewport_width: f64) -> Vec<ElementSnapshot> {
        let mut blocks: Vec<_> = blocks
            .into_iter()
            .filter(|el| !self.classifier.is_ui_noise(&el.text))
            .filter(|el| {
                let len = el.text.chars().count();
                len > BLOCK_MIN_LEN && len < BLOCK_MAX_LEN
            })
            .filter(|el| el.rect.is_visible() && !Self::in_left_sidebar(el, viewport_width))
            .collect();

        // Stable sort keeps document order among blocks on the same row
        blocks.sort_by(|a, b| b.rect.top.partial_cmp(&a.rect.top).unwrap_or(Ordering::Equal));
        blocks
    }
}

#[async_trait]
impl ExtractionStrategy for VisibleBlockStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::VisibleBlocks
    }

    async fn find(&self, page: &dyn PageSurface) -> BridgeResult<Option<Candidate>> {
        let viewport_width = page.viewport_width().await?;
        let blocks = page.query_all(selectors::TEXT_BLOCKS).await?;
        let candidates = self.candidate_blocks(blocks, viewport_width);
        debug!(count = candidates.len(), "Visible text blocks");

        let reply = candidates
            .into_iter()
            .take(BLOCK_SCAN_LIMIT)
            .enumerate()
            .find(|(index, el)| {
                let is_prompt = self.classifier.is_prompt_block(&el.text);
                if is_prompt {
                    debug!(index, len = el.text.len(), "Skipping prompt block");
                }
                !is_prompt
            })
            .map(|(_, el)| el);

        Ok(reply.map(Candidate::from_snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{MemoryElement, MemoryPage};
    use crate::semantic::MarkerClassifier;

    fn classifier() -> Arc<dyn PromptClassifier> {
        Arc::new(MarkerClassifier::default())
    }

    fn block(text: &str, top: f64) -> MemoryElement {
        MemoryElement::new("div")
            .matching(&["div"])
            .text(text)
            .rect(500.0, top, 700.0, 80.0)
    }

    #[tokio::test]
    async fn test_selector_strategy_takes_last_long_match() {
        let page = MemoryPage::new("https://claude.ai/chat/1");
        let long = "a".repeat(60);
        page.with_dom(|dom| {
            dom.push(
                MemoryElement::new("div")
                    .matching(&[r#"[data-message-author-role="assistant"]"#])
                    .text(&long),
            );
            dom.push(
                MemoryElement::new("div")
                    .matching(&[r#"[data-message-author-role="assistant"]"#])
                    .text("too short"),
            );
            dom.push(
                MemoryElement::new("div")
                    .matching(&[r#"[data-testid="message-assistant"]"#])
                    .text(&long),
            );
        });

        let found = SelectorStrategy::assistant_role(50).find(&page).await.unwrap().unwrap();
        assert_eq!(found.text, long);
        assert_eq!(found.element.selector, r#"[data-testid="message-assistant"]"#);
    }

    #[tokio::test]
    async fn test_visible_blocks_skip_prompt_and_sidebar() {
        let page = MemoryPage::new("https://claude.ai/chat/1");
        let prompt = format!("Du bist ein Experte für Methodik. {}", "p".repeat(120));
        let reply = format!("The analysis shows three themes. {}", "r".repeat(120));
        let sidebar = format!("Recent chats {}", "s".repeat(120));
        page.with_dom(|dom| {
            dom.push(block(&reply, 400.0));
            dom.push(block(&prompt, 600.0));
            dom.push(
                MemoryElement::new("nav")
                    .matching(&["div"])
                    .text(&sidebar)
                    .rect(0.0, 900.0, 200.0, 600.0),
            );
            dom.push(block("Upgrade to Claude Pro and get more. ".repeat(5).as_str(), 950.0));
        });

        let found = VisibleBlockStrategy::new(classifier()).find(&page).await.unwrap().unwrap();
        assert_eq!(found.text, reply);
    }

    #[tokio::test]
    async fn test_visible_blocks_keep_json_reply() {
        let page = MemoryPage::new("https://claude.ai/chat/1");
        let json = format!(
            r#"{{"summary": "EVIDENRA PROFESSIONAL review, Zielwortanzahl: MINDESTENS met", "pad": "{}"}}"#,
            "j".repeat(80)
        );
        page.with_dom(|dom| dom.push(block(&json, 300.0)));

        let found = VisibleBlockStrategy::new(classifier()).find(&page).await.unwrap().unwrap();
        assert_eq!(found.text, json);
    }

    #[tokio::test]
    async fn test_visible_blocks_scan_only_ten_newest() {
        let page = MemoryPage::new("https://claude.ai/chat/1");
        let prompt = format!("You are an expert. {}", "p".repeat(120));
        let reply = format!("Old reply {}", "r".repeat(120));
        page.with_dom(|dom| {
            dom.push(block(&reply, 10.0));
            for i in 0..10 {
                dom.push(block(&prompt, 100.0 + i as f64));
            }
        });

        let found = VisibleBlockStrategy::new(classifier()).find(&page).await.unwrap();
        assert!(found.is_none());
    }
}
