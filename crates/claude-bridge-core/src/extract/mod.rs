//! Response extraction
//!
//! Architecture: strategy chain -> cleanup -> artifacts
//!
//! # Components
//! - `ExtractionStrategy`: assistant role, visible blocks, fallback (first hit wins)
//! - `clean_response`: strips artifact-panel chrome and blank runs
//! - `collect_artifacts`: JSON / Markdown code blocks appended to the text
//! - `StabilityTracker`: decides when a streamed reply is complete

pub mod artifacts;
pub mod clean;
pub mod stability;
pub mod strategy;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::AutomationConfig;
use crate::error::BridgeResult;
use crate::page::PageSurface;
use crate::semantic::PromptClassifier;

pub use artifacts::{collect_artifacts, Artifact, ArtifactKind};
pub use clean::{append_artifacts, clean_response};
pub use stability::{StabilityTracker, StabilityVerdict};
pub use strategy::{Candidate, ExtractionStrategy, SelectorStrategy, StrategyKind, VisibleBlockStrategy};

/// Reply pulled from the page
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedResponse {
    /// Cleaned text with artifacts appended
    pub text: String,
    /// `innerHTML` of the source element
    pub markup: String,
    pub extracted_at: DateTime<Utc>,
    pub artifacts: Vec<Artifact>,
    pub strategy: StrategyKind,
}

/// Runs the strategy chain and post-processes the winner
pub struct ResponseExtractor {
    chain: Vec<Box<dyn ExtractionStrategy>>,
    strict: SelectorStrategy,
}

impl ResponseExtractor {
    pub fn new(classifier: Arc<dyn PromptClassifier>, config: &AutomationConfig) -> Self {
        Self {
            chain: vec![
                Box::new(SelectorStrategy::assistant_role(config.min_response_len)),
                Box::new(VisibleBlockStrategy::new(classifier)),
                Box::new(SelectorStrategy::fallback(config.min_response_len)),
            ],
            strict: SelectorStrategy::strict(config.strict_min_len),
        }
    }

    /// Latest reply on the page, if any strategy finds one
    pub async fn extract(&self, page: &dyn PageSurface) -> BridgeResult<Option<ExtractedResponse>> {
        for strategy in &self.chain {
            if let Some(candidate) = strategy.find(page).await? {
                return self.finish(page, strategy.kind(), candidate).await.map(Some);
            }
            debug!(strategy = strategy.kind().name(), "Strategy found nothing");
        }
        info!("No response found on page");
        Ok(None)
    }

    /// Assistant-only extraction used after an echo was detected
    pub async fn extract_strict(&self, page: &dyn PageSurface) -> BridgeResult<Option<ExtractedResponse>> {
        match self.strict.find(page).await? {
            Some(candidate) => self.finish(page, StrategyKind::StrictAssistant, candidate).await.map(Some),
            None => Ok(None),
        }
    }

    async fn finish(
        &self,
        page: &dyn PageSurface,
        strategy: StrategyKind,
        candidate: Candidate,
    ) -> BridgeResult<ExtractedResponse> {
        let artifacts = collect_artifacts(page).await?;
        let text = append_artifacts(&clean_response(&candidate.text), &artifacts);
        let markup = page.markup(&candidate.element).await?;

        debug!(
            strategy = strategy.name(),
            len = text.len(),
            artifacts = artifacts.len(),
            "Response extracted"
        );

        Ok(ExtractedResponse {
            text,
            markup,
            extracted_at: Utc::now(),
            artifacts,
            strategy,
        })
    }
}
