//! Prompt classifier
//!
//! The bridge types a long system prompt into the chat and later has to pick
//! the assistant's reply out of the page. Both end up as large text blocks,
//! so every candidate goes through a `PromptClassifier` first.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::config::MarkerConfig;

/// Characters inspected by the echo check
pub const ECHO_WINDOW: usize = 500;

/// Strong markers a block must contain before it is treated as a prompt
const STRONG_MARKER_THRESHOLD: usize = 2;

/// A JSON object with at least one quoted key
static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^\s*\{[\s\S]*"[a-zA-Z]+"\s*:"#).unwrap());

/// JSON replies are never filtered as prompts
pub fn looks_like_json(text: &str) -> bool {
    JSON_OBJECT.is_match(text) || text.trim().starts_with("```json")
}

/// Classifies page text blocks
pub trait PromptClassifier: Send + Sync {
    /// Block is (part of) the outbound prompt rather than a reply
    fn is_prompt_block(&self, text: &str) -> bool;

    /// Text begins with the outbound prompt
    fn is_echo(&self, text: &str) -> bool;

    /// Upgrade banners and similar page chrome
    fn is_ui_noise(&self, text: &str) -> bool;

    /// Rate-limit notice
    fn is_rate_limit(&self, text: &str) -> bool;
}

/// `PromptClassifier` driven by the `markers` config section
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    strong_prompt: Vec<String>,
    prompt_start: Vec<Regex>,
    echo: Vec<String>,
    ui_noise: Vec<Regex>,
    rate_limit: Vec<Regex>,
}

impl Default for MarkerClassifier {
    fn default() -> Self {
        Self::from_config(&MarkerConfig::default())
    }
}

impl MarkerClassifier {
    /// Build from config. Patterns that fail to compile are logged and skipped.
    pub fn from_config(config: &MarkerConfig) -> Self {
        Self {
            strong_prompt: config.strong_prompt.clone(),
            prompt_start: compile_all("prompt_start", &config.prompt_start),
            echo: config.echo.clone(),
            ui_noise: compile_all("ui_noise", &config.ui_noise),
            rate_limit: compile_all("rate_limit", &config.rate_limit),
        }
    }

    fn starts_like_prompt(&self, text: &str) -> bool {
        self.prompt_start.iter().any(|re| re.is_match(text))
    }

    fn strong_marker_count(&self, text: &str) -> usize {
        self.strong_prompt
            .iter()
            .filter(|marker| text.contains(marker.as_str()))
            .count()
    }
}

fn compile_all(section: &str, patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(section, pattern = %pattern, error = %e, "Skipping invalid marker pattern");
                None
            }
        })
        .collect()
}

/// First `max_chars` characters of `text`
pub(crate) fn head_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

impl PromptClassifier for MarkerClassifier {
    fn is_prompt_block(&self, text: &str) -> bool {
        if looks_like_json(text) {
            return false;
        }
        self.starts_like_prompt(text) || self.strong_marker_count(text) >= STRONG_MARKER_THRESHOLD
    }

    fn is_echo(&self, text: &str) -> bool {
        let head = head_chars(text, ECHO_WINDOW);
        self.echo.iter().any(|marker| head.contains(marker.as_str()))
    }

    fn is_ui_noise(&self, text: &str) -> bool {
        self.ui_noise.iter().any(|re| re.is_match(text))
    }

    fn is_rate_limit(&self, text: &str) -> bool {
        self.rate_limit.iter().any(|re| re.is_match(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_start_patterns() {
        let c = MarkerClassifier::default();
        assert!(c.is_prompt_block("Du bist ein Experte für Statistik.\nAnalysiere..."));
        assert!(c.is_prompt_block("BS\nDu bist ein Experte für Statistik."));
        assert!(c.is_prompt_block("# ROLE\nYou are an expert reviewer"));
        assert!(c.is_prompt_block("Kapitel: Section 2 von 5\nText"));
        assert!(!c.is_prompt_block("Here is the summary of your project."));
    }

    #[test]
    fn test_prompt_start_is_anchored() {
        let c = MarkerClassifier::default();
        let text = format!("{}Du bist ein Experte", "x".repeat(80));
        assert!(!c.is_prompt_block(&text));
    }

    #[test]
    fn test_strong_markers_need_two_hits() {
        let c = MarkerClassifier::default();
        assert!(!c.is_prompt_block("Report mentions EVIDENRA PROFESSIONAL once."));
        assert!(c.is_prompt_block(
            "Intro\nEVIDENRA PROFESSIONAL\nZielwortanzahl: MINDESTENS 800"
        ));
    }

    #[test]
    fn test_json_is_never_a_prompt() {
        let c = MarkerClassifier::default();
        let json = r#"{"summary": "Du bist ein Experte", "note": "EVIDENRA PROFESSIONAL 📊 EVIDENRA"}"#;
        assert!(looks_like_json(json));
        assert!(!c.is_prompt_block(json));
        assert!(looks_like_json("```json\n[1, 2]\n```"));
        assert!(!looks_like_json("{ not json"));
    }

    #[test]
    fn test_echo_only_checks_head() {
        let c = MarkerClassifier::default();
        assert!(c.is_echo("# 📊 EVIDENRA PROFESSIONAL - BASIC REPORT\n..."));

        let late = format!("{}EVIDENRA PROFESSIONAL", "a".repeat(ECHO_WINDOW));
        assert!(!c.is_echo(&late));
    }

    #[test]
    fn test_echo_window_counts_chars_not_bytes() {
        let c = MarkerClassifier::default();
        let text = format!("{}EVIDENRA PROFESSIONAL", "ä".repeat(400));
        assert!(c.is_echo(&text));
    }

    #[test]
    fn test_ui_noise_and_rate_limit() {
        let c = MarkerClassifier::default();
        assert!(c.is_ui_noise("Upgrade to Claude Pro for more"));
        assert!(c.is_ui_noise("Alles aus Pro, plus mehr"));
        assert!(!c.is_ui_noise("A normal answer"));

        assert!(c.is_rate_limit("You have hit the Rate Limit"));
        assert!(c.is_rate_limit("Nachrichtenlimit erreicht"));
        assert!(!c.is_rate_limit("All good"));
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let config = MarkerConfig {
            rate_limit: vec!["(unclosed".to_string(), "(?i)slow down".to_string()],
            ..Default::default()
        };
        let c = MarkerClassifier::from_config(&config);
        assert!(c.is_rate_limit("Please SLOW DOWN"));
    }

    #[test]
    fn test_head_chars() {
        assert_eq!(head_chars("abcdef", 3), "abc");
        assert_eq!(head_chars("ab", 3), "ab");
        assert_eq!(head_chars("äöü", 2), "äö");
    }
}
