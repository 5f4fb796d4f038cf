//! Text classification for page content
//!
//! Decides whether a block of page text is an outbound prompt, a prompt
//! echo, page chrome or a rate-limit notice.

mod classifier;

pub use classifier::{looks_like_json, MarkerClassifier, PromptClassifier, ECHO_WINDOW};
