//! Content bridge - per-tab automation of the chat page
//!
//! Architecture: `ContentBridge` (actor) -> automation steps -> extraction
//!
//! # Components
//! - `ContentBridge`: session state machine driven by timers
//! - `automation`: new chat, prompt input, submit, streaming and rate-limit checks
//! - `session`: session state and prompt construction

pub mod automation;
pub mod bridge;
pub mod session;

pub use automation::{ResetOutcome, SubmitMethod};
pub use bridge::{ContentBridge, ContentHandle, PollOutcome};
pub use session::{format_report, prompt_for, AutomationSession, SessionPhase};
