//! Automation session state

use serde_json::Value;
use std::fmt;
use tokio::time::Instant;

use crate::extract::StabilityTracker;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    ResetContext,
    InputPrepared,
    Submitted,
    Polling,
    Delivered,
    RateLimited,
    TimedOut,
    Aborted,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::ResetContext => "reset_context",
            SessionPhase::InputPrepared => "input_prepared",
            SessionPhase::Submitted => "submitted",
            SessionPhase::Polling => "polling",
            SessionPhase::Delivered => "delivered",
            SessionPhase::RateLimited => "rate_limited",
            SessionPhase::TimedOut => "timed_out",
            SessionPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// One generation request being driven through the page
#[derive(Debug)]
pub struct AutomationSession {
    pub request_id: String,
    /// Original request payload, kept for rate-limit restarts
    pub payload: Value,
    pub prompt: String,
    pub phase: SessionPhase,
    /// Rate-limit restarts so far
    pub retries: u32,
    /// Polls in the current round
    pub attempts: u32,
    pub stability: StabilityTracker,
    pub started_at: Instant,
}

impl AutomationSession {
    pub fn new(request_id: String, payload: Value, stability: StabilityTracker) -> Self {
        let prompt = prompt_for(&payload);
        Self {
            request_id,
            payload,
            prompt,
            phase: SessionPhase::Idle,
            retries: 0,
            attempts: 0,
            stability,
            started_at: Instant::now(),
        }
    }

    /// Start a new round after a rate limit; the stored payload is reused
    pub fn restart(&mut self) {
        self.retries += 1;
        self.attempts = 0;
        self.stability.reset();
        self.phase = SessionPhase::RateLimited;
    }
}

fn non_empty_str<'a>(value: Option<&'a Value>) -> Option<&'a str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Prompt to type: `projectData.prompt`, else `prompt`, else the report template
pub fn prompt_for(data: &Value) -> String {
    non_empty_str(data.get("projectData").and_then(|p| p.get("prompt")))
        .or_else(|| non_empty_str(data.get("prompt")))
        .map(String::from)
        .unwrap_or_else(|| format_report(data))
}

fn field(data: &Value, key: &str) -> String {
    match data.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Structured report prompt built from project statistics
pub fn format_report(data: &Value) -> String {
    let report_type = data
        .get("reportType")
        .and_then(Value::as_str)
        .unwrap_or("standard")
        .to_uppercase();

    format!(
        "# 📊 EVIDENRA PROFESSIONAL - {report_type} REPORT\n\n\
         {prompt}\n\n\
         ## 📋 Project Information\n\
         - **Project:** {project}\n\
         - **Documents:** {documents}\n\
         - **Codings:** {codings}\n\
         - **Categories:** {categories}\n\n\
         ## 🧠 Smart Data Intelligence\n\
         {intelligence}\n\n\
         **⚠️ IMPORTANT:** Use only the data provided. Do not invent content!",
        report_type = report_type,
        prompt = data.get("prompt").and_then(Value::as_str).unwrap_or(""),
        project = field(data, "projectName"),
        documents = field(data, "documentCount"),
        codings = field(data, "codingCount"),
        categories = field(data, "categoryCount"),
        intelligence = field(data, "intelligence"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_prefers_project_data() {
        let data = json!({"projectData": {"prompt": "inner"}, "prompt": "outer"});
        assert_eq!(prompt_for(&data), "inner");

        let data = json!({"projectData": {"prompt": ""}, "prompt": "outer"});
        assert_eq!(prompt_for(&data), "outer");
    }

    #[test]
    fn test_prompt_falls_back_to_template() {
        let data = json!({
            "reportType": "basic",
            "projectName": "Interviews",
            "documentCount": 12,
            "codingCount": 340,
            "categoryCount": 18,
            "intelligence": "Top themes: trust, cost"
        });
        let prompt = prompt_for(&data);

        assert!(prompt.starts_with("# 📊 EVIDENRA PROFESSIONAL - BASIC REPORT\n\n"));
        assert!(prompt.contains("- **Project:** Interviews\n"));
        assert!(prompt.contains("- **Documents:** 12\n"));
        assert!(prompt.contains("## 🧠 Smart Data Intelligence\nTop themes: trust, cost"));
    }

    #[test]
    fn test_template_tolerates_missing_fields() {
        let prompt = format_report(&json!({}));
        assert!(prompt.contains("STANDARD REPORT"));
        assert!(prompt.contains("- **Categories:** -\n"));
    }

    #[test]
    fn test_restart_keeps_payload() {
        let payload = json!({"prompt": "hello"});
        let mut session = AutomationSession::new("r1".into(), payload.clone(), StabilityTracker::new(2, 50));
        session.attempts = 7;

        session.restart();
        assert_eq!(session.retries, 1);
        assert_eq!(session.attempts, 0);
        assert_eq!(session.payload, payload);
        assert_eq!(session.prompt, "hello");
        assert_eq!(session.phase, SessionPhase::RateLimited);
    }
}
