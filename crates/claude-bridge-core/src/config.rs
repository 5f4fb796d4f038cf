//! Bridge configuration
//!
//! Loaded from `$CLAUDE_BRIDGE_CONFIG` or `~/.claude-bridge/config.yaml`.
//! Every section is optional; missing keys fall back to the defaults below.
//!
//! ```yaml
//! connection:
//!   ports: [18642, 18643, 18644, 18645]
//! automation:
//!   poll_interval_ms: 3000
//!   report_failed_sessions: false
//! markers:
//!   echo:
//!     - "EVIDENRA PROFESSIONAL"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub connection: ConnectionConfig,
    pub queue: QueueConfig,
    pub page: PageConfig,
    pub automation: AutomationConfig,
    pub monitor: MonitorConfig,
    pub markers: MarkerConfig,
    pub browser: BrowserSettings,
}

impl BridgeConfig {
    /// Default config location (`~/.claude-bridge/config.yaml`)
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("CLAUDE_BRIDGE_CONFIG") {
            return PathBuf::from(path);
        }
        default_home().join("config.yaml")
    }

    /// Load from YAML file, returns defaults if the file doesn't exist or is invalid
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(path = ?path, "No bridge config found, using defaults");
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(config) => {
                    info!(path = ?path, "Bridge config loaded");
                    config
                }
                Err(e) => {
                    error!(error = %e, path = ?path, "Failed to parse bridge config");
                    Self::default()
                }
            },
            Err(e) => {
                error!(error = %e, path = ?path, "Failed to read bridge config");
                Self::default()
            }
        }
    }
}

/// Bridge home directory (`~/.claude-bridge`)
pub fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("CLAUDE_BRIDGE_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-bridge")
}

/// Desktop-app WebSocket connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    /// Candidate ports, tried round-robin per attempt
    pub ports: Vec<u16>,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Attempts that use exponential backoff before switching to fixed polling
    pub fast_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            ports: vec![18642, 18643, 18644, 18645],
            base_delay_ms: 2000,
            backoff_factor: 1.5,
            max_delay_ms: 10_000,
            fast_attempts: 10,
            connect_timeout_ms: 5000,
        }
    }
}

impl ConnectionConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Outbound message queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_age_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            max_age_secs: 5 * 60,
        }
    }
}

impl QueueConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// The automated chat page
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    pub base_url: String,
    /// Substring a tab URL must contain to count as the target page
    pub host_match: String,
    /// Tab query pattern (`*` wildcards)
    pub tab_url_pattern: String,
    /// URL opened when no target tab exists
    pub open_url: String,
    pub new_chat_path: String,
    pub tab_load_timeout_ms: u64,
    pub tab_load_poll_ms: u64,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            base_url: "https://claude.ai".to_string(),
            host_match: "claude.ai".to_string(),
            tab_url_pattern: "*://claude.ai/*".to_string(),
            open_url: "https://claude.ai/chat".to_string(),
            new_chat_path: "/new".to_string(),
            tab_load_timeout_ms: 30_000,
            tab_load_poll_ms: 1000,
        }
    }
}

impl PageConfig {
    pub fn new_chat_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.new_chat_path)
    }

    pub fn tab_load_timeout(&self) -> Duration {
        Duration::from_millis(self.tab_load_timeout_ms)
    }

    pub fn tab_load_poll(&self) -> Duration {
        Duration::from_millis(self.tab_load_poll_ms)
    }
}

/// Content bridge timings and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    pub required_stable_polls: u32,
    /// Minimum candidate length for polling and strategies (a)/(c)
    pub min_response_len: usize,
    /// Minimum length for the strict assistant-only extraction
    pub strict_min_len: usize,
    pub new_chat_settle_ms: u64,
    pub navigate_settle_ms: u64,
    pub submit_delay_ms: u64,
    pub input_retry_ms: u64,
    pub input_retry_limit: u32,
    pub rate_limit_retry_delay_ms: u64,
    /// Send `ERROR` to the desktop app when a session times out or aborts
    pub report_failed_sessions: bool,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            max_poll_attempts: 100,
            required_stable_polls: 2,
            min_response_len: 50,
            strict_min_len: 100,
            new_chat_settle_ms: 1500,
            navigate_settle_ms: 2000,
            submit_delay_ms: 500,
            input_retry_ms: 1000,
            input_retry_limit: 30,
            rate_limit_retry_delay_ms: 2000,
            report_failed_sessions: false,
        }
    }
}

impl AutomationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn new_chat_settle(&self) -> Duration {
        Duration::from_millis(self.new_chat_settle_ms)
    }

    pub fn navigate_settle(&self) -> Duration {
        Duration::from_millis(self.navigate_settle_ms)
    }

    pub fn submit_delay(&self) -> Duration {
        Duration::from_millis(self.submit_delay_ms)
    }

    pub fn input_retry(&self) -> Duration {
        Duration::from_millis(self.input_retry_ms)
    }

    pub fn rate_limit_retry_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_retry_delay_ms)
    }
}

/// Page monitor timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub debounce_ms: u64,
    pub extract_delay_ms: u64,
    /// How often page signals (mutations, shortcuts) are drained
    pub signal_poll_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            extract_delay_ms: 1500,
            signal_poll_ms: 500,
        }
    }
}

impl MonitorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn extract_delay(&self) -> Duration {
        Duration::from_millis(self.extract_delay_ms)
    }

    pub fn signal_poll(&self) -> Duration {
        Duration::from_millis(self.signal_poll_ms)
    }
}

/// Phrase and pattern tables used by the prompt classifier.
///
/// The defaults are tied to one deployment's prompt templates; override them
/// here rather than in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Phrases that identify an outbound system prompt (block filter, >= 2 hits)
    pub strong_prompt: Vec<String>,
    /// Regexes for blocks that start like an outbound prompt
    pub prompt_start: Vec<String>,
    /// Phrases that mark a prompt echo when found in the first 500 chars
    pub echo: Vec<String>,
    /// Regexes for upgrade banners and similar page chrome
    pub ui_noise: Vec<String>,
    /// Regexes for rate-limit notices
    pub rate_limit: Vec<String>,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            strong_prompt: strings(&[
                "Du bist ein Experte für wissenschaftliche Forschungsmethodik",
                "Du bist ein Experte für wissenschaftliches Schreiben",
                "You are an expert in qualitative research methodology",
                "EVIDENRA PROFESSIONAL",
                "WICHTIG: Antworte AUSSCHLIESSLICH mit einem",
                "IMPORTANT: Respond ONLY with",
                "📊 EVIDENRA",
                "DOKUMENT-ANALYSE FÜR QUALITATIVE FORSCHUNG",
                "CRITICAL RULES:\n- Be",
                "SECTION-SPEZIFISCHE ANFORDERUNGEN",
                "Zielwortanzahl: MINDESTENS",
                "🎯 **SECTION-SPEZIFISCHE",
            ]),
            prompt_start: strings(&[
                r"^Du bist ein Experte",
                r"^You are an expert",
                r"^EVIDENRA PROFESSIONAL",
                r"^# ROLE\s*\nYou are an expert",
                r"^System:\s*Du bist",
                r"^System:\s*You are",
                r"^.{0,50}Du bist ein Experte",
                r"^.{0,50}🎯 \*\*SECTION-SPEZIFISCHE",
                r"^.{0,50}Section \d+ von \d+",
            ]),
            echo: strings(&[
                "Du bist ein Experte für wissenschaftliches Schreiben",
                "Du bist ein Experte für wissenschaftliche Forschungsmethodik",
                "SECTION-SPEZIFISCHE ANFORDERUNGEN",
                "🎯 **SECTION-SPEZIFISCHE",
                "Zielwortanzahl: MINDESTENS",
                "EVIDENRA PROFESSIONAL",
            ]),
            ui_noise: strings(&[
                r"(?i)alles aus pro.*plus",
                r"(?i)wählen sie zwischen.*mehr nutzung",
                r"(?i)upgrade.*claude pro",
                r"(?i)höhere ausgabelimits",
                r"(?i)subscribe.*plan",
                r"(?i)try claude.*for work",
            ]),
            rate_limit: strings(&[
                r"(?i)rate limit",
                r"(?i)too many requests",
                r"(?i)message limit",
                r"(?i)limit reached",
                r"(?i)nachrichtenlimit",
                r"(?i)zu viele anfragen",
            ]),
        }
    }
}

/// Chromium launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    /// Persistent profile so the claude.ai login survives restarts
    pub user_data_dir: Option<PathBuf>,
    pub executable: Option<PathBuf>,
    /// Interval for scanning open pages (tab lifecycle events)
    pub tab_scan_ms: u64,
    pub extra_args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: false,
            user_data_dir: None,
            executable: None,
            tab_scan_ms: 2000,
            extra_args: Vec::new(),
        }
    }
}

impl BrowserSettings {
    pub fn profile_dir(&self) -> PathBuf {
        self.user_data_dir
            .clone()
            .unwrap_or_else(|| default_home().join("profile"))
    }

    pub fn tab_scan(&self) -> Duration {
        Duration::from_millis(self.tab_scan_ms)
    }
}
