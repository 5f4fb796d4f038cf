//! Selector tables for claude.ai
//!
//! Ordered by priority; callers try them front to back. The page markup
//! changes without notice, so every list carries older variants too.

/// Message input
pub const INPUT: &[&str] = &[
    r#"textarea[placeholder*="Message"]"#,
    r#"textarea[data-testid="chat-input"]"#,
    ".ProseMirror",
    r#"[contenteditable="true"]"#,
];

/// "New chat" affordance (buttons are also matched by label text)
pub const NEW_CHAT: &[&str] = &[
    r#"[aria-label*="New"]"#,
    r#"button[aria-label*="new"]"#,
    r#"a[href="/new"]"#,
];

/// Button text that identifies a "new chat" control
pub const NEW_CHAT_LABELS: &[&str] = &["new chat", "neue"];

/// Send control, direct matches
pub const SEND: &[&str] = &[
    r#"button[aria-label*="Send"]"#,
    r#"button[aria-label*="send"]"#,
    r#"button[data-testid="send-button"]"#,
    r#"button[type="submit"]"#,
    "button.send-button",
    r#"button[class*="send"]"#,
    r#"form button[type="submit"]"#,
];

pub const BUTTONS: &str = "button";

/// Streaming in progress
pub const STREAMING: &str = r#"[data-is-streaming="true"]"#;

/// Stop-generation control (only present while streaming)
pub const STOP: &[&str] = &[r#"button[aria-label*="Stop"]"#, r#"button[aria-label*="stop"]"#];

/// Strategy (a): explicit assistant role / test ids
pub const ASSISTANT: &[&str] = &[
    r#"[data-message-author-role="assistant"]"#,
    r#"[data-testid="message-assistant"]"#,
    r#"[data-message-type="assistant"]"#,
    r#"div[class*="assistant"]"#,
    r#"div[class*="claude-message"]"#,
];

/// Strict echo-recovery extraction: assistant elements only
pub const STRICT_ASSISTANT: &[&str] = &[
    r#"[data-message-author-role="assistant"]"#,
    r#"[data-testid="message-assistant"]"#,
    r#"div[class*="assistant-message"]"#,
    r#"div[class*="claude-response"]"#,
];

/// Strategy (b): every sizable block
pub const TEXT_BLOCKS: &str = "div, article, section";

/// Strategy (c): generic fallback
pub const FALLBACK: &[&str] = &[
    r#"[data-message-author-role="assistant"]"#,
    r#"[data-testid="message-assistant"]"#,
    ".font-claude-message",
    r#"div[class*="message"]"#,
    r#"[role="article"]"#,
];

/// Artifact candidates
pub const CODE_BLOCKS: &str = r#"pre code, pre, code[class*="language"]"#;
pub const PRE_BLOCKS: &str = "pre";

/// Chat messages scanned for rate-limit notices
pub const RATE_LIMIT_MESSAGES: &str = r#"[role="article"], .message, div[class*="message"]"#;

/// Banners and alerts scanned for rate-limit notices
pub const RATE_LIMIT_BANNERS: &str = r#"[role="alert"], .error, .notification, [class*="error"]"#;

/// Page monitor: nodes that count as a response mutation
pub const MONITOR_RESPONSE: &[&str] = &[
    r#"[data-is-streaming="false"]"#,
    r#"[data-message-author-role="assistant"]"#,
    ".font-claude-message",
    ".prose",
    ".markdown-body",
];

/// Page monitor: latest response lookup
pub const MONITOR_LATEST: &[&str] = &[
    r#"[data-message-author-role="assistant"]:last-of-type .prose"#,
    r#"[data-message-author-role="assistant"]:last-of-type"#,
    r#"[data-is-streaming="false"]:last-of-type"#,
    ".font-claude-message:last-of-type",
    ".markdown-body:last-of-type",
];
