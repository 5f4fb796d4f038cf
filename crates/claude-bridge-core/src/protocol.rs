//! Wire protocol
//!
//! Two channels carry messages:
//! - Desktop app <-> Background Service: JSON envelopes over WebSocket
//!   (`{ type, data?, requestId?, timestamp? }`)
//! - Background Service <-> Content Bridge: in-process runtime messages
//!   (`EVIDENRA_DATA`, `GET_CLAUDE_RESPONSE`, `CLAUDE_RESPONSE`, `TAB_READY`, `GET_STATUS`)

use crate::extract::ExtractedResponse;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tokio::sync::oneshot;

/// Tab identifier assigned by the tab host
pub type TabId = u64;

/// Envelope `type` values
pub mod kind {
    pub const CONNECTION_ESTABLISHED: &str = "CONNECTION_ESTABLISHED";
    pub const GENERATE_REPORT: &str = "GENERATE_REPORT";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const GET_CLAUDE_TABS: &str = "GET_CLAUDE_TABS";
    pub const CLAUDE_TABS_LIST: &str = "CLAUDE_TABS_LIST";
    pub const CLAUDE_RESPONSE: &str = "CLAUDE_RESPONSE";
    pub const CLAUDE_TAB_READY: &str = "CLAUDE_TAB_READY";
    pub const CLAUDE_TAB_CLOSED: &str = "CLAUDE_TAB_CLOSED";
    pub const ERROR: &str = "ERROR";
}

/// WebSocket message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl Envelope {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            data: None,
            request_id: None,
            timestamp: None,
            client_id: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(now_iso());
        self
    }

    /// `PONG` reply to `PING`
    pub fn pong() -> Self {
        Self::new(kind::PONG).stamped()
    }

    /// Completed response for a generation request
    pub fn claude_response(request_id: &str, response: &str, tab_id: Option<TabId>) -> Self {
        Self::new(kind::CLAUDE_RESPONSE)
            .with_request_id(request_id)
            .with_data(json!({
                "requestId": request_id,
                "response": response,
                "tabId": tab_id,
                "timestamp": now_iso(),
            }))
    }

    /// Error correlated to a generation request
    pub fn error(request_id: &str, error: &str) -> Self {
        Self::new(kind::ERROR)
            .with_request_id(request_id)
            .with_data(json!({
                "error": error,
                "requestId": request_id,
                "timestamp": now_iso(),
            }))
    }

    pub fn tab_ready(tab_id: TabId, url: &str) -> Self {
        Self::new(kind::CLAUDE_TAB_READY)
            .with_data(json!({ "tabId": tab_id, "url": url }))
            .stamped()
    }

    pub fn tab_closed(tab_id: TabId) -> Self {
        Self::new(kind::CLAUDE_TAB_CLOSED)
            .with_data(json!({ "tabId": tab_id }))
            .stamped()
    }

    pub fn tabs_list(tabs: &[TabInfo], current: Option<TabId>) -> Self {
        Self::new(kind::CLAUDE_TABS_LIST).with_data(json!({
            "tabs": tabs,
            "current": current,
        }))
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Messages the desktop app sends to the Background Service
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ConnectionEstablished { client_id: Option<String> },
    GenerateReport {
        data: Option<Value>,
        request_id: Option<String>,
    },
    Ping,
    GetClaudeTabs,
    Unknown(String),
}

impl InboundMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Ok(Self::from_envelope(envelope))
    }

    pub fn from_envelope(envelope: Envelope) -> Self {
        match envelope.kind.as_str() {
            kind::CONNECTION_ESTABLISHED => InboundMessage::ConnectionEstablished {
                client_id: envelope.client_id.or_else(|| {
                    envelope
                        .data
                        .as_ref()
                        .and_then(|d| d.get("clientId"))
                        .and_then(|v| v.as_str())
                        .map(String::from)
                }),
            },
            kind::GENERATE_REPORT => InboundMessage::GenerateReport {
                data: envelope.data,
                request_id: envelope.request_id,
            },
            kind::PING => InboundMessage::Ping,
            kind::GET_CLAUDE_TABS => InboundMessage::GetClaudeTabs,
            other => InboundMessage::Unknown(other.to_string()),
        }
    }
}

/// Tab metadata as reported by the tab host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub active: bool,
    /// Page finished loading (`status === 'complete'`)
    #[serde(skip)]
    pub complete: bool,
}

// ========== Runtime messaging ==========

/// Background Service -> Content Bridge
#[derive(Debug)]
pub enum ContentRequest {
    /// `EVIDENRA_DATA`: start an automation session
    EvidenraData {
        request_id: String,
        data: Value,
        reply: Option<oneshot::Sender<RuntimeAck>>,
    },
    /// `GET_CLAUDE_RESPONSE`: extract whatever is on the page right now
    GetClaudeResponse {
        reply: oneshot::Sender<Option<ExtractedResponse>>,
    },
}

impl ContentRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ContentRequest::EvidenraData { .. } => "EVIDENRA_DATA",
            ContentRequest::GetClaudeResponse { .. } => "GET_CLAUDE_RESPONSE",
        }
    }
}

/// Acknowledgement for runtime requests (`{status: 'success', message}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeAck {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RuntimeAck {
    pub fn success(message: &str) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.to_string()),
        }
    }
}

/// Content Bridge -> Background Service, tagged with the sending tab
#[derive(Debug)]
pub struct RuntimeEnvelope {
    pub tab_id: TabId,
    pub event: RuntimeEvent,
}

#[derive(Debug)]
pub enum RuntimeEvent {
    /// `CLAUDE_RESPONSE`: the session finished, successfully or not
    ClaudeResponse {
        request_id: String,
        outcome: SessionOutcome,
    },
    /// `TAB_READY`: a content bridge started on this tab
    TabReady { url: String },
    /// `GET_STATUS`
    GetStatus {
        reply: oneshot::Sender<ServiceStatus>,
    },
}

impl RuntimeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeEvent::ClaudeResponse { .. } => "CLAUDE_RESPONSE",
            RuntimeEvent::TabReady { .. } => "TAB_READY",
            RuntimeEvent::GetStatus { .. } => "GET_STATUS",
        }
    }
}

/// Result of an automation session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Delivered { text: String },
    Failed(SessionFailure),
}

/// Why a session ended without a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    /// No stable response within the poll budget
    TimedOut { attempts: u32 },
    /// Only the outbound prompt could be found on the page
    EchoRejected,
    /// The message input never appeared
    InputUnavailable,
    /// Neither a send control nor an input for keyboard submit was found
    SendUnavailable,
    /// Operator reset from the page
    Reset,
    /// A newer request arrived on the same tab
    Superseded,
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFailure::TimedOut { attempts } => {
                write!(f, "No stable response after {} polls", attempts)
            }
            SessionFailure::EchoRejected => write!(f, "Extracted text was the prompt echo"),
            SessionFailure::InputUnavailable => write!(f, "Message input not found"),
            SessionFailure::SendUnavailable => write!(f, "Send control not found"),
            SessionFailure::Reset => write!(f, "Session reset from page"),
            SessionFailure::Superseded => write!(f, "Replaced by a newer request"),
        }
    }
}

/// Connection badge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Badge {
    Connected,
    Disconnected,
    Error,
}

impl Badge {
    pub fn text(&self) -> &'static str {
        match self {
            Badge::Connected => "✓",
            Badge::Disconnected => "✗",
            Badge::Error => "!",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Badge::Connected => "#4ECDC4",
            Badge::Disconnected => "#FF6B6B",
            Badge::Error => "#FFA500",
        }
    }
}

/// `GET_STATUS` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub connected: bool,
    /// Desktop port of the open connection
    pub port: Option<u16>,
    pub claude_tab: Option<TabId>,
    pub timestamp: String,
    pub queued: usize,
    pub in_flight: Option<String>,
    pub badge: Badge,
}
