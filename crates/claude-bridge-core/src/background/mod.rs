//! Background service - the desktop-app side of the bridge
//!
//! Architecture: `BackgroundService` (actor) -> `TabHost` -> content bridges
//!
//! # Components
//! - `BackgroundService`: WebSocket link, request dispatch, tab lifecycle
//! - `ReconnectPolicy`: port rotation and backoff
//! - `OutboundQueue`: messages held while the desktop app is unreachable
//! - `TabHost`: browser tabs (`CdpTabHost`, `MemoryTabHost`)

pub mod backoff;
pub mod queue;
pub mod service;
pub mod tabs;

pub use backoff::ReconnectPolicy;
pub use queue::{FlushReport, MessageSink, OutboundQueue, QueuedMessage};
pub use service::{ensure_tab, BackgroundService, ServiceCommand, ServiceHandle};
pub use tabs::{glob_match, MemoryTabHost, TabEvent, TabHost};
