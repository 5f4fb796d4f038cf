//! claude-bridge-core - drives the claude.ai chat page for a desktop app
//!
//! The desktop app connects over a local WebSocket and sends report
//! requests. The background service queues them, finds or opens a Claude
//! tab and hands each request to that tab's content bridge, which types the
//! prompt, waits for a stable reply and extracts it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use claude_bridge_core::{BackgroundService, BridgeConfig, CdpTabHost};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(BridgeConfig::load(&BridgeConfig::default_path()));
//!     let (runtime_tx, runtime_rx) = mpsc::channel(64);
//!     let (tab_tx, tab_rx) = mpsc::channel(16);
//!
//!     let host = CdpTabHost::launch(config.clone(), runtime_tx).await?;
//!     let _scan = host.watch(tab_tx).await;
//!     let service = BackgroundService::spawn(config, host.clone(), runtime_rx, tab_rx);
//!
//!     println!("{:?}", service.status().await?);
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod config;
pub mod content;
pub mod error;
pub mod extract;
pub mod monitor;
pub mod page;
pub mod protocol;
pub mod semantic;

pub use background::{BackgroundService, MemoryTabHost, ServiceHandle, TabEvent, TabHost};
pub use config::{default_home, BridgeConfig};
pub use content::{ContentBridge, ContentHandle};
pub use error::{BridgeError, BridgeResult};
pub use extract::ExtractedResponse;
pub use monitor::{MonitorEvent, PageMonitor};
pub use page::{CdpPage, CdpTabHost, MemoryPage, PageSurface};
pub use protocol::{Badge, Envelope, ServiceStatus, TabId, TabInfo};
pub use semantic::{MarkerClassifier, PromptClassifier};
