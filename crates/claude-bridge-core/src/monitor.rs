//! Page monitor
//!
//! Watches the page for reply-like mutations and the operator shortcuts,
//! and reports what it sees to the content bridge. It has no notion of
//! requests; the bridge decides what a report means.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::BridgeResult;
use crate::page::{first_match, selectors, ElementSnapshot, PageSurface, Shortcut};

/// Code blocks longer than this are elided from monitor text
const CODE_BLOCK_ELIDE_LEN: usize = 100;
const CODE_BLOCK_PLACEHOLDER: &str = "[CODE BLOCK REMOVED]";
/// Minimum trimmed length for a node to count as a reply
const MIN_REPLY_LEN: usize = 10;

/// Latest reply as seen by the monitor
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorResponse {
    pub text: String,
    pub markup: String,
    pub word_count: usize,
    pub extracted_at: DateTime<Utc>,
    /// No streaming indicator was present
    pub is_complete: bool,
}

/// Monitor -> content bridge
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// Debounced extraction after reply-like mutations
    ResponseObserved(MonitorResponse),
    /// Ctrl+Shift+E
    ForcedExtract(Option<MonitorResponse>),
    /// Ctrl+Shift+R
    Reset,
}

/// Element text with long code blocks replaced by a placeholder
pub fn monitor_text(el: &ElementSnapshot) -> String {
    el.code_blocks
        .iter()
        .filter(|code| code.chars().count() > CODE_BLOCK_ELIDE_LEN)
        .fold(el.text.clone(), |text, code| {
            text.replace(code.as_str(), CODE_BLOCK_PLACEHOLDER)
        })
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Latest reply on the page, or None if nothing qualifies
pub async fn find_latest_response(page: &dyn PageSurface) -> BridgeResult<Option<MonitorResponse>> {
    let found = first_match(page, selectors::MONITOR_LATEST, |el| {
        monitor_text(el).trim().chars().count() > MIN_REPLY_LEN
    })
    .await?;

    let el = match found {
        Some(el) => el,
        None => return Ok(None),
    };

    let text = monitor_text(&el);
    let markup = page.markup(&el.handle).await?;
    let is_complete = page.query_all(selectors::STREAMING).await?.is_empty();

    Ok(Some(MonitorResponse {
        word_count: count_words(&text),
        text,
        markup,
        extracted_at: Utc::now(),
        is_complete,
    }))
}

/// Debounced extraction scheduling
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    delay: Duration,
    last_trigger: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration, delay: Duration) -> Self {
        Self {
            window,
            delay,
            last_trigger: None,
        }
    }

    /// Register a mutation at `now`; returns when to extract, if at all
    pub fn trigger(&mut self, now: Instant) -> Option<Instant> {
        if let Some(last) = self.last_trigger {
            if now.duration_since(last) <= self.window {
                return None;
            }
        }
        self.last_trigger = Some(now);
        Some(now + self.delay)
    }
}

/// Page monitor task
pub struct PageMonitor {
    page: Arc<dyn PageSurface>,
    config: MonitorConfig,
    events: mpsc::Sender<MonitorEvent>,
    debouncer: Debouncer,
    pending_extract: Option<Instant>,
}

impl PageMonitor {
    pub fn new(page: Arc<dyn PageSurface>, config: MonitorConfig, events: mpsc::Sender<MonitorEvent>) -> Self {
        let debouncer = Debouncer::new(config.debounce(), config.extract_delay());
        Self {
            page,
            config,
            events,
            debouncer,
            pending_extract: None,
        }
    }

    /// Run until the content bridge goes away
    pub async fn run(mut self) {
        let mut signals = interval(self.config.signal_poll());
        signals.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Page monitor started");

        loop {
            let pending = self.pending_extract;
            tokio::select! {
                _ = signals.tick() => {
                    if let Err(e) = self.check_signals().await {
                        debug!(error = %e, "Failed to drain page signals");
                    }
                }
                _ = wait_for(pending) => {
                    self.pending_extract = None;
                    self.extract_and_report().await;
                }
                _ = self.events.closed() => break,
            }
        }

        info!("Page monitor stopped");
    }

    async fn check_signals(&mut self) -> BridgeResult<()> {
        let signals = self.page.drain_signals().await?;

        if signals.response_mutations > 0 {
            if let Some(at) = self.debouncer.trigger(Instant::now()) {
                debug!(mutations = signals.response_mutations, "Reply mutation, extraction scheduled");
                self.pending_extract = Some(at);
            }
        }

        for shortcut in signals.shortcuts {
            self.handle_shortcut(shortcut).await?;
        }
        Ok(())
    }

    async fn handle_shortcut(&mut self, shortcut: Shortcut) -> BridgeResult<()> {
        match shortcut {
            Shortcut::ForceExtract => {
                let response = find_latest_response(self.page.as_ref()).await?;
                info!(found = response.is_some(), "Manual extraction requested");
                self.page.notify("🔄 Claude response extracted manually").await?;
                self.emit(MonitorEvent::ForcedExtract(response)).await;
            }
            Shortcut::Reset => {
                info!("Bridge reset requested from page");
                self.page.notify("🔄 Bridge session reset").await?;
                self.emit(MonitorEvent::Reset).await;
            }
        }
        Ok(())
    }

    async fn extract_and_report(&mut self) {
        match find_latest_response(self.page.as_ref()).await {
            Ok(Some(response)) => {
                debug!(words = response.word_count, complete = response.is_complete, "Reply observed");
                self.emit(MonitorEvent::ResponseObserved(response)).await;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Monitor extraction failed"),
        }
    }

    async fn emit(&self, event: MonitorEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Content bridge gone, dropping monitor event");
        }
    }
}

/// Sleep until `deadline`, or forever when there is none
pub(crate) async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
