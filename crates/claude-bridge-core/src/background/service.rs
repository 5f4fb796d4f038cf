//! Background service
//!
//! Owns the desktop-app WebSocket, the outbound queue and the target tab.
//! Generation requests are serialised: one session is in flight, later
//! requests wait in a FIFO until it reports an outcome.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectPolicy;
use super::queue::{MessageSink, OutboundQueue};
use super::tabs::{TabEvent, TabHost};
use crate::config::{BridgeConfig, PageConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{
    now_iso, Badge, ContentRequest, Envelope, InboundMessage, RuntimeEnvelope, RuntimeEvent, ServiceStatus,
    SessionOutcome, TabId, TabInfo,
};

/// How long a content bridge has to acknowledge `EVIDENRA_DATA`
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[async_trait]
impl MessageSink for WsSink {
    async fn send_envelope(&mut self, envelope: &Envelope) -> BridgeResult<()> {
        let text = envelope.to_text()?;
        self.send(Message::Text(text)).await?;
        Ok(())
    }
}

/// Desktop connection state. At most one socket or attempt exists.
enum Link {
    Closed { retry_at: Option<Instant> },
    Connecting { port: u16, task: JoinHandle<BridgeResult<WsStream>> },
    Open { port: u16, sink: WsSink, source: WsSource },
}

enum LinkEvent {
    RetryDue,
    Connected(BridgeResult<WsStream>),
    Inbound(Option<Result<Message, tungstenite::Error>>),
}

async fn next_link_event(link: &mut Link) -> LinkEvent {
    match link {
        Link::Closed { retry_at: Some(at) } => {
            sleep_until(*at).await;
            LinkEvent::RetryDue
        }
        Link::Closed { retry_at: None } => std::future::pending().await,
        Link::Connecting { task, .. } => {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(BridgeError::Transport(e.to_string())),
            };
            LinkEvent::Connected(result)
        }
        Link::Open { source, .. } => LinkEvent::Inbound(source.next().await),
    }
}

/// Control messages for a running service
#[derive(Debug)]
pub enum ServiceCommand {
    Status(oneshot::Sender<ServiceStatus>),
    Shutdown,
}

/// Handle to a spawned background service
pub struct ServiceHandle {
    commands: mpsc::Sender<ServiceCommand>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    pub async fn status(&self) -> BridgeResult<ServiceStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ServiceCommand::Status(tx))
            .await
            .map_err(|_| BridgeError::Transport("Background service stopped".to_string()))?;
        rx.await
            .map_err(|_| BridgeError::Transport("Background service stopped".to_string()))
    }

    /// Stop the service and wait for it to close the socket
    pub async fn shutdown(self) {
        let _ = self.commands.send(ServiceCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Background service task failed");
        }
    }
}

struct PendingRequest {
    request_id: String,
    data: Value,
}

struct InFlight {
    request_id: String,
    tab_id: Option<TabId>,
}

/// Result of handing a request to a content bridge
struct Dispatched {
    request_id: String,
    result: BridgeResult<TabId>,
}

pub struct BackgroundService {
    config: Arc<BridgeConfig>,
    host: Arc<dyn TabHost>,
    policy: ReconnectPolicy,
    queue: OutboundQueue,
    link: Link,
    badge: Badge,
    claude_tab: Option<TabId>,
    pending: VecDeque<PendingRequest>,
    in_flight: Option<InFlight>,
    dispatch_tx: mpsc::Sender<Dispatched>,
    dispatch_rx: mpsc::Receiver<Dispatched>,
}

impl BackgroundService {
    pub fn new(config: Arc<BridgeConfig>, host: Arc<dyn TabHost>) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(16);
        Self {
            policy: ReconnectPolicy::new(&config.connection),
            queue: OutboundQueue::new(&config.queue),
            config,
            host,
            link: Link::Closed { retry_at: None },
            badge: Badge::Disconnected,
            claude_tab: None,
            pending: VecDeque::new(),
            in_flight: None,
            dispatch_tx,
            dispatch_rx,
        }
    }

    /// Run the service on its own task
    pub fn spawn(
        config: Arc<BridgeConfig>,
        host: Arc<dyn TabHost>,
        runtime: mpsc::Receiver<RuntimeEnvelope>,
        tab_events: mpsc::Receiver<TabEvent>,
    ) -> ServiceHandle {
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let service = Self::new(config, host);
        let task = tokio::spawn(service.run(runtime, tab_events, commands_rx));
        ServiceHandle {
            commands: commands_tx,
            task,
        }
    }

    pub async fn run(
        mut self,
        mut runtime: mpsc::Receiver<RuntimeEnvelope>,
        mut tab_events: mpsc::Receiver<TabEvent>,
        mut commands: mpsc::Receiver<ServiceCommand>,
    ) {
        info!(
            host = %self.config.connection.host,
            ports = ?self.config.connection.ports,
            "Background service started"
        );
        self.start_connect();

        loop {
            tokio::select! {
                event = next_link_event(&mut self.link) => self.on_link_event(event).await,
                Some(done) = self.dispatch_rx.recv() => self.on_dispatched(done).await,
                Some(envelope) = runtime.recv() => self.on_runtime(envelope).await,
                Some(event) = tab_events.recv() => self.on_tab_event(event).await,
                command = commands.recv() => match command {
                    Some(ServiceCommand::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(ServiceCommand::Shutdown) | None => break,
                },
            }
        }

        if let Link::Open { mut sink, .. } = std::mem::replace(&mut self.link, Link::Closed { retry_at: None }) {
            let _ = sink.close().await;
        }
        info!(queued = self.queue.len(), "Background service stopped");
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            connected: matches!(self.link, Link::Open { .. }),
            port: match &self.link {
                Link::Open { port, .. } => Some(*port),
                _ => None,
            },
            claude_tab: self.claude_tab,
            timestamp: now_iso(),
            queued: self.queue.len(),
            in_flight: self.in_flight.as_ref().map(|f| f.request_id.clone()),
            badge: self.badge,
        }
    }

    // ========== Connection ==========

    fn start_connect(&mut self) {
        let port = self.policy.port();
        let url = format!("ws://{}:{}", self.config.connection.host, port);
        let limit = self.config.connection.connect_timeout();
        debug!(%url, attempt = self.policy.attempts(), "Connecting to desktop app");

        let task = tokio::spawn(async move {
            match timeout(limit, connect_async(url)).await {
                Ok(Ok((stream, _))) => Ok(stream),
                Ok(Err(e)) => Err(BridgeError::from(e)),
                Err(_) => Err(BridgeError::Timeout(limit)),
            }
        });
        self.link = Link::Connecting { port, task };
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.policy.next_delay();
        let attempt = self.policy.attempts();
        let port = self.policy.port();
        let delay_ms = delay.as_millis() as u64;

        if attempt > self.config.connection.fast_attempts {
            if self.policy.should_log() {
                info!(attempt, port, delay_ms, "Still waiting for desktop app");
            }
        } else {
            info!(attempt, port, delay_ms, "Reconnecting to desktop app");
        }
        self.link = Link::Closed {
            retry_at: Some(Instant::now() + delay),
        };
    }

    fn drop_link(&mut self, badge: Badge) {
        if let Link::Open { port, .. } = &self.link {
            info!(port = *port, "Desktop connection lost");
        }
        self.link = Link::Closed { retry_at: None };
        self.set_badge(badge);
        self.schedule_reconnect();
    }

    fn set_badge(&mut self, badge: Badge) {
        if self.badge != badge {
            debug!(text = badge.text(), color = badge.color(), "Badge updated");
            self.badge = badge;
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::RetryDue => self.start_connect(),
            LinkEvent::Connected(Ok(stream)) => {
                let port = match &self.link {
                    Link::Connecting { port, .. } => *port,
                    _ => self.policy.port(),
                };
                info!(port, attempts = self.policy.attempts(), "Connected to desktop app");
                let (sink, source) = stream.split();
                self.policy.reset();
                self.link = Link::Open { port, sink, source };
                self.set_badge(Badge::Connected);
                self.flush_queue().await;
            }
            LinkEvent::Connected(Err(e)) => {
                debug!(error = %e, "Desktop app not reachable");
                self.set_badge(Badge::Disconnected);
                self.schedule_reconnect();
            }
            LinkEvent::Inbound(Some(Ok(Message::Text(text)))) => self.on_text(&text).await,
            LinkEvent::Inbound(Some(Ok(Message::Close(frame)))) => {
                info!(?frame, "Desktop app closed the connection");
                self.drop_link(Badge::Disconnected);
            }
            LinkEvent::Inbound(Some(Ok(_))) => {}
            LinkEvent::Inbound(Some(Err(e))) => {
                warn!(error = %e, "WebSocket error");
                self.drop_link(Badge::Error);
            }
            LinkEvent::Inbound(None) => self.drop_link(Badge::Disconnected),
        }
    }

    /// Transmit now if connected, otherwise queue and pull a pending
    /// reconnect forward
    async fn send(&mut self, envelope: Envelope) {
        if let Link::Open { sink, .. } = &mut self.link {
            match sink.send_envelope(&envelope).await {
                Ok(()) => {
                    debug!(kind = %envelope.kind, "Sent to desktop app");
                }
                Err(e) => {
                    warn!(error = %e, kind = %envelope.kind, "Send failed, message queued");
                    self.queue.push(envelope);
                    self.drop_link(Badge::Error);
                }
            }
            return;
        }

        debug!(kind = %envelope.kind, queued = self.queue.len() + 1, "Desktop app not connected, message queued");
        self.queue.push(envelope);
        if matches!(self.link, Link::Closed { retry_at: Some(_) }) {
            debug!("Reconnecting early for queued message");
            self.start_connect();
        }
    }

    async fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let result = match &mut self.link {
            Link::Open { sink, .. } => self.queue.flush(sink).await,
            _ => return,
        };
        match result {
            Ok(report) => info!(sent = report.sent, expired = report.expired, "Queued messages delivered"),
            Err(_) => self.drop_link(Badge::Error),
        }
    }

    // ========== Desktop messages ==========

    async fn on_text(&mut self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Invalid message from desktop app");
                return;
            }
        };

        match message {
            InboundMessage::ConnectionEstablished { client_id } => {
                info!(client_id = ?client_id, "Desktop app confirmed connection");
            }
            InboundMessage::GenerateReport { data, request_id } => {
                self.on_generate_report(data, request_id).await;
            }
            InboundMessage::Ping => self.send(Envelope::pong()).await,
            InboundMessage::GetClaudeTabs => {
                let tabs = match self.host.query(&self.config.page.tab_url_pattern).await {
                    Ok(tabs) => tabs,
                    Err(e) => {
                        warn!(error = %e, "Tab query failed");
                        Vec::new()
                    }
                };
                self.send(Envelope::tabs_list(&tabs, self.claude_tab)).await;
            }
            InboundMessage::Unknown(kind) => warn!(%kind, "Unknown message type ignored"),
        }
    }

    async fn on_generate_report(&mut self, data: Option<Value>, request_id: Option<String>) {
        let request_id = match request_id {
            Some(id) => id,
            None => {
                warn!("GENERATE_REPORT without requestId dropped");
                return;
            }
        };

        let data = match data {
            Some(data) if data.is_object() => data,
            _ => {
                warn!(%request_id, "GENERATE_REPORT without payload");
                let reason = BridgeError::MissingPayload.to_string();
                self.send(Envelope::error(&request_id, &reason)).await;
                return;
            }
        };

        info!(%request_id, waiting = self.pending.len(), "Generation request received");
        self.pending.push_back(PendingRequest { request_id, data });
        self.dispatch_next();
    }

    // ========== Request dispatch ==========

    fn dispatch_next(&mut self) {
        if let Some(current) = &self.in_flight {
            debug!(
                in_flight = %current.request_id,
                waiting = self.pending.len(),
                "Session in flight, request waits"
            );
            return;
        }
        let PendingRequest { request_id, data } = match self.pending.pop_front() {
            Some(request) => request,
            None => return,
        };

        self.in_flight = Some(InFlight {
            request_id: request_id.clone(),
            tab_id: None,
        });

        let host = self.host.clone();
        let page = self.config.page.clone();
        let known = self.claude_tab;
        let done = self.dispatch_tx.clone();
        tokio::spawn(async move {
            let result = dispatch(host.as_ref(), known, &page, &request_id, data).await;
            let _ = done.send(Dispatched { request_id, result }).await;
        });
    }

    async fn on_dispatched(&mut self, done: Dispatched) {
        match done.result {
            Ok(tab_id) => {
                if self.claude_tab != Some(tab_id) {
                    info!(tab_id, "Claude tab selected");
                }
                self.claude_tab = Some(tab_id);
                if let Some(in_flight) = self.in_flight.as_mut().filter(|f| f.request_id == done.request_id) {
                    in_flight.tab_id = Some(tab_id);
                }
                info!(request_id = %done.request_id, tab_id, "Request handed to content bridge");
            }
            Err(e) => {
                error!(request_id = %done.request_id, error = %e, "Could not forward request");
                self.send(Envelope::error(&done.request_id, &e.to_string())).await;
                self.finish_in_flight(&done.request_id);
            }
        }
    }

    fn finish_in_flight(&mut self, request_id: &str) {
        match &self.in_flight {
            Some(current) if current.request_id == request_id => self.in_flight = None,
            Some(current) => {
                warn!(request_id, in_flight = %current.request_id, "Outcome for a request that is not in flight");
            }
            None => {}
        }
        self.dispatch_next();
    }

    // ========== Content bridges and tabs ==========

    async fn on_runtime(&mut self, envelope: RuntimeEnvelope) {
        let RuntimeEnvelope { tab_id, event } = envelope;
        debug!(tab_id, kind = event.kind(), "Runtime message");

        match event {
            RuntimeEvent::ClaudeResponse { request_id, outcome } => {
                match outcome {
                    SessionOutcome::Delivered { text } => {
                        info!(%request_id, tab_id, len = text.len(), "Forwarding Claude response");
                        self.send(Envelope::claude_response(&request_id, &text, Some(tab_id)))
                            .await;
                    }
                    SessionOutcome::Failed(reason) => {
                        if self.config.automation.report_failed_sessions {
                            self.send(Envelope::error(&request_id, &reason.to_string())).await;
                        } else {
                            warn!(%request_id, %reason, "Session failed, nothing sent");
                        }
                    }
                }
                self.finish_in_flight(&request_id);
            }
            RuntimeEvent::TabReady { url } => {
                if url.contains(&self.config.page.host_match) {
                    info!(tab_id, %url, "Content bridge ready");
                    self.claude_tab = Some(tab_id);
                } else {
                    debug!(tab_id, %url, "Content bridge ready on foreign page");
                }
            }
            RuntimeEvent::GetStatus { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn on_tab_event(&mut self, event: TabEvent) {
        match event {
            TabEvent::Updated(tab) => {
                if tab.complete && tab.url.contains(&self.config.page.host_match) {
                    info!(tab_id = tab.id, url = %tab.url, "Claude tab ready");
                    self.claude_tab = Some(tab.id);
                    self.send(Envelope::tab_ready(tab.id, &tab.url)).await;
                }
            }
            TabEvent::Removed(id) => {
                if self.claude_tab == Some(id) {
                    info!(tab_id = id, "Claude tab closed");
                    self.claude_tab = None;
                    self.send(Envelope::tab_closed(id)).await;
                }

                let orphaned = self
                    .in_flight
                    .as_ref()
                    .filter(|f| f.tab_id == Some(id))
                    .map(|f| f.request_id.clone());
                if let Some(request_id) = orphaned {
                    warn!(%request_id, tab_id = id, "Tab closed during session");
                    self.send(Envelope::error(&request_id, "Claude tab closed before a response arrived"))
                        .await;
                    self.finish_in_flight(&request_id);
                }
            }
        }
    }
}

/// Make sure a target tab exists and hand the request to its content bridge
async fn dispatch(
    host: &dyn TabHost,
    known: Option<TabId>,
    page: &PageConfig,
    request_id: &str,
    data: Value,
) -> BridgeResult<TabId> {
    let tab = ensure_tab(host, known, page).await?;
    if let Err(e) = host.activate(tab.id).await {
        debug!(tab_id = tab.id, error = %e, "Could not focus tab");
    }

    let (ack_tx, ack_rx) = oneshot::channel();
    host.deliver(
        tab.id,
        ContentRequest::EvidenraData {
            request_id: request_id.to_string(),
            data,
            reply: Some(ack_tx),
        },
    )
    .await?;

    match timeout(ACK_TIMEOUT, ack_rx).await {
        Ok(Ok(ack)) => {
            debug!(request_id, status = %ack.status, "Content bridge acknowledged");
            Ok(tab.id)
        }
        _ => Err(BridgeError::BridgeUnreachable(tab.id)),
    }
}

/// Known tab if it still shows the target page, else any open target tab,
/// else a new one once it has loaded
pub async fn ensure_tab(host: &dyn TabHost, known: Option<TabId>, page: &PageConfig) -> BridgeResult<TabInfo> {
    if let Some(id) = known {
        match host.get(id).await? {
            Some(tab) if tab.url.contains(&page.host_match) => {
                debug!(tab_id = id, "Reusing Claude tab");
                return wait_until_loaded(host, tab, page).await;
            }
            Some(tab) => debug!(tab_id = id, url = %tab.url, "Known tab left the chat page"),
            None => debug!(tab_id = id, "Known tab is gone"),
        }
    }

    if let Some(tab) = host.query(&page.tab_url_pattern).await?.into_iter().next() {
        info!(tab_id = tab.id, url = %tab.url, "Using open Claude tab");
        return wait_until_loaded(host, tab, page).await;
    }

    info!(url = %page.open_url, "No Claude tab open, creating one");
    let tab = host.create(&page.open_url).await?;
    wait_until_loaded(host, tab, page).await
}

async fn wait_until_loaded(host: &dyn TabHost, tab: TabInfo, page: &PageConfig) -> BridgeResult<TabInfo> {
    if tab.complete {
        return Ok(tab);
    }

    let limit = page.tab_load_timeout();
    let deadline = Instant::now() + limit;
    loop {
        sleep(page.tab_load_poll()).await;
        match host.get(tab.id).await? {
            Some(current) if current.complete => {
                info!(tab_id = tab.id, "Claude tab loaded");
                return Ok(current);
            }
            Some(_) => {}
            None => return Err(BridgeError::Tab(format!("Tab {} closed while loading", tab.id))),
        }
        if Instant::now() >= deadline {
            return Err(BridgeError::Timeout(limit));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::MemoryTabHost;
    use crate::page::{selectors, MemoryElement, MemoryPage, PageAction};
    use serde_json::json;
    use tokio::net::TcpListener;

    const ASSISTANT: &str = r#"[data-message-author-role="assistant"]"#;

    fn fast_config(port: u16) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.connection.host = "127.0.0.1".to_string();
        config.connection.ports = vec![port];
        config.connection.base_delay_ms = 50;
        config.connection.max_delay_ms = 200;
        config.automation.poll_interval_ms = 20;
        config.automation.new_chat_settle_ms = 10;
        config.automation.navigate_settle_ms = 10;
        config.automation.submit_delay_ms = 5;
        config.automation.input_retry_ms = 10;
        config.automation.rate_limit_retry_delay_ms = 10;
        config.monitor.signal_poll_ms = 10;
        config.page.tab_load_poll_ms = 10;
        config
    }

    fn reply(n: u32) -> String {
        format!("Reply number {} for the desktop app.{}", n, " Findings.".repeat(8))
    }

    /// Chat page that answers every submitted prompt with `reply(n)`
    fn chat_page() -> Arc<MemoryPage> {
        let page = Arc::new(MemoryPage::new("https://claude.ai/chat/1"));
        page.with_dom(|dom| {
            dom.push(
                MemoryElement::new("button")
                    .matching(&[selectors::NEW_CHAT[0], "button"])
                    .aria_label("New chat"),
            );
            dom.push(MemoryElement::new("textarea").matching(&[selectors::INPUT[0]]));
            dom.push(
                MemoryElement::new("button")
                    .matching(&[selectors::SEND[0], "button"])
                    .aria_label("Send message"),
            );
        });
        let mut sent = 0;
        page.on_action(move |action, dom| match action {
            PageAction::Click(el) if el.selector == selectors::SEND[0] => {
                sent += 1;
                dom.push(MemoryElement::new("div").matching(&[ASSISTANT]).text(&reply(sent)));
            }
            PageAction::Click(el) if el.selector == selectors::NEW_CHAT[0] => {
                dom.remove_matching(ASSISTANT);
            }
            _ => {}
        });
        page
    }

    struct Desktop {
        listener: TcpListener,
        ws: WebSocketStream<TcpStream>,
    }

    impl Desktop {
        async fn accept(listener: TcpListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            Self { listener, ws }
        }

        async fn send(&mut self, value: Value) {
            self.ws.send(Message::Text(value.to_string())).await.unwrap();
        }

        /// Next message of `kind`, skipping others
        async fn expect(&mut self, kind: &str) -> Value {
            let ws = &mut self.ws;
            let wait = async {
                loop {
                    match ws.next().await {
                        Some(Ok(Message::Text(text))) => {
                            let value: Value = serde_json::from_str(&text).unwrap();
                            if value["type"] == kind {
                                return value;
                            }
                        }
                        Some(Ok(_)) => {}
                        other => panic!("desktop connection ended: {:?}", other),
                    }
                }
            };
            timeout(Duration::from_secs(10), wait)
                .await
                .unwrap_or_else(|_| panic!("no {} within 10s", kind))
        }
    }

    struct Harness {
        service: ServiceHandle,
        host: Arc<MemoryTabHost>,
        runtime: mpsc::Sender<RuntimeEnvelope>,
        tab_events: mpsc::Sender<TabEvent>,
        listener: Option<TcpListener>,
    }

    async fn harness() -> Harness {
        harness_with(|_| {}).await
    }

    async fn harness_with(adjust: impl FnOnce(&mut BridgeConfig)) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = fast_config(port);
        adjust(&mut config);
        let config = Arc::new(config);

        let (runtime_tx, runtime_rx) = mpsc::channel(64);
        let host = Arc::new(MemoryTabHost::new(config.clone(), runtime_tx.clone()));
        let (tab_tx, tab_rx) = mpsc::channel(16);
        let service = BackgroundService::spawn(config, host.clone(), runtime_rx, tab_rx);

        Harness {
            service,
            host,
            runtime: runtime_tx,
            tab_events: tab_tx,
            listener: Some(listener),
        }
    }

    impl Harness {
        async fn desktop(&mut self) -> Desktop {
            Desktop::accept(self.listener.take().unwrap()).await
        }

        /// `GET_STATUS` as a content bridge would ask it
        async fn runtime_status(&self) -> ServiceStatus {
            let (reply, rx) = oneshot::channel();
            self.runtime
                .send(RuntimeEnvelope {
                    tab_id: 1,
                    event: RuntimeEvent::GetStatus { reply },
                })
                .await
                .unwrap();
            rx.await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_generate_report_round_trip() {
        let mut h = harness().await;
        let tab = h.host.open(chat_page()).await;
        let mut desktop = h.desktop().await;

        desktop.send(json!({"type": "PING"})).await;
        desktop.expect("PONG").await;

        desktop
            .send(json!({"type": "GENERATE_REPORT", "requestId": "r1", "data": {"prompt": "Summarise"}}))
            .await;
        let response = desktop.expect("CLAUDE_RESPONSE").await;
        assert_eq!(response["requestId"], "r1");
        assert_eq!(response["data"]["requestId"], "r1");
        assert_eq!(response["data"]["response"], reply(1));
        assert_eq!(response["data"]["tabId"], tab.id);

        desktop.send(json!({"type": "GET_CLAUDE_TABS"})).await;
        let list = desktop.expect("CLAUDE_TABS_LIST").await;
        assert_eq!(list["data"]["current"], tab.id);
        assert_eq!(list["data"]["tabs"][0]["url"], "https://claude.ai/chat/1");

        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_get_status_reports_link_and_queue() {
        let mut h = harness().await;
        let port = h.listener.as_ref().unwrap().local_addr().unwrap().port();

        h.tab_events
            .send(TabEvent::Updated(TabInfo {
                id: 5,
                url: "https://claude.ai/chat/1".to_string(),
                title: String::new(),
                active: true,
                complete: true,
            }))
            .await
            .unwrap();

        let offline = timeout(Duration::from_secs(5), async {
            loop {
                let status = h.runtime_status().await;
                if status.queued == 1 {
                    return status;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!offline.connected);
        assert_eq!(offline.port, None);
        assert_eq!(offline.claude_tab, Some(5));
        assert_eq!(offline.in_flight, None);
        assert_ne!(offline.badge, Badge::Connected);

        let mut desktop = h.desktop().await;
        let ready = desktop.expect("CLAUDE_TAB_READY").await;
        assert_eq!(ready["data"]["tabId"], 5);

        let online = h.runtime_status().await;
        assert!(online.connected);
        assert_eq!(online.port, Some(port));
        assert_eq!(online.queued, 0);
        assert_eq!(online.claude_tab, Some(5));
        assert_eq!(online.badge, Badge::Connected);
    }

    #[tokio::test]
    async fn test_requests_are_serialised() {
        let mut h = harness().await;
        h.host.open(chat_page()).await;
        let mut desktop = h.desktop().await;

        for id in ["r1", "r2"] {
            desktop
                .send(json!({"type": "GENERATE_REPORT", "requestId": id, "data": {"prompt": id}}))
                .await;
        }

        let first = desktop.expect("CLAUDE_RESPONSE").await;
        assert_eq!(first["requestId"], "r1");
        assert_eq!(first["data"]["response"], reply(1));

        let second = desktop.expect("CLAUDE_RESPONSE").await;
        assert_eq!(second["requestId"], "r2");
        assert_eq!(second["data"]["response"], reply(2));
    }

    #[tokio::test]
    async fn test_bad_requests_produce_errors_with_their_id() {
        let mut h = harness().await;
        let mut desktop = h.desktop().await;

        desktop.send(json!({"type": "GENERATE_REPORT", "requestId": "r3"})).await;
        let error = desktop.expect("ERROR").await;
        assert_eq!(error["requestId"], "r3");
        assert_eq!(error["data"]["error"], "Request payload missing or invalid");

        desktop
            .send(json!({"type": "GENERATE_REPORT", "requestId": "r4", "data": "text"}))
            .await;
        assert_eq!(desktop.expect("ERROR").await["requestId"], "r4");

        // No tab open: one is created, but nothing answers in it
        desktop
            .send(json!({"type": "GENERATE_REPORT", "requestId": "r5", "data": {"prompt": "hi"}}))
            .await;
        let error = desktop.expect("ERROR").await;
        assert_eq!(error["requestId"], "r5");
        assert_eq!(h.host.created().await, vec!["https://claude.ai/chat".to_string()]);
    }

    #[tokio::test]
    async fn test_messages_queue_until_connected() {
        let mut h = harness().await;
        let tab = TabInfo {
            id: 9,
            url: "https://claude.ai/new".to_string(),
            title: "Claude".to_string(),
            active: true,
            complete: true,
        };
        h.tab_events.send(TabEvent::Updated(tab)).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let status = h.service.status().await.unwrap();
        assert!(!status.connected);
        assert_eq!(status.queued, 1);

        let mut desktop = h.desktop().await;
        let ready = desktop.expect("CLAUDE_TAB_READY").await;
        assert_eq!(ready["data"]["tabId"], 9);

        let status = h.service.status().await.unwrap();
        assert!(status.connected);
        assert_eq!(status.queued, 0);
        assert_eq!(status.claude_tab, Some(9));
        assert_eq!(status.badge, Badge::Connected);
    }

    #[tokio::test]
    async fn test_reconnects_after_desktop_drops() {
        let mut h = harness().await;
        let desktop = h.desktop().await;
        let Desktop { listener, mut ws } = desktop;
        ws.close(None).await.unwrap();
        drop(ws);

        let mut desktop = Desktop::accept(listener).await;
        desktop.send(json!({"type": "PING"})).await;
        desktop.expect("PONG").await;
        assert!(h.service.status().await.unwrap().connected);
    }

    #[tokio::test]
    async fn test_closed_tab_fails_in_flight_request() {
        let mut h = harness_with(|config| config.automation.max_poll_attempts = 10_000).await;
        let page = Arc::new(MemoryPage::new("https://claude.ai/new"));
        page.with_dom(|dom| {
            dom.push(MemoryElement::new("textarea").matching(&[selectors::INPUT[0]]));
            dom.push(MemoryElement::new("button").matching(&[selectors::SEND[0], "button"]));
        });
        let tab = h.host.open(page).await;
        let mut desktop = h.desktop().await;

        desktop
            .send(json!({"type": "GENERATE_REPORT", "requestId": "r6", "data": {"prompt": "hi"}}))
            .await;
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = h.service.status().await.unwrap();
            if status.in_flight.as_deref() == Some("r6") && status.claude_tab == Some(tab.id) {
                break;
            }
            assert!(Instant::now() < deadline, "request never reached the tab");
            sleep(Duration::from_millis(10)).await;
        }

        h.host.close(tab.id).await;
        h.tab_events.send(TabEvent::Removed(tab.id)).await.unwrap();

        assert_eq!(desktop.expect("CLAUDE_TAB_CLOSED").await["data"]["tabId"], tab.id);
        assert_eq!(desktop.expect("ERROR").await["requestId"], "r6");
        assert_eq!(h.service.status().await.unwrap().in_flight, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_tab_prefers_known_then_open() {
        let (tx, _rx) = mpsc::channel(8);
        let host = MemoryTabHost::new(Arc::new(BridgeConfig::default()), tx);
        let page = PageConfig::default();
        let first = host.open_detached("https://claude.ai/chat/1").await;
        let second = host.open_detached("https://claude.ai/chat/2").await;

        let tab = ensure_tab(&host, Some(second.id), &page).await.unwrap();
        assert_eq!(tab.id, second.id);

        let tab = ensure_tab(&host, Some(99), &page).await.unwrap();
        assert_eq!(tab.id, first.id);
        assert!(host.created().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_tab_creates_and_waits_for_load() {
        let (tx, _rx) = mpsc::channel(8);
        let host = MemoryTabHost::new(Arc::new(BridgeConfig::default()), tx);
        host.serve_new_tabs(Arc::new(MemoryPage::new("about:blank")), 3).await;

        let tab = ensure_tab(&host, None, &PageConfig::default()).await.unwrap();
        assert!(tab.complete);
        assert_eq!(host.created().await, vec!["https://claude.ai/chat".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_tab_load_timeout() {
        let (tx, _rx) = mpsc::channel(8);
        let host = MemoryTabHost::new(Arc::new(BridgeConfig::default()), tx);
        host.serve_new_tabs(Arc::new(MemoryPage::new("about:blank")), u32::MAX).await;

        let err = ensure_tab(&host, None, &PageConfig::default()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(d) if d == Duration::from_secs(30)));
    }
}
