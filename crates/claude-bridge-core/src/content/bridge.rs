//! Content bridge
//!
//! One task per automated tab. Receives runtime requests from the
//! background service, drives the page through an automation session and
//! reports the outcome back.
//!
//! Session flow:
//!   ResetContext -> InputPrepared -> Submitted -> Polling
//!     -> Delivered | RateLimited (-> ResetContext) | TimedOut | Aborted
//!
//! Every wait is a timer in the task's select loop, so requests and page
//! monitor events are handled while a session is in progress.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::automation::{self, ResetOutcome};
use super::session::{AutomationSession, SessionPhase};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::extract::{ExtractedResponse, ResponseExtractor, StabilityTracker, StabilityVerdict};
use crate::monitor::{wait_for, MonitorEvent, PageMonitor};
use crate::page::{IndicatorState, PageSurface};
use crate::protocol::{
    ContentRequest, RuntimeAck, RuntimeEnvelope, RuntimeEvent, SessionFailure, SessionOutcome, TabId,
};
use crate::semantic::PromptClassifier;

/// Scheduled session step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ResetContext,
    PrepareInput { attempt: u32 },
    Submit,
}

/// Result of one poll
#[derive(Debug)]
pub enum PollOutcome {
    Pending,
    Stable(ExtractedResponse),
    RateLimited,
    TimedOut,
}

/// Handle to a running content bridge and its page monitor
pub struct ContentHandle {
    pub tab_id: TabId,
    requests: mpsc::Sender<ContentRequest>,
    bridge: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl ContentHandle {
    /// Deliver a runtime request to the bridge
    pub async fn send(&self, request: ContentRequest) -> BridgeResult<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| BridgeError::BridgeUnreachable(self.tab_id))
    }

    pub fn is_finished(&self) -> bool {
        self.bridge.is_finished()
    }
}

impl Drop for ContentHandle {
    fn drop(&mut self) {
        self.bridge.abort();
        self.monitor.abort();
    }
}

pub struct ContentBridge {
    tab_id: TabId,
    page: Arc<dyn PageSurface>,
    config: Arc<BridgeConfig>,
    classifier: Arc<dyn PromptClassifier>,
    extractor: ResponseExtractor,
    runtime: mpsc::Sender<RuntimeEnvelope>,
    session: Option<AutomationSession>,
    poll: Option<Interval>,
    step: Option<(Instant, Step)>,
}

impl ContentBridge {
    pub fn new(
        tab_id: TabId,
        page: Arc<dyn PageSurface>,
        config: Arc<BridgeConfig>,
        classifier: Arc<dyn PromptClassifier>,
        runtime: mpsc::Sender<RuntimeEnvelope>,
    ) -> Self {
        let extractor = ResponseExtractor::new(classifier.clone(), &config.automation);
        Self {
            tab_id,
            page,
            config,
            classifier,
            extractor,
            runtime,
            session: None,
            poll: None,
            step: None,
        }
    }

    /// Start the bridge and its page monitor on a tab
    pub fn spawn(
        tab_id: TabId,
        page: Arc<dyn PageSurface>,
        config: Arc<BridgeConfig>,
        classifier: Arc<dyn PromptClassifier>,
        runtime: mpsc::Sender<RuntimeEnvelope>,
    ) -> ContentHandle {
        let (request_tx, request_rx) = mpsc::channel(16);
        let (monitor_tx, monitor_rx) = mpsc::channel(16);

        let monitor = PageMonitor::new(page.clone(), config.monitor.clone(), monitor_tx);
        let monitor = tokio::spawn(monitor.run());

        let bridge = Self::new(tab_id, page, config, classifier, runtime);
        let bridge = tokio::spawn(bridge.run(request_rx, monitor_rx));

        ContentHandle {
            tab_id,
            requests: request_tx,
            bridge,
            monitor,
        }
    }

    pub fn session_phase(&self) -> Option<SessionPhase> {
        self.session.as_ref().map(|s| s.phase)
    }

    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<ContentRequest>,
        mut monitor: mpsc::Receiver<MonitorEvent>,
    ) {
        info!(tab_id = self.tab_id, "Content bridge started");
        self.indicate(IndicatorState::Disconnected).await;
        let url = self.page.current_url().await.unwrap_or_default();
        self.emit(RuntimeEvent::TabReady { url }).await;

        loop {
            let wake = self.step.as_ref().map(|(at, _)| *at);
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(event) = monitor.recv() => self.handle_monitor(event).await,
                _ = next_tick(&mut self.poll) => self.on_poll().await,
                _ = wait_for(wake) => {
                    if let Some((_, step)) = self.step.take() {
                        self.run_step(step).await;
                    }
                }
            }
        }

        info!(tab_id = self.tab_id, "Content bridge stopped");
    }

    // ========== Requests ==========

    async fn handle_request(&mut self, request: ContentRequest) {
        debug!(tab_id = self.tab_id, kind = request.kind(), "Runtime request");
        match request {
            ContentRequest::EvidenraData {
                request_id,
                data,
                reply,
            } => {
                self.start_session(request_id, data).await;
                if let Some(reply) = reply {
                    let _ = reply.send(RuntimeAck::success("Data received"));
                }
            }
            ContentRequest::GetClaudeResponse { reply } => {
                let response = match self.extractor.extract(self.page.as_ref()).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "On-demand extraction failed");
                        None
                    }
                };
                let _ = reply.send(response);
            }
        }
    }

    async fn start_session(&mut self, request_id: String, data: serde_json::Value) {
        if let Some(previous) = self.session.as_ref() {
            warn!(
                previous = %previous.request_id,
                phase = %previous.phase,
                "Replacing in-flight session"
            );
            self.finish(SessionOutcome::Failed(SessionFailure::Superseded)).await;
        }
        self.stop_timers();

        let automation = &self.config.automation;
        let tracker = StabilityTracker::new(automation.required_stable_polls, automation.min_response_len);
        let session = AutomationSession::new(request_id, data, tracker);
        info!(
            tab_id = self.tab_id,
            request_id = %session.request_id,
            prompt_len = session.prompt.len(),
            "Automation session started"
        );
        self.session = Some(session);
        self.schedule(Step::ResetContext, Duration::ZERO);
    }

    // ========== Session steps ==========

    fn schedule(&mut self, step: Step, after: Duration) {
        self.step = Some((Instant::now() + after, step));
    }

    fn stop_timers(&mut self) {
        self.poll = None;
        self.step = None;
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if let Some(session) = self.session.as_mut() {
            debug!(request_id = %session.request_id, from = %session.phase, to = %phase, "Session phase");
            session.phase = phase;
        }
    }

    async fn run_step(&mut self, step: Step) {
        let prompt = match self.session.as_ref() {
            Some(session) => session.prompt.clone(),
            None => return,
        };

        match step {
            Step::ResetContext => {
                self.indicate(IndicatorState::Processing).await;
                self.set_phase(SessionPhase::ResetContext);
                let settle = match automation::reset_context(self.page.as_ref(), &self.config.page).await {
                    Ok(outcome) => outcome.settle(&self.config.automation),
                    Err(e) => {
                        warn!(error = %e, "New chat failed, continuing in current conversation");
                        ResetOutcome::AlreadyFresh.settle(&self.config.automation)
                    }
                };
                self.schedule(Step::PrepareInput { attempt: 0 }, settle);
            }
            Step::PrepareInput { attempt } => {
                let inserted = match automation::prepare_input(self.page.as_ref(), &prompt).await {
                    Ok(inserted) => inserted,
                    Err(e) => {
                        warn!(error = %e, "Failed to insert prompt");
                        false
                    }
                };

                if inserted {
                    self.set_phase(SessionPhase::InputPrepared);
                    self.schedule(Step::Submit, self.config.automation.submit_delay());
                } else if attempt + 1 >= self.config.automation.input_retry_limit {
                    error!(attempts = attempt + 1, "Message input never appeared");
                    self.finish(SessionOutcome::Failed(SessionFailure::InputUnavailable)).await;
                } else {
                    debug!(attempt = attempt + 1, "Message input not found, retrying");
                    self.schedule(
                        Step::PrepareInput { attempt: attempt + 1 },
                        self.config.automation.input_retry(),
                    );
                }
            }
            Step::Submit => match automation::submit(self.page.as_ref()).await {
                Ok(method) => {
                    debug!(?method, "Prompt submitted");
                    self.set_phase(SessionPhase::Submitted);
                    self.start_polling();
                }
                Err(e) => {
                    error!(error = %e, "Could not submit prompt, manual send required");
                    self.finish(SessionOutcome::Failed(SessionFailure::SendUnavailable)).await;
                }
            },
        }
    }

    fn start_polling(&mut self) {
        let period = self.config.automation.poll_interval();
        let mut poll = interval_at(Instant::now() + period, period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.poll = Some(poll);
        self.set_phase(SessionPhase::Polling);
    }

    // ========== Polling ==========

    async fn on_poll(&mut self) {
        match self.poll_once().await {
            PollOutcome::Pending => {}
            PollOutcome::Stable(response) => {
                self.poll = None;
                self.complete(response.text).await;
            }
            PollOutcome::RateLimited => {
                self.poll = None;
                if let Some(session) = self.session.as_mut() {
                    session.restart();
                    warn!(
                        request_id = %session.request_id,
                        retry = session.retries,
                        "Rate limited, restarting in a new chat"
                    );
                }
                self.indicate(IndicatorState::Processing).await;
                self.schedule(Step::ResetContext, self.config.automation.rate_limit_retry_delay());
            }
            PollOutcome::TimedOut => {
                self.poll = None;
                let attempts = self.session.as_ref().map(|s| s.attempts).unwrap_or_default();
                warn!(attempts, "No stable response, giving up");
                self.finish(SessionOutcome::Failed(SessionFailure::TimedOut { attempts })).await;
            }
        }
    }

    /// One poll: rate limit, streaming indicators, then stability
    pub async fn poll_once(&mut self) -> PollOutcome {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return PollOutcome::Pending,
        };
        session.attempts += 1;
        let attempts = session.attempts;
        debug!(attempts, max = self.config.automation.max_poll_attempts, "Polling for response");

        let sampled = sample(
            self.page.as_ref(),
            self.classifier.as_ref(),
            &self.extractor,
            &mut session.stability,
        )
        .await;

        match sampled {
            Ok(Some(outcome)) => return outcome,
            Ok(None) => {}
            Err(e) => warn!(error = %e, attempts, "Poll failed"),
        }

        if attempts >= self.config.automation.max_poll_attempts {
            return PollOutcome::TimedOut;
        }
        PollOutcome::Pending
    }

    // ========== Completion ==========

    /// The text if it is a reply, or a strict re-extraction if it echoes the prompt
    async fn guard_echo(&self, text: String) -> Option<String> {
        if !self.classifier.is_echo(&text) {
            return Some(text);
        }

        warn!("Extracted text is the prompt echo, retrying with assistant-only extraction");
        match self.extractor.extract_strict(self.page.as_ref()).await {
            Ok(Some(strict)) if !self.classifier.is_echo(&strict.text) => {
                info!(len = strict.text.len(), "Found assistant reply behind the echo");
                Some(strict.text)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Strict extraction failed");
                None
            }
        }
    }

    async fn complete(&mut self, text: String) {
        match self.guard_echo(text).await {
            Some(text) => self.finish(SessionOutcome::Delivered { text }).await,
            None => {
                error!("Only the prompt echo is on the page, not forwarding");
                self.finish(SessionOutcome::Failed(SessionFailure::EchoRejected)).await;
            }
        }
    }

    async fn finish(&mut self, outcome: SessionOutcome) {
        self.stop_timers();
        let mut session = match self.session.take() {
            Some(session) => session,
            None => return,
        };

        session.phase = match &outcome {
            SessionOutcome::Delivered { .. } => SessionPhase::Delivered,
            SessionOutcome::Failed(SessionFailure::TimedOut { .. }) => SessionPhase::TimedOut,
            SessionOutcome::Failed(_) => SessionPhase::Aborted,
        };

        match &outcome {
            SessionOutcome::Delivered { text } => info!(
                request_id = %session.request_id,
                len = text.len(),
                retries = session.retries,
                elapsed_ms = session.started_at.elapsed().as_millis() as u64,
                "Response delivered"
            ),
            SessionOutcome::Failed(reason) => warn!(
                request_id = %session.request_id,
                phase = %session.phase,
                %reason,
                "Session ended without response"
            ),
        }

        self.indicate(IndicatorState::Disconnected).await;
        self.emit(RuntimeEvent::ClaudeResponse {
            request_id: session.request_id,
            outcome,
        })
        .await;
    }

    // ========== Page monitor ==========

    async fn handle_monitor(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::ResponseObserved(response) => {
                // Stability is only judged on the poll interval
                debug!(
                    words = response.word_count,
                    phase = ?self.session_phase(),
                    "Reply mutation observed"
                );
            }
            MonitorEvent::ForcedExtract(Some(response)) => {
                if self.session.is_some() {
                    info!(words = response.word_count, "Delivering manually extracted response");
                    self.complete(response.text).await;
                } else {
                    info!("Manual extraction ignored, no session in flight");
                }
            }
            MonitorEvent::ForcedExtract(None) => {
                info!("Manual extraction found no response");
            }
            MonitorEvent::Reset => {
                if self.session.is_some() {
                    self.finish(SessionOutcome::Failed(SessionFailure::Reset)).await;
                } else {
                    self.indicate(IndicatorState::Disconnected).await;
                }
            }
        }
    }

    // ========== Helpers ==========

    async fn indicate(&self, state: IndicatorState) {
        if let Err(e) = self.page.set_indicator(state).await {
            debug!(error = %e, "Failed to update page indicator");
        }
    }

    async fn emit(&self, event: RuntimeEvent) {
        let kind = event.kind();
        let envelope = RuntimeEnvelope {
            tab_id: self.tab_id,
            event,
        };
        if self.runtime.send(envelope).await.is_err() {
            warn!(kind, "Background service gone, dropping runtime message");
        }
    }
}

/// Sample the page once. `None` means keep polling.
async fn sample(
    page: &dyn PageSurface,
    classifier: &dyn PromptClassifier,
    extractor: &ResponseExtractor,
    tracker: &mut StabilityTracker,
) -> BridgeResult<Option<PollOutcome>> {
    if automation::detect_rate_limit(page, classifier).await? {
        return Ok(Some(PollOutcome::RateLimited));
    }

    if automation::is_streaming(page).await? {
        tracker.observe_streaming();
        debug!("Claude is still generating");
        return Ok(None);
    }

    let response = extractor.extract(page).await?;
    let verdict = tracker.observe(response.as_ref().map(|r| r.text.as_str()));
    match (verdict, response) {
        (StabilityVerdict::Stable { len }, Some(response)) => {
            info!(len, "Response complete and stable");
            Ok(Some(PollOutcome::Stable(response)))
        }
        (verdict, _) => {
            debug!(?verdict, "Response not stable yet");
            Ok(None)
        }
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => std::future::pending().await,
    }
}
