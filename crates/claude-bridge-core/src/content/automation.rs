//! Page interactions for a session: fresh conversation, input, submit

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AutomationConfig, PageConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::page::{first_match, selectors, url_path, ElementSnapshot, KeyModifier, PageSurface};
use crate::semantic::PromptClassifier;

/// How a fresh conversation was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Clicked a "new chat" control
    Clicked,
    /// Navigated to the new-chat URL
    Navigated,
    /// Already on the new-chat page
    AlreadyFresh,
}

impl ResetOutcome {
    /// Time for the page to settle before looking for the input
    pub fn settle(&self, config: &AutomationConfig) -> Duration {
        match self {
            ResetOutcome::Clicked => config.new_chat_settle(),
            ResetOutcome::Navigated => config.navigate_settle(),
            ResetOutcome::AlreadyFresh => Duration::ZERO,
        }
    }
}

/// How the prompt was submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitMethod {
    /// Direct send selector
    Selector(String),
    /// Button found by label, aria-label or form icon
    ButtonScan,
    /// Cmd/Ctrl+Enter on the input
    Keyboard(KeyModifier),
}

fn is_new_chat_button(el: &ElementSnapshot) -> bool {
    let text = el.text.to_lowercase();
    selectors::NEW_CHAT_LABELS.iter().any(|label| text.contains(label))
}

fn is_send_button(el: &ElementSnapshot) -> bool {
    if el.disabled {
        return false;
    }
    let text = el.text.to_lowercase();
    let aria = el.aria_label.as_deref().unwrap_or("").to_lowercase();
    text.contains("send") || aria.contains("send") || (el.has_svg && el.in_form)
}

/// Open a fresh conversation so earlier replies cannot leak into this one
pub async fn reset_context(page: &dyn PageSurface, config: &PageConfig) -> BridgeResult<ResetOutcome> {
    let mut control = first_match(page, selectors::NEW_CHAT, |_| true).await?;
    if control.is_none() {
        control = page
            .query_all(selectors::BUTTONS)
            .await?
            .into_iter()
            .find(is_new_chat_button);
    }

    if let Some(control) = control {
        info!(selector = %control.handle.selector, "Starting new chat");
        page.click(&control.handle).await?;
        return Ok(ResetOutcome::Clicked);
    }

    let url = page.current_url().await?;
    if url_path(&url) != config.new_chat_path {
        let target = config.new_chat_url();
        info!(from = %url, to = %target, "New chat control not found, navigating");
        page.navigate(&target).await?;
        return Ok(ResetOutcome::Navigated);
    }

    debug!("Already on new chat page");
    Ok(ResetOutcome::AlreadyFresh)
}

/// First message input on the page
pub async fn find_input(page: &dyn PageSurface) -> BridgeResult<Option<ElementSnapshot>> {
    first_match(page, selectors::INPUT, |_| true).await
}

/// Write the prompt into the input. Returns false when no input exists yet.
pub async fn prepare_input(page: &dyn PageSurface, prompt: &str) -> BridgeResult<bool> {
    match find_input(page).await? {
        Some(input) => {
            page.fill_input(&input.handle, prompt).await?;
            info!(selector = %input.handle.selector, len = prompt.len(), "Prompt inserted");
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Submit the prompt: send selectors, then a button scan, then the keyboard
pub async fn submit(page: &dyn PageSurface) -> BridgeResult<SubmitMethod> {
    for selector in selectors::SEND {
        let first = page.query_all(selector).await?.into_iter().next();
        if let Some(button) = first.filter(|b| !b.disabled) {
            page.click(&button.handle).await?;
            info!(selector, "Send button clicked");
            return Ok(SubmitMethod::Selector(selector.to_string()));
        }
    }

    let buttons = page.query_all(selectors::BUTTONS).await?;
    debug!(count = buttons.len(), "Scanning buttons for send control");
    if let Some(button) = buttons.into_iter().find(is_send_button) {
        page.click(&button.handle).await?;
        info!("Send button clicked via scan");
        return Ok(SubmitMethod::ButtonScan);
    }

    warn!("Send button not found or disabled, trying keyboard submit");
    match find_input(page).await? {
        Some(input) => {
            let modifier = KeyModifier::for_platform(page.is_mac().await?);
            page.press_enter(&input.handle, modifier).await?;
            info!(?modifier, "Keyboard submit dispatched");
            Ok(SubmitMethod::Keyboard(modifier))
        }
        None => Err(BridgeError::Automation(
            "No send control and no input for keyboard submit".to_string(),
        )),
    }
}

/// A generation is still streaming
pub async fn is_streaming(page: &dyn PageSurface) -> BridgeResult<bool> {
    if !page.query_all(selectors::STREAMING).await?.is_empty() {
        return Ok(true);
    }
    for selector in selectors::STOP {
        if !page.query_all(selector).await?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A rate-limit notice is shown in the chat or in a banner. Page chrome
/// such as upgrade offers is ignored even if it mentions limits.
pub async fn detect_rate_limit(
    page: &dyn PageSurface,
    classifier: &dyn PromptClassifier,
) -> BridgeResult<bool> {
    for selector in [selectors::RATE_LIMIT_MESSAGES, selectors::RATE_LIMIT_BANNERS] {
        for el in page.query_all(selector).await? {
            if classifier.is_ui_noise(&el.text) {
                continue;
            }
            if classifier.is_rate_limit(&el.text) {
                let preview: String = el.text.chars().take(100).collect();
                warn!(%preview, "Rate limit notice detected");
                return Ok(true);
            }
        }
    }
    Ok(false)
}
