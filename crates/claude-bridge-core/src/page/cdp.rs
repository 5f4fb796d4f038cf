//! Chromium backend over the DevTools protocol
//!
//! `CdpPage` implements `PageSurface` by evaluating small scripts in the
//! page. `CdpTabHost` tracks the browser's pages as tabs and attaches a
//! content bridge to every loaded claude.ai page.

use async_trait::async_trait;
use chromiumoxide::browser::HeadlessMode;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{selectors, ElementRef, ElementSnapshot, IndicatorState, KeyModifier, PageSignals, PageSurface};
use crate::background::{glob_match, TabEvent, TabHost};
use crate::config::BridgeConfig;
use crate::content::{ContentBridge, ContentHandle};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{ContentRequest, RuntimeEnvelope, TabId, TabInfo};
use crate::semantic::{MarkerClassifier, PromptClassifier};

const INDICATOR_ID: &str = "claude-bridge-indicator";

/// JS string literal
fn js_str(s: &str) -> String {
    Value::from(s).to_string()
}

fn query_script(selector: &str) -> String {
    format!(
        r#"() => {{
    return [...document.querySelectorAll({sel})].map(el => {{
        const r = el.getBoundingClientRect();
        const prev = el.previousElementSibling;
        return {{
            tag: el.tagName.toLowerCase(),
            text: (el.innerText || el.textContent || '').trim(),
            rect: {{ left: r.left, top: r.top, width: r.width, height: r.height }},
            disabled: !!el.disabled,
            ariaLabel: el.getAttribute('aria-label'),
            inForm: !!el.closest('form'),
            hasSvg: !!el.querySelector('svg'),
            prevText: prev ? (prev.textContent || '').trim() : null,
            codeBlocks: [...el.querySelectorAll('pre, code')].map(c => c.textContent || ''),
        }};
    }});
}}"#,
        sel = js_str(selector)
    )
}

/// Script that resolves `element` and runs `body` on it as `el`; yields false if it is gone
fn element_script(element: &ElementRef, body: &str) -> String {
    format!(
        "() => {{ const el = document.querySelectorAll({sel})[{idx}]; if (!el) return false; {body} }}",
        sel = js_str(&element.selector),
        idx = element.index,
        body = body
    )
}

fn fill_body(text: &str) -> String {
    format!(
        r#"const text = {text};
    el.focus();
    if (el.tagName === 'TEXTAREA' || el.tagName === 'INPUT') {{
        el.value = text;
    }} else {{
        el.innerHTML = '';
        const p = document.createElement('p');
        p.textContent = text;
        el.appendChild(p);
    }}
    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
    return true;"#,
        text = js_str(text)
    )
}

fn enter_body(modifier: KeyModifier) -> String {
    format!(
        "el.focus(); el.dispatchEvent(new KeyboardEvent('keydown', {{ key: 'Enter', code: 'Enter', keyCode: 13, \
         metaKey: {meta}, ctrlKey: {ctrl}, bubbles: true }})); return true;",
        meta = modifier == KeyModifier::Meta,
        ctrl = modifier == KeyModifier::Ctrl
    )
}

fn indicator_script(state: IndicatorState) -> String {
    format!(
        r#"() => {{
    let el = document.getElementById({id});
    if (!el) {{
        el = document.createElement('div');
        el.id = {id};
        el.style.cssText = 'position:fixed;top:10px;right:10px;z-index:10000;padding:5px 10px;border-radius:5px;font-size:12px;font-weight:bold;color:white;';
        document.body.appendChild(el);
    }}
    el.textContent = {label};
    el.style.background = {color};
    return true;
}}"#,
        id = js_str(INDICATOR_ID),
        label = js_str(state.label()),
        color = js_str(state.color())
    )
}

fn notify_script(message: &str) -> String {
    format!(
        r#"() => {{
    const n = document.createElement('div');
    n.style.cssText = 'position:fixed;top:50px;right:10px;z-index:10001;padding:10px 15px;border-radius:5px;background:#4ECDC4;color:white;font-size:14px;box-shadow:0 2px 10px rgba(0,0,0,0.2);';
    n.textContent = {msg};
    document.body.appendChild(n);
    setTimeout(() => n.remove(), 3000);
    return true;
}}"#,
        msg = js_str(message)
    )
}

/// Installs the mutation/shortcut observer once per document, then takes its buffer
fn drain_script() -> String {
    let selectors = Value::from(selectors::MONITOR_RESPONSE.to_vec()).to_string();
    format!(
        r#"() => {{
    if (!window.__claudeBridge) {{
        const sels = {sels};
        const state = {{ mutations: 0, shortcuts: [] }};
        window.__claudeBridge = state;
        const looksLikeReply = node => node.nodeType === 1 &&
            sels.some(s => node.matches(s) || node.querySelector(s));
        new MutationObserver(records => {{
            for (const r of records) for (const n of r.addedNodes) if (looksLikeReply(n)) state.mutations++;
        }}).observe(document.body, {{ childList: true, subtree: true }});
        document.addEventListener('keydown', e => {{
            if (!e.ctrlKey || !e.shiftKey) return;
            if (e.key === 'E') {{ e.preventDefault(); state.shortcuts.push('ForceExtract'); }}
            if (e.key === 'R') {{ e.preventDefault(); state.shortcuts.push('Reset'); }}
        }});
    }}
    const s = window.__claudeBridge;
    const out = {{ responseMutations: s.mutations, shortcuts: s.shortcuts.splice(0) }};
    s.mutations = 0;
    return out;
}}"#,
        sels = selectors
    )
}

/// `PageSurface` over a Chromium page
#[derive(Clone)]
pub struct CdpPage {
    page: Page,
}

impl CdpPage {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    async fn eval<T: DeserializeOwned>(&self, script: String) -> BridgeResult<T> {
        let result = self.page.evaluate(script).await?;
        result
            .into_value::<T>()
            .map_err(|e| BridgeError::Browser(format!("Unexpected script result: {}", e)))
    }

    async fn on_element(&self, element: &ElementRef, body: &str) -> BridgeResult<()> {
        let found: bool = self.eval(element_script(element, body)).await?;
        if found {
            Ok(())
        } else {
            Err(BridgeError::Automation(format!(
                "Element {}[{}] is gone",
                element.selector, element.index
            )))
        }
    }
}

#[async_trait]
impl PageSurface for CdpPage {
    async fn query_all(&self, selector: &str) -> BridgeResult<Vec<ElementSnapshot>> {
        let mut elements: Vec<ElementSnapshot> = self.eval(query_script(selector)).await?;
        for (index, el) in elements.iter_mut().enumerate() {
            el.handle = ElementRef {
                selector: selector.to_string(),
                index,
            };
        }
        Ok(elements)
    }

    async fn markup(&self, element: &ElementRef) -> BridgeResult<String> {
        let script = format!(
            "() => {{ const el = document.querySelectorAll({})[{}]; return el ? el.innerHTML : null; }}",
            js_str(&element.selector),
            element.index
        );
        let markup: Option<String> = self.eval(script).await?;
        markup.ok_or_else(|| BridgeError::Automation(format!("Element {} is gone", element.selector)))
    }

    async fn viewport_width(&self) -> BridgeResult<f64> {
        self.eval("() => window.innerWidth".to_string()).await
    }

    async fn current_url(&self) -> BridgeResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn navigate(&self, url: &str) -> BridgeResult<()> {
        self.page.goto(url).await?;
        Ok(())
    }

    async fn click(&self, element: &ElementRef) -> BridgeResult<()> {
        self.on_element(element, "el.click(); return true;").await
    }

    async fn fill_input(&self, element: &ElementRef, text: &str) -> BridgeResult<()> {
        self.on_element(element, &fill_body(text)).await
    }

    async fn press_enter(&self, element: &ElementRef, modifier: KeyModifier) -> BridgeResult<()> {
        self.on_element(element, &enter_body(modifier)).await
    }

    async fn is_mac(&self) -> BridgeResult<bool> {
        self.eval("() => navigator.platform.toUpperCase().includes('MAC')".to_string())
            .await
    }

    async fn set_indicator(&self, state: IndicatorState) -> BridgeResult<()> {
        let _: bool = self.eval(indicator_script(state)).await?;
        Ok(())
    }

    async fn notify(&self, message: &str) -> BridgeResult<()> {
        let _: bool = self.eval(notify_script(message)).await?;
        Ok(())
    }

    async fn drain_signals(&self) -> BridgeResult<PageSignals> {
        self.eval(drain_script()).await
    }
}

struct TrackedPage {
    page: Page,
    info: TabInfo,
    bridge: Option<Arc<ContentHandle>>,
}

/// URL, title and load state read from a live page
#[derive(Debug, Clone, PartialEq)]
struct PageReading {
    url: String,
    title: String,
    complete: bool,
}

impl PageReading {
    /// Copy into `info`; true if the URL or load state changed
    fn apply(self, info: &mut TabInfo) -> bool {
        let changed = info.url != self.url || info.complete != self.complete;
        info.url = self.url;
        info.title = self.title;
        info.complete = self.complete;
        changed
    }
}

#[derive(Default)]
struct CdpTabs {
    pages: HashMap<TabId, TrackedPage>,
    /// CDP target id -> tab id
    targets: HashMap<String, TabId>,
    next_id: TabId,
    events: Option<mpsc::Sender<TabEvent>>,
}

/// Browser pages as tabs
pub struct CdpTabHost {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
    config: Arc<BridgeConfig>,
    classifier: Arc<dyn PromptClassifier>,
    runtime: mpsc::Sender<RuntimeEnvelope>,
    state: Mutex<CdpTabs>,
}

impl CdpTabHost {
    /// Start Chromium with the persistent profile
    pub async fn launch(config: Arc<BridgeConfig>, runtime: mpsc::Sender<RuntimeEnvelope>) -> BridgeResult<Arc<Self>> {
        let settings = &config.browser;
        let profile = settings.profile_dir();
        tokio::fs::create_dir_all(&profile).await?;

        let mode = if settings.headless {
            HeadlessMode::True
        } else {
            HeadlessMode::False
        };
        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile.clone())
            .headless_mode(mode)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if let Some(executable) = &settings.executable {
            builder = builder.chrome_executable(executable);
        }
        for arg in &settings.extra_args {
            builder = builder.arg(arg.as_str());
        }
        let browser_config = builder.build().map_err(BridgeError::Browser)?;

        let (browser, mut handler) = Browser::launch(browser_config).await?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler error");
                }
            }
        });
        info!(profile = ?profile, headless = settings.headless, "Browser launched");

        Ok(Arc::new(Self {
            browser: Mutex::new(browser),
            handler,
            classifier: Arc::new(MarkerClassifier::from_config(&config.markers)),
            config,
            runtime,
            state: Mutex::new(CdpTabs {
                next_id: 1,
                ..Default::default()
            }),
        }))
    }

    /// Report tab changes on `events`, scanning every `tab_scan_ms`
    pub async fn watch(self: &Arc<Self>, events: mpsc::Sender<TabEvent>) -> JoinHandle<()> {
        self.state.lock().await.events = Some(events.clone());
        let host = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(host.config.browser.tab_scan());
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = host.scan().await {
                            warn!(error = %e, "Tab scan failed");
                        }
                    }
                    _ = events.closed() => break,
                }
            }
        })
    }

    /// Sync the tab table with the browser's open pages
    pub async fn scan(&self) -> BridgeResult<()> {
        let pages = self.browser.lock().await.pages().await?;
        let seen: Vec<TabId> = {
            let mut state = self.state.lock().await;
            pages.into_iter().map(|page| Self::register(&mut state, page)).collect()
        };

        for id in &seen {
            self.refresh(*id).await;
        }

        let mut state = self.state.lock().await;
        let gone: Vec<TabId> = state.pages.keys().copied().filter(|id| !seen.contains(id)).collect();
        for id in gone {
            Self::forget(&mut state, id);
        }
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.browser.lock().await.close().await {
            warn!(error = %e, "Browser did not close cleanly");
        }
        self.handler.abort();
    }

    fn register(state: &mut CdpTabs, page: Page) -> TabId {
        let target = page.target_id().as_ref().to_string();
        if let Some(id) = state.targets.get(&target) {
            return *id;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.targets.insert(target, id);
        state.pages.insert(
            id,
            TrackedPage {
                page,
                info: TabInfo {
                    id,
                    url: String::new(),
                    title: String::new(),
                    active: false,
                    complete: false,
                },
                bridge: None,
            },
        );
        debug!(tab_id = id, "Tracking new page");
        id
    }

    fn forget(state: &mut CdpTabs, id: TabId) {
        if state.pages.remove(&id).is_some() {
            state.targets.retain(|_, tab| *tab != id);
            info!(tab_id = id, "Page closed");
            Self::emit(state, TabEvent::Removed(id));
        }
    }

    fn emit(state: &CdpTabs, event: TabEvent) {
        if let Some(events) = &state.events {
            if events.try_send(event).is_err() {
                warn!("Tab event dropped, background service is behind");
            }
        }
    }

    /// Re-read a page's URL, title and load state; attach or detach its
    /// content bridge. A page that no longer answers is forgotten. The tab
    /// table is not locked while the page is read.
    async fn refresh(&self, id: TabId) -> Option<TabInfo> {
        let page = self.state.lock().await.pages.get(&id)?.page.clone();
        let reading = read_page(&page).await;

        let mut state = self.state.lock().await;
        let reading = match reading {
            Ok(reading) => reading,
            Err(e) => {
                debug!(tab_id = id, error = %e, "Page not answering");
                Self::forget(&mut state, id);
                return None;
            }
        };

        let host_match = &self.config.page.host_match;
        let tracked = state.pages.get_mut(&id)?;
        let changed = reading.apply(&mut tracked.info);

        let on_target = tracked.info.url.contains(host_match.as_str());
        let complete = tracked.info.complete;
        let bridge_alive = tracked.bridge.as_ref().map(|b| !b.is_finished()).unwrap_or(false);
        if on_target && complete && !bridge_alive {
            let surface: Arc<dyn PageSurface> = Arc::new(CdpPage::new(page));
            tracked.bridge = Some(Arc::new(ContentBridge::spawn(
                id,
                surface,
                self.config.clone(),
                self.classifier.clone(),
                self.runtime.clone(),
            )));
            info!(tab_id = id, url = %tracked.info.url, "Content bridge attached");
        } else if !on_target && tracked.bridge.take().is_some() {
            info!(tab_id = id, url = %tracked.info.url, "Left chat page, content bridge detached");
        }

        let info = tracked.info.clone();
        if changed {
            Self::emit(&state, TabEvent::Updated(info.clone()));
        }
        Some(info)
    }
}

async fn read_page(page: &Page) -> BridgeResult<PageReading> {
    let url = page.url().await?.unwrap_or_default();
    let title = page.get_title().await?.unwrap_or_default();
    let ready: String = page
        .evaluate("() => document.readyState")
        .await?
        .into_value()
        .map_err(|e| BridgeError::Browser(e.to_string()))?;
    Ok(PageReading {
        url,
        title,
        complete: ready == "complete",
    })
}

#[async_trait]
impl TabHost for CdpTabHost {
    async fn get(&self, id: TabId) -> BridgeResult<Option<TabInfo>> {
        Ok(self.refresh(id).await)
    }

    async fn query(&self, pattern: &str) -> BridgeResult<Vec<TabInfo>> {
        self.scan().await?;
        let state = self.state.lock().await;
        let mut tabs: Vec<TabInfo> = state
            .pages
            .values()
            .filter(|t| glob_match(pattern, &t.info.url))
            .map(|t| t.info.clone())
            .collect();
        tabs.sort_by_key(|t| t.id);
        Ok(tabs)
    }

    async fn create(&self, url: &str) -> BridgeResult<TabInfo> {
        let page = self.browser.lock().await.new_page(url).await?;
        let id = Self::register(&mut *self.state.lock().await, page);
        info!(tab_id = id, url, "Page opened");
        self.refresh(id)
            .await
            .ok_or_else(|| BridgeError::Tab(format!("Page for {} closed right after opening", url)))
    }

    async fn activate(&self, id: TabId) -> BridgeResult<()> {
        let page = match self.state.lock().await.pages.get(&id) {
            Some(tracked) => tracked.page.clone(),
            None => return Err(BridgeError::Tab(format!("No tab with id {}", id))),
        };
        page.activate().await?;

        let mut state = self.state.lock().await;
        for (tab_id, tracked) in state.pages.iter_mut() {
            tracked.info.active = *tab_id == id;
        }
        Ok(())
    }

    async fn deliver(&self, id: TabId, request: ContentRequest) -> BridgeResult<()> {
        let bridge = self.state.lock().await.pages.get(&id).and_then(|t| t.bridge.clone());
        match bridge {
            Some(bridge) => bridge.send(request).await,
            None => Err(BridgeError::BridgeUnreachable(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Shortcut;

    #[test]
    fn test_selectors_are_embedded_as_literals() {
        let script = query_script(r#"[data-message-author-role="assistant"]"#);
        assert!(script.contains(r#"document.querySelectorAll("[data-message-author-role=\"assistant\"]")"#));
    }

    #[test]
    fn test_element_script_resolves_by_index() {
        let element = ElementRef {
            selector: "button".to_string(),
            index: 3,
        };
        let script = element_script(&element, "el.click(); return true;");
        assert!(script.starts_with("() => {"));
        assert!(script.contains(r#"document.querySelectorAll("button")[3]"#));
        assert!(script.contains("if (!el) return false;"));
    }

    #[test]
    fn test_fill_text_is_escaped() {
        let body = fill_body("line one\n\"quoted\" </p>");
        assert!(body.contains(r#"const text = "line one\n\"quoted\" </p>";"#));
        assert!(body.contains("p.textContent = text"));
    }

    #[test]
    fn test_enter_modifier_flags() {
        assert!(enter_body(KeyModifier::Meta).contains("metaKey: true, ctrlKey: false"));
        assert!(enter_body(KeyModifier::Ctrl).contains("metaKey: false, ctrlKey: true"));
    }

    #[test]
    fn test_drain_script_reports_shortcut_names() {
        let script = drain_script();
        assert!(script.contains("'ForceExtract'"));
        assert!(script.contains("'Reset'"));
        assert!(script.contains(r#""[data-is-streaming=\"false\"]""#));

        let signals: PageSignals =
            serde_json::from_str(r#"{"responseMutations":2,"shortcuts":["ForceExtract","Reset"]}"#).unwrap();
        assert_eq!(signals.response_mutations, 2);
        assert_eq!(signals.shortcuts, vec![Shortcut::ForceExtract, Shortcut::Reset]);
    }

    #[test]
    fn test_snapshot_decodes_query_result() {
        let raw = r#"[{"tag":"button","text":"Send","rect":{"left":1,"top":2,"width":3,"height":4},
            "disabled":false,"ariaLabel":null,"inForm":true,"hasSvg":true,"prevText":null,"codeBlocks":[]}]"#;
        let elements: Vec<ElementSnapshot> = serde_json::from_str(raw).unwrap();
        assert_eq!(elements[0].tag, "button");
        assert!(elements[0].in_form && elements[0].has_svg);
        assert_eq!(elements[0].aria_label, None);
    }

    #[test]
    fn test_page_reading_reports_url_and_load_changes() {
        let mut info = TabInfo {
            id: 3,
            url: "https://claude.ai/new".to_string(),
            title: String::new(),
            active: false,
            complete: false,
        };
        let reading = |url: &str, title: &str, complete: bool| PageReading {
            url: url.to_string(),
            title: title.to_string(),
            complete,
        };

        assert!(reading("https://claude.ai/new", "Claude", true).apply(&mut info));
        assert!(info.complete);
        assert_eq!(info.title, "Claude");

        assert!(!reading("https://claude.ai/new", "New chat - Claude", true).apply(&mut info));
        assert_eq!(info.title, "New chat - Claude");

        assert!(reading("https://claude.ai/chat/9", "New chat - Claude", true).apply(&mut info));
        assert_eq!(info.url, "https://claude.ai/chat/9");
    }

    #[test]
    fn test_indicator_uses_state_colors() {
        let script = indicator_script(IndicatorState::Processing);
        assert!(script.contains("\"#FFE66D\""));
        assert!(script.contains("\"🟡 Processing...\""));
    }
}
