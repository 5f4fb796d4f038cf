//! In-memory page
//!
//! A flat list of elements in document order. Each element declares the
//! selectors it matches; a comma-separated selector matches an element if
//! any of its parts does. Every action is recorded, and an optional
//! reaction hook lets a test mutate the DOM in response (e.g. a reply
//! appearing after the send button is clicked).

use super::{ElementRef, ElementSnapshot, IndicatorState, KeyModifier, PageSignals, PageSurface, Rect, Shortcut};
use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use std::sync::Mutex;

/// Element stored in a `MemoryDom`
#[derive(Debug, Clone, Default)]
pub struct MemoryElement {
    pub selectors: Vec<String>,
    pub snapshot: ElementSnapshot,
    pub markup: String,
}

impl MemoryElement {
    pub fn new(tag: &str) -> Self {
        Self {
            selectors: Vec::new(),
            snapshot: ElementSnapshot {
                tag: tag.to_string(),
                rect: Rect::new(400.0, 0.0, 600.0, 40.0),
                ..Default::default()
            },
            markup: String::new(),
        }
    }

    pub fn matching(mut self, selectors: &[&str]) -> Self {
        self.selectors.extend(selectors.iter().map(|s| s.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.snapshot.text = text.to_string();
        if self.markup.is_empty() {
            self.markup = format!("<p>{}</p>", text);
        }
        self
    }

    pub fn markup(mut self, markup: &str) -> Self {
        self.markup = markup.to_string();
        self
    }

    pub fn rect(mut self, left: f64, top: f64, width: f64, height: f64) -> Self {
        self.snapshot.rect = Rect::new(left, top, width, height);
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.snapshot.disabled = disabled;
        self
    }

    pub fn aria_label(mut self, label: &str) -> Self {
        self.snapshot.aria_label = Some(label.to_string());
        self
    }

    pub fn in_form(mut self) -> Self {
        self.snapshot.in_form = true;
        self
    }

    pub fn with_svg(mut self) -> Self {
        self.snapshot.has_svg = true;
        self
    }

    pub fn prev_text(mut self, text: &str) -> Self {
        self.snapshot.prev_text = Some(text.to_string());
        self
    }

    pub fn code_block(mut self, code: &str) -> Self {
        self.snapshot.code_blocks.push(code.to_string());
        self
    }

    pub fn matches(&self, selector: &str) -> bool {
        selector
            .split(',')
            .map(str::trim)
            .any(|part| self.selectors.iter().any(|s| s == part))
    }
}

/// Recorded page interaction
#[derive(Debug, Clone, PartialEq)]
pub enum PageAction {
    Click(ElementRef),
    Fill { element: ElementRef, text: String },
    PressEnter { element: ElementRef, modifier: KeyModifier },
    Navigate(String),
    Indicator(IndicatorState),
    Notify(String),
}

/// Mutable page state
#[derive(Debug, Default)]
pub struct MemoryDom {
    pub url: String,
    pub viewport_width: f64,
    pub is_mac: bool,
    pub elements: Vec<MemoryElement>,
    pub signals: PageSignals,
}

impl MemoryDom {
    pub fn push(&mut self, element: MemoryElement) {
        self.elements.push(element);
    }

    /// Remove every element matching `selector`
    pub fn remove_matching(&mut self, selector: &str) {
        self.elements.retain(|e| !e.matches(selector));
    }

    /// Set the text of every element matching `selector`
    pub fn set_text(&mut self, selector: &str, text: &str) {
        for element in self.elements.iter_mut().filter(|e| e.matches(selector)) {
            element.snapshot.text = text.to_string();
        }
    }

    /// Snapshot of the element at `handle`, clicked or filled by the bridge
    pub fn resolve(&self, handle: &ElementRef) -> Option<&MemoryElement> {
        self.elements
            .iter()
            .filter(|e| e.matches(&handle.selector))
            .nth(handle.index)
    }
}

type Reaction = Box<dyn FnMut(&PageAction, &mut MemoryDom) + Send>;

struct MemoryState {
    dom: MemoryDom,
    actions: Vec<PageAction>,
    reaction: Option<Reaction>,
}

/// `PageSurface` over a `MemoryDom`
pub struct MemoryPage {
    state: Mutex<MemoryState>,
}

impl MemoryPage {
    pub fn new(url: &str) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                dom: MemoryDom {
                    url: url.to_string(),
                    viewport_width: 1400.0,
                    ..Default::default()
                },
                actions: Vec::new(),
                reaction: None,
            }),
        }
    }

    /// Mutate the DOM
    pub fn with_dom<R>(&self, f: impl FnOnce(&mut MemoryDom) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state.dom)
    }

    /// Install a hook run after every recorded action
    pub fn on_action<F>(&self, reaction: F)
    where
        F: FnMut(&PageAction, &mut MemoryDom) + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.reaction = Some(Box::new(reaction));
    }

    pub fn actions(&self) -> Vec<PageAction> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.actions.clone()
    }

    /// Queue a shortcut for the next `drain_signals`
    pub fn press_shortcut(&self, shortcut: Shortcut) {
        self.with_dom(|dom| dom.signals.shortcuts.push(shortcut));
    }

    /// Queue response mutations for the next `drain_signals`
    pub fn add_response_mutations(&self, count: u32) {
        self.with_dom(|dom| dom.signals.response_mutations += count);
    }

    fn record(&self, action: PageAction) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let MemoryState {
            dom,
            actions,
            reaction,
        } = &mut *state;
        if let PageAction::Navigate(url) = &action {
            dom.url = url.clone();
        }
        if let Some(reaction) = reaction.as_mut() {
            reaction(&action, dom);
        }
        actions.push(action);
    }

    fn ensure_exists(&self, element: &ElementRef) -> BridgeResult<()> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.dom.resolve(element) {
            Some(_) => Ok(()),
            None => Err(BridgeError::Automation(format!(
                "Element {}[{}] no longer exists",
                element.selector, element.index
            ))),
        }
    }
}

#[async_trait]
impl PageSurface for MemoryPage {
    async fn query_all(&self, selector: &str) -> BridgeResult<Vec<ElementSnapshot>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .dom
            .elements
            .iter()
            .filter(|e| e.matches(selector))
            .enumerate()
            .map(|(index, e)| {
                let mut snapshot = e.snapshot.clone();
                snapshot.handle = ElementRef {
                    selector: selector.to_string(),
                    index,
                };
                snapshot
            })
            .collect())
    }

    async fn markup(&self, element: &ElementRef) -> BridgeResult<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .dom
            .resolve(element)
            .map(|e| e.markup.clone())
            .unwrap_or_default())
    }

    async fn viewport_width(&self) -> BridgeResult<f64> {
        Ok(self.with_dom(|dom| dom.viewport_width))
    }

    async fn current_url(&self) -> BridgeResult<String> {
        Ok(self.with_dom(|dom| dom.url.clone()))
    }

    async fn navigate(&self, url: &str) -> BridgeResult<()> {
        self.record(PageAction::Navigate(url.to_string()));
        Ok(())
    }

    async fn click(&self, element: &ElementRef) -> BridgeResult<()> {
        self.ensure_exists(element)?;
        self.record(PageAction::Click(element.clone()));
        Ok(())
    }

    async fn fill_input(&self, element: &ElementRef, text: &str) -> BridgeResult<()> {
        self.ensure_exists(element)?;
        self.record(PageAction::Fill {
            element: element.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn press_enter(&self, element: &ElementRef, modifier: KeyModifier) -> BridgeResult<()> {
        self.ensure_exists(element)?;
        self.record(PageAction::PressEnter {
            element: element.clone(),
            modifier,
        });
        Ok(())
    }

    async fn is_mac(&self) -> BridgeResult<bool> {
        Ok(self.with_dom(|dom| dom.is_mac))
    }

    async fn set_indicator(&self, state: IndicatorState) -> BridgeResult<()> {
        self.record(PageAction::Indicator(state));
        Ok(())
    }

    async fn notify(&self, message: &str) -> BridgeResult<()> {
        self.record(PageAction::Notify(message.to_string()));
        Ok(())
    }

    async fn drain_signals(&self) -> BridgeResult<PageSignals> {
        Ok(self.with_dom(|dom| std::mem::take(&mut dom.signals)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_comma_selector_matches_any_part() {
        let page = MemoryPage::new("https://claude.ai/new");
        page.with_dom(|dom| {
            dom.push(MemoryElement::new("div").matching(&["div"]).text("a"));
            dom.push(MemoryElement::new("article").matching(&["article"]).text("b"));
            dom.push(MemoryElement::new("span").matching(&["span"]).text("c"));
        });

        let found = page.query_all("div, article, section").await.unwrap();
        let texts: Vec<_> = found.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(found[1].handle.index, 1);
    }

    #[tokio::test]
    async fn test_reaction_runs_on_click() {
        let page = MemoryPage::new("https://claude.ai/new");
        page.with_dom(|dom| dom.push(MemoryElement::new("button").matching(&["button"])));
        page.on_action(|action, dom| {
            if matches!(action, PageAction::Click(_)) {
                dom.push(MemoryElement::new("div").matching(&[".reply"]).text("hello"));
            }
        });

        let button = page.query_all("button").await.unwrap().remove(0);
        page.click(&button.handle).await.unwrap();

        assert_eq!(page.query_all(".reply").await.unwrap().len(), 1);
        assert_eq!(page.actions(), vec![PageAction::Click(button.handle)]);
    }

    #[tokio::test]
    async fn test_click_on_missing_element_fails() {
        let page = MemoryPage::new("https://claude.ai/new");
        let missing = ElementRef {
            selector: "button".to_string(),
            index: 0,
        };
        assert!(page.click(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_drain_signals_clears_buffer() {
        let page = MemoryPage::new("https://claude.ai/new");
        page.add_response_mutations(2);
        page.press_shortcut(Shortcut::Reset);

        let signals = page.drain_signals().await.unwrap();
        assert_eq!(signals.response_mutations, 2);
        assert_eq!(signals.shortcuts, vec![Shortcut::Reset]);
        assert!(page.drain_signals().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_navigate_updates_url() {
        let page = MemoryPage::new("https://claude.ai/chat/1");
        page.navigate("https://claude.ai/new").await.unwrap();
        assert_eq!(page.current_url().await.unwrap(), "https://claude.ai/new");
    }
}
