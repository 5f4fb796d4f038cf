//! Page surface - the automated chat page as seen by the bridge
//!
//! Architecture: `PageSurface` (DOM access) + selector tables + two backends
//!
//! # Components
//! - `PageSurface`: queries, clicks, input, navigation, status indicator
//! - `CdpPage` / `CdpTabHost`: Chromium over the DevTools protocol
//! - `MemoryPage`: in-memory element list for tests and dry runs

pub mod cdp;
pub mod memory;
pub mod selectors;

use crate::error::BridgeResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use cdp::{CdpPage, CdpTabHost};
pub use memory::{MemoryDom, MemoryElement, MemoryPage, PageAction};

/// Element bounding box (`getBoundingClientRect`)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

/// Re-resolvable reference to a queried element: `querySelectorAll(selector)[index]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ElementRef {
    pub selector: String,
    pub index: usize,
}

/// Element state captured by a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElementSnapshot {
    #[serde(skip)]
    pub handle: ElementRef,
    pub tag: String,
    /// Trimmed `innerText`
    pub text: String,
    pub rect: Rect,
    pub disabled: bool,
    pub aria_label: Option<String>,
    /// Inside a `<form>`
    pub in_form: bool,
    /// Contains an `<svg>` (icon buttons)
    pub has_svg: bool,
    /// Trimmed text of the previous element sibling
    pub prev_text: Option<String>,
    /// Text of descendant `pre`/`code` blocks
    pub code_blocks: Vec<String>,
}

/// Modifier held for the keyboard submit fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyModifier {
    Meta,
    Ctrl,
}

impl KeyModifier {
    /// Cmd+Enter on macOS, Ctrl+Enter elsewhere
    pub fn for_platform(is_mac: bool) -> Self {
        if is_mac {
            KeyModifier::Meta
        } else {
            KeyModifier::Ctrl
        }
    }
}

/// Status indicator injected into the page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorState {
    Disconnected,
    Connected,
    Processing,
}

impl IndicatorState {
    pub fn label(&self) -> &'static str {
        match self {
            IndicatorState::Disconnected => "🔴 Bridge not connected",
            IndicatorState::Connected => "🟢 Bridge connected",
            IndicatorState::Processing => "🟡 Processing...",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            IndicatorState::Disconnected => "#FF6B6B",
            IndicatorState::Connected => "#4ECDC4",
            IndicatorState::Processing => "#FFE66D",
        }
    }
}

/// Keyboard shortcuts handled by the page monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shortcut {
    /// Ctrl+Shift+E
    ForceExtract,
    /// Ctrl+Shift+R
    Reset,
}

/// Signals buffered in the page since the last drain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageSignals {
    /// Added nodes that look like an assistant response
    pub response_mutations: u32,
    pub shortcuts: Vec<Shortcut>,
}

impl PageSignals {
    pub fn is_empty(&self) -> bool {
        self.response_mutations == 0 && self.shortcuts.is_empty()
    }
}

/// DOM access used by the content bridge and page monitor
#[async_trait]
pub trait PageSurface: Send + Sync {
    /// `querySelectorAll(selector)` in document order
    async fn query_all(&self, selector: &str) -> BridgeResult<Vec<ElementSnapshot>>;

    /// `innerHTML` of a queried element
    async fn markup(&self, element: &ElementRef) -> BridgeResult<String>;

    async fn viewport_width(&self) -> BridgeResult<f64>;

    async fn current_url(&self) -> BridgeResult<String>;

    async fn navigate(&self, url: &str) -> BridgeResult<()>;

    async fn click(&self, element: &ElementRef) -> BridgeResult<()>;

    /// Replace the element's content and dispatch a bubbling `input` event
    async fn fill_input(&self, element: &ElementRef, text: &str) -> BridgeResult<()>;

    /// Dispatch `keydown` Enter with the given modifier held
    async fn press_enter(&self, element: &ElementRef, modifier: KeyModifier) -> BridgeResult<()>;

    async fn is_mac(&self) -> BridgeResult<bool>;

    async fn set_indicator(&self, state: IndicatorState) -> BridgeResult<()>;

    /// Short-lived toast in the page corner
    async fn notify(&self, message: &str) -> BridgeResult<()>;

    /// Take buffered mutation/shortcut signals
    async fn drain_signals(&self) -> BridgeResult<PageSignals>;
}

/// Path component of a page URL (`https://claude.ai/new?x` -> `/new`)
pub fn url_path(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let path = match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "/",
    };
    let end = path.find(|c| c == '?' || c == '#').unwrap_or(path.len());
    &path[..end]
}

/// First element of the first selector that matches and passes `accept`
pub async fn first_match<F>(
    page: &dyn PageSurface,
    selectors: &[&str],
    accept: F,
) -> BridgeResult<Option<ElementSnapshot>>
where
    F: Fn(&ElementSnapshot) -> bool + Send + Sync,
{
    for selector in selectors {
        let elements = page.query_all(selector).await?;
        if let Some(first) = elements.into_iter().next() {
            if accept(&first) {
                return Ok(Some(first));
            }
        }
    }
    Ok(None)
}

/// Last element of the first selector whose last match passes `accept`
pub async fn last_match<F>(
    page: &dyn PageSurface,
    selectors: &[&str],
    accept: F,
) -> BridgeResult<Option<ElementSnapshot>>
where
    F: Fn(&ElementSnapshot) -> bool + Send + Sync,
{
    for selector in selectors {
        let elements = page.query_all(selector).await?;
        if let Some(last) = elements.into_iter().last() {
            if accept(&last) {
                return Ok(Some(last));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_path() {
        assert_eq!(url_path("https://claude.ai/new"), "/new");
        assert_eq!(url_path("https://claude.ai/chat/abc?x=1"), "/chat/abc");
        assert_eq!(url_path("https://claude.ai"), "/");
        assert_eq!(url_path("https://claude.ai/new#top"), "/new");
    }

    #[test]
    fn test_rect_visibility() {
        assert!(Rect::new(0.0, 0.0, 10.0, 10.0).is_visible());
        assert!(!Rect::new(0.0, 0.0, 0.0, 10.0).is_visible());
        assert!(!Rect::default().is_visible());
    }

    #[test]
    fn test_modifier_for_platform() {
        assert_eq!(KeyModifier::for_platform(true), KeyModifier::Meta);
        assert_eq!(KeyModifier::for_platform(false), KeyModifier::Ctrl);
    }

    #[tokio::test]
    async fn test_first_and_last_match() {
        let page = MemoryPage::new("https://claude.ai/chat");
        page.with_dom(|dom| {
            dom.push(MemoryElement::new("div").matching(&[".a"]).text("one"));
            dom.push(MemoryElement::new("div").matching(&[".a"]).text("two"));
            dom.push(MemoryElement::new("div").matching(&[".b"]).text("three"));
        });

        let first = first_match(&page, &[".missing", ".a"], |_| true).await.unwrap();
        assert_eq!(first.unwrap().text, "one");

        let last = last_match(&page, &[".a", ".b"], |_| true).await.unwrap();
        assert_eq!(last.unwrap().text, "two");

        let rejected = last_match(&page, &[".a"], |e| e.text.len() > 10).await.unwrap();
        assert!(rejected.is_none());
    }
}
