//! Tab access for the background service

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::content::{ContentBridge, ContentHandle};
use crate::error::{BridgeError, BridgeResult};
use crate::page::{MemoryPage, PageSurface};
use crate::protocol::{ContentRequest, RuntimeEnvelope, TabId, TabInfo};
use crate::semantic::{MarkerClassifier, PromptClassifier};

/// Tab lifecycle change observed by a tab host
#[derive(Debug, Clone, PartialEq)]
pub enum TabEvent {
    /// URL, title or load state changed
    Updated(TabInfo),
    Removed(TabId),
}

/// Browser tabs as seen by the background service
#[async_trait]
pub trait TabHost: Send + Sync {
    async fn get(&self, id: TabId) -> BridgeResult<Option<TabInfo>>;

    /// Tabs whose URL matches a `*` wildcard pattern
    async fn query(&self, pattern: &str) -> BridgeResult<Vec<TabInfo>>;

    async fn create(&self, url: &str) -> BridgeResult<TabInfo>;

    async fn activate(&self, id: TabId) -> BridgeResult<()>;

    /// Hand a runtime request to the tab's content bridge
    async fn deliver(&self, id: TabId, request: ContentRequest) -> BridgeResult<()>;
}

/// Match `text` against a pattern where `*` stands for any run of characters
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match Regex::new(&format!("^{}$", body)) {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

struct MemoryTab {
    info: TabInfo,
    page: Option<Arc<MemoryPage>>,
    bridge: Option<ContentHandle>,
    /// `get` calls left before a created tab finishes loading
    loading: u32,
}

#[derive(Default)]
struct MemoryTabs {
    tabs: BTreeMap<TabId, MemoryTab>,
    next_id: TabId,
    active: Option<TabId>,
    new_tab_page: Option<(Arc<MemoryPage>, u32)>,
    created: Vec<String>,
}

/// Tab host over in-memory pages, each with a real content bridge
pub struct MemoryTabHost {
    config: Arc<BridgeConfig>,
    classifier: Arc<dyn PromptClassifier>,
    runtime: mpsc::Sender<RuntimeEnvelope>,
    state: Mutex<MemoryTabs>,
}

impl MemoryTabHost {
    pub fn new(config: Arc<BridgeConfig>, runtime: mpsc::Sender<RuntimeEnvelope>) -> Self {
        let classifier = Arc::new(MarkerClassifier::from_config(&config.markers));
        Self {
            config,
            classifier,
            runtime,
            state: Mutex::new(MemoryTabs {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    fn attach(&self, id: TabId, tab: &mut MemoryTab) {
        if tab.bridge.is_some() || !tab.info.url.contains(&self.config.page.host_match) {
            return;
        }
        if let Some(page) = &tab.page {
            let surface: Arc<dyn PageSurface> = page.clone();
            tab.bridge = Some(ContentBridge::spawn(
                id,
                surface,
                self.config.clone(),
                self.classifier.clone(),
                self.runtime.clone(),
            ));
            debug!(tab_id = id, "Content bridge attached");
        }
    }

    async fn insert(&self, url: String, page: Option<Arc<MemoryPage>>, loading: u32) -> TabInfo {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;

        let mut tab = MemoryTab {
            info: TabInfo {
                id,
                url,
                title: String::new(),
                active: false,
                complete: loading == 0,
            },
            page,
            bridge: None,
            loading,
        };
        if tab.info.complete {
            self.attach(id, &mut tab);
        }
        let info = tab.info.clone();
        state.tabs.insert(id, tab);
        info
    }

    /// Register a loaded tab showing `page`
    pub async fn open(&self, page: Arc<MemoryPage>) -> TabInfo {
        let url = page.current_url().await.unwrap_or_default();
        self.insert(url, Some(page), 0).await
    }

    /// Register a loaded tab with no content bridge
    pub async fn open_detached(&self, url: &str) -> TabInfo {
        self.insert(url.to_string(), None, 0).await
    }

    /// Page shown by tabs opened through `create`, and how many `get`
    /// calls they take to finish loading
    pub async fn serve_new_tabs(&self, page: Arc<MemoryPage>, load_polls: u32) {
        self.state.lock().await.new_tab_page = Some((page, load_polls));
    }

    pub async fn close(&self, id: TabId) -> bool {
        self.state.lock().await.tabs.remove(&id).is_some()
    }

    /// URLs passed to `create`, in order
    pub async fn created(&self) -> Vec<String> {
        self.state.lock().await.created.clone()
    }

    pub async fn active(&self) -> Option<TabId> {
        self.state.lock().await.active
    }
}

#[async_trait]
impl TabHost for MemoryTabHost {
    async fn get(&self, id: TabId) -> BridgeResult<Option<TabInfo>> {
        let mut state = self.state.lock().await;
        let tab = match state.tabs.get_mut(&id) {
            Some(tab) => tab,
            None => return Ok(None),
        };
        if !tab.info.complete {
            tab.loading = tab.loading.saturating_sub(1);
            if tab.loading == 0 {
                tab.info.complete = true;
                self.attach(id, tab);
            }
        }
        Ok(Some(tab.info.clone()))
    }

    async fn query(&self, pattern: &str) -> BridgeResult<Vec<TabInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .tabs
            .values()
            .filter(|t| glob_match(pattern, &t.info.url))
            .map(|t| t.info.clone())
            .collect())
    }

    async fn create(&self, url: &str) -> BridgeResult<TabInfo> {
        let (page, loading) = {
            let mut state = self.state.lock().await;
            state.created.push(url.to_string());
            match &state.new_tab_page {
                Some((page, loading)) => (Some(page.clone()), *loading),
                None => (None, 0),
            }
        };
        if let Some(page) = &page {
            page.with_dom(|dom| dom.url = url.to_string());
        }
        let info = self.insert(url.to_string(), page, loading).await;
        info!(tab_id = info.id, url, "Tab created");
        Ok(info)
    }

    async fn activate(&self, id: TabId) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        if !state.tabs.contains_key(&id) {
            return Err(BridgeError::Tab(format!("No tab with id {}", id)));
        }
        for (tab_id, tab) in state.tabs.iter_mut() {
            tab.info.active = *tab_id == id;
        }
        state.active = Some(id);
        Ok(())
    }

    async fn deliver(&self, id: TabId, request: ContentRequest) -> BridgeResult<()> {
        let state = self.state.lock().await;
        match state.tabs.get(&id).and_then(|t| t.bridge.as_ref()) {
            Some(bridge) => bridge.send(request).await,
            None => Err(BridgeError::BridgeUnreachable(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RuntimeEvent;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*://claude.ai/*", "https://claude.ai/chat/abc"));
        assert!(glob_match("*://claude.ai/*", "https://claude.ai/"));
        assert!(!glob_match("*://claude.ai/*", "https://claude.ai"));
        assert!(!glob_match("*://claude.ai/*", "https://example.com/claude.ai/x"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("a.c", "abc"));
    }

    fn host() -> (MemoryTabHost, mpsc::Receiver<RuntimeEnvelope>) {
        let (tx, rx) = mpsc::channel(16);
        (MemoryTabHost::new(Arc::new(BridgeConfig::default()), tx), rx)
    }

    #[tokio::test]
    async fn test_open_attaches_bridge() {
        let (host, mut rx) = host();
        let tab = host.open(Arc::new(MemoryPage::new("https://claude.ai/new"))).await;

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.tab_id, tab.id);
        assert!(matches!(envelope.event, RuntimeEvent::TabReady { .. }));
    }

    #[tokio::test]
    async fn test_query_filters_by_pattern() {
        let (host, _rx) = host();
        host.open_detached("https://claude.ai/chat/1").await;
        host.open_detached("https://example.com/").await;

        let tabs = host.query("*://claude.ai/*").await.unwrap();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].url, "https://claude.ai/chat/1");
    }

    #[tokio::test]
    async fn test_created_tab_loads_after_polls() {
        let (host, _rx) = host();
        host.serve_new_tabs(Arc::new(MemoryPage::new("about:blank")), 2).await;

        let tab = host.create("https://claude.ai/chat").await.unwrap();
        assert!(!tab.complete);
        assert!(!host.get(tab.id).await.unwrap().unwrap().complete);
        assert!(host.get(tab.id).await.unwrap().unwrap().complete);
        assert_eq!(host.created().await, vec!["https://claude.ai/chat".to_string()]);
    }

    #[tokio::test]
    async fn test_deliver_without_bridge_fails() {
        let (host, _rx) = host();
        let tab = host.open_detached("https://claude.ai/chat/1").await;
        let (reply, _) = tokio::sync::oneshot::channel();

        let err = host
            .deliver(tab.id, ContentRequest::GetClaudeResponse { reply })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::BridgeUnreachable(id) if id == tab.id));
    }
}
