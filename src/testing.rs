//! Scripted stand-ins for the browser and LLM collaborators.
//!
//! `FakeSite` models a set of pages keyed by URL. Each URL can hold several
//! result pages reached by clicking the "next" control, and can be told to
//! fail its first N navigations.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ai::CompletionProvider;
use crate::browser::{BrowserDriver, BrowserError, BrowserSession, Probe};
use crate::rotator::Identity;

#[derive(Debug, Clone, Default)]
pub struct FakePage {
    /// Selectors that exist on the page (for `wait_for`/`is_visible`).
    pub present: HashSet<String>,
    /// Page-level lookups keyed by `selector` or `selector@attribute`.
    pub values: HashMap<String, String>,
    /// Repeated items (job cards): each item maps probe keys to values.
    pub items: Vec<HashMap<String, String>>,
    /// Child texts keyed by `container>>child`.
    pub groups: HashMap<String, Vec<String>>,
}

fn probe_key(probe: &Probe) -> String {
    match probe.attribute {
        Some(attr) => format!("{}@{}", probe.selector, attr),
        None => probe.selector.to_string(),
    }
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selector(mut self, selector: &str) -> Self {
        self.present.insert(selector.to_string());
        self
    }

    pub fn with_value(mut self, probe: Probe, value: &str) -> Self {
        self.present.insert(probe.selector.to_string());
        self.values.insert(probe_key(&probe), value.to_string());
        self
    }

    pub fn with_item(mut self, fields: &[(Probe, &str)]) -> Self {
        let item = fields
            .iter()
            .map(|(probe, value)| (probe_key(probe), value.to_string()))
            .collect();
        self.items.push(item);
        self
    }

    pub fn with_group(mut self, container: &str, child: &str, texts: &[&str]) -> Self {
        self.present.insert(container.to_string());
        self.groups.insert(
            format!("{}>>{}", container, child),
            texts.iter().map(|t| t.to_string()).collect(),
        );
        self
    }
}

#[derive(Default)]
struct SiteState {
    pages: HashMap<String, Vec<FakePage>>,
    failures: HashMap<String, usize>,
    navigations: Vec<String>,
    clicks: Vec<String>,
    identities: Vec<Identity>,
    identity_failures: usize,
    opened: usize,
    closed: usize,
}

/// Shared fake site; every session opened from it sees the same pages and counters.
#[derive(Clone, Default)]
pub struct FakeSite {
    state: Arc<Mutex<SiteState>>,
    next_selector: Arc<Mutex<Option<String>>>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector that advances pagination when clicked.
    pub fn with_next_selector(self, selector: &str) -> Self {
        *self.next_selector.lock().unwrap() = Some(selector.to_string());
        self
    }

    pub fn with_pages(self, url: &str, pages: Vec<FakePage>) -> Self {
        self.state.lock().unwrap().pages.insert(url.to_string(), pages);
        self
    }

    pub fn failing(self, url: &str, times: usize) -> Self {
        self.state.lock().unwrap().failures.insert(url.to_string(), times);
        self
    }

    /// The next `times` identity switches fail and leave the session without a browser.
    pub fn failing_identity(self, times: usize) -> Self {
        self.state.lock().unwrap().identity_failures = times;
        self
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().unwrap().navigations.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state.lock().unwrap().clicks.clone()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.state.lock().unwrap().identities.clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl BrowserDriver for FakeSite {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn BrowserSession>, BrowserError> {
        {
            let mut state = self.state.lock().unwrap();
            state.opened += 1;
            state.identities.push(identity.clone());
        }
        Ok(Box::new(FakeSession {
            site: self.clone(),
            url: None,
            page_index: 0,
            closed: false,
            detached: false,
        }))
    }
}

pub struct FakeSession {
    site: FakeSite,
    url: Option<String>,
    page_index: usize,
    closed: bool,
    detached: bool,
}

impl FakeSession {
    fn page(&self) -> Option<FakePage> {
        let url = self.url.as_ref()?;
        let state = self.site.state.lock().unwrap();
        state.pages.get(url)?.get(self.page_index).cloned()
    }

    fn has_next_page(&self) -> bool {
        let Some(url) = self.url.as_ref() else {
            return false;
        };
        let state = self.site.state.lock().unwrap();
        state
            .pages
            .get(url)
            .map(|pages| self.page_index + 1 < pages.len())
            .unwrap_or(false)
    }

    fn is_next_selector(&self, selector: &str) -> bool {
        self.site.next_selector.lock().unwrap().as_deref() == Some(selector)
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn apply_identity(&mut self, identity: &Identity) -> Result<(), BrowserError> {
        let mut state = self.site.state.lock().unwrap();
        if state.identity_failures > 0 {
            state.identity_failures -= 1;
            self.detached = true;
            return Err(BrowserError::Session("proxy handshake failed".to_string()));
        }
        state.identities.push(identity.clone());
        self.detached = false;
        Ok(())
    }

    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        if self.detached {
            return Err(BrowserError::Session("session already closed".to_string()));
        }
        let mut state = self.site.state.lock().unwrap();
        state.navigations.push(url.to_string());
        if let Some(remaining) = state.failures.get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrowserError::Navigation {
                    url: url.to_string(),
                    message: "proxy connection refused".to_string(),
                });
            }
        }
        if !state.pages.contains_key(url) {
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                message: "404".to_string(),
            });
        }
        drop(state);
        self.url = Some(url.to_string());
        self.page_index = 0;
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> Result<(), BrowserError> {
        match self.page() {
            Some(page) if page.present.contains(selector) => Ok(()),
            _ => Err(BrowserError::Timeout {
                selector: selector.to_string(),
            }),
        }
    }

    async fn probe(&mut self, probe: &Probe) -> Result<Option<String>, BrowserError> {
        Ok(self
            .page()
            .and_then(|page| page.values.get(&probe_key(probe)).cloned()))
    }

    async fn probe_each(
        &mut self,
        _item_selector: &str,
        probes: &[Probe],
    ) -> Result<Vec<Vec<Option<String>>>, BrowserError> {
        let Some(page) = self.page() else {
            return Ok(Vec::new());
        };
        Ok(page
            .items
            .iter()
            .map(|item| probes.iter().map(|p| item.get(&probe_key(p)).cloned()).collect())
            .collect())
    }

    async fn texts_within(
        &mut self,
        container: &str,
        child: &str,
    ) -> Result<Option<Vec<String>>, BrowserError> {
        Ok(self
            .page()
            .and_then(|page| page.groups.get(&format!("{}>>{}", container, child)).cloned()))
    }

    async fn is_visible(&mut self, selector: &str) -> Result<bool, BrowserError> {
        if self.is_next_selector(selector) {
            return Ok(self.has_next_page());
        }
        Ok(self
            .page()
            .map(|page| page.present.contains(selector))
            .unwrap_or(false))
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        self.site.state.lock().unwrap().clicks.push(selector.to_string());
        if self.is_next_selector(selector) && self.has_next_page() {
            self.page_index += 1;
            return Ok(());
        }
        Err(BrowserError::Element {
            selector: selector.to_string(),
            message: "not clickable".to_string(),
        })
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if !self.closed {
            self.closed = true;
            self.site.state.lock().unwrap().closed += 1;
        }
        Ok(())
    }
}

/// LLM stand-in that replays queued responses and records prompts.
#[derive(Clone, Default)]
pub struct FakeProvider {
    responses: Arc<Mutex<VecDeque<Scripted>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

enum Scripted {
    Text(String),
    Fail(String),
    Panic,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, reply: Scripted) -> Self {
        self.responses.lock().unwrap().push_back(reply);
        self
    }

    pub fn respond(self, text: &str) -> Self {
        self.push(Scripted::Text(text.to_string()))
    }

    pub fn fail(self, message: &str) -> Self {
        self.push(Scripted::Fail(message.to_string()))
    }

    /// The next call panics, as a bug deep inside a job would.
    pub fn panic_once(self) -> Self {
        self.push(Scripted::Panic)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for FakeProvider {
    async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let reply = self.responses.lock().unwrap().pop_front();
        match reply {
            Some(Scripted::Text(text)) => Ok(text),
            Some(Scripted::Fail(message)) => Err(anyhow!(message)),
            Some(Scripted::Panic) => panic!("scripted provider panic"),
            None => Err(anyhow!("no scripted response left")),
        }
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}
