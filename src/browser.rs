use async_trait::async_trait;
use std::fmt::Display;
use std::time::Duration;
use thirtyfour::prelude::*;
use thirtyfour::common::capabilities::chromium::ChromiumLikeCapabilities;
use thirtyfour::common::capabilities::firefox::FirefoxPreferences;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{BrowserConfig, BrowserKind};
use crate::rotator::Identity;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Error)]
pub enum BrowserError {
    #[error("timed out waiting for '{selector}'")]
    Timeout { selector: String },

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("element '{selector}': {message}")]
    Element { selector: String, message: String },

    #[error("browser session error: {0}")]
    Session(String),
}

fn session_err(e: impl Display) -> BrowserError {
    BrowserError::Session(e.to_string())
}

/// A CSS lookup that yields either an element's text or one of its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub selector: &'static str,
    pub attribute: Option<&'static str>,
}

impl Probe {
    pub const fn text(selector: &'static str) -> Self {
        Self {
            selector,
            attribute: None,
        }
    }

    pub const fn attr(selector: &'static str, attribute: &'static str) -> Self {
        Self {
            selector,
            attribute: Some(attribute),
        }
    }
}

/// One open page in a remote browser.
///
/// Missing elements are not errors: lookups return `None` (or an empty
/// list) and only session-level failures surface as `Err`.
#[async_trait]
pub trait BrowserSession: Send {
    /// Re-establish the network context with a new proxy and user agent.
    async fn apply_identity(&mut self, identity: &Identity) -> Result<(), BrowserError>;

    async fn goto(&mut self, url: &str) -> Result<(), BrowserError>;

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError>;

    async fn probe(&mut self, probe: &Probe) -> Result<Option<String>, BrowserError>;

    /// Evaluate `probes` inside every element matching `item_selector`, in page order.
    async fn probe_each(
        &mut self,
        item_selector: &str,
        probes: &[Probe],
    ) -> Result<Vec<Vec<Option<String>>>, BrowserError>;

    /// Texts of `child` elements under the first `container`; `None` when there is no container.
    async fn texts_within(
        &mut self,
        container: &str,
        child: &str,
    ) -> Result<Option<Vec<String>>, BrowserError>;

    async fn is_visible(&mut self, selector: &str) -> Result<bool, BrowserError>;

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError>;

    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

// --- WebDriver implementation ---

pub struct WebDriverBrowser {
    config: BrowserConfig,
}

impl WebDriverBrowser {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserDriver for WebDriverBrowser {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let driver = connect(&self.config, identity).await?;
        Ok(Box::new(WebDriverSession {
            driver: Some(driver),
            config: self.config.clone(),
        }))
    }
}

fn proxy_host_port(proxy: &str) -> Result<(String, u16), BrowserError> {
    let parsed = url::Url::parse(proxy).map_err(|e| session_err(format!("bad proxy {}: {}", proxy, e)))?;
    if !parsed.username().is_empty() {
        warn!(proxy = %parsed.host_str().unwrap_or_default(), "proxy credentials are not passed to the browser");
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| session_err(format!("proxy {} has no host", proxy)))?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| session_err(format!("proxy {} has no port", proxy)))?;
    Ok((host, port))
}

/// User agent and manual HTTP/SSL proxy for one Firefox profile.
fn firefox_preferences(identity: &Identity) -> Result<FirefoxPreferences, BrowserError> {
    let mut prefs = FirefoxPreferences::new();
    prefs
        .set_user_agent(identity.user_agent.clone())
        .map_err(session_err)?;
    if let Some(proxy) = &identity.proxy {
        let (host, port) = proxy_host_port(proxy)?;
        prefs.set("network.proxy.type", 1).map_err(session_err)?;
        prefs.set("network.proxy.http", host.clone()).map_err(session_err)?;
        prefs.set("network.proxy.http_port", port).map_err(session_err)?;
        prefs.set("network.proxy.ssl", host).map_err(session_err)?;
        prefs.set("network.proxy.ssl_port", port).map_err(session_err)?;
    }
    Ok(prefs)
}

async fn connect(config: &BrowserConfig, identity: &Identity) -> Result<WebDriver, BrowserError> {
    debug!(proxy = ?identity.proxy, kind = ?config.kind, "opening browser session");
    match config.kind {
        BrowserKind::Firefox => {
            let mut caps = DesiredCapabilities::firefox();
            if config.headless {
                caps.set_headless().map_err(session_err)?;
            }
            caps.set_preferences(firefox_preferences(identity)?)
                .map_err(session_err)?;
            WebDriver::new(config.webdriver_url.as_str(), caps)
                .await
                .map_err(session_err)
        }
        BrowserKind::Chrome => {
            let mut caps = DesiredCapabilities::chrome();
            if config.headless {
                caps.set_headless().map_err(session_err)?;
            }
            caps.add_arg(&format!("--user-agent={}", identity.user_agent))
                .map_err(session_err)?;
            if let Some(proxy) = &identity.proxy {
                let (host, port) = proxy_host_port(proxy)?;
                caps.add_arg(&format!("--proxy-server={}:{}", host, port))
                    .map_err(session_err)?;
            }
            WebDriver::new(config.webdriver_url.as_str(), caps)
                .await
                .map_err(session_err)
        }
    }
}

pub struct WebDriverSession {
    driver: Option<WebDriver>,
    config: BrowserConfig,
}

impl WebDriverSession {
    fn driver(&self) -> Result<&WebDriver, BrowserError> {
        self.driver
            .as_ref()
            .ok_or_else(|| session_err("session already closed"))
    }
}

async fn read_element(element: &WebElement, attribute: Option<&str>) -> Option<String> {
    let value = match attribute {
        Some(name) => element.attr(name).await.ok().flatten(),
        None => element.text().await.ok(),
    };
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn apply_identity(&mut self, identity: &Identity) -> Result<(), BrowserError> {
        if let Some(old) = self.driver.take() {
            if let Err(e) = old.quit().await {
                warn!(error = %e, "failed to close previous browser session");
            }
        }
        self.driver = Some(connect(&self.config, identity).await?);
        Ok(())
    }

    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        self.driver()?
            .goto(url)
            .await
            .map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            })
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        self.driver()?
            .query(By::Css(selector))
            .wait(timeout, POLL_INTERVAL)
            .first()
            .await
            .map(|_| ())
            .map_err(|_| BrowserError::Timeout {
                selector: selector.to_string(),
            })
    }

    async fn probe(&mut self, probe: &Probe) -> Result<Option<String>, BrowserError> {
        let elements = self
            .driver()?
            .find_all(By::Css(probe.selector))
            .await
            .map_err(session_err)?;
        match elements.first() {
            Some(element) => Ok(read_element(element, probe.attribute).await),
            None => Ok(None),
        }
    }

    async fn probe_each(
        &mut self,
        item_selector: &str,
        probes: &[Probe],
    ) -> Result<Vec<Vec<Option<String>>>, BrowserError> {
        let items = self
            .driver()?
            .find_all(By::Css(item_selector))
            .await
            .map_err(session_err)?;

        let mut rows = Vec::with_capacity(items.len());
        for item in &items {
            let mut row = Vec::with_capacity(probes.len());
            for probe in probes {
                let value = match item.find_all(By::Css(probe.selector)).await {
                    Ok(found) => match found.first() {
                        Some(element) => read_element(element, probe.attribute).await,
                        None => None,
                    },
                    Err(_) => None,
                };
                row.push(value);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    async fn texts_within(
        &mut self,
        container: &str,
        child: &str,
    ) -> Result<Option<Vec<String>>, BrowserError> {
        let containers = self
            .driver()?
            .find_all(By::Css(container))
            .await
            .map_err(session_err)?;
        let Some(first) = containers.first() else {
            return Ok(None);
        };
        let children = first.find_all(By::Css(child)).await.map_err(|e| BrowserError::Element {
            selector: child.to_string(),
            message: e.to_string(),
        })?;
        let mut texts = Vec::with_capacity(children.len());
        for element in &children {
            texts.push(read_element(element, None).await.unwrap_or_default());
        }
        Ok(Some(texts))
    }

    async fn is_visible(&mut self, selector: &str) -> Result<bool, BrowserError> {
        let elements = self
            .driver()?
            .find_all(By::Css(selector))
            .await
            .map_err(session_err)?;
        match elements.first() {
            Some(element) => Ok(element.is_displayed().await.unwrap_or(false)),
            None => Ok(false),
        }
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        let element = self
            .driver()?
            .find(By::Css(selector))
            .await
            .map_err(|e| BrowserError::Element {
                selector: selector.to_string(),
                message: e.to_string(),
            })?;
        element.click().await.map_err(|e| BrowserError::Element {
            selector: selector.to_string(),
            message: e.to_string(),
        })
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        match self.driver.take() {
            Some(driver) => driver.quit().await.map_err(session_err),
            None => Ok(()),
        }
    }
}
