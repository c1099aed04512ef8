use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::browser::{BrowserError, BrowserSession};
use crate::config::{Config, ConfigError};
use crate::rotator::{Identity, IdentityRotator};

#[derive(Debug, Error)]
pub enum NavError {
    #[error("giving up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: BrowserError,
    },

    #[error("navigation cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl NavError {
    /// Errors that must stop the whole run rather than one URL.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, NavError::Cancelled | NavError::Config(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.crawl.max_retries.max(1),
            retry_delay: config.crawl.retry_delay(),
            request_delay: config.crawl.request_delay(),
            timeout: config.crawl.timeout(),
        }
    }
}

/// Every page load goes through here: identity rotation, bounded retries and backoff.
pub struct Navigator {
    rotator: IdentityRotator,
    policy: RetryPolicy,
    cancel: CancellationToken,
    /// Set on rotation, cleared once the session has accepted the new identity.
    identity_pending: bool,
}

impl Navigator {
    pub fn new(rotator: IdentityRotator, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            rotator,
            policy,
            cancel,
            identity_pending: false,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn current_identity(&self) -> &Identity {
        self.rotator.current()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn navigate_and_wait(
        &mut self,
        session: &mut dyn BrowserSession,
        url: &str,
        ready_selector: &str,
    ) -> Result<(), NavError> {
        let max = self.policy.max_retries.max(1);
        let mut last = None;

        for attempt in 1..=max {
            let rotation = self.rotator.next_identity()?;
            if rotation.rotated {
                self.identity_pending = true;
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(NavError::Cancelled),
                result = attempt_once(
                    session,
                    &self.policy,
                    &rotation.identity,
                    &mut self.identity_pending,
                    url,
                    ready_selector,
                ) => result,
            };

            match result {
                Ok(()) => {
                    debug!(url, attempt, "page ready");
                    return Ok(());
                }
                Err(e) => {
                    warn!(url, attempt, max, error = %e, "navigation attempt failed");
                    last = Some(e);
                }
            }

            if attempt < max {
                self.pause(self.policy.retry_delay).await?;
            }
        }

        Err(NavError::Exhausted {
            url: url.to_string(),
            attempts: max,
            last: last.unwrap_or_else(|| BrowserError::Session("no attempt made".to_string())),
        })
    }

    /// Cancellable sleep.
    pub async fn pause(&self, duration: Duration) -> Result<(), NavError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NavError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

async fn attempt_once(
    session: &mut dyn BrowserSession,
    policy: &RetryPolicy,
    identity: &Identity,
    identity_pending: &mut bool,
    url: &str,
    ready_selector: &str,
) -> Result<(), BrowserError> {
    if *identity_pending {
        session.apply_identity(identity).await?;
        *identity_pending = false;
    }
    match tokio::time::timeout(policy.timeout, session.goto(url)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                message: format!("no response within {:?}", policy.timeout),
            })
        }
    }
    session.wait_for(ready_selector, policy.timeout).await
}
