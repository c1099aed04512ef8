use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::config::{ConfigError, ProxyConfig};

const DEFAULT_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
];

/// Outbound network identity presented by a browser session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl Default for Identity {
    /// Direct connection with the first built-in user agent; used until the first rotation.
    fn default() -> Self {
        Self {
            proxy: None,
            user_agent: DEFAULT_USER_AGENTS[0].to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rotation {
    pub identity: Identity,
    /// True when this request crossed a rotation boundary and a new network context is needed.
    pub rotated: bool,
}

/// Counter-driven identity schedule. One instance per browser session.
pub struct IdentityRotator {
    proxies: Vec<String>,
    user_agents: Vec<String>,
    interval: u64,
    request_count: u64,
    current: Identity,
    rng: StdRng,
}

impl IdentityRotator {
    pub fn new(config: &ProxyConfig, interval: u64) -> Self {
        Self::with_rng(config, interval, StdRng::from_entropy())
    }

    #[cfg(test)]
    pub fn with_seed(config: &ProxyConfig, interval: u64, seed: u64) -> Self {
        Self::with_rng(config, interval, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &ProxyConfig, interval: u64, rng: StdRng) -> Self {
        let user_agents = if config.user_agents.is_empty() {
            DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            config.user_agents.clone()
        };
        Self {
            proxies: config.servers.clone(),
            user_agents,
            interval: interval.max(1),
            request_count: 0,
            current: Identity::default(),
            rng,
        }
    }

    #[cfg(test)]
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn current(&self) -> &Identity {
        &self.current
    }

    /// Count one request and return the identity it must use.
    ///
    /// Every `interval`-th request draws a fresh proxy and user agent; the
    /// others reuse the current identity.
    pub fn next_identity(&mut self) -> Result<Rotation, ConfigError> {
        self.request_count += 1;
        if self.request_count % self.interval != 0 {
            return Ok(Rotation {
                identity: self.current.clone(),
                rotated: false,
            });
        }

        let proxy = self
            .proxies
            .choose(&mut self.rng)
            .cloned()
            .ok_or(ConfigError::EmptyProxyPool)?;
        let user_agent = self
            .user_agents
            .choose(&mut self.rng)
            .cloned()
            .unwrap_or_else(|| DEFAULT_USER_AGENTS[0].to_string());

        debug!(request = self.request_count, proxy = %proxy, "rotating identity");
        self.current = Identity {
            proxy: Some(proxy),
            user_agent,
        };
        Ok(Rotation {
            identity: self.current.clone(),
            rotated: true,
        })
    }
}
