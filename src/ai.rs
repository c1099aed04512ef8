use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;

/// Anything that turns a prompt into raw completion text.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
    fn model_name(&self) -> &str;
}

/// How a catalogued model is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// OpenAI-style `/chat/completions`, authenticated by a bearer key.
    Chat { url: &'static str, key_var: &'static str },
    /// Anthropic `/v1/messages`.
    Messages,
    /// The local `claude` CLI in print mode.
    Cli,
}

const DEEPSEEK: Backend = Backend::Chat {
    url: "https://api.deepseek.com/v1/chat/completions",
    key_var: "DEEPSEEK_API_KEY",
};
const OPENAI: Backend = Backend::Chat {
    url: "https://api.openai.com/v1/chat/completions",
    key_var: "OPENAI_API_KEY",
};
const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const MESSAGES_KEY_VAR: &str = "ANTHROPIC_API_KEY";
const MESSAGES_VERSION: &str = "2023-06-01";

const SONNET_ID: &str = "claude-sonnet-4-5-20250929";
const HAIKU_ID: &str = "claude-haiku-4-5-20251001";

/// One selectable model: its canonical name, accepted aliases and transport.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub model_id: &'static str,
    pub backend: Backend,
}

pub const CATALOG: &[CatalogEntry] = &[
    CatalogEntry { name: "deepseek-chat", aliases: &["deepseek"], model_id: "deepseek-chat", backend: DEEPSEEK },
    CatalogEntry { name: "deepseek-reasoner", aliases: &[], model_id: "deepseek-reasoner", backend: DEEPSEEK },
    CatalogEntry { name: "gpt-4o", aliases: &[], model_id: "gpt-4o", backend: OPENAI },
    CatalogEntry { name: "gpt-4o-mini", aliases: &[], model_id: "gpt-4o-mini", backend: OPENAI },
    CatalogEntry { name: "api-sonnet", aliases: &[], model_id: SONNET_ID, backend: Backend::Messages },
    CatalogEntry { name: "api-haiku", aliases: &[], model_id: HAIKU_ID, backend: Backend::Messages },
    CatalogEntry { name: "claude-sonnet", aliases: &["sonnet"], model_id: SONNET_ID, backend: Backend::Cli },
    CatalogEntry { name: "claude-haiku", aliases: &["haiku"], model_id: HAIKU_ID, backend: Backend::Cli },
];

/// Look up `llm.model` in the catalog by name or alias.
pub fn resolve_model(name: &str) -> Result<&'static CatalogEntry> {
    CATALOG
        .iter()
        .find(|entry| entry.name == name || entry.aliases.iter().any(|alias| *alias == name))
        .ok_or_else(|| {
            let known: Vec<&str> = CATALOG.iter().map(|entry| entry.name).collect();
            anyhow!("Unknown model '{}'. Available: {}", name, known.join(", "))
        })
}

pub fn create_provider(entry: &CatalogEntry, timeout: Duration) -> Result<Arc<dyn CompletionProvider>> {
    let provider: Arc<dyn CompletionProvider> = match entry.backend {
        Backend::Chat { url, key_var } => Arc::new(HttpProvider::new(
            entry.model_id,
            Wire::Chat { url },
            key_var,
            timeout,
        )?),
        Backend::Messages => Arc::new(HttpProvider::new(entry.model_id, Wire::Messages, MESSAGES_KEY_VAR, timeout)?),
        Backend::Cli => Arc::new(CliProvider::new(entry.model_id)?),
    };
    Ok(provider)
}

fn api_key(key_var: &str) -> Result<String> {
    match env::var(key_var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => bail!("{} is not set. Export it, or pick another model with --model", key_var),
    }
}

// Both HTTP APIs accept the same single-turn request shape.
#[derive(Debug, Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Turn<'a>; 1],
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    #[serde(default)]
    content: Vec<MessagesBlock>,
}

#[derive(Debug, Deserialize)]
struct MessagesBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Chat { url: &'static str },
    Messages,
}

impl Wire {
    fn url(self) -> &'static str {
        match self {
            Wire::Chat { url } => url,
            Wire::Messages => MESSAGES_URL,
        }
    }

    fn authorize(self, request: reqwest::RequestBuilder, key: &str) -> reqwest::RequestBuilder {
        match self {
            Wire::Chat { .. } => request.bearer_auth(key),
            Wire::Messages => request
                .header("x-api-key", key)
                .header("anthropic-version", MESSAGES_VERSION),
        }
    }

    /// First non-empty text in a successful response body.
    fn text_of(self, body: &str) -> Result<String> {
        let text = match self {
            Wire::Chat { .. } => {
                let reply: ChatReply = serde_json::from_str(body).context("Malformed chat completion body")?;
                reply.choices.into_iter().find_map(|choice| choice.message.content)
            }
            Wire::Messages => {
                let reply: MessagesReply = serde_json::from_str(body).context("Malformed messages body")?;
                reply.content.into_iter().find_map(|block| block.text)
            }
        };
        text.filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("Completion response from {} carried no text", self.url()))
    }
}

/// A hosted completion API reached over reqwest.
#[derive(Debug)]
pub struct HttpProvider {
    model_id: &'static str,
    wire: Wire,
    key: String,
    client: reqwest::Client,
}

impl HttpProvider {
    fn new(model_id: &'static str, wire: Wire, key_var: &str, timeout: Duration) -> Result<Self> {
        let key = api_key(key_var)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { model_id, wire, key, client })
    }
}

#[async_trait]
impl CompletionProvider for HttpProvider {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let body = CompletionRequest {
            model: self.model_id,
            max_tokens,
            messages: [Turn { role: "user", content: prompt }],
        };
        let url = self.wire.url();
        let response = self
            .wire
            .authorize(self.client.post(url), &self.key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read response from {}", url))?;
        if !status.is_success() {
            bail!("{} answered {}: {}", url, status, text.trim());
        }
        self.wire.text_of(&text)
    }

    fn model_name(&self) -> &str {
        self.model_id
    }
}

/// Runs `claude -p <prompt>`; needs no API key.
#[derive(Debug)]
pub struct CliProvider {
    model_id: &'static str,
}

impl CliProvider {
    fn new(model_id: &'static str) -> Result<Self> {
        std::process::Command::new("claude")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .context("'claude' CLI not found; choose an API-backed model instead")?;
        Ok(Self { model_id })
    }
}

#[async_trait]
impl CompletionProvider for CliProvider {
    async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String> {
        let output = tokio::process::Command::new("claude")
            .args(["-p", prompt, "--model", self.model_id])
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run 'claude' CLI")?;

        if !output.status.success() {
            bail!("claude CLI exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr).trim());
        }
        let text = String::from_utf8(output.stdout).context("claude CLI printed invalid UTF-8")?;
        if text.trim().is_empty() {
            bail!("claude CLI printed nothing");
        }
        Ok(text)
    }

    fn model_name(&self) -> &str {
        self.model_id
    }
}
