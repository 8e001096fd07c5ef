//! Model backends: the registry mapping model identifiers to providers,
//! and the wire clients that turn (task, transcript, page view) into the
//! next browser action.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::observe::PageView;
use crate::run::Step;
use crate::{extract, prompt, Error, Result};

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Scroll targets the model can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Top,
    Bottom,
}

/// One browser action, as decided by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentAction {
    Navigate { url: String },
    Click { index: usize },
    Fill { index: usize, text: String },
    Scroll { direction: ScrollDirection },
    PressKey { key: String },
    Extract { js: String },
    Wait { ms: u64 },
    Done { summary: String },
}

impl AgentAction {
    /// Short descriptor recorded in the step transcript.
    pub fn describe(&self) -> String {
        match self {
            AgentAction::Navigate { url } => format!("navigate {}", url),
            AgentAction::Click { index } => format!("click [{}]", index),
            AgentAction::Fill { index, text } => format!("fill [{}] \"{}\"", index, text),
            AgentAction::Scroll { direction } => {
                format!("scroll {}", serde_json::to_value(direction).unwrap().as_str().unwrap())
            }
            AgentAction::PressKey { key } => format!("press_key {}", key),
            AgentAction::Extract { js } => {
                let js = js.replace('\n', " ");
                if js.chars().count() > 60 {
                    let head: String = js.chars().take(57).collect();
                    format!("extract {}...", head)
                } else {
                    format!("extract {}", js)
                }
            }
            AgentAction::Wait { ms } => format!("wait {}ms", ms),
            AgentAction::Done { .. } => "done".into(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, AgentAction::Done { .. })
    }
}

/// Decides the next action given everything observed so far.
#[async_trait]
pub trait ModelBackend: Send + Sync + std::fmt::Debug {
    /// The public identifier this backend was resolved from.
    fn id(&self) -> &str;

    async fn next_action(
        &self,
        task: &str,
        history: &[Step],
        view: &PageView,
    ) -> Result<AgentAction>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    Anthropic,
    OpenAi,
}

struct ModelEntry {
    id: &'static str,
    provider: Provider,
    wire_model: &'static str,
    cred_var: &'static str,
}

/// Immutable identifier-to-backend mapping, built once at startup and
/// shared read-only across all runs.
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
    http: Client,
}

impl ModelRegistry {
    /// The built-in model table. First entry is the default.
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                ModelEntry {
                    id: "claude-3-7-sonnet",
                    provider: Provider::Anthropic,
                    wire_model: "claude-3-7-sonnet-20250219",
                    cred_var: "ANTHROPIC_API_KEY",
                },
                ModelEntry {
                    id: "claude-3-5-haiku",
                    provider: Provider::Anthropic,
                    wire_model: "claude-3-5-haiku-20241022",
                    cred_var: "ANTHROPIC_API_KEY",
                },
                ModelEntry {
                    id: "gpt-4o",
                    provider: Provider::OpenAi,
                    wire_model: "gpt-4o",
                    cred_var: "OPENAI_API_KEY",
                },
                ModelEntry {
                    id: "gpt-4o-mini",
                    provider: Provider::OpenAi,
                    wire_model: "gpt-4o-mini",
                    cred_var: "OPENAI_API_KEY",
                },
            ],
            http: Client::new(),
        }
    }

    /// Identifier used when the request does not name a model.
    pub fn default_id(&self) -> &'static str {
        self.entries[0].id
    }

    pub fn known_ids(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// Resolve an identifier to a ready backend. Fails before any browser
    /// provisioning when the identifier is unknown or the provider
    /// credential is absent from the environment.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn ModelBackend>> {
        self.resolve_with(id, |var| {
            std::env::var(var).ok().filter(|v| !v.is_empty())
        })
    }

    fn resolve_with<F>(&self, id: &str, lookup: F) -> Result<Arc<dyn ModelBackend>>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let entry = self
            .entries
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| {
                Error::UnknownModel(format!("{} (known: {})", id, self.known_ids().join(", ")))
            })?;

        let api_key = lookup(entry.cred_var).ok_or(Error::MissingCredential {
            model: entry.id.to_string(),
            var: entry.cred_var,
        })?;

        Ok(match entry.provider {
            Provider::Anthropic => Arc::new(AnthropicBackend {
                id: entry.id,
                http: self.http.clone(),
                api_key,
                model: entry.wire_model,
            }),
            Provider::OpenAi => Arc::new(OpenAiBackend {
                id: entry.id,
                http: self.http.clone(),
                api_key,
                model: entry.wire_model,
            }),
        })
    }
}

/// Resolution seam used by the HTTP layer, so handlers can be exercised
/// with scripted backends.
pub trait BackendResolver: Send + Sync {
    fn default_id(&self) -> &str;
    fn resolve(&self, id: &str) -> Result<Arc<dyn ModelBackend>>;
}

impl BackendResolver for ModelRegistry {
    fn default_id(&self) -> &str {
        ModelRegistry::default_id(self)
    }

    fn resolve(&self, id: &str) -> Result<Arc<dyn ModelBackend>> {
        ModelRegistry::resolve(self, id)
    }
}

/// One line per prior step so the model sees what already happened.
fn transcript_lines(history: &[Step]) -> String {
    let mut out = String::new();
    for step in history {
        let mut detail = step.outcome.detail.replace('\n', " ");
        if detail.chars().count() > 200 {
            detail = detail.chars().take(197).collect();
            detail.push_str("...");
        }
        out.push_str(&format!(
            "{}. {} -> {}{}\n",
            step.index,
            step.action,
            if step.outcome.ok { "ok" } else { "FAILED" },
            if detail.is_empty() {
                String::new()
            } else {
                format!(": {}", detail)
            }
        ));
    }
    out
}

fn turn_content(task: &str, history: &[Step], view: &PageView) -> String {
    let mut content = format!("Task:\n{}\n", task);
    if !history.is_empty() {
        content.push_str("\nTranscript so far:\n");
        content.push_str(&transcript_lines(history));
    }
    let elements = view.element_list();
    content.push_str(&format!(
        "\nCurrent page: {} — \"{}\"\nInteractive elements:\n{}",
        view.url,
        view.title,
        if elements.is_empty() {
            "(none)\n"
        } else {
            elements.as_str()
        }
    ));
    content.push_str("\nChoose exactly one action.");
    content
}

/// POST a JSON body, retrying bounded times on HTTP 429. Rate limiting is
/// transport noise, not a backend failure.
async fn post_json_with_retry(
    http: &Client,
    url: &str,
    headers: &[(&str, &str)],
    body: &Value,
) -> Result<Value> {
    for attempt in 0..3u64 {
        let mut req = http.post(url).json(body);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Backend(format!("request to {} failed: {}", url, e)))?;
        let status = resp.status();
        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::Backend(format!("invalid response body: {}", e)))?;

        if status.as_u16() == 429 {
            let wait = (attempt + 1) * 2;
            tracing::warn!("rate limited by {}, waiting {}s", url, wait);
            tokio::time::sleep(Duration::from_secs(wait)).await;
            continue;
        }
        if !status.is_success() {
            let detail = json["error"]["message"]
                .as_str()
                .unwrap_or("")
                .chars()
                .take(200)
                .collect::<String>();
            return Err(Error::Backend(format!("{} returned {}: {}", url, status, detail)));
        }
        return Ok(json);
    }
    Err(Error::Backend(format!("{}: rate limited after 3 attempts", url)))
}

// =============================================================================
// Anthropic
// =============================================================================

#[derive(Debug)]
struct AnthropicBackend {
    id: &'static str,
    http: Client,
    api_key: String,
    model: &'static str,
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "navigate",
            "description": "Navigate to a URL.",
            "input_schema": {
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }
        },
        {
            "name": "click",
            "description": "Click an element by its index in the current element list.",
            "input_schema": {
                "type": "object",
                "properties": { "index": { "type": "integer" } },
                "required": ["index"]
            }
        },
        {
            "name": "fill",
            "description": "Clear and type text into an input element by index.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "index": { "type": "integer" },
                    "text": { "type": "string" }
                },
                "required": ["index", "text"]
            }
        },
        {
            "name": "scroll",
            "description": "Scroll the page: up, down, top, or bottom.",
            "input_schema": {
                "type": "object",
                "properties": { "direction": { "type": "string", "enum": ["up", "down", "top", "bottom"] } },
                "required": ["direction"]
            }
        },
        {
            "name": "press_key",
            "description": "Press a key (Enter, Tab, Escape, ArrowDown, ...).",
            "input_schema": {
                "type": "object",
                "properties": { "key": { "type": "string" } },
                "required": ["key"]
            }
        },
        {
            "name": "extract",
            "description": "Run a JavaScript expression in the page and return its result. Use for reading titles, text, or table data.",
            "input_schema": {
                "type": "object",
                "properties": { "js": { "type": "string" } },
                "required": ["js"]
            }
        },
        {
            "name": "wait",
            "description": "Wait N milliseconds for delayed content.",
            "input_schema": {
                "type": "object",
                "properties": { "ms": { "type": "integer" } },
                "required": ["ms"]
            }
        },
        {
            "name": "done",
            "description": "Declare the task complete. Put the requested data in the summary.",
            "input_schema": {
                "type": "object",
                "properties": { "summary": { "type": "string" } },
                "required": ["summary"]
            }
        }
    ])
}

/// Convert a tool_use block (name + input) into an action.
fn action_from_tool(name: &str, input: &Value) -> Result<AgentAction> {
    let mut obj = input.clone();
    if !obj.is_object() {
        obj = json!({});
    }
    obj["action"] = Value::String(name.to_string());
    serde_json::from_value(obj)
        .map_err(|e| Error::Backend(format!("model chose malformed action \"{}\": {}", name, e)))
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn id(&self) -> &str {
        self.id
    }

    async fn next_action(
        &self,
        task: &str,
        history: &[Step],
        view: &PageView,
    ) -> Result<AgentAction> {
        let body = json!({
            "model": self.model,
            "max_tokens": 1024,
            "system": prompt::SYSTEM_PROMPT,
            "tools": tool_definitions(),
            "tool_choice": { "type": "any" },
            "messages": [{ "role": "user", "content": turn_content(task, history, view) }],
        });

        let resp = post_json_with_retry(
            &self.http,
            ANTHROPIC_URL,
            &[
                ("x-api-key", self.api_key.as_str()),
                ("anthropic-version", "2023-06-01"),
            ],
            &body,
        )
        .await?;

        let content = resp["content"].as_array().cloned().unwrap_or_default();
        for block in &content {
            if block["type"] == "tool_use" {
                let name = block["name"].as_str().unwrap_or("");
                return action_from_tool(name, &block["input"]);
            }
        }
        Err(Error::Backend("model returned no action".into()))
    }
}

// =============================================================================
// OpenAI
// =============================================================================

#[derive(Debug)]
struct OpenAiBackend {
    id: &'static str,
    http: Client,
    api_key: String,
    model: &'static str,
}

const OPENAI_ACTION_SCHEMA: &str = "\nRespond with a single JSON object describing one action. \
Supported shapes: {\"action\":\"navigate\",\"url\":...}, {\"action\":\"click\",\"index\":N}, \
{\"action\":\"fill\",\"index\":N,\"text\":...}, {\"action\":\"scroll\",\"direction\":\"up|down|top|bottom\"}, \
{\"action\":\"press_key\",\"key\":...}, {\"action\":\"extract\",\"js\":...}, \
{\"action\":\"wait\",\"ms\":N}, {\"action\":\"done\",\"summary\":...}.";

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn id(&self) -> &str {
        self.id
    }

    async fn next_action(
        &self,
        task: &str,
        history: &[Step],
        view: &PageView,
    ) -> Result<AgentAction> {
        let system = format!("{}{}", prompt::SYSTEM_PROMPT, OPENAI_ACTION_SCHEMA);
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": turn_content(task, history, view) },
            ],
            "response_format": { "type": "json_object" },
        });

        let auth = format!("Bearer {}", self.api_key);
        let resp = post_json_with_retry(
            &self.http,
            OPENAI_URL,
            &[("authorization", auth.as_str())],
            &body,
        )
        .await?;

        let content = resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| Error::Backend("model returned no content".into()))?;

        if let Ok(action) = serde_json::from_str::<AgentAction>(content) {
            return Ok(action);
        }
        // Some models wrap the object in prose or a fence anyway
        let value = extract::first_json(content)
            .ok_or_else(|| Error::Backend(format!("unparseable action: {}", content)))?;
        serde_json::from_value(value)
            .map_err(|e| Error::Backend(format!("malformed action object: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::StepOutcome;

    #[test]
    fn test_action_from_tool_click() {
        let action = action_from_tool("click", &json!({"index": 3})).unwrap();
        assert_eq!(action, AgentAction::Click { index: 3 });
    }

    #[test]
    fn test_action_from_tool_done() {
        let action = action_from_tool("done", &json!({"summary": "title is X"})).unwrap();
        assert!(action.is_done());
    }

    #[test]
    fn test_action_from_tool_unknown() {
        assert!(action_from_tool("teleport", &json!({})).is_err());
    }

    #[test]
    fn test_action_from_tool_missing_field() {
        assert!(action_from_tool("fill", &json!({"index": 1})).is_err());
    }

    #[test]
    fn test_openai_style_parse() {
        let action: AgentAction =
            serde_json::from_str(r#"{"action":"scroll","direction":"down"}"#).unwrap();
        assert_eq!(
            action,
            AgentAction::Scroll {
                direction: ScrollDirection::Down
            }
        );
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            AgentAction::Navigate {
                url: "https://example.com".into()
            }
            .describe(),
            "navigate https://example.com"
        );
        assert_eq!(AgentAction::Click { index: 2 }.describe(), "click [2]");
        assert_eq!(
            AgentAction::Scroll {
                direction: ScrollDirection::Bottom
            }
            .describe(),
            "scroll bottom"
        );
        assert_eq!(
            AgentAction::Done { summary: "x".into() }.describe(),
            "done"
        );
    }

    #[test]
    fn test_registry_default_is_first() {
        let registry = ModelRegistry::builtin();
        assert_eq!(registry.default_id(), "claude-3-7-sonnet");
        assert!(registry.known_ids().contains(&"gpt-4o"));
    }

    #[test]
    fn test_resolve_known_with_credential() {
        let registry = ModelRegistry::builtin();
        let backend = registry
            .resolve_with("claude-3-5-haiku", |_| Some("test-key".into()))
            .unwrap();
        assert_eq!(backend.id(), "claude-3-5-haiku");
    }

    #[test]
    fn test_resolve_unknown_model() {
        let registry = ModelRegistry::builtin();
        let err = registry
            .resolve_with("gpt-99", |_| Some("test-key".into()))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownModel(_)));
        assert!(err.to_string().contains("known:"));
    }

    #[test]
    fn test_resolve_missing_credential() {
        let registry = ModelRegistry::builtin();
        let err = registry.resolve_with("gpt-4o", |_| None).unwrap_err();
        assert!(matches!(err, Error::MissingCredential { .. }));
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_transcript_lines_truncation() {
        let steps = vec![Step {
            index: 0,
            observed: "about:blank".into(),
            action: "extract document.title".into(),
            outcome: StepOutcome {
                ok: true,
                detail: "x".repeat(300),
                done: false,
            },
        }];
        let lines = transcript_lines(&steps);
        assert!(lines.starts_with("0. extract document.title -> ok: "));
        assert!(lines.len() < 260);
        assert!(lines.contains("..."));
    }
}
