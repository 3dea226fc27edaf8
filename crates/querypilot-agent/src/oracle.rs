use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::time::timeout;

use querypilot_common::{Error, Result};
use querypilot_config::OracleConfig;

/// The language model as a black-box text-in / text-out function.
/// Absence of an oracle is not an error; every caller has a
/// deterministic fallback.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Chat-completions client against a configurable base URL.
pub struct HttpOracle {
    base_url: String,
    model: String,
    api_key: Option<String>,
    deadline: Duration,
    client: Client,
}

#[derive(Deserialize)]
struct ChatReply {
    message: Option<ChatReplyMessage>,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    content: String,
}

impl HttpOracle {
    pub fn new(config: &OracleConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            deadline: Duration::from_millis(config.timeout_ms),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
            "stream": false,
        });

        let url = format!("{}/api/chat", self.base_url);
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = timeout(self.deadline, request.send())
            .await
            .map_err(|_| Error::Timeout("oracle call exceeded deadline".to_string()))?
            .map_err(|e| Error::Oracle(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Oracle(format!(
                "oracle returned status {}",
                response.status()
            )));
        }

        let reply: ChatReply = response
            .json()
            .await
            .map_err(|e| Error::Oracle(format!("invalid oracle response: {e}")))?;

        reply
            .message
            .map(|m| m.content)
            .ok_or_else(|| Error::Oracle("oracle response carried no message".to_string()))
    }
}

/// Strip the decoration language models wrap around JSON: fenced code
/// blocks, Python-style literals, and native-type wrappers like
/// `ObjectId(...)` / `ISODate(...)`.
pub fn sanitize_json_reply(raw: &str) -> String {
    let mut text = raw.trim().to_string();

    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let body_end = body.find("```").unwrap_or(body.len());
        text = body[..body_end].trim().to_string();
    }

    text = text
        .replace(": True", ": true")
        .replace(": False", ": false")
        .replace(": None", ": null")
        .replace(":True", ":true")
        .replace(":False", ":false")
        .replace(":None", ":null");

    text = strip_wrapper(&text, "ObjectId(");
    text = strip_wrapper(&text, "ISODate(");

    // Keep only the outermost JSON value when the model added prose.
    let array_start = text.find('[');
    let object_start = text.find('{');
    let start = match (array_start, object_start) {
        (Some(a), Some(o)) => Some(a.min(o)),
        (Some(a), None) => Some(a),
        (None, Some(o)) => Some(o),
        (None, None) => None,
    };
    if let Some(start) = start {
        let close = if text.as_bytes()[start] == b'[' { ']' } else { '}' };
        if let Some(end) = text.rfind(close) {
            if end > start {
                text = text[start..=end].to_string();
            }
        }
    }

    text
}

/// `ObjectId("abc")` becomes `"abc"`, preserving everything around it.
fn strip_wrapper(text: &str, prefix: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(prefix) {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + prefix.len()..];
        match after.find(')') {
            Some(close) => {
                out.push_str(after[..close].trim());
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[pos..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::sanitize_json_reply;

    #[test]
    fn fenced_code_blocks_are_stripped() {
        let raw = "Here is the plan:\n```json\n[{\"tool\": \"dbQuery\"}]\n```\nLet me know!";
        assert_eq!(sanitize_json_reply(raw), "[{\"tool\": \"dbQuery\"}]");
    }

    #[test]
    fn python_literals_are_normalized() {
        let raw = "{\"succeeded\": True, \"empty\": None}";
        let sanitized = sanitize_json_reply(raw);
        assert_eq!(sanitized, "{\"succeeded\": true, \"empty\": null}");
        assert!(serde_json::from_str::<serde_json::Value>(&sanitized).is_ok());
    }

    #[test]
    fn native_type_wrappers_are_unwrapped() {
        let raw = "{\"_id\": ObjectId(\"5f8d0d55b54764421b7156c3\")}";
        let sanitized = sanitize_json_reply(raw);
        assert_eq!(sanitized, "{\"_id\": \"5f8d0d55b54764421b7156c3\"}");
    }

    #[test]
    fn prose_around_the_json_is_discarded() {
        let raw = "Sure! The answer is {\"a\": 1} — hope that helps.";
        assert_eq!(sanitize_json_reply(raw), "{\"a\": 1}");
    }

    #[test]
    fn array_before_object_wins_the_extraction() {
        let raw = "steps: [{\"tool\": \"dbQuery\", \"subQuery\": \"x\"}]";
        let sanitized = sanitize_json_reply(raw);
        assert!(sanitized.starts_with('['));
        assert!(sanitized.ends_with(']'));
    }
}
