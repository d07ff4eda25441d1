use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::prompting::{render_system_prompt, SystemPromptContext};
use crate::types::ChatMessage;

/// Shown to the user whenever the responder fails; the failure itself is
/// logged but never surfaced as an error.
pub const FALLBACK_REPLY: &str = "Sorry, I could not generate a reply right now.";

/// The automated first-line responder. Slow is fine; it runs off the
/// arbitration path and only for bot-owned sessions.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(
        &self,
        session_id: &str,
        text: &str,
        history: &[ChatMessage],
    ) -> Result<String, CoreError>;
}

pub struct OpenAiResponder {
    http: reqwest::Client,
    api_key: String,
    model: String,
    bot_name: String,
    brand_name: String,
}

impl OpenAiResponder {
    pub fn from_env(http: reqwest::Client) -> Self {
        Self {
            http,
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            bot_name: std::env::var("BOT_NAME").unwrap_or_default(),
            brand_name: std::env::var("BRAND_NAME").unwrap_or_default(),
        }
    }

    async fn chat_completion_text(&self, system: &str, user: &str) -> Result<String, CoreError> {
        if self.api_key.trim().is_empty() {
            return Err(CoreError::Upstream("OPENAI_API_KEY not configured".to_string()));
        }
        let response = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ],
                "temperature": 0.2
            }))
            .send()
            .await
            .map_err(|err| CoreError::Upstream(format!("openai request failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Upstream(format!("openai returned {status}: {body}")));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| CoreError::Upstream(format!("openai parse failed: {err}")))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(CoreError::Upstream("openai response had empty content".to_string()));
        }
        Ok(text)
    }
}

fn transcript_block(history: &[ChatMessage], limit: usize) -> String {
    let start = history.len().saturating_sub(limit);
    history[start..]
        .iter()
        .map(|message| format!("{}: {}", message.sender_type.as_str(), message.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Responder for OpenAiResponder {
    async fn respond(
        &self,
        _session_id: &str,
        text: &str,
        history: &[ChatMessage],
    ) -> Result<String, CoreError> {
        let system = render_system_prompt(&SystemPromptContext {
            bot_name: &self.bot_name,
            brand_name: &self.brand_name,
            persona: "",
        });
        let transcript = transcript_block(history, 14);
        let user = if transcript.is_empty() {
            format!("Visitor message:\n{text}")
        } else {
            format!("Conversation so far:\n{transcript}\n\nVisitor message:\n{text}")
        };
        self.chat_completion_text(&system, &user).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_iso, SenderType};

    #[test]
    fn transcript_keeps_only_the_tail() {
        let history = (0..20)
            .map(|i| ChatMessage {
                id: i.to_string(),
                session_id: "s1".to_string(),
                sender_type: SenderType::User,
                text: format!("turn {i}"),
                created_at: now_iso(),
            })
            .collect::<Vec<_>>();
        let block = transcript_block(&history, 14);
        assert!(!block.contains("turn 5"));
        assert!(block.contains("turn 6"));
        assert!(block.contains("turn 19"));
    }

    #[tokio::test]
    async fn missing_api_key_is_an_upstream_failure() {
        let responder = OpenAiResponder {
            http: reqwest::Client::new(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            bot_name: String::new(),
            brand_name: String::new(),
        };
        let err = responder.respond("s1", "hello", &[]).await.unwrap_err();
        assert!(matches!(err, CoreError::Upstream(_)));
    }
}
