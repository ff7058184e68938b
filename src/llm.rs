//! The boundary with the chat completion service
//!
//! Everything in the crate that needs a model goes through the
//! LanguageModel trait, which maps one request to the text of
//! the reply. The HTTP client for OpenAI-compatible servers
//! (OpenAI itself, LM Studio, vLLM, ...) is one implementation;
//! tests use scripted ones.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};

use crate::config::{GenerationSettings, LlmSettings};
use crate::error::{IcdError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One chat completion request, in the shape the
/// /chat/completions endpoint expects
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(model: &str, messages: Vec<ChatMessage>, generation: GenerationSettings) -> Self {
        Self {
            model: model.to_string(),
            messages,
            temperature: generation.temperature,
            max_tokens: generation.max_tokens,
        }
    }

    /// The text of the last user message (the prompt proper)
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map_or("", |m| m.content.as_str())
    }
}

/// Anything that can answer a completion request with text
pub trait LanguageModel {
    fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

impl<M: LanguageModel + ?Sized> LanguageModel for &M {
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        (**self).complete(request)
    }
}

impl<M: LanguageModel + ?Sized> LanguageModel for Box<M> {
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        (**self).complete(request)
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl ChatCompletionResponse {
    /// Text of the first choice
    fn into_content(self) -> Result<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| IcdError::Unparseable(String::from("completion has no message content")))
    }
}

/// The reply text of a /chat/completions response, given its
/// status and body
fn completion_from(status: reqwest::StatusCode, body: &str) -> Result<String> {
    if !status.is_success() {
        return Err(IcdError::Status {
            status: status.as_u16(),
            body: body.to_string(),
        });
    }
    let completion: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|error| IcdError::Unparseable(format!("not a chat completion: {error}")))?;
    completion.into_content()
}

/// Blocking client for an OpenAI-compatible chat completion API
pub struct OpenAiClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl OpenAiClient {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            api_key: settings.api_key.clone(),
        })
    }
}

impl LanguageModel for OpenAiClient {
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        tracing::debug!(
            endpoint = %self.endpoint,
            model = %request.model,
            prompt_chars = request.prompt().len(),
            "sending completion request"
        );
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        let response = builder.send()?;
        let status = response.status();
        let body = response.text()?;
        completion_from(status, &body)
    }
}

/// In-memory cache in front of another model.
///
/// Only deterministic requests (temperature 0) are cached, so a
/// cached reply is the reply the model would have given anyway.
/// Keys are a BLAKE2b digest of the serialized request, which
/// covers the model name, every message and the token budget.
pub struct CachingModel<M> {
    inner: M,
    cache: Mutex<HashMap<Vec<u8>, String>>,
}

impl<M> CachingModel<M> {
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Number of cached replies
    pub fn len(&self) -> usize {
        self.cache.lock().map_or(0, |cache| cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn request_key(request: &CompletionRequest) -> Result<Vec<u8>> {
    let mut hasher = Blake2b512::new();
    hasher.update(serde_json::to_vec(request)?);
    Ok(hasher.finalize()[0..32].to_vec())
}

impl<M: LanguageModel> LanguageModel for CachingModel<M> {
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        if request.temperature != 0.0 {
            return self.inner.complete(request);
        }
        let key = request_key(request)?;
        if let Some(hit) = self.cache.lock().ok().and_then(|cache| cache.get(&key).cloned()) {
            tracing::debug!("completion served from cache");
            return Ok(hit);
        }
        // Failures are not cached, so a transient error is retried
        // on the next identical request
        let reply = self.inner.complete(request)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, reply.clone());
        }
        Ok(reply)
    }
}

/// Test doubles for the language model
#[cfg(test)]
pub(crate) mod testing {

    use super::*;
    use std::collections::VecDeque;

    /// Replies with queued responses in order, and records the
    /// requests it was sent. Runs out with a 503 error.
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String>>>,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn replying(replies: &[&str]) -> Self {
            Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn prompt(&self, call: usize) -> String {
            self.requests.lock().unwrap()[call].prompt().to_string()
        }
    }

    pub fn unavailable() -> IcdError {
        IcdError::Status {
            status: 503,
            body: String::from("model unavailable"),
        }
    }

    impl LanguageModel for ScriptedModel {
        fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(unavailable()))
        }
    }

    /// Replies by calling a closure on the request
    pub struct FnModel<F>(pub F);

    impl<F> LanguageModel for FnModel<F>
    where
        F: Fn(&CompletionRequest) -> Result<String>,
    {
        fn complete(&self, request: &CompletionRequest) -> Result<String> {
            (self.0)(request)
        }
    }
}

#[cfg(test)]
mod tests {

    use super::testing::*;
    use super::*;

    fn request(prompt: &str, temperature: f32) -> CompletionRequest {
        CompletionRequest::new(
            "gpt-3.5-turbo",
            vec![ChatMessage::system("be brief"), ChatMessage::user(prompt)],
            GenerationSettings::new(temperature, 10),
        )
    }

    #[test]
    fn request_serializes_to_chat_completion_shape() {
        let value = serde_json::to_value(request("hello", 0.0)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "model": "gpt-3.5-turbo",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hello"}
                ],
                "temperature": 0.0,
                "max_tokens": 10
            })
        );
    }

    #[test]
    fn response_content_is_extracted() {
        let json = r#"{"id": "x", "choices": [{"index": 0, "message": {"role": "assistant", "content": "cholera, fever"}}]}"#;
        let reply = completion_from(reqwest::StatusCode::OK, json).unwrap();
        assert_eq!(reply, "cholera, fever");
    }

    #[test]
    fn error_status_keeps_the_body() {
        let error = completion_from(reqwest::StatusCode::SERVICE_UNAVAILABLE, "overloaded").unwrap_err();
        assert!(error.is_transport());
        assert!(matches!(
            error,
            IcdError::Status { status: 503, ref body } if body == "overloaded"
        ));
    }

    #[test]
    fn missing_content_is_unparseable() {
        let no_choices = r#"{"choices": []}"#;
        let null_content = r#"{"choices": [{"message": {"role": "assistant", "content": null}}]}"#;
        let not_json = "<html>gateway</html>";
        for body in [no_choices, null_content, not_json] {
            let error = completion_from(reqwest::StatusCode::OK, body).unwrap_err();
            assert!(matches!(error, IcdError::Unparseable(_)), "{body}");
            assert!(!error.is_transport());
        }
    }

    #[test]
    fn deterministic_requests_are_cached() {
        let model = CachingModel::new(ScriptedModel::replying(&["first", "second"]));
        assert_eq!(model.complete(&request("a", 0.0)).unwrap(), "first");
        assert_eq!(model.complete(&request("a", 0.0)).unwrap(), "first");
        assert_eq!(model.inner().calls(), 1);
        assert_eq!(model.complete(&request("b", 0.0)).unwrap(), "second");
        assert_eq!(model.len(), 2);
    }

    #[test]
    fn sampled_requests_and_failures_are_not_cached() {
        let model = CachingModel::new(ScriptedModel::new(vec![
            Ok(String::from("one")),
            Ok(String::from("two")),
            Err(unavailable()),
            Ok(String::from("three")),
        ]));
        assert_eq!(model.complete(&request("a", 0.7)).unwrap(), "one");
        assert_eq!(model.complete(&request("a", 0.7)).unwrap(), "two");
        assert!(model.complete(&request("c", 0.0)).is_err());
        assert_eq!(model.complete(&request("c", 0.0)).unwrap(), "three");
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn prompt_is_last_user_message() {
        assert_eq!(request("find codes", 0.0).prompt(), "find codes");
    }
}
