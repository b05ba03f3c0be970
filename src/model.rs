//! Model backends
//!
//! A backend turns a message list into a lazy stream of text fragments.
//! Failures travel inside the stream as `Err` items so a consumer can treat
//! "the model broke halfway" the same way as "the model never started".

use crate::error::{FlowError, Result};
use bytes::{Buf, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

/// One entry of the prompt sent to a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Lazy sequence of generated text fragments
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Model inference collaborator
pub trait ModelBackend: Send + Sync {
    /// Name reported in completion metadata
    fn model_name(&self) -> &str;

    /// Start generating; with `stream = false` the whole answer arrives as
    /// a single fragment
    fn chat(&self, messages: Vec<ChatMessage>, stream: bool) -> FragmentStream;
}

/// Connection and sampling settings for an Ollama-compatible server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Maximum tokens to generate
    #[serde(default = "default_num_predict")]
    pub num_predict: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "deepseek-r1:7b".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_num_predict() -> u32 {
    2048
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            num_predict: default_num_predict(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// One NDJSON line from `/api/chat`
#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
}

/// Streaming chat client for the Ollama HTTP API
pub struct OllamaBackend {
    client: reqwest::Client,
    config: OllamaConfig,
    url: String,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| FlowError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let url = format!("{}/api/chat", normalize_endpoint(&config.endpoint));
        Ok(Self {
            client,
            config,
            url,
        })
    }

    /// Full chat URL
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_body(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "stream": stream,
            "options": {
                "temperature": self.config.temperature,
                "top_p": self.config.top_p,
                "num_predict": self.config.num_predict,
            }
        })
    }
}

/// Add `http://` when no scheme is given and drop trailing slashes
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    let with_scheme = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };
    with_scheme.trim_end_matches('/').to_string()
}

/// Parse one response line; `Ok(None)` for blank lines
fn parse_line(line: &[u8]) -> Result<Option<(String, bool)>> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace());
    let (Some(start), Some(end)) = (start, end) else {
        return Ok(None);
    };
    let line = &line[start..=end];
    if line.is_empty() {
        return Ok(None);
    }
    let parsed: ChatLine = serde_json::from_slice(line)
        .map_err(|e| FlowError::Generation(format!("Malformed response line: {}", e)))?;
    if let Some(error) = parsed.error {
        return Err(FlowError::Generation(error));
    }
    let content = parsed.message.map(|m| m.content).unwrap_or_default();
    Ok(Some((content, parsed.done)))
}

/// Pop complete lines off the front of `buffer`
fn drain_lines(buffer: &mut BytesMut) -> Vec<BytesMut> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let mut line = buffer.split_to(pos + 1);
        line.truncate(pos);
        lines.push(line);
    }
    lines
}

impl ModelBackend for OllamaBackend {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn chat(&self, messages: Vec<ChatMessage>, stream: bool) -> FragmentStream {
        let (tx, rx) = mpsc::channel::<Result<String>>(100);
        let request = self
            .client
            .post(&self.url)
            .header("Accept", "application/json")
            .json(&self.request_body(&messages, stream));
        let span = tracing::info_span!(
            "a3s.flow.generation",
            model = %self.config.model,
            streaming = stream,
            messages = messages.len(),
        );

        tokio::spawn(
            async move {
                let response = match request.send().await.and_then(|r| r.error_for_status()) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::error!(error = %e, "Model request failed");
                        let _ = tx
                            .send(Err(FlowError::Generation(format!("Request failed: {}", e))))
                            .await;
                        return;
                    }
                };

                let mut body = response.bytes_stream();
                let mut buffer = BytesMut::new();
                while let Some(chunk) = body.next().await {
                    let chunk = match chunk {
                        Ok(c) => c,
                        Err(e) => {
                            let _ = tx
                                .send(Err(FlowError::Generation(format!("Stream error: {}", e))))
                                .await;
                            return;
                        }
                    };
                    buffer.extend_from_slice(&chunk);

                    for line in drain_lines(&mut buffer) {
                        match parse_line(&line) {
                            Ok(Some((content, done))) => {
                                if !content.is_empty() && tx.send(Ok(content)).await.is_err() {
                                    // Consumer went away
                                    return;
                                }
                                if done {
                                    return;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                    }
                }

                // Non-streaming responses may end without a newline
                if buffer.has_remaining() {
                    match parse_line(&buffer) {
                        Ok(Some((content, _))) if !content.is_empty() => {
                            let _ = tx.send(Ok(content)).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                        }
                    }
                }
            }
            .instrument(span),
        );

        ReceiverStream::new(rx).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("localhost:11434"), "http://localhost:11434");
        assert_eq!(normalize_endpoint("http://host:1/"), "http://host:1");
        assert_eq!(normalize_endpoint("https://secure"), "https://secure");
    }

    #[test]
    fn test_request_body() {
        let backend = OllamaBackend::new(OllamaConfig {
            endpoint: "127.0.0.1:11434".into(),
            model: "llama3".into(),
            ..OllamaConfig::default()
        })
        .unwrap();
        assert_eq!(backend.url(), "http://127.0.0.1:11434/api/chat");
        assert_eq!(backend.model_name(), "llama3");

        let body = backend.request_body(&[ChatMessage::user("hi")], true);
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["options"]["num_predict"], 2048);
        assert!((body["options"]["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_parse_line() {
        let (content, done) = parse_line(br#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(content, "Hel");
        assert!(!done);

        let (content, done) = parse_line(br#"{"done":true,"total_duration":12}"#)
            .unwrap()
            .unwrap();
        assert_eq!(content, "");
        assert!(done);

        assert!(parse_line(b"   ").unwrap().is_none());
        assert!(matches!(parse_line(b"{oops"), Err(FlowError::Generation(_))));
        assert!(matches!(
            parse_line(br#"{"error":"model not found"}"#),
            Err(FlowError::Generation(msg)) if msg == "model not found"
        ));
    }

    #[test]
    fn test_drain_lines_keeps_partial_tail() {
        let mut buffer = BytesMut::from(&b"{\"a\":1}\n{\"b\":2}\n{\"c\""[..]);
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines.len(), 2);
        assert_eq!(&lines[0][..], b"{\"a\":1}");
        assert_eq!(&buffer[..], b"{\"c\"");
    }

    #[tokio::test]
    async fn test_unreachable_server_yields_error_item() {
        let backend = OllamaBackend::new(OllamaConfig {
            endpoint: "127.0.0.1:1".into(),
            connect_timeout_ms: 500,
            ..OllamaConfig::default()
        })
        .unwrap();

        let mut stream = backend.chat(vec![ChatMessage::user("hi")], true);
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(FlowError::Generation(_))));
        assert!(stream.next().await.is_none());
    }
}
