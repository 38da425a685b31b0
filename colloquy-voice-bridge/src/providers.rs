//! HTTP capability providers wired from environment configuration
//!
//! Small JSON/NDJSON contracts so any upstream can be fronted with a few
//! lines of glue: transcription POSTs a WAV and reads `{"text": ...}`,
//! generation streams NDJSON lines of `{"token": ...}`, synthesis streams
//! raw audio bytes. The engine's guards own retries and ceilings; providers
//! only translate transport and status failures.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use colloquy_voice::{
    AudioChunkStream, ContextSnapshot, Message, MessageSink, PortError, ResponseGenerator,
    SpeechSynthesizer, TokenStream, Transcriber,
};

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn transport_err(err: reqwest::Error) -> PortError {
    PortError::Transport(err.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PortError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(PortError::Status {
        status: status.as_u16(),
        message,
    })
}

/// `POST <url>` with WAV bytes, response `{"text": "..."}`.
pub struct HttpTranscriber {
    client: reqwest::Client,
    url: String,
}

impl HttpTranscriber {
    pub fn new(url: String) -> Self {
        Self {
            client: http_client(),
            url,
        }
    }
}

#[derive(Deserialize)]
struct TranscriptBody {
    text: String,
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, wav_bytes: &[u8]) -> Result<String, PortError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "audio/wav")
            .body(wav_bytes.to_vec())
            .send()
            .await
            .map_err(transport_err)?;
        let body: TranscriptBody = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| PortError::InvalidPayload(e.to_string()))?;
        Ok(body.text)
    }
}

/// Stands in when no STT upstream is configured; clients must inject their
/// own transcripts.
pub struct UnconfiguredTranscriber;

#[async_trait]
impl Transcriber for UnconfiguredTranscriber {
    async fn transcribe(&self, _wav_bytes: &[u8]) -> Result<String, PortError> {
        Err(PortError::Status {
            status: 501,
            message: "No transcription upstream configured; set COLLOQUY_STT_URL or send \
                      transcript messages"
                .into(),
        })
    }
}

/// `POST <url>` with the conversation, response streamed as NDJSON lines of
/// `{"token": "..."}` terminated by `{"done": true}`.
pub struct HttpGenerator {
    client: reqwest::Client,
    url: String,
}

impl HttpGenerator {
    pub fn new(url: String) -> Self {
        Self {
            client: http_client(),
            url,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TokenLine {
    token: Option<String>,
    done: bool,
}

fn parse_token_line(line: &[u8]) -> Result<Option<String>, PortError> {
    let line = std::str::from_utf8(line)
        .map_err(|e| PortError::InvalidPayload(e.to_string()))?
        .trim();
    if line.is_empty() {
        return Ok(None);
    }
    let parsed: TokenLine =
        serde_json::from_str(line).map_err(|e| PortError::InvalidPayload(e.to_string()))?;
    if parsed.done {
        return Ok(None);
    }
    parsed
        .token
        .map(Some)
        .ok_or_else(|| PortError::InvalidPayload(format!("line without token: '{line}'")))
}

#[async_trait]
impl ResponseGenerator for HttpGenerator {
    async fn generate_stream(
        &self,
        messages: &[Message],
        context: &ContextSnapshot,
        cancel: CancellationToken,
    ) -> Result<TokenStream, PortError> {
        let body = json!({
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.text}))
                .collect::<Vec<_>>(),
            "context": context.api_data,
            "stream": true,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;
        let response = check_status(response).await?;

        struct NdjsonState {
            body: futures::stream::BoxStream<'static, Result<Vec<u8>, PortError>>,
            buf: Vec<u8>,
            done: bool,
        }

        let state = NdjsonState {
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()).map_err(transport_err))
                .take_until(Box::pin(cancel.cancelled_owned()))
                .boxed(),
            buf: Vec::new(),
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(pos) = state.buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = state.buf.drain(..=pos).collect();
                    match parse_token_line(&line) {
                        Ok(Some(token)) => return Some((Ok(token), state)),
                        Ok(None) => continue,
                        Err(err) => {
                            state.done = true;
                            state.buf.clear();
                            return Some((Err(err), state));
                        }
                    }
                }
                if state.done {
                    if state.buf.iter().any(|b| !b.is_ascii_whitespace()) {
                        let line = std::mem::take(&mut state.buf);
                        return match parse_token_line(&line) {
                            Ok(Some(token)) => Some((Ok(token), state)),
                            Ok(None) => None,
                            Err(err) => Some((Err(err), state)),
                        };
                    }
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(bytes)) => state.buf.extend_from_slice(&bytes),
                    Some(Err(err)) => {
                        state.done = true;
                        state.buf.clear();
                        return Some((Err(err), state));
                    }
                    None => state.done = true,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// `POST <url>` with `{"text": ...}`, response streamed as raw audio bytes.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    url: String,
}

impl HttpSynthesizer {
    pub fn new(url: String) -> Self {
        Self {
            client: http_client(),
            url,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize_stream(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<AudioChunkStream, PortError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({"text": text}))
            .send()
            .await
            .map_err(transport_err)?;
        let response = check_status(response).await?;

        let stream = response
            .bytes_stream()
            .take_until(Box::pin(cancel.cancelled_owned()))
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(transport_err));
        Ok(Box::pin(stream))
    }
}

/// Fire-and-forget mirror of appended messages to an external vector store.
pub struct HttpMessageSink {
    client: reqwest::Client,
    url: String,
}

impl HttpMessageSink {
    pub fn new(url: String) -> Self {
        Self {
            client: http_client(),
            url,
        }
    }
}

#[async_trait]
impl MessageSink for HttpMessageSink {
    async fn store(&self, conversation_id: Uuid, message: &Message) -> Result<(), PortError> {
        let body = json!({"conversation_id": conversation_id, "message": message});
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;
        check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lines_parse() {
        assert_eq!(
            parse_token_line(br#"{"token":"All "}"#).unwrap(),
            Some("All ".to_string())
        );
        assert_eq!(parse_token_line(br#"{"done":true}"#).unwrap(), None);
        assert_eq!(parse_token_line(b"   \n").unwrap(), None);
        assert!(parse_token_line(br#"{"foo":1}"#).is_err());
        assert!(parse_token_line(b"not json").is_err());
    }
}
