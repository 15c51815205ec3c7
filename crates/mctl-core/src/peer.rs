//! Contract with the LLM gateway: send a prompt, read a typed event stream, feed tool results back.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{PeerConfig, ToolOutput, ToolSchema};

pub type PeerEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<PeerEvent>> + Send>>;

#[derive(Debug, Clone, Serialize)]
pub struct PeerRequest {
    pub session_key: String,
    pub role_id: String,
    pub prompt: String,
    pub tools: Vec<ToolSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    #[serde(default, alias = "input_tokens")]
    pub prompt_tokens: u64,
    #[serde(default, alias = "output_tokens")]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerEvent {
    #[serde(alias = "text", alias = "delta")]
    TextDelta { text: String },
    #[serde(alias = "tool_use")]
    ToolCall {
        id: String,
        name: String,
        #[serde(default, alias = "args", alias = "input")]
        arguments: Value,
    },
    Usage { usage: TokenUsage },
    #[serde(alias = "done", alias = "completed")]
    Final {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    Error {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
}

const ENVELOPE_KEYS: [&str; 3] = ["event", "data", "payload"];

/// Decodes one wire object. Envelopes (`{"event": {...}}`) are unwrapped, string-encoded tool
/// arguments are parsed, and unknown event types yield `None`.
pub fn decode_peer_event(value: Value) -> anyhow::Result<Option<PeerEvent>> {
    let mut value = value;
    for _ in 0..4 {
        let Some(obj) = value.as_object() else {
            return Err(anyhow!("peer event is not an object"));
        };
        if obj.contains_key("type") {
            break;
        }
        let Some(inner) = ENVELOPE_KEYS
            .iter()
            .find_map(|key| obj.get(*key).filter(|v| v.is_object()))
        else {
            return Ok(None);
        };
        value = inner.clone();
    }

    if let Some(Value::String(raw)) = value.get("arguments") {
        let parsed = if raw.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| json!({ "raw": raw }))
        };
        value["arguments"] = parsed;
    }

    match serde_json::from_value::<PeerEvent>(value.clone()) {
        Ok(event) => Ok(Some(event)),
        Err(err) => {
            let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
            if is_known_type(kind) {
                Err(anyhow!("malformed `{kind}` peer event: {err}"))
            } else {
                tracing::debug!(event_type = kind, "ignoring unknown peer event");
                Ok(None)
            }
        }
    }
}

fn is_known_type(kind: &str) -> bool {
    matches!(
        kind,
        "text_delta"
            | "text"
            | "delta"
            | "tool_call"
            | "tool_use"
            | "usage"
            | "final"
            | "done"
            | "completed"
            | "error"
    )
}

/// An open conversation turn on the peer.
pub struct PeerSession {
    pub stream_id: String,
    pub model: Option<String>,
    pub events: PeerEventStream,
}

#[async_trait]
pub trait LlmPeer: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, request: PeerRequest) -> anyhow::Result<PeerSession>;
    async fn submit_tool_result(
        &self,
        stream_id: &str,
        call_id: &str,
        output: &ToolOutput,
    ) -> anyhow::Result<()>;
}

pub fn peer_from_config(config: &PeerConfig) -> Arc<dyn LlmPeer> {
    match config
        .gateway_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    {
        Some(url) => Arc::new(GatewayPeer::new(
            url,
            config.api_key.clone(),
            config.model.clone(),
        )),
        None => Arc::new(UnconfiguredPeer),
    }
}

/// Stand-in when no gateway is configured; every run fails with a lifecycle error.
pub struct UnconfiguredPeer;

#[async_trait]
impl LlmPeer for UnconfiguredPeer {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn send(&self, _request: PeerRequest) -> anyhow::Result<PeerSession> {
        anyhow::bail!("no LLM gateway configured (set MCTL_GATEWAY_URL or peer.gateway_url)")
    }

    async fn submit_tool_result(
        &self,
        _stream_id: &str,
        _call_id: &str,
        _output: &ToolOutput,
    ) -> anyhow::Result<()> {
        anyhow::bail!("no LLM gateway configured")
    }
}

pub struct GatewayPeer {
    base_url: String,
    api_key: Option<String>,
    model: Option<String>,
    client: Client,
}

impl GatewayPeer {
    pub fn new(base_url: &str, api_key: Option<String>, model: Option<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid gateway url `{}`", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("gateway url `{}` cannot be a base", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) if !key.trim().is_empty() => req.bearer_auth(key),
            _ => req,
        }
    }
}

#[async_trait]
impl LlmPeer for GatewayPeer {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn send(&self, request: PeerRequest) -> anyhow::Result<PeerSession> {
        let url = self.endpoint(&["v1", "sessions", &request.session_key, "messages"])?;
        let model = request.model.clone().or_else(|| self.model.clone());
        let body = json!({
            "role_id": request.role_id,
            "prompt": request.prompt,
            "tools": request.tools,
            "model": model,
            "stream": true,
        });
        let resp = self
            .authorize(self.client.post(url).json(&body))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "gateway rejected message with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }
        let stream_id = resp
            .headers()
            .get("x-stream-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| request.session_key.clone());

        let mut bytes = resp.bytes_stream();
        let events = try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                buffer.extend_from_slice(&chunk);
                for value in drain_ndjson_lines(&mut buffer) {
                    if let Some(event) = decode_peer_event(value)? {
                        yield event;
                    }
                }
            }
            buffer.push(b'\n');
            for value in drain_ndjson_lines(&mut buffer) {
                if let Some(event) = decode_peer_event(value)? {
                    yield event;
                }
            }
        };

        Ok(PeerSession {
            stream_id,
            model,
            events: Box::pin(events),
        })
    }

    async fn submit_tool_result(
        &self,
        stream_id: &str,
        call_id: &str,
        output: &ToolOutput,
    ) -> anyhow::Result<()> {
        let url = self.endpoint(&["v1", "streams", stream_id, "tool-results"])?;
        let body = json!({
            "call_id": call_id,
            "output": output.output,
            "is_error": output.is_error,
        });
        let resp = self
            .authorize(self.client.post(url).json(&body))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "gateway rejected tool result with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }
        Ok(())
    }
}

/// Pops every complete line off `buffer`. Lines that are not JSON are dropped.
///
/// Works on raw bytes: a multi-byte character split across network chunks stays in the tail
/// until its line is complete.
fn drain_ndjson_lines(buffer: &mut Vec<u8>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Value>(&line) {
            Ok(value) => out.push(value),
            Err(_) => tracing::debug!("skipping non-json gateway line"),
        }
    }
    out
}

fn truncate_for_error(input: &str, max_chars: usize) -> String {
    let mut out = input.chars().take(max_chars).collect::<String>();
    if input.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_typed_events() {
        let event = decode_peer_event(json!({"type": "text_delta", "text": "hi"}))
            .expect("decode")
            .expect("event");
        assert_eq!(event, PeerEvent::TextDelta { text: "hi".into() });

        let event = decode_peer_event(json!({"type": "final", "usage": {"input_tokens": 10, "output_tokens": 5}}))
            .expect("decode")
            .expect("event");
        match event {
            PeerEvent::Final { text, usage } => {
                assert!(text.is_none());
                assert_eq!(usage.expect("usage").total(), 15);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unwraps_envelopes_and_string_arguments() {
        let event = decode_peer_event(json!({
            "event": {
                "type": "tool_use",
                "id": "call_1",
                "name": "read_task",
                "arguments": "{\"task_id\":\"t1\"}"
            }
        }))
        .expect("decode")
        .expect("event");
        assert_eq!(
            event,
            PeerEvent::ToolCall {
                id: "call_1".into(),
                name: "read_task".into(),
                arguments: json!({"task_id": "t1"}),
            }
        );
    }

    #[test]
    fn unknown_types_are_skipped_and_known_malformed_types_error() {
        assert!(decode_peer_event(json!({"type": "heartbeat"}))
            .expect("decode")
            .is_none());
        assert!(decode_peer_event(json!({"ping": 1})).expect("decode").is_none());
        assert!(decode_peer_event(json!({"type": "tool_call", "name": "x"})).is_err());
        assert!(decode_peer_event(json!("text")).is_err());
    }

    #[test]
    fn ndjson_lines_are_drained_and_partial_tail_is_kept() {
        let mut buffer = b"{\"a\":1}\n\nnot json\n{\"b\":".to_vec();
        let values = drain_ndjson_lines(&mut buffer);
        assert_eq!(values, vec![json!({"a": 1})]);
        assert_eq!(buffer, b"{\"b\":".to_vec());
    }

    #[test]
    fn characters_split_across_chunks_survive() {
        let line = "{\"type\":\"text_delta\",\"text\":\"café ok\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).expect("lead byte") + 1;
        let mut buffer = line[..split].to_vec();
        assert!(drain_ndjson_lines(&mut buffer).is_empty());
        buffer.extend_from_slice(&line[split..]);
        assert_eq!(
            drain_ndjson_lines(&mut buffer),
            vec![json!({"type": "text_delta", "text": "café ok"})]
        );
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn gateway_stream_decodes_events_split_mid_character() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let body = "{\"type\":\"text_delta\",\"text\":\"café ok\"}\n{\"type\":\"final\",\"text\":\"résumé done\"}\n";
        let bytes = body.as_bytes().to_vec();
        let split = bytes.iter().position(|b| *b == 0xC3).expect("lead byte") + 1;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .and_then(|v| v.trim().parse::<usize>().ok())
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let head = "HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n";
            let _ = socket.write_all(head.as_bytes()).await;
            for part in [&bytes[..split], &bytes[split..]] {
                let _ = socket
                    .write_all(format!("{:x}\r\n", part.len()).as_bytes())
                    .await;
                let _ = socket.write_all(part).await;
                let _ = socket.write_all(b"\r\n").await;
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let _ = socket.write_all(b"0\r\n\r\n").await;
            let _ = socket.shutdown().await;
        });

        let peer = GatewayPeer::new(&format!("http://127.0.0.1:{port}"), None, None);
        let session = peer
            .send(PeerRequest {
                session_key: "mctl:writer:t1".into(),
                role_id: "writer".into(),
                prompt: "hello".into(),
                tools: vec![],
                model: None,
            })
            .await
            .expect("send");
        let events = session
            .events
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<anyhow::Result<Vec<_>>>()
            .expect("events");
        assert_eq!(
            events,
            vec![
                PeerEvent::TextDelta {
                    text: "café ok".into()
                },
                PeerEvent::Final {
                    text: Some("résumé done".into()),
                    usage: None,
                },
            ]
        );
    }

    #[test]
    fn gateway_endpoints_escape_session_keys() {
        let peer = GatewayPeer::new("http://gw.local/api/", None, None);
        let url = peer
            .endpoint(&["v1", "sessions", "mctl:writer:t/1", "messages"])
            .expect("url");
        assert_eq!(
            url.as_str(),
            "http://gw.local/api/v1/sessions/mctl:writer:t%2F1/messages"
        );
    }
}
