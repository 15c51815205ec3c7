//! Append-only span log.
//!
//! One JSON object per line under `<state_dir>/traces/spans.jsonl`. Lines are never rewritten;
//! readers skip anything that does not parse.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use mctl_types::{Span, SpanKind, TokenSource};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct Tracer {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Tracer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("traces").join("spans.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, span: &Span) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(span)?;
        line.push('\n');
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening span log {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn read_spans(&self) -> anyhow::Result<Vec<Span>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(parse_span_lines(&raw))
    }

    pub async fn spans_for_task(&self, task_id: &str) -> anyhow::Result<Vec<Span>> {
        let mut spans = self.read_spans().await?;
        spans.retain(|span| span.task_id == task_id);
        Ok(spans)
    }
}

pub fn parse_span_lines(raw: &str) -> Vec<Span> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<Span>(line).ok())
        .collect()
}

pub fn trace_id_for(task_id: &str, run_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(b":");
    hasher.update(run_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// Content hash of tool arguments. `serde_json::Map` keeps keys sorted, so equal objects hash
/// equally regardless of the order the peer emitted them in.
pub fn hash_args(args: &Value) -> String {
    let payload = serde_json::to_vec(args).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("sha256:{:x}", hasher.finalize())
}

pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4).max(1)
}

/// Builder for a span that is being timed.
pub struct SpanRecord {
    span: Span,
    started: Instant,
}

impl SpanRecord {
    pub fn start(kind: SpanKind, task_id: &str, run_id: &str) -> Self {
        let now = Utc::now();
        Self {
            span: Span {
                span_id: mctl_types::new_id("span"),
                trace_id: trace_id_for(task_id, run_id),
                task_id: task_id.to_string(),
                run_id: run_id.to_string(),
                kind,
                name: None,
                role_id: None,
                model: None,
                tool_name: None,
                args_hash: None,
                success: false,
                latency_ms: 0,
                tokens: None,
                token_source: None,
                started_at: now,
                ended_at: now,
                metadata: serde_json::Map::new(),
            },
            started: Instant::now(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.span.name = Some(name.into());
        self
    }

    pub fn role(mut self, role_id: impl Into<String>) -> Self {
        self.span.role_id = Some(role_id.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.span.model = Some(model.into());
        self
    }

    pub fn tool(mut self, tool: impl Into<String>, args: &Value) -> Self {
        self.span.tool_name = Some(tool.into());
        self.span.args_hash = Some(hash_args(args));
        self
    }

    pub fn tokens(mut self, tokens: u64, source: TokenSource) -> Self {
        self.span.tokens = Some(tokens);
        self.span.token_source = Some(source);
        self
    }

    pub fn meta(mut self, key: &str, value: Value) -> Self {
        self.span.metadata.insert(key.to_string(), value);
        self
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.span.started_at
    }

    pub fn finish(mut self, success: bool) -> Span {
        self.span.success = success;
        self.span.latency_ms = self.started.elapsed().as_millis() as u64;
        self.span.ended_at = Utc::now();
        self.span
    }
}
