use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::policy::url_host_allowed;
use crate::Storage;

const MAX_FETCH_CHARS: usize = 20_000;
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub metadata: Value,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>, metadata: Value) -> Self {
        Self {
            output: output.into(),
            is_error: false,
            metadata,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: message.into(),
            is_error: true,
            metadata: json!({}),
        }
    }
}

/// The run a tool call executes on behalf of.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub task_id: String,
    pub run_id: String,
    pub tenant_id: String,
    /// Hosts a fetch may reach, checked again on every redirect hop.
    pub allowed_fetch_domains: Vec<String>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolOutput>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_builtins(storage: Arc<Storage>) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(ScrapeAndParseUrlTool::new())).await;
        registry
            .register(Arc::new(ReadTaskTool {
                storage: storage.clone(),
            }))
            .await;
        registry.register(Arc::new(SearchTasksTool { storage })).await;
        registry
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        self.tools.write().await.insert(name, tool);
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(
        &self,
        name: &str,
        ctx: &ToolContext,
        args: Value,
    ) -> anyhow::Result<ToolOutput> {
        let tool = self.tools.read().await.get(name).cloned();
        let Some(tool) = tool else {
            return Ok(ToolOutput::error(format!("Unknown tool: {name}")));
        };
        tool.execute(ctx, args).await
    }
}

pub struct ScrapeAndParseUrlTool {
    client: reqwest::Client,
}

impl ScrapeAndParseUrlTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for ScrapeAndParseUrlTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ScrapeAndParseUrlTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "scrape_and_parse_url".to_string(),
            description: "Fetch an allow-listed URL and return its readable text".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolOutput> {
        let raw = args["url"].as_str().unwrap_or("").trim();
        if raw.is_empty() {
            return Ok(ToolOutput::error("missing `url` argument"));
        }
        let mut url = match Url::parse(raw) {
            Ok(url) => url,
            Err(err) => return Ok(ToolOutput::error(format!("invalid url `{raw}`: {err}"))),
        };
        let mut hops = 0;
        let resp = loop {
            if !url_host_allowed(&url, &ctx.allowed_fetch_domains) {
                return Ok(ToolOutput::error(format!(
                    "`{url}` is not in allowed_fetch_domains"
                )));
            }
            let resp = self.client.get(url.clone()).send().await?;
            if !resp.status().is_redirection() {
                break resp;
            }
            let Some(location) = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                break resp;
            };
            hops += 1;
            if hops > MAX_REDIRECTS {
                return Ok(ToolOutput::error(format!(
                    "too many redirects (limit {MAX_REDIRECTS})"
                )));
            }
            url = url.join(location)?;
        };
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Ok(ToolOutput::error(format!("fetch returned HTTP {status}")));
        }
        let text = html_to_text(&body);
        let truncated = text.chars().count() > MAX_FETCH_CHARS;
        Ok(ToolOutput::ok(
            text.chars().take(MAX_FETCH_CHARS).collect::<String>(),
            json!({"status": status.as_u16(), "truncated": truncated}),
        ))
    }
}

fn html_to_text(html: &str) -> String {
    static BLOCKS: OnceLock<Option<Regex>> = OnceLock::new();
    static TAGS: OnceLock<Option<Regex>> = OnceLock::new();
    static SPACE: OnceLock<Option<Regex>> = OnceLock::new();
    let blocks = BLOCKS.get_or_init(|| Regex::new(r"(?is)<(script|style|noscript)\b.*?</\s*(script|style|noscript)\s*>").ok());
    let tags = TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").ok());
    let space = SPACE.get_or_init(|| Regex::new(r"[ \t\r\n]+").ok());

    let mut text = html.to_string();
    if let Some(re) = blocks {
        text = re.replace_all(&text, " ").into_owned();
    }
    if let Some(re) = tags {
        text = re.replace_all(&text, " ").into_owned();
    }
    text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    if let Some(re) = space {
        text = re.replace_all(&text, " ").into_owned();
    }
    text.trim().to_string()
}

struct ReadTaskTool {
    storage: Arc<Storage>,
}

#[async_trait]
impl Tool for ReadTaskTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "read_task".to_string(),
            description: "Read a task, its latest run summary and its children".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "task_id": { "type": "string" } },
                "required": ["task_id"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolOutput> {
        let task_id = args["task_id"].as_str().unwrap_or(&ctx.task_id);
        let Some(task) = self.storage.get_task(task_id).await else {
            return Ok(ToolOutput::error(format!("task `{task_id}` not found")));
        };
        if task.tenant_id != ctx.tenant_id {
            return Ok(ToolOutput::error(format!("task `{task_id}` not found")));
        }
        let latest_summary = self
            .storage
            .runs_for_task(task_id)
            .await
            .into_iter()
            .rev()
            .find_map(|run| run.output_summary);
        let children = self
            .storage
            .children(task_id)
            .await
            .into_iter()
            .map(|child| json!({"id": child.id, "title": child.title, "status": child.status}))
            .collect::<Vec<_>>();
        let payload = json!({
            "id": task.id,
            "title": task.title,
            "objective": task.objective,
            "status": task.status,
            "owner_role_id": task.owner_role_id,
            "latest_summary": latest_summary,
            "children": children,
        });
        Ok(ToolOutput::ok(
            serde_json::to_string_pretty(&payload)?,
            json!({"task_id": task_id}),
        ))
    }
}

struct SearchTasksTool {
    storage: Arc<Storage>,
}

#[async_trait]
impl Tool for SearchTasksTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "search_tasks".to_string(),
            description: "Search tasks of the current tenant by title or objective".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolOutput> {
        let query = args["query"].as_str().unwrap_or("").trim().to_lowercase();
        let limit = args["limit"].as_u64().map(|v| v.clamp(1, 50)).unwrap_or(10) as usize;
        let hits = self
            .storage
            .list_tasks()
            .await
            .into_iter()
            .filter(|task| task.tenant_id == ctx.tenant_id)
            .filter(|task| {
                query.is_empty()
                    || task.title.to_lowercase().contains(&query)
                    || task.objective.to_lowercase().contains(&query)
            })
            .take(limit)
            .map(|task| json!({"id": task.id, "title": task.title, "status": task.status}))
            .collect::<Vec<_>>();
        let count = hits.len();
        Ok(ToolOutput::ok(
            serde_json::to_string_pretty(&hits)?,
            json!({"count": count}),
        ))
    }
}
