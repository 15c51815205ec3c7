use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::fs;
use tokio::sync::RwLock;

use mctl_types::Role;

#[derive(Debug, Clone, Deserialize)]
struct RoleFrontmatter {
    id: Option<String>,
    name: Option<String>,
    keywords: Option<Vec<String>>,
    tools: Option<Vec<String>>,
    verifier: Option<bool>,
}

#[derive(Clone)]
pub struct RoleRegistry {
    roles: Arc<RwLock<HashMap<String, Role>>>,
    default_role: String,
}

impl RoleRegistry {
    /// Built-in roles overlaid with `<state_dir>/roles/*.md`.
    pub async fn new(state_dir: impl Into<PathBuf>, default_role: &str) -> anyhow::Result<Self> {
        let mut by_id = HashMap::new();
        for role in default_roles() {
            by_id.insert(role.id.clone(), role);
        }
        let dir: PathBuf = state_dir.into();
        for role in load_custom_roles(dir.join("roles")).await? {
            by_id.insert(role.id.clone(), role);
        }
        Ok(Self {
            roles: Arc::new(RwLock::new(by_id)),
            default_role: default_role.to_string(),
        })
    }

    pub async fn list(&self) -> Vec<Role> {
        let mut roles = self
            .roles
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        roles.sort_by(|a, b| a.id.cmp(&b.id));
        roles
    }

    pub async fn get(&self, id: &str) -> Option<Role> {
        self.roles.read().await.get(id).cloned()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.roles.read().await.contains_key(id)
    }

    /// Requested role, falling back to the default role and finally a bare generalist.
    pub async fn get_or_default(&self, id: Option<&str>) -> Role {
        let roles = self.roles.read().await;
        id.and_then(|id| roles.get(id))
            .or_else(|| roles.get(&self.default_role))
            .cloned()
            .unwrap_or_else(|| Role {
                id: self.default_role.clone(),
                name: "Generalist".to_string(),
                system_prompt: String::new(),
                keywords: Vec::new(),
                tools: Vec::new(),
                verifier: false,
            })
    }

    /// Keyword routing over title and objective. Ties go to the lexically first role id;
    /// no hits route to the default role. Verifier roles are never routed to.
    pub async fn route(&self, title: &str, objective: &str) -> Role {
        let text = format!("{title} {objective}").to_ascii_lowercase();
        let mut best: Option<(usize, Role)> = None;
        for role in self.list().await {
            if role.verifier {
                continue;
            }
            let score = role
                .keywords
                .iter()
                .filter(|kw| !kw.trim().is_empty() && text.contains(&kw.trim().to_ascii_lowercase()))
                .count();
            if score == 0 {
                continue;
            }
            if best.as_ref().map_or(true, |(top, _)| score > *top) {
                best = Some((score, role));
            }
        }
        match best {
            Some((_, role)) => role,
            None => self.get_or_default(None).await,
        }
    }

    pub async fn insert(&self, role: Role) {
        self.roles.write().await.insert(role.id.clone(), role);
    }
}

/// Empty tool list means the role may request any registered tool.
pub fn role_can_use_tool(role: &Role, tool: &str) -> bool {
    role.tools.is_empty() || role.tools.iter().any(|t| t.eq_ignore_ascii_case(tool))
}

fn role(id: &str, name: &str, prompt: &str, keywords: &[&str], tools: &[&str]) -> Role {
    Role {
        id: id.to_string(),
        name: name.to_string(),
        system_prompt: prompt.to_string(),
        keywords: keywords.iter().map(|s| s.to_string()).collect(),
        tools: tools.iter().map(|s| s.to_string()).collect(),
        verifier: false,
    }
}

fn default_roles() -> Vec<Role> {
    let mut verifier = role(
        "verifier",
        "Verifier",
        "You are the verification role. Check each subtask result against its objective and \
reply with exactly one verdict: APPROVE, NEEDS_REVISION or BLOCK, followed by your reasons.",
        &[],
        &["read_task", "search_tasks"],
    );
    verifier.verifier = true;
    vec![
        role(
            "generalist",
            "Generalist",
            "You are a general-purpose operations agent. Work the task to completion and answer \
in concise markdown with concrete findings.",
            &[],
            &[],
        ),
        role(
            "researcher",
            "Researcher",
            "You are a research agent. Gather evidence with the tools available, cite what you \
fetched, and separate facts from inference.",
            &["research", "investigate", "sources", "compare", "survey", "market"],
            &["scrape_and_parse_url", "read_task", "search_tasks"],
        ),
        role(
            "engineer",
            "Engineer",
            "You are an engineering agent. Diagnose precisely, propose concrete changes, and \
state risks and verification steps.",
            &["bug", "deploy", "api", "code", "refactor", "incident", "latency"],
            &["read_task", "search_tasks", "scrape_and_parse_url"],
        ),
        role(
            "analyst",
            "Analyst",
            "You are a financial and operations analyst. Show your numbers and assumptions.",
            &["budget", "forecast", "revenue", "cost", "pricing", "metrics"],
            &["read_task", "search_tasks"],
        ),
        role(
            "writer",
            "Writer",
            "You are a writing agent. Produce publication-ready copy in the requested tone.",
            &["draft", "copy", "announcement", "newsletter", "blog", "post"],
            &["read_task", "search_tasks"],
        ),
        verifier,
    ]
}

async fn load_custom_roles(dir: PathBuf) -> anyhow::Result<Vec<Role>> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|v| v.to_str()) != Some("md") {
            continue;
        }
        let raw = fs::read_to_string(&path).await?;
        match parse_role_markdown(&raw, &path) {
            Some(role) => out.push(role),
            None => tracing::warn!("skipping role file without valid frontmatter: {}", path.display()),
        }
    }

    Ok(out)
}

fn parse_role_markdown(raw: &str, path: &Path) -> Option<Role> {
    let trimmed = raw.trim_start();
    if !trimmed.starts_with("---") {
        return None;
    }
    let mut parts = trimmed.splitn(3, "---");
    let _ = parts.next();
    let frontmatter = parts.next()?.trim();
    let body = parts.next()?.trim().to_string();
    let parsed: RoleFrontmatter = serde_yaml::from_str(frontmatter).ok()?;
    let default_id = path.file_stem()?.to_string_lossy().to_string();
    let id = parsed.id.unwrap_or(default_id);
    Some(Role {
        name: parsed.name.unwrap_or_else(|| id.clone()),
        id,
        system_prompt: body,
        keywords: parsed.keywords.unwrap_or_default(),
        tools: parsed.tools.unwrap_or_default(),
        verifier: parsed.verifier.unwrap_or(false),
    })
}
