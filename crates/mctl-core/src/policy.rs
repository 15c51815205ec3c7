//! Tool-call classification.
//!
//! `classify` is pure: it sees the tool name, its arguments, the request context and an
//! already-loaded [`PolicyConfig`]. Loading never fails open; a missing or malformed file yields
//! [`PolicyConfig::default`], which keeps the default-deny fallback.

use std::path::Path;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mctl_types::TaskOrigin;

const SECRET_MARKERS: &[&str] = &[".env", "id_rsa", ".ssh/", ".aws/credentials"];
const URL_FETCH_TOOLS: &[&str] = &[
    "scrape_and_parse_url",
    "fetch_url",
    "web_fetch",
    "webfetch",
    "http_get",
    "browse",
];
const URL_ARG_KEYS: &[&str] = &["url", "uri", "href", "target_url"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    AutoApprove,
    HitlRequired,
    Banned,
}

impl PolicyDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyDecision::AutoApprove => "auto_approve",
            PolicyDecision::HitlRequired => "hitl_required",
            PolicyDecision::Banned => "banned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyVerdict {
    pub decision: PolicyDecision,
    pub reason: String,
}

impl PolicyVerdict {
    fn new(decision: PolicyDecision, reason: String) -> Self {
        Self { decision, reason }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxRules {
    #[serde(default = "default_true")]
    pub untrusted_telegram_to_hitl: bool,
}

impl Default for SandboxRules {
    fn default() -> Self {
        Self {
            untrusted_telegram_to_hitl: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub auto_approve_actions: Vec<String>,
    pub hitl_required_actions: Vec<String>,
    pub banned_actions: Vec<String>,
    pub allowed_fetch_domains: Vec<String>,
    #[serde(default)]
    pub sandbox_rules: SandboxRules,
}

impl Default for PolicyConfig {
    /// Conservative fallback: only tenant-scoped reads and local fetches run unattended.
    fn default() -> Self {
        let list = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            auto_approve_actions: list(&["read_task", "search_tasks", "scrape_and_parse_url"]),
            hitl_required_actions: list(&[
                "send_message",
                "send_email",
                "publish_report",
                "write_file",
                "create_task",
            ]),
            banned_actions: list(&[
                "shell",
                "exec",
                "delete_task",
                "drop_database",
                "transfer_funds",
            ]),
            allowed_fetch_domains: list(&["localhost"]),
            sandbox_rules: SandboxRules::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    File,
    DefaultMissing,
    DefaultMalformed,
}

pub fn parse_policy(raw: &str) -> anyhow::Result<PolicyConfig> {
    Ok(serde_yaml::from_str::<PolicyConfig>(raw)?)
}

/// Re-reads the policy file. Cheap enough to call per tool invocation.
pub async fn load_policy(path: &Path) -> (PolicyConfig, PolicySource) {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("policy file {} unreadable: {err}", path.display());
            }
            return (PolicyConfig::default(), PolicySource::DefaultMissing);
        }
    };
    match parse_policy(&raw) {
        Ok(config) => (config, PolicySource::File),
        Err(err) => {
            tracing::warn!(
                "policy file {} is malformed, using conservative defaults: {err}",
                path.display()
            );
            (PolicyConfig::default(), PolicySource::DefaultMalformed)
        }
    }
}

/// Who is asking, as far as policy is concerned.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub origin: TaskOrigin,
    pub trusted_identities: Vec<String>,
}

impl PolicyContext {
    pub fn new(origin: TaskOrigin, trusted_identities: Vec<String>) -> Self {
        Self {
            origin,
            trusted_identities,
        }
    }

    /// Inbound chat traffic whose sender and chat are both unknown operators.
    pub fn is_untrusted(&self) -> bool {
        if !self.origin.is_inbound_messaging() {
            return false;
        }
        let trusted = |id: &Option<String>| {
            id.as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .is_some_and(|id| self.trusted_identities.iter().any(|t| t.trim() == id))
        };
        !(trusted(&self.origin.sender_id) || trusted(&self.origin.chat_id))
    }
}

pub fn classify(
    tool_name: &str,
    args: &Value,
    ctx: &PolicyContext,
    config: &PolicyConfig,
) -> PolicyVerdict {
    let tool = normalize_action(tool_name);
    let serialized = args.to_string().to_ascii_lowercase();

    if let Some(marker) = SECRET_MARKERS.iter().find(|m| serialized.contains(*m)) {
        return PolicyVerdict::new(
            PolicyDecision::Banned,
            format!("arguments reference secret material (`{marker}`)"),
        );
    }

    if is_url_fetch_tool(&tool, args) {
        match target_host(args) {
            Some(host) if domain_allowed(&host, &config.allowed_fetch_domains) => {}
            Some(host) => {
                return PolicyVerdict::new(
                    PolicyDecision::Banned,
                    format!("domain `{host}` is not in allowed_fetch_domains"),
                );
            }
            None => {
                return PolicyVerdict::new(
                    PolicyDecision::Banned,
                    format!("`{tool}` called without a parseable target url"),
                );
            }
        }
    }

    if contains_action(&config.banned_actions, &tool) {
        return PolicyVerdict::new(
            PolicyDecision::Banned,
            format!("action `{tool}` is banned"),
        );
    }

    if contains_action(&config.hitl_required_actions, &tool) {
        return PolicyVerdict::new(
            PolicyDecision::HitlRequired,
            format!("action `{tool}` requires human approval"),
        );
    }

    if config.sandbox_rules.untrusted_telegram_to_hitl && ctx.is_untrusted() {
        return PolicyVerdict::new(
            PolicyDecision::HitlRequired,
            format!("untrusted inbound sender; `{tool}` escalated to human approval"),
        );
    }

    if contains_action(&config.auto_approve_actions, &tool) {
        return PolicyVerdict::new(
            PolicyDecision::AutoApprove,
            format!("action `{tool}` is auto-approved"),
        );
    }

    PolicyVerdict::new(
        PolicyDecision::HitlRequired,
        format!("action `{tool}` is not listed; default-deny requires human approval"),
    )
}

pub(crate) fn normalize_action(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

fn contains_action(list: &[String], tool: &str) -> bool {
    list.iter().any(|entry| normalize_action(entry) == tool)
}

/// Known fetch tools, plus any call that carries a URL argument.
pub fn is_url_fetch_tool(tool: &str, args: &Value) -> bool {
    URL_FETCH_TOOLS.contains(&tool) || URL_ARG_KEYS.iter().any(|key| args.get(*key).is_some())
}

fn target_host(args: &Value) -> Option<String> {
    let raw = URL_ARG_KEYS
        .iter()
        .find_map(|key| args.get(*key).and_then(|v| v.as_str()))?;
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }
    Some(host)
}

/// Host check applied to every hop a fetch takes, redirects included.
pub(crate) fn url_host_allowed(url: &Url, allowed: &[String]) -> bool {
    url.host_str()
        .map(|host| host.trim_end_matches('.').to_ascii_lowercase())
        .filter(|host| !host.is_empty())
        .is_some_and(|host| domain_allowed(&host, allowed))
}

fn domain_allowed(host: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|entry| {
        let domain = entry
            .trim()
            .trim_start_matches("*.")
            .trim_start_matches('.')
            .trim_end_matches('.')
            .to_ascii_lowercase();
        !domain.is_empty() && (host == domain || host.ends_with(&format!(".{domain}")))
    })
}
