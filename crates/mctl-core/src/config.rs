use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Hard wall-clock budget for one run.
    pub timeout_secs: u64,
    pub max_tool_calls: usize,
    pub default_max_interrupts: u32,
    /// `in_execution` tasks untouched for longer than this are failed by the zombie sweep.
    pub zombie_stale_secs: u64,
    pub maintenance_interval_secs: u64,
    pub side_effect_max_attempts: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            max_tool_calls: 6,
            default_max_interrupts: 3,
            zombie_stale_secs: 1800,
            maintenance_interval_secs: 60,
            side_effect_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PolicySettings {
    pub path: Option<PathBuf>,
    /// Chat or sender ids whose inbound messages are treated as trusted operators.
    pub trusted_identities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PeerConfig {
    pub gateway_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotificationConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub verifier_role: Option<String>,
    pub default_role: String,
    pub default_tenant: String,
    pub auto_orchestrate_inbound: bool,
    pub auto_orchestrate_mitigations: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            verifier_role: None,
            default_role: "generalist".to_string(),
            default_tenant: "default".to_string(),
            auto_orchestrate_inbound: true,
            auto_orchestrate_mitigations: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub execution: ExecutionConfig,
    pub policy: PolicySettings,
    pub peer: PeerConfig,
    pub notifications: NotificationConfig,
    pub workflow: WorkflowConfig,
}

impl AppConfig {
    pub fn policy_path(&self, state_dir: &Path) -> PathBuf {
        self.policy
            .path
            .clone()
            .unwrap_or_else(|| state_dir.join("policy.yaml"))
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered JSON configuration: defaults < global < project < env < runtime < cli.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(state_dir: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global = match resolve_global_config_path() {
            Some(path) => read_json_file(&path).await.unwrap_or_else(|_| empty_object()),
            None => empty_object(),
        };
        Self::with_global(state_dir.as_ref(), global, cli_overrides).await
    }

    /// Same as [`ConfigStore::new`] without the per-user global layer.
    pub async fn isolated(
        state_dir: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        Self::with_global(state_dir.as_ref(), empty_object(), cli_overrides).await
    }

    async fn with_global(
        state_dir: &Path,
        global: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        fs::create_dir_all(state_dir).await?;
        let project_path = state_dir.join("config.json");
        let project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            project_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_else(|err| {
            tracing::warn!("effective config does not match schema, using defaults: {err}");
            AppConfig::default()
        })
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = serde_json::to_value(AppConfig::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": redacted(&layers.env),
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let mut snapshot = self.layers.read().await.project.clone();
        strip_persisted_secrets(&mut snapshot);
        if let Some(parent) = self.project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.project_path, serde_json::to_string_pretty(&snapshot)?).await?;
        Ok(())
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Secrets supplied through the environment never get written back into `config.json`.
fn strip_persisted_secrets(value: &mut Value) {
    let secret_paths = [
        ("peer", "api_key", "MCTL_GATEWAY_API_KEY"),
        ("notifications", "telegram_bot_token", "MCTL_TELEGRAM_BOT_TOKEN"),
    ];
    for (section, key, env_key) in secret_paths {
        let from_env = std::env::var(env_key)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);
        if !from_env {
            continue;
        }
        if let Some(section) = value.get_mut(section).and_then(|v| v.as_object_mut()) {
            section.remove(key);
        }
    }
}

fn redacted(value: &Value) -> Value {
    let mut out = value.clone();
    for (section, key) in [("peer", "api_key"), ("notifications", "telegram_bot_token")] {
        if let Some(slot) = out.get_mut(section).and_then(|v| v.get_mut(key)) {
            *slot = Value::String("[redacted]".to_string());
        }
    }
    out
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

fn resolve_global_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MCTL_GLOBAL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("mission-control").join("config.json"))
}

fn env_layer() -> Value {
    let mut root = empty_object();

    let string_vars = [
        ("MCTL_GATEWAY_URL", "peer", "gateway_url"),
        ("MCTL_GATEWAY_API_KEY", "peer", "api_key"),
        ("MCTL_MODEL", "peer", "model"),
        ("MCTL_TELEGRAM_BOT_TOKEN", "notifications", "telegram_bot_token"),
        ("MCTL_TELEGRAM_CHAT_ID", "notifications", "telegram_chat_id"),
        ("MCTL_POLICY_PATH", "policy", "path"),
        ("MCTL_VERIFIER_ROLE", "workflow", "verifier_role"),
        ("MCTL_DEFAULT_TENANT", "workflow", "default_tenant"),
    ];
    for (env_key, section, key) in string_vars {
        if let Ok(value) = std::env::var(env_key) {
            if !value.trim().is_empty() {
                deep_merge(&mut root, &json!({ section: { key: value.trim() } }));
            }
        }
    }

    if let Ok(raw) = std::env::var("MCTL_TRUSTED_IDENTITIES") {
        deep_merge(
            &mut root,
            &json!({ "policy": { "trusted_identities": parse_csv(&raw) } }),
        );
    }
    if let Some(secs) = std::env::var("MCTL_EXECUTION_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "execution": { "timeout_secs": secs } }));
    }
    if let Some(limit) = std::env::var("MCTL_MAX_TOOL_CALLS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        deep_merge(&mut root, &json!({ "execution": { "max_tool_calls": limit } }));
    }
    if let Some(enabled) = std::env::var("MCTL_AUTO_ORCHESTRATE")
        .ok()
        .and_then(|v| parse_bool_like(&v))
    {
        deep_merge(
            &mut root,
            &json!({ "workflow": { "auto_orchestrate_inbound": enabled } }),
        );
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
