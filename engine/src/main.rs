use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{fs, io::Read};

use anyhow::Context;
use clap::{Parser, Subcommand};
use mctl_core::{
    classify, load_policy, ConfigStore, MissionControl, PolicyContext, DEFAULT_ENGINE_HOST,
    DEFAULT_ENGINE_PORT,
};
use mctl_observability::{
    emit_event, init_process_logging, summarize, ObservabilityEvent, ProcessKind, Tracer,
};
use mctl_server::{serve, AppState};
use mctl_types::{OriginChannel, TaskOrigin};
use serde_json::{json, Value};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "mctl-engine")]
#[command(about = "Mission Control task orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/SSE server with background maintenance.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long, env = "MCTL_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long)]
        gateway_url: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        /// Role whose APPROVE verdict gates fan-in synthesis.
        #[arg(long)]
        verifier_role: Option<String>,
    },
    /// Classify a hypothetical tool call against the policy file, without a server.
    Classify {
        #[arg(long)]
        tool: String,
        /// JSON arguments, `@path` to read a file, or `-` for stdin.
        #[arg(long, default_value = "{}")]
        args: String,
        #[arg(long, default_value = "ui")]
        channel: String,
        #[arg(long)]
        sender_id: Option<String>,
        #[arg(long)]
        chat_id: Option<String>,
        #[arg(long)]
        policy: Option<PathBuf>,
        #[arg(long, env = "MCTL_STATE_DIR")]
        state_dir: Option<String>,
    },
    /// Aggregate the span log into token totals, failure series and coverage.
    TraceSummary {
        #[arg(long, env = "MCTL_STATE_DIR")]
        state_dir: Option<String>,
    },
    /// Run one zombie and ghost-run sweep.
    Sweep {
        #[arg(long, env = "MCTL_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long)]
        stale_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            gateway_url,
            model,
            api_key,
            verifier_role,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let (_log_guard, log_info) = init_process_logging(
                ProcessKind::Engine,
                &state_dir.join("logs"),
                LOG_RETENTION_DAYS,
            )?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("engine.main", "logging.initialized")
                    .status("ok")
                    .detail("engine jsonl logging initialized"),
            );
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let overrides = build_cli_overrides(gateway_url, model, api_key, verifier_role, None);
            let config = ConfigStore::new(&state_dir, overrides).await?;
            let mission = match MissionControl::bootstrap(&state_dir, config).await {
                Ok(mission) => mission,
                Err(err) => {
                    let detail = err.to_string();
                    emit_event(
                        tracing::Level::ERROR,
                        ProcessKind::Engine,
                        ObservabilityEvent::new("engine.main", "engine.startup.failed")
                            .status("failed")
                            .error_code("ENGINE_STARTUP_FAILED")
                            .detail(&detail),
                    );
                    return Err(err);
                }
            };
            log_startup_paths(&state_dir, &addr);
            serve(addr, AppState::new(mission)).await?;
        }
        Command::Classify {
            tool,
            args,
            channel,
            sender_id,
            chat_id,
            policy,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let _log_guard = init_cli_logging(&state_dir)?;
            let config = ConfigStore::new(&state_dir, None).await?.get().await;
            let policy_path = policy.unwrap_or_else(|| config.policy_path(&state_dir));
            let (rules, source) = load_policy(&policy_path).await;

            let channel: OriginChannel = serde_json::from_value(Value::String(channel.clone()))
                .with_context(|| format!("unknown channel `{channel}`"))?;
            let origin = TaskOrigin {
                channel,
                sender_id,
                chat_id,
                metadata: None,
            };
            let ctx = PolicyContext::new(origin, config.policy.trusted_identities.clone());
            let args = read_json_arg(&args)?;
            let verdict = classify(&tool, &args, &ctx, &rules);
            let output = json!({
                "tool": tool,
                "decision": verdict.decision,
                "reason": verdict.reason,
                "source": source,
                "untrusted": ctx.is_untrusted(),
                "policy_path": policy_path,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::TraceSummary { state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let _log_guard = init_cli_logging(&state_dir)?;
            let spans = Tracer::in_state_dir(&state_dir).read_spans().await?;
            println!("{}", serde_json::to_string_pretty(&summarize(&spans))?);
        }
        Command::Sweep {
            state_dir,
            stale_secs,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let _log_guard = init_cli_logging(&state_dir)?;
            let overrides = build_cli_overrides(None, None, None, None, stale_secs);
            let config = ConfigStore::new(&state_dir, overrides).await?;
            let mission = MissionControl::bootstrap(&state_dir, config).await?;
            let report = mission.run_maintenance().await?;
            mission.settle().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn init_cli_logging(state_dir: &Path) -> anyhow::Result<WorkerGuard> {
    let (guard, _) =
        init_process_logging(ProcessKind::Cli, &state_dir.join("logs"), LOG_RETENTION_DAYS)?;
    Ok(guard)
}

fn build_cli_overrides(
    gateway_url: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    verifier_role: Option<String>,
    stale_secs: Option<u64>,
) -> Option<Value> {
    let mut root = serde_json::Map::new();

    let mut peer = serde_json::Map::new();
    if let Some(url) = gateway_url {
        peer.insert("gateway_url".to_string(), Value::String(url));
    }
    if let Some(m) = model {
        peer.insert("model".to_string(), Value::String(m));
    }
    if let Some(k) = api_key {
        peer.insert("api_key".to_string(), Value::String(k));
    }
    if !peer.is_empty() {
        root.insert("peer".to_string(), Value::Object(peer));
    }
    if let Some(role) = verifier_role {
        root.insert("workflow".to_string(), json!({"verifier_role": role}));
    }
    if let Some(secs) = stale_secs {
        root.insert("execution".to_string(), json!({"zombie_stale_secs": secs}));
    }

    if root.is_empty() {
        None
    } else {
        Some(Value::Object(root))
    }
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("mission-control"))
        .unwrap_or_else(|| PathBuf::from(".mission-control"))
}

fn read_json_arg(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}

fn log_startup_paths(state_dir: &Path, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!(
        "starting mctl-engine on {addr} (state_dir={}, exe={}, cwd={})",
        state_dir.display(),
        exe.display(),
        cwd.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_are_omitted_when_no_flags_are_set() {
        assert!(build_cli_overrides(None, None, None, None, None).is_none());
    }

    #[test]
    fn overrides_nest_under_their_config_sections() {
        let value = build_cli_overrides(
            Some("http://gateway.local".into()),
            Some("gpt-test".into()),
            None,
            Some("verifier".into()),
            Some(60),
        )
        .expect("overrides");
        assert_eq!(value["peer"]["gateway_url"], "http://gateway.local");
        assert_eq!(value["peer"]["model"], "gpt-test");
        assert!(value["peer"].get("api_key").is_none());
        assert_eq!(value["workflow"]["verifier_role"], "verifier");
        assert_eq!(value["execution"]["zombie_stale_secs"], 60);
    }

    #[test]
    fn json_args_accept_inline_and_file_forms() {
        assert_eq!(
            read_json_arg(r#"{"url": "https://localhost/a"}"#).expect("inline")["url"],
            "https://localhost/a"
        );
        let path = std::env::temp_dir().join(format!("mctl-args-{}.json", std::process::id()));
        fs::write(&path, r#"{"task_id": "t1"}"#).expect("write");
        let value = read_json_arg(&format!("@{}", path.display())).expect("file");
        assert_eq!(value["task_id"], "t1");
        let _ = fs::remove_file(path);
        assert!(read_json_arg("not json").is_err());
    }

    #[test]
    fn explicit_state_dir_wins() {
        assert_eq!(
            resolve_state_dir(Some("/tmp/mctl-state".into())),
            PathBuf::from("/tmp/mctl-state")
        );
    }
}
