//! Deterministic doubles for the LLM peer and the notifier, plus a throwaway
//! `MissionControl` rooted in a temp directory.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::{
    ConfigStore, LlmPeer, MissionControl, Notification, Notifier, PeerEvent, PeerRequest,
    PeerSession, TokenUsage, ToolOutput,
};

pub const DEFAULT_REPLY: &str = "Scripted reply.";

/// What one `send` on the [`ScriptedPeer`] produces.
#[derive(Debug, Clone)]
pub enum ScriptedSession {
    /// Each turn is pushed once every distinct tool call of the previous turn has a result.
    Turns(Vec<Vec<PeerEvent>>),
    /// Like `Turns`, but the first turn waits until `release` is notified.
    Held {
        release: Arc<Notify>,
        turns: Vec<Vec<PeerEvent>>,
    },
    /// Opens a stream that never yields.
    Hang,
    /// Answers every tool result with another call to the same tool.
    Endless { tool: String, args: Value },
    /// `send` itself fails.
    Fail(String),
}

impl ScriptedSession {
    pub fn reply(text: &str) -> Self {
        Self::Turns(vec![reply_turn(text)])
    }

    pub fn held_reply(release: Arc<Notify>, text: &str) -> Self {
        Self::Held {
            release,
            turns: vec![reply_turn(text)],
        }
    }

    pub fn reply_with_usage(text: &str, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self::Turns(vec![vec![
            PeerEvent::TextDelta {
                text: text.to_string(),
            },
            PeerEvent::Final {
                text: None,
                usage: Some(TokenUsage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: 0,
                }),
            },
        ]])
    }

    pub fn tool_then_reply(tool: &str, args: Value, text: &str) -> Self {
        Self::Turns(vec![
            vec![tool_call("call_1", tool, args)],
            vec![PeerEvent::Final {
                text: Some(text.to_string()),
                usage: None,
            }],
        ])
    }
}

fn reply_turn(text: &str) -> Vec<PeerEvent> {
    vec![
        PeerEvent::TextDelta {
            text: text.to_string(),
        },
        PeerEvent::Final {
            text: None,
            usage: None,
        },
    ]
}

pub fn tool_call(id: &str, name: &str, arguments: Value) -> PeerEvent {
    PeerEvent::ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

struct LiveStream {
    tx: mpsc::UnboundedSender<anyhow::Result<PeerEvent>>,
    turns: VecDeque<Vec<PeerEvent>>,
    awaiting: HashSet<String>,
    endless: Option<(String, Value)>,
    emitted: usize,
}

impl LiveStream {
    fn push_turn(&mut self, turn: Vec<PeerEvent>) {
        self.awaiting = turn
            .iter()
            .filter_map(|event| match event {
                PeerEvent::ToolCall { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        for event in turn {
            let _ = self.tx.send(Ok(event));
        }
    }

    fn push_endless_call(&mut self) {
        if let Some((tool, args)) = self.endless.clone() {
            self.emitted += 1;
            let call = tool_call(&format!("call_{}", self.emitted), &tool, args);
            self.push_turn(vec![call]);
        }
    }
}

#[derive(Default)]
struct PeerState {
    scripts: VecDeque<ScriptedSession>,
    live: HashMap<String, LiveStream>,
    requests: Vec<PeerRequest>,
    tool_results: Vec<(String, ToolOutput)>,
}

/// Replays queued sessions in order. Without a script it answers with [`DEFAULT_REPLY`].
#[derive(Default)]
pub struct ScriptedPeer {
    state: Arc<Mutex<PeerState>>,
}

impl ScriptedPeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, session: ScriptedSession) {
        self.state.lock().await.scripts.push_back(session);
    }

    pub async fn requests(&self) -> Vec<PeerRequest> {
        self.state.lock().await.requests.clone()
    }

    pub async fn prompts(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .requests
            .iter()
            .map(|req| req.prompt.clone())
            .collect()
    }

    pub async fn tool_results(&self) -> Vec<(String, ToolOutput)> {
        self.state.lock().await.tool_results.clone()
    }
}

#[async_trait]
impl LlmPeer for ScriptedPeer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: PeerRequest) -> anyhow::Result<PeerSession> {
        let mut state = self.state.lock().await;
        state.requests.push(request);
        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| ScriptedSession::reply(DEFAULT_REPLY));

        let (tx, rx) = mpsc::unbounded_channel();
        let mut live = LiveStream {
            tx,
            turns: VecDeque::new(),
            awaiting: HashSet::new(),
            endless: None,
            emitted: 0,
        };
        let stream_id = format!("stream_{}", Uuid::new_v4().simple());
        match script {
            ScriptedSession::Fail(message) => anyhow::bail!(message),
            ScriptedSession::Hang => {}
            ScriptedSession::Held { release, turns } => {
                live.turns = turns.into();
                let shared = self.state.clone();
                let id = stream_id.clone();
                tokio::spawn(async move {
                    release.notified().await;
                    let mut state = shared.lock().await;
                    if let Some(live) = state.live.get_mut(&id) {
                        if let Some(first) = live.turns.pop_front() {
                            live.push_turn(first);
                        }
                    }
                });
            }
            ScriptedSession::Endless { tool, args } => {
                live.endless = Some((tool, args));
                live.push_endless_call();
            }
            ScriptedSession::Turns(turns) => {
                live.turns = turns.into();
                if let Some(first) = live.turns.pop_front() {
                    live.push_turn(first);
                }
            }
        }

        state.live.insert(stream_id.clone(), live);
        Ok(PeerSession {
            stream_id,
            model: Some("scripted-model".to_string()),
            events: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }

    async fn submit_tool_result(
        &self,
        stream_id: &str,
        call_id: &str,
        output: &ToolOutput,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state
            .tool_results
            .push((call_id.to_string(), output.clone()));
        let Some(live) = state.live.get_mut(stream_id) else {
            anyhow::bail!("unknown stream `{stream_id}`");
        };
        live.awaiting.remove(call_id);
        if !live.awaiting.is_empty() {
            return Ok(());
        }
        if live.endless.is_some() {
            live.push_endless_call();
        } else if let Some(next) = live.turns.pop_front() {
            live.push_turn(next);
        } else {
            live.push_turn(vec![PeerEvent::Final {
                text: None,
                usage: None,
            }]);
        }
        Ok(())
    }
}

/// Collects notifications instead of sending them.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

pub struct TestHarness {
    pub mc: MissionControl,
    pub peer: Arc<ScriptedPeer>,
    pub notifier: Arc<RecordingNotifier>,
    pub dir: PathBuf,
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Builds a core on a fresh temp state dir. `overrides` is merged as the CLI config layer.
pub async fn test_mission_control(overrides: Value) -> anyhow::Result<TestHarness> {
    let dir = std::env::temp_dir().join(format!("mctl-test-{}", Uuid::new_v4()));
    let mut layer = json!({"execution": {"side_effect_max_attempts": 1}});
    crate::deep_merge(&mut layer, &overrides);
    let config = ConfigStore::isolated(&dir, Some(layer)).await?;
    let peer = Arc::new(ScriptedPeer::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let mc = MissionControl::new(&dir, config, peer.clone(), notifier.clone()).await?;
    Ok(TestHarness {
        mc,
        peer,
        notifier,
        dir,
    })
}
