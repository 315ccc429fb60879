//! The relay service: owns every component and orchestrates a turn from
//! intake to fan-out.
//!
//! A voice turn flows: intake -> peer auth (gateway) -> busy gate -> STT ->
//! chat append -> agent submit -> (permission interludes) -> completion ->
//! optional TTS -> speaking -> acknowledgement. Text turns skip STT. All
//! the slow parts run on their own tasks; handlers return as soon as the
//! turn is accepted.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use hark_agent::{AgentProcess, AgentUpdate, SubmitError, TurnError};
use hark_speech::stt::{SttClient, TranscribeOptions};
use hark_speech::tts::TtsClient;
use hark_speech::SpeechError;
use hark_types::{
    BusEvent, ChatRole, ConfigPatch, PermissionDecision, PromptKind, RelayConfig, RelayError,
    RelayStatus, ResponseMode, StepStatus, Turn, TurnId, TurnOrigin, TurnStatus, TurnStep,
};

use crate::audio_store::AudioStore;
use crate::broker::{BrokerConfig, PermissionBroker};
use crate::bus::EventBus;
use crate::config_store::ConfigStore;
use crate::guard::DuplicateGuard;
use crate::peer_auth::PeerAuth;
use crate::state::{spawn_aggregator, StateHandle, DEFAULT_CHAT_CAPACITY};
use crate::turns::TurnStore;

/// Upload size cap for `/transcribe`.
pub const DEFAULT_UPLOAD_CAP: usize = 25 * 1024 * 1024;

/// How often the background reaper sweeps artifacts and resolved
/// permission requests.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline on a single STT or TTS call.
const SPEECH_DEADLINE: Duration = Duration::from_secs(30);

/// Consecutive-crash threshold: this many exits inside the window is an
/// unrecoverable child failure.
const CRASH_LIMIT: usize = 5;
const CRASH_WINDOW: Duration = Duration::from_secs(60);

/// What an accepted submission hands back to the gateway.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub turn: Turn,
    pub transcript: String,
    pub response_mode: ResponseMode,
}

/// Everything the relay needs from the outside world.
pub struct RelayDeps {
    pub stt: SttClient,
    pub tts: TtsClient,
    pub auth: Arc<PeerAuth>,
    pub agent: AgentProcess,
    pub agent_updates: mpsc::UnboundedReceiver<AgentUpdate>,
    pub work_dir: PathBuf,
    pub relay_config: RelayConfig,
    /// Body cap for `/transcribe`.
    pub upload_cap: usize,
}

/// The root server value threaded into every handler.
pub struct Relay {
    pub bus: EventBus,
    pub state: StateHandle,
    pub turns: Arc<TurnStore>,
    pub audio: Arc<AudioStore>,
    pub guard: DuplicateGuard,
    pub config: ConfigStore,
    pub broker: Arc<PermissionBroker>,
    pub agent: AgentProcess,
    pub auth: Arc<PeerAuth>,
    pub stt: SttClient,
    pub tts: TtsClient,
    pub work_dir: PathBuf,
    pub max_upload_bytes: usize,
    fatal_tx: watch::Sender<bool>,
    crash_times: Mutex<VecDeque<Instant>>,
}

impl Relay {
    /// Build the relay and spawn its background tasks (aggregator, agent
    /// supervisor, reaper).
    ///
    /// The returned watch receiver flips to `true` when the child has
    /// failed unrecoverably and the process should exit with code 70.
    pub fn start(deps: RelayDeps) -> (Arc<Relay>, watch::Receiver<bool>) {
        let bus = EventBus::default();
        let state = spawn_aggregator(bus.clone(), DEFAULT_CHAT_CAPACITY);
        let turns = Arc::new(TurnStore::default());
        let broker = PermissionBroker::new(
            BrokerConfig::default(),
            bus.clone(),
            state.clone(),
            Arc::clone(&turns),
        );
        let (fatal_tx, fatal_rx) = watch::channel(false);

        let agent_model = deps.relay_config.agent_model.clone();
        deps.agent.set_model(agent_model);

        let relay = Arc::new(Relay {
            bus,
            state,
            turns,
            audio: Arc::new(AudioStore::default()),
            guard: DuplicateGuard::default(),
            config: ConfigStore::new(deps.relay_config),
            broker,
            agent: deps.agent,
            auth: deps.auth,
            stt: deps.stt,
            tts: deps.tts,
            work_dir: deps.work_dir,
            max_upload_bytes: deps.upload_cap,
            fatal_tx,
            crash_times: Mutex::new(VecDeque::new()),
        });

        relay.spawn_supervisor(deps.agent_updates);
        relay.spawn_reaper();
        (relay, fatal_rx)
    }

    // -----------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------

    /// Accept an audio upload: transcribe it and, when speech was found,
    /// launch the agent turn asynchronously.
    pub async fn submit_voice(
        self: &Arc<Self>,
        audio: Vec<u8>,
        mode_override: Option<ResponseMode>,
    ) -> Result<Accepted, RelayError> {
        let format = hark_speech::validate_audio(&audio).map_err(|e| match e {
            SpeechError::EmptyAudio => RelayError::BadRequest("audio data is empty".into()),
            SpeechError::UnknownFormat => {
                RelayError::BadRequest("unrecognized audio format".into())
            }
            other => RelayError::Internal(other.to_string()),
        })?;
        if self.agent_busy() {
            return Err(RelayError::Busy);
        }

        let config = self.config.get();
        let response_mode = mode_override.unwrap_or(config.response_mode);
        let turn = self.turns.create(TurnOrigin::Voice, response_mode);
        let id = turn.id.clone();
        self.turns.push_step(
            &id,
            TurnStep::new("received", "Received", StepStatus::Completed)
                .with_detail(format!("{} bytes, {}", audio.len(), format.mime_type())),
        );
        self.state
            .set_status(RelayStatus::Listening, Some(id.clone()));

        let opts = TranscribeOptions::from(&config);
        let started = Instant::now();
        let result = tokio::time::timeout(
            SPEECH_DEADLINE,
            self.stt.transcribe(&audio, format, &opts),
        )
        .await
        .map_err(|_| RelayError::Timeout)
        .and_then(|r| r.map_err(|e| RelayError::Unavailable(e.to_string())));
        let transcript = match result {
            Ok(transcript) => transcript,
            Err(e) => {
                let message = e.to_string();
                tracing::error!(turn_id = %id, error = %message, "transcription failed");
                self.turns.fail(&id, &message);
                self.state.set_status(RelayStatus::Idle, None);
                self.bus.publish(BusEvent::Error {
                    turn_id: Some(id),
                    kind: e.code().to_string(),
                    message,
                });
                return Err(e);
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.turns.with_turn(&id, |t| {
            t.transcript = transcript.clone();
            let mut step = TurnStep::new("transcribed", "Transcribed", StepStatus::Completed)
                .with_detail(if transcript.is_empty() {
                    "no speech detected".to_string()
                } else {
                    transcript.clone()
                });
            step.duration_ms = Some(duration_ms);
            t.push_step(step);
        });
        tracing::info!(turn_id = %id, chars = transcript.chars().count(), "transcript ready");

        if transcript.is_empty() {
            // No speech: the turn completes without ever touching the agent.
            self.turns.with_turn(&id, |t| {
                t.status = TurnStatus::Completed;
                t.push_step(
                    TurnStep::new("agent", "Agent", StepStatus::Skipped)
                        .with_detail("no speech detected"),
                );
            });
            self.state.set_status(RelayStatus::Idle, None);
            let turn = self.turns.get(&id).unwrap_or(turn);
            return Ok(Accepted {
                turn,
                transcript,
                response_mode,
            });
        }

        if let Err(e) = self.guard.check_and_record(&transcript) {
            // Duplicate: drop the intake turn so exactly one submission in
            // the window produced one.
            self.turns.remove(&id);
            self.state.set_status(RelayStatus::Idle, None);
            return Err(e);
        }

        let relay = Arc::clone(self);
        let run_id = id.clone();
        let text = transcript.clone();
        tokio::spawn(async move {
            relay.run_turn(run_id, text, response_mode).await;
        });

        let turn = self.turns.get(&id).unwrap_or(turn);
        Ok(Accepted {
            turn,
            transcript,
            response_mode,
        })
    }

    /// Accept a text submission (the phone app's path).
    pub async fn submit_text(
        self: &Arc<Self>,
        text: &str,
        mode_override: Option<ResponseMode>,
    ) -> Result<Accepted, RelayError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RelayError::BadRequest("no text provided".into()));
        }
        // Cooldown first so a duplicate reads as a duplicate even while the
        // original turn is still thinking; record only once accepted.
        self.guard.check(text)?;
        if self.agent_busy() {
            return Err(RelayError::Busy);
        }
        self.guard.record(text);

        let config = self.config.get();
        let response_mode = mode_override.unwrap_or(config.response_mode);
        let turn = self.turns.create(TurnOrigin::Text, response_mode);
        let id = turn.id.clone();
        self.turns.with_turn(&id, |t| {
            t.transcript = text.to_string();
            t.push_step(
                TurnStep::new("received", "Received", StepStatus::Completed)
                    .with_detail(format!("text message: {} chars", text.chars().count())),
            );
        });

        let relay = Arc::clone(self);
        let run_id = id.clone();
        let prompt = text.to_string();
        tokio::spawn(async move {
            relay.run_turn(run_id, prompt, response_mode).await;
        });

        let turn = self.turns.get(&id).unwrap_or(turn);
        Ok(Accepted {
            turn,
            transcript: text.to_string(),
            response_mode,
        })
    }

    fn agent_busy(&self) -> bool {
        self.agent.state() == hark_agent::AgentState::BusyThinking
    }

    // -----------------------------------------------------------------
    // Turn execution
    // -----------------------------------------------------------------

    async fn run_turn(self: Arc<Self>, id: TurnId, text: String, response_mode: ResponseMode) {
        self.state
            .set_status(RelayStatus::Thinking, Some(id.clone()));
        self.state.append_chat(ChatRole::User, text.clone());

        if !self.agent.state().is_running() {
            if let Err(e) = self.agent.start().await {
                self.finish_failed(&id, "unavailable", &e.to_string());
                return;
            }
        }

        self.turns.push_step(
            &id,
            TurnStep::new("agent", "Agent", StepStatus::InProgress)
                .with_detail("prompt submitted"),
        );

        let receiver = match self.agent.submit(&id, &text).await {
            Ok(receiver) => receiver,
            Err(SubmitError::Busy) => {
                self.finish_failed(&id, "busy", "agent is busy with another turn");
                return;
            }
            Err(e) => {
                self.finish_failed(&id, "unavailable", &e.to_string());
                return;
            }
        };

        match tokio::time::timeout(self.agent.turn_timeout(), receiver).await {
            Err(_) => {
                tracing::error!(turn_id = %id, "turn timed out, aborting");
                let _ = self.agent.abort().await;
                self.finish_failed(&id, "timeout", "timed out waiting for the agent");
            }
            Ok(Err(_)) => {
                self.finish_failed(&id, "internal", "agent dropped the turn");
            }
            Ok(Ok(Err(TurnError::Aborted))) => {
                self.turns.with_turn(&id, |t| {
                    if !t.status.is_terminal() {
                        t.status = TurnStatus::Aborted;
                        t.update_step("agent", |s| {
                            s.status = StepStatus::Error;
                            s.detail = Some("aborted".into());
                        });
                    }
                });
                self.state.set_status(RelayStatus::Idle, None);
                self.bus.publish(BusEvent::Error {
                    turn_id: Some(id),
                    kind: "aborted".into(),
                    message: "turn aborted".into(),
                });
            }
            Ok(Ok(Err(TurnError::AgentExited))) => {
                self.broker.deny_all("agent terminated");
                self.finish_failed(&id, "unavailable", "agent process exited mid-turn");
            }
            Ok(Ok(Ok(result))) => {
                self.finish_completed(&id, result, response_mode).await;
            }
        }
    }

    fn finish_failed(&self, id: &TurnId, kind: &str, message: &str) {
        tracing::error!(turn_id = %id, kind, message, "turn failed");
        self.turns.fail(id, message);
        self.turns.update_step(id, "agent", |s| {
            if s.status == StepStatus::InProgress {
                s.status = StepStatus::Error;
                s.detail = Some(message.to_string());
            }
        });
        self.state.set_status(RelayStatus::Idle, None);
        self.bus.publish(BusEvent::Error {
            turn_id: Some(id.clone()),
            kind: kind.to_string(),
            message: message.to_string(),
        });
    }

    async fn finish_completed(&self, id: &TurnId, result: String, response_mode: ResponseMode) {
        self.turns.update_step(id, "agent", |s| {
            s.status = StepStatus::Completed;
            s.detail = Some(format!("finished ({} chars)", result.chars().count()));
        });
        if !result.is_empty() {
            self.state.append_chat(ChatRole::Assistant, result.clone());
        }

        match response_mode {
            ResponseMode::Disabled => {
                self.turns.with_turn(id, |t| t.status = TurnStatus::Completed);
                self.state.set_status(RelayStatus::Idle, None);
            }
            ResponseMode::Text => {
                self.turns.with_turn(id, |t| {
                    t.response_text = Some(result.clone());
                    t.status = TurnStatus::Completed;
                    t.push_step(
                        TurnStep::new("response_ready", "Response Ready", StepStatus::Completed)
                            .with_detail("type: text"),
                    );
                });
                self.state.set_status(RelayStatus::Idle, None);
            }
            ResponseMode::Audio => {
                self.turns
                    .with_turn(id, |t| t.response_text = Some(result.clone()));
                if result.is_empty() {
                    self.turns.with_turn(id, |t| t.status = TurnStatus::Completed);
                    self.state.set_status(RelayStatus::Idle, None);
                    return;
                }
                self.synthesize_response(id, &result).await;
            }
        }
    }

    async fn synthesize_response(&self, id: &TurnId, result: &str) {
        self.turns.push_step(
            id,
            TurnStep::new("tts", "Generating Audio", StepStatus::InProgress),
        );
        let config = self.config.get();
        let synthesized: Result<Vec<u8>, String> = match tokio::time::timeout(
            SPEECH_DEADLINE,
            self.tts
                .synthesize(result, &config.tts_voice, config.tts_max_chars),
        )
        .await
        {
            Err(_) => Err("timed out".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(bytes)) => Ok(bytes),
        };
        match synthesized {
            Ok(bytes) => {
                let stored = self.audio.put(id, bytes, "audio/mpeg");
                match stored {
                    Ok(()) => {
                        self.turns.with_turn(id, |t| {
                            t.audio_artifact_id = Some(id.clone());
                            t.status = TurnStatus::Speaking;
                            t.update_step("tts", |s| {
                                s.status = StepStatus::Completed;
                                s.detail = Some("audio generated".into());
                            });
                            t.push_step(
                                TurnStep::new(
                                    "response_ready",
                                    "Response Ready",
                                    StepStatus::Completed,
                                )
                                .with_detail("type: audio"),
                            );
                        });
                        self.state
                            .set_status(RelayStatus::Speaking, Some(id.clone()));
                    }
                    Err(e) => {
                        self.settle_tts_failure(id, &e.to_string());
                    }
                }
            }
            Err(message) => {
                tracing::error!(turn_id = %id, error = %message, "speech synthesis failed");
                self.settle_tts_failure(id, &message);
            }
        }
    }

    /// A TTS failure degrades the turn to a text response.
    fn settle_tts_failure(&self, id: &TurnId, message: &str) {
        self.turns.with_turn(id, |t| {
            t.status = TurnStatus::Completed;
            t.update_step("tts", |s| {
                s.status = StepStatus::Error;
                s.detail = Some(message.to_string());
            });
        });
        self.state.set_status(RelayStatus::Idle, None);
        self.bus.publish(BusEvent::Error {
            turn_id: Some(id.clone()),
            kind: "unavailable".into(),
            message: format!("speech synthesis failed: {message}"),
        });
    }

    // -----------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------

    /// Acknowledge a turn's response: evict its audio artifact and return
    /// to idle if we were speaking it.
    pub async fn ack(&self, id: &TurnId) -> Result<(), RelayError> {
        self.turns.ack(id).ok_or(RelayError::NotFound)?;
        self.audio.remove(id);
        tracing::info!(turn_id = %id, "response acknowledged");

        let snapshot = self.state.snapshot().await;
        if snapshot.status == RelayStatus::Speaking && snapshot.turn_id.as_ref() == Some(id) {
            self.state.set_status(RelayStatus::Idle, None);
        }
        Ok(())
    }

    /// Abort the current turn. In-flight transcription is left to finish;
    /// only the agent is interrupted.
    pub async fn abort(&self) -> Result<bool, RelayError> {
        self.agent
            .abort()
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))
    }

    /// Restart the child: deny pending permissions, relaunch, clear chat.
    pub async fn restart_agent(&self) -> Result<(), RelayError> {
        self.broker.deny_all("agent terminated");
        self.agent
            .restart()
            .await
            .map_err(|e| RelayError::Unavailable(e.to_string()))?;
        self.state.clear_chat();
        self.state.set_status(RelayStatus::Idle, None);
        tracing::info!("agent restarted");
        Ok(())
    }

    /// Answer the active prompt with an option number.
    pub async fn respond_prompt(&self, option: u32) -> Result<(), RelayError> {
        let snapshot = self.state.snapshot().await;
        let prompt = snapshot.prompt.ok_or(RelayError::NotFound)?;
        match prompt.kind {
            PromptKind::Permission => {
                let request_id = prompt.permission_request_id.ok_or_else(|| {
                    RelayError::Internal("permission prompt without request id".into())
                })?;
                let decision = if option == 1 {
                    PermissionDecision::Allow
                } else {
                    PermissionDecision::Deny
                };
                self.broker.respond(&request_id, decision, None)
            }
            PromptKind::AgentPrompt => {
                let turn_id = snapshot.turn_id.ok_or(RelayError::NotFound)?;
                self.agent
                    .respond_option(&turn_id, option)
                    .await
                    .map_err(|e| RelayError::Unavailable(e.to_string()))?;
                self.state.resolve_prompt(prompt.id);
                Ok(())
            }
        }
    }

    /// Patch the live configuration; a changed agent model applies on the
    /// next (re)launch.
    pub fn patch_config(&self, patch: &ConfigPatch) -> Result<RelayConfig, Vec<String>> {
        let updated = self.config.patch(patch)?;
        self.agent.set_model(updated.agent_model.clone());
        Ok(updated)
    }

    /// Orderly shutdown of the child before process exit.
    pub async fn shutdown(&self) {
        self.broker.deny_all("agent terminated");
        self.agent.shutdown().await;
    }

    // -----------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------

    fn spawn_supervisor(self: &Arc<Self>, mut updates: mpsc::UnboundedReceiver<AgentUpdate>) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                match update {
                    AgentUpdate::Event(event) => relay.handle_agent_event(event).await,
                    AgentUpdate::StateChanged(_) => {}
                    AgentUpdate::Exited { clean } => relay.handle_agent_exit(clean).await,
                }
            }
            tracing::debug!("agent supervisor stopped");
        });
    }

    async fn handle_agent_event(&self, event: hark_agent::AgentEvent) {
        use hark_agent::AgentEvent::*;
        match event {
            TextChunk { turn_id, delta } => {
                self.bus.publish(BusEvent::TextChunk {
                    turn_id,
                    text: delta,
                });
            }
            ToolUse { name, summary } => {
                self.bus.publish(BusEvent::ToolInvoked {
                    name: name.clone(),
                    summary: summary.clone(),
                });
                if let Some(turn_id) = self.state.snapshot().await.turn_id {
                    self.turns.push_step(
                        &turn_id,
                        TurnStep::new("tool", &format!("Tool: {name}"), StepStatus::Completed)
                            .with_detail(summary),
                    );
                }
            }
            Prompt { question, options } => {
                let prompt = hark_types::Prompt {
                    id: TurnId::generate().to_string(),
                    kind: PromptKind::AgentPrompt,
                    title: None,
                    context: None,
                    question,
                    options,
                    timestamp: chrono::Utc::now(),
                    deadline: None,
                    permission_request_id: None,
                };
                self.state.post_prompt(prompt);
            }
            Usage(usage) => self.state.set_usage(usage),
            MessageEnd { .. } | Aborted { .. } | Unknown { .. } => {}
        }
    }

    async fn handle_agent_exit(self: &Arc<Self>, clean: bool) {
        self.broker.deny_all("agent terminated");
        self.state.set_status(RelayStatus::Idle, None);
        self.bus.publish(BusEvent::Error {
            turn_id: None,
            kind: "agent_exited".into(),
            message: format!("agent process exited ({})", if clean { "clean" } else { "crashed" }),
        });

        let over_limit = {
            let mut times = self.crash_times.lock().expect("crash lock poisoned");
            let now = Instant::now();
            times.push_back(now);
            while times
                .front()
                .is_some_and(|t| now.duration_since(*t) > CRASH_WINDOW)
            {
                times.pop_front();
            }
            times.len() >= CRASH_LIMIT
        };
        if over_limit {
            tracing::error!("agent keeps exiting, declaring unrecoverable failure");
            let _ = self.fatal_tx.send(true);
            return;
        }

        tracing::warn!(clean, "agent exited, relaunching");
        if let Err(e) = self.agent.restart().await {
            tracing::error!(error = %e, "agent relaunch failed");
            let _ = self.fatal_tx.send(true);
        }
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                for id in relay.audio.reap() {
                    relay.turns.with_turn(&id, |t| {
                        if t.status == TurnStatus::Speaking {
                            t.status = TurnStatus::Completed;
                        }
                        t.audio_artifact_id = None;
                    });
                    let snapshot = relay.state.snapshot().await;
                    if snapshot.status == RelayStatus::Speaking
                        && snapshot.turn_id.as_ref() == Some(&id)
                    {
                        relay.state.set_status(RelayStatus::Idle, None);
                    }
                }
                relay.broker.expire();
            }
        });
    }
}
