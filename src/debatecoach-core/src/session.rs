//! Session controller.
//!
//! Drives one realtime debate session through `inactive -> connecting ->
//! active -> inactive`, owning every resource acquired on the way. All
//! state sits behind a single async mutex; background tasks (the timer
//! tick, the volume sampler and the peer event pump) only hold a weak
//! handle and stop on their own once the session is torn down.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::context::DebateContext;
use crate::conversation::{ConversationLog, ConversationTurn};
use crate::error::DebateError;
use crate::media::{session_configuration, MediaTransport};
use crate::protocol::{ClientEvent, RawEvent, TokenUsage};
use crate::reconciler::{Reconciler, ToolInvocation};
use crate::timer::SessionTimer;
use crate::tools::{debate_tools, ToolDefinition, ToolRegistry};
use crate::transport::{PeerEvent, TransportDeps};
use crate::volume::VolumeMeter;

pub const STATUS_REQUESTING_MIC: &str = "Requesting microphone access...";
pub const STATUS_FETCHING_TOKEN: &str = "Fetching ephemeral token...";
pub const STATUS_CONNECTING: &str = "Establishing connection...";
pub const STATUS_ESTABLISHED: &str = "Session established";
pub const STATUS_STOPPED: &str = "Session stopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Inactive,
    Connecting,
    Active,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Inactive => "inactive",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Active => "active",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of everything a presentation layer reads.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub status: String,
    pub timer: String,
    pub elapsed_secs: u64,
    pub volume: f32,
    pub conversation: Vec<ConversationTurn>,
    pub events: Vec<RawEvent>,
    pub context: Option<DebateContext>,
    pub show_summary: bool,
    pub usage: TokenUsage,
    pub last_error: Option<String>,
    /// Tool calls answered during this debate, oldest first.
    pub tool_calls: Vec<ToolInvocation>,
}

struct Inner {
    phase: SessionPhase,
    status: String,
    context: Option<DebateContext>,
    conversation: ConversationLog,
    raw_events: Vec<RawEvent>,
    tools: ToolRegistry,
    timer: SessionTimer,
    volume: VolumeMeter,
    transport: MediaTransport,
    usage: TokenUsage,
    last_error: Option<String>,
    show_summary: bool,
    tool_calls: Vec<ToolInvocation>,
    /// Set once the session configuration went out on the open channel.
    configured: bool,
    /// Bumped on every start so work from an earlier attempt can tell it is stale.
    generation: u64,
    cancel: CancellationToken,
    timer_task: Option<JoinHandle<()>>,
    volume_task: Option<JoinHandle<()>>,
    event_pump: Option<JoinHandle<()>>,
}

impl Inner {
    /// Tear down in order: timer, control channel, peer connection,
    /// microphone, volume sampling.
    async fn release_resources(&mut self) {
        tracing::debug!(
            microphone = self.transport.has_microphone(),
            peer = self.transport.has_peer(),
            "Releasing session resources"
        );
        self.configured = false;
        if let Some(task) = self.timer_task.take() {
            task.abort();
        }
        self.timer.stop();
        self.transport.release().await;
        if let Some(task) = self.event_pump.take() {
            task.abort();
        }
        if let Some(task) = self.volume_task.take() {
            task.abort();
        }
        self.volume.detach();
    }

    fn handle_message(&mut self, text: &str) {
        let mut reconciler = Reconciler::new(&mut self.conversation, &self.tools);
        match reconciler.handle_message(text, &mut self.raw_events) {
            Ok(outcome) => {
                if let Some(usage) = outcome.usage {
                    self.usage = usage;
                }
                if let Some(error) = outcome.error {
                    self.last_error = Some(error);
                }
                if let Some(invocation) = outcome.invocation {
                    self.tool_calls.push(invocation);
                }
                if let Err(e) = self.transport.send_all(&outcome.outbound) {
                    tracing::warn!(error = %e, "Failed to send reply on control channel");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Skipping malformed control message"),
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    config: Config,
    declared_tools: Vec<ToolDefinition>,
    phase_tx: watch::Sender<SessionPhase>,
    ready_tx: watch::Sender<bool>,
    /// Mirror of the current start generation, readable without the lock.
    generation: AtomicU64,
}

/// Cheaply cloneable handle to one session.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// A controller that declares the built-in debate tools to the model.
    pub fn new(config: Config, deps: TransportDeps) -> Self {
        Self::with_declared_tools(config, deps, debate_tools())
    }

    pub fn with_declared_tools(
        config: Config,
        deps: TransportDeps,
        declared_tools: Vec<ToolDefinition>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Inactive);
        let (ready_tx, _) = watch::channel(false);
        let inner = Inner {
            phase: SessionPhase::Inactive,
            status: String::new(),
            context: None,
            conversation: ConversationLog::new(),
            raw_events: Vec::new(),
            tools: ToolRegistry::new(),
            timer: SessionTimer::new(),
            volume: VolumeMeter::new(),
            transport: MediaTransport::new(deps),
            usage: TokenUsage::default(),
            last_error: None,
            show_summary: false,
            tool_calls: Vec::new(),
            configured: false,
            generation: 0,
            cancel: CancellationToken::new(),
            timer_task: None,
            volume_task: None,
            event_pump: None,
        };
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                config,
                declared_tools,
                phase_tx,
                ready_tx,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Watch phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.shared.phase_tx.subscribe()
    }

    /// Watch whether the control channel is open and configured, which is
    /// when `send_text` starts accepting messages.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.shared.ready_tx.subscribe()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.shared.inner.lock().await.phase
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.shared.inner.lock().await;
        SessionSnapshot {
            phase: inner.phase,
            status: inner.status.clone(),
            timer: inner.timer.display().to_string(),
            elapsed_secs: inner.timer.elapsed_secs(),
            volume: inner.volume.level(),
            conversation: inner.conversation.snapshot(),
            events: inner.raw_events.clone(),
            context: inner.context.clone(),
            show_summary: inner.show_summary,
            usage: inner.usage,
            last_error: inner.last_error.clone(),
            tool_calls: inner.tool_calls.clone(),
        }
    }

    fn set_phase(&self, inner: &mut Inner, phase: SessionPhase) {
        if inner.phase != phase {
            tracing::debug!(from = %inner.phase, to = %phase, "Session phase change");
        }
        inner.phase = phase;
        self.shared.phase_tx.send_replace(phase);
    }

    /// Start a session. Does nothing unless the session is inactive.
    ///
    /// A context given here is kept for the whole session; `None` keeps
    /// whatever context was set before. Failures never escape: they end in
    /// the inactive phase with an `Error: ...` status.
    pub async fn start(&self, context: Option<DebateContext>) {
        let (token, context) = {
            let mut inner = self.shared.inner.lock().await;
            if inner.phase != SessionPhase::Inactive {
                tracing::debug!(phase = %inner.phase, "Start ignored, session already running");
                return;
            }
            if context.is_some() {
                inner.context = context;
            }
            inner.generation += 1;
            self.shared.generation.store(inner.generation, Ordering::SeqCst);
            inner.cancel = CancellationToken::new();
            inner.show_summary = false;
            inner.last_error = None;
            self.set_phase(&mut inner, SessionPhase::Connecting);

            inner.timer.start();
            let generation = inner.generation;
            inner.timer_task = Some(self.spawn_timer(generation));
            inner.status = STATUS_REQUESTING_MIC.to_string();

            tracing::info!(
                topic = inner.context.as_ref().map(|c| c.topic.as_str()).unwrap_or("-"),
                "Starting session"
            );
            (inner.cancel.clone(), inner.context.clone())
        };

        let result = self.connect(&token, context.as_ref()).await;

        let mut inner = self.shared.inner.lock().await;
        if token.is_cancelled() {
            tracing::debug!("Session stopped while connecting");
            return;
        }
        match result {
            Ok(()) => {
                inner.status = STATUS_ESTABLISHED.to_string();
                self.set_phase(&mut inner, SessionPhase::Active);
                tracing::info!("Session established");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start session");
                inner.status = format!("Error: {}", e);
                inner.last_error = Some(e.to_string());
                inner.cancel.cancel();
                self.teardown(&mut inner).await;
                inner.conversation.clear_ephemeral_user();
                self.set_phase(&mut inner, SessionPhase::Inactive);
            }
        }
    }

    /// The connect sequence. Returns early, without error, once `token` is
    /// cancelled; whatever was acquired by then is released.
    async fn connect(
        &self,
        token: &CancellationToken,
        context: Option<&DebateContext>,
    ) -> Result<(), DebateError> {
        let deps = self.shared.inner.lock().await.transport.deps().clone();

        let mut microphone = deps.media.acquire_microphone().await?;
        {
            let mut inner = self.shared.inner.lock().await;
            if token.is_cancelled() {
                microphone.stop();
                return Ok(());
            }
            inner.transport.adopt_microphone(microphone);
            inner.status = STATUS_FETCHING_TOKEN.to_string();
        }

        let credential = deps.issuer.issue(context).await?;

        let offer = {
            let mut inner = self.shared.inner.lock().await;
            if token.is_cancelled() {
                return Ok(());
            }
            inner.status = STATUS_CONNECTING.to_string();
            let events = inner.transport.open_peer().await?;
            let generation = inner.generation;
            inner.event_pump = Some(self.spawn_event_pump(generation, events));
            inner.transport.create_offer().await?
        };

        let answer = deps.signaling.exchange(&offer, &credential).await?;

        let mut inner = self.shared.inner.lock().await;
        if token.is_cancelled() {
            return Ok(());
        }
        inner.transport.accept_answer(&answer).await?;
        Ok(())
    }

    /// Stop the session and release everything it holds. Does nothing
    /// when already inactive.
    pub async fn stop(&self) {
        self.stop_session(None).await;
    }

    /// Stop, but only if the session started as `generation` is still the
    /// current one.
    async fn stop_generation(&self, generation: u64) {
        self.stop_session(Some(generation)).await;
    }

    async fn stop_session(&self, generation: Option<u64>) {
        let mut inner = self.shared.inner.lock().await;
        if inner.phase == SessionPhase::Inactive {
            return;
        }
        if generation.is_some_and(|g| g != inner.generation) {
            tracing::debug!("Ignoring stop aimed at an earlier session");
            return;
        }
        inner.cancel.cancel();
        self.teardown(&mut inner).await;
        inner.conversation.clear_ephemeral_user();
        inner.status = STATUS_STOPPED.to_string();
        inner.show_summary = true;
        self.set_phase(&mut inner, SessionPhase::Inactive);
        tracing::info!(elapsed = %inner.timer.display(), turns = inner.conversation.len(), "Session stopped");
    }

    async fn teardown(&self, inner: &mut Inner) {
        inner.release_resources().await;
        self.shared.ready_tx.send_replace(false);
    }

    /// Stop when active, start when inactive, ignore while connecting.
    pub async fn toggle(&self) {
        match self.phase().await {
            SessionPhase::Active => self.stop().await,
            SessionPhase::Inactive => self.start(None).await,
            SessionPhase::Connecting => tracing::debug!("Toggle ignored while connecting"),
        }
    }

    /// Send a typed user message and ask the model to respond.
    pub async fn send_text(&self, text: &str) -> Result<(), DebateError> {
        if text.trim().is_empty() {
            return Err(DebateError::EmptyMessage);
        }
        let mut inner = self.shared.inner.lock().await;
        if !inner.configured || !inner.transport.is_channel_open() {
            tracing::warn!("Cannot send message, control channel not open");
            return Err(DebateError::ChannelNotOpen);
        }
        inner.conversation.push_final_user(text);
        inner
            .transport
            .send_all(&[ClientEvent::user_text(text), ClientEvent::continue_response()])
    }

    /// Register a callback for a function the model may call.
    pub async fn register_tool<F>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut inner = self.shared.inner.lock().await;
        if inner.tools.contains(&name) {
            tracing::debug!(tool = %name, "Replacing tool");
        } else {
            tracing::debug!(tool = %name, "Registering tool");
        }
        inner.tools.register(name, callback);
    }

    /// Register `end_debate` and `time_warning`.
    ///
    /// `end_debate` acknowledges immediately and stops the session after the
    /// configured grace period, giving the model time to finish speaking. A
    /// session started in the meantime is left alone.
    pub async fn register_debate_tools(&self) {
        let weak = Arc::downgrade(&self.shared);
        let grace = Duration::from_millis(self.shared.config.session.end_debate_grace_ms);

        self.register_tool("end_debate", move |args| {
            let reason = args
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unspecified")
                .to_string();
            let runtime = tokio::runtime::Handle::try_current().map_err(|e| e.to_string())?;
            let controller = SessionController::upgrade(&weak).ok_or("Session is gone")?;
            let generation = controller.shared.generation.load(Ordering::SeqCst);
            tracing::info!(reason = %reason, generation, "Model ended the debate");

            runtime.spawn(async move {
                tokio::time::sleep(grace).await;
                controller.stop_generation(generation).await;
            });
            Ok(json!({"success": true, "message": "Debate ended"}))
        })
        .await;

        self.register_tool("time_warning", |args| {
            let remaining = args.get("remaining_seconds").cloned().unwrap_or(Value::Null);
            tracing::info!(remaining = %remaining, "Time warning issued");
            Ok(json!({
                "success": true,
                "message": "Time warning issued",
                "remaining_seconds": remaining,
            }))
        })
        .await;
    }

    /// Clear the finished debate so a new one can be set up. Only acts
    /// while inactive; returns whether anything was reset.
    pub async fn reset_for_new_debate(&self) -> bool {
        let mut inner = self.shared.inner.lock().await;
        if inner.phase != SessionPhase::Inactive {
            tracing::warn!(phase = %inner.phase, "Reset ignored while session is running");
            return false;
        }
        inner.conversation.clear();
        inner.raw_events.clear();
        inner.timer.reset();
        inner.context = None;
        inner.show_summary = false;
        inner.usage = TokenUsage::default();
        inner.last_error = None;
        inner.tool_calls.clear();
        inner.status.clear();
        true
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn spawn_timer(&self, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let period = Duration::from_millis(self.shared.config.session.timer_tick_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                let mut inner = shared.inner.lock().await;
                if inner.generation != generation || !inner.timer.is_running() {
                    break;
                }
                inner.timer.tick();
            }
        })
    }

    fn spawn_volume_sampler(&self, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let period = Duration::from_millis(self.shared.config.session.volume_tick_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                let mut inner = shared.inner.lock().await;
                if inner.generation != generation || !inner.volume.is_attached() {
                    break;
                }
                inner.volume.sample();
            }
        })
    }

    fn spawn_event_pump(
        &self,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(controller) = SessionController::upgrade(&weak) else {
                    break;
                };
                if !controller.handle_peer_event(generation, event).await {
                    break;
                }
            }
            tracing::debug!("Peer event stream ended");
        })
    }

    /// Returns false once the pump should stop.
    async fn handle_peer_event(&self, generation: u64, event: PeerEvent) -> bool {
        tracing::trace!(event = ?event, "Peer event");
        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation || inner.phase == SessionPhase::Inactive {
            return false;
        }

        match event {
            PeerEvent::ChannelMessage(text) => inner.handle_message(&text),
            PeerEvent::ChannelOpen => {
                let events = session_configuration(
                    &self.shared.config,
                    &self.shared.declared_tools,
                    inner.context.as_ref(),
                );
                match inner.transport.send_all(&events) {
                    Ok(()) => {
                        inner.configured = true;
                        self.shared.ready_tx.send_replace(true);
                        tracing::info!("Control channel open, session configured");
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to configure session"),
                }
            }
            PeerEvent::TrackAdded(probe) => {
                inner.volume.attach(probe);
                if let Some(previous) = inner.volume_task.take() {
                    previous.abort();
                }
                inner.volume_task = Some(self.spawn_volume_sampler(generation));
                tracing::debug!("Remote audio track attached");
            }
            PeerEvent::ChannelClosed => {
                inner.configured = false;
                self.shared.ready_tx.send_replace(false);
                tracing::info!("Control channel closed");
            }
            PeerEvent::Disconnected => {
                tracing::warn!("Peer connection lost, stopping session");
                let controller = self.clone();
                tokio::spawn(async move { controller.stop_generation(generation).await });
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("declared_tools", &self.shared.declared_tools.len())
            .finish()
    }
}
