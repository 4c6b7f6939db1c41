//! Extension host session: handshake sequencing, the Active-state message
//! pump and strictly ordered teardown.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::handshake::{EnvironmentInfo, HandshakeMessage, InitPayload, WorkspaceInfo};
use super::state::{SessionState, StateCell};
use crate::config::GlobalConfig;
use crate::extensions::ExtensionCatalog;
use crate::protocol::{ChannelEvent, ChannelOptions, FramedChannel, FramedSender, HealthSnapshot};
use crate::rpc::{ResourceUri, RpcProtocol};
use crate::services::host::HostServices;
use crate::services::proxies::ExtensionServiceProxy;
use crate::services::{Direction, CATALOG_VERSION};
use crate::supervisor::{ProcessState, ProcessSupervisor, SupervisorConfig};
use crate::transport::{Connection, ConnectionTarget, TransportKind, TransportListener};
use crate::{AppError, Result};

/// Bound on waiting for tracked session tasks during teardown.
const TASK_DRAIN: Duration = Duration::from_secs(2);

/// Activation reason sent for modules listed in `activate`.
const STARTUP_REASON: &str = "startup";

/// Activation reason sent for [`ExtensionHostSession::activate_guest_module`].
const API_REASON: &str = "api";

#[derive(Default)]
struct Links {
    listener: Option<TransportListener>,
    channel: Option<Arc<FramedChannel>>,
    rpc: Option<RpcProtocol>,
}

struct SessionInner {
    id: String,
    config: GlobalConfig,
    catalog: ExtensionCatalog,
    host_services: HostServices,
    supervisor: ProcessSupervisor,
    state: StateCell,
    links: Mutex<Links>,
    failure: Mutex<Option<String>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// One extension host session bound to a workspace.
///
/// Cheap to clone; clones share the session. This is the whole surface the
/// product layer uses: it never touches frames or sockets.
#[derive(Clone)]
pub struct ExtensionHostSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ExtensionHostSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHostSession")
            .field("id", &self.inner.id)
            .field("state", &self.status())
            .finish_non_exhaustive()
    }
}

impl ExtensionHostSession {
    /// Create a session for `config` with a fixed extension `catalog`.
    #[must_use]
    pub fn new(config: GlobalConfig, catalog: ExtensionCatalog) -> Self {
        let host_services = HostServices::from_config(&config);
        let supervisor = ProcessSupervisor::new(SupervisorConfig::from_global(&config));
        Self {
            inner: Arc::new(SessionInner {
                id: uuid::Uuid::new_v4().to_string(),
                config,
                catalog,
                host_services,
                supervisor,
                state: StateCell::default(),
                links: Mutex::new(Links::default()),
                failure: Mutex::new(None),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Session id used in logs and the init payload.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Launch (or dial) the guest and run the handshake to `Active`.
    ///
    /// # Errors
    ///
    /// - `AppError::Session` if the session was already started.
    /// - `AppError::Setup` / `AppError::Transport` if launching or
    ///   connecting fails, or the handshake does not complete in time. The
    ///   session is disposed before the error is returned.
    pub async fn start(&self) -> Result<()> {
        let span = info_span!("session", session_id = %self.inner.id);
        self.run_startup().instrument(span).await
    }

    async fn run_startup(&self) -> Result<()> {
        self.inner
            .state
            .compare_and_advance(SessionState::NotStarted, SessionState::ProcessLaunching)
            .map_err(|state| AppError::Session(format!("cannot start a session in state {state}")))?;

        let mut state_rx = self.inner.state.subscribe();
        if let Err(err) = self.connect_and_handshake().await {
            self.record_failure(&err.to_string());
            self.dispose().await;
            return Err(err);
        }

        let settled = state_rx
            .wait_for(|s| *s == SessionState::Active || s.is_shutting_down())
            .await
            .map(|s| *s);
        if matches!(settled, Ok(SessionState::Active)) {
            return Ok(());
        }
        self.dispose().await;
        Err(AppError::Setup(
            self.failure()
                .unwrap_or_else(|| "session closed during handshake".to_owned()),
        ))
    }

    async fn connect_and_handshake(&self) -> Result<()> {
        let inner = &self.inner;
        let timeouts = &inner.config.timeouts;

        let connection = if let Some((host, port)) = inner.config.debug_target() {
            info!(%host, port, "debug mode: dialling guest directly");
            Connection::connect(&ConnectionTarget::Tcp { host, port }, timeouts.connect()).await?
        } else {
            let kind = TransportKind::from_mode(inner.config.transport.mode);
            let (listener, target) = TransportListener::bind(kind).await?;
            let mut process_rx = inner.supervisor.subscribe();
            inner.supervisor.start(&target).await?;

            let accepted = tokio::select! {
                accepted = listener.accept(timeouts.connect()) => accepted,
                exited = process_rx.wait_for(|s| matches!(s, ProcessState::Exited { .. })) => {
                    let reason = match exited.as_deref() {
                        Ok(ProcessState::Exited { reason, .. }) => reason.clone(),
                        _ => "supervisor dropped".to_owned(),
                    };
                    Err(AppError::Setup(format!("guest exited before connecting: {reason}")))
                }
            };
            {
                let mut links = self.links();
                if self.status().is_shutting_down() {
                    debug!(session_id = %inner.id, "disposed while accepting; releasing listener");
                    drop(links);
                    drop(listener);
                } else {
                    links.listener = Some(listener);
                }
            }
            accepted?
        };

        inner
            .state
            .compare_and_advance(SessionState::ProcessLaunching, SessionState::AwaitingReady)
            .map_err(|state| AppError::Disposed(format!("session left launch early ({state})")))?;

        let (channel, events) =
            FramedChannel::new(connection, ChannelOptions::from(&inner.config.protocol));
        let channel = Arc::new(channel);
        let sender = channel.sender();
        self.links().channel = Some(channel);

        let pump = SessionPump {
            session: self.clone(),
            sender,
        };
        inner
            .tasks
            .spawn(pump.run(events).instrument(info_span!("session_pump", session_id = %inner.id)));

        if inner.config.debug_target().is_none() {
            let watcher = self.clone();
            inner.tasks.spawn(watcher.watch_process());
        }
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> SessionState {
        self.inner.state.get()
    }

    /// Channel health while `Active`; `None` otherwise.
    #[must_use]
    pub fn responsiveness(&self) -> Option<HealthSnapshot> {
        if self.status() != SessionState::Active {
            return None;
        }
        self.links().channel.as_ref().map(|c| c.health())
    }

    /// Ask the guest to activate extension `id`.
    ///
    /// Returns whether the guest knew the extension.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if `id` is not in the catalog.
    /// - `AppError::Session` if the session is not `Active`.
    /// - The remote error if activation failed in the guest.
    pub async fn activate_guest_module(&self, id: &str) -> Result<bool> {
        if !self.inner.catalog.contains(id) {
            return Err(AppError::NotFound(format!("extension '{id}' is not in the catalog")));
        }
        let rpc = self.active_rpc()?;
        ExtensionServiceProxy::new(&rpc)?
            .activate_by_id(id, API_REASON)
            .await
    }

    /// RPC layer while `Active`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Session` outside the `Active` state.
    pub fn active_rpc(&self) -> Result<RpcProtocol> {
        let state = self.status();
        if state != SessionState::Active {
            return Err(AppError::Session(format!("session is {state}, not active")));
        }
        self.links()
            .rpc
            .clone()
            .ok_or_else(|| AppError::Session("rpc layer not available".into()))
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the session reaches `target`.
    ///
    /// Returns `false` on timeout, or as soon as the session is `Disposed`
    /// when waiting for any other state.
    pub async fn wait_for_state(&self, target: SessionState, timeout: Duration) -> bool {
        let mut rx = self.subscribe_state();
        let waited = rx.wait_for(|s| *s == target || *s == SessionState::Disposed);
        let reached = matches!(tokio::time::timeout(timeout, waited).await, Ok(Ok(s)) if *s == target);
        reached
    }

    /// Pid of the supervised guest, if one is running.
    #[must_use]
    pub fn guest_pid(&self) -> Option<u32> {
        self.inner.supervisor.pid()
    }

    /// Host service implementations bound for this session.
    #[must_use]
    pub fn host_services(&self) -> &HostServices {
        &self.inner.host_services
    }

    /// Extension catalog sent to the guest.
    #[must_use]
    pub fn catalog(&self) -> &ExtensionCatalog {
        &self.inner.catalog
    }

    /// Reason recorded for the first fatal failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.inner
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tear the session down. Idempotent; concurrent callers wait for the
    /// first teardown to finish.
    ///
    /// Order: background tasks, RPC layer (pending calls fail), `Terminate`
    /// signal, framing channel, transport listener, guest process.
    pub async fn dispose(&self) {
        match self.inner.state.advance(SessionState::Disposing) {
            Ok(previous) => {
                info!(session_id = %self.inner.id, from = %previous, "session disposing");
            }
            Err(SessionState::Disposing) => {
                let mut rx = self.subscribe_state();
                let _ = rx.wait_for(|s| *s == SessionState::Disposed).await;
                return;
            }
            Err(_) => return,
        }

        let inner = &self.inner;
        inner.cancel.cancel();
        inner.tasks.close();
        if tokio::time::timeout(TASK_DRAIN, inner.tasks.wait()).await.is_err() {
            warn!(session_id = %inner.id, "session tasks did not stop in time");
        }

        let (rpc, channel, listener) = {
            let mut links = self.links();
            (links.rpc.take(), links.channel.take(), links.listener.take())
        };

        if let Some(rpc) = rpc {
            rpc.dispose();
        }
        if let Some(channel) = channel {
            if channel.send(HandshakeMessage::Terminate.to_bytes()).is_err() {
                debug!(session_id = %inner.id, "terminate signal not sent");
            }
            channel.dispose().await;
        }
        drop(listener);
        inner.supervisor.stop().await;

        if inner.state.advance(SessionState::Disposed).is_err() {
            warn!(session_id = %inner.id, "unexpected state at end of teardown");
        }
        info!(session_id = %inner.id, "session disposed");
    }

    /// Dispose from inside a session task without waiting on that task.
    fn dispose_detached(&self, reason: &str) {
        if self.status().is_shutting_down() {
            return;
        }
        self.record_failure(reason);
        let session = self.clone();
        tokio::spawn(async move { session.dispose().await });
    }

    fn record_failure(&self, reason: &str) {
        let mut failure = self
            .inner
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(reason.to_owned());
        }
    }

    fn links(&self) -> std::sync::MutexGuard<'_, Links> {
        self.inner.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn watch_process(self) {
        let mut rx = self.inner.supervisor.subscribe();
        let exited = tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => return,
            exited = rx.wait_for(|s| matches!(s, ProcessState::Exited { .. })) => {
                exited.map(|s| s.clone())
            }
        };
        let reason = match exited {
            Ok(ProcessState::Exited { reason, .. }) => reason,
            _ => "supervisor dropped".to_owned(),
        };
        warn!(session_id = %self.inner.id, %reason, "guest process gone; disposing session");
        self.dispose_detached(&format!("guest process exited: {reason}"));
    }

    fn init_payload(&self) -> InitPayload {
        let config = &self.inner.config;
        InitPayload {
            session_id: self.inner.id.clone(),
            catalog_version: CATALOG_VERSION,
            parent_pid: std::process::id(),
            environment: EnvironmentInfo {
                app_name: config.app_name.clone(),
                app_version: env!("CARGO_PKG_VERSION").to_owned(),
                log_level: config.log_level.clone(),
                os: std::env::consts::OS.to_owned(),
                arch: std::env::consts::ARCH.to_owned(),
                started_at: Utc::now(),
            },
            workspace: WorkspaceInfo {
                name: config.workspace_name(),
                root: ResourceUri::from_file_path(&config.workspace_root),
            },
            extensions: self.inner.catalog.descriptors().to_vec(),
            settings: self.inner.host_services.configuration().snapshot(),
        }
    }

    async fn activate_on_startup(self, rpc: RpcProtocol, id: String) {
        if !self.inner.catalog.contains(&id) {
            warn!(extension = %id, "configured activation skipped: not in catalog");
            return;
        }
        let proxy = match ExtensionServiceProxy::new(&rpc) {
            Ok(proxy) => proxy,
            Err(err) => {
                error!(%err, "cannot build extension service proxy");
                return;
            }
        };
        let outcome = tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => return,
            outcome = proxy.activate_by_id(&id, STARTUP_REASON) => outcome,
        };
        match outcome {
            Ok(true) => info!(extension = %id, "guest module activated"),
            Ok(false) => warn!(extension = %id, "guest does not know the module"),
            Err(err) => warn!(extension = %id, %err, "guest module activation failed"),
        }
    }
}

// ── Message pump ─────────────────────────────────────────────────────────────

struct SessionPump {
    session: ExtensionHostSession,
    sender: FramedSender,
}

impl SessionPump {
    async fn run(self, mut events: mpsc::Receiver<ChannelEvent>) {
        let inner = Arc::clone(&self.session.inner);
        let timeouts = inner.config.timeouts.clone();
        let deadline = tokio::time::sleep(timeouts.ready());
        tokio::pin!(deadline);
        let mut waiting_for = "Ready";

        loop {
            let handshaking = self.session.status().is_handshaking();
            tokio::select! {
                biased;
                () = inner.cancel.cancelled() => break,
                () = &mut deadline, if handshaking => {
                    let reason = format!("guest did not send {waiting_for} in time");
                    error!(session_id = %inner.id, "{reason}");
                    self.session.dispose_detached(&reason);
                    break;
                }
                event = events.recv() => match event {
                    Some(ChannelEvent::Message(payload)) => {
                        if let Some(next) = self.on_message(&payload) {
                            waiting_for = "Initialized";
                            deadline.as_mut().reset(Instant::now() + next);
                        }
                    }
                    Some(ChannelEvent::Unresponsive) => {
                        warn!(session_id = %inner.id, "guest unresponsive");
                    }
                    Some(ChannelEvent::Responsive) => {
                        info!(session_id = %inner.id, "guest responsive again");
                    }
                    Some(ChannelEvent::Closed { reason }) => {
                        warn!(session_id = %inner.id, %reason, "connection closed");
                        self.session.dispose_detached(&format!("connection closed: {reason}"));
                        break;
                    }
                    None => {
                        self.session.dispose_detached("connection events ended");
                        break;
                    }
                },
            }
        }
        debug!(session_id = %inner.id, "session pump stopped");
    }

    /// Handle one regular message. Returns the next handshake timeout when
    /// the init payload was just sent.
    fn on_message(&self, payload: &Bytes) -> Option<Duration> {
        let state = self.session.status();
        if HandshakeMessage::is_control(payload) {
            let Some(signal) = HandshakeMessage::parse(payload) else {
                debug!(code = payload[0], %state, "ignoring unrecognised control message");
                return None;
            };
            return self.on_signal(signal, state);
        }

        if state == SessionState::Active {
            let rpc = self.session.links().rpc.clone();
            if let Some(rpc) = rpc {
                rpc.handle_message(payload);
            }
        } else {
            debug!(%state, len = payload.len(), "ignoring message outside active state");
        }
        None
    }

    fn on_signal(&self, signal: HandshakeMessage, state: SessionState) -> Option<Duration> {
        let session = &self.session;
        match (signal, state) {
            (HandshakeMessage::Ready, SessionState::AwaitingReady) => {
                let sent = session
                    .init_payload()
                    .encode()
                    .and_then(|payload| self.sender.send(payload));
                if let Err(err) = sent {
                    error!(%err, "failed to send init payload");
                    session.dispose_detached(&format!("init payload not sent: {err}"));
                    return None;
                }
                if session
                    .inner
                    .state
                    .compare_and_advance(SessionState::AwaitingReady, SessionState::AwaitingInitialized)
                    .is_err()
                {
                    return None;
                }
                info!("init payload sent");
                Some(session.inner.config.timeouts.initialized())
            }
            (HandshakeMessage::Initialized, SessionState::AwaitingInitialized) => {
                self.become_active();
                None
            }
            (HandshakeMessage::Terminate, _) => {
                info!(%state, "guest requested termination");
                session.dispose_detached("guest requested termination");
                None
            }
            (signal, state) => {
                warn!(?signal, %state, "ignoring out-of-order handshake message");
                None
            }
        }
    }

    fn become_active(&self) {
        let session = &self.session;
        let inner = &session.inner;

        let rpc = RpcProtocol::new(
            Direction::Main,
            self.sender.clone(),
            inner.config.rpc.max_concurrent_dispatch,
        );
        if let Err(err) = inner.host_services.register_all(&rpc) {
            error!(%err, "failed to bind host services");
            rpc.dispose();
            session.dispose_detached(&format!("host services not bound: {err}"));
            return;
        }
        session.links().rpc = Some(rpc.clone());

        if inner
            .state
            .compare_and_advance(SessionState::AwaitingInitialized, SessionState::Active)
            .is_err()
        {
            rpc.dispose();
            return;
        }
        info!(extensions = inner.catalog.len(), "session active");

        for id in startup_activations(&inner.config.activate, &inner.catalog) {
            let task = session.clone().activate_on_startup(rpc.clone(), id);
            inner.tasks.spawn(task.in_current_span());
        }
    }
}

/// Configured ids first, then catalog entries with a startup activation
/// event, each once.
fn startup_activations(configured: &[String], catalog: &ExtensionCatalog) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let from_catalog = catalog
        .descriptors()
        .iter()
        .filter(|d| d.activates_on_startup())
        .map(|d| &d.id);
    for id in configured.iter().chain(from_catalog) {
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }
    ids
}
