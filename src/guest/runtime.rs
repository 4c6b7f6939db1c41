//! Guest half of the handshake and the serve loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::services::{
    GuestCommands, GuestConfiguration, GuestExtensionHost, HostApi, BUILTIN_COMMANDS,
};
use crate::config::ProtocolConfig;
use crate::protocol::{ChannelEvent, ChannelOptions, FramedChannel};
use crate::rpc::{LocalService, RpcProtocol};
use crate::services::{Direction, GuestService, CATALOG_VERSION};
use crate::session::{HandshakeMessage, InitPayload};
use crate::supervisor::connection_target_from_env;
use crate::transport::{Connection, ConnectionTarget};
use crate::{AppError, Result};

/// Upper bound for in-flight handlers to wind down after the loop ends.
const DISPATCH_DRAIN: Duration = Duration::from_secs(1);

/// Connection and handshake limits for the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestOptions {
    /// How long to wait for the host to accept the connection.
    pub connect_timeout: Duration,
    /// How long to wait for the init payload after `Ready`.
    pub init_timeout: Duration,
    /// Framing limits.
    pub channel: ChannelOptions,
    /// Maximum number of host calls executing at once.
    pub max_concurrent_dispatch: usize,
}

impl Default for GuestOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(10),
            channel: ChannelOptions::from(&ProtocolConfig::default()),
            max_concurrent_dispatch: 16,
        }
    }
}

/// Why [`GuestRuntime::serve`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestExit {
    /// The host sent `Terminate`.
    Terminated,
    /// The connection closed.
    Disconnected(String),
    /// Local shutdown was requested.
    Shutdown,
}

/// A connected, initialised guest.
#[derive(Debug)]
pub struct GuestRuntime {
    channel: FramedChannel,
    events: mpsc::Receiver<ChannelEvent>,
    rpc: RpcProtocol,
    host: HostApi,
    extensions: Arc<GuestExtensionHost>,
    init: InitPayload,
}

impl GuestRuntime {
    /// Connect to the target advertised in the process environment and run
    /// the handshake.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Setup` if the environment carries no usable
    /// target, or any error from [`GuestRuntime::connect`].
    pub async fn connect_from_env(options: &GuestOptions) -> Result<Self> {
        let target = connection_target_from_env(|key| std::env::var(key).ok())?;
        Self::connect(&target, options).await
    }

    /// Connect to `target` and run the handshake.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the host cannot be reached, or any
    /// error from [`GuestRuntime::handshake`].
    pub async fn connect(target: &ConnectionTarget, options: &GuestOptions) -> Result<Self> {
        info!(%target, "connecting to host");
        let connection = Connection::connect(target, options.connect_timeout).await?;
        Self::handshake(connection, options)
            .instrument(info_span!("guest_handshake", %target))
            .await
    }

    /// Send `Ready`, wait for the init payload, bind the guest services and
    /// answer `Initialized`.
    ///
    /// # Errors
    ///
    /// - `AppError::Setup` if no init payload arrives in time.
    /// - `AppError::ConnectionClosed` if the host goes away first.
    /// - `AppError::Protocol` if the init payload is malformed.
    pub async fn handshake(connection: Connection, options: &GuestOptions) -> Result<Self> {
        let (channel, mut events) = FramedChannel::new(connection, options.channel);

        let init = match Self::receive_init(&channel, &mut events, options.init_timeout).await {
            Ok(init) => init,
            Err(err) => {
                channel.dispose().await;
                return Err(err);
            }
        };
        if init.catalog_version != CATALOG_VERSION {
            warn!(
                host = init.catalog_version,
                guest = CATALOG_VERSION,
                "service catalog version mismatch"
            );
        }
        info!(
            session_id = %init.session_id,
            extensions = init.extensions.len(),
            workspace = %init.workspace.name,
            "init payload received"
        );

        let rpc = RpcProtocol::new(
            Direction::Guest,
            channel.sender(),
            options.max_concurrent_dispatch,
        );
        let bound = Self::bind_services(&rpc, &init);
        let (host, extensions) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                rpc.dispose();
                channel.dispose().await;
                return Err(err);
            }
        };

        if let Err(err) = channel.send(HandshakeMessage::Initialized.to_bytes()) {
            rpc.dispose();
            channel.dispose().await;
            return Err(err);
        }
        debug!("initialized sent");

        Ok(Self {
            channel,
            events,
            rpc,
            host,
            extensions,
            init,
        })
    }

    /// Init payload received from the host.
    #[must_use]
    pub fn init(&self) -> &InitPayload {
        &self.init
    }

    /// Guest-side RPC endpoint.
    #[must_use]
    pub fn rpc(&self) -> &RpcProtocol {
        &self.rpc
    }

    /// Extension activation state.
    #[must_use]
    pub fn extensions(&self) -> &Arc<GuestExtensionHost> {
        &self.extensions
    }

    /// Serve host calls until `Terminate`, disconnect or `shutdown`.
    pub async fn serve(mut self, shutdown: CancellationToken) -> GuestExit {
        let announce = tokio::spawn({
            let host = self.host.clone();
            async move {
                for id in BUILTIN_COMMANDS {
                    if let Err(err) = host.register_command(id).await {
                        debug!(command = id, %err, "command registration failed");
                        break;
                    }
                }
            }
            .in_current_span()
        });

        let exit = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    if let Err(err) = self.channel.send(HandshakeMessage::Terminate.to_bytes()) {
                        debug!(%err, "terminate not sent");
                    }
                    break GuestExit::Shutdown;
                }
                event = self.events.recv() => match event {
                    Some(ChannelEvent::Message(payload)) if HandshakeMessage::is_control(&payload) => {
                        match HandshakeMessage::parse(&payload) {
                            Some(HandshakeMessage::Terminate) => break GuestExit::Terminated,
                            other => debug!(?other, "ignoring control message"),
                        }
                    }
                    Some(ChannelEvent::Message(payload)) => self.rpc.handle_message(&payload),
                    Some(ChannelEvent::Unresponsive) => warn!("host unresponsive"),
                    Some(ChannelEvent::Responsive) => info!("host responsive again"),
                    Some(ChannelEvent::Closed { reason }) => break GuestExit::Disconnected(reason),
                    None => break GuestExit::Disconnected("event stream ended".into()),
                },
            }
        };

        info!(?exit, "guest stopping");
        announce.abort();
        self.rpc.dispose();
        if !self.rpc.wait_stopped(DISPATCH_DRAIN).await {
            warn!("guest handlers did not stop in time");
        }
        self.channel.dispose().await;
        exit
    }

    async fn receive_init(
        channel: &FramedChannel,
        events: &mut mpsc::Receiver<ChannelEvent>,
        timeout: Duration,
    ) -> Result<InitPayload> {
        channel.send(HandshakeMessage::Ready.to_bytes())?;
        debug!("ready sent");

        let wait = async {
            loop {
                match events.recv().await {
                    Some(ChannelEvent::Message(payload)) if HandshakeMessage::is_control(&payload) => {
                        if HandshakeMessage::parse(&payload) == Some(HandshakeMessage::Terminate) {
                            return Err(AppError::ConnectionClosed(
                                "host terminated during handshake".into(),
                            ));
                        }
                        debug!("ignoring control message before init payload");
                    }
                    Some(ChannelEvent::Message(payload)) => return InitPayload::decode(&payload),
                    Some(ChannelEvent::Unresponsive | ChannelEvent::Responsive) => {}
                    Some(ChannelEvent::Closed { reason }) => {
                        return Err(AppError::ConnectionClosed(reason))
                    }
                    None => {
                        return Err(AppError::ConnectionClosed(
                            "event stream ended before init payload".into(),
                        ))
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            AppError::Setup(format!("no init payload within {timeout:?}"))
        })?
    }

    fn bind_services(
        rpc: &RpcProtocol,
        init: &InitPayload,
    ) -> Result<(HostApi, Arc<GuestExtensionHost>)> {
        let host = HostApi::new(rpc)?;
        let extensions = Arc::new(GuestExtensionHost::new(
            host.clone(),
            init.extensions.clone(),
        ));
        let configuration = Arc::new(GuestConfiguration::new(init.settings.clone()));
        let commands = Arc::new(GuestCommands::new(
            Arc::clone(&extensions),
            Arc::clone(&configuration),
        ));

        let bindings: [(GuestService, Arc<dyn LocalService>); 3] = [
            (
                GuestService::ExtensionService,
                Arc::clone(&extensions) as Arc<dyn LocalService>,
            ),
            (GuestService::Commands, commands as Arc<dyn LocalService>),
            (
                GuestService::Configuration,
                configuration as Arc<dyn LocalService>,
            ),
        ];
        for (service, binding) in bindings {
            rpc.register_local(service.address(), binding)?;
        }
        rpc.seal();
        Ok((host, extensions))
    }
}
