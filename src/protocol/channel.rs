//! Framed, acknowledged, keep-alive-monitored message channel.
//!
//! A [`FramedChannel`] owns one [`Connection`] and runs three tasks:
//!
//! - **reader**: decodes frames, processes acknowledgements, restores send
//!   order and forwards payloads as [`ChannelEvent::Message`].
//! - **writer**: drains the outbound queue, stamping each frame with the
//!   highest in-order id received so far.
//! - **timer**: emits keep-alive and standalone ack frames when the link is
//!   idle, and flags the peer unresponsive after a silent window.
//!
//! [`FramedChannel::send`] never blocks: frames are queued and written in
//! queue order by the writer task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::codec::{DecodedFrame, Frame, FrameCodec, FrameKind, DEFAULT_MAX_FRAME_BYTES};
use super::sequencer::{Sequenced, Sequencer, DEFAULT_REORDER_LIMIT};
use crate::config::ProtocolConfig;
use crate::transport::{BoxedReader, BoxedWriter, Connection, TransportStatus};
use crate::{AppError, Result};

/// Upper bound for flushing the `Disconnect` frame during disposal.
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

/// Upper bound for background tasks to wind down during disposal.
const TASK_DRAIN: Duration = Duration::from_secs(1);

/// Capacity of the consumer event queue.
const EVENT_CAPACITY: usize = 1024;

/// Timing and size limits for a [`FramedChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Idle period after which a keep-alive is written.
    pub keepalive_interval: Duration,
    /// Silence window after which the peer is reported unresponsive.
    pub unresponsive_after: Duration,
    /// Delay before a standalone ack is written when nothing else is sent.
    pub ack_delay: Duration,
    /// Largest payload accepted in either direction.
    pub max_frame_bytes: usize,
    /// Maximum number of early frames held for reordering.
    pub reorder_limit: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from(&ProtocolConfig::default())
    }
}

impl From<&ProtocolConfig> for ChannelOptions {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            keepalive_interval: Duration::from_millis(config.keepalive_interval_ms),
            unresponsive_after: Duration::from_millis(config.unresponsive_after_ms),
            ack_delay: Duration::from_millis(config.ack_delay_ms),
            max_frame_bytes: if config.max_frame_bytes == 0 {
                DEFAULT_MAX_FRAME_BYTES
            } else {
                config.max_frame_bytes
            },
            reorder_limit: DEFAULT_REORDER_LIMIT,
        }
    }
}

/// Notifications delivered to the channel's consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One logical message, in peer send order.
    Message(Bytes),
    /// No traffic at all has arrived within the unresponsive window.
    Unresponsive,
    /// Traffic resumed after an [`ChannelEvent::Unresponsive`] report.
    Responsive,
    /// The channel closed for a reason other than local disposal.
    Closed {
        /// Human-readable cause.
        reason: String,
    },
}

/// Advisory signal about the peer's processing speed.
///
/// Consulted on every send. The base policy only logs; it never delays or
/// refuses a send.
pub trait LoadEstimator: Send + Sync {
    /// Whether the peer currently appears overloaded.
    fn has_high_load(&self) -> bool;
}

/// Point-in-time health of a channel, cheap to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Time since any frame was read.
    pub last_read_ago: Duration,
    /// Time since any frame was written.
    pub last_write_ago: Duration,
    /// Payload bytes sent but not yet acknowledged by the peer.
    pub unacknowledged_bytes: usize,
    /// Regular frames sent but not yet acknowledged by the peer.
    pub unacknowledged_frames: usize,
    /// Frames rejected as duplicate, oversized or malformed.
    pub rejected_frames: u64,
    /// `false` once the unresponsive window elapsed without traffic.
    pub responsive: bool,
    /// Last answer from the load estimator, if one is installed.
    pub high_load: bool,
}

#[derive(Debug)]
struct Clock {
    last_read: Instant,
    last_write: Instant,
}

#[derive(Debug, Default)]
struct Outbox {
    last_id: u32,
    unacked: VecDeque<(u32, usize)>,
    unacked_bytes: usize,
}

struct Shared {
    options: ChannelOptions,
    outgoing: mpsc::UnboundedSender<Frame>,
    outbox: Mutex<Outbox>,
    clock: Mutex<Clock>,
    last_received: AtomicU32,
    last_ack_sent: AtomicU32,
    rejected: AtomicU64,
    responsive: AtomicBool,
    high_load: AtomicBool,
    disposed: AtomicBool,
    status: Arc<TransportStatus>,
    cancel: CancellationToken,
    events: mpsc::Sender<ChannelEvent>,
    load_estimator: Option<Arc<dyn LoadEstimator>>,
}

impl Shared {
    fn send_regular(&self, payload: Bytes) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(AppError::Disposed("framed channel disposed".into()));
        }
        if self.status.is_write_closed() {
            return Err(AppError::ConnectionClosed(format!(
                "write side closed ({})",
                self.status.describe()
            )));
        }
        let len = payload.len();
        if len > self.options.max_frame_bytes {
            return Err(AppError::Protocol(format!(
                "frame too large: {len} bytes exceeds {} byte limit",
                self.options.max_frame_bytes
            )));
        }

        if let Some(estimator) = &self.load_estimator {
            let high = estimator.has_high_load();
            if high && !self.high_load.swap(true, Ordering::AcqRel) {
                debug!("peer reports high load; sending anyway");
            } else if !high {
                self.high_load.store(false, Ordering::Release);
            }
        }

        // Id assignment and enqueue happen under one lock so wire order
        // matches id order.
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let id = outbox.last_id.wrapping_add(1);
        self.outgoing
            .send(Frame::regular(id, payload))
            .map_err(|_| AppError::ConnectionClosed("framed channel writer stopped".into()))?;
        outbox.last_id = id;
        outbox.unacked.push_back((id, len));
        outbox.unacked_bytes += len;
        Ok(())
    }

    fn send_signal(&self, kind: FrameKind) -> bool {
        self.outgoing.send(Frame::signal(kind)).is_ok()
    }

    fn acknowledge(&self, ack: u32) {
        if ack == 0 {
            return;
        }
        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(&(id, len)) = outbox.unacked.front() {
            if id > ack {
                break;
            }
            outbox.unacked.pop_front();
            outbox.unacked_bytes = outbox.unacked_bytes.saturating_sub(len);
        }
    }

    fn note_read(&self) {
        self.clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_read = Instant::now();
    }

    fn note_write(&self, ack: u32) {
        self.clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_write = Instant::now();
        self.last_ack_sent.fetch_max(ack, Ordering::AcqRel);
    }

    fn idle_times(&self) -> (Duration, Duration) {
        let clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        (clock.last_read.elapsed(), clock.last_write.elapsed())
    }

    fn health(&self) -> HealthSnapshot {
        let (last_read_ago, last_write_ago) = self.idle_times();
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        HealthSnapshot {
            last_read_ago,
            last_write_ago,
            unacknowledged_bytes: outbox.unacked_bytes,
            unacknowledged_frames: outbox.unacked.len(),
            rejected_frames: self.rejected.load(Ordering::Acquire),
            responsive: self.responsive.load(Ordering::Acquire),
            high_load: self.high_load.load(Ordering::Acquire),
        }
    }

    fn on_tick(&self) {
        let (read_idle, write_idle) = self.idle_times();

        let received = self.last_received.load(Ordering::Acquire);
        if received > self.last_ack_sent.load(Ordering::Acquire)
            && write_idle >= self.options.ack_delay
        {
            self.send_signal(FrameKind::Ack);
        } else if write_idle >= self.options.keepalive_interval {
            self.send_signal(FrameKind::KeepAlive);
        }

        if read_idle >= self.options.unresponsive_after
            && self.responsive.swap(false, Ordering::AcqRel)
        {
            warn!(
                silent_for = ?read_idle,
                "framed channel: peer unresponsive"
            );
            if self.events.try_send(ChannelEvent::Unresponsive).is_err() {
                debug!("framed channel: event queue full, unresponsive report dropped");
            }
        }
    }
}

/// Cloneable, non-blocking handle for sending regular frames.
#[derive(Clone)]
pub struct FramedSender {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FramedSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedSender").finish_non_exhaustive()
    }
}

impl FramedSender {
    /// Queue one logical message.
    ///
    /// # Errors
    ///
    /// - [`AppError::Disposed`] after [`FramedChannel::dispose`].
    /// - [`AppError::ConnectionClosed`] once the write side is gone.
    /// - [`AppError::Protocol`] when the payload exceeds the frame limit.
    pub fn send(&self, payload: Bytes) -> Result<()> {
        self.shared.send_regular(payload)
    }

    /// Whether the channel has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }
}

/// Message channel over one transport connection.
pub struct FramedChannel {
    shared: Arc<Shared>,
    tasks: TaskTracker,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FramedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedChannel")
            .field("options", &self.shared.options)
            .field("health", &self.shared.health())
            .finish_non_exhaustive()
    }
}

impl FramedChannel {
    /// Take ownership of `connection` and start the channel tasks.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        connection: Connection,
        options: ChannelOptions,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        Self::build(connection, options, None)
    }

    /// Like [`FramedChannel::new`] with an advisory [`LoadEstimator`].
    #[must_use]
    pub fn with_load_estimator(
        connection: Connection,
        options: ChannelOptions,
        estimator: Arc<dyn LoadEstimator>,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        Self::build(connection, options, Some(estimator))
    }

    fn build(
        connection: Connection,
        options: ChannelOptions,
        load_estimator: Option<Arc<dyn LoadEstimator>>,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let peer = connection.peer().to_owned();
        let (reader, writer, status) = connection.into_parts();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let now = Instant::now();

        let shared = Arc::new(Shared {
            options,
            outgoing,
            outbox: Mutex::new(Outbox::default()),
            clock: Mutex::new(Clock {
                last_read: now,
                last_write: now,
            }),
            last_received: AtomicU32::new(0),
            last_ack_sent: AtomicU32::new(0),
            rejected: AtomicU64::new(0),
            responsive: AtomicBool::new(true),
            high_load: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            status,
            cancel: CancellationToken::new(),
            events,
            load_estimator,
        });

        let tasks = TaskTracker::new();
        tasks.spawn(run_reader(Arc::clone(&shared), reader));
        let writer = tasks.spawn(run_writer(Arc::clone(&shared), writer, outgoing_rx));
        tasks.spawn(run_timer(Arc::clone(&shared)));
        tasks.close();

        info!(%peer, "framed channel open");

        (
            Self {
                shared,
                tasks,
                writer: Mutex::new(Some(writer)),
            },
            events_rx,
        )
    }

    /// Queue one logical message. See [`FramedSender::send`].
    ///
    /// # Errors
    ///
    /// Same as [`FramedSender::send`].
    pub fn send(&self, payload: Bytes) -> Result<()> {
        self.shared.send_regular(payload)
    }

    /// Cloneable sending handle for other layers.
    #[must_use]
    pub fn sender(&self) -> FramedSender {
        FramedSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current health snapshot.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.shared.health()
    }

    /// Close flags of the underlying transport.
    #[must_use]
    pub fn transport_status(&self) -> Arc<TransportStatus> {
        Arc::clone(&self.shared.status)
    }

    /// Whether [`FramedChannel::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Close the channel and release the transport.
    ///
    /// Sends a best-effort `Disconnect` frame, then stops all tasks. Safe to
    /// call more than once; later calls return immediately.
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.status.mark_disposed();

        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if self.shared.send_signal(FrameKind::Disconnect) {
            if let Some(writer) = writer {
                if tokio::time::timeout(DISCONNECT_FLUSH, writer).await.is_err() {
                    debug!("framed channel: disconnect flush timed out");
                }
            }
        }

        self.shared.cancel.cancel();
        if tokio::time::timeout(TASK_DRAIN, self.tasks.wait())
            .await
            .is_err()
        {
            warn!("framed channel: tasks did not stop in time");
        }
        debug!(status = %self.shared.status.describe(), "framed channel disposed");
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn emit(shared: &Shared, event: ChannelEvent) -> bool {
    shared.events.send(event).await.is_ok()
}

async fn run_reader(shared: Arc<Shared>, reader: BoxedReader) {
    let mut framed = FramedRead::new(
        reader,
        FrameCodec::with_max_frame_bytes(shared.options.max_frame_bytes),
    );
    let mut sequencer = Sequencer::new(shared.options.reorder_limit);

    let close_reason: Option<String> = loop {
        tokio::select! {
            biased;

            () = shared.cancel.cancelled() => break None,

            item = framed.next() => { match item {
                None => break Some("stream closed by peer".to_owned()),

                Some(Err(err)) => {
                    warn!(error = %err, "framed channel: read error, stopping");
                    break Some(format!("read error: {err}"));
                }

                Some(Ok(DecodedFrame::Rejected { reason })) => {
                    shared.rejected.fetch_add(1, Ordering::AcqRel);
                    warn!(reason, "framed channel: frame rejected, skipping");
                }

                Some(Ok(DecodedFrame::Frame(frame))) => {
                    shared.note_read();
                    if !shared.responsive.swap(true, Ordering::AcqRel) {
                        info!("framed channel: peer responsive again");
                        if !emit(&shared, ChannelEvent::Responsive).await {
                            break None;
                        }
                    }
                    shared.acknowledge(frame.ack);

                    match frame.kind {
                        FrameKind::Regular => match sequencer.accept(frame.id, frame.payload) {
                            Sequenced::Deliver(payloads) => {
                                shared
                                    .last_received
                                    .store(sequencer.last_delivered(), Ordering::Release);
                                let mut consumer_gone = false;
                                for payload in payloads {
                                    if !emit(&shared, ChannelEvent::Message(payload)).await {
                                        consumer_gone = true;
                                        break;
                                    }
                                }
                                if consumer_gone {
                                    debug!("framed channel: consumer dropped, stopping reader");
                                    break None;
                                }
                            }
                            Sequenced::Duplicate { id, expected } => {
                                shared.rejected.fetch_add(1, Ordering::AcqRel);
                                warn!(id, expected, "framed channel: duplicate frame rejected");
                            }
                            Sequenced::Buffered { id, expected } => {
                                debug!(id, expected, "framed channel: early frame buffered");
                            }
                            Sequenced::Overflow { expected } => {
                                shared.rejected.fetch_add(1, Ordering::AcqRel);
                                break Some(format!(
                                    "sequence gap at id {expected} could not be repaired"
                                ));
                            }
                        },
                        FrameKind::Disconnect => break Some("peer disconnected".to_owned()),
                        FrameKind::Control => {
                            debug!(len = frame.payload.len(), "framed channel: control frame ignored");
                        }
                        FrameKind::Ack | FrameKind::KeepAlive => {}
                    }
                }
            } }
        }
    };

    shared.status.mark_read_closed();
    shared.cancel.cancel();

    if let Some(reason) = close_reason {
        if shared.disposed.load(Ordering::Acquire) {
            return;
        }
        info!(reason, status = %shared.status.describe(), "framed channel closed");
        if !emit(&shared, ChannelEvent::Closed { reason }).await {
            debug!("framed channel: consumer gone before close could be delivered");
        }
    }
}

async fn run_writer(
    shared: Arc<Shared>,
    writer: BoxedWriter,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
) {
    let mut framed = FramedWrite::new(
        writer,
        FrameCodec::with_max_frame_bytes(shared.options.max_frame_bytes),
    );

    loop {
        tokio::select! {
            biased;

            frame = outgoing.recv() => {
                let Some(mut frame) = frame else { break };
                frame.ack = shared.last_received.load(Ordering::Acquire);
                let ack = frame.ack;
                let disconnect = frame.kind == FrameKind::Disconnect;

                let written = if disconnect {
                    tokio::time::timeout(DISCONNECT_FLUSH, framed.send(frame))
                        .await
                        .unwrap_or_else(|_| {
                            Err(AppError::Transport("disconnect write timed out".into()))
                        })
                } else {
                    framed.send(frame).await
                };

                if let Err(err) = written {
                    warn!(error = %err, "framed channel: write failed, stopping writer");
                    break;
                }
                shared.note_write(ack);

                if disconnect {
                    break;
                }
            }

            () = shared.cancel.cancelled() => break,
        }
    }

    if tokio::time::timeout(DISCONNECT_FLUSH, framed.close())
        .await
        .is_err()
    {
        debug!("framed channel: writer shutdown timed out");
    }
    shared.status.mark_write_closed();
}

async fn run_timer(shared: Arc<Shared>) {
    let period = shared
        .options
        .keepalive_interval
        .min(shared.options.ack_delay)
        .max(Duration::from_millis(20))
        / 2;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            _ = ticker.tick() => shared.on_tick(),
        }
    }
}
