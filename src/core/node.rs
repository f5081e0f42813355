//! MeshNode: the single-threaded protocol state machine.
//!
//! Every component's state lives here and is touched from exactly one task.
//! Handlers are plain `&mut self` methods that take the current time; they
//! never await. The async [`MeshNode::run`] loop only multiplexes the four
//! things that can wake the node up:
//!
//! - a transport event (channel opened, frame arrived, channel closed),
//! - a UI command,
//! - the earliest timer deadline,
//! - spare capacity to stream the next chunks of the in-flight send.
//!
//! Inbound traffic always wins over bulk sends, so keep-alives and requests
//! are answered while a large file is streaming.

use crate::core::broker::{self, Broker, Route};
use crate::core::config::{CHUNKS_PER_PUMP, MeshConfig};
use crate::core::connection::{ChannelId, PeerId, Transport, TransportError, TransportEvent};
use crate::core::error::{MeshError, MeshResult};
use crate::core::library::{Direction, FileKey, FileLibrary, FileMeta, FileSummary};
use crate::core::liveness::{Liveness, Recovery, TimerKind};
use crate::core::mesh;
use crate::core::protocol::{Message, now_unix_millis};
use crate::core::queue::{Purpose, QueueEntry, SendQueue, Targets};
use crate::core::registry::{ConnectionRegistry, Health};
use crate::core::timers::TimerQueue;
use crate::core::transfer::receiver::Receiver;
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

// ── UI collaborator ──────────────────────────────────────────────────────────

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    PeerConnected(PeerId),
    PeerDegraded(PeerId),
    PeerReconnected(PeerId),
    /// Fires once per lost peer.
    PeerDisconnected(PeerId),
    FileListUpdated(FileSummary),
    Progress {
        file: FileKey,
        percent: u8,
        direction: Direction,
    },
    FileReceived {
        file: FileKey,
        from: PeerId,
    },
    /// Bytes for a requested download are in memory.
    DownloadReady {
        file: FileKey,
        name: String,
        mime: String,
        content: Bytes,
    },
    SendComplete {
        file: FileKey,
        delivered: usize,
    },
    Error(MeshError),
}

/// Fire-and-forget handle on the UI queue. A detached sink drops everything.
#[derive(Debug, Clone, Default)]
pub struct UiSink(Option<mpsc::UnboundedSender<UiEvent>>);

impl UiSink {
    pub fn new(tx: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn notify(&self, event: UiEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

/// Requests from the UI layer.
#[derive(Debug, Clone)]
pub enum NodeCommand {
    /// Share a file. `targets: None` means every open connection.
    SendFile {
        name: String,
        mime: String,
        content: Bytes,
        targets: Option<Vec<PeerId>>,
    },
    Download(FileKey),
    /// Drop cached bytes of a file, keeping its metadata.
    Evict(FileKey),
    Connect(PeerId),
    Disconnect(PeerId),
    /// The embedding app moved to the foreground or background.
    Visibility { foreground: bool },
    Shutdown,
}

// ── Node ─────────────────────────────────────────────────────────────────────

pub struct MeshNode {
    local: PeerId,
    config: MeshConfig,
    transport: Arc<dyn Transport>,
    registry: ConnectionRegistry,
    library: FileLibrary,
    receiver: Receiver,
    queue: SendQueue,
    broker: Broker,
    liveness: Liveness,
    timers: TimerQueue<TimerKind>,
    ui: UiSink,
}

impl MeshNode {
    pub fn new(transport: Arc<dyn Transport>, config: MeshConfig, ui: UiSink) -> Self {
        Self {
            local: transport.local_id().clone(),
            liveness: Liveness::new(config.clone()),
            config,
            transport,
            registry: ConnectionRegistry::new(),
            library: FileLibrary::new(),
            receiver: Receiver::new(),
            queue: SendQueue::new(),
            broker: Broker::new(),
            timers: TimerQueue::new(),
            ui,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn library(&self) -> &FileLibrary {
        &self.library
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    /// Arm the periodic health sweep.
    pub fn start(&mut self, now: Instant) {
        self.liveness.start(&mut self.timers, now);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn has_outbound_work(&self) -> bool {
        self.queue.has_work()
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Returns `false` once the node has shut down.
    pub fn handle_command(&mut self, cmd: NodeCommand, now: Instant) -> bool {
        match cmd {
            NodeCommand::SendFile {
                name,
                mime,
                content,
                targets,
            } => {
                if let Err(e) = self.send_file(name, mime, content, targets) {
                    self.surface(e);
                }
            }
            NodeCommand::Download(key) => {
                if let Err(e) = self.download(&key, now) {
                    self.surface(e);
                }
            }
            NodeCommand::Evict(key) => self.evict(&key),
            NodeCommand::Connect(peer) => {
                if let Err(e) = self.connect(&peer, now) {
                    self.surface(e);
                }
            }
            NodeCommand::Disconnect(peer) => self.disconnect(&peer),
            NodeCommand::Visibility { foreground } => self.visibility_changed(foreground, now),
            NodeCommand::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        self.flush_health();
        true
    }

    /// Dial `peer`; the connection has `connect_timeout` to open.
    pub fn connect(&mut self, peer: &PeerId, now: Instant) -> MeshResult<()> {
        self.registry.connect(self.transport.as_ref(), peer, now)?;
        self.liveness
            .arm_connect_deadline(&mut self.registry, &mut self.timers, peer, now);
        Ok(())
    }

    /// Record a local file and queue it for every target.
    pub fn send_file(
        &mut self,
        name: String,
        mime: String,
        content: Bytes,
        targets: Option<Vec<PeerId>>,
    ) -> MeshResult<FileKey> {
        let meta = FileMeta::new(name, mime, content.len() as u64, self.local.clone());
        let key = meta.key.clone();
        mesh::record_local(&mut self.library, meta.clone(), content.clone(), &self.ui)?;
        self.queue.enqueue(QueueEntry {
            meta,
            content,
            targets: targets.map_or(Targets::AllOpen, Targets::Peers),
            purpose: Purpose::Share,
        });
        Ok(key)
    }

    /// Fetch the bytes of a known file, from cache, the holder, or a relay.
    pub fn download(&mut self, key: &FileKey, now: Instant) -> MeshResult<()> {
        let holder = match broker::route(&self.local, &self.library, &self.registry, key)? {
            Route::Local(content) => {
                debug!(event = "download_cache_hit", file = %key);
                self.deliver(key, content);
                return Ok(());
            }
            Route::Direct(holder) => {
                broker::request(&self.local, &self.registry, &holder, key, None)?;
                self.broker.want(key);
                return Ok(());
            }
            Route::AwaitOpen(holder) => {
                self.broker.want(key);
                self.broker.park(&holder, key);
                return Ok(());
            }
            Route::Dial(holder) => holder,
        };

        match self.connect(&holder, now) {
            Ok(()) => {
                self.broker.want(key);
                self.broker.park(&holder, key);
                Ok(())
            }
            Err(MeshError::Transport(TransportError::Unreachable(_))) if self.config.relay_fallback => {
                let relay = broker::relay_for(&self.library, &self.registry, key).ok_or_else(|| {
                    MeshError::HolderUnreachable {
                        file: key.clone(),
                        holder: holder.clone(),
                    }
                })?;
                info!(event = "download_via_relay", file = %key, holder = %holder, relay = %relay);
                broker::request(&self.local, &self.registry, &relay, key, Some(&holder))?;
                self.broker.want(key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn evict(&mut self, key: &FileKey) {
        if self.library.evict(key)
            && let Some(record) = self.library.get(key)
        {
            info!(event = "content_evicted", file = %key, bytes = record.meta.size);
            self.ui.notify(UiEvent::FileListUpdated(record.summary()));
        }
    }

    /// Say goodbye to `peer` and drop it without any reconnect attempt.
    pub fn disconnect(&mut self, peer: &PeerId) {
        self.notify_leaving(peer);
        if self.registry.remove(peer, &mut self.timers).is_some() {
            self.peer_lost(peer);
        }
    }

    pub fn visibility_changed(&mut self, foreground: bool, now: Instant) {
        debug!(event = "visibility_changed", foreground);
        for peer in self.liveness.burst(&mut self.registry, &mut self.timers, now) {
            self.receiver.abandon(&peer);
        }
    }

    /// Best-effort goodbye to every open peer, then close everything.
    pub fn shutdown(&mut self) {
        let open = self.registry.open_peers();
        info!(event = "node_shutdown", peer = %self.local, open = open.len());
        for peer in &open {
            self.notify_leaving(peer);
        }
        for peer in self.registry.peers() {
            self.registry.remove(&peer, &mut self.timers);
            self.receiver.abandon(&peer);
        }
        self.flush_health();
    }

    fn notify_leaving(&self, peer: &PeerId) {
        let Some(conn) = self.registry.get(peer).filter(|c| c.is_open()) else {
            return;
        };
        let msg = Message::DisconnectNotification {
            peer_id: self.local.clone(),
        };
        if let Err(e) = msg.encode().and_then(|frame| conn.send(frame)) {
            warn!(event = "disconnect_notify_failed", peer = %peer, %e);
        }
    }

    fn deliver(&self, key: &FileKey, content: Bytes) {
        let Some(record) = self.library.get(key) else {
            return;
        };
        self.ui.notify(UiEvent::DownloadReady {
            file: key.clone(),
            name: record.meta.name.clone(),
            mime: record.meta.mime.clone(),
            content,
        });
    }

    // ── Transport events ─────────────────────────────────────────────────────

    pub fn handle_transport(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Incoming(channel) => {
                let peer = channel.peer().clone();
                match self.registry.on_incoming(channel, now) {
                    Ok(_) => {
                        self.receiver.abandon(&peer);
                    }
                    Err(e) => debug!(event = "incoming_rejected", peer = %peer, %e),
                }
            }
            TransportEvent::Open { peer, channel } => self.on_open(&peer, channel, now),
            TransportEvent::Data {
                peer,
                channel,
                frame,
            } => self.on_data(&peer, channel, &frame, now),
            TransportEvent::Closed { peer, channel } => self.on_closed(&peer, channel, now),
            TransportEvent::Error {
                peer,
                channel,
                error,
            } => {
                warn!(event = "channel_error", peer = %peer, %channel, %error);
                self.on_closed(&peer, channel, now);
            }
        }
        self.flush_health();
    }

    fn on_open(&mut self, peer: &PeerId, channel: ChannelId, now: Instant) {
        if self.registry.current(peer, channel).is_none() {
            trace!(event = "stale_open", peer = %peer, %channel);
            return;
        }
        self.liveness
            .on_open(&mut self.registry, &mut self.timers, peer, now);

        if let Some(conn) = self.registry.get(peer) {
            let hello = Message::ConnectionNotification {
                peer_id: self.local.clone(),
                timestamp: now_unix_millis(),
            };
            if let Err(e) = hello.encode().and_then(|frame| conn.send(frame)) {
                warn!(event = "connection_notify_failed", peer = %peer, %e);
            }
            if self.config.announce_on_connect {
                mesh::sync_library(&self.library, conn);
            }
        }
        self.broker.flush_parked(&self.local, &self.registry, peer);
    }

    fn on_data(&mut self, peer: &PeerId, channel: ChannelId, frame: &[u8], now: Instant) {
        let Some(conn) = self.registry.current(peer, channel) else {
            trace!(event = "stale_frame", peer = %peer, %channel);
            return;
        };
        conn.last_activity = now;
        match Message::decode(frame) {
            Ok(msg) => {
                trace!(event = "frame_in", peer = %peer, kind = msg.kind());
                self.dispatch(peer, msg);
            }
            Err(e) => warn!(event = "frame_undecodable", peer = %peer, bytes = frame.len(), %e),
        }
    }

    /// A channel closed, or errored. Only a close of the current channel of
    /// an open connection means anything: it degrades the connection.
    fn on_closed(&mut self, peer: &PeerId, channel: ChannelId, now: Instant) {
        let Some(conn) = self.registry.current(peer, channel) else {
            trace!(event = "stale_close", peer = %peer, %channel);
            return;
        };
        if conn.health() != Health::Open || conn.channel_is_open() {
            debug!(event = "channel_close_ignored", peer = %peer, health = ?conn.health());
            return;
        }
        if self
            .liveness
            .degrade(&mut self.registry, &mut self.timers, peer, now)
        {
            self.receiver.abandon(peer);
        }
    }

    /// Typed dispatch over every message kind.
    fn dispatch(&mut self, from: &PeerId, msg: Message) {
        match msg {
            Message::FileInfo { ref file_id, .. } => match msg.meta() {
                Some(meta) => {
                    mesh::learn(&self.local, &mut self.library, &self.registry, meta, from, None, &self.ui);
                }
                None => warn!(event = "file_id_mismatch", peer = %from, kind = msg.kind(), file = %file_id),
            },
            Message::FileHeader { ref file_id, .. } => match msg.meta() {
                Some(meta) => self.receiver.on_header(from, meta),
                None => warn!(event = "file_id_mismatch", peer = %from, kind = msg.kind(), file = %file_id),
            },
            Message::FileChunk {
                file_id,
                offset,
                data,
                ..
            } => match self.receiver.on_chunk(from, &file_id, offset, data) {
                Ok(Some(progress)) => self.ui.notify(UiEvent::Progress {
                    file: progress.file,
                    percent: progress.percent,
                    direction: Direction::Received,
                }),
                Ok(None) => {}
                Err(e) => {
                    self.broker.take_wanted(&file_id);
                    self.surface(e);
                }
            },
            Message::FileComplete { file_id } => self.on_complete(from, &file_id),
            Message::BlobRequest {
                file_id,
                peer_id,
                forward_to,
            } => {
                let serve = broker::on_request(
                    &self.local,
                    &self.library,
                    &self.registry,
                    from,
                    &file_id,
                    &peer_id,
                    forward_to.as_ref(),
                );
                self.serve(serve);
            }
            Message::BlobRequestForwarded { file_id, peer_id } => {
                let serve = broker::on_forwarded(&self.library, &self.registry, from, &file_id, &peer_id);
                self.serve(serve);
            }
            Message::BlobError { .. } => {
                if let Some(e) = self
                    .broker
                    .on_error(&self.local, &self.library, &self.registry, from, &msg)
                {
                    self.surface(e);
                }
            }
            Message::ConnectionNotification { peer_id, timestamp } => {
                if &peer_id != from {
                    warn!(event = "peer_id_mismatch", channel_peer = %from, claimed = %peer_id);
                }
                debug!(event = "peer_hello", peer = %from, timestamp);
            }
            Message::KeepAlive { timestamp } => {
                let Some(conn) = self.registry.get(from) else {
                    return;
                };
                let pong = Message::KeepAliveResponse { timestamp };
                if let Err(e) = pong.encode().and_then(|frame| conn.send(frame)) {
                    warn!(event = "keep_alive_reply_failed", peer = %from, %e);
                }
            }
            Message::KeepAliveResponse { timestamp } => {
                trace!(event = "keep_alive_rtt", peer = %from, ms = now_unix_millis().saturating_sub(timestamp));
            }
            Message::DisconnectNotification { peer_id } => {
                info!(event = "peer_leaving", peer = %from, claimed = %peer_id);
                if self.registry.remove(from, &mut self.timers).is_some() {
                    self.peer_lost(from);
                }
            }
        }
    }

    fn on_complete(&mut self, from: &PeerId, key: &FileKey) {
        let done = match self.receiver.on_complete(from, key) {
            Ok(Some(done)) => done,
            Ok(None) => return,
            Err(e) => {
                self.broker.take_wanted(key);
                self.surface(e);
                return;
            }
        };
        let key = done.meta.key.clone();
        mesh::learn(
            &self.local,
            &mut self.library,
            &self.registry,
            done.meta,
            from,
            Some(done.content.clone()),
            &self.ui,
        );
        self.ui.notify(UiEvent::FileReceived {
            file: key.clone(),
            from: from.clone(),
        });
        if self.broker.take_wanted(&key) {
            self.deliver(&key, done.content);
        }
    }

    fn serve(&mut self, serve: Option<broker::Serve>) {
        let Some(serve) = serve else {
            return;
        };
        self.queue.enqueue(QueueEntry {
            meta: serve.meta,
            content: serve.content,
            targets: Targets::Peers(vec![serve.to]),
            purpose: Purpose::Reply,
        });
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    pub fn fire_timers(&mut self, now: Instant) {
        while let Some((id, kind)) = self.timers.pop_due(now) {
            match kind {
                TimerKind::KeepAlive(peer) => {
                    self.liveness
                        .keep_alive_due(&mut self.registry, &mut self.timers, &peer, id, now);
                }
                TimerKind::HealthSweep => {
                    for peer in self.liveness.sweep(&mut self.registry, &mut self.timers, now) {
                        self.receiver.abandon(&peer);
                    }
                }
                TimerKind::Reconnect(peer) => {
                    let recovery = self.liveness.reconnect_due(
                        &mut self.registry,
                        &mut self.timers,
                        self.transport.as_ref(),
                        &peer,
                        id,
                        now,
                    );
                    if recovery == Recovery::GaveUp {
                        self.peer_lost(&peer);
                    }
                }
                TimerKind::ConnectDeadline(peer) => {
                    if self
                        .liveness
                        .connect_expired(&mut self.registry, &mut self.timers, &peer, id)
                    {
                        self.peer_lost(&peer);
                        self.surface(MeshError::ConnectTimeout { peer });
                    }
                }
            }
        }
        self.flush_health();
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Stream the next slice of the in-flight send.
    pub fn pump(&mut self) {
        self.queue.pump(&self.registry, CHUNKS_PER_PUMP, &self.ui);
    }

    // ── Shared ───────────────────────────────────────────────────────────────

    /// Forget everything tied to a removed connection.
    fn peer_lost(&mut self, peer: &PeerId) {
        self.receiver.abandon(peer);
        let orphaned = self.broker.fail_parked(peer);
        if !orphaned.is_empty() {
            warn!(event = "retrievals_orphaned", holder = %peer, files = orphaned.len());
        }
    }

    fn flush_health(&mut self) {
        let changes = self.registry.drain_changes();
        if !changes.is_empty() {
            self.liveness.report(changes, &self.ui);
        }
    }

    fn surface(&self, err: MeshError) {
        error!(event = "mesh_error", peer = %self.local, %err);
        self.ui.notify(UiEvent::Error(err));
    }

    // ── Event loop ───────────────────────────────────────────────────────────

    /// Drive the node until `sos` fires, a `Shutdown` command arrives or the
    /// command queue closes.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<NodeCommand>,
        sos: SignalOfStop,
    ) {
        self.start(clock());
        info!(event = "node_started", peer = %self.local);
        loop {
            let deadline = self.next_deadline();
            let outbound = self.has_outbound_work();
            tokio::select! {
                biased;
                _ = sos.wait() => {
                    self.shutdown();
                    break;
                }
                Some(event) = events.recv() => self.handle_transport(event, clock()),
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        self.shutdown();
                        break;
                    };
                    if !self.handle_command(cmd, clock()) {
                        break;
                    }
                }
                _ = sleep_until(deadline) => self.fire_timers(clock()),
                _ = tokio::task::yield_now(), if outbound => self.pump(),
            }
        }
        info!(event = "node_stopped", peer = %self.local);
    }
}

/// Now, on tokio's clock so paused-time tests drive the timers.
fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
