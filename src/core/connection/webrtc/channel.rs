//! One mesh channel over an `RTCDataChannel`.
//!
//! [`Channel::send`] only queues the frame; a writer task per channel owns
//! the data channel and awaits each send in order. Data channel callbacks are
//! turned into [`TransportEvent`]s tagged with the channel's id.

use crate::core::connection::{Channel, ChannelId, PeerId, TransportError, TransportEvent};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

pub(super) type EventTx = mpsc::UnboundedSender<TransportEvent>;

enum Outbound {
    Frame(Bytes),
    Close,
}

#[derive(Default)]
struct State {
    open: AtomicBool,
    closed: AtomicBool,
}

/// What the callbacks and the writer task need to know about their channel.
#[derive(Clone)]
pub(super) struct Wiring {
    peer: PeerId,
    id: ChannelId,
    state: Arc<State>,
    events: EventTx,
}

impl Wiring {
    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            trace!(event = "transport_events_dropped", peer = %self.peer, channel = %self.id);
        }
    }

    pub(super) fn error(&self, error: String) {
        self.emit(TransportEvent::Error {
            peer: self.peer.clone(),
            channel: self.id,
            error,
        });
    }

    /// Hand the acceptor's channel to the node; must precede its `Open`.
    pub(super) fn incoming(&self, channel: Arc<WebRtcChannel>) {
        self.emit(TransportEvent::Incoming(channel));
    }

    pub(super) fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub(super) fn id(&self) -> ChannelId {
        self.id
    }

    pub(super) fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

pub struct WebRtcChannel {
    wiring: Wiring,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Receiving end of a channel's outbound queue, handed to its writer task.
pub(super) struct Outbox(mpsc::UnboundedReceiver<Outbound>);

impl WebRtcChannel {
    pub(super) fn new(peer: PeerId, events: EventTx) -> (Arc<Self>, Wiring, Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let wiring = Wiring {
            peer,
            id: ChannelId::next(),
            state: Arc::new(State::default()),
            events,
        };
        let channel = Arc::new(Self {
            wiring: wiring.clone(),
            outbound: tx,
        });
        (channel, wiring, Outbox(rx))
    }
}

impl Channel for WebRtcChannel {
    fn peer(&self) -> &PeerId {
        &self.wiring.peer
    }

    fn id(&self) -> ChannelId {
        self.wiring.id
    }

    fn is_open(&self) -> bool {
        self.wiring.state.open.load(Ordering::Acquire)
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::Closed("writer task stopped".into()))
    }

    fn close(&self) {
        let state = &self.wiring.state;
        if state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        state.open.store(false, Ordering::Release);
        let _ = self.outbound.send(Outbound::Close);
    }
}

// ── Handler attachment ───────────────────────────────────────────────────────

/// Attach `on_open`, `on_close`, `on_error`, and `on_message` callbacks to `dc`.
pub(super) fn attach_dc_handlers(dc: &Arc<RTCDataChannel>, wiring: &Wiring) {
    let w = wiring.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            if w.is_closed() {
                return;
            }
            w.state.open.store(true, Ordering::Release);
            info!(event = "dc_open", peer = %w.peer, channel = %w.id);
            w.emit(TransportEvent::Open {
                peer: w.peer.clone(),
                channel: w.id,
            });
        })
    }));

    let w = wiring.clone();
    dc.on_close(Box::new(move || {
        let w = w.clone();
        Box::pin(async move {
            w.state.open.store(false, Ordering::Release);
            warn!(event = "dc_closed", peer = %w.peer, channel = %w.id);
            w.emit(TransportEvent::Closed {
                peer: w.peer.clone(),
                channel: w.id,
            });
        })
    }));

    let w = wiring.clone();
    dc.on_error(Box::new(move |err| {
        let w = w.clone();
        Box::pin(async move {
            error!(event = "dc_error", peer = %w.peer, channel = %w.id, %err);
            w.error(err.to_string());
        })
    }));

    let w = wiring.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let w = w.clone();
        Box::pin(async move {
            w.emit(TransportEvent::Data {
                peer: w.peer.clone(),
                channel: w.id,
                frame: msg.data,
            });
        })
    }));
}

/// Log peer connection state and report a failed connection on the channel.
pub(super) fn watch_peer_connection(pc: &Arc<RTCPeerConnection>, wiring: &Wiring) {
    let w = wiring.clone();
    pc.on_peer_connection_state_change(Box::new(move |s| {
        let w = w.clone();
        Box::pin(async move {
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", peer = %w.peer, channel = %w.id);
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(event = "webrtc_disconnected", peer = %w.peer, channel = %w.id);
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", peer = %w.peer, channel = %w.id);
                    w.state.open.store(false, Ordering::Release);
                    w.error("peer connection failed".into());
                }
                _ => {}
            }
        })
    }));
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Send queued frames in order until the channel is closed or dropped, then
/// tear the peer connection down.
pub(super) async fn run_writer(
    dc: Arc<RTCDataChannel>,
    pc: Arc<RTCPeerConnection>,
    outbox: Outbox,
    wiring: Wiring,
) {
    let Outbox(mut rx) = outbox;
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Frame(frame) => {
                if let Err(e) = dc.send(&frame).await {
                    warn!(event = "dc_send_failed", peer = %wiring.peer, channel = %wiring.id, %e);
                    wiring.error(e.to_string());
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    wiring.state.open.store(false, Ordering::Release);
    debug!(event = "channel_teardown", peer = %wiring.peer, channel = %wiring.id);
    if let Err(e) = dc.close().await {
        debug!(event = "dc_close_failed", peer = %wiring.peer, %e);
    }
    if let Err(e) = pc.close().await {
        debug!(event = "pc_close_failed", peer = %wiring.peer, %e);
    }
}
