//! WebRTC transport: one ordered, reliable data channel per mesh connection.
//!
//! # Signaling
//!
//! The transport never talks to a signaling server itself. Every offer and
//! answer it produces is pushed, as a [`SignalEnvelope`], onto the queue
//! returned by [`WebRtcTransport::new`]; the embedding application carries
//! it to the addressed peer by whatever means it has (a server, a QR code,
//! copy and paste) and hands incoming envelopes to
//! [`WebRtcTransport::handle_signal`].
//!
//! ```text
//! dialer                                  acceptor
//!   connect() ──▶ Offer{session, sdp} ──▶ handle_signal()
//!                                           └─▶ Incoming(channel)
//!   handle_signal() ◀── Answer{session, sdp}
//!   Open ◀────────── data channel opens ──────────▶ Open
//! ```
//!
//! ICE candidates are gathered in full before a description is sent, so no
//! trickle messages exist.

mod channel;
mod initializer;

use self::channel::{EventTx, Wiring, attach_dc_handlers, run_writer, watch_peer_connection};
use crate::core::config::{DATA_CHANNEL_LABEL, DEFAULT_ICE_SERVER};
use crate::core::connection::{Channel, PeerId, Transport, TransportError};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use webrtc::api::API;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;

pub use self::channel::WebRtcChannel;

// ── Signaling ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Signal {
    /// JSON `RTCSessionDescription` with every local candidate.
    Offer { sdp: String },
    Answer { sdp: String },
}

/// One signaling message addressed to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: PeerId,
    pub to: PeerId,
    /// Pairs an answer with the offer it answers.
    pub session: Uuid,
    pub signal: Signal,
}

// ── Transport ────────────────────────────────────────────────────────────────

struct Shared {
    local: PeerId,
    api: API,
    ice_servers: Vec<RTCIceServer>,
    events: EventTx,
    signals: mpsc::UnboundedSender<SignalEnvelope>,
    /// Dialed peer connections waiting for their answer, by session.
    offers: Mutex<HashMap<Uuid, Arc<RTCPeerConnection>>>,
}

impl Shared {
    fn offers(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<RTCPeerConnection>>> {
        self.offers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self, to: &PeerId, session: Uuid, signal: Signal) -> Result<()> {
        self.signals
            .send(SignalEnvelope {
                from: self.local.clone(),
                to: to.clone(),
                session,
                signal,
            })
            .map_err(|_| anyhow!("signaling queue closed"))
    }
}

pub struct WebRtcTransport {
    shared: Arc<Shared>,
}

impl WebRtcTransport {
    /// Build a transport for `local`. Returns the queue of outbound
    /// signaling messages the caller must deliver.
    pub fn new(
        local: PeerId,
        ice_servers: &[String],
        events: EventTx,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalEnvelope>)> {
        let urls = if ice_servers.is_empty() {
            vec![DEFAULT_ICE_SERVER.to_string()]
        } else {
            ice_servers.to_vec()
        };
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            local,
            api: initializer::create_api().context("building WebRTC API")?,
            ice_servers: initializer::ice_servers(&urls),
            events,
            signals,
            offers: Mutex::new(HashMap::new()),
        };
        Ok((
            Self {
                shared: Arc::new(shared),
            },
            signal_rx,
        ))
    }

    /// Apply a signaling message from a remote peer.
    pub async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<()> {
        if envelope.to != self.shared.local {
            return Err(anyhow!("signal for {} delivered to {}", envelope.to, self.shared.local));
        }
        match envelope.signal {
            Signal::Offer { sdp } => accept(&self.shared, envelope.from, envelope.session, &sdp).await,
            Signal::Answer { sdp } => {
                let pc = self
                    .shared
                    .offers()
                    .remove(&envelope.session)
                    .ok_or_else(|| anyhow!("answer for unknown session {}", envelope.session))?;
                initializer::apply_answer(&pc, &sdp).await?;
                info!(event = "answer_applied", peer = %envelope.from, session = %envelope.session);
                Ok(())
            }
        }
    }
}

impl Transport for WebRtcTransport {
    fn local_id(&self) -> &PeerId {
        &self.shared.local
    }

    fn connect(&self, peer: &PeerId) -> Result<Arc<dyn Channel>, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| TransportError::Closed("no async runtime".into()))?;
        let (channel, wiring, outbox) = WebRtcChannel::new(peer.clone(), self.shared.events.clone());
        let shared = self.shared.clone();
        runtime.spawn(async move {
            let session = Uuid::new_v4();
            match dial(&shared, &wiring, session).await {
                Ok((pc, dc)) => run_writer(dc, pc, outbox, wiring).await,
                Err(e) => {
                    shared.offers().remove(&session);
                    error!(event = "dial_failed", peer = %wiring.peer(), channel = %wiring.id(), %e);
                    wiring.error(format!("{e:#}"));
                }
            }
        });
        Ok(channel)
    }
}

fn data_channel_init() -> Option<RTCDataChannelInit> {
    Some(RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    })
}

/// Dialer side: create the peer connection and data channel, then send the
/// offer. The answer arrives later through `handle_signal`.
async fn dial(
    shared: &Arc<Shared>,
    wiring: &Wiring,
    session: Uuid,
) -> Result<(Arc<RTCPeerConnection>, Arc<RTCDataChannel>)> {
    let pc = initializer::new_peer_connection(&shared.api, &shared.ice_servers).await?;
    watch_peer_connection(&pc, wiring);
    let dc = pc
        .create_data_channel(DATA_CHANNEL_LABEL, data_channel_init())
        .await
        .context("creating data channel")?;
    attach_dc_handlers(&dc, wiring);

    let sdp = initializer::create_offer(&pc).await?;
    if wiring.is_closed() {
        return Err(anyhow!("channel closed while dialing"));
    }
    shared.offers().insert(session, pc.clone());
    shared.signal(wiring.peer(), session, Signal::Offer { sdp })?;
    debug!(event = "offer_sent", peer = %wiring.peer(), %session);
    Ok((pc, dc))
}

/// Acceptor side: answer the offer and surface the data channel as an
/// incoming mesh channel once the dialer's channel arrives.
async fn accept(shared: &Arc<Shared>, from: PeerId, session: Uuid, offer_sdp: &str) -> Result<()> {
    let pc = initializer::new_peer_connection(&shared.api, &shared.ice_servers).await?;
    let (channel, wiring, outbox) = WebRtcChannel::new(from.clone(), shared.events.clone());
    watch_peer_connection(&pc, &wiring);

    // The slot keeps the peer connection alive until the dialer's channel
    // arrives; taking it breaks the handler -> connection cycle.
    let slot = Arc::new(Mutex::new(Some((pc.clone(), channel, wiring, outbox))));
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let slot = slot.clone();
        Box::pin(async move {
            let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            let Some((pc, channel, wiring, outbox)) = taken else {
                warn!(event = "unexpected_data_channel", label = %dc.label());
                return;
            };
            wiring.incoming(channel);
            attach_dc_handlers(&dc, &wiring);
            tokio::spawn(run_writer(dc, pc, outbox, wiring));
        })
    }));

    let sdp = initializer::accept_offer(&pc, offer_sdp).await?;
    shared.signal(&from, session, Signal::Answer { sdp })?;
    info!(event = "offer_answered", peer = %from, %session);
    Ok(())
}
