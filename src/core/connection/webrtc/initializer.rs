//! Peer connection setup: API construction, offer/answer, ICE gathering.
//!
//! Candidates are gathered in full before a description leaves this node, so
//! one offer and one answer are the whole signaling exchange.

use crate::core::config::ICE_GATHER_TIMEOUT;
use anyhow::{Context, Result, anyhow};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::timeout;
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub(super) fn create_api() -> Result<API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;
    Ok(APIBuilder::new()
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

pub(super) fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    urls.iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect()
}

pub(super) async fn new_peer_connection(
    api: &API,
    ice_servers: &[RTCIceServer],
) -> Result<Arc<RTCPeerConnection>> {
    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers: ice_servers.to_vec(),
            ..Default::default()
        })
        .await
        .context("creating peer connection")?;
    Ok(Arc::new(pc))
}

/// Create an offer and return it, with every local candidate, as JSON.
pub(super) async fn create_offer(pc: &Arc<RTCPeerConnection>) -> Result<String> {
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;
    gather_local_description(pc).await
}

/// Apply a remote offer and return the gathered answer as JSON.
pub(super) async fn accept_offer(pc: &Arc<RTCPeerConnection>, offer_sdp: &str) -> Result<String> {
    pc.set_remote_description(parse_description(offer_sdp)?)
        .await
        .context("applying remote offer")?;
    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer).await?;
    gather_local_description(pc).await
}

pub(super) async fn apply_answer(pc: &Arc<RTCPeerConnection>, answer_sdp: &str) -> Result<()> {
    pc.set_remote_description(parse_description(answer_sdp)?)
        .await
        .context("applying remote answer")
}

fn parse_description(sdp: &str) -> Result<RTCSessionDescription> {
    serde_json::from_str(sdp).context("malformed session description")
}

async fn local_description(pc: &Arc<RTCPeerConnection>) -> Result<String> {
    let desc = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("no local description after ICE gathering"))?;
    Ok(serde_json::to_string(&desc)?)
}

async fn gather_local_description(pc: &Arc<RTCPeerConnection>) -> Result<String> {
    if pc.ice_gathering_state() == RTCIceGatheringState::Complete {
        return local_description(pc).await;
    }

    let (tx, rx) = oneshot::channel::<()>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            if state == RTCIceGathererState::Complete
                && let Ok(mut guard) = tx.lock()
                && let Some(tx) = guard.take()
            {
                let _ = tx.send(());
            }
        })
    }));

    // Gathering may have finished between the first check and registration.
    if pc.ice_gathering_state() != RTCIceGatheringState::Complete {
        timeout(ICE_GATHER_TIMEOUT, rx)
            .await
            .context("ICE gathering timeout")?
            .context("ICE gathering channel closed")?;
    }
    local_description(pc).await
}
