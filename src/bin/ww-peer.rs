use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use ww_signal::client::{
    DeviceCapture, RelayClient, RelayEvent, RtcPeerFactory, SessionController, SessionEvent,
};
use ww_signal::config::ClientConfig;
use ww_signal::protocol::RoomId;
use ww_signal::telemetry;

/// Headless call participant: `ww-peer [room-id]`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = ClientConfig::from_env();
    telemetry::init_tracing("ww-peer", &config.log);
    config.log_summary();

    let room = match std::env::args().nth(1) {
        Some(raw) => Some(RoomId::parse(&raw).with_context(|| format!("invalid room id '{raw}'"))?),
        None => None,
    };

    let (relay, mut relay_events) = RelayClient::connect(&config)?;
    let relay = Arc::new(relay);

    let (mut session, mut session_events) = SessionController::new(
        DeviceCapture::from_config(&config),
        RtcPeerFactory::new(config.stun_urls.clone()),
        relay.clone(),
        &config,
    );

    let room = match session.join_call(room).await {
        Ok(room) => room,
        Err(e) => {
            error!("{}: {e}", e.user_message());
            relay.close();
            return Err(e.into());
        }
    };
    info!(room = %room, "share this room id to invite a peer");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, leaving call");
                break;
            }
            Some(event) = relay_events.recv() => {
                let gave_up = event == RelayEvent::GaveUp;
                session.handle_relay_event(event).await;
                if gave_up {
                    break;
                }
            }
            Some(event) = session_events.recv() => match event {
                SessionEvent::PeerPhase { peer, phase } => info!(peer = %peer, phase = %phase, "peer phase"),
                SessionEvent::RemoteStream { peer, track } => info!(
                    peer = %peer,
                    kind = %track.kind(),
                    stream = %track.stream_id(),
                    "remote stream available"
                ),
                SessionEvent::PeerFailed { peer, error } => {
                    warn!(peer = %peer, "{}: {error}", error.user_message())
                }
                SessionEvent::PeerLeft(peer) => info!(peer = %peer, "peer left"),
                SessionEvent::RelayConnected(id) => info!(session = %id, "connected to relay"),
                SessionEvent::RelayReconnected(id) => info!(session = %id, "reconnected to relay"),
                SessionEvent::RelayDisconnected => warn!("relay connection lost"),
                SessionEvent::RelayGaveUp => error!("Failed to connect to signaling server"),
            },
        }
    }

    session.leave_call().await;
    relay.close();
    Ok(())
}
