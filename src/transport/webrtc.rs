//! WebRTC data-channel transport (feature `webrtc`)

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{Transport, TransportError, TransportEvent, TransportFactory};
use crate::config::TransportConfig;
use crate::records::{Candidate, Description};

type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Builds a fresh peer connection per attempt from the configured ICE servers.
#[derive(Debug, Clone)]
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(&self, label: &str) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(WebRtcTransport::new(label, &self.ice_servers).await?))
    }
}

pub struct WebRtcTransport {
    label: String,
    peer_connection: Arc<RTCPeerConnection>,
    events_tx: EventSender,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
}

fn watch_channel(channel: &Arc<RTCDataChannel>, events: EventSender) {
    let on_open = events.clone();
    let label = channel.label().to_string();
    channel.on_open(Box::new(move || {
        log::info!("Data channel '{}' open", label);
        let _ = on_open.send(TransportEvent::ChannelOpen);
        Box::pin(async {})
    }));
    channel.on_close(Box::new(move || {
        let _ = events.send(TransportEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

impl WebRtcTransport {
    pub async fn new(label: &str, ice_servers: &[String]) -> Result<Self, TransportError> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| TransportError::new(format!("Failed to create peer connection: {}", e)))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidates = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json().map(serde_json::to_value) {
                    Ok(Ok(value)) => {
                        let _ = candidates.send(TransportEvent::LocalCandidate(Candidate(value)));
                    }
                    Ok(Err(e)) => log::warn!("Unserializable ICE candidate: {}", e),
                    Err(e) => log::warn!("Unreadable ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let states = events_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                log::debug!("Peer connection state: {}", state);
                let event = match state {
                    RTCPeerConnectionState::Disconnected => Some(TransportEvent::Disconnected),
                    RTCPeerConnectionState::Failed => {
                        Some(TransportEvent::Error("peer connection failed".to_string()))
                    }
                    RTCPeerConnectionState::Closed => Some(TransportEvent::ChannelClosed),
                    _ => None,
                };
                if let Some(event) = event {
                    let _ = states.send(event);
                }
                Box::pin(async {})
            },
        ));

        let remote_channels = events_tx.clone();
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            log::info!("Remote opened data channel '{}'", channel.label());
            watch_channel(&channel, remote_channels.clone());
            Box::pin(async {})
        }));

        Ok(Self {
            label: label.to_string(),
            peer_connection,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            channel: Mutex::new(None),
        })
    }

    async fn open_channel(&self) -> Result<(), TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .peer_connection
            .create_data_channel(&self.label, Some(init))
            .await
            .map_err(|e| TransportError::new(format!("Failed to create data channel: {}", e)))?;
        watch_channel(&channel, self.events_tx.clone());
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = Some(channel);
        Ok(())
    }

    fn to_description(desc: &RTCSessionDescription) -> Result<Description, TransportError> {
        serde_json::to_value(desc)
            .map(Description)
            .map_err(|e| TransportError::new(format!("Unserializable description: {}", e)))
    }
}

fn parse_description(description: &Description) -> Result<RTCSessionDescription, TransportError> {
    let sdp = description
        .0
        .get("sdp")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TransportError::new("description has no sdp"))?
        .to_string();
    let parsed = match description.0.get("type").and_then(|v| v.as_str()) {
        Some("offer") => RTCSessionDescription::offer(sdp),
        Some("answer") => RTCSessionDescription::answer(sdp),
        Some("pranswer") => RTCSessionDescription::pranswer(sdp),
        other => return Err(TransportError::new(format!("unsupported description type {:?}", other))),
    };
    parsed.map_err(|e| TransportError::new(format!("Invalid SDP: {}", e)))
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create_offer(&self) -> Result<Description, TransportError> {
        self.open_channel().await?;
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| TransportError::new(format!("Failed to create offer: {}", e)))?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| TransportError::new(format!("Failed to set local description: {}", e)))?;
        Self::to_description(&offer)
    }

    async fn create_answer(&self) -> Result<Description, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| TransportError::new(format!("Failed to create answer: {}", e)))?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| TransportError::new(format!("Failed to set local description: {}", e)))?;
        Self::to_description(&answer)
    }

    async fn set_remote_description(&self, description: Description) -> Result<(), TransportError> {
        let desc = parse_description(&description)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|e| TransportError::new(format!("Failed to set remote description: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), TransportError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.0)
            .map_err(|e| TransportError::new(format!("Invalid ICE candidate: {}", e)))?;
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::new(format!("Failed to add ICE candidate: {}", e)))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            log::warn!("Failed to close peer connection: {}", e);
        }
    }
}
