use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::transport::{
    DataChannel, IceCandidate, LinkEvent, LinkEventSink, LinkOptions, LinkState, OpenedLink,
    PeerConnector, PeerLink, SessionDescription, TransportError,
};

const TARGET: &str = "gangway::transport::webrtc";

/// Opens real WebRTC peer connections as the offering side.
#[derive(Debug, Default, Clone)]
pub struct WebRtcConnector;

impl WebRtcConnector {
    pub fn new() -> Self {
        Self
    }
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open(
        &self,
        options: &LinkOptions,
        sink: LinkEventSink,
    ) -> Result<OpenedLink, TransportError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let api = build_api(setting)?;
        let mut config = RTCConfiguration::default();
        if !options.ice_server.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: vec![options.ice_server.clone()],
                ..Default::default()
            }];
        }

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(to_setup_error)?);
        tracing::debug!(
            target: TARGET,
            generation = sink.generation(),
            ice_server = %options.ice_server,
            "peer connection created"
        );

        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                tracing::trace!(target: TARGET, generation = sink.generation(), ?state, "peer state");
                sink.emit(LinkEvent::StateChanged(link_state(state)));
            })
        }));

        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    sink.emit(LinkEvent::Candidate(None));
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(LinkEvent::Candidate(Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        })));
                    }
                    Err(err) => {
                        tracing::warn!(target: TARGET, error = %err, "failed to encode local candidate");
                    }
                }
            })
        }));

        let link = Arc::new(WebRtcLink {
            pc: Arc::clone(&pc),
            sink: sink.clone(),
        });
        let control = link.create_channel(&options.control_label).await?;

        let offer = pc.create_offer(None).await.map_err(to_setup_error)?;
        pc.set_local_description(offer)
            .await
            .map_err(to_setup_error)?;
        tracing::trace!(target: TARGET, generation = sink.generation(), "local offer set");

        Ok(OpenedLink {
            link: link as Arc<dyn PeerLink>,
            control,
        })
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    sink: LinkEventSink,
}

impl WebRtcLink {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        Ok(Arc::new(WebRtcChannel::new(dc, self.sink.clone())))
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn local_description(&self) -> Result<SessionDescription, TransportError> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Setup("missing local description".into()))?;
        Ok(SessionDescription {
            kind: desc.sdp_type.to_string(),
            sdp: desc.sdp,
        })
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(&description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(to_setup_error)
    }

    async fn open_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.create_channel(label).await
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target: TARGET, error = %err, "peer connection close failed");
        }
    }
}

struct WebRtcChannel {
    label: String,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
}

impl WebRtcChannel {
    fn new(dc: Arc<RTCDataChannel>, sink: LinkEventSink) -> Self {
        let label = dc.label().to_string();

        let open_sink = sink.clone();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                tracing::debug!(target: TARGET, label = %open_label, "data channel opened");
                open_sink.emit(LinkEvent::ChannelOpen { label: open_label });
            })
        }));

        let close_sink = sink.clone();
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let sink = close_sink.clone();
            let label = close_label.clone();
            Box::pin(async move {
                tracing::debug!(target: TARGET, label = %label, "data channel closed");
                sink.emit(LinkEvent::ChannelClosed { label });
            })
        }));

        let message_sink = sink;
        let message_label = label.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = message_sink.clone();
            let label = message_label.clone();
            Box::pin(async move {
                tracing::trace!(target: TARGET, label = %label, frame_len = msg.data.len(), "received frame");
                sink.emit(LinkEvent::ChannelMessage {
                    label,
                    data: msg.data,
                });
            })
        }));

        let error_label = label.clone();
        dc.on_error(Box::new(move |err| {
            let label = error_label.clone();
            Box::pin(async move {
                tracing::warn!(target: TARGET, label = %label, error = %err, "data channel error");
            })
        }));

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let sender_label = label.clone();
        tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                if let Err(err) = dc.send(&data).await {
                    tracing::warn!(
                        target: TARGET,
                        label = %sender_label,
                        error = %err,
                        "data channel send failed"
                    );
                }
            }
            tracing::trace!(target: TARGET, label = %sender_label, "sender loop exit");
        });

        Self { label, outbound_tx }
    }
}

impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.outbound_tx
            .send(data)
            .map_err(|_| TransportError::ChannelClosed)
    }
}

fn to_rtc_description(
    description: &SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let sdp = description.sdp.clone();
    match RTCSdpType::from(description.kind.as_str()) {
        RTCSdpType::Offer => RTCSessionDescription::offer(sdp).map_err(to_setup_error),
        RTCSdpType::Answer => RTCSessionDescription::answer(sdp).map_err(to_setup_error),
        RTCSdpType::Pranswer => RTCSessionDescription::pranswer(sdp).map_err(to_setup_error),
        RTCSdpType::Rollback | RTCSdpType::Unspecified => Err(TransportError::Setup(format!(
            "unsupported sdp type {}",
            description.kind
        ))),
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}
