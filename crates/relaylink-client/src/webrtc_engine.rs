//! [`MediaEngine`] backed by webrtc-rs.

use async_trait::async_trait;
use relaylink_common::{NegotiationError, RemoteCandidate, SdpType, SessionDescription};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::ivf_reader::IVFReader;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::credentials::TraversalServer;
use crate::engine::{
    ConnectivityState, EngineEvent, EngineEvents, MediaEngine, MediaSession, SessionConfig,
    TransportState,
};
use crate::media::{MediaSink, VideoSource};

const TRACK_ID: &str = "video";
const STREAM_ID: &str = "relaylink";

pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    pub fn new() -> Result<Self, NegotiationError> {
        let mut media = RtcMediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| NegotiationError::engine("codec registration", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| NegotiationError::engine("interceptor registration", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

fn ice_server(server: &TraversalServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn connectivity(state: RTCIceConnectionState) -> ConnectivityState {
    match state {
        RTCIceConnectionState::Checking => ConnectivityState::Checking,
        RTCIceConnectionState::Connected => ConnectivityState::Connected,
        RTCIceConnectionState::Completed => ConnectivityState::Completed,
        RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCIceConnectionState::Failed => ConnectivityState::Failed,
        RTCIceConnectionState::Closed => ConnectivityState::Closed,
        _ => ConnectivityState::New,
    }
}

fn transport(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => TransportState::New,
    }
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let sdp = desc.sdp.clone();
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(NegotiationError::InvalidDescription(
                "rollback is not supported".into(),
            ))
        }
    };
    parsed.map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Option<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => return None,
    };
    Some(SessionDescription::new(sdp_type, desc.sdp))
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_session(
        &self,
        config: SessionConfig,
        events: EngineEvents,
        sink: MediaSink,
    ) -> Result<Box<dyn MediaSession>, NegotiationError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.servers.iter().map(ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| NegotiationError::engine("peer connection", e))?,
        );

        let ice_events = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = ice_events.clone();
            Box::pin(async move {
                debug!(%state, "ice connection state");
                events.emit(EngineEvent::Connectivity(connectivity(state))).await;
            })
        }));

        let pc_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = pc_events.clone();
            Box::pin(async move {
                debug!(%state, "peer connection state");
                events.emit(EngineEvent::Transport(transport(state))).await;
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            let sink = sink.clone();
            Box::pin(async move {
                let kind = track.kind();
                events
                    .emit(EngineEvent::RemoteTrack {
                        kind: kind.to_string(),
                    })
                    .await;
                if kind != RTPCodecType::Video {
                    warn!(%kind, "can not add a track of this kind, ignoring");
                    return;
                }
                info!(codec = %track.codec().capability.mime_type, "receiving remote video");
                let reader = tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                    debug!("remote video track ended");
                });
                sink.attach(reader);
            })
        }));

        let dc_events = events;
        pc.on_data_channel(Box::new(move |channel| {
            let events = dc_events.clone();
            Box::pin(async move {
                debug!(label = %channel.label(), "data channel opened by peer");
                events
                    .emit(EngineEvent::DataChannel {
                        label: channel.label().to_string(),
                    })
                    .await;
            })
        }));

        Ok(Box::new(WebRtcSession {
            pc,
            pumps: Mutex::new(Vec::new()),
        }))
    }
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcSession {
    fn keep(&self, handle: JoinHandle<()>) {
        match self.pumps.lock() {
            Ok(mut pumps) => pumps.push(handle),
            Err(_) => handle.abort(),
        }
    }
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::engine("set remote description", e))
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::engine("create offer", e))?;
        Ok(SessionDescription::new(SdpType::Offer, offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::engine("create answer", e))?;
        Ok(SessionDescription::new(SdpType::Answer, answer.sdp))
    }

    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| NegotiationError::engine("set local description", e))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(from_rtc_description)
    }

    async fn add_track(&self, source: VideoSource) -> Result<(), NegotiationError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                ..Default::default()
            },
            TRACK_ID.to_string(),
            STREAM_ID.to_string(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| NegotiationError::engine("add track", e))?;

        // RTCP has to be drained for the interceptors to run.
        self.keep(tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        }));

        match source {
            VideoSource::File { path, .. } => {
                self.keep(tokio::spawn(pump_ivf(path, track)));
            }
            VideoSource::Pattern => {
                // Raw pattern frames need an external VP8 encoder; the track is still
                // negotiated so the remote side sees a video stream.
                info!("sending pattern track without an encoder, stream stays silent");
            }
        }
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: &RemoteCandidate,
    ) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_attribute(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::engine("add candidate", e))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        if let Ok(mut pumps) = self.pumps.lock() {
            for pump in pumps.drain(..) {
                pump.abort();
            }
        }
        self.pc
            .close()
            .await
            .map_err(|e| NegotiationError::engine("close", e))
    }
}

async fn pump_ivf(path: PathBuf, track: Arc<TrackLocalStaticSample>) {
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "video file vanished");
            return;
        }
    };
    let (mut reader, header) = match IVFReader::new(BufReader::new(file)) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable video file");
            return;
        }
    };

    let frame_duration = if header.timebase_denominator == 0 {
        Duration::from_millis(33)
    } else {
        Duration::from_millis(
            1000 * u64::from(header.timebase_numerator) / u64::from(header.timebase_denominator),
        )
        .max(Duration::from_millis(1))
    };
    let mut ticker = time::interval(frame_duration);
    let mut frames = 0u64;
    loop {
        ticker.tick().await;
        let frame = match reader.parse_next_frame() {
            Ok((frame, _)) => frame,
            Err(_) => break,
        };
        let sample = Sample {
            data: frame.freeze(),
            duration: frame_duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!(error = %e, "video track write failed");
            break;
        }
        frames += 1;
    }
    info!(path = %path.display(), frames, "video file finished");
}
