use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

use crate::live_view::signalling::IceCandidatePayload;

/// Give up waiting for ICE gathering after this long and proceed with
/// whatever candidates we have.
const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(6);

/// Enough local candidates to attempt a connection.
const ENOUGH_CANDIDATES: usize = 2;

const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

pub struct PeerConnection {
    pub pc: Arc<RTCPeerConnection>,
    /// Local candidates, to be forwarded over the signalling channel as they
    /// are gathered.
    pub candidate_rx: mpsc::UnboundedReceiver<IceCandidatePayload>,
    pub ice_state_rx: watch::Receiver<RTCIceConnectionState>,
    pub track_rx: mpsc::Receiver<Arc<TrackRemote>>,
    candidate_count: Arc<AtomicUsize>,
    enough_candidates: Arc<Notify>,
}

/// Builds a receive-only peer connection for the camera's H.264 video.
pub async fn build_peer_connection() -> anyhow::Result<PeerConnection> {
    let mut media_engine = MediaEngine::default();

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 102,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: STUN_SERVERS
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![(*url).to_owned()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    let pc = Arc::new(api.new_peer_connection(config).await?);

    pc.add_transceiver_from_kind(
        RTPCodecType::Video,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await?;

    let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
    let candidate_count = Arc::new(AtomicUsize::new(0));
    let enough_candidates = Arc::new(Notify::new());

    {
        let candidate_count = Arc::clone(&candidate_count);
        let enough_candidates = Arc::clone(&enough_candidates);

        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(json) => {
                        let payload = IceCandidatePayload {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        };

                        let _ = candidate_tx.send(payload);

                        if candidate_count.fetch_add(1, Ordering::SeqCst) + 1 >= ENOUGH_CANDIDATES {
                            enough_candidates.notify_waiters();
                        }
                    }
                    Err(error) => {
                        warn!(%error, "Failed to serialize a local ICE candidate");
                    }
                }
            }
            Box::pin(async {})
        }));
    }

    let (ice_state_tx, ice_state_rx) = watch::channel(RTCIceConnectionState::New);

    pc.on_ice_connection_state_change(Box::new(move |state| {
        debug!(?state, "ICE connection state changed");
        let _ = ice_state_tx.send(state);
        Box::pin(async {})
    }));

    let (track_tx, track_rx) = mpsc::channel(4);

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        info!(kind = %track.kind(), "Track received");
        let track_tx = track_tx.clone();
        Box::pin(async move {
            let _ = track_tx.send(track).await;
        })
    }));

    Ok(PeerConnection {
        pc,
        candidate_rx,
        ice_state_rx,
        track_rx,
        candidate_count,
        enough_candidates,
    })
}

impl PeerConnection {
    /// Creates the SDP offer and waits until either ICE gathering completes,
    /// enough local candidates are available, or the gathering timeout
    /// elapses, whichever comes first.
    pub async fn create_offer(&mut self) -> anyhow::Result<String> {
        let offer = self.pc.create_offer(None).await?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;

        self.pc.set_local_description(offer).await?;

        if self.candidate_count.load(Ordering::SeqCst) < ENOUGH_CANDIDATES {
            tokio::select! {
                _ = gather_complete.recv() => {
                    debug!("ICE gathering completed fully");
                }
                () = self.enough_candidates.notified() => {
                    debug!(count = self.candidate_count.load(Ordering::SeqCst), "Proceeding with gathered ICE candidates");
                }
                () = tokio::time::sleep(ICE_GATHERING_TIMEOUT) => {
                    warn!("ICE gathering timed out, proceeding with available candidates");
                }
            }
        }

        let local_description = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| anyhow::anyhow!("no local SDP description available"))?;

        Ok(local_description.sdp)
    }

    pub async fn apply_answer(&self, sdp: String) -> anyhow::Result<()> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    pub async fn add_remote_candidate(&self, candidate: &IceCandidatePayload) -> anyhow::Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// Closes the peer connection, bounded by `timeout`.
    pub async fn close(&self, timeout: Duration) {
        let pc = Arc::clone(&self.pc);

        match tokio::time::timeout(timeout, pc.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, "Error closing the peer connection"),
            Err(_elapsed) => warn!("Peer connection close timed out"),
        }
    }
}
