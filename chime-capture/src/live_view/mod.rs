pub mod peer;
pub mod signalling;
pub mod sink;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use chime_capture_task::{ChildTask, ShutdownHandle, ShutdownSignal};
use futures::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use typed_builder::TypedBuilder;
use url::Url;
use uuid::Uuid;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::rtp::codecs::h264::H264Packet;

use crate::auth::AuthProvider;
use crate::cloud::CloudClient;
use crate::recording::{Recorder, RecordingOutput, RecordingRequest};
use crate::ticket::{TicketCache, TicketError};
use crate::util::{self, Backoff};
use crate::wake::WakeMonitor;

use self::peer::PeerConnection;
use self::signalling::{Envelope, Negotiation, NegotiationAction, PeerClosed, SignalMessage};
use self::sink::{Mp4Sink, SinkReport, VideoSink};

/// Hard cap on a session: battery cameras die at 10 minutes, stop before.
pub const MAX_DURATION: Duration = Duration::from_secs(590);

const PING_INTERVAL: Duration = Duration::from_secs(5);
/// Send a `refresh` besides the ping when the peer was quiet for this long.
const ACTIVITY_INTERVAL: Duration = Duration::from_secs(15);
const MAX_CONSECUTIVE_ERRORS: u32 = 3;
const SIGNALLING_READ_TIMEOUT: Duration = Duration::from_secs(2);
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(1);
const NOT_READY_DELAY: Duration = Duration::from_millis(300);
const ICE_RECOVERY_WINDOW: Duration = Duration::from_secs(10);
const PEER_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const WAKE_SETTLE_DELAY: Duration = Duration::from_secs(2);
const TICKET_RETRY_BACKOFF: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no account id is available: {0}")]
    AccountIdMissing(String),
    #[error(transparent)]
    TicketUnavailable(#[from] TicketError),
    #[error("signalling handshake rejected (status {status:?})")]
    HandshakeRejected { status: Option<u16> },
    #[error(transparent)]
    PeerClosed(#[from] PeerClosed),
    #[error("client stopped during session setup")]
    Stopped,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a connected session came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    DurationReached,
    Stopped,
    PeerClosed,
    SignallingLost,
    IceFailed,
    TrackLost,
    /// The host woke from sleep; settle and start a fresh attempt.
    WakeRestart,
}

/// Client lifecycle, largely for logging; owned by the session driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    Negotiating,
    Connected,
    Closing,
    Closed,
}

/// State shared between the connected-phase supervisory tasks.
///
/// Every task is a child of the client holding a clone of the same stop
/// signal; the client never holds back-references into the tasks.
struct SessionShared {
    stop: ShutdownHandle,
    stopping: AtomicBool,
    end_reason: Mutex<Option<EndReason>>,
    last_activity: Mutex<Instant>,
    force_ticket_refresh: AtomicBool,
}

impl SessionShared {
    fn new() -> (Arc<Self>, ShutdownSignal) {
        let (stop, signal) = ShutdownHandle::new();
        let shared = Arc::new(Self {
            stop,
            stopping: AtomicBool::new(false),
            end_reason: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            force_ticket_refresh: AtomicBool::new(false),
        });
        (shared, signal)
    }

    /// Idempotent and reentrancy-safe: the first caller decides the reason.
    fn request_stop(&self, reason: EndReason) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            *self.end_reason.lock() = Some(reason);
        }
        self.stop.signal();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn touch_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

#[derive(Clone)]
struct SignallingSender {
    ws: Arc<tokio::sync::Mutex<futures::stream::SplitSink<WsStream, Message>>>,
}

impl SignallingSender {
    fn new(sink: futures::stream::SplitSink<WsStream, Message>) -> Self {
        Self {
            ws: Arc::new(tokio::sync::Mutex::new(sink)),
        }
    }

    async fn send(&self, envelope: Envelope) -> Result<(), tungstenite::Error> {
        let mut ws = self.ws.lock().await;
        ws.send(Message::Text(envelope.to_json().into())).await
    }

    async fn close(&self) {
        let mut ws = self.ws.lock().await;
        if let Err(error) = ws.close().await {
            debug!(%error, "Error closing the signalling channel");
        }
    }
}

pub struct LiveViewOptions {
    pub device_id: String,
    pub max_duration: Duration,
    pub ticket_check_interval: Duration,
    pub wake_detection: bool,
    pub wake_check_interval: Duration,
    /// Debug override of the signalling endpoint.
    pub signalling_url: Option<Url>,
}

/// Drives one attempt series to open and record a live-view session for one
/// device. Owns its peer connection, WebSocket, sink, and ticket cache
/// exclusively.
pub struct LiveViewClient {
    auth: Arc<dyn AuthProvider>,
    options: LiveViewOptions,
    doorbot_id: u64,
    ticket: Arc<tokio::sync::Mutex<TicketCache>>,
    sink: Arc<tokio::sync::Mutex<Box<dyn VideoSink>>>,
    dialog_id: Uuid,
    session_id: Uuid,
    state: ClientState,
    connection_attempts: Arc<AtomicU32>,
    shutdown_signal: ShutdownSignal,
}

impl LiveViewClient {
    fn transition(&mut self, next: ClientState) {
        trace!(from = ?self.state, to = ?next, "Client state transition");
        self.state = next;
    }

    pub fn new(
        auth: Arc<dyn AuthProvider>,
        cloud: CloudClient,
        sink: Box<dyn VideoSink>,
        options: LiveViewOptions,
        shutdown_signal: ShutdownSignal,
    ) -> anyhow::Result<Self> {
        let doorbot_id = options
            .device_id
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("device id {:?} is not a numeric doorbot id", options.device_id))?;

        let ticket = TicketCache::new(Arc::new(cloud), Arc::clone(&auth));

        Ok(Self {
            auth,
            options,
            doorbot_id,
            ticket: Arc::new(tokio::sync::Mutex::new(ticket)),
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            dialog_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            state: ClientState::Idle,
            connection_attempts: Arc::new(AtomicU32::new(0)),
            shutdown_signal,
        })
    }

    /// Runs sessions until one of them ends for good, then closes the sink
    /// and reports the produced file.
    ///
    /// Failed connection attempts are retried with exponential backoff, at
    /// most `util::MAX_RETRIES` consecutive times; a wake-from-sleep restart
    /// resets the budget.
    pub async fn record(mut self) -> anyhow::Result<SinkReport> {
        let mut backoff = Backoff::new();

        loop {
            self.connection_attempts.fetch_add(1, Ordering::SeqCst);

            info!(
                device.id = %self.options.device_id,
                attempt = backoff.attempt(),
                "Starting live view client",
            );

            match self.run_session().await {
                Ok(EndReason::WakeRestart) => {
                    info!("Restarting the live view session after wake from sleep");
                    backoff.reset();
                    self.connection_attempts.store(0, Ordering::SeqCst);

                    if !util::sleep_cancellable(WAKE_SETTLE_DELAY, &mut self.shutdown_signal.clone()).await {
                        break;
                    }
                }
                Ok(reason) => {
                    debug!(?reason, "Live view session ended");
                    break;
                }
                Err(SessionError::Stopped) => break,
                Err(error) => {
                    self.react_to_session_error(&error).await;

                    let Some(delay) = backoff.next_delay() else {
                        error!(%error, "Giving up after failed connection attempts");
                        self.close_sink().await;
                        return Err(error.into());
                    };

                    warn!(
                        %error,
                        backoff_seconds = delay.as_secs(),
                        "Live view attempt failed, retrying with fresh credentials",
                    );

                    if !util::sleep_cancellable(delay, &mut self.shutdown_signal.clone()).await {
                        break;
                    }
                }
            }
        }

        self.transition(ClientState::Closed);

        self.close_sink()
            .await
            .ok_or_else(|| anyhow::anyhow!("video sink closed without a report"))
    }

    /// Applies the session-scoped retry policy: auth-class handshake
    /// failures refresh the bearer and force a ticket reissue, a 404 means
    /// the ticket itself expired.
    async fn react_to_session_error(&self, error: &SessionError) {
        match error {
            SessionError::HandshakeRejected { status: Some(401 | 403) } => {
                warn!("Signalling handshake rejected as unauthenticated, refreshing credentials");
                if !self.auth.refresh_token().await {
                    warn!("Bearer refresh failed, retrying with the current token");
                }
                self.ticket.lock().await.force_refresh();
            }
            SessionError::HandshakeRejected { status: Some(404) } => {
                warn!("Signalling handshake returned 404, likely an expired ticket");
                self.ticket.lock().await.force_refresh();
            }
            _ => {}
        }
    }

    async fn close_sink(&self) -> Option<SinkReport> {
        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(report) => Some(report),
            Err(error) => {
                // Writer errors never fail the recording; the supervisor
                // decides based on what landed on disk.
                warn!(%error, "Error closing the video sink");
                None
            }
        }
    }

    async fn run_session(&mut self) -> Result<EndReason, SessionError> {
        self.transition(ClientState::Negotiating);

        // Best effort: make sure we hold some bearer before going further.
        if self.auth.get_token().await.is_none() && !self.auth.refresh_token().await {
            debug!("No bearer token in hand; proceeding, the ticket request will retry");
        }

        let account_id = self
            .auth
            .get_account_id()
            .await
            .map_err(|e| SessionError::AccountIdMissing(format!("{e:#}")))?;
        debug!(account.id = %account_id, "Resolved account id");

        self.session_id = Uuid::new_v4();
        self.dialog_id = Uuid::new_v4();
        debug!(session.id = %self.session_id, dialog.id = %self.dialog_id, "Generated session ids");

        let (ticket, region) = self.ticket.lock().await.get().await?;

        let ws_url = match &self.options.signalling_url {
            Some(url) => url.clone(),
            None => signalling::build_ws_url(&ticket, region.as_deref()),
        };

        let mut peer = peer::build_peer_connection().await?;
        let offer_sdp = peer.create_offer().await?;

        let ws = self.open_websocket(&ws_url).await?;
        info!("WebSocket connection established");

        let (ws_sink, mut ws_stream) = ws.split();
        let sender = SignallingSender::new(ws_sink);

        let (shared, stop_signal) = SessionShared::new();

        // Local candidates go out as they are gathered, negotiation included.
        let mut candidate_rx = std::mem::replace(&mut peer.candidate_rx, tokio::sync::mpsc::unbounded_channel().1);
        let candidate_forwarder = ChildTask::spawn({
            let sender = sender.clone();
            let dialog_id = self.dialog_id;
            let doorbot_id = self.doorbot_id;
            let mut stop = stop_signal.clone();
            async move {
                loop {
                    tokio::select! {
                        candidate = candidate_rx.recv() => match candidate {
                            Some(candidate) => {
                                trace!(candidate = %candidate.candidate, "Forwarding local ICE candidate");
                                if let Err(error) = sender.send(Envelope::ice_candidate(dialog_id, doorbot_id, &candidate)).await {
                                    debug!(%error, "Failed to forward a local ICE candidate");
                                }
                            }
                            None => break,
                        },
                        () = stop.wait() => break,
                    }
                }
            }
        });

        sender
            .send(Envelope::live_view(self.dialog_id, self.doorbot_id, &offer_sdp))
            .await
            .map_err(|e| SessionError::Other(anyhow::anyhow!("failed to send the live_view request: {e}")))?;

        let negotiated = match tokio::time::timeout(
            self.options.max_duration,
            self.negotiate(&peer, &mut ws_stream),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(SessionError::Other(anyhow::anyhow!("negotiation timed out"))),
        };

        let session_jwt = match negotiated {
            Ok(session_jwt) => session_jwt,
            Err(error) => {
                candidate_forwarder.abort();
                sender.close().await;
                peer.close(PEER_CLOSE_TIMEOUT).await;
                return Err(error);
            }
        };

        self.transition(ClientState::Connected);
        self.connection_attempts.store(0, Ordering::SeqCst);
        info!("Live view session established");

        let reason = self
            .connected_phase(peer, sender, ws_stream, shared, stop_signal, candidate_forwarder, session_jwt)
            .await;

        if matches!(
            reason,
            EndReason::TrackLost | EndReason::SignallingLost | EndReason::WakeRestart
        ) {
            // Best positioned to know the ticket went bad.
            self.ticket.lock().await.force_refresh();
        }

        Ok(reason)
    }

    async fn open_websocket(&self, ws_url: &Url) -> Result<WsStream, SessionError> {
        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Other(anyhow::anyhow!("invalid signalling URL: {e}")))?;

        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(signalling::SUBPROTOCOL));
        request
            .headers_mut()
            .insert("User-Agent", HeaderValue::from_static("Mozilla/5.0 (ChimeCapture)"));

        match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _response)) => Ok(ws),
            Err(error) => {
                let status = handshake_status(&error);
                error!(%error, ?status, "WebSocket connection error");
                Err(SessionError::HandshakeRejected { status })
            }
        }
    }

    /// Processes inbound signalling until both `session_created` and
    /// `camera_started` have been received.
    async fn negotiate(&self, peer: &PeerConnection, ws_stream: &mut futures::stream::SplitStream<WsStream>) -> Result<String, SessionError> {
        let mut negotiation = Negotiation::new();
        let mut shutdown_signal = self.shutdown_signal.clone();

        loop {
            if shutdown_signal.is_signaled() {
                return Err(SessionError::Stopped);
            }

            let frame = tokio::select! {
                frame = tokio::time::timeout(SIGNALLING_READ_TIMEOUT, ws_stream.next()) => frame,
                () = shutdown_signal.wait() => return Err(SessionError::Stopped),
            };

            let message = match frame {
                Err(_elapsed) => continue,
                Ok(None) => {
                    return Err(SessionError::Other(anyhow::anyhow!(
                        "signalling channel closed during session setup"
                    )));
                }
                Ok(Some(Err(error))) => {
                    return Err(SessionError::Other(anyhow::anyhow!(
                        "signalling read failed during session setup: {error}"
                    )));
                }
                Ok(Some(Ok(message))) => message,
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    return Err(PeerClosed {
                        code: None,
                        text: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                    }
                    .into());
                }
                _ => continue,
            };

            let signal = match SignalMessage::parse(text.as_str()) {
                Ok(signal) => signal,
                Err(error) => {
                    warn!(%error, "Discarding an unparseable signalling frame");
                    continue;
                }
            };

            match negotiation.handle(signal)? {
                NegotiationAction::None => {}
                NegotiationAction::ApplyAnswer(sdp) => {
                    debug!("Applying remote SDP answer");
                    peer.apply_answer(sdp).await?;
                }
                NegotiationAction::AddCandidate(candidate) => {
                    if let Err(error) = peer.add_remote_candidate(&candidate).await {
                        warn!(%error, "Error adding a remote ICE candidate");
                    }
                }
                NegotiationAction::WaitNotReady => {
                    tokio::time::sleep(NOT_READY_DELAY).await;
                }
                NegotiationAction::Connected { session_jwt } => {
                    return Ok(session_jwt);
                }
            }
        }
    }

    /// Runs the connected-phase supervisory tasks until one of them calls
    /// for a stop, then tears the session down: cancel every task with a
    /// bounded join, close the peer connection and the WebSocket, stop the
    /// wake monitor.
    #[allow(clippy::too_many_arguments)]
    async fn connected_phase(
        &mut self,
        mut peer: PeerConnection,
        sender: SignallingSender,
        ws_stream: futures::stream::SplitStream<WsStream>,
        shared: Arc<SessionShared>,
        stop_signal: ShutdownSignal,
        candidate_forwarder: ChildTask<()>,
        session_jwt: String,
    ) -> EndReason {
        let mut tasks: Vec<(&'static str, ChildTask<()>)> = Vec::new();

        tasks.push(("candidate forwarder", candidate_forwarder));

        tasks.push((
            "keepalive",
            ChildTask::spawn(keepalive_loop(
                sender.clone(),
                Arc::clone(&shared),
                stop_signal.clone(),
                self.dialog_id,
                self.doorbot_id,
                session_jwt.clone(),
            )),
        ));

        tasks.push((
            "signalling monitor",
            ChildTask::spawn(signalling_monitor_loop(
                ws_stream,
                Arc::clone(&peer.pc),
                Arc::clone(&shared),
                stop_signal.clone(),
            )),
        ));

        tasks.push((
            "ice monitor",
            ChildTask::spawn(ice_monitor_loop(
                peer.ice_state_rx.clone(),
                Arc::clone(&shared),
                stop_signal.clone(),
            )),
        ));

        tasks.push((
            "ticket refresher",
            ChildTask::spawn(ticket_refresh_loop(
                Arc::clone(&self.ticket),
                self.options.ticket_check_interval,
                stop_signal.clone(),
            )),
        ));

        tasks.push((
            "timeout guard",
            ChildTask::spawn(timeout_guard(
                self.options.max_duration,
                Arc::clone(&shared),
                stop_signal.clone(),
            )),
        ));

        let mut track_rx = std::mem::replace(&mut peer.track_rx, tokio::sync::mpsc::channel(1).1);
        tasks.push((
            "track handler",
            ChildTask::spawn({
                let sink = Arc::clone(&self.sink);
                let shared = Arc::clone(&shared);
                let stop_signal = stop_signal.clone();
                async move {
                    let mut stop_signal_for_wait = stop_signal.clone();
                    let track = tokio::select! {
                        track = track_rx.recv() => track,
                        () = stop_signal_for_wait.wait() => None,
                    };

                    if let Some(track) = track {
                        track_loop(track, sink, shared, stop_signal).await;
                    }
                }
            }),
        ));

        let wake_monitor = if self.options.wake_detection {
            let mut monitor = WakeMonitor::new(self.options.wake_check_interval);
            let wake_shared = Arc::clone(&shared);
            monitor.on_wake(move || {
                let shared = Arc::clone(&wake_shared);
                async move {
                    info!("System wake detected, reconnecting the live view session");
                    shared.force_ticket_refresh.store(true, Ordering::SeqCst);
                    shared.request_stop(EndReason::WakeRestart);
                }
            });
            monitor.start();
            Some(monitor)
        } else {
            None
        };

        // Relay the daemon-wide shutdown into this session.
        let mut external_shutdown = self.shutdown_signal.clone();
        let shutdown_relay = ChildTask::spawn({
            let shared = Arc::clone(&shared);
            async move {
                external_shutdown.wait().await;
                shared.request_stop(EndReason::Stopped);
            }
        });

        // Wait for any supervisory task to request the stop.
        let mut stopped = stop_signal.clone();
        stopped.wait().await;

        self.transition(ClientState::Closing);
        info!("Stopping live view client");

        shutdown_relay.abort();

        for (name, task) in tasks {
            if task.join_with_timeout(TASK_JOIN_TIMEOUT).await.is_none() {
                warn!(task = name, "Supervisory task did not stop in time, abandoning it");
            }
        }

        peer.close(PEER_CLOSE_TIMEOUT).await;
        sender.close().await;

        if let Some(mut monitor) = wake_monitor {
            monitor.stop().await;
        }

        if shared.force_ticket_refresh.load(Ordering::SeqCst) {
            self.ticket.lock().await.force_refresh();
        }

        let reason = (*shared.end_reason.lock()).unwrap_or(EndReason::Stopped);

        info!(?reason, "Live view client stopped");

        reason
    }
}

fn handshake_status(error: &tungstenite::Error) -> Option<u16> {
    match error {
        tungstenite::Error::Http(response) => Some(response.status().as_u16()),
        _ => None,
    }
}

/// Callers may ask for any duration; the session never outlives the cap.
fn clamp_duration(requested: Duration) -> Duration {
    requested.min(MAX_DURATION)
}

async fn keepalive_loop(
    sender: SignallingSender,
    shared: Arc<SessionShared>,
    mut stop_signal: ShutdownSignal,
    dialog_id: Uuid,
    doorbot_id: u64,
    session_jwt: String,
) {
    let mut consecutive_errors: u32 = 0;

    loop {
        let result = sender.send(Envelope::ping(dialog_id, doorbot_id, &session_jwt)).await;

        let result = match result {
            Ok(()) if shared.idle_for() > ACTIVITY_INTERVAL => {
                debug!("No recent peer activity, refreshing the session");
                sender
                    .send(Envelope::refresh(dialog_id, doorbot_id, &session_jwt))
                    .await
            }
            other => other,
        };

        match result {
            Ok(()) => {
                trace!("Sent keepalive");
                consecutive_errors = 0;
            }
            Err(error) => {
                if shared.is_stopping() {
                    break;
                }

                consecutive_errors += 1;
                warn!(
                    %error,
                    attempt = consecutive_errors,
                    max = MAX_CONSECUTIVE_ERRORS,
                    "Keepalive send failed",
                );

                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    shared.request_stop(EndReason::SignallingLost);
                    break;
                }
            }
        }

        if !util::sleep_cancellable(PING_INTERVAL, &mut stop_signal).await {
            break;
        }
    }
}

async fn signalling_monitor_loop(
    mut ws_stream: futures::stream::SplitStream<WsStream>,
    pc: Arc<webrtc::peer_connection::RTCPeerConnection>,
    shared: Arc<SessionShared>,
    mut stop_signal: ShutdownSignal,
) {
    let mut consecutive_errors: u32 = 0;

    loop {
        if shared.is_stopping() {
            break;
        }

        let frame = tokio::select! {
            frame = tokio::time::timeout(SIGNALLING_READ_TIMEOUT, ws_stream.next()) => frame,
            () = stop_signal.wait() => break,
        };

        let message = match frame {
            Err(_elapsed) => continue,
            Ok(None) => {
                if !shared.is_stopping() {
                    warn!("Signalling channel closed by the peer");
                    shared.force_ticket_refresh.store(true, Ordering::SeqCst);
                    shared.request_stop(EndReason::SignallingLost);
                }
                break;
            }
            Ok(Some(Err(error))) => {
                if shared.is_stopping() {
                    break;
                }

                consecutive_errors += 1;

                let error_text = error.to_string();
                warn!(
                    %error,
                    attempt = consecutive_errors,
                    max = MAX_CONSECUTIVE_ERRORS,
                    "WebSocket connection error",
                );

                // Resets and 404s mean the ticket most likely expired.
                if error_text.contains("reset by peer") || error_text.contains("404") {
                    shared.force_ticket_refresh.store(true, Ordering::SeqCst);
                }

                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    shared.request_stop(EndReason::SignallingLost);
                    break;
                }

                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
            Ok(Some(Ok(message))) => message,
        };

        consecutive_errors = 0;
        shared.touch_activity();

        let text = match message {
            Message::Text(text) => text,
            Message::Close(frame) => {
                warn!(?frame, "Signalling channel closed");
                shared.request_stop(EndReason::PeerClosed);
                break;
            }
            _ => continue,
        };

        let signal = match SignalMessage::parse(text.as_str()) {
            Ok(signal) => signal,
            Err(_) => continue,
        };

        match signal {
            SignalMessage::Close { code: Some(signalling::CLOSE_CODE_NOT_READY), .. } => {
                debug!("Peer signalled not-ready (code 26)");
                tokio::time::sleep(NOT_READY_DELAY).await;
            }
            SignalMessage::Close { code, text } => {
                warn!(?code, %text, "Peer closed the session");
                shared.request_stop(EndReason::PeerClosed);
                break;
            }
            SignalMessage::IceCandidate(candidate) => {
                let init = webrtc::ice_transport::ice_candidate::RTCIceCandidateInit {
                    candidate: candidate.candidate.clone(),
                    sdp_mid: candidate.sdp_mid.clone(),
                    sdp_mline_index: candidate.sdp_mline_index,
                    ..Default::default()
                };
                if let Err(error) = pc.add_ice_candidate(init).await {
                    warn!(%error, "Error adding a remote ICE candidate");
                }
            }
            SignalMessage::Notification { text } => {
                info!(%text, "Received notification");
            }
            SignalMessage::Ping | SignalMessage::Pong => {}
            other => {
                trace!(?other, "Ignoring signalling message");
            }
        }
    }
}

async fn ice_monitor_loop(
    mut ice_state_rx: tokio::sync::watch::Receiver<RTCIceConnectionState>,
    shared: Arc<SessionShared>,
    mut stop_signal: ShutdownSignal,
) {
    loop {
        let state = *ice_state_rx.borrow_and_update();

        match state {
            RTCIceConnectionState::Failed => {
                warn!("ICE connection failed, waiting for self-recovery");

                let deadline = Instant::now() + ICE_RECOVERY_WINDOW;
                let mut recovered = false;

                while Instant::now() < deadline && !shared.is_stopping() {
                    if !util::sleep_cancellable(Duration::from_secs(1), &mut stop_signal).await {
                        return;
                    }

                    let state = *ice_state_rx.borrow();
                    if matches!(
                        state,
                        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
                    ) {
                        info!("ICE connection recovered");
                        recovered = true;
                        break;
                    }
                }

                if !recovered && !shared.is_stopping() {
                    error!("ICE connection failed permanently, stopping");
                    shared.request_stop(EndReason::IceFailed);
                    return;
                }
            }
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                shared.touch_activity();
            }
            _ => {}
        }

        tokio::select! {
            changed = ice_state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            () = stop_signal.wait() => return,
        }
    }
}

async fn ticket_refresh_loop(
    ticket: Arc<tokio::sync::Mutex<TicketCache>>,
    check_interval: Duration,
    mut stop_signal: ShutdownSignal,
) {
    let mut error_backoff = TICKET_RETRY_BACKOFF;

    loop {
        if !util::sleep_cancellable(check_interval, &mut stop_signal).await {
            break;
        }

        match ticket.lock().await.get().await {
            Ok(_) => {
                error_backoff = TICKET_RETRY_BACKOFF;
            }
            Err(error) => {
                warn!(%error, retry_in = ?error_backoff, "Ticket refresh failed");

                if !util::sleep_cancellable(error_backoff, &mut stop_signal).await {
                    break;
                }

                error_backoff = (error_backoff * 2).min(util::MAX_BACKOFF);
            }
        }
    }
}

async fn timeout_guard(max_duration: Duration, shared: Arc<SessionShared>, mut stop_signal: ShutdownSignal) {
    debug!(seconds = max_duration.as_secs(), "Timeout guard started");

    if util::sleep_cancellable(max_duration, &mut stop_signal).await {
        warn!(
            seconds = max_duration.as_secs(),
            "Maximum session duration reached, disconnecting",
        );
        shared.request_stop(EndReason::DurationReached);
    }
}

async fn track_loop(
    track: Arc<webrtc::track::track_remote::TrackRemote>,
    sink: Arc<tokio::sync::Mutex<Box<dyn VideoSink>>>,
    shared: Arc<SessionShared>,
    mut stop_signal: ShutdownSignal,
) {
    {
        let mut sink = sink.lock().await;
        if let Err(error) = sink.start().await {
            error!(%error, "Failed to start the video sink");
            shared.request_stop(EndReason::TrackLost);
            return;
        }
    }

    // Buffer out-of-order RTP until full H.264 access units come out.
    let mut sample_builder = SampleBuilder::new(64, H264Packet::default(), 90_000);
    let mut frame_count: u64 = 0;

    loop {
        if shared.is_stopping() || stop_signal.is_signaled() {
            break;
        }

        let read = tokio::select! {
            read = tokio::time::timeout(FRAME_READ_TIMEOUT, track.read_rtp()) => read,
            () = stop_signal.wait() => break,
        };

        match read {
            Err(_elapsed) => continue,
            Ok(Ok((packet, _attributes))) => {
                shared.touch_activity();

                sample_builder.push(packet);

                while let Some(sample) = sample_builder.pop() {
                    frame_count += 1;

                    let mut sink = sink.lock().await;
                    if let Err(error) = sink.write(&sample).await {
                        // Sink failures are logged, never propagated.
                        warn!(%error, "Video sink failed to consume a sample");
                    }
                }
            }
            Ok(Err(error)) => {
                if shared.is_stopping() {
                    break;
                }

                let error_text = error.to_string().to_lowercase();

                if error_text.contains("reset by peer") {
                    warn!("Connection reset by peer on the media track, forcing ticket refresh");
                    shared.force_ticket_refresh.store(true, Ordering::SeqCst);
                    shared.request_stop(EndReason::TrackLost);
                    break;
                }

                if ["closed", "shutdown", "reset", "connection"]
                    .iter()
                    .any(|needle| error_text.contains(needle))
                {
                    warn!(%error, "Connection error on the media track, stopping");
                    shared.request_stop(EndReason::TrackLost);
                    break;
                }

                debug!(%error, "Error receiving a media frame, continuing");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    debug!(frames = frame_count, "Track handler exiting");
}

/// Launches one live-view client per recording request; the seam the
/// recording supervisor drives.
#[derive(TypedBuilder)]
pub struct LiveViewRecorder {
    auth: Arc<dyn AuthProvider>,
    cloud: CloudClient,
    media_root: Utf8PathBuf,
    ticket_check_interval: Duration,
    #[builder(default = true)]
    wake_detection: bool,
    wake_check_interval: Duration,
    #[builder(default)]
    signalling_url: Option<Url>,
    shutdown_signal: ShutdownSignal,
}

#[async_trait]
impl Recorder for LiveViewRecorder {
    async fn record(&self, request: RecordingRequest) -> anyhow::Result<RecordingOutput> {
        let timestamp = OffsetDateTime::now_utc().unix_timestamp();

        let path = self
            .media_root
            .join(&request.device_id)
            .join("live_view")
            .join(format!("{timestamp}.mp4"));

        let sink = Box::new(Mp4Sink::new(path));

        let options = LiveViewOptions {
            device_id: request.device_id.clone(),
            max_duration: clamp_duration(request.duration),
            ticket_check_interval: self.ticket_check_interval,
            wake_detection: self.wake_detection,
            wake_check_interval: self.wake_check_interval,
            signalling_url: self.signalling_url.clone(),
        };

        let client = LiveViewClient::new(
            Arc::clone(&self.auth),
            self.cloud.clone(),
            sink,
            options,
            self.shutdown_signal.clone(),
        )?;

        let report = client.record().await?;

        Ok(RecordingOutput {
            path: report.path,
            size: report.bytes_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_durations_are_clamped_to_the_hard_cap() {
        assert_eq!(clamp_duration(Duration::from_secs(1200)), MAX_DURATION);
        assert_eq!(clamp_duration(Duration::from_secs(590)), MAX_DURATION);
        assert_eq!(clamp_duration(Duration::from_secs(20)), Duration::from_secs(20));
    }

    #[test]
    fn handshake_rejections_expose_the_http_status() {
        let response = tungstenite::http::Response::builder()
            .status(404)
            .body(None)
            .expect("response");

        let status = handshake_status(&tungstenite::Error::Http(response));
        assert_eq!(status, Some(404));

        let status = handshake_status(&tungstenite::Error::ConnectionClosed);
        assert_eq!(status, None);
    }
}
