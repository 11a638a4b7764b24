use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Subprotocol required by the signalling endpoint.
pub const SUBPROTOCOL: &str = "aws.iot.webrtc.signalling.lightcone";

const SIGNALLING_DOMAIN: &str = "prod.signalling.ring.devices.a2z.com";

pub const CLOSE_CODE_NOT_READY: i64 = 26;

/// Builds the signalling WebSocket URL for a ticket, omitting the region
/// segment when the ticket was issued without one.
pub fn build_ws_url(ticket: &str, region: Option<&str>) -> Url {
    let host = match region {
        Some(region) => format!("api.{region}.{SIGNALLING_DOMAIN}"),
        None => format!("api.{SIGNALLING_DOMAIN}"),
    };

    let client_id = format!("ring_site-{}", Uuid::new_v4());

    Url::parse_with_params(
        &format!("wss://{host}/ws"),
        &[
            ("api_version", "4.0"),
            ("auth_type", "ring_solutions"),
            ("client_id", client_id.as_str()),
            ("token", ticket),
        ],
    )
    .expect("statically well-formed URL")
}

/// ICE candidate payload as exchanged over the signalling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Outbound message envelope. Every message carries the dialog id of the
/// negotiation and a fresh per-message request id.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub method: &'static str,
    pub dialog_id: Uuid,
    pub riid: String,
    pub body: serde_json::Value,
}

impl Envelope {
    fn new(method: &'static str, dialog_id: Uuid, body: serde_json::Value) -> Self {
        Self {
            method,
            dialog_id,
            riid: Uuid::new_v4().simple().to_string(),
            body,
        }
    }

    pub fn live_view(dialog_id: Uuid, doorbot_id: u64, sdp: &str) -> Self {
        Self::new(
            "live_view",
            dialog_id,
            serde_json::json!({
                "doorbot_id": doorbot_id,
                "sdp": sdp,
                "stream_options": {
                    "audio_enabled": false,
                    "video_enabled": true,
                    "ptz_enabled": false,
                },
            }),
        )
    }

    pub fn ice_candidate(dialog_id: Uuid, doorbot_id: u64, candidate: &IceCandidatePayload) -> Self {
        Self::new(
            "icecandidate",
            dialog_id,
            serde_json::json!({
                "doorbot_id": doorbot_id,
                "candidate": candidate,
            }),
        )
    }

    pub fn ping(dialog_id: Uuid, doorbot_id: u64, session_jwt: &str) -> Self {
        Self::new(
            "ping",
            dialog_id,
            serde_json::json!({
                "doorbot_id": doorbot_id,
                "session_id": session_jwt,
            }),
        )
    }

    /// Sent when no peer activity was observed for a while, so the server
    /// does not evict the session as unanswered.
    pub fn refresh(dialog_id: Uuid, doorbot_id: u64, session_jwt: &str) -> Self {
        Self::new(
            "refresh",
            dialog_id,
            serde_json::json!({
                "doorbot_id": doorbot_id,
                "session_id": session_jwt,
            }),
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization cannot fail")
    }
}

/// Inbound signalling message, classified by method.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    SessionCreated { session_jwt: String },
    /// `live_view` response; the SDP answer may ride along.
    LiveViewAnswer { sdp: Option<String> },
    /// Standalone `sdp` message.
    SdpAnswer { sdp: Option<String> },
    CameraStarted,
    IceCandidate(IceCandidatePayload),
    Notification { text: String },
    Close { code: Option<i64>, text: String },
    Ping,
    Pong,
    Other { method: String },
}

impl SignalMessage {
    /// Parses one frame of signalling JSON. Frames without a `method` and
    /// non-JSON frames are reported as an error and skipped by the caller.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;

        let method = value
            .get("method")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("signalling frame carries no method"))?;

        let body = value.get("body");

        let message = match method {
            "session_created" => {
                let session_jwt = body
                    .and_then(|b| b.get("session_id"))
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("session_created carries no session_id"))?
                    .to_owned();
                SignalMessage::SessionCreated { session_jwt }
            }
            "live_view" => SignalMessage::LiveViewAnswer {
                sdp: body
                    .and_then(|b| b.get("sdp"))
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned),
            },
            "sdp" => SignalMessage::SdpAnswer {
                sdp: body
                    .and_then(|b| b.get("sdp"))
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned),
            },
            "camera_started" => SignalMessage::CameraStarted,
            "icecandidate" => {
                let candidate = body
                    .and_then(|b| b.get("candidate"))
                    .ok_or_else(|| anyhow::anyhow!("icecandidate carries no candidate"))?;
                SignalMessage::IceCandidate(serde_json::from_value(candidate.clone())?)
            }
            "notification" => SignalMessage::Notification {
                text: body
                    .and_then(|b| b.get("text"))
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("No text")
                    .to_owned(),
            },
            "close" => {
                let reason = body.and_then(|b| b.get("reason"));
                SignalMessage::Close {
                    code: reason
                        .and_then(|r| r.get("code"))
                        .and_then(serde_json::Value::as_i64),
                    text: reason
                        .and_then(|r| r.get("text"))
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("Unknown reason")
                        .to_owned(),
                }
            }
            "ping" => SignalMessage::Ping,
            "pong" => SignalMessage::Pong,
            other => SignalMessage::Other {
                method: other.to_owned(),
            },
        };

        Ok(message)
    }
}

/// What the negotiation loop should do with an inbound message.
#[derive(Debug, PartialEq)]
pub enum NegotiationAction {
    None,
    ApplyAnswer(String),
    AddCandidate(IceCandidatePayload),
    /// Close reason 26 ("not ready"): wait 300 ms and keep the session.
    WaitNotReady,
    /// Both `session_created` and `camera_started` have been observed.
    Connected { session_jwt: String },
}

#[derive(Debug, thiserror::Error)]
#[error("peer closed the session: {text} (code {code:?})")]
pub struct PeerClosed {
    pub code: Option<i64>,
    pub text: String,
}

/// Tracks the two completion conditions of the setup phase: the server must
/// have created a session (yielding the session JWT) and the camera must
/// have started. The transition happens on whichever arrives last.
#[derive(Debug, Default)]
pub struct Negotiation {
    session_jwt: Option<String>,
    camera_started: bool,
}

impl Negotiation {
    pub fn new() -> Self {
        Self::default()
    }

    fn completed(&self) -> Option<NegotiationAction> {
        if self.camera_started {
            self.session_jwt
                .clone()
                .map(|session_jwt| NegotiationAction::Connected { session_jwt })
        } else {
            None
        }
    }

    pub fn handle(&mut self, message: SignalMessage) -> Result<NegotiationAction, PeerClosed> {
        match message {
            SignalMessage::SessionCreated { session_jwt } => {
                debug!("Session created");
                self.session_jwt = Some(session_jwt);
                Ok(self.completed().unwrap_or(NegotiationAction::None))
            }
            SignalMessage::LiveViewAnswer { sdp: Some(sdp) } | SignalMessage::SdpAnswer { sdp: Some(sdp) } => {
                Ok(NegotiationAction::ApplyAnswer(sdp))
            }
            SignalMessage::LiveViewAnswer { sdp: None } | SignalMessage::SdpAnswer { sdp: None } => {
                Ok(NegotiationAction::None)
            }
            SignalMessage::CameraStarted => {
                info!("Camera started and ready to stream");
                self.camera_started = true;
                Ok(self.completed().unwrap_or(NegotiationAction::None))
            }
            SignalMessage::IceCandidate(candidate) => Ok(NegotiationAction::AddCandidate(candidate)),
            SignalMessage::Notification { text } => {
                info!(%text, "Received notification");
                Ok(NegotiationAction::None)
            }
            SignalMessage::Close { code: Some(CLOSE_CODE_NOT_READY), .. } => {
                debug!("Camera not ready yet (close code 26)");
                Ok(NegotiationAction::WaitNotReady)
            }
            SignalMessage::Close { code, text } => Err(PeerClosed { code, text }),
            SignalMessage::Ping | SignalMessage::Pong => Ok(NegotiationAction::None),
            SignalMessage::Other { method } => {
                debug!(%method, "Unrecognized signalling method");
                Ok(NegotiationAction::None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_includes_the_region_segment_when_present() {
        let url = build_ws_url("ticket-123", Some("eu-west-1"));

        assert_eq!(url.scheme(), "wss");
        assert_eq!(
            url.host_str(),
            Some("api.eu-west-1.prod.signalling.ring.devices.a2z.com")
        );
        assert_eq!(url.path(), "/ws");

        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("api_version".to_owned(), "4.0".to_owned())));
        assert!(query.contains(&("auth_type".to_owned(), "ring_solutions".to_owned())));
        assert!(query.contains(&("token".to_owned(), "ticket-123".to_owned())));
        assert!(query.iter().any(|(k, v)| k == "client_id" && v.starts_with("ring_site-")));
    }

    #[test]
    fn ws_url_omits_the_region_segment_without_a_region() {
        let url = build_ws_url("t", None);
        assert_eq!(url.host_str(), Some("api.prod.signalling.ring.devices.a2z.com"));
    }

    #[test]
    fn outbound_envelopes_carry_a_fresh_riid() {
        let dialog_id = Uuid::new_v4();
        let first = Envelope::ping(dialog_id, 42, "jwt");
        let second = Envelope::ping(dialog_id, 42, "jwt");

        assert_ne!(first.riid, second.riid);
        assert_eq!(first.riid.len(), 32);
        assert!(first.riid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn live_view_request_shape() {
        let dialog_id = Uuid::new_v4();
        let envelope = Envelope::live_view(dialog_id, 7, "v=0");
        let json: serde_json::Value = serde_json::from_str(&envelope.to_json()).expect("json");

        assert_eq!(json["method"], "live_view");
        assert_eq!(json["dialog_id"], dialog_id.to_string());
        assert_eq!(json["body"]["doorbot_id"], 7);
        assert_eq!(json["body"]["sdp"], "v=0");
        assert_eq!(json["body"]["stream_options"]["audio_enabled"], false);
        assert_eq!(json["body"]["stream_options"]["video_enabled"], true);
        assert_eq!(json["body"]["stream_options"]["ptz_enabled"], false);
    }

    #[test]
    fn parses_the_protocol_table() {
        let msg = SignalMessage::parse(r#"{"method":"session_created","body":{"session_id":"jwt-1"}}"#)
            .expect("parse");
        assert_eq!(msg, SignalMessage::SessionCreated { session_jwt: "jwt-1".to_owned() });

        let msg = SignalMessage::parse(r#"{"method":"live_view","body":{"sdp":"v=0"}}"#).expect("parse");
        assert_eq!(msg, SignalMessage::LiveViewAnswer { sdp: Some("v=0".to_owned()) });

        let msg = SignalMessage::parse(r#"{"method":"close","body":{"reason":{"code":26,"text":"not ready"}}}"#)
            .expect("parse");
        assert_eq!(
            msg,
            SignalMessage::Close {
                code: Some(26),
                text: "not ready".to_owned()
            }
        );

        let msg = SignalMessage::parse(r#"{"method":"pong"}"#).expect("parse");
        assert_eq!(msg, SignalMessage::Pong);

        let msg = SignalMessage::parse(r#"{"method":"mystery","body":{}}"#).expect("parse");
        assert_eq!(msg, SignalMessage::Other { method: "mystery".to_owned() });
    }

    #[test]
    fn negotiation_completes_on_camera_started_after_session_created() {
        let mut negotiation = Negotiation::new();

        let action = negotiation
            .handle(SignalMessage::SessionCreated { session_jwt: "jwt".to_owned() })
            .expect("no close");
        assert_eq!(action, NegotiationAction::None);

        let action = negotiation.handle(SignalMessage::CameraStarted).expect("no close");
        assert_eq!(action, NegotiationAction::Connected { session_jwt: "jwt".to_owned() });
    }

    #[test]
    fn negotiation_completes_on_session_created_after_camera_started() {
        let mut negotiation = Negotiation::new();

        negotiation.handle(SignalMessage::CameraStarted).expect("no close");
        let action = negotiation
            .handle(SignalMessage::SessionCreated { session_jwt: "jwt".to_owned() })
            .expect("no close");

        assert_eq!(action, NegotiationAction::Connected { session_jwt: "jwt".to_owned() });
    }

    #[test]
    fn close_code_26_never_fails_the_session() {
        let mut negotiation = Negotiation::new();

        let action = negotiation
            .handle(SignalMessage::Close { code: Some(26), text: "not ready".to_owned() })
            .expect("not fatal");
        assert_eq!(action, NegotiationAction::WaitNotReady);

        // E5: the camera comes up shortly after.
        negotiation.handle(SignalMessage::CameraStarted).expect("no close");
        let action = negotiation
            .handle(SignalMessage::SessionCreated { session_jwt: "jwt".to_owned() })
            .expect("no close");
        assert!(matches!(action, NegotiationAction::Connected { .. }));
    }

    #[test]
    fn any_other_close_is_fatal() {
        let mut negotiation = Negotiation::new();

        let error = negotiation
            .handle(SignalMessage::Close { code: Some(5), text: "gone".to_owned() })
            .expect_err("fatal");
        assert_eq!(error.code, Some(5));
    }
}
