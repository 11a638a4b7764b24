use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const KIND_DING: &str = "ding";
pub const KIND_MOTION: &str = "motion";
pub const KIND_ON_DEMAND: &str = "on_demand";

/// Kind of a camera event.
///
/// Unknown kinds are carried verbatim so they round-trip through every
/// storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ding,
    Motion,
    OnDemand,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Ding => KIND_DING,
            EventKind::Motion => KIND_MOTION,
            EventKind::OnDemand => KIND_ON_DEMAND,
            EventKind::Other(kind) => kind,
        }
    }

    /// Kinds that trigger a live-view recording.
    pub fn is_triggering(&self) -> bool {
        matches!(self, EventKind::Ding | EventKind::Motion)
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            KIND_DING => EventKind::Ding,
            KIND_MOTION => EventKind::Motion,
            KIND_ON_DEMAND => EventKind::OnDemand,
            other => EventKind::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(EventKind::from(value.as_str()))
    }
}

/// Normalised camera event, persisted as-is by every storage backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub kind: EventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub has_video: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_detection_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    /// Unknown fields of the upstream payload, preserved passthrough.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EventRecord {
    /// Minimal record synthesised when a recording finishes for an event
    /// no storage knows about.
    pub fn synthesised(event_id: &str, kind: EventKind, device_id: &str) -> Self {
        Self {
            id: event_id.to_owned(),
            kind,
            created_at: OffsetDateTime::now_utc(),
            device_id: device_id.to_owned(),
            device_name: "Unknown Device".to_owned(),
            has_video: false,
            video_path: None,
            answered: None,
            motion_detection_score: None,
            requester: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Native push notification, as decoded from the notification transport.
#[derive(Debug, Clone, Deserialize)]
pub struct PushNotification {
    pub id: i64,
    pub kind: String,
    /// Reception time, seconds since the Unix epoch.
    pub now: f64,
    pub doorbot_id: u64,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// Raw inbound event: either the native notification object or a loose map.
///
/// Normalisation is the only place that reads untyped fields.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Native(PushNotification),
    Generic(serde_json::Map<String, serde_json::Value>),
}

fn coerce_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn coerce_timestamp(value: &serde_json::Value) -> Option<OffsetDateTime> {
    match value {
        serde_json::Value::String(s) => OffsetDateTime::parse(s, &Rfc3339).ok(),
        serde_json::Value::Number(n) => {
            #[allow(clippy::cast_possible_truncation)]
            let secs = n.as_f64()? as i64;
            OffsetDateTime::from_unix_timestamp(secs).ok()
        }
        _ => None,
    }
}

/// Converts a raw event into a typed record.
///
/// Coercions: `id` is stringified, `created_at` accepts epoch seconds or an
/// RFC 3339 string, the device id comes from `doorbot_id` or `doorbot.id`.
pub fn normalise(raw: &RawEvent) -> anyhow::Result<EventRecord> {
    match raw {
        RawEvent::Native(notification) => {
            let kind = EventKind::from(notification.kind.as_str());

            #[allow(clippy::cast_possible_truncation)]
            let created_at = OffsetDateTime::from_unix_timestamp(notification.now as i64)
                .unwrap_or_else(|_| OffsetDateTime::now_utc());

            let mut record = EventRecord {
                id: notification.id.to_string(),
                kind: kind.clone(),
                created_at,
                device_id: notification.doorbot_id.to_string(),
                device_name: notification
                    .device_name
                    .clone()
                    .unwrap_or_else(|| "Unknown Device".to_owned()),
                has_video: false,
                video_path: None,
                answered: None,
                motion_detection_score: None,
                requester: None,
                extra: serde_json::Map::new(),
            };

            // The native notification does not carry these, only the defaults.
            match kind {
                EventKind::Ding => record.answered = Some(false),
                EventKind::Motion | EventKind::OnDemand | EventKind::Other(_) => {}
            }

            Ok(record)
        }
        RawEvent::Generic(map) => {
            let kind = map
                .get("kind")
                .and_then(serde_json::Value::as_str)
                .map(EventKind::from)
                .unwrap_or_else(|| EventKind::Other("unknown".to_owned()));

            let id = map.get("id").and_then(coerce_id).unwrap_or_else(|| {
                format!("unknown-{}", OffsetDateTime::now_utc().unix_timestamp())
            });

            let created_at = map
                .get("created_at")
                .and_then(coerce_timestamp)
                .unwrap_or_else(OffsetDateTime::now_utc);

            let doorbot = map.get("doorbot").and_then(serde_json::Value::as_object);

            let device_id = map
                .get("doorbot_id")
                .and_then(coerce_id)
                .or_else(|| doorbot.and_then(|d| d.get("id")).and_then(coerce_id))
                .ok_or_else(|| anyhow::anyhow!("event {id} carries no device id"))?;

            let device_name = doorbot
                .and_then(|d| d.get("description"))
                .and_then(serde_json::Value::as_str)
                .or_else(|| map.get("device_name").and_then(serde_json::Value::as_str))
                .unwrap_or("Unknown Device")
                .to_owned();

            let mut record = EventRecord {
                id,
                kind: kind.clone(),
                created_at,
                device_id,
                device_name,
                has_video: false,
                video_path: None,
                answered: None,
                motion_detection_score: None,
                requester: None,
                extra: serde_json::Map::new(),
            };

            match kind {
                EventKind::Ding => {
                    record.answered = Some(
                        map.get("answered")
                            .and_then(serde_json::Value::as_bool)
                            .unwrap_or(false),
                    );
                }
                EventKind::Motion => {
                    record.motion_detection_score =
                        map.get("cv_score").and_then(serde_json::Value::as_f64);
                }
                EventKind::OnDemand => {
                    record.requester = map
                        .get("requester")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_owned);
                }
                EventKind::Other(_) => {}
            }

            const CONSUMED: &[&str] = &[
                "id",
                "kind",
                "created_at",
                "doorbot",
                "doorbot_id",
                "device_name",
                "answered",
                "cv_score",
                "requester",
            ];

            for (key, value) in map {
                if !CONSUMED.contains(&key.as_str()) {
                    record.extra.insert(key.clone(), value.clone());
                }
            }

            Ok(record)
        }
    }
}

impl<'de> Deserialize<'de> for RawEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Object(map) => Ok(RawEvent::Generic(map)),
            other => Err(D::Error::custom(format!(
                "expected a JSON object for a raw event, got {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic(payload: serde_json::Value) -> RawEvent {
        match payload {
            serde_json::Value::Object(map) => RawEvent::Generic(map),
            _ => panic!("test payload must be an object"),
        }
    }

    #[test]
    fn normalises_a_motion_notification() {
        let raw = generic(serde_json::json!({
            "id": "evt-1",
            "kind": "motion",
            "created_at": "2024-01-01T00:00:00Z",
            "cv_score": 0.87,
            "doorbot": {"id": "dev-9", "description": "Front"},
        }));

        let record = normalise(&raw).expect("normalise");

        assert_eq!(record.id, "evt-1");
        assert_eq!(record.kind, EventKind::Motion);
        assert_eq!(record.device_id, "dev-9");
        assert_eq!(record.device_name, "Front");
        assert_eq!(record.motion_detection_score, Some(0.87));
        assert!(!record.has_video);
        assert_eq!(record.created_at.unix_timestamp(), 1_704_067_200);
    }

    #[test]
    fn coerces_numeric_ids_and_epoch_timestamps() {
        let raw = generic(serde_json::json!({
            "id": 7231,
            "kind": "ding",
            "created_at": 1700000000,
            "doorbot": {"id": 42, "description": "Porch"},
        }));

        let record = normalise(&raw).expect("normalise");

        assert_eq!(record.id, "7231");
        assert_eq!(record.device_id, "42");
        assert_eq!(record.created_at.unix_timestamp(), 1_700_000_000);
        assert_eq!(record.answered, Some(false));
    }

    #[test]
    fn unknown_kinds_pass_through_with_the_base_record() {
        let raw = generic(serde_json::json!({
            "id": "evt-2",
            "kind": "alarm_siren",
            "doorbot_id": 9,
            "battery_level": 71,
        }));

        let record = normalise(&raw).expect("normalise");

        assert_eq!(record.kind, EventKind::Other("alarm_siren".to_owned()));
        assert_eq!(record.device_id, "9");
        assert_eq!(
            record.extra.get("battery_level"),
            Some(&serde_json::json!(71))
        );
        assert!(record.answered.is_none());
    }

    #[test]
    fn extra_fields_round_trip_through_serde() {
        let raw = generic(serde_json::json!({
            "id": "evt-3",
            "kind": "motion",
            "created_at": "2024-06-01T12:00:00Z",
            "doorbot": {"id": "dev-1", "description": "Gate"},
            "state": "ringing",
        }));

        let record = normalise(&raw).expect("normalise");
        let json = serde_json::to_string(&record).expect("serialize");
        let back: EventRecord = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(back, record);
        assert_eq!(back.extra.get("state"), Some(&serde_json::json!("ringing")));
    }

    #[test]
    fn native_notifications_are_normalised_too() {
        let raw = RawEvent::Native(PushNotification {
            id: 99,
            kind: "ding".to_owned(),
            now: 1_700_000_000.0,
            doorbot_id: 5,
            device_name: Some("Front".to_owned()),
        });

        let record = normalise(&raw).expect("normalise");

        assert_eq!(record.id, "99");
        assert_eq!(record.kind, EventKind::Ding);
        assert_eq!(record.device_id, "5");
        assert_eq!(record.answered, Some(false));
    }

    #[test]
    fn missing_device_id_is_rejected() {
        let raw = generic(serde_json::json!({"id": "evt-4", "kind": "motion"}));
        assert!(normalise(&raw).is_err());
    }
}
