use serde::Deserialize;
use url::Url;

pub const TICKET_REQUEST_PATH: &str = "api/v1/clap/ticket/request/signalsocket";
const DEVICES_PATH: &str = "clients_api/ring_devices";

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("authentication rejected by the cloud API (HTTP {status})")]
    Auth { status: u16 },
    #[error("cloud API returned HTTP {status}")]
    Status { status: u16 },
    #[error("malformed cloud API response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl CloudError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CloudError::Auth { .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketResponse {
    pub ticket: Option<String>,
    pub region: Option<String>,
}

/// Thin client for the two upstream REST calls the daemon needs: the
/// signalsocket ticket request and the devices listing used to discover the
/// account id.
#[derive(Debug, Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    api_base_url: Url,
    client_api_base_url: Url,
}

impl CloudClient {
    pub fn new(api_base_url: Url, client_api_base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base_url,
            client_api_base_url,
        }
    }

    pub async fn request_signalsocket_ticket(&self, bearer: &str) -> Result<TicketResponse, CloudError> {
        let url = self
            .api_base_url
            .join(TICKET_REQUEST_PATH)
            .map_err(|e| CloudError::Malformed(e.to_string()))?;

        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Bearer {bearer}"))
            .send()
            .await?;

        let status = response.status();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CloudError::Auth {
                status: status.as_u16(),
            });
        }

        if !status.is_success() {
            return Err(CloudError::Status {
                status: status.as_u16(),
            });
        }

        let ticket = response.json::<TicketResponse>().await?;

        Ok(ticket)
    }

    /// Discovers the account id as the `owner.id` on the first device of the
    /// devices listing: doorbots first, then chimes, then anything else.
    pub async fn discover_account_id(&self, bearer: &str) -> Result<Option<String>, CloudError> {
        let url = self
            .client_api_base_url
            .join(DEVICES_PATH)
            .map_err(|e| CloudError::Malformed(e.to_string()))?;

        let response = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {bearer}"))
            .send()
            .await?;

        let status = response.status();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CloudError::Auth {
                status: status.as_u16(),
            });
        }

        if !status.is_success() {
            return Err(CloudError::Status {
                status: status.as_u16(),
            });
        }

        let devices = response.json::<serde_json::Value>().await?;

        Ok(account_id_from_devices(&devices))
    }
}

fn owner_id(device: &serde_json::Value) -> Option<String> {
    if let Some(id) = device.get("owner").and_then(|owner| owner.get("id")) {
        return stringify_id(id);
    }

    device.get("owner_id").and_then(stringify_id)
}

fn stringify_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn account_id_from_devices(devices: &serde_json::Value) -> Option<String> {
    let map = devices.as_object()?;

    for device_type in ["doorbots", "chimes"] {
        if let Some(list) = map.get(device_type).and_then(serde_json::Value::as_array) {
            if let Some(id) = list.iter().find_map(owner_id) {
                return Some(id);
            }
        }
    }

    map.values()
        .filter_map(serde_json::Value::as_array)
        .flatten()
        .find_map(owner_id)
}
