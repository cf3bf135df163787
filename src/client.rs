//! HTTP client for the mayara-server Radar API.
//!
//! Every call is a single request with a fixed deadline. Retrying is left to
//! the caller: the fleet retries discovery on its own cadence, relays retry
//! their stream, and the device proxy reports failures without retrying.

use async_trait::async_trait;
use reqwest::{Method, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, ConfigError};

/// Deadline for a single backend request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const API_PREFIX: &str = "/v2/api";

/// One entry of `GET /v2/api/radars`.
///
/// Only the fields the bridge reports on are typed, the rest is kept as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spokes_per_revolution: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_spoke_len: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl DeviceSummary {
    /// Typed view of one radar entry. An entry whose known fields have
    /// unexpected types keeps only its raw fields.
    fn from_value(device_id: &str, value: Value) -> Self {
        match serde_json::from_value(value.clone()) {
            Ok(summary) => summary,
            Err(e) => {
                log::debug!("Radar '{}': unexpected summary: {}", device_id, e);
                let extra = match value {
                    Value::Object(map) => map,
                    other => {
                        let mut map = serde_json::Map::new();
                        map.insert("value".to_string(), other);
                        map
                    }
                };
                DeviceSummary {
                    extra,
                    ..DeviceSummary::default()
                }
            }
        }
    }
}

/// The part of the backend the fleet needs: the device list and where to
/// find each device's spoke stream.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn list_devices(&self) -> Result<BTreeMap<String, DeviceSummary>, BridgeError>;

    fn build_stream_url(&self, device_id: &str) -> String;
}

/// Build the spoke stream URL for a device.
///
/// Pure and deterministic: the same inputs always give the same URL.
pub fn stream_url(host: &str, port: u16, secure: bool, device_id: &str) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    format!(
        "{}://{}:{}{}/radars/{}/spokes",
        scheme,
        host,
        port,
        API_PREFIX,
        encode_path_segment(device_id)
    )
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    host: String,
    port: u16,
    secure: bool,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(config: &BridgeConfig) -> Result<Self, BridgeError> {
        Self::with_timeout(config, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(config: &BridgeConfig, timeout: Duration) -> Result<Self, BridgeError> {
        let port = u16::try_from(config.port).map_err(|_| ConfigError::InvalidPort(config.port))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Unreachable(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            host: config.host.clone(),
            port,
            secure: config.secure,
            timeout,
        })
    }

    fn api_url(&self, path: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}{}{}", scheme, self.host, self.port, API_PREFIX, path)
    }

    fn device_url(&self, device_id: &str, suffix: &str) -> String {
        self.api_url(&format!("/radars/{}{}", encode_path_segment(device_id), suffix))
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Response, BridgeError> {
        log::trace!("{} {}", method, url);
        let mut request = self.http.request(method.clone(), url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let timeout_ms = self.timeout.as_millis() as u64;
        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::from_reqwest(e, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            log::debug!("{} {} -> {}: {}", method, url, status, text);
            return Err(BridgeError::BadResponse(format!("{} {} returned {}", method, url, status)));
        }
        Ok(response)
    }

    async fn get_json(&self, url: &str) -> Result<Value, BridgeError> {
        let response = self.request(Method::GET, url, None).await?;
        response
            .json()
            .await
            .map_err(|e| BridgeError::from_reqwest(e, self.timeout.as_millis() as u64))
    }

    /// Send a mutation. Acknowledgements may have an empty or non-JSON body,
    /// which is returned as `Null` or a string respectively.
    async fn send_json(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Value, BridgeError> {
        let response = self.request(method, url, body).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BridgeError::from_reqwest(e, self.timeout.as_millis() as u64))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())))
    }

    pub async fn list_devices(&self) -> Result<BTreeMap<String, DeviceSummary>, BridgeError> {
        let value = self.get_json(&self.api_url("/radars")).await?;
        let entries: BTreeMap<String, Value> = serde_json::from_value(value)
            .map_err(|e| BridgeError::BadResponse(format!("Cannot parse radar list: {}", e)))?;
        Ok(entries
            .into_iter()
            .map(|(id, value)| {
                let summary = DeviceSummary::from_value(&id, value);
                (id, summary)
            })
            .collect())
    }

    pub async fn get_capabilities(&self, device_id: &str) -> Result<Value, BridgeError> {
        self.get_json(&self.device_url(device_id, "/capabilities")).await
    }

    pub async fn get_state(&self, device_id: &str) -> Result<Value, BridgeError> {
        self.get_json(&self.device_url(device_id, "/state")).await
    }

    pub async fn set_control(&self, device_id: &str, key: &str, value: Value) -> Result<Value, BridgeError> {
        let url = self.device_url(device_id, &format!("/controls/{}", encode_path_segment(key)));
        self.send_json(Method::PUT, &url, Some(&json!({ "value": value }))).await
    }

    pub async fn set_controls(&self, device_id: &str, controls: &Value) -> Result<Value, BridgeError> {
        let url = self.device_url(device_id, "/controls");
        self.send_json(Method::PUT, &url, Some(controls)).await
    }

    pub async fn get_targets(&self, device_id: &str) -> Result<Value, BridgeError> {
        self.get_json(&self.device_url(device_id, "/targets")).await
    }

    /// Manual target acquisition. The backend answers with `{"targetId": ..}`.
    pub async fn acquire_target(&self, device_id: &str, bearing: f64, distance: f64) -> Result<Value, BridgeError> {
        let url = self.device_url(device_id, "/targets");
        let body = json!({ "bearing": bearing, "distance": distance });
        self.send_json(Method::POST, &url, Some(&body)).await
    }

    pub async fn cancel_target(&self, device_id: &str, target_id: &str) -> Result<(), BridgeError> {
        let url = self.device_url(device_id, &format!("/targets/{}", encode_path_segment(target_id)));
        self.send_json(Method::DELETE, &url, None).await.map(|_| ())
    }

    pub fn build_stream_url(&self, device_id: &str) -> String {
        stream_url(&self.host, self.port, self.secure, device_id)
    }
}

#[async_trait]
impl DeviceSource for BackendClient {
    async fn list_devices(&self) -> Result<BTreeMap<String, DeviceSummary>, BridgeError> {
        BackendClient::list_devices(self).await
    }

    fn build_stream_url(&self, device_id: &str) -> String {
        BackendClient::build_stream_url(self, device_id)
    }
}
