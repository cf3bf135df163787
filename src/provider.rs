//! Radar Provider
//!
//! The method surface registered with the host platform. Each call is passed
//! straight through to mayara-server. Failures never leave this module:
//! getters answer `None`, mutators answer `false`, and target acquisition
//! answers `{"success": false}`.

use serde::Serialize;
use serde_json::{json, Value};

use crate::client::BackendClient;

pub const PROVIDER_ID: &str = "mayara-radar";
pub const PROVIDER_NAME: &str = "Mayara Radar";

/// Radar summary combining the backend's capabilities and state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RadarInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spokes_per_revolution: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_spoke_len: Option<u64>,
    pub stream_url: String,
    pub controls: Value,
    pub capabilities: Value,
}

impl RadarInfo {
    fn from_parts(id: &str, stream_url: String, capabilities: Value, state: Value) -> Self {
        let text = |v: &Value, keys: &[&str]| {
            keys.iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };
        let number = |v: &Value, keys: &[&str]| keys.iter().find_map(|k| v.get(*k).and_then(Value::as_u64));

        let brand = text(&capabilities, &["make", "brand"]);
        let model = text(&capabilities, &["model"]);
        let name = text(&capabilities, &["name"])
            .or_else(|| match (&brand, &model) {
                (Some(b), Some(m)) => Some(format!("{} {}", b, m)),
                _ => None,
            })
            .unwrap_or_else(|| id.to_string());
        let status = text(&state, &["status"])
            .or_else(|| state.get("controls").and_then(|c| text(c, &["power", "status"])))
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            id: id.to_string(),
            name,
            brand,
            model,
            status,
            spokes_per_revolution: number(&capabilities, &["spokesPerRevolution"]),
            max_spoke_len: number(&capabilities, &["maxSpokeLength", "maxSpokeLen"]),
            stream_url,
            controls: state.get("controls").cloned().unwrap_or(Value::Null),
            capabilities,
        }
    }
}

/// Result of a manual target acquisition
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireTargetResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct RadarProvider {
    client: BackendClient,
}

impl RadarProvider {
    pub fn new(client: BackendClient) -> Self {
        Self { client }
    }

    /// IDs of all radars the backend currently reports
    pub async fn get_radars(&self) -> Option<Vec<String>> {
        match self.client.list_devices().await {
            Ok(devices) => Some(devices.into_keys().collect()),
            Err(e) => {
                log::debug!("get_radars: {}", e);
                None
            }
        }
    }

    pub async fn get_radar_info(&self, radar_id: &str) -> Option<RadarInfo> {
        let (capabilities, state) = tokio::join!(
            self.client.get_capabilities(radar_id),
            self.client.get_state(radar_id)
        );
        match (capabilities, state) {
            (Ok(capabilities), Ok(state)) => Some(RadarInfo::from_parts(
                radar_id,
                self.client.build_stream_url(radar_id),
                capabilities,
                state,
            )),
            (Err(e), _) | (_, Err(e)) => {
                log::debug!("get_radar_info({}): {}", radar_id, e);
                None
            }
        }
    }

    pub async fn get_capabilities(&self, radar_id: &str) -> Option<Value> {
        self.client
            .get_capabilities(radar_id)
            .await
            .map_err(|e| log::debug!("get_capabilities({}): {}", radar_id, e))
            .ok()
    }

    pub async fn get_state(&self, radar_id: &str) -> Option<Value> {
        self.client
            .get_state(radar_id)
            .await
            .map_err(|e| log::debug!("get_state({}): {}", radar_id, e))
            .ok()
    }

    pub async fn get_targets(&self, radar_id: &str) -> Option<Value> {
        self.client
            .get_targets(radar_id)
            .await
            .map_err(|e| log::debug!("get_targets({}): {}", radar_id, e))
            .ok()
    }

    pub async fn set_control(&self, radar_id: &str, control_id: &str, value: Value) -> bool {
        log::debug!("set_control({}, {}, {})", radar_id, control_id, value);
        match self.client.set_control(radar_id, control_id, value).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("set_control({}, {}) failed: {}", radar_id, control_id, e);
                false
            }
        }
    }

    /// Set radar power state: "off", "standby", "transmit" or "warming"
    pub async fn set_power(&self, radar_id: &str, state: &str) -> bool {
        self.set_control(radar_id, "power", json!(state)).await
    }

    /// Set radar range in meters
    pub async fn set_range(&self, radar_id: &str, range: u32) -> bool {
        self.set_control(radar_id, "range", json!(range)).await
    }

    pub async fn set_gain(&self, radar_id: &str, auto: bool, value: Option<u8>) -> bool {
        let mut gain = json!({ "mode": if auto { "auto" } else { "manual" } });
        if let Some(value) = value {
            gain["value"] = json!(value);
        }
        self.set_control(radar_id, "gain", gain).await
    }

    /// Set multiple radar controls at once
    pub async fn set_controls(&self, radar_id: &str, controls: &Value) -> bool {
        log::debug!("set_controls({}, {})", radar_id, controls);
        match self.client.set_controls(radar_id, controls).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("set_controls({}) failed: {}", radar_id, e);
                false
            }
        }
    }

    pub async fn acquire_target(&self, radar_id: &str, bearing: f64, distance: f64) -> AcquireTargetResult {
        match self.client.acquire_target(radar_id, bearing, distance).await {
            Ok(response) => AcquireTargetResult {
                success: response
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
                target_id: response.get("targetId").cloned(),
                error: response
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            Err(e) => {
                log::warn!("acquire_target({}) failed: {}", radar_id, e);
                AcquireTargetResult {
                    success: false,
                    target_id: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub async fn cancel_target(&self, radar_id: &str, target_id: &str) -> bool {
        match self.client.cancel_target(radar_id, target_id).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("cancel_target({}, {}) failed: {}", radar_id, target_id, e);
                false
            }
        }
    }
}
