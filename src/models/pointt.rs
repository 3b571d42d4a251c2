//! Wire models for the Pointt API (`/gateways/`, `/bulk`).
//!
//! Only the fields this crate reads are modeled; everything else is ignored.

use serde::{Deserialize, Serialize};

use crate::models::energy::{Quantity, Recording, Resolution, Window};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayId(pub String);

impl core::fmt::Display for GatewayId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    pub device_id: GatewayId,
    #[serde(default)]
    pub device_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    pub gateway_id: GatewayId,
    pub resource_paths: Vec<String>,
}

impl BulkRequest {
    pub fn for_window(gateway: &GatewayId, window: Window) -> Self {
        BulkRequest {
            gateway_id: gateway.clone(),
            resource_paths: Quantity::FETCHED
                .into_iter()
                .filter_map(|q| window.resource_path(q))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResponse {
    #[serde(default)]
    pub resource_paths: Option<Vec<ResourceResponse>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceResponse {
    pub resource_path: String,
    #[serde(default)]
    pub gateway_response: Option<GatewayResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayResponse {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub payload: Option<RecordingPayload>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingPayload {
    #[serde(default)]
    pub recording: Option<Vec<RecordingPoint>>,
    #[serde(default)]
    pub sample_rate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordingPoint {
    /// Energy in Wh; null for buckets the controller has not reported.
    #[serde(default)]
    pub y: Option<f64>,
}

/// Flatten a bulk response into recordings for `window`.
///
/// Entries without status 200, without payload, or for unknown resources are
/// skipped. Point `i` is stamped `window start + i * sample rate` on the
/// controller's naive wall clock. On DST-switch days the controller reports
/// 23 or 25 hourly points, so stamps after the switch are off by one hour;
/// points that would land past the window end are dropped.
pub fn recordings_from_bulk(responses: &[BulkResponse], window: Window) -> Vec<Recording> {
    let mut out = Vec::new();
    for entry in responses.iter().flat_map(|r| r.resource_paths.as_deref().unwrap_or(&[])) {
        let Some(quantity) = Quantity::from_resource_path(&entry.resource_path) else {
            continue;
        };
        let Some(gw) = entry.gateway_response.as_ref() else {
            continue;
        };
        if gw.status != Some(200) {
            continue;
        }
        let Some(payload) = gw.payload.as_ref() else {
            continue;
        };

        let resolution = payload
            .sample_rate
            .as_deref()
            .and_then(Resolution::from_sample_rate)
            .unwrap_or_else(|| window.resolution());
        let (start, end) = (window.start(), window.end());
        for (i, point) in payload.recording.as_deref().unwrap_or(&[]).iter().enumerate() {
            let Ok(offset) = i32::try_from(i) else { break };
            let timestamp = start + resolution.step() * offset;
            if timestamp >= end {
                break;
            }
            let Some(value_wh) = point.y else { continue };
            out.push(Recording {
                timestamp,
                quantity,
                value_wh,
                resolution,
            });
        }
    }
    out
}
