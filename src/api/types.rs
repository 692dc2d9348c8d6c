use serde::Serialize;

use crate::model::{DeviceSummary, Position};

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceSummary>,
}

/// Device state shown to its owner. The shared secret stays server-side.
#[derive(Debug, Serialize)]
pub struct DeviceStateResponse {
    pub id: String,
    pub name: String,
    pub has_passcode: bool,
    pub accepts: String,
    pub last_exchange: i64,
    pub position: Option<Position>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: String,
}
