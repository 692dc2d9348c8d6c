//! Best-effort wake signal for devices without a live connection.
//!
//! SimplePush-style contract: a PUT of `version=<now>` to the device's
//! callback URL. The command this wakes the device for is already stored;
//! a failure here surfaces to the enqueuing caller but rolls nothing back.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::info;

use crate::error::AppError;
use crate::model::Device;

#[derive(Clone)]
pub struct PushClient {
    http: reqwest::Client,
}

impl PushClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http })
    }

    pub async fn send(&self, device: &Device) -> Result<(), AppError> {
        let body = format!("version={}", chrono::Utc::now().timestamp());
        let resp = self
            .http
            .put(&device.push_url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|err| AppError::Push(err.to_string()))?;

        if !resp.status().is_success() {
            return Err(AppError::Push(format!(
                "push endpoint returned {}",
                resp.status()
            )));
        }
        info!(
            device_id = device.id.as_str(),
            push_url = device.push_url.as_str(),
            "push sent"
        );
        Ok(())
    }
}
