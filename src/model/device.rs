use serde::{Deserialize, Serialize};

/// A registered device and everything the server knows about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,           // opaque, <= 32 chars, restricted charset
    pub user_id: String,      // owning user
    pub name: String,         // display name
    pub secret: String,       // shared HMAC secret, rotated on registration
    pub push_url: String,     // wake callback
    pub has_passcode: bool,   // is the device lockable
    pub accepts: String,      // single-letter command codes, always contains 'h'
    pub last_exchange: i64,   // unix seconds of the last exchange
    pub access_token: Option<String>, // OAuth access token, when the login flow set one
}

impl Device {
    pub fn accepts_code(&self, code: char) -> bool {
        self.accepts.contains(code.to_ascii_lowercase())
    }
}

/// Compact listing entry for a user's devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
}
