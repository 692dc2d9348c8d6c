use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub deviceid: Option<String>,
    #[serde(default)]
    pub pushurl: Option<String>,
    #[serde(default)]
    pub assert: Option<String>,
    #[serde(default)]
    pub accepts: Option<Vec<String>>,
    #[serde(default)]
    pub has_passcode: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct RegisterReply {
    pub deviceid: String,
    pub secret: String,
    pub clientid: String,
    pub email: String,
}
