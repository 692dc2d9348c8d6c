use serde::{Deserialize, Serialize};

/// Latest reported device position. Only the most recent fix is retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub time: i64, // unix seconds of the fix; zero means "no fix"
}
