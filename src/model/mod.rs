pub mod device;
pub mod position;

pub use device::{Device, DeviceSummary};
pub use position::Position;
