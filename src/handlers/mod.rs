use serde::Serialize;

pub mod conversions;
pub mod events;
pub mod health;
pub mod visits;

pub use conversions::*;
pub use events::*;
pub use health::*;
pub use visits::*;

/// Acknowledgement body for write endpoints that have nothing else to report.
#[derive(Debug, Serialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}
