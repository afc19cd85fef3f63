//! Live feed built on periodic historical fetches

pub mod consumer;
pub mod datafeed;
pub mod seis;
pub mod trigger;

pub use consumer::{Callback, Consumer};
pub use datafeed::TvDatafeedLive;
pub use seis::Seis;
pub use trigger::SeisesAndTrigger;
