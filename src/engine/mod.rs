//! Core engine: listing valuation, rate blending and the run loop.

pub mod driver;
pub mod rates;
pub mod valuation;

pub use driver::{stop_channel, DriverConfig, RunDriver, RunMode, StopHandle, StopSignal};
pub use rates::{RatePolicy, RateQuotes};
pub use valuation::{Appraisal, PreparedListing, RateUpdate, Skip, Valuator};
