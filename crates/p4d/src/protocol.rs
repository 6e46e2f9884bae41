//! Request/response view of the S3200 controller.
//!
//! Everything above this module talks to the controller through
//! [`ProtocolClient`], and only while holding the device link (see
//! [`crate::link::DeviceArbiter`]). The byte-level framing lives behind the
//! trait and is not modelled here.

use thiserror::Error;

use crate::params::TimeRanges;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The controller accepted the request but kept its old value.
    #[error("controller did not apply the update")]
    NonUpdate,
    #[error("value out of range")]
    OutOfRange,
    #[error("communication error: {0}")]
    Communication(String),
    #[error("failed to open device link {device}: {reason}")]
    Open { device: String, reason: String },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ---------------------------------------------------------------------------
// Wire-level records
// ---------------------------------------------------------------------------

/// A configurable controller parameter as reported by the controller.
///
/// `value`, `default`, `min` and `max` are raw integers; the displayed value
/// is `value / factor` rendered with `digits` decimals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigParameter {
    pub address: u16,
    pub value: i32,
    pub unit: String,
    pub digits: u8,
    pub factor: i32,
    pub min: i32,
    pub max: i32,
    pub default: i32,
}

impl ConfigParameter {
    pub fn new(address: u16) -> Self {
        Self {
            address,
            value: 0,
            unit: String::new(),
            digits: 0,
            factor: 1,
            min: 0,
            max: 0,
            default: 0,
        }
    }

    pub fn factor(&self) -> i32 {
        self.factor.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControllerStatus {
    /// Controller clock, unix seconds.
    pub time: i64,
    pub state: i32,
    pub state_info: String,
    pub mode_info: String,
    pub version: String,
}

/// Digital or analog I/O channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoValue {
    pub address: u16,
    pub state: i32,
    /// Mode character for digital I/O (`A`uto / `M`anual); for analog
    /// outputs [`ANALOG_MODE_AUTO`] means automatic.
    pub mode: u8,
}

pub const ANALOG_MODE_AUTO: u8 = 0xff;

/// Description of a measured value the controller can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueSpec {
    pub address: u16,
    pub name: String,
    pub description: String,
    pub unit: String,
    pub factor: i32,
}

/// One node of the controller's menu tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    pub id: i64,
    pub parent: i64,
    pub kind: u8,
    pub address: u16,
    pub title: String,
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

pub trait ProtocolClient {
    /// Fill `p` (value, unit, limits) from the controller.
    fn get_parameter(&mut self, p: &mut ConfigParameter) -> ProtocolResult<()>;
    /// Write `p.value`; on success `p` reflects the controller's view.
    fn set_parameter(&mut self, p: &mut ConfigParameter) -> ProtocolResult<()>;
    fn get_value(&mut self, address: u16) -> ProtocolResult<i32>;
    fn get_status(&mut self) -> ProtocolResult<ControllerStatus>;
    fn get_digital_in(&mut self, address: u16) -> ProtocolResult<IoValue>;
    fn get_digital_out(&mut self, address: u16) -> ProtocolResult<IoValue>;
    fn get_analog_out(&mut self, address: u16) -> ProtocolResult<IoValue>;
    /// Restart the time-range iteration. `Ok(None)` means no ranges at all.
    fn get_first_time_ranges(&mut self) -> ProtocolResult<Option<TimeRanges>>;
    /// `Ok(None)` once the iteration is exhausted.
    fn get_next_time_ranges(&mut self) -> ProtocolResult<Option<TimeRanges>>;
    fn set_time_ranges(&mut self, ranges: &TimeRanges) -> ProtocolResult<()>;
    /// Set the controller clock to `now` (unix seconds).
    fn sync_time(&mut self, now: i64) -> ProtocolResult<()>;
    fn value_specs(&mut self) -> ProtocolResult<Vec<ValueSpec>>;
    fn menu_items(&mut self) -> ProtocolResult<Vec<MenuEntry>>;
}
