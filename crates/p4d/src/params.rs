//! Menu item kinds, parameter display/parse rules and daily time ranges.

use thiserror::Error;

use crate::protocol::ConfigParameter;

/// Placeholder for a time window that is not in use.
pub const UNSET_TIME: &str = "nn:nn";

/// Number of from/to windows per time-range address.
pub const SLOTS: usize = 4;

// ---------------------------------------------------------------------------
// Menu kinds
// ---------------------------------------------------------------------------

pub const MENU_VALUE: u8 = 0x03;
pub const MENU_PAR_A: u8 = 0x07;
pub const MENU_PAR_B: u8 = 0x08;
pub const MENU_PAR_TIME: u8 = 0x0a;
pub const MENU_FIRMWARE: u8 = 0x0b;
pub const MENU_DIG_OUT: u8 = 0x11;
pub const MENU_DIG_IN: u8 = 0x12;
pub const MENU_ANL_OUT: u8 = 0x13;
pub const MENU_PAR_C: u8 = 0x32;
pub const MENU_PAR_D: u8 = 0x39;
pub const MENU_PAR_E: u8 = 0x40;
pub const MENU_VALUE_EXT: u8 = 0x46;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuKind {
    /// Numeric parameter, scaled by the parameter's factor.
    Parameter,
    /// Time-of-day parameter, raw value in minutes after midnight.
    Time,
    Firmware,
    DigitalOut,
    DigitalIn,
    AnalogOut,
    /// Measured value, looked up through its value fact.
    Value,
    /// Structural node (sub menu) or a type we do not display.
    Other,
}

impl MenuKind {
    pub fn from_code(code: i64) -> Self {
        match u8::try_from(code).unwrap_or(0) {
            MENU_PAR_A | MENU_PAR_B | MENU_PAR_C | MENU_PAR_D | MENU_PAR_E => Self::Parameter,
            MENU_PAR_TIME => Self::Time,
            MENU_FIRMWARE => Self::Firmware,
            MENU_DIG_OUT => Self::DigitalOut,
            MENU_DIG_IN => Self::DigitalIn,
            MENU_ANL_OUT => Self::AnalogOut,
            MENU_VALUE | MENU_VALUE_EXT => Self::Value,
            _ => Self::Other,
        }
    }

    /// Parameter kinds can be read and written through getp/setp.
    pub fn is_parameter(self) -> bool {
        matches!(self, Self::Parameter | Self::Time)
    }
}

// ---------------------------------------------------------------------------
// Parameter values
// ---------------------------------------------------------------------------

/// Human readable rendering of a raw parameter value.
pub fn to_nice(value: i32, kind: MenuKind, p: &ConfigParameter) -> String {
    match kind {
        MenuKind::Time => format!("{:02}:{:02}", value.div_euclid(60), value.rem_euclid(60)),
        _ => {
            let factor = p.factor();
            if factor == 1 && p.digits == 0 {
                value.to_string()
            } else {
                format!(
                    "{:.*}",
                    p.digits as usize,
                    value as f64 / factor as f64
                )
            }
        }
    }
}

/// Parse a user supplied value into the raw integer the controller expects.
/// Accepts `,` as decimal separator. Returns `None` on malformed input.
pub fn to_value(text: &str, kind: MenuKind, p: &ConfigParameter) -> Option<i32> {
    let text = text.trim();
    match kind {
        MenuKind::Time => parse_hhmm(text).map(|(h, m)| h as i32 * 60 + m as i32),
        _ => {
            let v: f64 = text.replace(',', ".").parse().ok()?;
            if !v.is_finite() {
                return None;
            }
            let raw = (v * p.factor() as f64).round();
            if raw < i32::MIN as f64 || raw > i32::MAX as f64 {
                return None;
            }
            Some(raw as i32)
        }
    }
}

pub fn unit_for(kind: MenuKind, p: &ConfigParameter) -> String {
    match kind {
        MenuKind::Time => "Uhr".to_string(),
        _ => p.unit.clone(),
    }
}

fn parse_hhmm(text: &str) -> Option<(u8, u8)> {
    let (h, m) = text.split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let h: u8 = h.parse().ok()?;
    let m: u8 = m.parse().ok()?;
    (h < 24 && m < 60).then_some((h, m))
}

// ---------------------------------------------------------------------------
// Time ranges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeRangeError {
    #[error("slot {0} out of range 1..=4")]
    Slot(usize),
    #[error("invalid time '{0}', expected HH:MM or nn:nn")]
    Time(String),
    #[error("address {0} outside the controller range")]
    Address(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: String,
    pub to: String,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            from: UNSET_TIME.to_string(),
            to: UNSET_TIME.to_string(),
        }
    }
}

/// The four daily windows of one controller address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRanges {
    pub address: u16,
    slots: [TimeWindow; SLOTS],
}

impl TimeRanges {
    pub fn new(address: u16) -> Self {
        Self {
            address,
            slots: Default::default(),
        }
    }

    pub fn slots(&self) -> &[TimeWindow; SLOTS] {
        &self.slots
    }

    /// Window by zero based index.
    pub fn slot(&self, index: usize) -> Option<&TimeWindow> {
        self.slots.get(index)
    }

    /// Override one window (zero based), leaving the others untouched.
    pub fn set_range(&mut self, index: usize, from: &str, to: &str) -> Result<(), TimeRangeError> {
        if index >= SLOTS {
            return Err(TimeRangeError::Slot(index + 1));
        }
        let from = normalize_time(from)?;
        let to = normalize_time(to)?;
        self.slots[index] = TimeWindow { from, to };
        Ok(())
    }
}

fn normalize_time(text: &str) -> Result<String, TimeRangeError> {
    let text = text.trim();
    if text == UNSET_TIME {
        return Ok(UNSET_TIME.to_string());
    }
    parse_hhmm(text)
        .map(|(h, m)| format!("{h:02}:{m:02}"))
        .ok_or_else(|| TimeRangeError::Time(text.to_string()))
}

// ===========================================================================
// Tests
// ===========================================================================
