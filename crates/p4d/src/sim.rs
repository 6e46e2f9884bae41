//! In-memory S3200 controller for running the daemon without hardware.
//!
//! Measured values follow a random walk with mean reversion so the stored
//! history and the alert rules have something realistic to look at.
//! Parameters, I/O channels, time ranges and the menu tree are plain tables
//! that tests can inspect and modify through a shared handle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::now_unix;
use crate::link::{open_error, DeviceLink};
use crate::params::{
    TimeRanges, MENU_ANL_OUT, MENU_DIG_IN, MENU_DIG_OUT, MENU_FIRMWARE, MENU_PAR_A, MENU_PAR_B,
    MENU_PAR_TIME, MENU_VALUE,
};
use crate::protocol::{
    ConfigParameter, ControllerStatus, IoValue, MenuEntry, ProtocolClient, ProtocolError,
    ProtocolResult, ValueSpec, ANALOG_MODE_AUTO,
};

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6 approximates N(0,1).
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// Selected through `SIM_PROFILE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Small steps, strong pull back to the set point.
    Steady,
    /// Large steps and weak mean reversion; trips alert thresholds.
    Noisy,
    /// Values never move. Used by tests.
    Frozen,
}

impl Profile {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "noisy" => Self::Noisy,
            "frozen" => Self::Frozen,
            _ => Self::Steady,
        }
    }

    /// (step sigma as share of the set point, mean reversion)
    fn walk(self) -> (f64, f64) {
        match self {
            Self::Steady => (0.01, 0.10),
            Self::Noisy => (0.05, 0.02),
            Self::Frozen => (0.0, 0.0),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steady => write!(f, "steady"),
            Self::Noisy => write!(f, "noisy"),
            Self::Frozen => write!(f, "frozen"),
        }
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// One measured value channel, in raw controller units.
#[derive(Debug, Clone)]
pub struct Channel {
    pub raw: f64,
    pub center: f64,
}

impl Channel {
    fn fixed(raw: i32) -> Self {
        Self {
            raw: raw as f64,
            center: raw as f64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerModel {
    pub profile: Profile,
    pub parameters: BTreeMap<u16, ConfigParameter>,
    pub values: BTreeMap<u16, Channel>,
    pub digital_in: BTreeMap<u16, IoValue>,
    pub digital_out: BTreeMap<u16, IoValue>,
    pub analog_out: BTreeMap<u16, IoValue>,
    pub time_ranges: BTreeMap<u16, TimeRanges>,
    pub value_specs: Vec<ValueSpec>,
    pub menu: Vec<MenuEntry>,
    pub state: i32,
    pub state_info: String,
    pub mode_info: String,
    pub version: String,
    /// Controller clock minus host clock, seconds.
    pub clock_skew: i64,
    pub fail_open: bool,
    /// Every request fails with a communication error while set.
    pub fail_requests: bool,
    pub opens: usize,
}

impl ControllerModel {
    fn empty(profile: Profile) -> Self {
        Self {
            profile,
            parameters: BTreeMap::new(),
            values: BTreeMap::new(),
            digital_in: BTreeMap::new(),
            digital_out: BTreeMap::new(),
            analog_out: BTreeMap::new(),
            time_ranges: BTreeMap::new(),
            value_specs: Vec::new(),
            menu: Vec::new(),
            state: 0,
            state_info: "Betriebsbereit".into(),
            mode_info: "Automatik".into(),
            version: "S3200 v50.04".into(),
            clock_skew: 0,
            fail_open: false,
            fail_requests: false,
            opens: 0,
        }
    }

    pub fn set_value(&mut self, address: u16, raw: i32) {
        self.values.insert(address, Channel::fixed(raw));
    }

    pub fn add_value_spec(&mut self, address: u16, name: &str, unit: &str, factor: i32, raw: i32) {
        self.value_specs.push(ValueSpec {
            address,
            name: name.to_string(),
            description: name.to_string(),
            unit: unit.to_string(),
            factor,
        });
        self.set_value(address, raw);
    }

    pub fn add_menu(&mut self, id: i64, parent: i64, kind: u8, address: u16, title: &str) {
        self.menu.push(MenuEntry {
            id,
            parent,
            kind,
            address,
            title: title.to_string(),
        });
    }

    fn next_value(&mut self, address: u16) -> Option<i32> {
        let (sigma, reversion) = self.profile.walk();
        let ch = self.values.get_mut(&address)?;
        if sigma > 0.0 {
            let pull = reversion * (ch.center - ch.raw);
            let step = gaussian(0.0, sigma * ch.center.abs().max(10.0));
            ch.raw += pull + step;
        }
        Some(ch.raw.round() as i32)
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct SimulatedController {
    model: Arc<Mutex<ControllerModel>>,
    open: bool,
    range_cursor: usize,
}

impl SimulatedController {
    fn from_model(model: ControllerModel) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            open: false,
            range_cursor: 0,
        }
    }

    /// A wood boiler with a buffer tank, one heating circuit and hot water.
    pub fn heating_plant_with(profile: Profile) -> Self {
        let mut m = ControllerModel::empty(profile);
        m.state = 3;
        m.state_info = "Heizen".into();

        m.add_value_spec(0x00, "Kesseltemperatur", "°", 2, 150);
        m.add_value_spec(0x01, "Abgastemperatur", "°", 1, 160);
        m.add_value_spec(0x02, "Restsauerstoff", "%", 10, 72);
        m.add_value_spec(0x03, "Außentemperatur", "°", 2, 16);
        m.add_value_spec(0x04, "Puffer oben", "°", 2, 140);
        m.add_value_spec(0x05, "Puffer unten", "°", 2, 90);
        m.add_value_spec(0x06, "Boiler 1", "°", 2, 110);
        m.add_value_spec(0x07, "Vorlauf 1", "°", 2, 84);

        m.parameters.insert(
            0x10,
            ConfigParameter {
                value: 60,
                unit: "°".into(),
                min: 40,
                max: 75,
                default: 55,
                ..ConfigParameter::new(0x10)
            },
        );
        m.parameters.insert(
            0x11,
            ConfigParameter {
                value: 10,
                unit: "°".into(),
                digits: 1,
                factor: 2,
                min: 0,
                max: 40,
                default: 6,
                ..ConfigParameter::new(0x11)
            },
        );
        m.parameters.insert(
            0x12,
            ConfigParameter {
                value: 6 * 60,
                min: 0,
                max: 24 * 60 - 1,
                default: 6 * 60,
                ..ConfigParameter::new(0x12)
            },
        );

        for addr in 0..4u16 {
            m.digital_out.insert(addr, IoValue { address: addr, state: (addr == 0) as i32, mode: b'A' });
            m.digital_in.insert(addr, IoValue { address: addr, state: 0, mode: b'A' });
        }
        m.analog_out.insert(0, IoValue { address: 0, state: 45, mode: ANALOG_MODE_AUTO });
        m.analog_out.insert(1, IoValue { address: 1, state: 30, mode: 1 });

        for addr in 0..8u16 {
            let mut t = TimeRanges::new(addr);
            let _ = t.set_range(0, "06:00", "22:00");
            m.time_ranges.insert(addr, t);
        }

        m.add_menu(1, 0, 0x01, 0, "Kessel");
        m.add_menu(2, 1, MENU_PAR_A, 0x10, "Boiler Solltemperatur");
        m.add_menu(3, 1, MENU_PAR_B, 0x11, "Absenkung Heizkreis");
        m.add_menu(4, 1, MENU_PAR_TIME, 0x12, "Heizbeginn");
        m.add_menu(5, 0, MENU_FIRMWARE, 0, "Firmware");
        m.add_menu(6, 0, MENU_DIG_OUT, 0, "Heizkreispumpe");
        m.add_menu(7, 0, MENU_DIG_IN, 0, "Türkontakt");
        m.add_menu(8, 0, MENU_ANL_OUT, 0, "Saugzug");
        m.add_menu(9, 0, MENU_VALUE, 0x00, "Kesseltemperatur");

        Self::from_model(m)
    }

    fn model(&self) -> MutexGuard<'_, ControllerModel> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Guard for every request: the link must be open and healthy.
    fn ready(&self) -> ProtocolResult<MutexGuard<'_, ControllerModel>> {
        if !self.open {
            return Err(ProtocolError::Communication("link not open".into()));
        }
        let m = self.model();
        if m.fail_requests {
            return Err(ProtocolError::Communication("no response".into()));
        }
        Ok(m)
    }
}

fn unknown(what: &str, address: u16) -> ProtocolError {
    ProtocolError::Communication(format!("unknown {what} 0x{address:04x}"))
}

impl DeviceLink for SimulatedController {
    fn open(&mut self, device: &str) -> ProtocolResult<()> {
        let mut m = self.model();
        if m.fail_open {
            return Err(open_error(device, "device not present"));
        }
        m.opens += 1;
        drop(m);
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn protocol(&mut self) -> &mut dyn ProtocolClient {
        self
    }
}

impl ProtocolClient for SimulatedController {
    fn get_parameter(&mut self, p: &mut ConfigParameter) -> ProtocolResult<()> {
        let m = self.ready()?;
        let stored = m
            .parameters
            .get(&p.address)
            .ok_or_else(|| unknown("parameter", p.address))?;
        *p = stored.clone();
        Ok(())
    }

    fn set_parameter(&mut self, p: &mut ConfigParameter) -> ProtocolResult<()> {
        let mut m = self.ready()?;
        let stored = m
            .parameters
            .get_mut(&p.address)
            .ok_or_else(|| unknown("parameter", p.address))?;
        if p.value < stored.min || p.value > stored.max {
            return Err(ProtocolError::OutOfRange);
        }
        if p.value == stored.value {
            return Err(ProtocolError::NonUpdate);
        }
        stored.value = p.value;
        *p = stored.clone();
        Ok(())
    }

    fn get_value(&mut self, address: u16) -> ProtocolResult<i32> {
        let mut m = self.ready()?;
        m.next_value(address).ok_or_else(|| unknown("value", address))
    }

    fn get_status(&mut self) -> ProtocolResult<ControllerStatus> {
        let m = self.ready()?;
        Ok(ControllerStatus {
            time: now_unix() + m.clock_skew,
            state: m.state,
            state_info: m.state_info.clone(),
            mode_info: m.mode_info.clone(),
            version: m.version.clone(),
        })
    }

    fn get_digital_in(&mut self, address: u16) -> ProtocolResult<IoValue> {
        let m = self.ready()?;
        m.digital_in.get(&address).copied().ok_or_else(|| unknown("digital input", address))
    }

    fn get_digital_out(&mut self, address: u16) -> ProtocolResult<IoValue> {
        let m = self.ready()?;
        m.digital_out.get(&address).copied().ok_or_else(|| unknown("digital output", address))
    }

    fn get_analog_out(&mut self, address: u16) -> ProtocolResult<IoValue> {
        let m = self.ready()?;
        m.analog_out.get(&address).copied().ok_or_else(|| unknown("analog output", address))
    }

    fn get_first_time_ranges(&mut self) -> ProtocolResult<Option<TimeRanges>> {
        self.range_cursor = 0;
        let m = self.ready()?;
        Ok(m.time_ranges.values().next().cloned())
    }

    fn get_next_time_ranges(&mut self) -> ProtocolResult<Option<TimeRanges>> {
        self.range_cursor += 1;
        let cursor = self.range_cursor;
        let m = self.ready()?;
        Ok(m.time_ranges.values().nth(cursor).cloned())
    }

    fn set_time_ranges(&mut self, ranges: &TimeRanges) -> ProtocolResult<()> {
        let mut m = self.ready()?;
        let stored = m
            .time_ranges
            .get_mut(&ranges.address)
            .ok_or_else(|| unknown("time range", ranges.address))?;
        if stored == ranges {
            return Err(ProtocolError::NonUpdate);
        }
        *stored = ranges.clone();
        Ok(())
    }

    fn sync_time(&mut self, _now: i64) -> ProtocolResult<()> {
        let mut m = self.ready()?;
        m.clock_skew = 0;
        Ok(())
    }

    fn value_specs(&mut self) -> ProtocolResult<Vec<ValueSpec>> {
        Ok(self.ready()?.value_specs.clone())
    }

    fn menu_items(&mut self) -> ProtocolResult<Vec<MenuEntry>> {
        Ok(self.ready()?.menu.clone())
    }
}

/// Shared view of a simulator's model, kept after the controller itself
/// has been boxed into the arbiter.
#[cfg(test)]
#[derive(Clone)]
pub struct SimHandle(Arc<Mutex<ControllerModel>>);

#[cfg(test)]
impl SimHandle {
    pub fn model(&self) -> MutexGuard<'_, ControllerModel> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
impl SimulatedController {
    pub fn empty() -> Self {
        Self::from_model(ControllerModel::empty(Profile::Frozen))
    }

    pub fn heating_plant() -> Self {
        Self::heating_plant_with(Profile::Frozen)
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle(Arc::clone(&self.model))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
