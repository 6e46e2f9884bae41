//! Pull controller metadata into the store: value facts, the menu tree with
//! its display values, time ranges and the schema layout.
//!
//! Used by the control loop (at startup and on triggers) and directly by
//! the `updatemenu` job.

use std::collections::HashMap;

use anyhow::Result;
use tracing::{info, warn};

use crate::db::{
    Db, MenuItem, ValueFact, STATUS_MODE, STATUS_STATE, TYPE_ANL_OUT, TYPE_DIG_IN, TYPE_DIG_OUT,
    TYPE_STATUS, TYPE_VALUE,
};
use crate::link::DeviceArbiter;
use crate::params::{to_nice, unit_for, MenuKind, TimeRanges};
use crate::protocol::{ConfigParameter, IoValue, ProtocolClient, ProtocolResult, ANALOG_MODE_AUTO};

/// Upper bound on time-range addresses read in one pass.
const MAX_TIME_RANGE_ADDRESSES: usize = 256;

// ---------------------------------------------------------------------------
// Value facts
// ---------------------------------------------------------------------------

/// Create or relabel value facts from the controller's value specs and the
/// I/O channels found in the menu. New facts start disabled.
pub async fn update_value_facts(db: &Db, arbiter: &DeviceArbiter) -> Result<usize> {
    let specs = arbiter.request(|c| c.value_specs()).await?;

    let mut added = 0;
    for s in &specs {
        let new = db
            .upsert_value_fact(TYPE_VALUE, s.address as i64, &s.name, &s.description, &s.unit, s.factor as i64)
            .await?;
        added += new as usize;
    }

    for item in db.menu_items().await? {
        let kind = match MenuKind::from_code(item.kind) {
            MenuKind::DigitalOut => TYPE_DIG_OUT,
            MenuKind::DigitalIn => TYPE_DIG_IN,
            MenuKind::AnalogOut => TYPE_ANL_OUT,
            _ => continue,
        };
        let new = db
            .upsert_value_fact(kind, item.address, &item.title, &item.title, "", 1)
            .await?;
        added += new as usize;
    }

    added += db.upsert_value_fact(TYPE_STATUS, STATUS_STATE, "state", "Status", "", 1).await? as usize;
    added += db.upsert_value_fact(TYPE_STATUS, STATUS_MODE, "mode", "Modus", "", 1).await? as usize;

    info!(specs = specs.len(), added, "value facts updated");
    Ok(added)
}

// ---------------------------------------------------------------------------
// Menu
// ---------------------------------------------------------------------------

/// Replace the stored menu tree with the controller's.
pub async fn init_menu(db: &Db, arbiter: &DeviceArbiter) -> Result<usize> {
    let entries = arbiter.request(|c| c.menu_items()).await?;
    db.replace_menu(&entries).await?;
    info!(items = entries.len(), "menu initialized");
    Ok(entries.len())
}

pub fn digital_text(v: &IoValue) -> String {
    format!("{} ({})", if v.state != 0 { "on" } else { "off" }, v.mode as char)
}

pub fn analog_text(v: &IoValue) -> String {
    if v.mode == ANALOG_MODE_AUTO {
        format!("{} (A)", v.state)
    } else {
        format!("{} ({})", v.state, v.mode)
    }
}

fn display_unit(unit: &str) -> String {
    if unit == "°" {
        "°C".to_string()
    } else {
        unit.to_string()
    }
}

/// Read the live value of one menu item. `Ok(None)` for structural items.
fn render_item(
    c: &mut dyn ProtocolClient,
    item: &MenuItem,
    facts: &HashMap<i64, ValueFact>,
) -> ProtocolResult<Option<(String, String)>> {
    let Ok(address) = u16::try_from(item.address) else {
        warn!(menu = item.id, address = item.address, "menu item address out of range, skipped");
        return Ok(None);
    };
    let kind = MenuKind::from_code(item.kind);
    let rendered = match kind {
        MenuKind::Parameter | MenuKind::Time => {
            let mut p = ConfigParameter::new(address);
            c.get_parameter(&mut p)?;
            (to_nice(p.value, kind, &p), unit_for(kind, &p))
        }
        MenuKind::Firmware => (c.get_status()?.version, String::new()),
        MenuKind::DigitalOut => (digital_text(&c.get_digital_out(address)?), String::new()),
        MenuKind::DigitalIn => (digital_text(&c.get_digital_in(address)?), String::new()),
        MenuKind::AnalogOut => (analog_text(&c.get_analog_out(address)?), String::new()),
        MenuKind::Value => {
            let Some(fact) = facts.get(&item.address) else {
                return Ok(None);
            };
            let raw = c.get_value(address)?;
            let value = raw as f64 / fact.factor() as f64;
            (format!("{value:.2}"), display_unit(&fact.unit))
        }
        MenuKind::Other => return Ok(None),
    };
    Ok(Some(rendered))
}

/// Refresh the display value of every menu item in one bracket.
pub async fn update_menu(db: &Db, arbiter: &DeviceArbiter) -> Result<usize> {
    let items = db.menu_items().await?;
    let facts: HashMap<i64, ValueFact> = db
        .value_facts(false)
        .await?
        .into_iter()
        .filter(|f| f.kind == TYPE_VALUE)
        .map(|f| (f.address, f))
        .collect();

    let (updates, failed) = arbiter
        .with_device_link(|c| {
            let mut updates = Vec::new();
            let mut failed = 0usize;
            for item in &items {
                match render_item(c, item, &facts) {
                    Ok(Some((value, unit))) => updates.push((item.id, value, unit)),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(menu = item.id, address = item.address, error = %e, "menu item read failed");
                        failed += 1;
                    }
                }
            }
            (updates, failed)
        })
        .await?;

    for (id, value, unit) in &updates {
        db.update_menu_value(*id, value, unit).await?;
    }
    info!(updated = updates.len(), failed, "menu refreshed");
    Ok(updates.len())
}

// ---------------------------------------------------------------------------
// Time ranges & schema
// ---------------------------------------------------------------------------

/// Copy every time-range address from the controller into the store.
pub async fn update_time_range_data(db: &Db, arbiter: &DeviceArbiter) -> Result<usize> {
    let ranges = arbiter
        .request(|c| {
            let mut out: Vec<TimeRanges> = Vec::new();
            let mut next = c.get_first_time_ranges()?;
            while let Some(t) = next {
                out.push(t);
                if out.len() >= MAX_TIME_RANGE_ADDRESSES {
                    break;
                }
                next = c.get_next_time_ranges()?;
            }
            Ok(out)
        })
        .await?;

    for t in &ranges {
        db.store_time_ranges(t).await?;
    }
    info!(addresses = ranges.len(), "time ranges refreshed");
    Ok(ranges.len())
}

/// One schemaconf row per active value fact.
pub async fn update_schema_conf(db: &Db) -> Result<usize> {
    let mut added = 0;
    for f in db.value_facts(true).await? {
        added += db.ensure_schema_conf(&f.kind, f.address).await? as usize;
    }
    info!(added, "schema conf refreshed");
    Ok(added)
}

// ===========================================================================
// Tests
// ===========================================================================
