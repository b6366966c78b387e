//! Loaded filament and matching it against what a job needs.

use bambulabs::message::{PrintAms, PrintTray};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    color::{self, Rgb},
    error::{Error, Result},
    job::Requirement,
};

/// Slots per AMS unit.
const TRAYS_PER_AMS: u32 = 4;

/// Slot index the firmware uses for the external spool holder.
pub const EXTERNAL_SPOOL_INDEX: u32 = 254;

/// One loaded spool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Slot {
    /// Global tray index, `ams * 4 + tray`, stable per printer.
    pub index: u32,
    /// Material type as reported, `PLA`, `PETG` and so on.
    pub material: String,
    /// Spool color.
    pub color: Rgb,
    /// Fraction left, between 0 and 1. `None` when the spool has no tag.
    pub remaining: Option<f64>,
}

impl Slot {
    /// Build a slot from one reported tray. An empty tray gives `Ok(None)`.
    pub fn from_tray(ams_id: u32, tray: &PrintTray) -> Result<Option<Self>> {
        let Some(material) = tray.tray_type.as_deref().map(str::trim).filter(|m| !m.is_empty()) else {
            return Ok(None);
        };

        let tray_id: u32 = tray
            .id
            .parse()
            .map_err(|_| Error::InvalidInventory(format!("tray id {:?} is not a number", tray.id)))?;
        let index = if tray_id == EXTERNAL_SPOOL_INDEX {
            EXTERNAL_SPOOL_INDEX
        } else if tray_id < TRAYS_PER_AMS {
            ams_id * TRAYS_PER_AMS + tray_id
        } else {
            return Err(Error::InvalidInventory(format!("tray id {tray_id} out of range")));
        };

        let color = tray
            .tray_color
            .as_deref()
            .ok_or_else(|| Error::InvalidInventory(format!("tray {index} has no color")))?
            .parse()
            .map_err(|_| Error::InvalidInventory(format!("tray {index} color {:?}", tray.tray_color)))?;

        let remaining = match tray.remain {
            None | Some(-1) => None,
            Some(percent @ 0..=100) => Some(percent as f64 / 100.0),
            Some(percent) => {
                return Err(Error::InvalidInventory(format!(
                    "tray {index} remaining {percent}% out of range"
                )))
            }
        };

        Ok(Some(Slot {
            index,
            material: material.to_string(),
            color,
            remaining,
        }))
    }

    /// A spool that is known to be used up.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0.0)
    }
}

/// Build the inventory from a report's AMS section and external spool.
///
/// Entries that fail validation are dropped with a warning. The rest of the
/// report is still used.
pub fn slots_from_report(ams: Option<&PrintAms>, external: Option<&PrintTray>) -> Vec<Slot> {
    let units = ams.and_then(|ams| ams.ams.as_deref()).unwrap_or_default();

    let mut slots = Vec::new();
    for unit in units {
        let Ok(ams_id) = unit.id.parse::<u32>() else {
            tracing::warn!(ams = %unit.id, "ignoring AMS unit with a non-numeric id");
            continue;
        };
        for tray in &unit.tray {
            push_tray(&mut slots, ams_id, tray);
        }
    }
    if let Some(tray) = external {
        push_tray(&mut slots, 0, tray);
    }

    slots.sort_by_key(|slot| slot.index);
    slots.dedup_by_key(|slot| slot.index);
    slots
}

fn push_tray(slots: &mut Vec<Slot>, ams_id: u32, tray: &PrintTray) {
    match Slot::from_tray(ams_id, tray) {
        Ok(Some(slot)) => slots.push(slot),
        Ok(None) => {}
        Err(err) => tracing::warn!(ams = ams_id, tray = %tray.id, "rejecting inventory entry: {}", err),
    }
}

/// Indices whose contents differ between two inventories.
pub fn changed_indices(old: &[Slot], new: &[Slot]) -> Vec<u32> {
    let mut indices: Vec<u32> = old
        .iter()
        .chain(new)
        .map(|slot| slot.index)
        .filter(|index| {
            let before = old.iter().find(|slot| slot.index == *index);
            let after = new.iter().find(|slot| slot.index == *index);
            before != after
        })
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// Which slot feeds each requirement of a job, in requirement order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SlotMapping(pub Vec<u32>);

impl SlotMapping {
    /// The slot feeding requirement `i`.
    pub fn slot_for(&self, requirement: usize) -> Option<u32> {
        self.0.get(requirement).copied()
    }
}

/// Try to feed every requirement from a distinct slot.
///
/// Requirements are handled in order. Each takes the unclaimed slot of the
/// same material (case-insensitive) with the smallest color distance, and
/// an exact color stops the search for that requirement. `None` when any
/// requirement has no slot within `threshold`.
pub fn satisfy(slots: &[Slot], requirements: &[Requirement], threshold: f64) -> Option<SlotMapping> {
    let mut claimed: Vec<u32> = Vec::with_capacity(requirements.len());

    for requirement in requirements {
        let mut best: Option<(u32, f64)> = None;

        for slot in slots {
            if claimed.contains(&slot.index)
                || slot.is_exhausted()
                || !slot.material.eq_ignore_ascii_case(requirement.material.trim())
            {
                continue;
            }

            let distance = color::distance(requirement.color, slot.color);
            if best.is_none_or(|(_, best)| distance < best) {
                best = Some((slot.index, distance));
            }
            if distance == 0.0 {
                break;
            }
        }

        match best {
            Some((index, distance)) if distance <= threshold => claimed.push(index),
            _ => return None,
        }
    }

    Some(SlotMapping(claimed))
}
