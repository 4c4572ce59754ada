//! Remote→local reconciliation sets. Meters are keyed by the composite
//! `(meter_id, meter_element_id)`; a meter leaves the active fleet either by
//! disappearing remotely or by going inactive remotely.

use std::collections::BTreeMap;

use common::types::{
    Meter,
    MeterKey,
    Tenant,
};

#[derive(Debug, Default, PartialEq)]
pub struct MeterDiff {
    pub to_insert: Vec<Meter>,
    pub to_update: Vec<Meter>,
    pub to_deactivate: Vec<MeterKey>,
}

impl MeterDiff {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.to_deactivate.is_empty()
    }
}

/// Tracked meter fields: `name`, `ip`, `port`, `active`, `element`.
fn meter_differs(remote: &Meter, local: &Meter) -> bool {
    remote.name != local.name
        || remote.ip != local.ip
        || remote.port != local.port
        || remote.active != local.active
        || remote.element != local.element
}

pub fn diff_meters(remote: &[Meter], local: &[Meter]) -> MeterDiff {
    let remote_by_key: BTreeMap<MeterKey, &Meter> =
        remote.iter().map(|m| (m.key(), m)).collect();
    let local_by_key: BTreeMap<MeterKey, &Meter> = local.iter().map(|m| (m.key(), m)).collect();

    let mut diff = MeterDiff::default();
    for (key, local_meter) in &local_by_key {
        match remote_by_key.get(key) {
            None if local_meter.active => diff.to_deactivate.push(*key),
            Some(remote_meter) if !remote_meter.active && local_meter.active => {
                diff.to_deactivate.push(*key);
            },
            _ => {},
        }
    }
    for (key, remote_meter) in &remote_by_key {
        match local_by_key.get(key) {
            None => diff.to_insert.push((*remote_meter).clone()),
            Some(local_meter) => {
                if meter_differs(remote_meter, local_meter) && !diff.to_deactivate.contains(key)
                {
                    diff.to_update.push((*remote_meter).clone());
                }
            },
        }
    }
    diff
}

/// Tracked tenant fields: `name`, the address fields, and `api_key`.
pub fn tenant_differs(remote: &Tenant, local: &Tenant) -> bool {
    remote.name != local.name
        || remote.address != local.address
        || remote.city != local.city
        || remote.country != local.country
        || remote.api_key != local.api_key
}
