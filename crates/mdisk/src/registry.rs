use std::collections::BTreeMap;
use std::sync::Arc;

use crate::device::DeviceInstance;
use crate::{MdError, Result};

/// Unit number to device mapping. Guarded by the driver's registry lock.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    units: BTreeMap<u32, Arc<DeviceInstance>>,
}

impl Registry {
    /// Picks the unit for a new device: `requested` if free, otherwise the smallest unused
    /// number below `max_units`.
    pub(crate) fn allocate_unit(&self, requested: Option<u32>, max_units: u32) -> Result<u32> {
        if let Some(unit) = requested {
            if unit >= max_units {
                return Err(MdError::InvalidConfig(format!(
                    "unit {unit} is beyond the limit of {max_units}"
                )));
            }
            if self.units.contains_key(&unit) {
                return Err(MdError::UnitInUse(unit));
            }
            return Ok(unit);
        }
        let mut candidate = 0u32;
        for &unit in self.units.keys() {
            if unit != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate >= max_units {
            return Err(MdError::OutOfResources);
        }
        Ok(candidate)
    }

    pub(crate) fn insert(&mut self, device: Arc<DeviceInstance>) {
        self.units.insert(device.unit(), device);
    }

    pub(crate) fn remove(&mut self, unit: u32) -> Option<Arc<DeviceInstance>> {
        self.units.remove(&unit)
    }

    pub(crate) fn get(&self, unit: u32) -> Option<&Arc<DeviceInstance>> {
        self.units.get(&unit)
    }

    pub(crate) fn units(&self) -> Vec<u32> {
        self.units.keys().copied().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<DeviceInstance>> {
        self.units.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.units.len()
    }
}
