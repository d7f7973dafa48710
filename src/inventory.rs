use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub type DeviceId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub address: String,
}

#[derive(Debug, Deserialize)]
struct InventoryFile {
    callans: BTreeMap<String, String>,
}

/// Reads the device inventory file, `{"callans": {"<id>": "<address>"}}`.
pub fn load_inventory(path: &Path) -> Result<Vec<Device>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read inventory {}", path.display()))?;
    parse_inventory(&contents).with_context(|| format!("Invalid inventory {}", path.display()))
}

/// Devices come back in ascending id order, which is also the sweep order.
pub fn parse_inventory(contents: &str) -> Result<Vec<Device>> {
    let file: InventoryFile =
        serde_json::from_str(contents).context("inventory is not valid JSON")?;

    let mut devices = BTreeMap::new();
    for (raw_id, raw_address) in file.callans {
        let id = raw_id
            .trim()
            .parse::<DeviceId>()
            .with_context(|| format!("device id {raw_id:?} is not an integer"))?;
        let address = raw_address.trim();
        if address.is_empty() {
            bail!("device {id} has an empty address");
        }
        if devices.insert(id, address.to_string()).is_some() {
            bail!("device id {id} is listed more than once");
        }
    }
    if devices.is_empty() {
        bail!("inventory contains no devices");
    }

    Ok(devices
        .into_iter()
        .map(|(id, address)| Device { id, address })
        .collect())
}
