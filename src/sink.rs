use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::inventory::{Device, DeviceId};
use crate::series::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Ok,
    Partial,
    NoConnection,
    NoData,
}

/// Published state of one device: its address and the ordered history as of
/// the last append.
#[derive(Debug, Clone)]
pub struct DeviceView {
    pub device: Device,
    pub samples: Arc<[Sample]>,
}

impl DeviceView {
    fn empty(device: Device) -> Self {
        Self {
            device,
            samples: Arc::from(Vec::new()),
        }
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.last()
    }

    pub fn status(&self) -> DeviceStatus {
        match self.latest() {
            None => DeviceStatus::NoData,
            Some(sample) if sample.is_failure() => DeviceStatus::NoConnection,
            Some(sample) if sample.air_temp.is_some() && sample.liquid_temp.is_some() => {
                DeviceStatus::Ok
            }
            Some(_) => DeviceStatus::Partial,
        }
    }
}

/// One watch slot per device. Each slot has a single writer (the scheduler)
/// and any number of readers; slots never share a lock.
#[derive(Clone)]
pub struct SeriesSink {
    slots: Arc<BTreeMap<DeviceId, watch::Sender<DeviceView>>>,
}

impl SeriesSink {
    pub fn new(devices: &[Device]) -> Self {
        let slots = devices
            .iter()
            .map(|device| {
                let (tx, _rx) = watch::channel(DeviceView::empty(device.clone()));
                (device.id, tx)
            })
            .collect();
        Self {
            slots: Arc::new(slots),
        }
    }

    /// Replaces the device's published history. Unknown ids are ignored.
    pub fn publish(&self, id: DeviceId, samples: Arc<[Sample]>) -> bool {
        let Some(slot) = self.slots.get(&id) else {
            return false;
        };
        slot.send_modify(|view| view.samples = samples);
        true
    }

    pub fn view(&self, id: DeviceId) -> Option<DeviceView> {
        self.slots.get(&id).map(|slot| slot.borrow().clone())
    }

    /// Views in ascending device id order.
    pub fn views(&self) -> Vec<DeviceView> {
        self.slots
            .values()
            .map(|slot| slot.borrow().clone())
            .collect()
    }

    pub fn subscribe(&self, id: DeviceId) -> Option<watch::Receiver<DeviceView>> {
        self.slots.get(&id).map(watch::Sender::subscribe)
    }
}
