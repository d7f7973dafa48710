use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;

use crate::extract::Reading;

/// One poll outcome. A failure sample never carries temperatures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub air_temp: Option<f64>,
    pub liquid_temp: Option<f64>,
    pub error: Option<String>,
}

impl Sample {
    pub fn reading(timestamp: DateTime<Utc>, reading: Reading) -> Self {
        Self {
            timestamp,
            air_temp: reading.air_temp,
            liquid_temp: reading.liquid_temp,
            error: None,
        }
    }

    pub fn failure(timestamp: DateTime<Utc>, error: impl Display) -> Self {
        Self {
            timestamp,
            air_temp: None,
            liquid_temp: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Append-only history for one device, pruned to `window` on every append.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    window: ChronoDuration,
    samples: VecDeque<Sample>,
}

impl TimeSeries {
    pub fn new(window: ChronoDuration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn append(&mut self, sample: Sample) {
        let cutoff = sample.timestamp - self.window;
        self.samples.push_back(sample);
        self.samples.retain(|entry| entry.timestamp > cutoff);
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn snapshot(&self) -> Arc<[Sample]> {
        self.samples.iter().cloned().collect()
    }
}
