//! Scraping of the CDU fan info screen.
//!
//! The device shell has no structured output, so each metric is located by a
//! fixed label and the numeric token right after it. Everything that knows
//! about the text layout lives here.

use regex::Regex;
use serde::Serialize;
use tracing::warn;

pub const DEFAULT_AIR_LABEL: &str = "Temp Air Cold Average:";
pub const DEFAULT_LIQUID_LABEL: &str = "Temp Liquid Supply:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Reading {
    pub air_temp: Option<f64>,
    pub liquid_temp: Option<f64>,
}

pub trait MetricExtractor: Send + Sync {
    /// Never fails: a field that cannot be found is `None`.
    fn extract(&self, raw: &str) -> Reading;
}

#[derive(Debug, Clone)]
struct LabeledField {
    label: String,
    pattern: Regex,
}

impl LabeledField {
    fn new(label: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(r"{}\s*([0-9.]+)", regex::escape(label)))?;
        Ok(Self {
            label: label.to_string(),
            pattern,
        })
    }

    fn find(&self, raw: &str) -> Option<f64> {
        let Some(captures) = self.pattern.captures(raw) else {
            if raw.contains(&self.label) {
                warn!(label = %self.label, "label present without a numeric value");
            }
            return None;
        };
        let token = captures.get(1)?.as_str();
        match token.parse::<f64>() {
            Ok(value) if value.is_finite() => Some(value),
            _ => {
                warn!(label = %self.label, token, "malformed numeric value");
                None
            }
        }
    }
}

/// Extracts the air and liquid temperatures by label.
#[derive(Debug, Clone)]
pub struct LabelExtractor {
    air: LabeledField,
    liquid: LabeledField,
}

impl LabelExtractor {
    pub fn new(air_label: &str, liquid_label: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            air: LabeledField::new(air_label)?,
            liquid: LabeledField::new(liquid_label)?,
        })
    }

    pub fn cdu_default() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_AIR_LABEL, DEFAULT_LIQUID_LABEL)
    }
}

impl MetricExtractor for LabelExtractor {
    fn extract(&self, raw: &str) -> Reading {
        Reading {
            air_temp: self.air.find(raw),
            liquid_temp: self.liquid.find(raw),
        }
    }
}
