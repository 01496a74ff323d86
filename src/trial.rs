use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::BufferData;

/// Free-form experiment or subject metadata handed to enhancers and plotters.
pub type InfoMap = BTreeMap<String, serde_json::Value>;

/// How an enhancement value should be interpreted downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementCategory {
    /// A plain measured or decoded value.
    #[default]
    Value,
    /// A trial-local time (already shifted by the trial's wrt time).
    Time,
    /// An identifier such as a condition or block number.
    Id,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnhancementValue {
    Number(f64),
    Numbers(Vec<f64>),
    Text(String),
}

impl EnhancementValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            EnhancementValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_numbers(&self) -> Option<&[f64]> {
        match self {
            EnhancementValue::Numbers(values) => Some(values),
            _ => None,
        }
    }
}

impl From<f64> for EnhancementValue {
    fn from(value: f64) -> Self {
        EnhancementValue::Number(value)
    }
}

impl From<Vec<f64>> for EnhancementValue {
    fn from(values: Vec<f64>) -> Self {
        EnhancementValue::Numbers(values)
    }
}

impl From<&str> for EnhancementValue {
    fn from(text: &str) -> Self {
        EnhancementValue::Text(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enhancement {
    pub value: EnhancementValue,
    pub category: EnhancementCategory,
}

/// Named values produced by one enhancer for one trial.
pub type Enhancements = BTreeMap<String, Enhancement>;

/// One time-bounded, time-zero-aligned bundle of data
///
/// A trial covers `[start_time, end_time)` of the recording. The last trial of
/// a run may be open-ended (`end_time == None`). Every entry in `data` has been
/// shifted so that `wrt_time` is zero.
///
/// # Examples
///
/// ```rust
/// use neurotrials::{EnhancementCategory, Trial};
///
/// let mut trial = Trial::new(1.0, Some(2.0));
/// trial.add_enhancement("duration", 1.0, EnhancementCategory::Value);
///
/// assert_eq!(trial.duration(), Some(1.0));
/// assert_eq!(trial.get_enhancement("duration").and_then(|v| v.as_number()), Some(1.0));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub wrt_time: f64,
    pub data: BTreeMap<String, BufferData>,
    pub enhancements: Enhancements,
}

impl Trial {
    pub fn new(start_time: f64, end_time: Option<f64>) -> Self {
        Trial {
            start_time,
            end_time,
            wrt_time: 0.0,
            data: BTreeMap::new(),
            enhancements: BTreeMap::new(),
        }
    }

    pub fn duration(&self) -> Option<f64> {
        self.end_time.map(|end| end - self.start_time)
    }

    pub fn add_buffer_data(&mut self, name: &str, data: BufferData) {
        self.data.insert(name.to_string(), data);
    }

    pub fn get_buffer_data(&self, name: &str) -> Option<&BufferData> {
        self.data.get(name)
    }

    /// Adds or replaces the named enhancement.
    pub fn add_enhancement<V: Into<EnhancementValue>>(
        &mut self,
        name: &str,
        value: V,
        category: EnhancementCategory,
    ) {
        self.enhancements.insert(
            name.to_string(),
            Enhancement {
                value: value.into(),
                category,
            },
        );
    }

    pub fn get_enhancement(&self, name: &str) -> Option<&EnhancementValue> {
        self.enhancements.get(name).map(|e| &e.value)
    }

    /// Names of all enhancements in `category`, in name order.
    pub fn enhancement_names_in(&self, category: EnhancementCategory) -> Vec<&str> {
        self.enhancements
            .iter()
            .filter(|(_, e)| e.category == category)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_trial_has_no_duration() {
        let trial = Trial::new(3.0, None);
        assert_eq!(trial.duration(), None);
        assert_eq!(trial.wrt_time, 0.0);
    }

    #[test]
    fn test_enhancement_categories() {
        let mut trial = Trial::new(0.0, Some(1.0));
        trial.add_enhancement("fix_on", vec![0.1, 0.2], EnhancementCategory::Time);
        trial.add_enhancement("block", 4.0, EnhancementCategory::Id);
        trial.add_enhancement("target", 7.0, EnhancementCategory::Value);
        assert_eq!(trial.enhancement_names_in(EnhancementCategory::Time), vec!["fix_on"]);
        assert_eq!(
            trial.get_enhancement("fix_on").and_then(|v| v.as_numbers()),
            Some(&[0.1, 0.2][..])
        );

        // 同名覆盖
        trial.add_enhancement("block", 5.0, EnhancementCategory::Id);
        assert_eq!(trial.get_enhancement("block").and_then(|v| v.as_number()), Some(5.0));
    }

    #[test]
    fn test_trial_json_shape() {
        let mut trial = Trial::new(0.0, Some(1.0));
        trial.add_enhancement("name", "left", EnhancementCategory::Value);
        let json = serde_json::to_value(&trial).unwrap();
        assert_eq!(json["enhancements"]["name"]["value"], "left");
        assert_eq!(json["enhancements"]["name"]["category"], "value");
        assert!(json["end_time"].is_number());
    }
}
