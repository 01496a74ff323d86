use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrialsError};
use crate::trial::{
    Enhancement, EnhancementCategory, EnhancementValue, Enhancements, InfoMap, Trial,
};
use crate::types::NumericEventList;

/// Computes named values for one trial
///
/// Enhancers run after the trial's data has been sliced and aligned, so
/// times seen here are relative to the trial's wrt time. An error from an
/// enhancer stops the run.
///
/// # Examples
///
/// ```rust
/// use neurotrials::{Enhancement, EnhancementCategory, Enhancements, InfoMap, Result, Trial, TrialEnhancer};
///
/// /// Tags every trial with its number.
/// struct TrialNumber;
///
/// impl TrialEnhancer for TrialNumber {
///     fn enhance(
///         &self,
///         _trial: &Trial,
///         trial_count: usize,
///         _experiment_info: &InfoMap,
///         _subject_info: &InfoMap,
///     ) -> Result<Enhancements> {
///         let number = Enhancement {
///             value: (trial_count as f64).into(),
///             category: EnhancementCategory::Id,
///         };
///         Ok(Enhancements::from([("number".to_string(), number)]))
///     }
/// }
///
/// let trial = Trial::new(0.0, Some(1.0));
/// let values = TrialNumber.enhance(&trial, 7, &InfoMap::new(), &InfoMap::new())?;
/// assert_eq!(values["number"].value.as_number(), Some(7.0));
/// # Ok::<(), neurotrials::TrialsError>(())
/// ```
pub trait TrialEnhancer {
    fn enhance(
        &self,
        trial: &Trial,
        trial_count: usize,
        experiment_info: &InfoMap,
        subject_info: &InfoMap,
    ) -> Result<Enhancements>;
}

fn enhancement<V: Into<EnhancementValue>>(
    value: V,
    category: EnhancementCategory,
) -> Enhancement {
    Enhancement {
        value: value.into(),
        category,
    }
}

/// Looks up an event buffer on the trial.
fn trial_events<'a>(trial: &'a Trial, buffer_name: &str) -> Result<&'a NumericEventList> {
    let data = trial.get_buffer_data(buffer_name).ok_or_else(|| {
        TrialsError::Enhancer(format!("trial has no buffer named {}", buffer_name))
    })?;
    data.as_events().ok_or_else(|| {
        TrialsError::Enhancer(format!(
            "buffer {} holds {} data, expected events",
            buffer_name,
            data.kind_name()
        ))
    })
}

/// Adds the trial's duration, `end_time - start_time`.
///
/// Open-ended trials get no duration.
#[derive(Debug, Clone)]
pub struct TrialDurationEnhancer {
    pub name: String,
}

impl Default for TrialDurationEnhancer {
    fn default() -> Self {
        TrialDurationEnhancer {
            name: "duration".to_string(),
        }
    }
}

impl TrialEnhancer for TrialDurationEnhancer {
    fn enhance(
        &self,
        trial: &Trial,
        _trial_count: usize,
        _experiment_info: &InfoMap,
        _subject_info: &InfoMap,
    ) -> Result<Enhancements> {
        let mut enhancements = Enhancements::new();
        if let Some(duration) = trial.duration() {
            enhancements.insert(
                self.name.clone(),
                enhancement(duration, EnhancementCategory::Value),
            );
        }
        Ok(enhancements)
    }
}

/// One entry of a paired-codes table: `code` announces a value named `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedCodeRule {
    pub code: f64,
    pub name: String,
    #[serde(default)]
    pub category: EnhancementCategory,
}

/// Reads a rule table from a CSV file with a header row.
pub(crate) fn read_rules<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut rules = Vec::new();
    for record in reader.deserialize() {
        rules.push(record?);
    }
    Ok(rules)
}

/// Decodes values sent as (property code, value) pairs of events
///
/// Events whose value at `value_index` falls outside `[min, max)` are ignored.
/// Among the rest, each event carrying a rule's code is paired with the event
/// that follows it; the follower's value, rescaled as
/// `(value + offset) * gain`, is stored under the rule's name. When a code
/// repeats within a trial the last pair wins.
///
/// # Examples
///
/// ```rust
/// use neurotrials::{EnhancementCategory, InfoMap, NumericEventList, PairedCodeRule};
/// use neurotrials::{PairedCodesEnhancer, Trial, TrialEnhancer};
///
/// let rules = vec![PairedCodeRule {
///     code: 3001.0,
///     name: "target_angle".to_string(),
///     category: EnhancementCategory::Value,
/// }];
/// let enhancer = PairedCodesEnhancer::new("ecodes", rules)
///     .value_range(Some(3000.0), Some(4000.0))
///     .offset_then_gain(-3000.0, 10.0);
///
/// let mut trial = Trial::new(0.0, Some(1.0));
/// let codes = NumericEventList::from_rows(&[vec![0.1, 3001.0], vec![0.2, 3009.0]])?;
/// trial.add_buffer_data("ecodes", codes.into());
///
/// let values = enhancer.enhance(&trial, 0, &InfoMap::new(), &InfoMap::new())?;
/// assert_eq!(values["target_angle"].value.as_number(), Some(90.0));
/// # Ok::<(), neurotrials::TrialsError>(())
/// ```
#[derive(Debug, Clone)]
pub struct PairedCodesEnhancer {
    buffer_name: String,
    value_index: usize,
    min: Option<f64>,
    max: Option<f64>,
    offset: f64,
    gain: f64,
    rules: Vec<PairedCodeRule>,
}

impl PairedCodesEnhancer {
    pub fn new(buffer_name: &str, rules: Vec<PairedCodeRule>) -> Self {
        PairedCodesEnhancer {
            buffer_name: buffer_name.to_string(),
            value_index: 0,
            min: None,
            max: None,
            offset: 0.0,
            gain: 1.0,
            rules,
        }
    }

    /// Loads the rule table from a CSV file with a `code,name[,category]` header.
    pub fn from_csv<P: AsRef<Path>>(buffer_name: &str, path: P) -> Result<Self> {
        Ok(Self::new(buffer_name, read_rules(path.as_ref())?))
    }

    pub fn value_index(mut self, value_index: usize) -> Self {
        self.value_index = value_index;
        self
    }

    pub fn value_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn offset_then_gain(mut self, offset: f64, gain: f64) -> Self {
        self.offset = offset;
        self.gain = gain;
        self
    }

    pub fn rules(&self) -> &[PairedCodeRule] {
        &self.rules
    }
}

impl TrialEnhancer for PairedCodesEnhancer {
    fn enhance(
        &self,
        trial: &Trial,
        _trial_count: usize,
        _experiment_info: &InfoMap,
        _subject_info: &InfoMap,
    ) -> Result<Enhancements> {
        let events = trial_events(trial, &self.buffer_name)?;
        let values = events
            .copy_value_range(self.min, self.max, self.value_index)
            .get_values(self.value_index);

        let mut enhancements = Enhancements::new();
        let mut index = 0;
        while index + 1 < values.len() {
            let Some(rule) = self.rules.iter().find(|rule| rule.code == values[index]) else {
                index += 1;
                continue;
            };
            let value = (values[index + 1] + self.offset) * self.gain;
            enhancements.insert(rule.name.clone(), enhancement(value, rule.category));
            // 值事件已被消费
            index += 2;
        }
        Ok(enhancements)
    }
}

/// One entry of an event-times table: times of `value` are stored as `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTimesRule {
    pub value: f64,
    pub name: String,
}

/// Records every time at which a listed code occurred in the trial
///
/// Each rule yields a list of trial-relative times, possibly empty, in the
/// [`EnhancementCategory::Time`] category.
#[derive(Debug, Clone)]
pub struct EventTimesEnhancer {
    buffer_name: String,
    value_index: usize,
    rules: Vec<EventTimesRule>,
}

impl EventTimesEnhancer {
    pub fn new(buffer_name: &str, rules: Vec<EventTimesRule>) -> Self {
        EventTimesEnhancer {
            buffer_name: buffer_name.to_string(),
            value_index: 0,
            rules,
        }
    }

    /// Loads rules from a CSV file with a `value,name` header.
    pub fn from_csv<P: AsRef<Path>>(buffer_name: &str, path: P) -> Result<Self> {
        Ok(Self::new(buffer_name, read_rules(path.as_ref())?))
    }

    pub fn value_index(mut self, value_index: usize) -> Self {
        self.value_index = value_index;
        self
    }
}

impl TrialEnhancer for EventTimesEnhancer {
    fn enhance(
        &self,
        trial: &Trial,
        _trial_count: usize,
        _experiment_info: &InfoMap,
        _subject_info: &InfoMap,
    ) -> Result<Enhancements> {
        let events = trial_events(trial, &self.buffer_name)?;
        let enhancements: BTreeMap<String, Enhancement> = self
            .rules
            .iter()
            .map(|rule| {
                let times = events.get_times_of(rule.value, self.value_index, None, None);
                (rule.name.clone(), enhancement(times, EnhancementCategory::Time))
            })
            .collect();
        Ok(enhancements)
    }
}
