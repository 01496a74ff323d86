use crate::error::{Result, TrialsError};
use crate::types::BufferData;

/// A pure conversion applied to data on its way into a buffer
///
/// Transformers never modify their input; each returns a new owned copy.
///
/// # Examples
///
/// ```rust
/// use neurotrials::{BufferData, NumericEventList, OffsetThenGain, Transformer};
///
/// let events: BufferData = NumericEventList::new(1, vec![0.5, 10.0])?.into();
/// let scaled = OffsetThenGain::new(2.0, 0.5, 0).transform(&events)?;
///
/// assert_eq!(scaled.as_events().unwrap().get_values(0), vec![6.0]);
/// // 输入保持不变
/// assert_eq!(events.as_events().unwrap().get_values(0), vec![10.0]);
/// # Ok::<(), neurotrials::TrialsError>(())
/// ```
pub trait Transformer {
    fn transform(&self, data: &BufferData) -> Result<BufferData>;
}

/// `new_value = (old_value + offset) * gain` on one value column.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetThenGain {
    pub offset: f64,
    pub gain: f64,
    pub value_index: usize,
}

impl OffsetThenGain {
    pub fn new(offset: f64, gain: f64, value_index: usize) -> Self {
        OffsetThenGain {
            offset,
            gain,
            value_index,
        }
    }
}

impl Transformer for OffsetThenGain {
    fn transform(&self, data: &BufferData) -> Result<BufferData> {
        let mut data = data.clone();
        data.apply_offset_then_gain(self.offset, self.gain, self.value_index);
        Ok(data)
    }
}

/// Keeps only the events whose value at `value_index` lies in `[min, max)`.
///
/// Either bound may be open. Only event lists can be filtered.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub value_index: usize,
}

impl FilterRange {
    pub fn new(min: Option<f64>, max: Option<f64>, value_index: usize) -> Self {
        FilterRange {
            min,
            max,
            value_index,
        }
    }
}

impl Transformer for FilterRange {
    fn transform(&self, data: &BufferData) -> Result<BufferData> {
        match data {
            BufferData::Events(events) => {
                if self.value_index >= events.value_count() {
                    return Err(TrialsError::Transform(format!(
                        "value index {} out of range for {} value columns",
                        self.value_index,
                        events.value_count()
                    )));
                }
                Ok(events
                    .copy_value_range(self.min, self.max, self.value_index)
                    .into())
            }
            other => Err(TrialsError::Transform(format!(
                "cannot filter {} data by value range",
                other.kind_name()
            ))),
        }
    }
}
