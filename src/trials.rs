use std::collections::HashMap;

use crate::enhancers::TrialEnhancer;
use crate::error::Result;
use crate::trial::{InfoMap, Trial};
use crate::types::Buffer;

/// Cuts the recording into trials at each occurrence of a start code
///
/// Each start event strictly after the current boundary closes the trial
/// `[boundary, start)` and becomes the new boundary.
///
/// # Examples
///
/// ```rust
/// use neurotrials::{Buffer, NumericEventList, TrialDelimiter};
///
/// let starts = NumericEventList::from_rows(&[vec![1.0, 1.0], vec![2.0, 1.0], vec![3.0, 1.0]])?;
/// let buffer = Buffer::new(starts.into());
///
/// let mut delimiter = TrialDelimiter::new("start", 1.0, 0, 0.0);
/// let trials = delimiter.next(&buffer);
/// assert_eq!(trials.len(), 3);
/// assert_eq!(trials[2].1.start_time, 2.0);
///
/// let (_, last) = delimiter.last();
/// assert_eq!((last.start_time, last.end_time), (3.0, None));
/// assert_eq!(delimiter.trial_count(), 4);
/// # Ok::<(), neurotrials::TrialsError>(())
/// ```
#[derive(Debug, Clone)]
pub struct TrialDelimiter {
    start_buffer_name: String,
    start_value: f64,
    start_value_index: usize,
    trial_start_time: f64,
    trial_count: usize,
}

impl TrialDelimiter {
    pub fn new(
        start_buffer_name: &str,
        start_value: f64,
        start_value_index: usize,
        trial_start_time: f64,
    ) -> Self {
        TrialDelimiter {
            start_buffer_name: start_buffer_name.to_string(),
            start_value,
            start_value_index,
            trial_start_time,
            trial_count: 0,
        }
    }

    pub fn start_buffer_name(&self) -> &str {
        &self.start_buffer_name
    }

    /// Start of the trial that is currently open.
    pub fn trial_start_time(&self) -> f64 {
        self.trial_start_time
    }

    pub fn trial_count(&self) -> usize {
        self.trial_count
    }

    /// Emits every trial completed by start events seen since the last call.
    ///
    /// Each trial is paired with its zero-based trial number.
    pub fn next(&mut self, start_buffer: &Buffer) -> Vec<(usize, Trial)> {
        let Some(events) = start_buffer.data().as_events() else {
            log::warn!("Start buffer {} does not hold events", self.start_buffer_name);
            return Vec::new();
        };

        let start_times =
            events.get_times_of(self.start_value, self.start_value_index, None, None);
        let mut trials = Vec::new();
        for start_time in start_times {
            if start_time <= self.trial_start_time {
                continue;
            }
            trials.push((
                self.trial_count,
                Trial::new(self.trial_start_time, Some(start_time)),
            ));
            self.trial_start_time = start_time;
            self.trial_count += 1;
        }
        trials
    }

    /// Emits the still-open trial `[boundary, None)`.
    pub fn last(&mut self) -> (usize, Trial) {
        let trial = Trial::new(self.trial_start_time, None);
        let number = self.trial_count;
        self.trial_count += 1;
        (number, trial)
    }

    pub fn discard_before(&self, start_buffer: &mut Buffer, time: f64) {
        start_buffer.discard_before(time);
    }
}

/// Fills delimited trials with aligned data and enhancements
///
/// For each trial the earliest `wrt_value` event inside `[start, end)` of the
/// wrt buffer becomes the trial's zero time (0.0 when there is none). Every
/// named buffer is sliced to the trial and shifted by that zero time.
///
/// Enhancers run in order and each sees the enhancements of those before it.
/// Later enhancers overwrite earlier values with the same name.
pub struct TrialExtractor {
    wrt_buffer_name: String,
    wrt_value: f64,
    wrt_value_index: usize,
    named_buffers: Vec<String>,
    enhancers: Vec<Box<dyn TrialEnhancer>>,
}

impl TrialExtractor {
    pub fn new(
        wrt_buffer_name: &str,
        wrt_value: f64,
        wrt_value_index: usize,
        named_buffers: Vec<String>,
    ) -> Self {
        TrialExtractor {
            wrt_buffer_name: wrt_buffer_name.to_string(),
            wrt_value,
            wrt_value_index,
            named_buffers,
            enhancers: Vec::new(),
        }
    }

    pub fn with_enhancer(mut self, enhancer: Box<dyn TrialEnhancer>) -> Self {
        self.enhancers.push(enhancer);
        self
    }

    pub fn wrt_buffer_name(&self) -> &str {
        &self.wrt_buffer_name
    }

    pub fn named_buffers(&self) -> &[String] {
        &self.named_buffers
    }

    /// Earliest wrt event in the trial's range, or 0.0.
    fn find_wrt_time(&self, trial: &Trial, buffers: &HashMap<&str, &Buffer>) -> f64 {
        let events = buffers
            .get(self.wrt_buffer_name.as_str())
            .and_then(|buffer| buffer.data().as_events());
        let Some(events) = events else {
            return 0.0;
        };
        events
            .get_times_of(
                self.wrt_value,
                self.wrt_value_index,
                Some(trial.start_time),
                trial.end_time,
            )
            .into_iter()
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    /// Sets the trial's wrt time, attaches buffer slices and runs enhancers.
    ///
    /// # Errors
    ///
    /// Any enhancer error is returned unchanged.
    pub fn populate_trial(
        &self,
        trial: &mut Trial,
        trial_count: usize,
        buffers: &HashMap<&str, &Buffer>,
        experiment_info: &InfoMap,
        subject_info: &InfoMap,
    ) -> Result<()> {
        trial.wrt_time = self.find_wrt_time(trial, buffers);

        for name in &self.named_buffers {
            let Some(buffer) = buffers.get(name.as_str()) else {
                log::warn!("Named buffer {} is missing, leaving it out of the trial", name);
                continue;
            };
            let mut data = buffer
                .data()
                .copy_time_range(Some(trial.start_time), trial.end_time);
            data.shift_times(-trial.wrt_time);
            trial.add_buffer_data(name, data);
        }

        for enhancer in &self.enhancers {
            let enhancements =
                enhancer.enhance(trial, trial_count, experiment_info, subject_info)?;
            trial.enhancements.extend(enhancements);
        }
        Ok(())
    }

    /// Drops data before `time` from the wrt buffer and every named buffer.
    pub fn discard_before(&self, buffers: &mut HashMap<&str, &mut Buffer>, time: f64) {
        let names = std::iter::once(&self.wrt_buffer_name).chain(self.named_buffers.iter());
        for name in names {
            if let Some(buffer) = buffers.get_mut(name.as_str()) {
                buffer.discard_before(time);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enhancers::TrialDurationEnhancer;
    use crate::error::TrialsError;
    use crate::trial::{Enhancement, EnhancementCategory, Enhancements};
    use crate::types::NumericEventList;

    fn buffer(rows: &[Vec<f64>]) -> Buffer {
        Buffer::new(NumericEventList::from_rows(rows).unwrap().into())
    }

    #[test]
    fn test_delimiter_ignores_other_codes_and_old_starts() {
        let mut starts = buffer(&[vec![0.5, 1.0], vec![1.0, 2.0], vec![1.5, 1.0]]);
        let mut delimiter = TrialDelimiter::new("start", 1.0, 0, 1.0);

        let trials = delimiter.next(&starts);
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].0, 0);
        assert_eq!(trials[0].1.start_time, 1.0);
        assert_eq!(trials[0].1.end_time, Some(1.5));

        // 已处理过的起点不再产生试次
        assert!(delimiter.next(&starts).is_empty());

        delimiter.discard_before(&mut starts, 1.5);
        delimiter.discard_before(&mut starts, 1.5);
        assert_eq!(starts.len(), 1);
        assert!(delimiter.next(&starts).is_empty());
    }

    #[test]
    fn test_start_at_time_zero_is_not_empty() {
        // 单行且时间和值都是 0 的事件也算数据
        let starts = buffer(&[vec![0.0, 0.0]]);
        let mut delimiter = TrialDelimiter::new("start", 0.0, 0, -1.0);
        let trials = delimiter.next(&starts);
        assert_eq!(trials.len(), 1);
        assert_eq!(trials[0].1.end_time, Some(0.0));
    }

    #[test]
    fn test_missing_wrt_defaults_to_zero() {
        let wrt = buffer(&[vec![5.0, 42.0]]);
        let foo = buffer(&[vec![1.2, 0.0]]);
        let buffers = HashMap::from([("wrt", &wrt), ("foo", &foo)]);
        let extractor = TrialExtractor::new("wrt", 42.0, 0, vec!["foo".to_string()]);

        let mut trial = Trial::new(1.0, Some(2.0));
        extractor
            .populate_trial(&mut trial, 0, &buffers, &InfoMap::new(), &InfoMap::new())
            .unwrap();
        assert_eq!(trial.wrt_time, 0.0);
        let foo = trial.get_buffer_data("foo").unwrap().as_events().unwrap();
        assert_eq!(foo.get_times(), vec![1.2]);
    }

    struct Constant(&'static str, f64);

    impl TrialEnhancer for Constant {
        fn enhance(
            &self,
            trial: &Trial,
            _trial_count: usize,
            _experiment_info: &InfoMap,
            _subject_info: &InfoMap,
        ) -> Result<Enhancements> {
            assert!(trial.get_enhancement("duration").is_some());
            let enhancement = Enhancement {
                value: self.1.into(),
                category: EnhancementCategory::Value,
            };
            Ok(Enhancements::from([(self.0.to_string(), enhancement)]))
        }
    }

    struct Broken;

    impl TrialEnhancer for Broken {
        fn enhance(
            &self,
            _trial: &Trial,
            _trial_count: usize,
            _experiment_info: &InfoMap,
            _subject_info: &InfoMap,
        ) -> Result<Enhancements> {
            Err(TrialsError::Enhancer("broken".to_string()))
        }
    }

    #[test]
    fn test_later_enhancer_overwrites_earlier() {
        let extractor = TrialExtractor::new("wrt", 42.0, 0, Vec::new())
            .with_enhancer(Box::new(TrialDurationEnhancer::default()))
            .with_enhancer(Box::new(Constant("duration", -1.0)));
        let mut trial = Trial::new(1.0, Some(3.0));
        extractor
            .populate_trial(&mut trial, 0, &HashMap::new(), &InfoMap::new(), &InfoMap::new())
            .unwrap();
        assert_eq!(trial.get_enhancement("duration").and_then(|v| v.as_number()), Some(-1.0));
    }

    #[test]
    fn test_enhancer_error_propagates() {
        let extractor = TrialExtractor::new("wrt", 42.0, 0, Vec::new())
            .with_enhancer(Box::new(Broken));
        let mut trial = Trial::new(1.0, Some(3.0));
        let result =
            extractor.populate_trial(&mut trial, 0, &HashMap::new(), &InfoMap::new(), &InfoMap::new());
        assert!(matches!(result, Err(TrialsError::Enhancer(_))));
    }

    #[test]
    fn test_extractor_discard_covers_wrt_and_named() {
        let mut wrt = buffer(&[vec![1.0, 42.0], vec![3.0, 42.0]]);
        let mut foo = buffer(&[vec![1.0, 0.0], vec![2.0, 0.0]]);
        let mut other = buffer(&[vec![1.0, 0.0]]);
        let extractor = TrialExtractor::new("wrt", 42.0, 0, vec!["foo".to_string()]);

        let mut buffers: HashMap<&str, &mut Buffer> =
            HashMap::from([("wrt", &mut wrt), ("foo", &mut foo), ("other", &mut other)]);
        extractor.discard_before(&mut buffers, 2.0);
        assert_eq!(wrt.len(), 1);
        assert_eq!(foo.len(), 1);
        assert_eq!(other.len(), 1);
    }
}
