use serde::{Deserialize, Serialize};

use crate::error::{Result, TrialsError};

/// Returns true when `time` falls in the half-open range `[start, end)`.
///
/// A missing bound is unbounded on that side.
pub(crate) fn in_time_range(time: f64, start: Option<f64>, end: Option<f64>) -> bool {
    start.map_or(true, |s| time >= s) && end.map_or(true, |e| time < e)
}

/// A list of timestamped numeric events
///
/// Each event is one row `(timestamp, value_1 .. value_m)` with `m >= 1`.
/// Rows are stored row-major in a single flat vector. Producers normally emit
/// rows in time order; once inside a [`Buffer`] every consumer assumes
/// non-decreasing timestamps.
///
/// # Examples
///
/// ```rust
/// use neurotrials::NumericEventList;
///
/// let mut events = NumericEventList::from_rows(&[
///     vec![0.5, 1.0],
///     vec![1.5, 2.0],
///     vec![2.5, 1.0],
/// ])?;
///
/// // Times at which value 1.0 occurred in column 0
/// assert_eq!(events.get_times_of(1.0, 0, None, None), vec![0.5, 2.5]);
///
/// // Drop everything before t = 1.0
/// events.discard_before(1.0);
/// assert_eq!(events.get_times(), vec![1.5, 2.5]);
/// # Ok::<(), neurotrials::TrialsError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EventListFields")]
pub struct NumericEventList {
    value_count: usize,
    data: Vec<f64>,
}

/// Serialized form of [`NumericEventList`], checked by `new` when read back.
#[derive(Deserialize)]
struct EventListFields {
    value_count: usize,
    data: Vec<f64>,
}

impl TryFrom<EventListFields> for NumericEventList {
    type Error = TrialsError;

    fn try_from(fields: EventListFields) -> Result<Self> {
        NumericEventList::new(fields.value_count, fields.data)
    }
}

impl NumericEventList {
    /// Creates an empty event list with `value_count` value columns.
    pub fn empty(value_count: usize) -> Self {
        NumericEventList {
            value_count: value_count.max(1),
            data: Vec::new(),
        }
    }

    /// Creates an event list from flat row-major data.
    ///
    /// # Errors
    ///
    /// * `TrialsError::ShapeMismatch` - `value_count` is zero or `data` does not
    ///   hold a whole number of rows
    pub fn new(value_count: usize, data: Vec<f64>) -> Result<Self> {
        if value_count == 0 {
            return Err(TrialsError::ShapeMismatch(
                "event list needs at least one value column".to_string(),
            ));
        }
        let width = value_count + 1;
        if data.len() % width != 0 {
            return Err(TrialsError::ShapeMismatch(format!(
                "{} numbers do not divide into rows of width {}",
                data.len(),
                width
            )));
        }
        Ok(NumericEventList { value_count, data })
    }

    /// Creates an event list from individual rows of `[time, values..]`.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let width = match rows.first() {
            Some(first) => first.len(),
            None => return Ok(Self::empty(1)),
        };
        if width < 2 {
            return Err(TrialsError::ShapeMismatch(
                "event rows need a time and at least one value".to_string(),
            ));
        }

        let mut data = Vec::with_capacity(rows.len() * width);
        for row in rows {
            if row.len() != width {
                return Err(TrialsError::ShapeMismatch(format!(
                    "row of width {} among rows of width {}",
                    row.len(),
                    width
                )));
            }
            data.extend_from_slice(row);
        }
        Self::new(width - 1, data)
    }

    /// Number of value columns (not counting the time column).
    pub fn value_count(&self) -> usize {
        self.value_count
    }

    fn width(&self) -> usize {
        self.value_count + 1
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.data.len() / self.width()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates over rows as `[time, values..]` slices.
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks_exact(self.width())
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows().nth(index)
    }

    pub fn get_times(&self) -> Vec<f64> {
        self.rows().map(|row| row[0]).collect()
    }

    /// Returns column `index` of the values; out-of-range columns yield nothing.
    pub fn get_values(&self, index: usize) -> Vec<f64> {
        if index >= self.value_count {
            return Vec::new();
        }
        self.rows().map(|row| row[index + 1]).collect()
    }

    /// Times of events whose value at `index` equals `value`, within `[start, end)`.
    pub fn get_times_of(
        &self,
        value: f64,
        index: usize,
        start: Option<f64>,
        end: Option<f64>,
    ) -> Vec<f64> {
        if index >= self.value_count {
            return Vec::new();
        }
        self.rows()
            .filter(|row| row[index + 1] == value && in_time_range(row[0], start, end))
            .map(|row| row[0])
            .collect()
    }

    fn copy_where<F>(&self, keep: F) -> Self
    where
        F: Fn(&[f64]) -> bool,
    {
        let mut data = Vec::new();
        for row in self.rows().filter(|row| keep(row)) {
            data.extend_from_slice(row);
        }
        NumericEventList {
            value_count: self.value_count,
            data,
        }
    }

    /// Copies the events with time in `[start, end)`.
    pub fn copy_time_range(&self, start: Option<f64>, end: Option<f64>) -> Self {
        self.copy_where(|row| in_time_range(row[0], start, end))
    }

    /// Copies the events whose value at `index` lies in `[min, max)`.
    pub fn copy_value_range(&self, min: Option<f64>, max: Option<f64>, index: usize) -> Self {
        if index >= self.value_count {
            return Self::empty(self.value_count);
        }
        self.copy_where(|row| in_time_range(row[index + 1], min, max))
    }

    /// Appends the rows of `other`.
    ///
    /// # Errors
    ///
    /// * `TrialsError::ShapeMismatch` - `other` has a different number of value columns
    pub fn append(&mut self, other: &NumericEventList) -> Result<()> {
        if other.value_count != self.value_count {
            return Err(TrialsError::ShapeMismatch(format!(
                "cannot append events with {} values to events with {} values",
                other.value_count, self.value_count
            )));
        }
        self.data.extend_from_slice(&other.data);
        Ok(())
    }

    /// Drops every event with time strictly before `time`.
    pub fn discard_before(&mut self, time: f64) {
        if self.rows().all(|row| row[0] >= time) {
            return;
        }
        *self = self.copy_where(|row| row[0] >= time);
    }

    pub fn shift_times(&mut self, delta: f64) {
        let width = self.width();
        for row in self.data.chunks_exact_mut(width) {
            row[0] += delta;
        }
    }

    /// Rescales column `index` as `(value + offset) * gain`.
    ///
    /// The offset is always applied before the gain.
    pub fn apply_offset_then_gain(&mut self, offset: f64, gain: f64, index: usize) {
        if index >= self.value_count {
            return;
        }
        let width = self.width();
        for row in self.data.chunks_exact_mut(width) {
            row[index + 1] = (row[index + 1] + offset) * gain;
        }
    }

    pub fn start_time(&self) -> Option<f64> {
        self.rows().next().map(|row| row[0])
    }

    pub fn end_time(&self) -> Option<f64> {
        self.rows().last().map(|row| row[0])
    }
}

/// A block of evenly spaced samples on one or more channels
///
/// `sample_data` is row-major: one row per sample, one column per channel.
/// The time of row `i` is `first_sample_time + i / sample_frequency`.
/// An empty chunk has no first sample time.
///
/// # Examples
///
/// ```rust
/// use neurotrials::SignalChunk;
///
/// let chunk = SignalChunk::new(
///     vec![0.0, 1.0, 2.0, 3.0],
///     2.0,
///     Some(10.0),
///     vec!["a".to_string()],
/// )?;
/// assert_eq!(chunk.get_times(), vec![10.0, 10.5, 11.0, 11.5]);
///
/// let tail = chunk.copy_time_range(Some(10.75), None);
/// assert_eq!(tail.first_sample_time(), Some(11.0));
/// assert_eq!(tail.channel_values(0), vec![2.0, 3.0]);
/// # Ok::<(), neurotrials::TrialsError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SignalChunkFields")]
pub struct SignalChunk {
    sample_data: Vec<f64>,
    sample_frequency: f64,
    first_sample_time: Option<f64>,
    channel_ids: Vec<String>,
}

/// Serialized form of [`SignalChunk`], checked by `new` when read back.
#[derive(Deserialize)]
struct SignalChunkFields {
    sample_data: Vec<f64>,
    sample_frequency: f64,
    first_sample_time: Option<f64>,
    channel_ids: Vec<String>,
}

impl TryFrom<SignalChunkFields> for SignalChunk {
    type Error = TrialsError;

    fn try_from(fields: SignalChunkFields) -> Result<Self> {
        SignalChunk::new(
            fields.sample_data,
            fields.sample_frequency,
            fields.first_sample_time,
            fields.channel_ids,
        )
    }
}

impl SignalChunk {
    pub fn new(
        sample_data: Vec<f64>,
        sample_frequency: f64,
        first_sample_time: Option<f64>,
        channel_ids: Vec<String>,
    ) -> Result<Self> {
        if channel_ids.is_empty() {
            return Err(TrialsError::ShapeMismatch(
                "signal chunk needs at least one channel".to_string(),
            ));
        }
        if !(sample_frequency > 0.0) {
            return Err(TrialsError::ShapeMismatch(format!(
                "sample frequency must be positive, got {}",
                sample_frequency
            )));
        }
        if sample_data.len() % channel_ids.len() != 0 {
            return Err(TrialsError::ShapeMismatch(format!(
                "{} samples do not divide across {} channels",
                sample_data.len(),
                channel_ids.len()
            )));
        }
        let first_sample_time = if sample_data.is_empty() {
            None
        } else {
            Some(first_sample_time.unwrap_or(0.0))
        };
        Ok(SignalChunk {
            sample_data,
            sample_frequency,
            first_sample_time,
            channel_ids,
        })
    }

    /// Creates a chunk with no samples yet.
    pub fn empty(sample_frequency: f64, channel_ids: Vec<String>) -> Result<Self> {
        Self::new(Vec::new(), sample_frequency, None, channel_ids)
    }

    pub fn sample_frequency(&self) -> f64 {
        self.sample_frequency
    }

    pub fn first_sample_time(&self) -> Option<f64> {
        self.first_sample_time
    }

    pub fn channel_ids(&self) -> &[String] {
        &self.channel_ids
    }

    pub fn sample_data(&self) -> &[f64] {
        &self.sample_data
    }

    pub fn channel_count(&self) -> usize {
        self.channel_ids.len()
    }

    /// Number of samples (rows).
    pub fn len(&self) -> usize {
        self.sample_data.len() / self.channel_count()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_data.is_empty()
    }

    pub fn channel_values(&self, index: usize) -> Vec<f64> {
        if index >= self.channel_count() {
            return Vec::new();
        }
        self.sample_data
            .chunks_exact(self.channel_count())
            .map(|row| row[index])
            .collect()
    }

    pub fn sample_time(&self, index: usize) -> Option<f64> {
        if index >= self.len() {
            return None;
        }
        self.first_sample_time
            .map(|first| first + index as f64 / self.sample_frequency)
    }

    pub fn get_times(&self) -> Vec<f64> {
        (0..self.len()).filter_map(|i| self.sample_time(i)).collect()
    }

    pub fn start_time(&self) -> Option<f64> {
        self.sample_time(0)
    }

    pub fn end_time(&self) -> Option<f64> {
        self.len().checked_sub(1).and_then(|last| self.sample_time(last))
    }

    /// Copies the samples in the contiguous row range `[from, to)`.
    fn copy_rows(&self, from: usize, to: usize) -> Self {
        let channels = self.channel_count();
        let sample_data = self.sample_data[from * channels..to * channels].to_vec();
        let first_sample_time = if sample_data.is_empty() {
            None
        } else {
            self.sample_time(from)
        };
        SignalChunk {
            sample_data,
            sample_frequency: self.sample_frequency,
            first_sample_time,
            channel_ids: self.channel_ids.clone(),
        }
    }

    /// Copies the samples with time in `[start, end)`.
    pub fn copy_time_range(&self, start: Option<f64>, end: Option<f64>) -> Self {
        let times = self.get_times();
        let from = times
            .iter()
            .position(|&t| in_time_range(t, start, end))
            .unwrap_or(times.len());
        let to = times[from..]
            .iter()
            .position(|&t| !in_time_range(t, start, end))
            .map_or(times.len(), |offset| from + offset);
        self.copy_rows(from, to)
    }

    pub fn append(&mut self, other: &SignalChunk) -> Result<()> {
        if other.channel_count() != self.channel_count() {
            return Err(TrialsError::ShapeMismatch(format!(
                "cannot append {} channels to {} channels",
                other.channel_count(),
                self.channel_count()
            )));
        }
        if other.sample_frequency != self.sample_frequency {
            return Err(TrialsError::ShapeMismatch(format!(
                "cannot append samples at {} Hz to samples at {} Hz",
                other.sample_frequency, self.sample_frequency
            )));
        }
        if other.is_empty() {
            return Ok(());
        }
        if self.is_empty() {
            self.first_sample_time = other.first_sample_time;
        }
        self.sample_data.extend_from_slice(&other.sample_data);
        Ok(())
    }

    /// Drops every sample with time strictly before `time`.
    pub fn discard_before(&mut self, time: f64) {
        let keep_from = self
            .get_times()
            .iter()
            .position(|&t| t >= time)
            .unwrap_or(self.len());
        if keep_from > 0 {
            *self = self.copy_rows(keep_from, self.len());
        }
    }

    pub fn shift_times(&mut self, delta: f64) {
        if let Some(first) = self.first_sample_time.as_mut() {
            *first += delta;
        }
    }

    /// Rescales channel `index` as `(value + offset) * gain`.
    pub fn apply_offset_then_gain(&mut self, offset: f64, gain: f64, index: usize) {
        let channels = self.channel_count();
        if index >= channels {
            return;
        }
        for row in self.sample_data.chunks_exact_mut(channels) {
            row[index] = (row[index] + offset) * gain;
        }
    }
}

/// The unit of data moved through the pipeline
///
/// A closed sum over the two data shapes. Every operation the pipeline needs is
/// available here without matching on the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BufferData {
    Events(NumericEventList),
    Signal(SignalChunk),
}

impl BufferData {
    pub fn len(&self) -> usize {
        match self {
            BufferData::Events(events) => events.len(),
            BufferData::Signal(chunk) => chunk.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn start_time(&self) -> Option<f64> {
        match self {
            BufferData::Events(events) => events.start_time(),
            BufferData::Signal(chunk) => chunk.start_time(),
        }
    }

    pub fn end_time(&self) -> Option<f64> {
        match self {
            BufferData::Events(events) => events.end_time(),
            BufferData::Signal(chunk) => chunk.end_time(),
        }
    }

    pub fn copy_time_range(&self, start: Option<f64>, end: Option<f64>) -> BufferData {
        match self {
            BufferData::Events(events) => BufferData::Events(events.copy_time_range(start, end)),
            BufferData::Signal(chunk) => BufferData::Signal(chunk.copy_time_range(start, end)),
        }
    }

    pub fn discard_before(&mut self, time: f64) {
        match self {
            BufferData::Events(events) => events.discard_before(time),
            BufferData::Signal(chunk) => chunk.discard_before(time),
        }
    }

    pub fn shift_times(&mut self, delta: f64) {
        match self {
            BufferData::Events(events) => events.shift_times(delta),
            BufferData::Signal(chunk) => chunk.shift_times(delta),
        }
    }

    pub fn apply_offset_then_gain(&mut self, offset: f64, gain: f64, index: usize) {
        match self {
            BufferData::Events(events) => events.apply_offset_then_gain(offset, gain, index),
            BufferData::Signal(chunk) => chunk.apply_offset_then_gain(offset, gain, index),
        }
    }

    /// Appends `other`, which must have the same variant and shape.
    pub fn append(&mut self, other: &BufferData) -> Result<()> {
        match (self, other) {
            (BufferData::Events(mine), BufferData::Events(theirs)) => mine.append(theirs),
            (BufferData::Signal(mine), BufferData::Signal(theirs)) => mine.append(theirs),
            (mine, theirs) => Err(TrialsError::ShapeMismatch(format!(
                "cannot append {} data to {} data",
                theirs.kind_name(),
                mine.kind_name()
            ))),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            BufferData::Events(_) => "events",
            BufferData::Signal(_) => "signal",
        }
    }

    pub fn as_events(&self) -> Option<&NumericEventList> {
        match self {
            BufferData::Events(events) => Some(events),
            BufferData::Signal(_) => None,
        }
    }

    pub fn as_signal(&self) -> Option<&SignalChunk> {
        match self {
            BufferData::Signal(chunk) => Some(chunk),
            BufferData::Events(_) => None,
        }
    }
}

impl From<NumericEventList> for BufferData {
    fn from(events: NumericEventList) -> Self {
        BufferData::Events(events)
    }
}

impl From<SignalChunk> for BufferData {
    fn from(chunk: SignalChunk) -> Self {
        BufferData::Signal(chunk)
    }
}

/// Owner of one named stream's data
///
/// A buffer grows by [`Buffer::append`] (its router) and shrinks by
/// [`Buffer::discard_before`] (the delimiter and extractor). Everything else
/// reads it through copies.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    data: BufferData,
}

impl Buffer {
    pub fn new(initial: BufferData) -> Self {
        Buffer { data: initial }
    }

    pub fn data(&self) -> &BufferData {
        &self.data
    }

    pub fn append(&mut self, data: &BufferData) -> Result<()> {
        self.data.append(data)
    }

    pub fn discard_before(&mut self, time: f64) {
        self.data.discard_before(time);
    }

    pub fn end_time(&self) -> Option<f64> {
        self.data.end_time()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(rows: &[[f64; 2]]) -> NumericEventList {
        let rows: Vec<Vec<f64>> = rows.iter().map(|r| r.to_vec()).collect();
        NumericEventList::from_rows(&rows).unwrap()
    }

    #[test]
    fn test_copy_time_range_is_idempotent() {
        let list = events(&[[0.0, 1.0], [1.0, 2.0], [2.0, 3.0], [3.0, 4.0]]);
        let once = list.copy_time_range(Some(1.0), Some(3.0));
        let twice = once.copy_time_range(Some(1.0), Some(3.0));
        assert_eq!(once, twice);
        assert_eq!(once.get_times(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_append_then_discard_keeps_tail() {
        let mut a = events(&[[0.0, 1.0], [1.0, 1.0], [5.0, 9.0]]);
        let b = events(&[[2.0, 7.0], [3.0, 8.0]]);
        a.append(&b).unwrap();
        a.discard_before(2.0);
        // B 的行加上 A 中时间不早于 2.0 的行
        assert_eq!(a.get_times(), vec![5.0, 2.0, 3.0]);
        assert_eq!(a.get_values(0), vec![9.0, 7.0, 8.0]);
    }

    #[test]
    fn test_apply_offset_then_gain_selected_column() {
        let mut list = NumericEventList::from_rows(&[vec![0.0, 1.0, 10.0], vec![1.0, 2.0, 20.0]])
            .unwrap();
        list.apply_offset_then_gain(3.0, 2.0, 1);
        assert_eq!(list.get_values(0), vec![1.0, 2.0]);
        assert_eq!(list.get_values(1), vec![(10.0 + 3.0) * 2.0, (20.0 + 3.0) * 2.0]);
        assert_eq!(list.get_times(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_single_zero_row_is_not_empty() {
        let list = events(&[[0.0, 0.0]]);
        assert!(!list.is_empty());
        assert_eq!(list.len(), 1);
        assert_eq!(list.get_times_of(0.0, 0, None, None), vec![0.0]);
        assert_eq!(BufferData::from(list).end_time(), Some(0.0));
    }

    #[test]
    fn test_append_shape_mismatch() {
        let mut a = events(&[[0.0, 1.0]]);
        let b = NumericEventList::from_rows(&[vec![1.0, 2.0, 3.0]]).unwrap();
        assert!(matches!(a.append(&b), Err(TrialsError::ShapeMismatch(_))));
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_copy_value_range() {
        let list = events(&[[0.0, 1.0], [1.0, 5.0], [2.0, 10.0]]);
        let copy = list.copy_value_range(Some(1.0), Some(10.0), 0);
        assert_eq!(copy.get_values(0), vec![1.0, 5.0]);
    }

    #[test]
    fn test_signal_chunk_append_and_discard() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let mut chunk = SignalChunk::empty(10.0, ids.clone()).unwrap();
        let more = SignalChunk::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 10.0, Some(1.0), ids.clone())
            .unwrap();
        chunk.append(&more).unwrap();
        assert_eq!(chunk.first_sample_time(), Some(1.0));
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.end_time(), Some(1.2));

        chunk.discard_before(1.1);
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.first_sample_time(), Some(1.1));
        assert_eq!(chunk.channel_values(1), vec![4.0, 6.0]);

        let wrong_rate = SignalChunk::new(vec![0.0, 0.0], 20.0, Some(2.0), ids).unwrap();
        assert!(chunk.append(&wrong_rate).is_err());
    }

    #[test]
    fn test_signal_chunk_shift_and_gain() {
        let mut chunk =
            SignalChunk::new(vec![1.0, 2.0], 1.0, Some(5.0), vec!["x".to_string()]).unwrap();
        chunk.shift_times(-5.0);
        chunk.apply_offset_then_gain(1.0, 10.0, 0);
        assert_eq!(chunk.get_times(), vec![0.0, 1.0]);
        assert_eq!(chunk.channel_values(0), vec![20.0, 30.0]);
    }

    #[test]
    fn test_deserialize_checks_shape() {
        let chunk = SignalChunk::new(vec![1.0, 2.0], 10.0, Some(0.5), vec!["x".to_string()])
            .unwrap();
        let json = serde_json::to_string(&BufferData::from(chunk.clone())).unwrap();
        let back: BufferData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_signal(), Some(&chunk));

        let no_channels = r#"{"kind": "signal", "sample_data": [1.0], "sample_frequency": 10.0,
            "first_sample_time": 0.0, "channel_ids": []}"#;
        assert!(serde_json::from_str::<BufferData>(no_channels).is_err());

        let ragged = r#"{"kind": "events", "value_count": 1, "data": [0.0, 1.0, 2.0]}"#;
        assert!(serde_json::from_str::<BufferData>(ragged).is_err());
        let no_values = r#"{"kind": "events", "value_count": 0, "data": []}"#;
        assert!(serde_json::from_str::<BufferData>(no_values).is_err());
    }

    #[test]
    fn test_buffer_data_variant_mismatch() {
        let mut data = BufferData::from(NumericEventList::empty(1));
        let chunk = SignalChunk::empty(1.0, vec!["x".to_string()]).unwrap();
        assert!(data.append(&BufferData::from(chunk)).is_err());
    }
}
