use std::collections::HashMap;

use crate::error::{Result, TrialsError};
use crate::reader::Reader;
use crate::transformer::Transformer;
use crate::types::{Buffer, BufferData};

/// Consecutive empty reads tolerated by [`ReaderRouter::route_until`] unless configured.
pub const DEFAULT_EMPTY_READS_ALLOWED: usize = 3;

/// One path from a reader result, through transformers, into a named buffer.
pub struct ReaderRoute {
    pub reader_result_name: String,
    pub buffer_name: String,
    pub transformers: Vec<Box<dyn Transformer>>,
}

impl ReaderRoute {
    pub fn new(reader_result_name: &str, buffer_name: &str) -> Self {
        ReaderRoute {
            reader_result_name: reader_result_name.to_string(),
            buffer_name: buffer_name.to_string(),
            transformers: Vec::new(),
        }
    }

    /// Appends a transformer to the end of the chain.
    pub fn with_transformer(mut self, transformer: Box<dyn Transformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Applies every transformer in order to a copy of `data`.
    fn transform(&self, data: &BufferData) -> Result<BufferData> {
        let mut current = data.clone();
        for transformer in &self.transformers {
            current = transformer.transform(&current)?;
        }
        Ok(current)
    }

    fn route(&self, data: &BufferData, buffers: &mut HashMap<String, Buffer>) -> Result<()> {
        let transformed = self.transform(data)?;
        match buffers.get_mut(&self.buffer_name) {
            Some(buffer) => buffer.append(&transformed),
            None => Err(TrialsError::Config(format!(
                "route targets unknown buffer {}",
                self.buffer_name
            ))),
        }
    }
}

/// Owns one reader and the buffers its routes fill
///
/// Any reader error, including [`TrialsError::EndOfData`], trips a permanent
/// circuit breaker: [`still_going`](Self::still_going) turns false and the
/// reader is never called again. Failures on a single route are logged and
/// that route's data is dropped, while the other routes proceed.
///
/// # Examples
///
/// ```rust
/// use neurotrials::doctest_utils::create_simple_plx_file;
/// use neurotrials::{PlxReader, ReaderRoute, ReaderRouter};
///
/// let dir = tempfile::tempdir()?;
/// let path = dir.path().join("session.plx");
/// create_simple_plx_file(&path)?;
///
/// let routes = vec![ReaderRoute::new("strobed", "delimiter")];
/// let mut router = ReaderRouter::new("plexon", Box::new(PlxReader::new(&path)), routes, 3)?;
///
/// // Read until two seconds of events are buffered
/// let reached = router.route_until(2.0);
/// assert!(reached >= 2.0);
/// assert_eq!(router.buffer("delimiter").unwrap().len(), 2);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct ReaderRouter {
    name: String,
    reader: Box<dyn Reader>,
    routes: Vec<ReaderRoute>,
    buffers: HashMap<String, Buffer>,
    empty_reads_allowed: usize,
    still_going: bool,
    max_buffer_time: f64,
}

impl ReaderRouter {
    /// Creates a router and allocates one buffer per distinct route target.
    ///
    /// Buffers start from the reader's initial shapes, passed through each
    /// route's transformers, so the first real append already matches.
    ///
    /// # Errors
    ///
    /// * `TrialsError::Config` - a route names a result the reader never produces
    pub fn new(
        name: &str,
        reader: Box<dyn Reader>,
        routes: Vec<ReaderRoute>,
        empty_reads_allowed: usize,
    ) -> Result<Self> {
        let initial = reader.initial()?;
        let mut buffers = HashMap::new();
        for route in &routes {
            let data = initial.get(&route.reader_result_name).ok_or_else(|| {
                TrialsError::Config(format!(
                    "reader {} has no result named {}",
                    name, route.reader_result_name
                ))
            })?;
            if buffers.contains_key(&route.buffer_name) {
                continue;
            }
            buffers.insert(route.buffer_name.clone(), Buffer::new(route.transform(data)?));
        }

        Ok(ReaderRouter {
            name: name.to_string(),
            reader,
            routes,
            buffers,
            empty_reads_allowed,
            still_going: true,
            max_buffer_time: f64::NEG_INFINITY,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn still_going(&self) -> bool {
        self.still_going
    }

    /// Latest end time seen across this router's buffers; never decreases.
    ///
    /// Negative infinity until the first data arrives.
    pub fn max_buffer_time(&self) -> f64 {
        self.max_buffer_time
    }

    pub fn buffer(&self, name: &str) -> Option<&Buffer> {
        self.buffers.get(name)
    }

    pub fn buffer_mut(&mut self, name: &str) -> Option<&mut Buffer> {
        self.buffers.get_mut(name)
    }

    pub fn buffers(&self) -> &HashMap<String, Buffer> {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut HashMap<String, Buffer> {
        &mut self.buffers
    }

    pub fn open(&mut self) -> Result<()> {
        self.reader.open()
    }

    pub fn close(&mut self) {
        self.reader.close();
    }

    /// Reads once and routes whatever arrived.
    ///
    /// Returns true when the reader produced any data. After the breaker has
    /// tripped this returns false without touching the reader.
    pub fn route_next(&mut self) -> bool {
        if !self.still_going {
            return false;
        }

        let results = match self.reader.read_next() {
            Ok(results) => results,
            Err(TrialsError::EndOfData) => {
                log::info!("Reader {} reached end of data", self.name);
                self.still_going = false;
                return false;
            }
            Err(e) => {
                log::error!("Reader {} failed, no longer routing: {}", self.name, e);
                self.still_going = false;
                return false;
            }
        };

        if results.is_empty() {
            return false;
        }

        for route in &self.routes {
            // 不是每次读取都包含所有结果
            let Some(data) = results.get(&route.reader_result_name) else {
                continue;
            };
            if let Err(e) = route.route(data, &mut self.buffers) {
                log::error!(
                    "Router {} dropped {} -> {}: {}",
                    self.name,
                    route.reader_result_name,
                    route.buffer_name,
                    e
                );
            }
        }

        let latest = self
            .buffers
            .values()
            .filter_map(Buffer::end_time)
            .fold(self.max_buffer_time, f64::max);
        self.max_buffer_time = latest;
        true
    }

    /// Routes until the high-water mark reaches `target_time`.
    ///
    /// Gives up after more than `empty_reads_allowed` consecutive reads with no
    /// data, or when the breaker trips. Returns the high-water mark either
    /// way; callers compare it with `target_time` to detect an under-shoot.
    pub fn route_until(&mut self, target_time: f64) -> f64 {
        let mut empty_reads = 0;
        while self.max_buffer_time < target_time && self.still_going {
            if self.route_next() {
                empty_reads = 0;
            } else {
                empty_reads += 1;
                if empty_reads > self.empty_reads_allowed {
                    break;
                }
            }
        }

        if self.max_buffer_time < target_time {
            log::debug!(
                "Router {} stopped at {} short of {}",
                self.name,
                self.max_buffer_time,
                target_time
            );
        }
        self.max_buffer_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ReadResults;
    use crate::transformer::{FilterRange, OffsetThenGain};
    use crate::types::{NumericEventList, SignalChunk};
    use std::collections::VecDeque;

    /// Replays scripted reads, then reports end of data.
    struct ScriptedReader {
        reads: VecDeque<Result<ReadResults>>,
    }

    fn events(rows: &[Vec<f64>]) -> BufferData {
        NumericEventList::from_rows(rows).unwrap().into()
    }

    fn one(name: &str, data: BufferData) -> Result<ReadResults> {
        Ok(ReadResults::from([(name.to_string(), data)]))
    }

    impl Reader for ScriptedReader {
        fn read_next(&mut self) -> Result<ReadResults> {
            self.reads.pop_front().unwrap_or(Err(TrialsError::EndOfData))
        }

        fn initial(&self) -> Result<ReadResults> {
            Ok(ReadResults::from([
                ("codes".to_string(), NumericEventList::empty(1).into()),
                ("wide".to_string(), NumericEventList::empty(2).into()),
            ]))
        }
    }

    fn router(reads: Vec<Result<ReadResults>>, routes: Vec<ReaderRoute>) -> ReaderRouter {
        let reader = ScriptedReader {
            reads: reads.into(),
        };
        ReaderRouter::new("test", Box::new(reader), routes, 0).unwrap()
    }

    /// Fails on any non-empty input.
    struct RejectData;

    impl Transformer for RejectData {
        fn transform(&self, data: &BufferData) -> Result<BufferData> {
            if data.is_empty() {
                return Ok(data.clone());
            }
            Err(TrialsError::Transform("rejected".to_string()))
        }
    }

    #[test]
    fn test_failing_route_does_not_block_others() {
        let reads = vec![Ok(ReadResults::from([
            ("codes".to_string(), events(&[vec![1.0, 5.0]])),
            ("wide".to_string(), events(&[vec![1.0, 5.0, 6.0]])),
        ]))];
        let routes = vec![
            ReaderRoute::new("codes", "bad").with_transformer(Box::new(RejectData)),
            ReaderRoute::new("wide", "wide")
                .with_transformer(Box::new(OffsetThenGain::new(1.0, 2.0, 1))),
        ];
        let mut router = router(reads, routes);

        assert!(router.route_next());
        assert!(router.buffer("bad").unwrap().is_empty());
        let wide = router.buffer("wide").unwrap().data().as_events().unwrap();
        assert_eq!(wide.get_values(1), vec![14.0]);
        assert!(router.still_going());
    }

    #[test]
    fn test_filter_route_keeps_matching_codes() {
        let reads = vec![one("codes", events(&[vec![1.0, 5.0], vec![2.0, 50.0]]))];
        let route = ReaderRoute::new("codes", "low")
            .with_transformer(Box::new(FilterRange::new(None, Some(10.0), 0)));
        let mut router = router(reads, vec![route]);

        assert!(router.route_next());
        assert_eq!(router.buffer("low").unwrap().len(), 1);
        assert_eq!(router.max_buffer_time(), 1.0);
    }

    #[test]
    fn test_shape_mismatch_drops_route() {
        let signal: BufferData = SignalChunk::new(vec![1.0], 10.0, Some(0.0), vec!["a".into()])
            .unwrap()
            .into();
        let reads = vec![one("codes", signal), one("codes", events(&[vec![1.0, 1.0]]))];
        let mut router = router(reads, vec![ReaderRoute::new("codes", "codes")]);

        assert!(router.route_next());
        assert!(router.buffer("codes").unwrap().is_empty());
        assert!(router.route_next());
        assert_eq!(router.buffer("codes").unwrap().len(), 1);
    }

    #[test]
    fn test_high_water_mark_never_decreases() {
        let reads = vec![one("codes", events(&[vec![4.0, 1.0]]))];
        let mut router = router(reads, vec![ReaderRoute::new("codes", "codes")]);
        assert!(router.route_next());
        assert_eq!(router.max_buffer_time(), 4.0);

        router.buffer_mut("codes").unwrap().discard_before(10.0);
        assert!(router.buffer("codes").unwrap().is_empty());
        assert_eq!(router.max_buffer_time(), 4.0);
    }

    #[test]
    fn test_route_until_gives_up_on_empty_reads() {
        let reads = vec![
            Ok(ReadResults::new()),
            Ok(ReadResults::new()),
            one("codes", events(&[vec![5.0, 1.0]])),
        ];
        let mut router = router(reads, vec![ReaderRoute::new("codes", "codes")]);
        router.empty_reads_allowed = 1;

        // 连续两次空读后放弃
        assert_eq!(router.route_until(3.0), f64::NEG_INFINITY);
        assert!(router.still_going());
        assert_eq!(router.route_until(3.0), 5.0);
    }

    #[test]
    fn test_route_until_reaches_negative_times() {
        let reads = vec![
            one("codes", events(&[vec![-2.0, 1.0]])),
            one("codes", events(&[vec![-0.5, 1.0]])),
            one("codes", events(&[vec![3.0, 1.0]])),
        ];
        let mut router = router(reads, vec![ReaderRoute::new("codes", "codes")]);
        assert_eq!(router.max_buffer_time(), f64::NEG_INFINITY);

        assert_eq!(router.route_until(-1.0), -0.5);
        assert_eq!(router.buffer("codes").unwrap().len(), 2);
        // 已经追上，不再读取
        assert_eq!(router.route_until(-1.0), -0.5);
        assert_eq!(router.route_until(0.0), 3.0);
    }

    #[test]
    fn test_unknown_result_name_is_config_error() {
        let reader = ScriptedReader {
            reads: VecDeque::new(),
        };
        let result = ReaderRouter::new(
            "test",
            Box::new(reader),
            vec![ReaderRoute::new("missing", "x")],
            0,
        );
        assert!(matches!(result, Err(TrialsError::Config(_))));
    }
}
