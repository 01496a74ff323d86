use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Instant;

use csv::ByteRecord;

use crate::error::{Result, TrialsError};
use crate::types::{BufferData, NumericEventList, SignalChunk};
use crate::utils::atof_nonlocalized;

/// Named data produced by one reader call.
pub type ReadResults = HashMap<String, BufferData>;

/// A non-blocking source of named buffer data
///
/// `read_next` is polled from a single-threaded loop and must return quickly
/// whether or not data is ready: an empty map means "nothing yet". A source
/// that is finished for good reports [`TrialsError::EndOfData`]; any other
/// error is a failure of the source.
///
/// # Examples
///
/// ```rust
/// use neurotrials::{NumericEventList, ReadResults, Reader, Result, TrialsError};
///
/// /// Emits one event per call, then reports end of data.
/// struct Countdown(u32);
///
/// impl Reader for Countdown {
///     fn read_next(&mut self) -> Result<ReadResults> {
///         if self.0 == 0 {
///             return Err(TrialsError::EndOfData);
///         }
///         self.0 -= 1;
///         let events = NumericEventList::new(1, vec![self.0 as f64, 1.0])?;
///         Ok(ReadResults::from([("countdown".to_string(), events.into())]))
///     }
///
///     fn initial(&self) -> Result<ReadResults> {
///         Ok(ReadResults::from([("countdown".to_string(), NumericEventList::empty(1).into())]))
///     }
/// }
///
/// let mut reader = Countdown(2);
/// assert_eq!(reader.read_next()?.len(), 1);
/// assert_eq!(reader.read_next()?.len(), 1);
/// assert!(matches!(reader.read_next(), Err(TrialsError::EndOfData)));
/// # Ok::<(), TrialsError>(())
/// ```
pub trait Reader {
    /// Acquires the underlying resource.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Returns zero or one increment of data without blocking.
    fn read_next(&mut self) -> Result<ReadResults>;

    /// Empty data of the right shape for every result this reader can produce.
    fn initial(&self) -> Result<ReadResults>;

    /// Releases the underlying resource.
    fn close(&mut self) {}
}

impl<R: Reader + ?Sized> Reader for Box<R> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn read_next(&mut self) -> Result<ReadResults> {
        (**self).read_next()
    }

    fn initial(&self) -> Result<ReadResults> {
        (**self).initial()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

fn open_csv(path: &Path, delimiter: u8) -> Result<csv::Reader<File>> {
    let file = File::open(path)
        .map_err(|e| TrialsError::FileNotFound(format!("{}: {}", path.display(), e)))?;
    Ok(csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .delimiter(delimiter)
        .from_reader(file))
}

/// 解析一行数字；任一字段无法解析则返回 None
fn parse_numbers(record: &ByteRecord) -> Option<Vec<f64>> {
    record
        .iter()
        .map(|field| std::str::from_utf8(field).ok().and_then(atof_nonlocalized))
        .collect()
}

/// Reads timestamped events from a delimited text file, one row per call
///
/// Each row is `time, value_1 .. value_m`. Rows that do not parse as exactly
/// `m + 1` numbers (such as a header line) are logged and skipped.
pub struct CsvEventReader {
    path: PathBuf,
    result_name: String,
    value_count: usize,
    delimiter: u8,
    reader: Option<csv::Reader<File>>,
    record: ByteRecord,
}

impl CsvEventReader {
    pub fn new<P: AsRef<Path>>(path: P, result_name: &str, value_count: usize) -> Self {
        CsvEventReader {
            path: path.as_ref().to_path_buf(),
            result_name: result_name.to_string(),
            value_count: value_count.max(1),
            delimiter: b',',
            reader: None,
            record: ByteRecord::new(),
        }
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

impl Reader for CsvEventReader {
    fn open(&mut self) -> Result<()> {
        self.reader = Some(open_csv(&self.path, self.delimiter)?);
        Ok(())
    }

    fn read_next(&mut self) -> Result<ReadResults> {
        if self.reader.is_none() {
            self.open()?;
        }
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Err(TrialsError::EndOfData),
        };
        if !reader.read_byte_record(&mut self.record)? {
            return Err(TrialsError::EndOfData);
        }

        let mut results = ReadResults::new();
        match parse_numbers(&self.record) {
            Some(row) if row.len() == self.value_count + 1 => {
                let events = NumericEventList::new(self.value_count, row)?;
                results.insert(self.result_name.clone(), events.into());
            }
            _ => log::warn!(
                "Skipping row {:?} of {}: expected {} numbers",
                self.record,
                self.path.display(),
                self.value_count + 1
            ),
        }
        Ok(results)
    }

    fn initial(&self) -> Result<ReadResults> {
        Ok(ReadResults::from([(
            self.result_name.clone(),
            NumericEventList::empty(self.value_count).into(),
        )]))
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// Reads evenly sampled signals from a delimited text file
///
/// Each row holds one sample per channel. Up to `lines_per_chunk` rows are
/// returned per call as one [`SignalChunk`]; sample times count from zero at
/// the configured sample frequency.
pub struct CsvSignalReader {
    path: PathBuf,
    result_name: String,
    sample_frequency: f64,
    channel_ids: Vec<String>,
    lines_per_chunk: usize,
    delimiter: u8,
    reader: Option<csv::Reader<File>>,
    record: ByteRecord,
    samples_read: usize,
}

impl CsvSignalReader {
    pub fn new<P: AsRef<Path>>(
        path: P,
        result_name: &str,
        sample_frequency: f64,
        channel_ids: Vec<String>,
    ) -> Self {
        CsvSignalReader {
            path: path.as_ref().to_path_buf(),
            result_name: result_name.to_string(),
            sample_frequency,
            channel_ids,
            lines_per_chunk: 10,
            delimiter: b',',
            reader: None,
            record: ByteRecord::new(),
            samples_read: 0,
        }
    }

    pub fn lines_per_chunk(mut self, lines: usize) -> Self {
        self.lines_per_chunk = lines.max(1);
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

impl Reader for CsvSignalReader {
    fn open(&mut self) -> Result<()> {
        self.reader = Some(open_csv(&self.path, self.delimiter)?);
        self.samples_read = 0;
        Ok(())
    }

    fn read_next(&mut self) -> Result<ReadResults> {
        if self.reader.is_none() {
            self.open()?;
        }
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Err(TrialsError::EndOfData),
        };

        let channels = self.channel_ids.len();
        let mut sample_data = Vec::with_capacity(self.lines_per_chunk * channels);
        let mut rows = 0;
        let mut exhausted = false;
        while rows < self.lines_per_chunk {
            if !reader.read_byte_record(&mut self.record)? {
                exhausted = true;
                break;
            }
            match parse_numbers(&self.record) {
                Some(row) if row.len() == channels => {
                    sample_data.extend(row);
                    rows += 1;
                }
                _ => log::warn!(
                    "Skipping row {:?} of {}: expected {} samples",
                    self.record,
                    self.path.display(),
                    channels
                ),
            }
        }

        if rows == 0 {
            return if exhausted {
                Err(TrialsError::EndOfData)
            } else {
                Ok(ReadResults::new())
            };
        }

        let first_sample_time = self.samples_read as f64 / self.sample_frequency;
        self.samples_read += rows;
        let chunk = SignalChunk::new(
            sample_data,
            self.sample_frequency,
            Some(first_sample_time),
            self.channel_ids.clone(),
        )?;
        Ok(ReadResults::from([(self.result_name.clone(), chunk.into())]))
    }

    fn initial(&self) -> Result<ReadResults> {
        let chunk = SignalChunk::empty(self.sample_frequency, self.channel_ids.clone())?;
        Ok(ReadResults::from([(self.result_name.clone(), chunk.into())]))
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// Receives events over UDP, one datagram per call
///
/// Each datagram is a JSON object mapping a result name to a list of event
/// rows, for example `{"strobed": [[1.25, 42.0]]}`. Only the names passed to
/// [`UdpEventReader::new`] are accepted; other names and malformed datagrams
/// are logged and dropped.
pub struct UdpEventReader {
    bind_addr: String,
    streams: BTreeMap<String, usize>,
    socket: Option<UdpSocket>,
    buffer: Vec<u8>,
}

impl UdpEventReader {
    /// `streams` maps each accepted result name to its number of value columns.
    pub fn new(bind_addr: &str, streams: BTreeMap<String, usize>) -> Self {
        UdpEventReader {
            bind_addr: bind_addr.to_string(),
            streams,
            socket: None,
            buffer: vec![0u8; 65_536],
        }
    }

    /// Address actually bound, once open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn parse_datagram(&self, data: &[u8]) -> Result<ReadResults> {
        let decoded: HashMap<String, Vec<Vec<f64>>> = serde_json::from_slice(data)?;
        let mut results = ReadResults::new();
        for (name, rows) in decoded {
            let value_count = match self.streams.get(&name) {
                Some(&count) => count,
                None => {
                    log::warn!("Dropping datagram rows for unknown stream {}", name);
                    continue;
                }
            };
            if rows.is_empty() {
                continue;
            }
            let events = NumericEventList::from_rows(&rows)?;
            if events.value_count() != value_count {
                return Err(TrialsError::ShapeMismatch(format!(
                    "stream {} expects {} values per event, datagram has {}",
                    name,
                    value_count,
                    events.value_count()
                )));
            }
            results.insert(name, events.into());
        }
        Ok(results)
    }
}

impl Reader for UdpEventReader {
    fn open(&mut self) -> Result<()> {
        log::info!("Binding UDP socket: {}", self.bind_addr);
        let socket = UdpSocket::bind(&self.bind_addr)?;
        socket.set_nonblocking(true)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn read_next(&mut self) -> Result<ReadResults> {
        if self.socket.is_none() {
            self.open()?;
        }
        let received = match self.socket.as_ref() {
            Some(socket) => socket.recv(&mut self.buffer),
            None => return Ok(ReadResults::new()),
        };
        match received {
            Ok(len) => match self.parse_datagram(&self.buffer[..len]) {
                Ok(results) => Ok(results),
                Err(e) => {
                    log::error!("Failed to parse UDP datagram: {}", e);
                    Ok(ReadResults::new())
                }
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(ReadResults::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn initial(&self) -> Result<ReadResults> {
        Ok(self
            .streams
            .iter()
            .map(|(name, &count)| (name.clone(), NumericEventList::empty(count).into()))
            .collect())
    }

    fn close(&mut self) {
        self.socket = None;
    }
}

/// Paces another reader's results against the wall clock
///
/// Results are held back until the time elapsed since the reader was opened
/// reaches the latest end time among them, so replaying a finished file looks
/// like a live feed.
pub struct DelaySimulatorReader<R: Reader> {
    inner: R,
    started: Option<Instant>,
    pending: Option<(f64, ReadResults)>,
}

impl<R: Reader> DelaySimulatorReader<R> {
    pub fn new(inner: R) -> Self {
        DelaySimulatorReader {
            inner,
            started: None,
            pending: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn elapsed(&mut self) -> f64 {
        self.started.get_or_insert_with(Instant::now).elapsed().as_secs_f64()
    }
}

impl<R: Reader> Reader for DelaySimulatorReader<R> {
    fn open(&mut self) -> Result<()> {
        self.inner.open()?;
        self.started = Some(Instant::now());
        self.pending = None;
        Ok(())
    }

    fn read_next(&mut self) -> Result<ReadResults> {
        let elapsed = self.elapsed();
        if self.pending.is_none() {
            let results = self.inner.read_next()?;
            if results.is_empty() {
                return Ok(results);
            }
            let end_time = results
                .values()
                .filter_map(|data| data.end_time())
                .fold(f64::NEG_INFINITY, f64::max);
            self.pending = Some((end_time, results));
        }

        match self.pending.take() {
            Some((end_time, results)) if elapsed >= end_time => Ok(results),
            still_waiting => {
                self.pending = still_waiting;
                Ok(ReadResults::new())
            }
        }
    }

    fn initial(&self) -> Result<ReadResults> {
        self.inner.initial()
    }

    fn close(&mut self) {
        self.inner.close();
        self.pending = None;
    }
}
