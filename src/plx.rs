//! Plexon `.plx` multi-channel recording files
//!
//! A `.plx` file is one fixed 7504-byte global header, then one header per
//! spike ("DSP") channel, per event channel and per slow (analog) channel,
//! then a flat sequence of data blocks until end of file. Every integer is
//! little-endian.
//!
//! [`PlxFile`] decodes the headers and yields raw [`DataBlock`]s strictly in
//! file order without seeking. [`PlxReader`] adapts it to the pipeline's
//! [`Reader`] interface, turning each block into named buffer data.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{Result, TrialsError};
use crate::reader::{ReadResults, Reader};
use crate::types::{NumericEventList, SignalChunk};
use crate::utils::FieldCursor;

/// "PLEX" read as a little-endian u32.
pub const PLX_MAGIC: u32 = 0x5845_4c50;

pub const GLOBAL_HEADER_SIZE: usize = 7504;
pub const DSP_HEADER_SIZE: usize = 1020;
pub const EVENT_HEADER_SIZE: usize = 296;
pub const SLOW_HEADER_SIZE: usize = 296;
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Rows of the per-channel timestamp and waveform count tables.
pub const COUNT_TABLE_CHANNELS: usize = 130;
/// Columns (units) of the per-channel count tables.
pub const COUNT_TABLE_UNITS: usize = 5;
/// Entries of the per-channel event count table.
pub const EVENT_COUNT_CHANNELS: usize = 512;
/// Upper bound on the channel headers of any one kind.
pub const MAX_CHANNEL_HEADERS: i32 = 4096;

pub const SPIKE_BLOCK: i16 = 1;
pub const EVENT_BLOCK: i16 = 4;
pub const SLOW_BLOCK: i16 = 5;

/// The fixed global header at the start of every `.plx` file.
#[derive(Debug, Clone, PartialEq)]
pub struct PlxGlobalHeader {
    pub version: i32,
    pub comment: String,
    /// Frequency of the timestamp clock shared by every block.
    pub timestamp_frequency: i32,
    pub num_dsp_channels: i32,
    pub num_event_channels: i32,
    pub num_slow_channels: i32,
    pub num_points_wave: i32,
    pub num_points_pre_threshold: i32,
    /// Acquisition date and time, when the header holds a valid one.
    pub acquired: Option<NaiveDateTime>,
    pub fast_read: i32,
    pub waveform_frequency: i32,
    pub last_timestamp: f64,
    pub trodalness: u8,
    pub data_trodalness: u8,
    pub bits_per_spike_sample: u8,
    pub bits_per_slow_sample: u8,
    pub spike_max_magnitude_mv: u16,
    pub slow_max_magnitude_mv: u16,
    pub spike_pre_amp_gain: u16,
    pub acquiring_software: String,
    pub processing_software: String,
    /// Spike counts indexed `[channel][unit]`.
    pub timestamp_counts: Vec<[i32; COUNT_TABLE_UNITS]>,
    /// Waveform counts indexed `[channel][unit]`.
    pub waveform_counts: Vec<[i32; COUNT_TABLE_UNITS]>,
    /// Event counts indexed by event channel.
    pub event_counts: Vec<i32>,
}

/// Header of one spike (DSP) channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DspChannelHeader {
    pub name: String,
    pub signal_name: String,
    pub channel: i32,
    pub waveform_rate: i32,
    pub signal: i32,
    pub reference: i32,
    pub gain: i32,
    pub filter: i32,
    pub threshold: i32,
    pub method: i32,
    pub num_units: i32,
    pub sort_width: i32,
    pub sort_begin: i32,
    pub comment: String,
    pub source_id: u8,
    pub channel_id: u16,
}

/// Header of one digital event channel.
#[derive(Debug, Clone, PartialEq)]
pub struct EventChannelHeader {
    pub name: String,
    pub channel: i32,
    pub comment: String,
    pub source_id: u8,
    pub channel_id: u16,
}

/// Header of one slow (continuous analog) channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowChannelHeader {
    pub name: String,
    pub channel: i32,
    pub ad_frequency: i32,
    pub gain: i32,
    pub enabled: i32,
    pub pre_amp_gain: i32,
    pub spike_channel: i32,
    pub comment: String,
    pub source_id: u8,
    pub channel_id: u16,
}

/// Every header in a `.plx` file, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct PlxHeader {
    pub global: PlxGlobalHeader,
    pub dsp_channels: Vec<DspChannelHeader>,
    pub event_channels: Vec<EventChannelHeader>,
    pub slow_channels: Vec<SlowChannelHeader>,
}

/// The fixed 16-byte header of one data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockHeader {
    pub block_type: i16,
    pub upper_timestamp: u16,
    pub lower_timestamp: u32,
    pub channel: i16,
    pub unit: i16,
    pub waveform_count: i16,
    pub words_per_waveform: i16,
}

/// One decoded data block: its header plus any 16-bit sample payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    pub header: DataBlockHeader,
    pub samples: Vec<i16>,
}

impl PlxGlobalHeader {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut c = FieldCursor::new(bytes);

        let magic = c.u32("MagicNumber")?;
        if magic != PLX_MAGIC {
            return Err(TrialsError::InvalidFormat(format!(
                "Not a plx file: magic number {:#010x}",
                magic
            )));
        }
        let version = c.i32("Version")?;
        if version < 100 {
            return Err(TrialsError::UnsupportedVersion(version));
        }
        let comment = c.string(128, "Comment")?;
        let timestamp_frequency = c.i32("ADFrequency")?;
        let num_dsp_channels = c.i32("NumDSPChannels")?;
        let num_event_channels = c.i32("NumEventChannels")?;
        let num_slow_channels = c.i32("NumSlowChannels")?;
        let num_points_wave = c.i32("NumPointsWave")?;
        let num_points_pre_threshold = c.i32("NumPointsPreThr")?;

        // 采集日期时间
        let year = c.i32("Year")?;
        let month = c.i32("Month")?;
        let day = c.i32("Day")?;
        let hour = c.i32("Hour")?;
        let minute = c.i32("Minute")?;
        let second = c.i32("Second")?;
        let acquired = acquisition_time(year, month, day, hour, minute, second);

        let fast_read = c.i32("FastRead")?;
        let waveform_frequency = c.i32("WaveformFreq")?;
        let last_timestamp = c.f64("LastTimestamp")?;

        // 以下字段自 103 版起有效，旧文件中通常为 0
        let trodalness = c.u8("Trodalness")?;
        let data_trodalness = c.u8("DataTrodalness")?;
        let bits_per_spike_sample = c.u8("BitsPerSpikeSample")?;
        let bits_per_slow_sample = c.u8("BitsPerSlowSample")?;
        let spike_max_magnitude_mv = c.u16("SpikeMaxMagnitudeMV")?;
        let slow_max_magnitude_mv = c.u16("SlowMaxMagnitudeMV")?;
        let spike_pre_amp_gain = c.u16("SpikePreAmpGain")?;
        let acquiring_software = c.string(18, "AcquiringSoftware")?;
        let processing_software = c.string(18, "ProcessingSoftware")?;
        c.skip(10, "Padding")?;

        let mut timestamp_counts = Vec::with_capacity(COUNT_TABLE_CHANNELS);
        for _ in 0..COUNT_TABLE_CHANNELS {
            let mut row = [0i32; COUNT_TABLE_UNITS];
            for count in row.iter_mut() {
                *count = c.i32("TSCounts")?;
            }
            timestamp_counts.push(row);
        }
        let mut waveform_counts = Vec::with_capacity(COUNT_TABLE_CHANNELS);
        for _ in 0..COUNT_TABLE_CHANNELS {
            let mut row = [0i32; COUNT_TABLE_UNITS];
            for count in row.iter_mut() {
                *count = c.i32("WFCounts")?;
            }
            waveform_counts.push(row);
        }
        let event_counts = c.i32_array(EVENT_COUNT_CHANNELS, "EVCounts")?;

        if timestamp_frequency <= 0 {
            return Err(TrialsError::InvalidFormat(format!(
                "timestamp frequency must be positive, got {}",
                timestamp_frequency
            )));
        }
        for (count, what) in [
            (num_dsp_channels, "spike"),
            (num_event_channels, "event"),
            (num_slow_channels, "slow"),
        ] {
            if !(0..=MAX_CHANNEL_HEADERS).contains(&count) {
                return Err(TrialsError::InvalidFormat(format!(
                    "{} channel count {} outside 0..={}",
                    what, count, MAX_CHANNEL_HEADERS
                )));
            }
        }

        Ok(PlxGlobalHeader {
            version,
            comment,
            timestamp_frequency,
            num_dsp_channels,
            num_event_channels,
            num_slow_channels,
            num_points_wave,
            num_points_pre_threshold,
            acquired,
            fast_read,
            waveform_frequency,
            last_timestamp,
            trodalness,
            data_trodalness,
            bits_per_spike_sample,
            bits_per_slow_sample,
            spike_max_magnitude_mv,
            slow_max_magnitude_mv,
            spike_pre_amp_gain,
            acquiring_software,
            processing_software,
            timestamp_counts,
            waveform_counts,
            event_counts,
        })
    }

    /// Converts a raw tick count to seconds.
    pub fn ticks_to_seconds(&self, ticks: u64) -> f64 {
        ticks as f64 / self.timestamp_frequency as f64
    }

    /// Volts per raw sample unit for a spike channel
    ///
    /// The formula depends on the file's format version:
    ///
    /// * before 103: `3000 / (2048 * gain * 1000)` (12-bit samples, 3000 mV peak)
    /// * 103 and 104: `max_mv / (0.5 * 2^bits * gain * 1000)`
    /// * 105 and later: `max_mv / (0.5 * 2^bits * gain * spike_pre_amp_gain)`
    ///
    /// where `bits` and `max_mv` are the header's spike bit depth and peak
    /// magnitude.
    pub fn spike_gain(&self, channel: &DspChannelHeader) -> f64 {
        let gain = channel.gain as f64;
        if self.version < 103 {
            3000.0 / (2048.0 * gain * 1000.0)
        } else {
            let levels = 0.5 * 2f64.powi(self.bits_per_spike_sample as i32);
            let pre_amp = if self.version < 105 {
                1000.0
            } else {
                self.spike_pre_amp_gain as f64
            };
            self.spike_max_magnitude_mv as f64 / (levels * gain * pre_amp)
        }
    }

    /// Volts per raw sample unit for a slow channel
    ///
    /// * before 102: `5000 / (2048 * gain * 1000)`
    /// * 102: `5000 / (2048 * gain * pre_amp_gain)`
    /// * 103 and later: `max_mv / (0.5 * 2^bits * gain * pre_amp_gain)`
    ///
    /// where `pre_amp_gain` comes from the slow channel header and `bits` and
    /// `max_mv` are the header's slow bit depth and peak magnitude.
    pub fn slow_gain(&self, channel: &SlowChannelHeader) -> f64 {
        let gain = channel.gain as f64;
        if self.version < 102 {
            5000.0 / (2048.0 * gain * 1000.0)
        } else if self.version < 103 {
            5000.0 / (2048.0 * gain * channel.pre_amp_gain as f64)
        } else {
            let levels = 0.5 * 2f64.powi(self.bits_per_slow_sample as i32);
            self.slow_max_magnitude_mv as f64 / (levels * gain * channel.pre_amp_gain as f64)
        }
    }
}

fn acquisition_time(
    year: i32,
    month: i32,
    day: i32,
    hour: i32,
    minute: i32,
    second: i32,
) -> Option<NaiveDateTime> {
    let date = NaiveDate::from_ymd_opt(year, u32::try_from(month).ok()?, u32::try_from(day).ok()?)?;
    date.and_hms_opt(
        u32::try_from(hour).ok()?,
        u32::try_from(minute).ok()?,
        u32::try_from(second).ok()?,
    )
}

impl DspChannelHeader {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut c = FieldCursor::new(bytes);
        let name = c.string(32, "Name")?;
        let signal_name = c.string(32, "SIGName")?;
        let channel = c.i32("Channel")?;
        let waveform_rate = c.i32("WFRate")?;
        let signal = c.i32("SIG")?;
        let reference = c.i32("Ref")?;
        let gain = c.i32("Gain")?;
        let filter = c.i32("Filter")?;
        let threshold = c.i32("Threshold")?;
        let method = c.i32("Method")?;
        let num_units = c.i32("NUnits")?;
        c.skip(5 * 64 * 2, "Template")?;
        c.skip(5 * 4, "Fit")?;
        let sort_width = c.i32("SortWidth")?;
        c.skip(5 * 2 * 4 * 2, "Boxes")?;
        let sort_begin = c.i32("SortBeg")?;
        let comment = c.string(128, "Comment")?;
        let source_id = c.u8("SrcId")?;
        c.skip(1, "reserved")?;
        let channel_id = c.u16("ChanId")?;
        Ok(DspChannelHeader {
            name,
            signal_name,
            channel,
            waveform_rate,
            signal,
            reference,
            gain,
            filter,
            threshold,
            method,
            num_units,
            sort_width,
            sort_begin,
            comment,
            source_id,
            channel_id,
        })
    }
}

impl EventChannelHeader {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut c = FieldCursor::new(bytes);
        let name = c.string(32, "Name")?;
        let channel = c.i32("Channel")?;
        let comment = c.string(128, "Comment")?;
        let source_id = c.u8("SrcId")?;
        c.skip(1, "reserved")?;
        let channel_id = c.u16("ChanId")?;
        Ok(EventChannelHeader {
            name,
            channel,
            comment,
            source_id,
            channel_id,
        })
    }
}

impl SlowChannelHeader {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut c = FieldCursor::new(bytes);
        let name = c.string(32, "Name")?;
        let channel = c.i32("Channel")?;
        let ad_frequency = c.i32("ADFreq")?;
        let gain = c.i32("Gain")?;
        let enabled = c.i32("Enabled")?;
        let pre_amp_gain = c.i32("PreAmpGain")?;
        let spike_channel = c.i32("SpikeChannel")?;
        let comment = c.string(128, "Comment")?;
        let source_id = c.u8("SrcId")?;
        c.skip(1, "reserved")?;
        let channel_id = c.u16("ChanId")?;
        Ok(SlowChannelHeader {
            name,
            channel,
            ad_frequency,
            gain,
            enabled,
            pre_amp_gain,
            spike_channel,
            comment,
            source_id,
            channel_id,
        })
    }
}

impl DataBlockHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut c = FieldCursor::new(bytes);
        Ok(DataBlockHeader {
            block_type: c.i16("Type")?,
            upper_timestamp: c.u16("UpperByteOf5ByteTimestamp")?,
            lower_timestamp: c.u32("TimeStamp")?,
            channel: c.i16("Channel")?,
            unit: c.i16("Unit")?,
            waveform_count: c.i16("NumberOfWaveforms")?,
            words_per_waveform: c.i16("NumberOfWordsInWaveform")?,
        })
    }

    /// Full timestamp in ticks: `(upper << 32) + lower`.
    pub fn timestamp_ticks(&self) -> u64 {
        ((self.upper_timestamp as u64) << 32) + self.lower_timestamp as u64
    }

    /// Number of 16-bit words following this header.
    pub fn payload_words(&self) -> usize {
        if self.waveform_count <= 0 || self.words_per_waveform <= 0 {
            return 0;
        }
        self.waveform_count as usize * self.words_per_waveform as usize
    }
}

fn read_header_bytes<R: Read>(source: &mut R, len: usize, what: &str) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    source.read_exact(&mut bytes).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            TrialsError::InvalidFormat(format!("file ends inside the {}", what))
        } else {
            TrialsError::Io(e)
        }
    })?;
    Ok(bytes)
}

impl PlxHeader {
    /// Reads the global header and all channel headers from `source`.
    pub fn read<R: Read>(source: &mut R) -> Result<Self> {
        let global_bytes = read_header_bytes(source, GLOBAL_HEADER_SIZE, "global header")?;
        let global = PlxGlobalHeader::parse(&global_bytes)?;

        let mut dsp_channels = Vec::with_capacity(global.num_dsp_channels as usize);
        for _ in 0..global.num_dsp_channels {
            let bytes = read_header_bytes(source, DSP_HEADER_SIZE, "spike channel headers")?;
            dsp_channels.push(DspChannelHeader::parse(&bytes)?);
        }

        let mut event_channels = Vec::with_capacity(global.num_event_channels as usize);
        for _ in 0..global.num_event_channels {
            let bytes = read_header_bytes(source, EVENT_HEADER_SIZE, "event channel headers")?;
            event_channels.push(EventChannelHeader::parse(&bytes)?);
        }

        let mut slow_channels = Vec::with_capacity(global.num_slow_channels as usize);
        for _ in 0..global.num_slow_channels {
            let bytes = read_header_bytes(source, SLOW_HEADER_SIZE, "slow channel headers")?;
            slow_channels.push(SlowChannelHeader::parse(&bytes)?);
        }

        Ok(PlxHeader {
            global,
            dsp_channels,
            event_channels,
            slow_channels,
        })
    }

    /// Total size of all headers, which is also the offset of the first block.
    pub fn size(&self) -> usize {
        GLOBAL_HEADER_SIZE
            + self.dsp_channels.len() * DSP_HEADER_SIZE
            + self.event_channels.len() * EVENT_HEADER_SIZE
            + self.slow_channels.len() * SLOW_HEADER_SIZE
    }
}

/// Sequential, forward-only access to the blocks of a `.plx` stream
///
/// Bytes of a block that is only partly available are kept until the rest
/// arrives, so a file that is still being written can be polled: a call that
/// hits end of file returns `Ok(None)` and a later call resumes the same block.
///
/// # Examples
///
/// ```rust
/// use neurotrials::plx::PlxFile;
///
/// # let dir = tempfile::tempdir()?;
/// # let path = dir.path().join("recording.plx");
/// # neurotrials::doctest_utils::create_simple_plx_file(&path)?;
/// let mut file = PlxFile::open(&path)?;
/// println!("format version {}", file.header().global.version);
///
/// let mut blocks = 0;
/// while let Some(block) = file.read_next_block()? {
///     println!("block type {} on channel {}", block.header.block_type, block.header.channel);
///     blocks += 1;
/// }
/// assert!(blocks > 0);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct PlxFile<R: Read> {
    source: R,
    header: PlxHeader,
    pending: Vec<u8>,
}

impl PlxFile<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path).map_err(|e| {
            TrialsError::FileNotFound(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_reader(BufReader::new(file))
    }
}

impl<R: Read> PlxFile<R> {
    /// Reads all headers from `source`, leaving it at the first data block.
    pub fn from_reader(mut source: R) -> Result<Self> {
        let header = PlxHeader::read(&mut source)?;
        Ok(PlxFile {
            source,
            header,
            pending: Vec::new(),
        })
    }

    pub fn header(&self) -> &PlxHeader {
        &self.header
    }

    /// True when some bytes of an incomplete block are being held.
    pub fn has_partial_block(&self) -> bool {
        !self.pending.is_empty()
    }

    /// 读取直到 pending 至少有 wanted 字节；遇到文件末尾返回 false
    fn fill_pending(&mut self, wanted: usize) -> Result<bool> {
        while self.pending.len() < wanted {
            let start = self.pending.len();
            self.pending.resize(wanted, 0);
            match self.source.read(&mut self.pending[start..]) {
                Ok(0) => {
                    self.pending.truncate(start);
                    return Ok(false);
                }
                Ok(n) => self.pending.truncate(start + n),
                Err(e) if e.kind() == ErrorKind::Interrupted => self.pending.truncate(start),
                Err(e) => {
                    self.pending.truncate(start);
                    return Err(e.into());
                }
            }
        }
        Ok(true)
    }

    /// Reads the next block, or `None` at (current) end of file.
    pub fn read_next_block(&mut self) -> Result<Option<DataBlock>> {
        if !self.fill_pending(BLOCK_HEADER_SIZE)? {
            return Ok(None);
        }
        let header = DataBlockHeader::parse(&self.pending[..BLOCK_HEADER_SIZE])?;
        if header.waveform_count < 0 || header.words_per_waveform < 0 {
            log::warn!(
                "Block of type {} on channel {} has negative payload size, reading no samples",
                header.block_type,
                header.channel
            );
        }

        let block_size = BLOCK_HEADER_SIZE + 2 * header.payload_words();
        if !self.fill_pending(block_size)? {
            return Ok(None);
        }

        let samples = self.pending[BLOCK_HEADER_SIZE..block_size]
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.pending.clear();

        Ok(Some(DataBlock { header, samples }))
    }
}

#[derive(Debug, Clone)]
struct SlowChannelInfo {
    name: String,
    gain: f64,
    frequency: f64,
    channel_id: String,
}

/// Result names and scaling for every channel, derived from the headers.
#[derive(Debug, Clone, Default)]
struct ChannelTable {
    spike_names: HashMap<i32, String>,
    event_names: HashMap<i32, String>,
    slow: HashMap<i32, SlowChannelInfo>,
}

fn channel_name(name: &str, prefix: &str, channel: i32) -> String {
    if name.is_empty() {
        format!("{}{}", prefix, channel)
    } else {
        name.to_string()
    }
}

impl ChannelTable {
    fn from_header(header: &PlxHeader) -> Self {
        let spike_names = header
            .dsp_channels
            .iter()
            .map(|dsp| (dsp.channel, channel_name(&dsp.name, "spike", dsp.channel)))
            .collect();
        let event_names = header
            .event_channels
            .iter()
            .map(|ev| (ev.channel, channel_name(&ev.name, "event", ev.channel)))
            .collect();
        let slow = header
            .slow_channels
            .iter()
            .map(|slow| {
                let info = SlowChannelInfo {
                    name: channel_name(&slow.name, "slow", slow.channel),
                    gain: header.global.slow_gain(slow),
                    frequency: slow.ad_frequency as f64,
                    channel_id: slow.channel.to_string(),
                };
                (slow.channel, info)
            })
            .collect();
        ChannelTable {
            spike_names,
            event_names,
            slow,
        }
    }

    /// Empty buffer data of the right shape for every channel.
    fn initial_results(&self) -> ReadResults {
        let mut results = ReadResults::new();
        for name in self.spike_names.values() {
            // (time, channel, unit)
            results.insert(name.clone(), NumericEventList::empty(2).into());
        }
        for name in self.event_names.values() {
            // (time, value)
            results.insert(name.clone(), NumericEventList::empty(1).into());
        }
        for info in self.slow.values() {
            match SignalChunk::empty(info.frequency, vec![info.channel_id.clone()]) {
                Ok(chunk) => {
                    results.insert(info.name.clone(), chunk.into());
                }
                Err(e) => log::warn!("Skipping slow channel {}: {}", info.name, e),
            }
        }
        results
    }
}

/// Spike and event totals seen while reading, checked against the header.
#[derive(Debug, Clone, Default)]
struct BlockCounts {
    spikes: HashMap<(i32, i32), i64>,
    events: HashMap<i32, i64>,
}

/// Pipeline [`Reader`] over a `.plx` file
///
/// Each [`read_next`](Reader::read_next) call decodes exactly one data block:
///
/// * spike block → one `(time, channel, unit)` event under the spike channel's name
/// * event block → one `(time, value)` event under the event channel's name, the
///   value being the block's unit field
/// * slow block → a [`SignalChunk`] of gain-scaled samples under the slow channel's name
///
/// Unknown block types and blocks for undeclared channels are logged and
/// produce empty results.
///
/// At end of file a finished recording reports [`TrialsError::EndOfData`].
/// With `follow` set, end of file instead yields empty results so that a file
/// still being written can be polled.
///
/// # Examples
///
/// ```rust
/// use neurotrials::{PlxReader, Reader};
///
/// # let dir = tempfile::tempdir()?;
/// # let path = dir.path().join("recording.plx");
/// # neurotrials::doctest_utils::create_simple_plx_file(&path)?;
/// let mut reader = PlxReader::new(&path);
///
/// // Buffer shapes are known before any block is read
/// let initial = reader.initial()?;
/// assert!(initial.contains_key("strobed"));
///
/// reader.open()?;
/// let mut results = 0;
/// while let Ok(next) = reader.read_next() {
///     results += next.len();
/// }
/// reader.close();
/// assert!(results > 0);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct PlxReader {
    path: PathBuf,
    follow: bool,
    file: Option<PlxFile<BufReader<File>>>,
    channels: ChannelTable,
    timestamp_frequency: f64,
    counts: BlockCounts,
    finished: bool,
}

impl PlxReader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        PlxReader {
            path: path.as_ref().to_path_buf(),
            follow: false,
            file: None,
            channels: ChannelTable::default(),
            timestamp_frequency: 1.0,
            counts: BlockCounts::default(),
            finished: false,
        }
    }

    /// Keep polling at end of file instead of reporting end of data.
    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Headers of the open file.
    pub fn header(&self) -> Option<&PlxHeader> {
        self.file.as_ref().map(|f| f.header())
    }

    fn decode_block(&mut self, block: DataBlock) -> ReadResults {
        let mut results = ReadResults::new();
        let h = block.header;
        let time = h.timestamp_ticks() as f64 / self.timestamp_frequency;
        let channel = h.channel as i32;

        match h.block_type {
            SPIKE_BLOCK => match self.channels.spike_names.get(&channel) {
                Some(name) => {
                    *self.counts.spikes.entry((channel, h.unit as i32)).or_insert(0) += 1;
                    let row = vec![time, channel as f64, h.unit as f64];
                    if let Ok(events) = NumericEventList::new(2, row) {
                        results.insert(name.clone(), events.into());
                    }
                }
                None => log::warn!("Spike block for undeclared channel {}, skipping", channel),
            },
            EVENT_BLOCK => match self.channels.event_names.get(&channel) {
                Some(name) => {
                    *self.counts.events.entry(channel).or_insert(0) += 1;
                    if let Ok(events) = NumericEventList::new(1, vec![time, h.unit as f64]) {
                        results.insert(name.clone(), events.into());
                    }
                }
                None => log::warn!("Event block for undeclared channel {}, skipping", channel),
            },
            SLOW_BLOCK => match self.channels.slow.get(&channel) {
                Some(info) => {
                    let samples = block.samples.iter().map(|&s| s as f64 * info.gain).collect();
                    match SignalChunk::new(
                        samples,
                        info.frequency,
                        Some(time),
                        vec![info.channel_id.clone()],
                    ) {
                        Ok(chunk) => {
                            results.insert(info.name.clone(), chunk.into());
                        }
                        Err(e) => log::warn!("Skipping slow block on {}: {}", info.name, e),
                    }
                }
                None => log::warn!("Slow block for undeclared channel {}, skipping", channel),
            },
            other => log::warn!(
                "Skipping unknown block type {} at {} ticks ({} payload words)",
                other,
                h.timestamp_ticks(),
                h.payload_words()
            ),
        }
        results
    }

    /// 文件读完后对照头部计数（仅用于校验）
    fn validate_counts(&self, global: &PlxGlobalHeader) {
        for (&(channel, unit), &seen) in &self.counts.spikes {
            let expected = usize::try_from(channel)
                .ok()
                .zip(usize::try_from(unit).ok())
                .and_then(|(c, u)| global.timestamp_counts.get(c).and_then(|row| row.get(u)));
            if let Some(&expected) = expected {
                if expected > 0 && expected as i64 != seen {
                    log::warn!(
                        "Spike channel {} unit {}: header counts {}, file holds {}",
                        channel,
                        unit,
                        expected,
                        seen
                    );
                }
            }
        }
        for (&channel, &seen) in &self.counts.events {
            let expected = usize::try_from(channel)
                .ok()
                .and_then(|c| global.event_counts.get(c));
            if let Some(&expected) = expected {
                if expected > 0 && expected as i64 != seen {
                    log::warn!(
                        "Event channel {}: header counts {}, file holds {}",
                        channel,
                        expected,
                        seen
                    );
                }
            }
        }
    }
}

impl Reader for PlxReader {
    fn open(&mut self) -> Result<()> {
        let file = PlxFile::open(&self.path)?;
        self.channels = ChannelTable::from_header(file.header());
        self.timestamp_frequency = file.header().global.timestamp_frequency as f64;
        log::info!(
            "Opened {} (version {}, {} spike, {} event, {} slow channels)",
            self.path.display(),
            file.header().global.version,
            file.header().dsp_channels.len(),
            file.header().event_channels.len(),
            file.header().slow_channels.len()
        );
        self.file = Some(file);
        self.counts = BlockCounts::default();
        self.finished = false;
        Ok(())
    }

    fn read_next(&mut self) -> Result<ReadResults> {
        if self.finished {
            return Err(TrialsError::EndOfData);
        }
        if self.file.is_none() {
            self.open()?;
        }
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Err(TrialsError::EndOfData),
        };

        match file.read_next_block()? {
            Some(block) => Ok(self.decode_block(block)),
            None if self.follow => Ok(ReadResults::new()),
            None => {
                if file.has_partial_block() {
                    log::warn!("{} ends inside a data block, ignoring it", self.path.display());
                }
                let global = file.header().global.clone();
                self.validate_counts(&global);
                self.finished = true;
                Err(TrialsError::EndOfData)
            }
        }
    }

    /// Opens a second, header-only pass over the file to report channel shapes.
    fn initial(&self) -> Result<ReadResults> {
        let peek = PlxFile::open(&self.path)?;
        Ok(ChannelTable::from_header(peek.header()).initial_results())
    }

    fn close(&mut self) {
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctest_utils::{FixtureBlock, PlxFixture};

    fn header_for(version: i32) -> PlxGlobalHeader {
        let bytes = PlxFixture::new().version(version).to_bytes();
        PlxGlobalHeader::parse(&bytes[..GLOBAL_HEADER_SIZE]).unwrap()
    }

    #[test]
    fn test_block_timestamp() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4i16.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        let header = DataBlockHeader::parse(&bytes).unwrap();
        assert_eq!(header.timestamp_ticks(), (2u64 << 32) + 5);
        assert_eq!(header.payload_words(), 0);
    }

    #[test]
    fn test_spike_gain_by_version() {
        let dsp = DspChannelHeader {
            name: "sig001".to_string(),
            signal_name: String::new(),
            channel: 1,
            waveform_rate: 0,
            signal: 1,
            reference: 0,
            gain: 32,
            filter: 0,
            threshold: 0,
            method: 0,
            num_units: 0,
            sort_width: 0,
            sort_begin: 0,
            comment: String::new(),
            source_id: 0,
            channel_id: 0,
        };

        let old = header_for(102);
        assert_eq!(old.spike_gain(&dsp), 3000.0 / (2048.0 * 32.0 * 1000.0));

        let mid = header_for(104);
        let expected = mid.spike_max_magnitude_mv as f64
            / (0.5 * 2f64.powi(mid.bits_per_spike_sample as i32) * 32.0 * 1000.0);
        assert_eq!(mid.spike_gain(&dsp), expected);

        let new = header_for(106);
        let expected = new.spike_max_magnitude_mv as f64
            / (0.5
                * 2f64.powi(new.bits_per_spike_sample as i32)
                * 32.0
                * new.spike_pre_amp_gain as f64);
        assert_eq!(new.spike_gain(&dsp), expected);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = PlxFixture::new().to_bytes();
        bytes[0] = b'X';
        let err = PlxFile::from_reader(&bytes[..]).err();
        assert!(matches!(err, Some(TrialsError::InvalidFormat(_))));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = PlxFixture::new().to_bytes();
        let err = PlxFile::from_reader(&bytes[..100]).err();
        assert!(matches!(err, Some(TrialsError::InvalidFormat(_))));
    }

    #[test]
    fn test_implausible_channel_count() {
        let mut bytes = PlxFixture::new().dsp_channel("sig001", 1, 32).to_bytes();
        // NumDSPChannels
        bytes[140..144].copy_from_slice(&i32::MAX.to_le_bytes());
        let err = PlxFile::from_reader(&bytes[..]).err();
        assert!(matches!(err, Some(TrialsError::InvalidFormat(_))));

        bytes[140..144].copy_from_slice(&(MAX_CHANNEL_HEADERS + 1).to_le_bytes());
        let err = PlxFile::from_reader(&bytes[..]).err();
        assert!(matches!(err, Some(TrialsError::InvalidFormat(_))));
    }

    #[test]
    fn test_partial_block_is_held() {
        let fixture = PlxFixture::new()
            .event_channel("strobed", 257)
            .block(FixtureBlock::event(257, 40_000, 3));
        let bytes = fixture.to_bytes();
        let cut = bytes.len() - 4;

        let mut file = PlxFile::from_reader(&bytes[..cut]).unwrap();
        assert!(file.read_next_block().unwrap().is_none());
        assert!(file.has_partial_block());
    }
}
