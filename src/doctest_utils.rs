// Internal utilities for documentation tests and integration tests
// This file contains a small .plx writer used to synthesize recordings

use std::fs;
use std::path::Path;

use crate::plx::{
    COUNT_TABLE_CHANNELS, COUNT_TABLE_UNITS, EVENT_BLOCK, EVENT_COUNT_CHANNELS, PLX_MAGIC,
    SLOW_BLOCK, SPIKE_BLOCK,
};
use crate::Result;

fn put_i16(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// 写入定长字段，不足部分补 NUL
fn put_fixed(out: &mut Vec<u8>, text: &str, len: usize) {
    let bytes = text.as_bytes();
    let used = bytes.len().min(len);
    out.extend_from_slice(&bytes[..used]);
    out.resize(out.len() + (len - used), 0);
}

#[derive(Debug, Clone)]
pub struct FixtureDsp {
    pub name: String,
    pub channel: i32,
    pub gain: i32,
}

#[derive(Debug, Clone)]
pub struct FixtureEvent {
    pub name: String,
    pub channel: i32,
}

#[derive(Debug, Clone)]
pub struct FixtureSlow {
    pub name: String,
    pub channel: i32,
    pub ad_frequency: i32,
    pub gain: i32,
    pub pre_amp_gain: i32,
}

/// One data block to write.
#[derive(Debug, Clone)]
pub struct FixtureBlock {
    pub block_type: i16,
    pub ticks: u64,
    pub channel: i16,
    pub unit: i16,
    pub waveform_count: i16,
    pub samples: Vec<i16>,
}

impl FixtureBlock {
    pub fn spike(channel: i16, unit: i16, ticks: u64, waveform: Vec<i16>) -> Self {
        FixtureBlock {
            block_type: SPIKE_BLOCK,
            ticks,
            channel,
            unit,
            waveform_count: 1,
            samples: waveform,
        }
    }

    pub fn event(channel: i16, ticks: u64, value: i16) -> Self {
        FixtureBlock {
            block_type: EVENT_BLOCK,
            ticks,
            channel,
            unit: value,
            waveform_count: 0,
            samples: Vec::new(),
        }
    }

    pub fn slow(channel: i16, ticks: u64, samples: Vec<i16>) -> Self {
        FixtureBlock {
            block_type: SLOW_BLOCK,
            ticks,
            channel,
            unit: 0,
            waveform_count: 1,
            samples,
        }
    }

    /// A block with an arbitrary type code.
    pub fn raw(block_type: i16, channel: i16, ticks: u64, samples: Vec<i16>) -> Self {
        FixtureBlock {
            block_type,
            ticks,
            channel,
            unit: 0,
            waveform_count: if samples.is_empty() { 0 } else { 1 },
            samples,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 2 * self.samples.len());
        put_i16(&mut out, self.block_type);
        put_u16(&mut out, (self.ticks >> 32) as u16);
        out.extend_from_slice(&(self.ticks as u32).to_le_bytes());
        put_i16(&mut out, self.channel);
        put_i16(&mut out, self.unit);
        let words = if self.waveform_count > 0 {
            self.samples.len() as i16 / self.waveform_count
        } else {
            0
        };
        put_i16(&mut out, self.waveform_count);
        put_i16(&mut out, words);
        for &sample in &self.samples {
            put_i16(&mut out, sample);
        }
        out
    }
}

/// Builder for synthetic `.plx` recordings
///
/// Header count tables are filled in from the blocks unless
/// [`PlxFixture::header_counts`] overrides them.
#[derive(Debug, Clone)]
pub struct PlxFixture {
    pub version: i32,
    pub timestamp_frequency: i32,
    pub bits_per_spike_sample: u8,
    pub bits_per_slow_sample: u8,
    pub spike_max_magnitude_mv: u16,
    pub slow_max_magnitude_mv: u16,
    pub spike_pre_amp_gain: u16,
    pub dsp_channels: Vec<FixtureDsp>,
    pub event_channels: Vec<FixtureEvent>,
    pub slow_channels: Vec<FixtureSlow>,
    pub blocks: Vec<FixtureBlock>,
    pub event_count_override: Option<(usize, i32)>,
}

impl Default for PlxFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl PlxFixture {
    pub fn new() -> Self {
        PlxFixture {
            version: 106,
            timestamp_frequency: 40_000,
            bits_per_spike_sample: 12,
            bits_per_slow_sample: 12,
            spike_max_magnitude_mv: 3000,
            slow_max_magnitude_mv: 5000,
            spike_pre_amp_gain: 1000,
            dsp_channels: Vec::new(),
            event_channels: Vec::new(),
            slow_channels: Vec::new(),
            blocks: Vec::new(),
            event_count_override: None,
        }
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn timestamp_frequency(mut self, frequency: i32) -> Self {
        self.timestamp_frequency = frequency;
        self
    }

    pub fn spike_format(mut self, bits: u8, max_magnitude_mv: u16, pre_amp_gain: u16) -> Self {
        self.bits_per_spike_sample = bits;
        self.spike_max_magnitude_mv = max_magnitude_mv;
        self.spike_pre_amp_gain = pre_amp_gain;
        self
    }

    pub fn slow_format(mut self, bits: u8, max_magnitude_mv: u16) -> Self {
        self.bits_per_slow_sample = bits;
        self.slow_max_magnitude_mv = max_magnitude_mv;
        self
    }

    pub fn dsp_channel(mut self, name: &str, channel: i32, gain: i32) -> Self {
        self.dsp_channels.push(FixtureDsp {
            name: name.to_string(),
            channel,
            gain,
        });
        self
    }

    pub fn event_channel(mut self, name: &str, channel: i32) -> Self {
        self.event_channels.push(FixtureEvent {
            name: name.to_string(),
            channel,
        });
        self
    }

    pub fn slow_channel(
        mut self,
        name: &str,
        channel: i32,
        ad_frequency: i32,
        gain: i32,
        pre_amp_gain: i32,
    ) -> Self {
        self.slow_channels.push(FixtureSlow {
            name: name.to_string(),
            channel,
            ad_frequency,
            gain,
            pre_amp_gain,
        });
        self
    }

    pub fn block(mut self, block: FixtureBlock) -> Self {
        self.blocks.push(block);
        self
    }

    /// Writes `count` into the header's event count for `channel`.
    pub fn header_counts(mut self, channel: usize, count: i32) -> Self {
        self.event_count_override = Some((channel, count));
        self
    }

    /// All header bytes, up to the first data block.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_i32(&mut out, PLX_MAGIC as i32);
        put_i32(&mut out, self.version);
        put_fixed(&mut out, "neurotrials fixture", 128);
        put_i32(&mut out, self.timestamp_frequency);
        put_i32(&mut out, self.dsp_channels.len() as i32);
        put_i32(&mut out, self.event_channels.len() as i32);
        put_i32(&mut out, self.slow_channels.len() as i32);
        put_i32(&mut out, 32); // NumPointsWave
        put_i32(&mut out, 8); // NumPointsPreThr
        for field in [2024, 3, 15, 10, 30, 5] {
            put_i32(&mut out, field);
        }
        put_i32(&mut out, 0); // FastRead
        put_i32(&mut out, self.timestamp_frequency);
        let last = self.blocks.iter().map(|b| b.ticks).max().unwrap_or(0);
        out.extend_from_slice(&(last as f64).to_le_bytes());
        out.push(1); // Trodalness
        out.push(1); // DataTrodalness
        out.push(self.bits_per_spike_sample);
        out.push(self.bits_per_slow_sample);
        put_u16(&mut out, self.spike_max_magnitude_mv);
        put_u16(&mut out, self.slow_max_magnitude_mv);
        put_u16(&mut out, self.spike_pre_amp_gain);
        put_fixed(&mut out, "fixture", 18);
        put_fixed(&mut out, "", 18);
        put_fixed(&mut out, "", 10);

        let mut spike_counts = vec![[0i32; COUNT_TABLE_UNITS]; COUNT_TABLE_CHANNELS];
        let mut event_counts = vec![0i32; EVENT_COUNT_CHANNELS];
        for block in &self.blocks {
            let channel = block.channel as usize;
            if block.block_type == SPIKE_BLOCK
                && channel < COUNT_TABLE_CHANNELS
                && (block.unit as usize) < COUNT_TABLE_UNITS
            {
                spike_counts[channel][block.unit as usize] += 1;
            } else if block.block_type == EVENT_BLOCK && channel < EVENT_COUNT_CHANNELS {
                event_counts[channel] += 1;
            }
        }
        if let Some((channel, count)) = self.event_count_override {
            if channel < EVENT_COUNT_CHANNELS {
                event_counts[channel] = count;
            }
        }
        // TSCounts, then WFCounts with the same values
        for _ in 0..2 {
            for row in &spike_counts {
                for &count in row {
                    put_i32(&mut out, count);
                }
            }
        }
        for &count in &event_counts {
            put_i32(&mut out, count);
        }

        for dsp in &self.dsp_channels {
            put_fixed(&mut out, &dsp.name, 32);
            put_fixed(&mut out, &dsp.name, 32);
            put_i32(&mut out, dsp.channel);
            put_i32(&mut out, 10); // WFRate
            put_i32(&mut out, dsp.channel); // SIG
            put_i32(&mut out, 0); // Ref
            put_i32(&mut out, dsp.gain);
            put_i32(&mut out, 1); // Filter
            put_i32(&mut out, -200); // Threshold
            put_i32(&mut out, 1); // Method
            put_i32(&mut out, 1); // NUnits
            out.resize(out.len() + 640 + 20, 0); // Template, Fit
            put_i32(&mut out, 8); // SortWidth
            out.resize(out.len() + 80, 0); // Boxes
            put_i32(&mut out, 0); // SortBeg
            put_fixed(&mut out, "", 128);
            out.push(1); // SrcId
            out.push(0);
            put_u16(&mut out, dsp.channel as u16);
            out.resize(out.len() + 40, 0);
        }

        for event in &self.event_channels {
            put_fixed(&mut out, &event.name, 32);
            put_i32(&mut out, event.channel);
            put_fixed(&mut out, "", 128);
            out.push(4);
            out.push(0);
            put_u16(&mut out, event.channel as u16);
            out.resize(out.len() + 128, 0);
        }

        for slow in &self.slow_channels {
            put_fixed(&mut out, &slow.name, 32);
            put_i32(&mut out, slow.channel);
            put_i32(&mut out, slow.ad_frequency);
            put_i32(&mut out, slow.gain);
            put_i32(&mut out, 1); // Enabled
            put_i32(&mut out, slow.pre_amp_gain);
            put_i32(&mut out, 0); // SpikeChannel
            put_fixed(&mut out, "", 128);
            out.push(5);
            out.push(0);
            put_u16(&mut out, slow.channel as u16);
            out.resize(out.len() + 108, 0);
        }

        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header_bytes();
        for block in &self.blocks {
            out.extend_from_slice(&block.to_bytes());
        }
        out
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_bytes())?;
        Ok(())
    }
}

/// Creates a small recording for documentation examples
///
/// One spike channel `sig001`, one event channel `strobed` carrying trial start
/// code 1 at 1 s, 2 s and 3 s, and one slow channel `AD01` sampled at 1 kHz.
pub fn create_simple_plx_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let mut fixture = PlxFixture::new()
        .dsp_channel("sig001", 1, 32)
        .event_channel("strobed", 257)
        .slow_channel("AD01", 0, 1000, 1, 1000);

    for second in 1..=3u64 {
        let ticks = second * 40_000;
        fixture = fixture
            .block(FixtureBlock::event(257, ticks, 1))
            .block(FixtureBlock::slow(0, ticks, vec![100, 200, 300, 400]))
            .block(FixtureBlock::spike(1, 1, ticks + 4_000, vec![0; 32]));
    }

    fixture.write(path)
}
