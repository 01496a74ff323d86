use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::enhancers::{
    read_rules, EventTimesEnhancer, EventTimesRule, PairedCodeRule, PairedCodesEnhancer,
    TrialDurationEnhancer, TrialEnhancer,
};
use crate::error::{Result, TrialsError};
use crate::pipeline::TrialPipeline;
use crate::plx::PlxReader;
use crate::reader::{
    CsvEventReader, CsvSignalReader, DelaySimulatorReader, Reader, UdpEventReader,
};
use crate::router::{ReaderRoute, ReaderRouter, DEFAULT_EMPTY_READS_ALLOWED};
use crate::transformer::{FilterRange, OffsetThenGain, Transformer};
use crate::trial::InfoMap;
use crate::trials::{TrialDelimiter, TrialExtractor};

fn default_value_count() -> usize {
    1
}

fn default_lines_per_chunk() -> usize {
    10
}

fn default_gain() -> f64 {
    1.0
}

fn default_empty_reads_allowed() -> usize {
    DEFAULT_EMPTY_READS_ALLOWED
}

fn default_duration_name() -> String {
    "duration".to_string()
}

/// Data source of one router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReaderConfig {
    Plx {
        path: PathBuf,
        #[serde(default)]
        follow: bool,
    },
    CsvEvents {
        path: PathBuf,
        result_name: String,
        #[serde(default = "default_value_count")]
        value_count: usize,
    },
    CsvSignal {
        path: PathBuf,
        result_name: String,
        sample_frequency: f64,
        channel_ids: Vec<String>,
        #[serde(default = "default_lines_per_chunk")]
        lines_per_chunk: usize,
    },
    UdpEvents {
        bind_addr: String,
        streams: BTreeMap<String, usize>,
    },
}

impl ReaderConfig {
    pub fn build(&self) -> Box<dyn Reader> {
        match self {
            ReaderConfig::Plx { path, follow } => Box::new(PlxReader::new(path).follow(*follow)),
            ReaderConfig::CsvEvents {
                path,
                result_name,
                value_count,
            } => Box::new(CsvEventReader::new(path, result_name, *value_count)),
            ReaderConfig::CsvSignal {
                path,
                result_name,
                sample_frequency,
                channel_ids,
                lines_per_chunk,
            } => Box::new(
                CsvSignalReader::new(path, result_name, *sample_frequency, channel_ids.clone())
                    .lines_per_chunk(*lines_per_chunk),
            ),
            ReaderConfig::UdpEvents { bind_addr, streams } => {
                Box::new(UdpEventReader::new(bind_addr, streams.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformerConfig {
    OffsetThenGain {
        #[serde(default)]
        offset: f64,
        #[serde(default = "default_gain")]
        gain: f64,
        #[serde(default)]
        value_index: usize,
    },
    FilterRange {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        value_index: usize,
    },
}

impl TransformerConfig {
    pub fn build(&self) -> Box<dyn Transformer> {
        match *self {
            TransformerConfig::OffsetThenGain {
                offset,
                gain,
                value_index,
            } => Box::new(OffsetThenGain::new(offset, gain, value_index)),
            TransformerConfig::FilterRange {
                min,
                max,
                value_index,
            } => Box::new(FilterRange::new(min, max, value_index)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnhancerConfig {
    Duration {
        #[serde(default = "default_duration_name")]
        name: String,
    },
    /// Rules come from `rules`, from `rules_csv`, or both.
    PairedCodes {
        buffer_name: String,
        #[serde(default)]
        rules: Vec<PairedCodeRule>,
        #[serde(default)]
        rules_csv: Option<PathBuf>,
        #[serde(default)]
        value_index: usize,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        offset: f64,
        #[serde(default = "default_gain")]
        gain: f64,
    },
    EventTimes {
        buffer_name: String,
        #[serde(default)]
        rules: Vec<EventTimesRule>,
        #[serde(default)]
        rules_csv: Option<PathBuf>,
        #[serde(default)]
        value_index: usize,
    },
}

impl EnhancerConfig {
    pub fn build(&self) -> Result<Box<dyn TrialEnhancer>> {
        let enhancer: Box<dyn TrialEnhancer> = match self {
            EnhancerConfig::Duration { name } => Box::new(TrialDurationEnhancer {
                name: name.clone(),
            }),
            EnhancerConfig::PairedCodes {
                buffer_name,
                rules,
                rules_csv,
                value_index,
                min,
                max,
                offset,
                gain,
            } => {
                let mut all_rules = rules.clone();
                if let Some(path) = rules_csv {
                    all_rules.extend(read_rules::<PairedCodeRule>(path)?);
                }
                Box::new(
                    PairedCodesEnhancer::new(buffer_name, all_rules)
                        .value_index(*value_index)
                        .value_range(*min, *max)
                        .offset_then_gain(*offset, *gain),
                )
            }
            EnhancerConfig::EventTimes {
                buffer_name,
                rules,
                rules_csv,
                value_index,
            } => {
                let mut all_rules = rules.clone();
                if let Some(path) = rules_csv {
                    all_rules.extend(read_rules::<EventTimesRule>(path)?);
                }
                Box::new(EventTimesEnhancer::new(buffer_name, all_rules).value_index(*value_index))
            }
        };
        Ok(enhancer)
    }
}

/// One route: reader result `result_name` into buffer `buffer_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub result_name: String,
    /// Defaults to `result_name`.
    #[serde(default)]
    pub buffer_name: Option<String>,
    #[serde(default)]
    pub transformers: Vec<TransformerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub name: String,
    pub reader: ReaderConfig,
    /// Replay the reader in real time with [`DelaySimulatorReader`].
    #[serde(default)]
    pub simulate_delay: bool,
    /// With no routes, every reader result goes to a buffer of the same name.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default = "default_empty_reads_allowed")]
    pub empty_reads_allowed: usize,
}

impl RouterConfig {
    pub fn build(&self) -> Result<ReaderRouter> {
        let mut reader = self.reader.build();
        if self.simulate_delay {
            reader = Box::new(DelaySimulatorReader::new(reader));
        }

        let routes = if self.routes.is_empty() {
            let mut names: Vec<String> = reader.initial()?.into_keys().collect();
            names.sort();
            names
                .iter()
                .map(|name| ReaderRoute::new(name, name))
                .collect()
        } else {
            self.routes
                .iter()
                .map(|route| {
                    let buffer_name = route.buffer_name.as_deref().unwrap_or(&route.result_name);
                    route.transformers.iter().fold(
                        ReaderRoute::new(&route.result_name, buffer_name),
                        |built, transformer| built.with_transformer(transformer.build()),
                    )
                })
                .collect()
        };

        ReaderRouter::new(&self.name, reader, routes, self.empty_reads_allowed)
    }
}

/// How trials are delimited, aligned and enhanced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConfig {
    pub start_buffer: String,
    pub start_value: f64,
    #[serde(default)]
    pub start_value_index: usize,
    #[serde(default)]
    pub trial_start_time: f64,
    /// Defaults to `start_buffer`.
    #[serde(default)]
    pub wrt_buffer: Option<String>,
    /// Defaults to `start_value`.
    #[serde(default)]
    pub wrt_value: Option<f64>,
    #[serde(default)]
    pub wrt_value_index: usize,
    #[serde(default)]
    pub enhancers: Vec<EnhancerConfig>,
}

/// A complete pipeline described in JSON
///
/// # Examples
///
/// ```rust
/// use neurotrials::{PipelineConfig, Trial};
/// # use neurotrials::doctest_utils::create_simple_plx_file;
///
/// # let dir = tempfile::tempdir()?;
/// # let path = dir.path().join("session.plx");
/// # create_simple_plx_file(&path)?;
/// let json = format!(
///     r#"{{
///         "experiment": {{"experimenter": "lab"}},
///         "readers": [
///             {{"name": "plexon", "reader": {{"type": "plx", "path": {:?}}}}}
///         ],
///         "trials": {{
///             "start_buffer": "strobed",
///             "start_value": 1,
///             "enhancers": [{{"type": "duration"}}]
///         }}
///     }}"#,
///     path
/// );
///
/// let config = PipelineConfig::from_json_str(&json)?;
/// let mut pipeline = config.build()?;
///
/// let mut trials: Vec<Trial> = Vec::new();
/// pipeline.run(&mut trials, &mut [])?;
/// assert_eq!(trials.len(), 4);
/// assert_eq!(trials[1].get_enhancement("duration").and_then(|v| v.as_number()), Some(1.0));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub experiment: InfoMap,
    #[serde(default)]
    pub subject: InfoMap,
    pub readers: Vec<RouterConfig>,
    pub trials: TrialConfig,
    #[serde(default)]
    pub idle_sleep_ms: Option<u64>,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            TrialsError::FileNotFound(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Builds every router, the delimiter and the extractor.
    ///
    /// Every buffer except the start buffer is attached to each trial.
    ///
    /// # Errors
    ///
    /// * `TrialsError::Config` - the start or wrt buffer is not filled by any reader
    pub fn build(&self) -> Result<TrialPipeline> {
        let routers = self
            .readers
            .iter()
            .map(RouterConfig::build)
            .collect::<Result<Vec<_>>>()?;

        let mut buffer_names: Vec<String> = routers
            .iter()
            .flat_map(|r| r.buffers().keys().cloned())
            .collect();
        buffer_names.sort();

        let trials = &self.trials;
        let wrt_buffer = trials.wrt_buffer.as_deref().unwrap_or(&trials.start_buffer);
        for name in [trials.start_buffer.as_str(), wrt_buffer] {
            if !buffer_names.iter().any(|b| b == name) {
                return Err(TrialsError::Config(format!(
                    "trials refer to unknown buffer {}, known buffers are {:?}",
                    name, buffer_names
                )));
            }
        }

        let named_buffers = buffer_names
            .into_iter()
            .filter(|name| *name != trials.start_buffer)
            .collect();

        let delimiter = TrialDelimiter::new(
            &trials.start_buffer,
            trials.start_value,
            trials.start_value_index,
            trials.trial_start_time,
        );
        let mut extractor = TrialExtractor::new(
            wrt_buffer,
            trials.wrt_value.unwrap_or(trials.start_value),
            trials.wrt_value_index,
            named_buffers,
        );
        for enhancer in &trials.enhancers {
            extractor = extractor.with_enhancer(enhancer.build()?);
        }

        let pipeline = TrialPipeline::new(routers, delimiter, extractor)?
            .with_info(self.experiment.clone(), self.subject.clone())
            .idle_sleep(self.idle_sleep_ms.map(Duration::from_millis));
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_reader_config() {
        let json = r#"{"type": "csv_events", "path": "codes.csv", "result_name": "codes"}"#;
        let config: ReaderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config,
            ReaderConfig::CsvEvents {
                path: PathBuf::from("codes.csv"),
                result_name: "codes".to_string(),
                value_count: 1,
            }
        );
    }

    #[test]
    fn test_unknown_reader_type_is_rejected() {
        let json = r#"{"type": "wav", "path": "x.wav"}"#;
        assert!(serde_json::from_str::<ReaderConfig>(json).is_err());
    }

    #[test]
    fn test_transformer_defaults() {
        let config: TransformerConfig = serde_json::from_str(r#"{"type": "offset_then_gain"}"#).unwrap();
        assert_eq!(
            config,
            TransformerConfig::OffsetThenGain {
                offset: 0.0,
                gain: 1.0,
                value_index: 0
            }
        );
    }

    #[test]
    fn test_router_defaults() {
        let json = r#"{"name": "udp", "reader": {"type": "udp_events", "bind_addr": "127.0.0.1:0", "streams": {"codes": 1}}}"#;
        let config: RouterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.empty_reads_allowed, DEFAULT_EMPTY_READS_ALLOWED);
        assert!(!config.simulate_delay);
        assert!(config.routes.is_empty());

        let router = config.build().unwrap();
        assert!(router.buffer("codes").is_some());
    }
}
