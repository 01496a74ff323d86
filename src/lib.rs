//! # Neural trial segmentation for Rust
//!
//! Turns continuous, multi-source electrophysiology streams into discrete,
//! time-aligned trials. Data flows through four layers:
//!
//! 1. **Readers** poll a source without blocking and return named
//!    [`BufferData`]: event lists or sampled signal chunks. Plexon `.plx`
//!    recordings, CSV files and UDP JSON datagrams are supported.
//! 2. **Routers** pass each reader result through [`Transformer`]s into named
//!    [`Buffer`]s. A failing reader is switched off without disturbing others.
//! 3. The **delimiter** cuts trials at each start code; the **extractor**
//!    slices every buffer to the trial, aligns it to a reference event and runs
//!    [`TrialEnhancer`]s.
//! 4. The [`TrialPipeline`] drives everything from a single thread and hands
//!    finished trials to a [`TrialSink`].
//!
//! ## Quick Start
//!
//! ### Splitting a recording into trials
//!
//! ```rust
//! use neurotrials::{PipelineConfig, JsonLinesTrialSink, read_trials, Result};
//! # use neurotrials::doctest_utils::create_simple_plx_file;
//!
//! fn main() -> Result<()> {
//!     # let dir = tempfile::tempdir()?;
//!     # let recording = dir.path().join("session.plx");
//!     # let output = dir.path().join("trials.jsonl");
//!     # create_simple_plx_file(&recording)?;
//!     let json = format!(
//!         r#"{{
//!             "readers": [{{
//!                 "name": "plexon",
//!                 "reader": {{"type": "plx", "path": {:?}}},
//!                 "routes": [
//!                     {{"result_name": "strobed", "buffer_name": "delimiter"}},
//!                     {{"result_name": "sig001", "buffer_name": "spikes"}}
//!                 ]
//!             }}],
//!             "trials": {{"start_buffer": "delimiter", "start_value": 1}}
//!         }}"#,
//!         recording
//!     );
//!
//!     let mut pipeline = PipelineConfig::from_json_str(&json)?.build()?;
//!     let mut sink = JsonLinesTrialSink::open(&output)?;
//!     let summary = pipeline.run(&mut sink, &mut [])?;
//!
//!     println!("Wrote {} trials", summary.trial_count);
//!     assert_eq!(read_trials(&output)?.len(), summary.trial_count);
//!     Ok(())
//! }
//! ```
//!
//! ### Reading a `.plx` file block by block
//!
//! ```rust
//! use neurotrials::{PlxFile, Result};
//! # use neurotrials::doctest_utils::create_simple_plx_file;
//!
//! fn main() -> Result<()> {
//!     # let dir = tempfile::tempdir()?;
//!     # let path = dir.path().join("session.plx");
//!     # create_simple_plx_file(&path)?;
//!     let mut file = PlxFile::open(&path)?;
//!
//!     let global = file.header().global.clone();
//!     println!("Version {}, {} Hz timestamps", global.version, global.timestamp_frequency);
//!
//!     for slow in &file.header().slow_channels {
//!         println!("{}: gain {}", slow.name, global.slow_gain(slow));
//!     }
//!
//!     let mut blocks = 0;
//!     while let Some(block) = file.read_next_block()? {
//!         let seconds = global.ticks_to_seconds(block.header.timestamp_ticks());
//!         assert!(seconds > 0.0);
//!         blocks += 1;
//!     }
//!     assert_eq!(blocks, 9);
//!     Ok(())
//! }
//! ```
//!
//! ## Error handling
//!
//! Run-time faults degrade the run instead of aborting it: a failing reader
//! stops only its own router, a failing route drops only that data, and an
//! unknown `.plx` block is skipped with a warning. Errors from enhancers and
//! from the sink end the run. All diagnostics go through the [`log`] facade.

pub mod config;
pub mod enhancers;
pub mod error;
pub mod pipeline;
pub mod plotter;
pub mod plx;
pub mod reader;
pub mod router;
pub mod transformer;
pub mod trial;
pub mod trials;
pub mod types;
pub mod utils;
pub mod writer;

#[doc(hidden)]
pub mod doctest_utils; // For internal doctest support

// Re-export main types for convenience
pub use config::{
    EnhancerConfig, PipelineConfig, ReaderConfig, RouteConfig, RouterConfig, TransformerConfig,
    TrialConfig,
};
pub use enhancers::{
    EventTimesEnhancer, EventTimesRule, PairedCodeRule, PairedCodesEnhancer,
    TrialDurationEnhancer, TrialEnhancer,
};
pub use error::{Result, TrialsError};
pub use pipeline::{RunSummary, TrialPipeline};
pub use plotter::{LogPlotter, Plotter};
pub use plx::{PlxFile, PlxHeader, PlxReader, PLX_MAGIC};
pub use reader::{
    CsvEventReader, CsvSignalReader, DelaySimulatorReader, ReadResults, Reader, UdpEventReader,
};
pub use router::{ReaderRoute, ReaderRouter, DEFAULT_EMPTY_READS_ALLOWED};
pub use transformer::{FilterRange, OffsetThenGain, Transformer};
pub use trial::{
    Enhancement, EnhancementCategory, EnhancementValue, Enhancements, InfoMap, Trial,
};
pub use trials::{TrialDelimiter, TrialExtractor};
pub use types::{Buffer, BufferData, NumericEventList, SignalChunk};
pub use writer::{read_trials, JsonLinesTrialSink, TrialSink};

/// Library version
///
/// Returns the current version of the neurotrials library.
///
/// # Examples
///
/// ```rust
/// let version = neurotrials::version();
/// assert!(!version.is_empty());
/// assert!(version.contains('.'));
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
