use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::Duration;

use crate::error::{Result, TrialsError};
use crate::plotter::Plotter;
use crate::router::ReaderRouter;
use crate::trial::{InfoMap, Trial};
use crate::trials::{TrialDelimiter, TrialExtractor};
use crate::types::Buffer;
use crate::writer::TrialSink;

/// Outcome of [`TrialPipeline::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Trials handed to the sink, including the final open-ended trial.
    pub trial_count: usize,
    /// True when the start stream ran out; false when the plotters were closed.
    pub reached_end: bool,
}

/// Single-threaded loop that turns routed streams into trials
///
/// Each iteration flushes the plotters, polls the router holding the start
/// buffer once and, when that produced data, completes any newly delimited
/// trials. Completing a trial first asks every other router to catch up to the
/// trial's end, then extracts and enhances it, writes it to the sink, shows it
/// on the plotters and discards buffered data before the trial's start.
///
/// The loop ends when the start router stops (end of data or failure) or when
/// every plotter has been closed. A final pass reads once more from every
/// router and emits the open-ended last trial.
///
/// # Examples
///
/// ```rust
/// use neurotrials::doctest_utils::create_simple_plx_file;
/// use neurotrials::{PlxReader, ReaderRoute, ReaderRouter, Trial};
/// use neurotrials::{TrialDelimiter, TrialExtractor, TrialPipeline};
///
/// let dir = tempfile::tempdir()?;
/// let path = dir.path().join("session.plx");
/// create_simple_plx_file(&path)?;
///
/// let routes = vec![
///     ReaderRoute::new("strobed", "delimiter"),
///     ReaderRoute::new("sig001", "spikes"),
/// ];
/// let router = ReaderRouter::new("plexon", Box::new(PlxReader::new(&path)), routes, 3)?;
///
/// let delimiter = TrialDelimiter::new("delimiter", 1.0, 0, 0.0);
/// let extractor = TrialExtractor::new("delimiter", 1.0, 0, vec!["spikes".to_string()]);
/// let mut pipeline = TrialPipeline::new(vec![router], delimiter, extractor)?;
///
/// let mut trials: Vec<Trial> = Vec::new();
/// let summary = pipeline.run(&mut trials, &mut [])?;
///
/// assert!(summary.reached_end);
/// assert_eq!(summary.trial_count, 4);
/// // 第二个试次 [1, 2) 以 1 秒处的起始码为零点
/// assert_eq!(trials[1].wrt_time, 1.0);
/// assert_eq!(trials[1].get_buffer_data("spikes").unwrap().len(), 1);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct TrialPipeline {
    routers: Vec<ReaderRouter>,
    start_router: usize,
    delimiter: TrialDelimiter,
    extractor: TrialExtractor,
    experiment_info: InfoMap,
    subject_info: InfoMap,
    idle_sleep: Option<Duration>,
}

impl TrialPipeline {
    /// # Errors
    ///
    /// * `TrialsError::Config` - two routers fill a buffer with the same name, or
    ///   no router fills the delimiter's start buffer
    pub fn new(
        routers: Vec<ReaderRouter>,
        delimiter: TrialDelimiter,
        extractor: TrialExtractor,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for router in &routers {
            for name in router.buffers().keys() {
                if !seen.insert(name.as_str()) {
                    return Err(TrialsError::Config(format!(
                        "buffer {} is filled by more than one reader",
                        name
                    )));
                }
            }
        }

        let start_router = routers
            .iter()
            .position(|r| r.buffer(delimiter.start_buffer_name()).is_some())
            .ok_or_else(|| {
                TrialsError::Config(format!(
                    "no reader fills the start buffer {}",
                    delimiter.start_buffer_name()
                ))
            })?;

        Ok(TrialPipeline {
            routers,
            start_router,
            delimiter,
            extractor,
            experiment_info: InfoMap::new(),
            subject_info: InfoMap::new(),
            idle_sleep: None,
        })
    }

    pub fn with_info(mut self, experiment_info: InfoMap, subject_info: InfoMap) -> Self {
        self.experiment_info = experiment_info;
        self.subject_info = subject_info;
        self
    }

    /// Sleep this long after an iteration in which the start reader had no data.
    pub fn idle_sleep(mut self, idle_sleep: Option<Duration>) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    pub fn routers(&self) -> &[ReaderRouter] {
        &self.routers
    }

    pub fn delimiter(&self) -> &TrialDelimiter {
        &self.delimiter
    }

    /// Runs until the start stream ends or every plotter is closed.
    ///
    /// Readers are opened on entry and closed on exit, also when the run
    /// fails. The sink is left open for the caller.
    ///
    /// # Errors
    ///
    /// Errors from opening a reader, from an enhancer, or from the sink.
    pub fn run(
        &mut self,
        sink: &mut dyn TrialSink,
        plotters: &mut [Box<dyn Plotter>],
    ) -> Result<RunSummary> {
        let result = self.open_and_run(sink, plotters);

        for plotter in plotters.iter_mut() {
            plotter.clean_up();
        }
        self.close_all();

        if let Ok(summary) = &result {
            log::info!(
                "Run finished with {} trials (start stream ended: {})",
                summary.trial_count,
                summary.reached_end
            );
        }
        result
    }

    fn open_and_run(
        &mut self,
        sink: &mut dyn TrialSink,
        plotters: &mut [Box<dyn Plotter>],
    ) -> Result<RunSummary> {
        self.open_all()?;
        self.set_up_plotters(plotters)?;
        self.run_loop(sink, plotters)
    }

    fn open_all(&mut self) -> Result<()> {
        for router in &mut self.routers {
            router.open()?;
        }
        Ok(())
    }

    fn close_all(&mut self) {
        for router in &mut self.routers {
            router.close();
        }
    }

    fn set_up_plotters(&self, plotters: &mut [Box<dyn Plotter>]) -> Result<()> {
        for plotter in plotters.iter_mut() {
            plotter.set_up(&self.experiment_info, &self.subject_info)?;
        }
        Ok(())
    }

    fn run_loop(
        &mut self,
        sink: &mut dyn TrialSink,
        plotters: &mut [Box<dyn Plotter>],
    ) -> Result<RunSummary> {
        let reached_end = loop {
            if !plotters.is_empty() {
                self.update_plotters(plotters, None);
                if !plotters.iter().any(|p| p.is_open()) {
                    log::info!("All plotters closed, stopping");
                    break false;
                }
            }

            let got_data = self.routers[self.start_router].route_next();
            if got_data {
                for (number, trial) in self.delimit_next() {
                    self.complete_trial(number, trial, sink, plotters)?;
                }
            }

            if !self.routers[self.start_router].still_going() {
                break true;
            }

            if !got_data {
                if let Some(idle) = self.idle_sleep {
                    thread::sleep(idle);
                }
            }
        };

        // 收尾：每个读取器再读一次，然后输出最后一个试次
        for router in &mut self.routers {
            router.route_next();
        }
        for (number, trial) in self.delimit_next() {
            self.complete_trial(number, trial, sink, plotters)?;
        }
        let (number, last) = self.delimiter.last();
        self.complete_trial(number, last, sink, plotters)?;

        Ok(RunSummary {
            trial_count: self.delimiter.trial_count(),
            reached_end,
        })
    }

    fn delimit_next(&mut self) -> Vec<(usize, Trial)> {
        match self.routers[self.start_router].buffer(self.delimiter.start_buffer_name()) {
            Some(start_buffer) => self.delimiter.next(start_buffer),
            None => Vec::new(),
        }
    }

    fn complete_trial(
        &mut self,
        number: usize,
        mut trial: Trial,
        sink: &mut dyn TrialSink,
        plotters: &mut [Box<dyn Plotter>],
    ) -> Result<()> {
        if let Some(end_time) = trial.end_time {
            for (index, router) in self.routers.iter_mut().enumerate() {
                if index == self.start_router {
                    continue;
                }
                let reached = router.route_until(end_time);
                if reached < end_time {
                    log::warn!(
                        "Reader {} only reached {} of trial {} ending at {}",
                        router.name(),
                        reached,
                        number,
                        end_time
                    );
                }
            }
        }

        let buffers: HashMap<&str, &Buffer> = self
            .routers
            .iter()
            .flat_map(|r| r.buffers().iter())
            .map(|(name, buffer)| (name.as_str(), buffer))
            .collect();
        self.extractor.populate_trial(
            &mut trial,
            number,
            &buffers,
            &self.experiment_info,
            &self.subject_info,
        )?;

        sink.append(&trial)?;
        log::debug!(
            "Wrote trial {} [{}, {:?}) wrt {}",
            number,
            trial.start_time,
            trial.end_time,
            trial.wrt_time
        );

        self.update_plotters(plotters, Some((number, &trial)));
        self.discard_before(trial.start_time);
        Ok(())
    }

    fn update_plotters(&self, plotters: &mut [Box<dyn Plotter>], trial: Option<(usize, &Trial)>) {
        let trial_count = trial.map_or(self.delimiter.trial_count(), |(number, _)| number);
        for plotter in plotters.iter_mut() {
            let result = plotter.update(
                trial.map(|(_, t)| t),
                trial_count,
                &self.experiment_info,
                &self.subject_info,
            );
            if let Err(e) = result {
                log::error!("Plotter update failed: {}", e);
            }
        }
    }

    fn discard_before(&mut self, time: f64) {
        let mut buffers: HashMap<&str, &mut Buffer> = self
            .routers
            .iter_mut()
            .flat_map(|r| r.buffers_mut().iter_mut())
            .map(|(name, buffer)| (name.as_str(), buffer))
            .collect();
        if let Some(start_buffer) = buffers.get_mut(self.delimiter.start_buffer_name()) {
            self.delimiter.discard_before(start_buffer, time);
        }
        self.extractor.discard_before(&mut buffers, time);
    }
}
