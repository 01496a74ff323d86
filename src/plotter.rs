use crate::error::Result;
use crate::trial::{InfoMap, Trial};

/// A display surface driven by the pipeline loop
///
/// The loop calls [`update`](Plotter::update) with `None` once per iteration
/// so the surface can process its own events, and with `Some(trial)` after
/// each trial is written. A plotter whose [`is_open`](Plotter::is_open)
/// returns false is considered closed by its user; once every plotter is
/// closed the run stops.
pub trait Plotter {
    fn set_up(&mut self, _experiment_info: &InfoMap, _subject_info: &InfoMap) -> Result<()> {
        Ok(())
    }

    fn update(
        &mut self,
        trial: Option<&Trial>,
        trial_count: usize,
        experiment_info: &InfoMap,
        subject_info: &InfoMap,
    ) -> Result<()>;

    fn clean_up(&mut self) {}

    fn is_open(&self) -> bool {
        true
    }
}

/// Logs a one-line summary of each trial at info level.
#[derive(Debug, Default)]
pub struct LogPlotter {
    open: bool,
}

impl Plotter for LogPlotter {
    fn set_up(&mut self, experiment_info: &InfoMap, subject_info: &InfoMap) -> Result<()> {
        log::info!(
            "Plotting trials ({} experiment fields, {} subject fields)",
            experiment_info.len(),
            subject_info.len()
        );
        self.open = true;
        Ok(())
    }

    fn update(
        &mut self,
        trial: Option<&Trial>,
        trial_count: usize,
        _experiment_info: &InfoMap,
        _subject_info: &InfoMap,
    ) -> Result<()> {
        if let Some(trial) = trial {
            log::info!(
                "Trial {}: [{}, {:?}) wrt {} with {} buffers and {} enhancements",
                trial_count,
                trial.start_time,
                trial.end_time,
                trial.wrt_time,
                trial.data.len(),
                trial.enhancements.len()
            );
        }
        Ok(())
    }

    fn clean_up(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
