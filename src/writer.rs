use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, TrialsError};
use crate::trial::Trial;

/// Destination for finished trials, one at a time
pub trait TrialSink {
    fn append(&mut self, trial: &Trial) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps trials in memory.
impl TrialSink for Vec<Trial> {
    fn append(&mut self, trial: &Trial) -> Result<()> {
        self.push(trial.clone());
        Ok(())
    }
}

/// Writes trials as JSON lines
///
/// Every [`append`](TrialSink::append) writes one complete line and flushes,
/// so the file can be read with [`read_trials`] at any point during a run.
///
/// # Examples
///
/// ```rust
/// use neurotrials::{read_trials, JsonLinesTrialSink, Trial, TrialSink};
///
/// let dir = tempfile::tempdir()?;
/// let path = dir.path().join("trials.jsonl");
///
/// let mut sink = JsonLinesTrialSink::open(&path)?;
/// sink.append(&Trial::new(0.0, Some(1.0)))?;
///
/// // 写入过程中也能读取
/// assert_eq!(read_trials(&path)?.len(), 1);
///
/// sink.append(&Trial::new(1.0, None))?;
/// sink.close()?;
/// assert_eq!(read_trials(&path)?[1].end_time, None);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct JsonLinesTrialSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    trials_written: usize,
}

impl JsonLinesTrialSink {
    /// Creates or truncates the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        log::info!("Writing trials to {}", path.display());
        Ok(JsonLinesTrialSink {
            path,
            writer: Some(BufWriter::new(file)),
            trials_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn trials_written(&self) -> usize {
        self.trials_written
    }
}

impl TrialSink for JsonLinesTrialSink {
    fn append(&mut self, trial: &Trial) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            TrialsError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{} is already closed", self.path.display()),
            ))
        })?;
        serde_json::to_writer(&mut *writer, trial)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        self.trials_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            log::info!(
                "Closed {} after {} trials",
                self.path.display(),
                self.trials_written
            );
        }
        Ok(())
    }
}

impl Drop for JsonLinesTrialSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Reads back every complete trial line written by [`JsonLinesTrialSink`].
pub fn read_trials<P: AsRef<Path>>(path: P) -> Result<Vec<Trial>> {
    let file = File::open(path.as_ref())
        .map_err(|e| TrialsError::FileNotFound(format!("{}: {}", path.as_ref().display(), e)))?;
    let mut trials = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        trials.push(serde_json::from_str(&line)?);
    }
    Ok(trials)
}
