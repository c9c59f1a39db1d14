//! # Diagnostic sinks
//!
//! A fitting run can write two plain-text files:
//!
//! - a parameter log, opened in append mode, recording a timestamped header, the number
//!   of components and `w`, the initial parameters, each split-and-merge trial and the
//!   final parameters;
//! - a convergence trace, truncated on open, holding the average log-likelihood of every
//!   iteration on the accepted path, one value per line.
//!
//! Both files are owned by a [`DiagnosticLog`] that lives for one run and flushes on drop.
//! Write failures after a successful open never abort the fit: the affected sink is
//! reported with `log::warn!` and switched off.

use crate::error::XdError;
use crate::types::Mixture;
use std::fmt::Write as FmtWrite;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const RULE: &str = "#----------------------------------";

struct LogSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogSink {
    fn open(path: &Path, append: bool) -> Result<Self, XdError> {
        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(path).map_err(|source| XdError::LogTarget {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }
}

/// Scoped owner of the parameter log and the convergence trace of one run.
#[derive(Default)]
pub struct DiagnosticLog {
    params: Option<LogSink>,
    trace: Option<LogSink>,
}

impl DiagnosticLog {
    /// A log that writes nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Opens the requested targets. `None` or an empty path leaves that sink off.
    pub fn open(log_file: Option<&Path>, trace_file: Option<&Path>) -> Result<Self, XdError> {
        fn wanted(path: Option<&Path>) -> Option<&Path> {
            path.filter(|p| !p.as_os_str().is_empty())
        }
        let params = wanted(log_file)
            .map(|path| LogSink::open(path, true))
            .transpose()?;
        let trace = wanted(trace_file)
            .map(|path| LogSink::open(path, false))
            .transpose()?;
        Ok(Self { params, trace })
    }

    /// Derives the parameter-log and trace paths from a common basename:
    /// `<base>_c.log` and `<base>_loglike.log`.
    pub fn paths_for_basename(base: &str) -> (PathBuf, PathBuf) {
        (
            PathBuf::from(format!("{base}_c.log")),
            PathBuf::from(format!("{base}_loglike.log")),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.params.is_some() || self.trace.is_some()
    }

    /// Timestamp banner plus the run's size and regularization.
    pub fn write_header(&mut self, components: usize, regularization: f64) {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let text = format!(
            "{RULE}\n#\n#Run started at UNIX time {seconds}\n{RULE}\n#\n#Using {components} Gaussians and w = {regularization:.6}\n\n"
        );
        Self::emit(&mut self.params, &text);
    }

    /// Amplitude, mean, covariance diagonal and then the upper off-diagonal entries of
    /// every component.
    pub fn write_parameters(&mut self, title: &str, mixture: &Mixture) {
        if self.params.is_none() {
            return;
        }
        let mut text = format!("#\n#{title}:\n\n");
        for (idx, component) in mixture.components.iter().enumerate() {
            let d = component.mean.len();
            let mean = component
                .mean
                .iter()
                .map(|v| format!("{v:.6}"))
                .collect::<Vec<_>>()
                .join("\t");
            let _ = write!(text, "#Gaussian {idx}\n#amp\t=\t{:.6}\n#mean\t=\t{mean}\n#covar\t=\t", component.amp);
            for dd in 0..d {
                let _ = write!(text, "{:.6}\t", component.covar[(dd, dd)]);
            }
            for row in 0..d {
                for col in (row + 1)..d {
                    let _ = write!(text, "{:.6}\t", component.covar[(row, col)]);
                }
            }
            text.push_str("\n#\n");
        }
        Self::emit(&mut self.params, &text);
    }

    /// Appends iterations of an accepted path to the convergence trace.
    pub fn write_trace(&mut self, values: &[f64]) {
        if self.trace.is_none() {
            return;
        }
        let mut text = String::with_capacity(values.len() * 24);
        for value in values {
            let _ = writeln!(text, "{value}");
        }
        Self::emit(&mut self.trace, &text);
    }

    /// A single comment line in the parameter log.
    pub fn note(&mut self, line: &str) {
        Self::emit(&mut self.params, &format!("#{line}\n"));
    }

    fn emit(sink: &mut Option<LogSink>, text: &str) {
        let Some(active) = sink.as_mut() else {
            return;
        };
        if let Err(err) = active.writer.write_all(text.as_bytes()) {
            log::warn!(
                "Writing to {} failed ({err}); further diagnostics to it are dropped.",
                active.path.display()
            );
            *sink = None;
        }
    }
}

impl Drop for DiagnosticLog {
    fn drop(&mut self) {
        for sink in [self.params.as_mut(), self.trace.as_mut()].into_iter().flatten() {
            if let Err(err) = sink.writer.flush() {
                log::warn!("Could not flush {}: {err}", sink.path.display());
            }
        }
    }
}
