//! Parallel recovery over independent files.
//!
//! Files share no state, so they are processed on the rayon pool. A failing file never stops
//! the batch: every error, and every panic, ends up in that file's [`FileReport`].

use std::{
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
};

use rayon::prelude::*;

use crate::{Error, Result};

/// How processing of one file ended.
#[derive(Debug)]
pub enum Outcome<T> {
    /// Protection found and removed
    Recovered(T),
    /// No supported protection in this file
    NotApplicable(Error),
    /// Protection found, recovery failed
    Failed(Error),
    /// Processing panicked
    Panicked(String),
}

impl<T> Outcome<T> {
    fn classify(result: Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::Recovered(value),
            Err(error) if error.is_not_applicable() => Outcome::NotApplicable(error),
            Err(error) => Outcome::Failed(error),
        }
    }
}

/// Result of processing one input file.
#[derive(Debug)]
pub struct FileReport<T> {
    /// The input file
    pub path: PathBuf,
    /// How it ended
    pub outcome: Outcome<T>,
}

impl<T> FileReport<T> {
    /// Returns `true` if the file was recovered.
    #[must_use]
    pub fn is_recovered(&self) -> bool {
        matches!(self.outcome, Outcome::Recovered(_))
    }
}

/// Counts over a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Files recovered
    pub recovered: usize,
    /// Files without supported protection
    pub not_applicable: usize,
    /// Files that failed or panicked
    pub failed: usize,
}

impl BatchSummary {
    /// Count the outcomes of `reports`.
    #[must_use]
    pub fn of<T>(reports: &[FileReport<T>]) -> Self {
        reports
            .iter()
            .fold(BatchSummary::default(), |mut summary, report| {
                match report.outcome {
                    Outcome::Recovered(_) => summary.recovered += 1,
                    Outcome::NotApplicable(_) => summary.not_applicable += 1,
                    Outcome::Failed(_) | Outcome::Panicked(_) => summary.failed += 1,
                }
                summary
            })
    }
}

/// Run `recover_file` on every input in parallel. Reports come back in input order.
pub fn recover_batch<P, T, F>(inputs: &[P], recover_file: F) -> Vec<FileReport<T>>
where
    P: AsRef<Path> + Sync,
    T: Send,
    F: Fn(&Path) -> Result<T> + Sync,
{
    let reports: Vec<FileReport<T>> = inputs
        .par_iter()
        .map(|input| {
            let path = input.as_ref();
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| recover_file(path))) {
                Ok(result) => Outcome::classify(result),
                Err(payload) => Outcome::Panicked(panic_message(payload.as_ref())),
            };
            log_outcome(path, &outcome);

            FileReport {
                path: path.to_path_buf(),
                outcome,
            }
        })
        .collect();

    let summary = BatchSummary::of(&reports);
    log::info!(
        "Batch done: {} recovered, {} not applicable, {} failed",
        summary.recovered,
        summary.not_applicable,
        summary.failed
    );
    reports
}

fn log_outcome<T>(path: &Path, outcome: &Outcome<T>) {
    match outcome {
        Outcome::Recovered(_) => log::info!("{}: recovered", path.display()),
        Outcome::NotApplicable(error) => {
            log::debug!("{}: not applicable ({})", path.display(), error);
        }
        Outcome::Failed(error) if error.is_fatal_for_file() => {
            log::error!("{}: abandoned: {}", path.display(), error);
        }
        Outcome::Failed(error) => log::warn!("{}: failed: {}", path.display(), error),
        Outcome::Panicked(message) => log::error!("{}: panicked: {}", path.display(), message),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_do_not_stop_the_batch() {
        let inputs = ["ok.exe", "plain.exe", "broken.exe", "oracle.exe", "panic.exe"];
        let reports = recover_batch(&inputs, |path| match path.to_str() {
            Some("ok.exe") => Ok(7),
            Some("plain.exe") => Err(Error::NotFound("resource 'x'".to_string())),
            Some("broken.exe") => Err(Error::Decryption("bad padding".to_string())),
            Some("oracle.exe") => Err(Error::OracleTimeout { stage: "connect" }),
            _ => panic!("unexpected input"),
        });

        assert_eq!(reports.len(), inputs.len());
        assert_eq!(reports[0].path, PathBuf::from("ok.exe"));
        assert!(matches!(reports[0].outcome, Outcome::Recovered(7)));
        assert!(matches!(reports[1].outcome, Outcome::NotApplicable(_)));
        assert!(matches!(reports[2].outcome, Outcome::Failed(Error::Decryption(_))));
        assert!(matches!(
            reports[3].outcome,
            Outcome::Failed(Error::OracleTimeout { .. })
        ));
        match &reports[4].outcome {
            Outcome::Panicked(message) => assert_eq!(message, "unexpected input"),
            other => panic!("expected a panic report, got {other:?}"),
        }

        assert_eq!(
            BatchSummary::of(&reports),
            BatchSummary {
                recovered: 1,
                not_applicable: 1,
                failed: 3,
            }
        );
        assert!(reports[0].is_recovered());
        assert!(!reports[1].is_recovered());
    }

    #[test]
    fn empty_batch() {
        let inputs: [&str; 0] = [];
        let reports = recover_batch(&inputs, |_| Ok(()));
        assert!(reports.is_empty());
        assert_eq!(BatchSummary::of(&reports), BatchSummary::default());
    }
}
