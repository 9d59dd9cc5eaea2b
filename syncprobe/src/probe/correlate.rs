use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use super::iteration::{FILE_NAME_PREFIX, IterationStore, Stamp};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("malformed signal for {identifier:?}: {reason}")]
    MalformedSignal {
        identifier: String,
        reason: &'static str,
    },
    #[error("iteration {0} is not tracked")]
    UnknownIteration(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    Recorded { id: u64, observed_at: OffsetDateTime },
    AlreadyRecorded { id: u64 },
}

/// Extracts the iteration id from names shaped like `  iteration-12.txt`.
pub fn parse_iteration_id(raw: &str) -> Option<u64> {
    let rest = raw
        .trim_start()
        .strip_prefix(FILE_NAME_PREFIX)?
        .strip_prefix('-')?;
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..digits_end].parse().ok()
}

/// Converts a browser `Date.getTime()` value into a timestamp.
pub fn timestamp_from_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

/// Matches inbound signals to iteration records and writes one observation stamp.
#[derive(Debug, Clone)]
pub struct Correlator {
    store: Arc<IterationStore>,
    target: Stamp,
}

impl Correlator {
    pub fn new(store: Arc<IterationStore>, target: Stamp) -> Self {
        Self { store, target }
    }

    pub fn target(&self) -> Stamp {
        self.target
    }

    pub fn correlate(
        &self,
        raw_identifier: &str,
        observed_at: Option<OffsetDateTime>,
    ) -> Result<Correlation, CorrelationError> {
        let malformed = |reason| CorrelationError::MalformedSignal {
            identifier: raw_identifier.to_string(),
            reason,
        };
        let id = parse_iteration_id(raw_identifier)
            .ok_or_else(|| malformed("identifier does not carry an iteration id"))?;
        let observed_at = observed_at.ok_or_else(|| malformed("timestamp is missing"))?;
        if observed_at.unix_timestamp_nanos() <= 0 {
            return Err(malformed("timestamp is not positive"));
        }

        let record = self
            .store
            .find_by_id(id)
            .ok_or(CorrelationError::UnknownIteration(id))?;
        if !self.store.set_stamp(&record, self.target, observed_at) {
            return Ok(Correlation::AlreadyRecorded { id });
        }

        let elapsed = self
            .target
            .baseline()
            .and_then(|baseline| record.stamp(baseline))
            .map(|started| (observed_at - started).as_seconds_f64());
        match elapsed {
            Some(elapsed) => info!(
                id,
                stamp = self.target.as_str(),
                elapsed = %format!("{elapsed:.2}s"),
                "iteration observed"
            ),
            None => info!(id, stamp = self.target.as_str(), "iteration observed"),
        }
        Ok(Correlation::Recorded { id, observed_at })
    }

    /// Correlates and drops failures after logging them. Signals come from
    /// untrusted sources and never abort a run.
    pub fn absorb(&self, raw_identifier: &str, observed_at: Option<OffsetDateTime>) {
        match self.correlate(raw_identifier, observed_at) {
            Ok(_) => {}
            Err(err @ CorrelationError::MalformedSignal { .. }) => {
                warn!(stamp = self.target.as_str(), "dropping signal: {err}");
            }
            Err(err @ CorrelationError::UnknownIteration(_)) => {
                warn!(
                    stamp = self.target.as_str(),
                    identifier = raw_identifier,
                    "dropping signal: {err}"
                );
            }
        }
    }
}
