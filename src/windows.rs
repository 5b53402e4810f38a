use crate::data::FEATURE_DIM;
use crate::error::{ForecastError, Result};
use crate::normalizer::FeatureTable;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

/// One supervised example: `input_len` feature rows followed by the next `target_len` rows.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowPair {
    pub start: DateTime<Utc>,
    /// Row-major `[input_len, FEATURE_DIM]`.
    pub input: Vec<f32>,
    /// Row-major `[target_len, FEATURE_DIM]`.
    pub target: Vec<f32>,
}

#[derive(Clone, Debug)]
pub struct WindowDataset {
    pub pairs: Vec<WindowPair>,
    pub input_len: usize,
    pub target_len: usize,
}

impl WindowDataset {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Chronological split: the first `floor(len * ratio)` pairs train, the rest validate.
    pub fn split(self, train_ratio: f64) -> (WindowDataset, WindowDataset) {
        let n = self.pairs.len();
        let split_idx = ((n as f64 * train_ratio) as usize).min(n);
        let mut train_pairs = self.pairs;
        let val_pairs = train_pairs.split_off(split_idx);

        (
            WindowDataset {
                pairs: train_pairs,
                input_len: self.input_len,
                target_len: self.target_len,
            },
            WindowDataset {
                pairs: val_pairs,
                input_len: self.input_len,
                target_len: self.target_len,
            },
        )
    }
}

fn row_is_finite(row: &[f32; FEATURE_DIM]) -> bool {
    row.iter().all(|v| v.is_finite())
}

/// Prefix counts of non-finite rows and of broken hourly steps.
struct Defects {
    bad_rows: Vec<usize>,
    gaps: Vec<usize>,
}

impl Defects {
    fn scan(table: &FeatureTable) -> Self {
        let n = table.len();
        let mut bad_rows = vec![0usize; n + 1];
        let mut gaps = vec![0usize; n + 1];
        for i in 0..n {
            bad_rows[i + 1] = bad_rows[i] + usize::from(!row_is_finite(&table.rows[i]));
            let broken = i > 0 && table.timestamps[i] - table.timestamps[i - 1] != Duration::hours(1);
            gaps[i + 1] = gaps[i] + usize::from(broken);
        }
        Self { bad_rows, gaps }
    }

    /// True when rows `[start, start + len)` are finite and consecutive hours.
    fn is_clean(&self, start: usize, len: usize) -> bool {
        let end = start + len;
        self.bad_rows[end] == self.bad_rows[start] && self.gaps[end] == self.gaps[start + 1]
    }
}

/// Slides over every start index and keeps the windows whose whole span is clean.
pub fn build_windows(table: &FeatureTable, input_len: usize, target_len: usize) -> Result<WindowDataset> {
    let span = input_len + target_len;
    if input_len == 0 || target_len == 0 {
        return Err(ForecastError::config("window lengths must be >= 1"));
    }
    if table.len() < span {
        return Err(ForecastError::data(format!(
            "need at least {} rows to build a window, got {}",
            span,
            table.len()
        )));
    }

    let defects = Defects::scan(table);
    let candidates = table.len() - span + 1;
    let mut pairs = Vec::with_capacity(candidates);
    for start in 0..candidates {
        if !defects.is_clean(start, span) {
            continue;
        }
        let input = table.rows[start..start + input_len].iter().flatten().copied().collect();
        let target = table.rows[start + input_len..start + span].iter().flatten().copied().collect();
        pairs.push(WindowPair {
            start: table.timestamps[start],
            input,
            target,
        });
    }

    let skipped = candidates - pairs.len();
    if skipped > 0 {
        warn!("Dropped {} of {} windows containing missing values or time gaps", skipped, candidates);
    }
    if pairs.is_empty() {
        return Err(ForecastError::data("no valid windows: every candidate window contains missing values"));
    }
    info!("Built {} windows (input {}h, target {}h)", pairs.len(), input_len, target_len);

    Ok(WindowDataset {
        pairs,
        input_len,
        target_len,
    })
}

/// The most recent `input_len` rows, flattened, as the forecast conditioning window.
pub fn last_window(table: &FeatureTable, input_len: usize) -> Result<Vec<f32>> {
    if input_len == 0 || table.len() < input_len {
        return Err(ForecastError::data(format!(
            "need {} rows of history to forecast, got {}",
            input_len,
            table.len()
        )));
    }
    let start = table.len() - input_len;
    if !Defects::scan(table).is_clean(start, input_len) {
        return Err(ForecastError::data(
            "latest history window contains missing values or time gaps",
        ));
    }
    Ok(table.rows[start..].iter().flatten().copied().collect())
}
