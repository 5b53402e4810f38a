use crate::data::{AirQuality, Channel, FEATURE_DIM, NUM_CONTINUOUS, Observation};
use crate::error::{ForecastError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Linear map of one feature onto [0, 1] using its observed range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub min: f64,
    pub max: f64,
}

impl MinMaxScaler {
    /// Returns `None` when `values` holds no finite number.
    pub fn fit(values: &[f64]) -> Option<Self> {
        let mut finite = values.iter().copied().filter(|v| v.is_finite()).peekable();
        finite.peek()?;
        let (min, max) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
        Some(Self { min, max })
    }

    /// Constant features keep a unit range so they map to 0 and invert exactly.
    fn range(&self) -> f64 {
        let range = self.max - self.min;
        if range.abs() < f64::EPSILON { 1.0 } else { range }
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.min) / self.range()
    }

    pub fn inverse_transform(&self, scaled: f64) -> f64 {
        scaled * self.range() + self.min
    }
}

/// Chronological table of normalized feature vectors.
///
/// Rows with a missing class carry NaN in the class slot; the windower drops every window
/// that touches such a row.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureTable {
    pub timestamps: Vec<DateTime<Utc>>,
    pub rows: Vec<[f32; FEATURE_DIM]>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Fitted scaler state for the eight continuous channels. It is fitted once on the training
/// corpus and persisted with the model; forecasts are denormalized with that exact state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    scalers: [MinMaxScaler; NUM_CONTINUOUS],
}

impl Normalizer {
    pub fn from_scalers(scalers: [MinMaxScaler; NUM_CONTINUOUS]) -> Self {
        Self { scalers }
    }

    /// Fits one scaler per continuous channel and returns the normalized table.
    pub fn fit_transform(observations: &[Observation]) -> Result<(Self, FeatureTable)> {
        if observations.is_empty() {
            return Err(ForecastError::data("cannot fit normalizer on an empty observation feed"));
        }

        let mut columns: Vec<Vec<f64>> = Vec::with_capacity(NUM_CONTINUOUS);
        let mut scalers = [MinMaxScaler { min: 0.0, max: 1.0 }; NUM_CONTINUOUS];
        for channel in Channel::CONTINUOUS {
            let column = filled_column(observations, channel)?;
            scalers[channel.index()] = MinMaxScaler::fit(&column).ok_or_else(|| {
                ForecastError::data(format!("column {} has no valid values", channel.column()))
            })?;
            debug!(
                "Fitted scaler for {}: min={:.4}, max={:.4}",
                channel.column(),
                scalers[channel.index()].min,
                scalers[channel.index()].max
            );
            columns.push(column);
        }

        let normalizer = Self { scalers };
        let table = normalizer.encode(observations, &columns)?;
        Ok((normalizer, table))
    }

    /// Normalizes observations with the already fitted state; never refits.
    pub fn transform(&self, observations: &[Observation]) -> Result<FeatureTable> {
        let columns = Channel::CONTINUOUS
            .iter()
            .map(|&channel| filled_column(observations, channel))
            .collect::<Result<Vec<_>>>()?;
        self.encode(observations, &columns)
    }

    fn encode(&self, observations: &[Observation], columns: &[Vec<f64>]) -> Result<FeatureTable> {
        let mut rows = Vec::with_capacity(observations.len());
        for (i, obs) in observations.iter().enumerate() {
            let mut row = [0f32; FEATURE_DIM];
            for channel in Channel::CONTINUOUS {
                let idx = channel.index();
                row[idx] = self.scalers[idx].transform(columns[idx][i]) as f32;
            }
            row[Channel::Quality.index()] = encode_quality(obs.quality.as_deref())?;
            rows.push(row);
        }

        Ok(FeatureTable {
            timestamps: observations.iter().map(|o| o.timestamp).collect(),
            rows,
        })
    }

    /// The fitted scaler for a continuous channel; `None` for the class channel.
    pub fn scaler(&self, channel: Channel) -> Option<&MinMaxScaler> {
        channel
            .is_continuous()
            .then(|| &self.scalers[channel.index()])
    }

    pub fn inverse_transform(&self, channel: Channel, scaled: f64) -> Result<f64> {
        self.scaler(channel)
            .map(|s| s.inverse_transform(scaled))
            .ok_or_else(|| {
                ForecastError::data(format!("{} is categorical and has no scaler", channel.column()))
            })
    }
}

/// Missing readings are filled forward, then backward.
fn filled_column(observations: &[Observation], channel: Channel) -> Result<Vec<f64>> {
    let raw: Vec<Option<f64>> = observations.iter().map(|o| o.value(channel)).collect();
    fill_forward_backward(&raw).ok_or_else(|| {
        ForecastError::data(format!(
            "column {} is absent or has no valid values",
            channel.column()
        ))
    })
}

pub fn fill_forward_backward(values: &[Option<f64>]) -> Option<Vec<f64>> {
    let first_valid = values.iter().flatten().copied().find(|v| v.is_finite())?;
    let mut last = first_valid;
    Some(
        values
            .iter()
            .map(|v| match v {
                Some(x) if x.is_finite() => {
                    last = *x;
                    *x
                }
                _ => last,
            })
            .collect(),
    )
}

/// Fixed ordinal encoding; a missing label becomes NaN, an unknown label is an error.
pub fn encode_quality(label: Option<&str>) -> Result<f32> {
    match label {
        Some(label) => Ok(AirQuality::from_label(label)?.index() as f32),
        None => Ok(f32::NAN),
    }
}

/// Rounds a raw class output to the nearest index and maps it through the label table.
pub fn decode_quality(value: f64) -> Result<AirQuality> {
    if !value.is_finite() {
        return Err(ForecastError::data(format!("Quality output {} is not finite", value)));
    }
    AirQuality::from_index(value.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic_observations;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1744783200, 0).unwrap()
    }

    #[test]
    fn test_scaler_round_trip() {
        let values = [12.0, 48.5, 3.25, 97.0, 55.0];
        let scaler = MinMaxScaler::fit(&values).unwrap();
        assert_eq!(scaler.min, 3.25);
        assert_eq!(scaler.max, 97.0);
        for &v in &values {
            let scaled = scaler.transform(v);
            assert!((0.0..=1.0).contains(&scaled));
            assert!((scaler.inverse_transform(scaled) - v).abs() < 1e-9);
        }
    }

    #[test]
    fn test_constant_column_inverts() {
        let scaler = MinMaxScaler::fit(&[1012.0, 1012.0, 1012.0]).unwrap();
        assert_eq!(scaler.transform(1012.0), 0.0);
        assert_eq!(scaler.inverse_transform(0.0), 1012.0);
    }

    #[test]
    fn test_fill_forward_backward() {
        let filled = fill_forward_backward(&[None, Some(2.0), None, Some(f64::NAN), Some(5.0), None]).unwrap();
        assert_eq!(filled, vec![2.0, 2.0, 2.0, 2.0, 5.0, 5.0]);
        assert!(fill_forward_backward(&[None, None]).is_none());
    }

    #[test]
    fn test_fit_transform_round_trip_through_table() {
        let observations = synthetic_observations(120, start(), 3);
        let (normalizer, table) = Normalizer::fit_transform(&observations).unwrap();
        assert_eq!(table.len(), 120);

        for (obs, row) in observations.iter().zip(&table.rows) {
            for channel in Channel::CONTINUOUS {
                let scaled = row[channel.index()];
                assert!((0.0..=1.0).contains(&scaled));
                let restored = normalizer.inverse_transform(channel, scaled as f64).unwrap();
                let original = obs.value(channel).unwrap();
                assert!(
                    (restored - original).abs() <= 1e-4 * original.abs().max(1.0),
                    "{}: {} vs {}",
                    channel.column(),
                    restored,
                    original
                );
            }
            let class = AirQuality::from_label(obs.quality.as_deref().unwrap()).unwrap();
            assert_eq!(row[Channel::Quality.index()], class.index() as f32);
        }
        assert!(normalizer.inverse_transform(Channel::Quality, 0.0).is_err());
    }

    #[test]
    fn test_missing_column_is_data_error() {
        let mut observations = synthetic_observations(10, start(), 3);
        for obs in &mut observations {
            obs.values[Channel::Hap.index()] = None;
        }
        let err = Normalizer::fit_transform(&observations).unwrap_err();
        assert!(matches!(err, ForecastError::Data(ref msg) if msg.contains("hap")));
    }

    #[test]
    fn test_unknown_label_is_data_error_and_missing_label_is_nan() {
        let mut observations = synthetic_observations(10, start(), 3);
        observations[4].quality = None;
        let (_, table) = Normalizer::fit_transform(&observations).unwrap();
        assert!(table.rows[4][Channel::Quality.index()].is_nan());

        observations[5].quality = Some("moderate".to_string());
        assert!(matches!(
            Normalizer::fit_transform(&observations),
            Err(ForecastError::Data(_))
        ));
    }

    #[test]
    fn test_transform_reuses_fitted_state() {
        let observations = synthetic_observations(100, start(), 9);
        let (normalizer, table) = Normalizer::fit_transform(&observations).unwrap();

        let tail = &observations[60..];
        let retransformed = normalizer.transform(tail).unwrap();
        assert_eq!(retransformed.rows, table.rows[60..].to_vec());
    }

    #[test]
    fn test_decode_quality_rounds_and_checks_range() {
        assert_eq!(decode_quality(0.4).unwrap(), AirQuality::Excellent);
        assert_eq!(decode_quality(1.6).unwrap(), AirQuality::LightlyPolluted);
        assert_eq!(decode_quality(5.2).unwrap(), AirQuality::SeverelyPolluted);
        assert!(decode_quality(5.6).is_err());
        assert!(decode_quality(-0.7).is_err());
        assert!(decode_quality(f64::NAN).is_err());
    }
}
