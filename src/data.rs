use crate::error::{ForecastError, Result};
use chrono::{DateTime, Duration, Timelike, Utc};
use rand::prelude::*;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

/// Number of continuous (min/max scaled) channels.
pub const NUM_CONTINUOUS: usize = 8;
/// Width of a normalized feature vector: continuous channels plus the class index.
pub const FEATURE_DIM: usize = 9;

/// Feature channels in the fixed order used by feature vectors and model output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Aqi,
    Pm25,
    Pm10,
    So2,
    No2,
    Co,
    O3,
    Hap,
    Quality,
}

impl Channel {
    pub const ALL: [Channel; FEATURE_DIM] = [
        Channel::Aqi,
        Channel::Pm25,
        Channel::Pm10,
        Channel::So2,
        Channel::No2,
        Channel::Co,
        Channel::O3,
        Channel::Hap,
        Channel::Quality,
    ];

    pub const CONTINUOUS: [Channel; NUM_CONTINUOUS] = [
        Channel::Aqi,
        Channel::Pm25,
        Channel::Pm10,
        Channel::So2,
        Channel::No2,
        Channel::Co,
        Channel::O3,
        Channel::Hap,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Column name in the observation export.
    pub fn column(self) -> &'static str {
        match self {
            Channel::Aqi => "AQI",
            Channel::Pm25 => "PM2_5",
            Channel::Pm10 => "PM10",
            Channel::So2 => "SO2",
            Channel::No2 => "NO2",
            Channel::Co => "CO",
            Channel::O3 => "O3",
            Channel::Hap => "hap",
            Channel::Quality => "Quality",
        }
    }

    pub fn is_continuous(self) -> bool {
        self != Channel::Quality
    }
}

/// The six ordered severity levels of the national air-quality class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AirQuality {
    Excellent,
    Good,
    LightlyPolluted,
    ModeratelyPolluted,
    HeavilyPolluted,
    SeverelyPolluted,
}

impl AirQuality {
    pub const ALL: [AirQuality; 6] = [
        AirQuality::Excellent,
        AirQuality::Good,
        AirQuality::LightlyPolluted,
        AirQuality::ModeratelyPolluted,
        AirQuality::HeavilyPolluted,
        AirQuality::SeverelyPolluted,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AirQuality::Excellent => "优",
            AirQuality::Good => "良",
            AirQuality::LightlyPolluted => "轻度污染",
            AirQuality::ModeratelyPolluted => "中度污染",
            AirQuality::HeavilyPolluted => "重度污染",
            AirQuality::SeverelyPolluted => "严重污染",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_label(label: &str) -> Result<Self> {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|q| q.label() == label)
            .ok_or_else(|| ForecastError::data(format!("unrecognized Quality label '{}'", label)))
    }

    pub fn from_index(index: i64) -> Result<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or_else(|| {
                ForecastError::data(format!(
                    "Quality index {} outside the known range 0..={}",
                    index,
                    Self::ALL.len() - 1
                ))
            })
    }

    /// Class implied by an AQI value under the standard bands.
    pub fn from_aqi(aqi: f64) -> Self {
        match aqi {
            a if a <= 50.0 => AirQuality::Excellent,
            a if a <= 100.0 => AirQuality::Good,
            a if a <= 150.0 => AirQuality::LightlyPolluted,
            a if a <= 200.0 => AirQuality::ModeratelyPolluted,
            a if a <= 300.0 => AirQuality::HeavilyPolluted,
            _ => AirQuality::SeverelyPolluted,
        }
    }
}

impl Serialize for AirQuality {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// One hourly record from the acquisition feed.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    /// Continuous readings in [`Channel::CONTINUOUS`] order; `None` when missing.
    pub values: [Option<f64>; NUM_CONTINUOUS],
    pub quality: Option<String>,
}

impl Observation {
    pub fn value(&self, channel: Channel) -> Option<f64> {
        if channel.is_continuous() {
            self.values[channel.index()]
        } else {
            None
        }
    }
}

#[derive(Deserialize, Debug)]
struct RawObservation {
    time_point: i64,
    #[serde(rename = "AQI", default)]
    aqi: Option<Value>,
    #[serde(rename = "PM2_5", default)]
    pm2_5: Option<Value>,
    #[serde(rename = "PM10", default)]
    pm10: Option<Value>,
    #[serde(rename = "SO2", default)]
    so2: Option<Value>,
    #[serde(rename = "NO2", default)]
    no2: Option<Value>,
    #[serde(rename = "CO", default)]
    co: Option<Value>,
    #[serde(rename = "O3", default)]
    o3: Option<Value>,
    #[serde(default)]
    hap: Option<Value>,
    #[serde(rename = "Quality", default)]
    quality: Option<Value>,
}

/// Numbers and numeric strings become readings; anything else is missing.
fn coerce_numeric(value: Option<&Value>) -> Option<f64> {
    let v = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    v.is_finite().then_some(v)
}

impl RawObservation {
    fn into_observation(self) -> Result<Observation> {
        let timestamp = DateTime::from_timestamp(self.time_point, 0).ok_or_else(|| {
            ForecastError::data(format!("time_point {} is out of range", self.time_point))
        })?;
        if timestamp.minute() != 0 || timestamp.second() != 0 {
            return Err(ForecastError::data(format!(
                "time_point {} is not aligned to the hour",
                timestamp
            )));
        }

        let quality = match self.quality {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        };

        Ok(Observation {
            timestamp,
            values: [
                coerce_numeric(self.aqi.as_ref()),
                coerce_numeric(self.pm2_5.as_ref()),
                coerce_numeric(self.pm10.as_ref()),
                coerce_numeric(self.so2.as_ref()),
                coerce_numeric(self.no2.as_ref()),
                coerce_numeric(self.co.as_ref()),
                coerce_numeric(self.o3.as_ref()),
                coerce_numeric(self.hap.as_ref()),
            ],
            quality,
        })
    }
}

/// Parses a JSON array export of the observation collection.
pub fn parse_observations(json: &str) -> Result<Vec<Observation>> {
    let raw: Vec<RawObservation> = serde_json::from_str(json)?;
    let observations = raw
        .into_iter()
        .map(RawObservation::into_observation)
        .collect::<Result<Vec<_>>>()?;
    ensure_time_ordered(&observations)?;
    Ok(observations)
}

pub fn load_observations(path: &Path) -> Result<Vec<Observation>> {
    let json = std::fs::read_to_string(path)?;
    let observations = parse_observations(&json)?;
    info!("Loaded {} observations from {}", observations.len(), path.display());
    if let (Some(first), Some(last)) = (observations.first(), observations.last()) {
        info!("Observation span: {} .. {}", first.timestamp, last.timestamp);
    }
    Ok(observations)
}

/// Rejects feeds that are not strictly increasing in time.
pub fn ensure_time_ordered(observations: &[Observation]) -> Result<()> {
    for (i, pair) in observations.windows(2).enumerate() {
        if pair[1].timestamp <= pair[0].timestamp {
            return Err(ForecastError::data(format!(
                "observations must be deduplicated and time-ordered: record {} ({}) does not follow {}",
                i + 1,
                pair[1].timestamp,
                pair[0].timestamp
            )));
        }
    }
    let gaps = observations
        .windows(2)
        .filter(|p| p[1].timestamp - p[0].timestamp != Duration::hours(1))
        .count();
    if gaps > 0 {
        warn!("Observation feed has {} gaps in the hourly timeline", gaps);
    }
    Ok(())
}

/// Deterministic hourly observations with daily cycles, for demos and tests.
pub fn synthetic_observations(hours: usize, start: DateTime<Utc>, seed: u64) -> Vec<Observation> {
    let mut rng = StdRng::seed_from_u64(seed);
    let start = start
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(start);

    let mut history = Vec::with_capacity(hours);
    let mut drift: f64 = 0.0;
    for h in 0..hours {
        let phase = (h % 24) as f64 / 24.0 * std::f64::consts::TAU;
        drift = (drift + 0.2 * rng.sample::<f64, _>(StandardNormal)).clamp(-20.0, 20.0);

        let pm25 = (35.0 + 15.0 * phase.sin() + drift + 3.0 * rng.sample::<f64, _>(StandardNormal)).max(1.0);
        let pm10 = (pm25 * 1.6 + 5.0 * rng.sample::<f64, _>(StandardNormal)).max(1.0);
        let so2 = (8.0 + 2.0 * phase.cos() + rng.sample::<f64, _>(StandardNormal)).max(0.5);
        let no2 = (25.0 + 10.0 * (phase + 1.0).sin() + 2.0 * rng.sample::<f64, _>(StandardNormal)).max(1.0);
        let co = (0.8 + 0.2 * phase.sin() + 0.05 * rng.sample::<f64, _>(StandardNormal)).max(0.1);
        let o3 = (60.0 - 30.0 * phase.cos() + 4.0 * rng.sample::<f64, _>(StandardNormal)).max(1.0);
        let hap = (1010.0 + 4.0 * (phase / 2.0).sin() + rng.sample::<f64, _>(StandardNormal)).round();
        let aqi = (pm25 * 1.4 + 0.2 * o3).round();

        history.push(Observation {
            timestamp: start + Duration::hours(h as i64),
            values: [
                Some(aqi),
                Some(pm25),
                Some(pm10),
                Some(so2),
                Some(no2),
                Some(co),
                Some(o3),
                Some(hap),
            ],
            quality: Some(AirQuality::from_aqi(aqi).label().to_string()),
        });
    }

    history
}
