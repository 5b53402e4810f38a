use crate::data::{AirQuality, Channel, FEATURE_DIM, Observation};
use crate::error::{ForecastError, Result};
use crate::models::cnn_gru::ModelParameters;
use crate::normalizer::{Normalizer, decode_quality};
use crate::windows::last_window;
use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use candle_core::Tensor;
use serde::{Serialize, Serializer};
use tracing::{debug, info};

/// One denormalized forecast hour.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForecastRecord {
    #[serde(serialize_with = "serialize_local_time")]
    pub time: DateTime<Tz>,
    #[serde(rename = "AQI")]
    pub aqi: f64,
    #[serde(rename = "PM2_5")]
    pub pm2_5: f64,
    #[serde(rename = "PM10")]
    pub pm10: f64,
    #[serde(rename = "SO2")]
    pub so2: f64,
    #[serde(rename = "NO2")]
    pub no2: f64,
    #[serde(rename = "CO")]
    pub co: f64,
    #[serde(rename = "O3")]
    pub o3: f64,
    pub hap: i64,
    #[serde(rename = "Quality")]
    pub quality: AirQuality,
    pub measure: &'static str,
    pub unhealthful: &'static str,
}

fn serialize_local_time<S: Serializer>(time: &DateTime<Tz>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(&time.format("%Y-%m-%d %H:%M:%S"))
}

/// Activity recommendation for a denormalized AQI value.
pub fn activity_advice(aqi: f64) -> &'static str {
    match aqi {
        a if a <= 50.0 => "各类人群可正常活动",
        a if a <= 100.0 => "极少数异常敏感人群应减少户外活动",
        a if a <= 150.0 => "儿童、老年人及心脏病、呼吸系统疾病患者应减少长时间、高强度的户外锻炼",
        a if a <= 200.0 => {
            "儿童、老年人及心脏病、呼吸系统疾病患者应避免长时间、高强度的户外锻炼，一般人群适量减少户外运动"
        }
        a if a <= 300.0 => {
            "儿童、老年人及心脏病、呼吸系统疾病患者应停留在室内，停止户外运动，一般人群减少户外运动"
        }
        _ => "儿童、老年人和病人应当留在室内，避免体力消耗，一般人群应避免户外活动",
    }
}

/// Health-impact description for a denormalized AQI value.
pub fn health_impact(aqi: f64) -> &'static str {
    match aqi {
        a if a <= 50.0 => "空气质量令人满意，基本无空气污染",
        a if a <= 100.0 => "空气质量可以接受，但某些污染物可能对极少数异常敏感人群健康有较弱影响",
        a if a <= 150.0 => "易感人群症状有轻度加剧，健康人群出现刺激症状",
        a if a <= 200.0 => "进一步加剧易感人群症状，可能对健康人群心脏、呼吸系统有影响",
        a if a <= 300.0 => "心脏病和肺病患者症状显著加剧，运动耐受力降低，健康人群普遍出现症状",
        _ => "健康人群运动耐受力降低，有明显强烈症状，提前出现某些疾病",
    }
}

/// Runs the model in inference mode on one flattened window; returns `[horizon][FEATURE_DIM]`.
pub fn raw_forecast(params: &ModelParameters, window: &[f32]) -> Result<Vec<Vec<f32>>> {
    if window.is_empty() || window.len() % FEATURE_DIM != 0 {
        return Err(ForecastError::data(format!(
            "window of {} values is not a whole number of {}-feature rows",
            window.len(),
            FEATURE_DIM
        )));
    }
    let steps = window.len() / FEATURE_DIM;
    let x = Tensor::from_slice(window, (1, steps, FEATURE_DIM), params.device())?;
    let out = params.model().forward(&x)?;

    let horizon = params.spec().horizon;
    if out.dims() != [1, horizon, FEATURE_DIM] {
        return Err(ForecastError::shape(format!(
            "model produced {:?}, expected [1, {}, {}]",
            out.dims(),
            horizon,
            FEATURE_DIM
        )));
    }
    let mut batch = out.to_vec3::<f32>()?;
    let rows = batch.pop().unwrap_or_default();
    if rows.iter().flatten().any(|v| !v.is_finite()) {
        return Err(ForecastError::data("model produced NaN/Inf forecast values"));
    }
    Ok(rows)
}

fn truncate_to_hour(origin: DateTime<Tz>) -> Result<DateTime<Tz>> {
    origin
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .ok_or_else(|| ForecastError::data(format!("cannot truncate {} to the hour", origin)))
}

/// Forecasts the hours after `origin` from the latest normalized window.
pub fn predict(
    params: &ModelParameters,
    last_window: &[f32],
    normalizer: &Normalizer,
    origin: DateTime<Tz>,
) -> Result<Vec<ForecastRecord>> {
    let rows = raw_forecast(params, last_window)?;
    let base = truncate_to_hour(origin)?;

    let mut records = Vec::with_capacity(rows.len());
    for (step, row) in rows.iter().enumerate() {
        let value = |channel: Channel| normalizer.inverse_transform(channel, row[channel.index()] as f64);
        let aqi = value(Channel::Aqi)?;
        let quality = decode_quality(row[Channel::Quality.index()] as f64)?;
        records.push(ForecastRecord {
            time: base + Duration::hours(step as i64 + 1),
            aqi,
            pm2_5: value(Channel::Pm25)?,
            pm10: value(Channel::Pm10)?,
            so2: value(Channel::So2)?,
            no2: value(Channel::No2)?,
            co: value(Channel::Co)?,
            o3: value(Channel::O3)?,
            hap: value(Channel::Hap)?.round() as i64,
            quality,
            measure: activity_advice(aqi),
            unhealthful: health_impact(aqi),
        });
    }
    debug!("Forecast produced {} records from {}", records.len(), base);
    Ok(records)
}

/// Conditioning window for the newest hours. Gaps are filled over the whole feed, the same
/// way the training corpus was filled, before the tail is cut.
pub fn latest_window(normalizer: &Normalizer, observations: &[Observation], input_len: usize) -> Result<Vec<f32>> {
    let table = normalizer.transform(observations)?;
    last_window(&table, input_len)
}

/// Normalizes the feed with the trained scaler state and forecasts from the current hour.
pub fn predict_latest(
    params: &ModelParameters,
    normalizer: &Normalizer,
    observations: &[Observation],
    input_len: usize,
    tz: Tz,
) -> Result<Vec<ForecastRecord>> {
    let window = latest_window(normalizer, observations, input_len)?;
    let origin = Utc::now().with_timezone(&tz);
    info!("Forecasting {} hours from {}", params.spec().horizon, origin.format("%Y-%m-%d %H:00:00"));
    predict(params, &window, normalizer, origin)
}
