//! Transactions-to-features transform.

use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const COL_USER_ID: &str = "user_id";
pub const COL_DATE: &str = "transaction_date";
pub const COL_AMOUNT: &str = "transaction_amount";
pub const COL_TYPE: &str = "transaction_type";

const REQUIRED_COLUMNS: [&str; 4] = [COL_USER_ID, COL_DATE, COL_AMOUNT, COL_TYPE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingWindow {
    pub name: &'static str,
    pub seconds: i64,
}

pub const WINDOWS: [RollingWindow; 4] = [
    RollingWindow {
        name: "1h",
        seconds: 3_600,
    },
    RollingWindow {
        name: "6h",
        seconds: 21_600,
    },
    RollingWindow {
        name: "24h",
        seconds: 86_400,
    },
    RollingWindow {
        name: "7d",
        seconds: 604_800,
    },
];

const ZSCORE_WINDOW_SECONDS: i64 = 604_800;

const RATIO_COLUMNS: [(&str, &str, &str); 4] = [
    ("ratio_sum_1h_24h", "tx_sum_1h", "tx_sum_24h"),
    ("ratio_cnt_1h_24h", "tx_cnt_1h", "tx_cnt_24h"),
    ("ratio_sum_24h_7d", "tx_sum_24h", "tx_sum_7d"),
    ("ratio_cnt_24h_7d", "tx_cnt_24h", "tx_cnt_7d"),
];

const PERCENTILE_LEVELS: [(&str, f64); 2] = [("flag_amt_p95", 0.95), ("flag_amt_p99", 0.99)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F32,
    I32,
    I8,
}

impl FeatureDType {
    fn as_tag(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::I32 => "i32",
            Self::I8 => "i8",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("missing required columns: {columns:?}")]
    MissingColumns { columns: Vec<String> },
    #[error("column {column} failed validation: {message}")]
    DataValidation { column: String, message: String },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error("dataframe error: {0}")]
    Frame(#[from] PolarsError),
}

pub fn build_features(frame: &DataFrame) -> Result<DataFrame, FeatureError> {
    ensure_columns(frame, &REQUIRED_COLUMNS)?;

    info!(
        component = "features",
        event = "features.build.start",
        rows = frame.height(),
        columns = frame.width()
    );

    let mut out = coerce_amount(frame)?;
    out = rolling_features(&out)?;
    out = window_ratios(&out)?;
    out = zscore_amount_7d(&out)?;
    out = time_encodings(&out)?;
    out = amount_percentile_flags(&out)?;

    info!(
        component = "features",
        event = "features.build.finish",
        rows = out.height(),
        derived_columns = out.width() - frame.width()
    );

    Ok(out)
}

pub fn rolling_features(frame: &DataFrame) -> Result<DataFrame, FeatureError> {
    ensure_columns(frame, &[COL_USER_ID, COL_DATE, COL_AMOUNT])?;

    let view = UserPartitions::from_frame(frame)?;
    let mut out = frame.clone();
    for window in &WINDOWS {
        let (sums, counts) = trailing_sum_count(&view, window.seconds * 1_000);
        out.with_column(Series::new(&format!("tx_sum_{}", window.name), sums))?;
        out.with_column(Series::new(&format!("tx_cnt_{}", window.name), counts))?;
    }
    Ok(out)
}

pub fn window_ratios(frame: &DataFrame) -> Result<DataFrame, FeatureError> {
    let mut prerequisites: Vec<&str> = Vec::new();
    for (_, numerator, denominator) in RATIO_COLUMNS {
        if !prerequisites.contains(&numerator) {
            prerequisites.push(numerator);
        }
        if !prerequisites.contains(&denominator) {
            prerequisites.push(denominator);
        }
    }
    ensure_columns(frame, &prerequisites)?;

    let mut out = frame.clone();
    for (name, numerator, denominator) in RATIO_COLUMNS {
        let numerators = float_values(out.column(numerator)?)?;
        let denominators = float_values(out.column(denominator)?)?;
        let ratios: Vec<Option<f32>> = numerators
            .iter()
            .zip(&denominators)
            .map(|(numer, denom)| match (numer, denom) {
                (Some(numer), Some(denom)) if *denom != 0.0 => Some((numer / denom) as f32),
                _ => None,
            })
            .collect();
        out.with_column(Series::new(name, ratios))?;
    }
    Ok(out)
}

pub fn zscore_amount_7d(frame: &DataFrame) -> Result<DataFrame, FeatureError> {
    ensure_columns(frame, &[COL_USER_ID, COL_DATE, COL_AMOUNT])?;

    let view = UserPartitions::from_frame(frame)?;
    let zscores = trailing_zscore(&view, ZSCORE_WINDOW_SECONDS * 1_000);
    let mut out = frame.clone();
    out.with_column(Series::new("z_amt_7d", zscores))?;
    Ok(out)
}

pub fn time_encodings(frame: &DataFrame) -> Result<DataFrame, FeatureError> {
    ensure_columns(frame, &[COL_DATE])?;

    let ts_ms = timestamps_ms(frame)?;
    let rows = ts_ms.len();
    let mut hours: Vec<i8> = Vec::with_capacity(rows);
    let mut dows: Vec<i8> = Vec::with_capacity(rows);
    let mut hour_sin: Vec<f32> = Vec::with_capacity(rows);
    let mut hour_cos: Vec<f32> = Vec::with_capacity(rows);
    let mut dow_sin: Vec<f32> = Vec::with_capacity(rows);
    let mut dow_cos: Vec<f32> = Vec::with_capacity(rows);

    for &ts in &ts_ms {
        let instant = Utc.timestamp_millis_opt(ts).single().ok_or_else(|| {
            FeatureError::DataValidation {
                column: COL_DATE.to_string(),
                message: format!("timestamp {ts} is outside the representable range"),
            }
        })?;
        let hour = instant.hour() as i8;
        let dow = instant.weekday().num_days_from_monday() as i8;
        let (h_sin, h_cos) = unit_circle(f64::from(hour), 24.0);
        let (d_sin, d_cos) = unit_circle(f64::from(dow), 7.0);
        hours.push(hour);
        dows.push(dow);
        hour_sin.push(h_sin);
        hour_cos.push(h_cos);
        dow_sin.push(d_sin);
        dow_cos.push(d_cos);
    }

    let mut out = frame.clone();
    out.with_column(Series::new("hour_int", hours))?;
    out.with_column(Series::new("dow_int", dows))?;
    out.with_column(Series::new("hour_sin", hour_sin))?;
    out.with_column(Series::new("hour_cos", hour_cos))?;
    out.with_column(Series::new("dow_sin", dow_sin))?;
    out.with_column(Series::new("dow_cos", dow_cos))?;
    Ok(out)
}

pub fn amount_percentile_flags(frame: &DataFrame) -> Result<DataFrame, FeatureError> {
    ensure_columns(frame, &[COL_AMOUNT, COL_TYPE])?;

    let amounts = amount_values(frame)?;
    let type_series = group_key_series(frame, COL_TYPE)?;
    let types = type_series.str()?;

    let mut groups: HashMap<Option<&str>, Vec<usize>> = HashMap::new();
    for (row, tx_type) in types.into_iter().enumerate() {
        groups.entry(tx_type).or_default().push(row);
    }

    // Thresholds deliberately span the entire input, not a trailing window.
    let rows = amounts.len();
    let mut out = frame.clone();
    for (name, level) in PERCENTILE_LEVELS {
        let mut thresholds: Vec<Option<f64>> = vec![None; rows];
        for members in groups.values() {
            let mut observed: Vec<f64> = members
                .iter()
                .filter_map(|&row| amounts[row])
                .collect();
            if observed.is_empty() {
                continue;
            }
            observed.sort_by(|a, b| a.total_cmp(b));
            let threshold = percentile(&observed, level);
            for &row in members {
                thresholds[row] = Some(threshold);
            }
        }

        let flags: Vec<i8> = amounts
            .iter()
            .zip(&thresholds)
            .map(|(amount, threshold)| match (amount, threshold) {
                (Some(amount), Some(threshold)) if amount > threshold => 1,
                _ => 0,
            })
            .collect();
        out.with_column(Series::new(name, flags))?;
    }
    Ok(out)
}

pub fn derived_schema() -> FeatureSchema {
    let mut columns = Vec::new();
    for window in &WINDOWS {
        columns.push(FeatureColumn {
            name: format!("tx_sum_{}", window.name),
            dtype: FeatureDType::F32,
        });
        columns.push(FeatureColumn {
            name: format!("tx_cnt_{}", window.name),
            dtype: FeatureDType::I32,
        });
    }
    for (name, _, _) in RATIO_COLUMNS {
        columns.push(FeatureColumn {
            name: name.to_string(),
            dtype: FeatureDType::F32,
        });
    }
    columns.push(FeatureColumn {
        name: "z_amt_7d".to_string(),
        dtype: FeatureDType::F32,
    });
    for name in ["hour_int", "dow_int"] {
        columns.push(FeatureColumn {
            name: name.to_string(),
            dtype: FeatureDType::I8,
        });
    }
    for name in ["hour_sin", "hour_cos", "dow_sin", "dow_cos"] {
        columns.push(FeatureColumn {
            name: name.to_string(),
            dtype: FeatureDType::F32,
        });
    }
    for (name, _) in PERCENTILE_LEVELS {
        columns.push(FeatureColumn {
            name: name.to_string(),
            dtype: FeatureDType::I8,
        });
    }

    let fingerprint = schema_fingerprint(&columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = FEATURE_SCHEMA_VERSION,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn ensure_columns(frame: &DataFrame, required: &[&str]) -> Result<(), FeatureError> {
    let present: HashSet<&str> = frame.get_column_names().into_iter().collect();
    let missing: Vec<String> = required
        .iter()
        .filter(|column| !present.contains(**column))
        .map(|column| (*column).to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(FeatureError::MissingColumns { columns: missing })
    }
}

fn coerce_amount(frame: &DataFrame) -> Result<DataFrame, FeatureError> {
    let amount = frame.column(COL_AMOUNT)?;
    if amount.dtype().is_numeric() {
        return Ok(frame.clone());
    }

    // Non-strict cast: values that cannot be read as numbers become null.
    let coerced =
        amount
            .cast(&DataType::Float64)
            .map_err(|err| FeatureError::DataValidation {
                column: COL_AMOUNT.to_string(),
                message: err.to_string(),
            })?;
    let mut out = frame.clone();
    out.with_column(coerced)?;
    Ok(out)
}

struct UserPartitions {
    ts_ms: Vec<i64>,
    amounts: Vec<Option<f64>>,
    partitions: Vec<Vec<usize>>,
}

impl UserPartitions {
    fn from_frame(frame: &DataFrame) -> Result<Self, FeatureError> {
        let ts_ms = timestamps_ms(frame)?;
        let amounts = amount_values(frame)?;

        let user_series = group_key_series(frame, COL_USER_ID)?;
        let users = user_series.str()?;
        let mut slot_by_user: HashMap<Option<&str>, usize> = HashMap::new();
        let mut partitions: Vec<Vec<usize>> = Vec::new();
        for (row, user) in users.into_iter().enumerate() {
            let slot = *slot_by_user.entry(user).or_insert_with(|| {
                partitions.push(Vec::new());
                partitions.len() - 1
            });
            partitions[slot].push(row);
        }
        for partition in &mut partitions {
            // Ties on timestamp keep their original row order.
            partition.sort_by_key(|&row| (ts_ms[row], row));
        }

        Ok(Self {
            ts_ms,
            amounts,
            partitions,
        })
    }

    fn len(&self) -> usize {
        self.ts_ms.len()
    }
}

fn trailing_sum_count(view: &UserPartitions, window_ms: i64) -> (Vec<f32>, Vec<i32>) {
    let mut sums = vec![0.0_f32; view.len()];
    let mut counts = vec![0_i32; view.len()];

    for partition in &view.partitions {
        let mut start = 0_usize;
        let mut end = 0_usize;
        let mut window_sum = 0.0_f64;
        let mut window_count = 0_i64;
        for &row in partition {
            let now = view.ts_ms[row];
            // Window is [now - window, now): the left edge is inside, the row itself is not.
            while end < partition.len() && view.ts_ms[partition[end]] < now {
                if let Some(amount) = view.amounts[partition[end]] {
                    window_sum += amount;
                    window_count += 1;
                }
                end += 1;
            }
            while start < end && view.ts_ms[partition[start]] < now - window_ms {
                if let Some(amount) = view.amounts[partition[start]] {
                    window_sum -= amount;
                    window_count -= 1;
                }
                start += 1;
            }
            sums[row] = window_sum as f32;
            counts[row] = window_count as i32;
        }
    }

    (sums, counts)
}

fn trailing_zscore(view: &UserPartitions, window_ms: i64) -> Vec<Option<f32>> {
    let mut zscores: Vec<Option<f32>> = vec![None; view.len()];

    for partition in &view.partitions {
        let mut start = 0_usize;
        let mut end = 0_usize;
        for &row in partition {
            let now = view.ts_ms[row];
            while end < partition.len() && view.ts_ms[partition[end]] < now {
                end += 1;
            }
            while start < end && view.ts_ms[partition[start]] < now - window_ms {
                start += 1;
            }

            let amount = match view.amounts[row] {
                Some(amount) => amount,
                None => continue,
            };
            let window: Vec<f64> = partition[start..end]
                .iter()
                .filter_map(|&prior| view.amounts[prior])
                .collect();
            if window.is_empty() {
                continue;
            }
            // A constant window must report zero deviation even when the mean rounds.
            if window.iter().all(|value| *value == window[0]) {
                continue;
            }

            let len = window.len() as f64;
            let mean = window.iter().sum::<f64>() / len;
            let variance = window
                .iter()
                .map(|value| {
                    let delta = value - mean;
                    delta * delta
                })
                .sum::<f64>()
                / len;
            let std = variance.sqrt();
            if std == 0.0 {
                continue;
            }
            zscores[row] = Some(((amount - mean) / std) as f32);
        }
    }

    zscores
}

fn timestamps_ms(frame: &DataFrame) -> Result<Vec<i64>, FeatureError> {
    let series = frame.column(COL_DATE)?;
    let values: Vec<Option<i64>> = match series.dtype() {
        DataType::Datetime(unit, _) => {
            let divisor = match unit {
                TimeUnit::Nanoseconds => 1_000_000,
                TimeUnit::Microseconds => 1_000,
                TimeUnit::Milliseconds => 1,
            };
            series
                .cast(&DataType::Int64)?
                .i64()?
                .into_iter()
                .map(|value| value.map(|v| v / divisor))
                .collect()
        }
        DataType::Date => series
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?
            .cast(&DataType::Int64)?
            .i64()?
            .into_iter()
            .collect(),
        DataType::String => {
            let raw = series.str()?;
            raw.into_iter()
                .map(|value| value.and_then(parse_timestamp_ms))
                .collect()
        }
        other => {
            return Err(FeatureError::DataValidation {
                column: COL_DATE.to_string(),
                message: format!("expected a timestamp column, found dtype {other}"),
            })
        }
    };

    let mut out = Vec::with_capacity(values.len());
    for (row, value) in values.into_iter().enumerate() {
        match value {
            Some(ts) => out.push(ts),
            None => {
                return Err(FeatureError::DataValidation {
                    column: COL_DATE.to_string(),
                    message: format!("row {row} holds a null or unparseable timestamp"),
                })
            }
        }
    }
    Ok(out)
}

fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc).timestamp_millis());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().timestamp_millis())
}

fn amount_values(frame: &DataFrame) -> Result<Vec<Option<f64>>, FeatureError> {
    let values = float_values(frame.column(COL_AMOUNT)?)?;
    Ok(values
        .into_iter()
        .map(|value| value.filter(|v| !v.is_nan()))
        .collect())
}

fn float_values(series: &Series) -> Result<Vec<Option<f64>>, FeatureError> {
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|err| FeatureError::DataValidation {
            column: series.name().to_string(),
            message: err.to_string(),
        })?;
    Ok(casted.f64()?.into_iter().collect())
}

fn group_key_series(frame: &DataFrame, column: &str) -> Result<Series, FeatureError> {
    frame
        .column(column)?
        .cast(&DataType::String)
        .map_err(|err| FeatureError::DataValidation {
            column: column.to_string(),
            message: err.to_string(),
        })
}

fn unit_circle(value: f64, period: f64) -> (f32, f32) {
    let angle = 2.0 * PI * value / period;
    (angle.sin() as f32, angle.cos() as f32)
}

fn percentile(sorted: &[f64], level: f64) -> f64 {
    let rank = level * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

fn schema_fingerprint(columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update("windows:");
    for window in &WINDOWS {
        hasher.update(format!("{}={},", window.name, window.seconds));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{};", column.dtype.as_tag()));
    }
    hex::encode(hasher.finalize())
}
