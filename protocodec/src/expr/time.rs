//! Relative-time encodings.
//!
//! Every function takes a base timestamp string (`yyyy-MM-dd HH:mm:ss[.SSS]`)
//! and a target timestamp string, both parsed with [`chrono::NaiveDateTime`],
//! and returns the fixed-width byte encoding of the delta. The inverse
//! `…Decode` functions take a base and a raw encoded value and format a
//! timestamp string back.

use crate::error::{CodecError, Stage};
use chrono::{Duration, NaiveDateTime};

const FMT_WITH_MILLIS: &str = "%Y-%m-%d %H:%M:%S%.3f";
const FMT_NO_MILLIS: &str = "%Y-%m-%d %H:%M:%S";

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, CodecError> {
    NaiveDateTime::parse_from_str(s, FMT_WITH_MILLIS)
        .or_else(|_| NaiveDateTime::parse_from_str(s, FMT_NO_MILLIS))
        .map_err(|e| {
            CodecError::expr_runtime(Stage::Derive, "", format!("invalid timestamp '{s}': {e}"))
        })
}

fn out_of_range(detail: impl Into<String>) -> CodecError {
    CodecError::ValueOutOfRange {
        stage: Stage::Derive,
        node_path: String::new(),
        detail: detail.into(),
    }
}

pub fn relative_day(base: &str, ts: &str) -> Result<Vec<u8>, CodecError> {
    let base = parse_timestamp(base)?;
    let ts = parse_timestamp(ts)?;
    let days = (ts.date() - base.date()).num_days();
    let days: i16 = days
        .try_into()
        .map_err(|_| out_of_range(format!("day delta {days} out of i16 range")))?;
    Ok(days.to_be_bytes().to_vec())
}

pub fn relative_day_decode(base: &str, encoded: i64) -> Result<String, CodecError> {
    let base = parse_timestamp(base)?;
    let days = encoded as i16 as i64;
    let result = base.date() + Duration::days(days);
    Ok(result.format("%Y-%m-%d").to_string())
}

pub fn relative_second(base: &str, ts: &str) -> Result<Vec<u8>, CodecError> {
    let base = parse_timestamp(base)?;
    let ts = parse_timestamp(ts)?;
    let secs = (ts - base).num_seconds();
    let secs: u32 = secs
        .try_into()
        .map_err(|_| out_of_range(format!("second delta {secs} out of u32 range")))?;
    Ok(secs.to_be_bytes().to_vec())
}

pub fn relative_second_decode(base: &str, encoded: u64) -> Result<String, CodecError> {
    let base = parse_timestamp(base)?;
    let result = base + Duration::seconds(encoded as i64);
    Ok(result.format(FMT_NO_MILLIS).to_string())
}

pub fn relative_millisecond(base: &str, ts: &str) -> Result<Vec<u8>, CodecError> {
    let base = parse_timestamp(base)?;
    let ts = parse_timestamp(ts)?;
    let ms = (ts - base).num_milliseconds();
    let ms: u32 = ms
        .try_into()
        .map_err(|_| out_of_range(format!("millisecond delta {ms} out of u32 range")))?;
    Ok(ms.to_be_bytes().to_vec())
}

pub fn relative_millisecond_decode(base: &str, encoded: u64) -> Result<String, CodecError> {
    let base = parse_timestamp(base)?;
    let result = base + Duration::milliseconds(encoded as i64);
    Ok(result.format(FMT_WITH_MILLIS).to_string())
}

pub fn relative_day_and_second(base: &str, ts: &str) -> Result<Vec<u8>, CodecError> {
    let base = parse_timestamp(base)?;
    let ts = parse_timestamp(ts)?;
    let days = (ts.date() - base.date()).num_days();
    let days: i16 = days
        .try_into()
        .map_err(|_| out_of_range(format!("day delta {days} out of i16 range")))?;
    let midnight = ts.date().and_hms_opt(0, 0, 0).unwrap();
    let intra_day_secs = (ts - midnight).num_seconds().rem_euclid(86_400) as u32;
    let mut out = days.to_be_bytes().to_vec();
    out.extend_from_slice(&intra_day_secs.to_be_bytes());
    Ok(out)
}

pub fn relative_day_and_second_decode(base: &str, encoded: &[u8]) -> Result<String, CodecError> {
    require_len(encoded, 6)?;
    let base = parse_timestamp(base)?;
    let days = i16::from_be_bytes([encoded[0], encoded[1]]);
    let secs = u32::from_be_bytes([encoded[2], encoded[3], encoded[4], encoded[5]]);
    let result = base.date() + Duration::days(days as i64);
    let result = result.and_hms_opt(0, 0, 0).unwrap() + Duration::seconds(secs as i64);
    Ok(result.format(FMT_NO_MILLIS).to_string())
}

pub fn relative_day_and_millisecond(base: &str, ts: &str) -> Result<Vec<u8>, CodecError> {
    let base = parse_timestamp(base)?;
    let ts = parse_timestamp(ts)?;
    let days = (ts.date() - base.date()).num_days();
    let days: i16 = days
        .try_into()
        .map_err(|_| out_of_range(format!("day delta {days} out of i16 range")))?;
    let midnight = ts.date().and_hms_opt(0, 0, 0).unwrap();
    let intra_day_ms = (ts - midnight).num_milliseconds().rem_euclid(86_400_000) as u32;
    let mut out = days.to_be_bytes().to_vec();
    out.extend_from_slice(&intra_day_ms.to_be_bytes());
    Ok(out)
}

pub fn relative_day_and_millisecond_decode(base: &str, encoded: &[u8]) -> Result<String, CodecError> {
    require_len(encoded, 6)?;
    let base = parse_timestamp(base)?;
    let days = i16::from_be_bytes([encoded[0], encoded[1]]);
    let ms = u32::from_be_bytes([encoded[2], encoded[3], encoded[4], encoded[5]]);
    let day = base.date() + Duration::days(days as i64);
    let result = day.and_hms_opt(0, 0, 0).unwrap() + Duration::milliseconds(ms as i64);
    Ok(result.format(FMT_WITH_MILLIS).to_string())
}

pub fn relative_week_and_second(base: &str, ts: &str) -> Result<Vec<u8>, CodecError> {
    let base = parse_timestamp(base)?;
    let ts = parse_timestamp(ts)?;
    let base_week_start = week_start(base);
    let ts_week_start = week_start(ts);
    let weeks = (ts_week_start.date() - base_week_start.date()).num_days() / 7;
    let weeks: i16 = weeks
        .try_into()
        .map_err(|_| out_of_range(format!("week delta {weeks} out of i16 range")))?;
    let intra_week_secs = (ts - ts_week_start).num_seconds() as u32;
    let mut out = weeks.to_be_bytes().to_vec();
    out.extend_from_slice(&intra_week_secs.to_be_bytes());
    Ok(out)
}

pub fn relative_week_and_second_decode(base: &str, encoded: &[u8]) -> Result<String, CodecError> {
    require_len(encoded, 6)?;
    let base = parse_timestamp(base)?;
    let weeks = i16::from_be_bytes([encoded[0], encoded[1]]);
    let secs = u32::from_be_bytes([encoded[2], encoded[3], encoded[4], encoded[5]]);
    let base_week_start = week_start(base);
    let result = base_week_start + Duration::weeks(weeks as i64) + Duration::seconds(secs as i64);
    Ok(result.format(FMT_NO_MILLIS).to_string())
}

fn week_start(dt: NaiveDateTime) -> NaiveDateTime {
    use chrono::Datelike;
    let days_since_monday = dt.weekday().num_days_from_monday() as i64;
    (dt.date() - Duration::days(days_since_monday)).and_hms_opt(0, 0, 0).unwrap()
}

pub fn relative_second_and_millisecond(base: &str, ts: &str) -> Result<Vec<u8>, CodecError> {
    let base = parse_timestamp(base)?;
    let ts = parse_timestamp(ts)?;
    let total_ms = (ts - base).num_milliseconds();
    let secs = (total_ms / 1000) as u32;
    let intra_ms = (total_ms.rem_euclid(1000)) as u16;
    let mut out = secs.to_be_bytes().to_vec();
    out.extend_from_slice(&intra_ms.to_be_bytes());
    Ok(out)
}

pub fn relative_second_and_millisecond_decode(base: &str, encoded: &[u8]) -> Result<String, CodecError> {
    require_len(encoded, 6)?;
    let base = parse_timestamp(base)?;
    let secs = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
    let ms = u16::from_be_bytes([encoded[4], encoded[5]]);
    let result = base + Duration::seconds(secs as i64) + Duration::milliseconds(ms as i64);
    Ok(result.format(FMT_WITH_MILLIS).to_string())
}

pub fn relative_tenth_millisecond(base: &str, ts: &str) -> Result<Vec<u8>, CodecError> {
    let base = parse_timestamp(base)?;
    let ts = parse_timestamp(ts)?;
    let ms = (ts - base).num_milliseconds();
    let tenths = ms.checked_mul(10).ok_or_else(|| out_of_range("tenth-ms delta overflow"))?;
    let tenths: u32 = tenths
        .try_into()
        .map_err(|_| out_of_range(format!("tenth-ms delta {tenths} out of u32 range")))?;
    Ok(tenths.to_be_bytes().to_vec())
}

pub fn relative_tenth_millisecond_decode(base: &str, encoded: u64) -> Result<String, CodecError> {
    let base = parse_timestamp(base)?;
    let ms = encoded as i64 / 10;
    let result = base + Duration::milliseconds(ms);
    Ok(result.format(FMT_WITH_MILLIS).to_string())
}

fn require_len(bytes: &[u8], len: usize) -> Result<(), CodecError> {
    if bytes.len() == len {
        Ok(())
    } else {
        Err(out_of_range(format!(
            "expected {len} encoded bytes, got {}",
            bytes.len()
        )))
    }
}
