//! Five-field cron expressions (minute, hour, day-of-month, month,
//! day-of-week) with list/range/step/wildcard semantics, matched against a
//! wall-clock stamp in the routine's own time zone. Day-of-week accepts both
//! conventions: 7 is treated as 0 (Sunday).

use chrono::{DateTime, Datelike, TimeZone, Timelike};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid cron field '{0}'")]
    InvalidField(String),
    #[error("value {value} out of range {min}-{max}")]
    OutOfRange { value: u32, min: u32, max: u32 },
}

/// Bit set over the legal values of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }
}

fn parse_value(text: &str, min: u32, max: u32) -> Result<u32, CronError> {
    let value: u32 = text
        .parse()
        .map_err(|_| CronError::InvalidField(text.to_string()))?;
    if value < min || value > max {
        return Err(CronError::OutOfRange { value, min, max });
    }
    Ok(value)
}

/// Parse one field into a bit set. `normalize` remaps values after range
/// checking (used to fold day-of-week 7 onto 0).
fn parse_field(
    spec: &str,
    min: u32,
    max: u32,
    normalize: fn(u32) -> u32,
) -> Result<FieldSet, CronError> {
    let mut bits = 0u64;
    for part in spec.split(',') {
        if part.is_empty() {
            return Err(CronError::InvalidField(spec.to_string()));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = parse_value(step, 1, max.max(1))?;
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(lo, min, max)?, parse_value(hi, min, max)?)
        } else {
            let value = parse_value(range, min, max)?;
            // "N/step" extends to the end of the field's range.
            if part.contains('/') {
                (value, max)
            } else {
                (value, value)
            }
        };
        if start > end {
            return Err(CronError::InvalidField(part.to_string()));
        }

        let mut value = start;
        while value <= end {
            bits |= 1u64 << normalize(value);
            value += step;
        }
    }
    Ok(FieldSet(bits))
}

fn identity(value: u32) -> u32 {
    value
}

fn fold_sunday(value: u32) -> u32 {
    if value == 7 { 0 } else { value }
}

/// Local wall-clock coordinates a cron expression is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStamp {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    /// 0 = Sunday .. 6 = Saturday.
    pub weekday: u32,
}

impl LocalStamp {
    pub fn from_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> Self {
        Self {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            weekday: dt.weekday().num_days_from_sunday(),
        }
    }

    /// Idempotence-lock bucket: one key per routine per local minute.
    pub fn minute_key(&self) -> String {
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute
        )
    }
}

#[derive(Debug, Clone)]
pub struct CronExpr {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, identity)?,
            hour: parse_field(fields[1], 0, 23, identity)?,
            day_of_month: parse_field(fields[2], 1, 31, identity)?,
            month: parse_field(fields[3], 1, 12, identity)?,
            day_of_week: parse_field(fields[4], 0, 7, fold_sunday)?,
        })
    }

    pub fn matches(&self, stamp: &LocalStamp) -> bool {
        self.minute.contains(stamp.minute)
            && self.hour.contains(stamp.hour)
            && self.day_of_month.contains(stamp.day)
            && self.month.contains(stamp.month)
            && self.day_of_week.contains(stamp.weekday)
    }
}
