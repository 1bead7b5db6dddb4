// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cron schedules for recurring tasks.
//!
//! Five-field expressions (`minute hour day-of-month month day-of-week`)
//! with `*`, lists, ranges, and steps. Day-of-week uses 0–6 with 0 =
//! Sunday (7 is accepted as Sunday). When both day fields are
//! restricted, a day matches if either field matches, per convention.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Errors from cron expression parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),
    #[error("bad field `{field}`: {reason}")]
    BadField { field: String, reason: String },
    #[error("value {value} out of range {min}..={max} in `{field}`")]
    OutOfRange {
        field: String,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// One parsed field: the set of matching values plus whether the field
/// was written as a bare wildcard (day-matching needs to know).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    values: BTreeSet<u8>,
    wildcard: bool,
}

impl Field {
    fn contains(&self, v: u8) -> bool {
        self.values.contains(&v)
    }
}

fn parse_field(spec: &str, min: u32, max: u32, wrap_to_min: bool) -> Result<Field, CronParseError> {
    let mut values = BTreeSet::new();
    let mut wildcard = false;

    for part in spec.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| CronParseError::BadField {
                    field: spec.to_string(),
                    reason: format!("bad step `{}`", s),
                })?;
                if step == 0 {
                    return Err(CronParseError::BadField {
                        field: spec.to_string(),
                        reason: "step must be positive".to_string(),
                    });
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            if part == "*" {
                wildcard = true;
            }
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let lo = parse_value(a, spec)?;
            let hi = parse_value(b, spec)?;
            (lo, hi)
        } else {
            let v = parse_value(range_part, spec)?;
            (v, v)
        };

        for raw in (lo..=hi).step_by(step as usize) {
            // day-of-week 7 wraps to Sunday
            let v = if wrap_to_min && raw == max + 1 { min } else { raw };
            if v < min || v > max {
                return Err(CronParseError::OutOfRange {
                    field: spec.to_string(),
                    value: v,
                    min,
                    max,
                });
            }
            values.insert(v as u8);
        }
    }

    if values.is_empty() {
        return Err(CronParseError::BadField {
            field: spec.to_string(),
            reason: "empty field".to_string(),
        });
    }

    Ok(Field { values, wildcard })
}

fn parse_value(s: &str, field: &str) -> Result<u32, CronParseError> {
    s.parse().map_err(|_| CronParseError::BadField {
        field: field.to_string(),
        reason: format!("bad value `{}`", s),
    })
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }

        Ok(Self {
            expr: expr.to_string(),
            minutes: parse_field(fields[0], 0, 59, false)?,
            hours: parse_field(fields[1], 0, 23, false)?,
            days_of_month: parse_field(fields[2], 1, 31, false)?,
            months: parse_field(fields[3], 1, 12, false)?,
            days_of_week: parse_field(fields[4], 0, 6, true)?,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(t.day() as u8);
        let dow = self
            .days_of_week
            .contains(t.weekday().num_days_from_sunday() as u8);
        match (self.days_of_month.wildcard, self.days_of_week.wildcard) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            (false, false) => dom || dow,
        }
    }

    /// First fire time strictly after `after`.
    ///
    /// Returns `None` only for expressions that can never fire within
    /// the next five years (e.g. Feb 30).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Truncate to the next whole minute.
        let mut t = Utc
            .with_ymd_and_hms(
                after.year(),
                after.month(),
                after.day(),
                after.hour(),
                after.minute(),
                0,
            )
            .single()?
            + Duration::minutes(1);

        let horizon = after + Duration::days(366 * 5);

        while t <= horizon {
            if !self.months.contains(t.month() as u8) {
                // Jump to the first minute of the next month.
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(t) {
                t = Utc
                    .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
                    .single()?
                    + Duration::days(1);
                continue;
            }
            if !self.hours.contains(t.hour() as u8) {
                t = Utc
                    .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
                    .single()?
                    + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute() as u8) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }

        None
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

impl Serialize for CronSchedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expr)
    }
}

impl<'de> Deserialize<'de> for CronSchedule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CronSchedule::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A registered recurring task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub schedule: CronSchedule,
    pub queue: String,
    pub task_name: String,
    /// Params for each spawned task instance.
    pub params_template: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at_ms: Option<u64>,
    pub next_fire_at_ms: u64,
    pub enabled: bool,
    /// Fire once per missed instant after downtime instead of skipping
    /// to the next future instant.
    #[serde(default)]
    pub catchup: bool,
}

impl ScheduledTask {
    /// Build an entry with `next_fire_at` computed from `now`.
    pub fn new(
        name: impl Into<String>,
        schedule: CronSchedule,
        queue: impl Into<String>,
        task_name: impl Into<String>,
        params_template: Value,
        now: DateTime<Utc>,
    ) -> Self {
        let next = schedule
            .next_after(now)
            .map(|t| t.timestamp_millis() as u64)
            .unwrap_or(u64::MAX);
        Self {
            name: name.into(),
            schedule,
            queue: queue.into(),
            task_name: task_name.into(),
            params_template,
            last_fired_at_ms: None,
            next_fire_at_ms: next,
            enabled: true,
            catchup: false,
        }
    }

    pub fn due_at(&self, now_ms: u64) -> bool {
        self.enabled && self.next_fire_at_ms <= now_ms
    }
}

#[cfg(test)]
#[path = "cron_tests.rs"]
mod tests;
