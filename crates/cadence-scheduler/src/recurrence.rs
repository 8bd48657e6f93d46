//! Recurrence rules: the `params` encoding and next-occurrence computation.
//!
//! A job's schedule is a [`Frequency`] plus a compact parameter string such as
//! `interval:15` or `byhour:9;byminute:0,30`. The semantics follow RFC 5545
//! recurrence rules (as implemented by python-dateutil), restricted to
//! integer-valued parameters. All arithmetic is done in UTC.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};
use crate::types::Frequency;

/// Occurrences are never searched past this year.
const MAX_YEAR: i32 = 9999;
/// Upper bound on periods examined by one search; guards rules whose filters
/// can never line up with their interval.
const MAX_PERIODS: u64 = 5_000_000;

// ---------------------------------------------------------------------------
// ParameterSet
// ---------------------------------------------------------------------------

/// One parsed parameter value. A single integer stays a scalar, a
/// comma-separated list stays a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Scalar(i64),
    List(Vec<i64>),
}

impl ParamValue {
    pub fn values(&self) -> &[i64] {
        match self {
            ParamValue::Scalar(v) => std::slice::from_ref(v),
            ParamValue::List(vs) => vs,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Scalar(v) => write!(f, "{v}"),
            ParamValue::List(vs) => {
                let joined: Vec<String> = vs.iter().map(i64::to_string).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

/// Parsed form of a `key:v1,v2;key2:v3` parameter string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    entries: BTreeMap<String, ParamValue>,
}

impl ParameterSet {
    /// Parse a parameter string.
    ///
    /// Entries that do not split into exactly one key and one value on `:`
    /// are skipped without complaint. A value component that is not an
    /// integer is an error.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for entry in raw.split(';') {
            let parts: Vec<&str> = entry.split(':').collect();
            let [key, value] = parts.as_slice() else {
                if !entry.trim().is_empty() {
                    debug!(entry, "skipping malformed recurrence parameter");
                }
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                debug!(entry, "skipping recurrence parameter without a key");
                continue;
            }

            let mut values = value
                .split(',')
                .map(|v| {
                    v.trim().parse::<i64>().map_err(|_| {
                        SchedulerError::InvalidRecurrence(format!(
                            "{key}: `{}` is not an integer",
                            v.trim()
                        ))
                    })
                })
                .collect::<Result<Vec<i64>>>()?;

            let value = if values.len() == 1 {
                ParamValue::Scalar(values.remove(0))
            } else {
                ParamValue::List(values)
            };
            entries.insert(key.to_string(), value);
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .entries
            .iter()
            .map(|(key, value)| format!("{key}:{value}"))
            .collect();
        f.write_str(&rendered.join(";"))
    }
}

impl std::str::FromStr for ParameterSet {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        ParameterSet::parse(s)
    }
}

// ---------------------------------------------------------------------------
// RecurrenceRule
// ---------------------------------------------------------------------------

/// A validated recurrence rule anchored at `dtstart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    frequency: Frequency,
    dtstart: NaiveDateTime,
    interval: u32,
    count: Option<u32>,
    wkst: u32,
    bysetpos: Vec<i32>,
    bymonth: Vec<u32>,
    bymonthday: Vec<i32>,
    byyearday: Vec<i32>,
    byweekno: Vec<i32>,
    byweekday: Vec<u32>,
    byhour: Vec<u32>,
    byminute: Vec<u32>,
    bysecond: Vec<u32>,
}

impl RecurrenceRule {
    /// Build a rule from a frequency, parsed parameters and a start point.
    ///
    /// `dtstart` is truncated to whole seconds.
    pub fn new(
        frequency: Frequency,
        params: &ParameterSet,
        dtstart: DateTime<Utc>,
    ) -> Result<Self> {
        let dtstart = dtstart
            .naive_utc()
            .with_nanosecond(0)
            .unwrap_or(dtstart.naive_utc());

        let mut rule = RecurrenceRule {
            frequency,
            dtstart,
            interval: 1,
            count: None,
            wkst: 0,
            bysetpos: Vec::new(),
            bymonth: Vec::new(),
            bymonthday: Vec::new(),
            byyearday: Vec::new(),
            byweekno: Vec::new(),
            byweekday: Vec::new(),
            byhour: Vec::new(),
            byminute: Vec::new(),
            bysecond: Vec::new(),
        };

        for (key, value) in params.iter() {
            match key {
                "interval" => rule.interval = scalar(key, value, 1, i64::from(u32::MAX))? as u32,
                "count" => rule.count = Some(scalar(key, value, 1, i64::from(u32::MAX))? as u32),
                "wkst" => rule.wkst = scalar(key, value, 0, 6)? as u32,
                "bysetpos" => rule.bysetpos = signed_list(key, value, 366)?,
                "bymonth" => rule.bymonth = unsigned_list(key, value, 1, 12)?,
                "bymonthday" => rule.bymonthday = signed_list(key, value, 31)?,
                "byyearday" => rule.byyearday = signed_list(key, value, 366)?,
                "byweekno" => rule.byweekno = signed_list(key, value, 53)?,
                "byweekday" | "byday" => rule.byweekday = unsigned_list(key, value, 0, 6)?,
                "byhour" => rule.byhour = unsigned_list(key, value, 0, 23)?,
                "byminute" => rule.byminute = unsigned_list(key, value, 0, 59)?,
                "bysecond" => rule.bysecond = unsigned_list(key, value, 0, 59)?,
                other => {
                    return Err(SchedulerError::InvalidRecurrence(format!(
                        "unknown parameter `{other}`"
                    )))
                }
            }
        }

        rule.apply_defaults();
        Ok(rule)
    }

    /// Fill the by-lists dtstart implies when the parameters leave them open.
    fn apply_defaults(&mut self) {
        let start = self.dtstart;
        if self.byweekno.is_empty()
            && self.byyearday.is_empty()
            && self.bymonthday.is_empty()
            && self.byweekday.is_empty()
        {
            match self.frequency {
                Frequency::Yearly => {
                    if self.bymonth.is_empty() {
                        self.bymonth = vec![start.month()];
                    }
                    self.bymonthday = vec![start.day() as i32];
                }
                Frequency::Monthly => self.bymonthday = vec![start.day() as i32],
                Frequency::Weekly => self.byweekday = vec![start.weekday().num_days_from_monday()],
                _ => {}
            }
        }

        let rank = frequency_rank(self.frequency);
        if self.byhour.is_empty() && rank < frequency_rank(Frequency::Hourly) {
            self.byhour = vec![start.hour()];
        }
        if self.byminute.is_empty() && rank < frequency_rank(Frequency::Minutely) {
            self.byminute = vec![start.minute()];
        }
        if self.bysecond.is_empty() && rank < frequency_rank(Frequency::Secondly) {
            self.bysecond = vec![start.second()];
        }
    }

    /// All occurrences in order, starting at `dtstart`.
    pub fn occurrences(&self) -> Occurrences<'_> {
        Occurrences::new(self, 0)
    }

    /// The earliest occurrence strictly after `after`, or `None` when the rule
    /// is exhausted.
    pub fn after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Without a count limit, earlier periods cannot matter and are skipped.
        let first_period = if self.count.is_none() {
            self.period_containing(after.naive_utc())
        } else {
            0
        };
        Occurrences::new(self, first_period).find(|occurrence| *occurrence > after)
    }

    /// Index of the period `at` falls into, clamped to zero.
    fn period_containing(&self, at: NaiveDateTime) -> u64 {
        if at <= self.dtstart {
            return 0;
        }
        let start = self.dtstart;
        let interval = i64::from(self.interval);
        let units = match self.frequency {
            Frequency::Yearly => i64::from(at.year() - start.year()),
            Frequency::Monthly => {
                i64::from(at.year() - start.year()) * 12 + i64::from(at.month())
                    - i64::from(start.month())
            }
            Frequency::Weekly => {
                (self.week_start(at.date()) - self.week_start(start.date())).num_days() / 7
            }
            Frequency::Daily => (at.date() - start.date()).num_days(),
            Frequency::Hourly | Frequency::Minutely | Frequency::Secondly => {
                (at - self.sub_daily_anchor()).num_seconds() / self.unit_seconds()
            }
        };
        u64::try_from(units / interval).unwrap_or(0)
    }

    fn week_start(&self, date: NaiveDate) -> NaiveDate {
        let offset = (date.weekday().num_days_from_monday() + 7 - self.wkst) % 7;
        date - Duration::days(i64::from(offset))
    }

    /// Week number of `date` and the week count of its week-numbering year,
    /// with weeks starting on `wkst`. Week 1 is the first week holding at
    /// least four days of the year, so a few days around New Year may be
    /// numbered against the neighbouring year.
    fn week_number(&self, date: NaiveDate) -> Option<(i32, i32)> {
        let start = self.week_start(date);
        let year = start.checked_add_signed(Duration::days(3))?.year();
        let first = self.first_week_start(year)?;
        let next_first = self.first_week_start(year + 1)?;
        let number = (start - first).num_days() / 7 + 1;
        let total = (next_first - first).num_days() / 7;
        Some((number as i32, total as i32))
    }

    /// Start of week 1 of `year`; January 4th always falls inside it.
    fn first_week_start(&self, year: i32) -> Option<NaiveDate> {
        let jan4 = NaiveDate::from_ymd_opt(year, 1, 4)?;
        Some(self.week_start(jan4))
    }

    fn unit_seconds(&self) -> i64 {
        match self.frequency {
            Frequency::Hourly => 3_600,
            Frequency::Minutely => 60,
            _ => 1,
        }
    }

    /// dtstart truncated to the frequency's own unit.
    fn sub_daily_anchor(&self) -> NaiveDateTime {
        let start = self.dtstart;
        match self.frequency {
            Frequency::Hourly => start
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .unwrap_or(start),
            Frequency::Minutely => start.with_second(0).unwrap_or(start),
            _ => start,
        }
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        if !self.bymonth.is_empty() && !self.bymonth.contains(&date.month()) {
            return false;
        }
        if !self.byweekno.is_empty() {
            let Some((number, total)) = self.week_number(date) else {
                return false;
            };
            if !matches_signed(&self.byweekno, number, total) {
                return false;
            }
        }
        if !self.byyearday.is_empty() {
            let ordinal = date.ordinal() as i32;
            let total = days_in_year(date.year()) as i32;
            if !matches_signed(&self.byyearday, ordinal, total) {
                return false;
            }
        }
        if !self.bymonthday.is_empty() {
            let day = date.day() as i32;
            let total = days_in_month(date.year(), date.month()) as i32;
            if !matches_signed(&self.bymonthday, day, total) {
                return false;
            }
        }
        let weekday = date.weekday().num_days_from_monday();
        if !self.byweekday.is_empty() && !self.byweekday.contains(&weekday) {
            return false;
        }
        true
    }

    /// Apply `bysetpos` to one period's sorted candidate set.
    fn select_positions(&self, candidates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.bysetpos.is_empty() || candidates.is_empty() {
            return candidates;
        }
        let len = candidates.len() as i32;
        let mut selected: Vec<NaiveDateTime> = self
            .bysetpos
            .iter()
            .filter_map(|&pos| {
                let idx = if pos > 0 { pos - 1 } else { len + pos };
                (0..len).contains(&idx).then(|| candidates[idx as usize])
            })
            .collect();
        selected.sort();
        selected.dedup();
        selected
    }
}

/// Position of a frequency from coarsest (0) to finest (6).
fn frequency_rank(frequency: Frequency) -> u8 {
    match frequency {
        Frequency::Yearly => 0,
        Frequency::Monthly => 1,
        Frequency::Weekly => 2,
        Frequency::Daily => 3,
        Frequency::Hourly => 4,
        Frequency::Minutely => 5,
        Frequency::Secondly => 6,
    }
}

/// Whether `value` (1-based, out of `total`) is listed, directly or as a
/// negative offset from the end.
fn matches_signed(list: &[i32], value: i32, total: i32) -> bool {
    list.iter().any(|&v| v == value || v == value - total - 1)
}

fn scalar(key: &str, value: &ParamValue, min: i64, max: i64) -> Result<i64> {
    match value {
        ParamValue::Scalar(v) if (min..=max).contains(v) => Ok(*v),
        ParamValue::Scalar(v) => Err(SchedulerError::InvalidRecurrence(format!(
            "{key}: {v} is outside {min}..={max}"
        ))),
        ParamValue::List(_) => Err(SchedulerError::InvalidRecurrence(format!(
            "{key} takes a single value"
        ))),
    }
}

fn unsigned_list(key: &str, value: &ParamValue, min: u32, max: u32) -> Result<Vec<u32>> {
    let mut out = value
        .values()
        .iter()
        .map(|&v| {
            u32::try_from(v)
                .ok()
                .filter(|v| (min..=max).contains(v))
                .ok_or_else(|| {
                    SchedulerError::InvalidRecurrence(format!(
                        "{key}: {v} is outside {min}..={max}"
                    ))
                })
        })
        .collect::<Result<Vec<u32>>>()?;
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// Non-zero values in `-limit..=limit`; negatives count from the end.
fn signed_list(key: &str, value: &ParamValue, limit: i64) -> Result<Vec<i32>> {
    value
        .values()
        .iter()
        .map(|&v| {
            if v != 0 && (-limit..=limit).contains(&v) {
                Ok(v as i32)
            } else {
                Err(SchedulerError::InvalidRecurrence(format!(
                    "{key}: {v} must be non-zero and within ±{limit}"
                )))
            }
        })
        .collect()
}

fn days_in_year(year: i32) -> u32 {
    if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
        366
    } else {
        365
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    match (
        NaiveDate::from_ymd_opt(year, month, 1),
        NaiveDate::from_ymd_opt(next_year, next_month, 1),
    ) {
        (Some(first), Some(next)) => (next - first).num_days() as u32,
        _ => 31,
    }
}

fn month_days(year: i32, month: u32) -> impl Iterator<Item = NaiveDate> {
    (1..=days_in_month(year, month))
        .filter_map(move |day| NaiveDate::from_ymd_opt(year, month, day))
}

/// Convenience for callers that hold the raw job fields.
///
/// Returns `Ok(None)` when the rule has no occurrence after `after`.
pub fn next_after(
    frequency: Frequency,
    params: Option<&str>,
    dtstart: DateTime<Utc>,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let params = ParameterSet::parse(params.unwrap_or_default())?;
    let rule = RecurrenceRule::new(frequency, &params, dtstart)?;
    Ok(rule.after(after))
}

// ---------------------------------------------------------------------------
// Occurrences
// ---------------------------------------------------------------------------

/// Iterator over a rule's occurrences, period by period.
pub struct Occurrences<'a> {
    rule: &'a RecurrenceRule,
    period: u64,
    pending: VecDeque<NaiveDateTime>,
    emitted: u32,
    examined: u64,
    done: bool,
}

impl<'a> Occurrences<'a> {
    fn new(rule: &'a RecurrenceRule, period: u64) -> Self {
        Self {
            rule,
            period,
            pending: VecDeque::new(),
            emitted: 0,
            examined: 0,
            done: false,
        }
    }

    /// Expand the current period into `pending` and move to the next one.
    fn fill_next_period(&mut self) {
        self.examined += 1;
        if self.examined > MAX_PERIODS {
            warn!(
                frequency = %self.rule.frequency,
                "recurrence search gave up; no occurrence found"
            );
            self.done = true;
            return;
        }

        let candidates = match self.rule.frequency {
            Frequency::Yearly | Frequency::Monthly | Frequency::Weekly | Frequency::Daily => {
                self.expand_calendar_period()
            }
            Frequency::Hourly | Frequency::Minutely | Frequency::Secondly => {
                self.expand_clock_period()
            }
        };

        let Some(candidates) = candidates else {
            self.done = true;
            return;
        };

        let start = self.rule.dtstart;
        self.pending.extend(
            self.rule
                .select_positions(candidates)
                .into_iter()
                .filter(|occurrence| *occurrence >= start),
        );
    }

    /// Days of the current period crossed with the time-of-day lists.
    /// `None` once the period lies beyond the search horizon.
    fn expand_calendar_period(&mut self) -> Option<Vec<NaiveDateTime>> {
        let rule = self.rule;
        let start = rule.dtstart.date();
        let step = i64::try_from(self.period).ok()? * i64::from(rule.interval);
        self.period += 1;

        let days: Vec<NaiveDate> = match rule.frequency {
            Frequency::Yearly => {
                let year = i32::try_from(i64::from(start.year()) + step).ok()?;
                if year > MAX_YEAR {
                    return None;
                }
                (1..=12).flat_map(|month| month_days(year, month)).collect()
            }
            Frequency::Monthly => {
                let index = i64::from(start.year()) * 12 + i64::from(start.month0()) + step;
                let year = i32::try_from(index.div_euclid(12)).ok()?;
                if year > MAX_YEAR {
                    return None;
                }
                month_days(year, index.rem_euclid(12) as u32 + 1).collect()
            }
            Frequency::Weekly => {
                let first = rule
                    .week_start(start)
                    .checked_add_signed(Duration::try_weeks(step)?)?;
                if first.year() > MAX_YEAR {
                    return None;
                }
                first.iter_days().take(7).collect()
            }
            _ => {
                let day = start.checked_add_signed(Duration::try_days(step)?)?;
                if day.year() > MAX_YEAR {
                    return None;
                }
                vec![day]
            }
        };

        let mut candidates = Vec::new();
        for day in days.into_iter().filter(|d| rule.matches_date(*d)) {
            for &hour in &rule.byhour {
                for &minute in &rule.byminute {
                    for &second in &rule.bysecond {
                        if let Some(at) = day.and_hms_opt(hour, minute, second) {
                            candidates.push(at);
                        }
                    }
                }
            }
        }
        Some(candidates)
    }

    /// Sub-daily periods fix the date and the coarser clock fields. A period
    /// whose fixed fields fail a filter jumps ahead to the next boundary
    /// where they could match.
    fn expand_clock_period(&mut self) -> Option<Vec<NaiveDateTime>> {
        let rule = self.rule;
        let step_secs = rule.unit_seconds() * i64::from(rule.interval);
        let offset = i64::try_from(self.period).ok()?.checked_mul(step_secs)?;
        let at = rule
            .sub_daily_anchor()
            .checked_add_signed(Duration::try_seconds(offset)?)?;
        if at.year() > MAX_YEAR {
            return None;
        }

        let rank = frequency_rank(rule.frequency);
        let boundary = if !rule.matches_date(at.date()) {
            Some(at.date().succ_opt()?.and_hms_opt(0, 0, 0)?)
        } else if !rule.byhour.is_empty() && !rule.byhour.contains(&at.hour()) {
            Some(at.with_minute(0)?.with_second(0)? + Duration::hours(1))
        } else if rank >= frequency_rank(Frequency::Minutely)
            && !rule.byminute.is_empty()
            && !rule.byminute.contains(&at.minute())
        {
            Some(at.with_second(0)? + Duration::minutes(1))
        } else if rank >= frequency_rank(Frequency::Secondly)
            && !rule.bysecond.is_empty()
            && !rule.bysecond.contains(&at.second())
        {
            Some(at + Duration::seconds(1))
        } else {
            None
        };

        if let Some(boundary) = boundary {
            let gap = (boundary - at).num_seconds();
            let jumps = ((gap + step_secs - 1) / step_secs).max(1);
            self.period += jumps as u64;
            return Some(Vec::new());
        }
        self.period += 1;

        let date = at.date();
        let candidates = match rule.frequency {
            Frequency::Hourly => {
                let mut out = Vec::new();
                for &minute in &rule.byminute {
                    for &second in &rule.bysecond {
                        out.extend(date.and_hms_opt(at.hour(), minute, second));
                    }
                }
                out
            }
            Frequency::Minutely => rule
                .bysecond
                .iter()
                .filter_map(|&second| date.and_hms_opt(at.hour(), at.minute(), second))
                .collect(),
            _ => vec![at],
        };
        Some(candidates)
    }
}

impl Iterator for Occurrences<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(occurrence) = self.pending.pop_front() {
                if self.rule.count.is_some_and(|count| self.emitted >= count) {
                    self.done = true;
                    self.pending.clear();
                    return None;
                }
                self.emitted += 1;
                return Some(Utc.from_utc_datetime(&occurrence));
            }
            if self.done {
                return None;
            }
            self.fill_next_period();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
