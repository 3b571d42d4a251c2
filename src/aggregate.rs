//! Turns raw energy recordings into "last complete hour" and "month-to-date"
//! readings. Pure: no I/O, the wall-clock time is an argument.

use chrono::{Datelike, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::energy::{Quantity, Recording, Resolution, Window};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    CompressorLastHour,
    EheaterLastHour,
    ElectricityLastHour,
    HeatOutputLastHour,
    CopLastHour,
    CompressorMonth,
    EheaterMonth,
    ElectricityMonth,
    HeatOutputMonth,
    CopMonth,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Period {
    LastHour,
    MonthToDate,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum Unit {
    #[serde(rename = "kWh")]
    KilowattHours,
    #[serde(rename = "dimensionless")]
    Dimensionless,
}

impl Metric {
    pub const ALL: [Metric; 10] = [
        Metric::CompressorLastHour,
        Metric::EheaterLastHour,
        Metric::ElectricityLastHour,
        Metric::HeatOutputLastHour,
        Metric::CopLastHour,
        Metric::CompressorMonth,
        Metric::EheaterMonth,
        Metric::ElectricityMonth,
        Metric::HeatOutputMonth,
        Metric::CopMonth,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Metric::CompressorLastHour => "compressor_last_hour",
            Metric::EheaterLastHour => "eheater_last_hour",
            Metric::ElectricityLastHour => "electricity_last_hour",
            Metric::HeatOutputLastHour => "heat_output_last_hour",
            Metric::CopLastHour => "cop_last_hour",
            Metric::CompressorMonth => "compressor_month",
            Metric::EheaterMonth => "eheater_month",
            Metric::ElectricityMonth => "electricity_month",
            Metric::HeatOutputMonth => "heat_output_month",
            Metric::CopMonth => "cop_month",
        }
    }

    pub fn unit(self) -> Unit {
        match self {
            Metric::CopLastHour | Metric::CopMonth => Unit::Dimensionless,
            _ => Unit::KilowattHours,
        }
    }

    pub fn period(self) -> Period {
        match self {
            Metric::CompressorLastHour
            | Metric::EheaterLastHour
            | Metric::ElectricityLastHour
            | Metric::HeatOutputLastHour
            | Metric::CopLastHour => Period::LastHour,
            _ => Period::MonthToDate,
        }
    }
}

impl core::fmt::Display for Metric {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub resolution: Resolution,
}

impl Bucket {
    pub fn containing(ts: NaiveDateTime, resolution: Resolution) -> Bucket {
        let start = resolution.truncate(ts);
        Bucket {
            start,
            end: start + resolution.step(),
            resolution,
        }
    }

    /// Latest hourly bucket with `end <= now`. At exactly 14:00:00 this is 13:00-14:00.
    pub fn last_complete_hour(now: NaiveDateTime) -> Bucket {
        let current = Bucket::containing(now, Resolution::Hourly);
        Bucket::containing(current.start - Resolution::Hourly.step(), Resolution::Hourly)
    }

    pub fn is_complete(&self, now: NaiveDateTime) -> bool {
        self.end <= now
    }

    pub fn label(&self) -> String {
        match self.resolution {
            Resolution::Hourly => self.start.format("%Y-%m-%d %H:00").to_string(),
            Resolution::Daily => self.start.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Day window holding the last complete hour (yesterday shortly after midnight).
pub fn hourly_window(now: NaiveDateTime) -> Window {
    Window::Day(Bucket::last_complete_hour(now).start.date())
}

pub fn monthly_window(now: NaiveDateTime) -> Window {
    Window::month_of(now.date())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub metric: Metric,
    /// `None` when no recording covers the bucket; never a synthetic zero.
    pub value: Option<f64>,
    pub unit: Unit,
    pub bucket_label: String,
}

pub type ReadingSet = BTreeMap<Metric, Reading>;

/// Per-quantity kWh totals of one period; `None` means nothing was recorded.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Totals {
    compressor: Option<f64>,
    heater: Option<f64>,
    electricity: Option<f64>,
    heat_output: Option<f64>,
}

impl Totals {
    fn from_lookup(mut kwh: impl FnMut(Quantity) -> Option<f64>) -> Self {
        Totals {
            compressor: kwh(Quantity::CompressorElectricity),
            heater: kwh(Quantity::HeaterElectricity),
            electricity: kwh(Quantity::Electricity),
            heat_output: kwh(Quantity::HeatOutput),
        }
    }

    /// Compressor plus heater; a missing component counts as zero as long as
    /// the other one was recorded. Direct readings only when neither was.
    fn electricity(&self) -> Option<f64> {
        match (self.compressor, self.heater) {
            (None, None) => self.electricity,
            (c, h) => Some(c.unwrap_or(0.0) + h.unwrap_or(0.0)),
        }
    }

    fn cop(&self) -> Option<f64> {
        match (self.heat_output, self.electricity()) {
            (Some(heat), Some(elec)) if elec > 0.0 => Some(heat / elec),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Sum {
    wh: f64,
    count: usize,
}

type Grouped = BTreeMap<(Quantity, Resolution, NaiveDateTime), Sum>;

fn group(recordings: &[Recording]) -> Grouped {
    let mut grouped = Grouped::new();
    for r in recordings {
        let start = r.resolution.truncate(r.timestamp);
        let sum = grouped.entry((r.quantity, r.resolution, start)).or_default();
        sum.wh += r.value_wh;
        sum.count += 1;
    }
    grouped
}

fn wh_to_kwh(wh: f64) -> f64 {
    wh / 1000.0
}

fn last_hour_totals(grouped: &Grouped, bucket: &Bucket) -> Totals {
    Totals::from_lookup(|q| {
        grouped
            .get(&(q, Resolution::Hourly, bucket.start))
            .filter(|s| s.count > 0)
            .map(|s| wh_to_kwh(s.wh))
    })
}

/// Sums completed daily buckets of the current month, day by day in kWh.
fn month_to_date_totals(grouped: &Grouped, month_start: NaiveDateTime, now: NaiveDateTime) -> Totals {
    Totals::from_lookup(|q| {
        grouped
            .range((q, Resolution::Daily, month_start)..=(q, Resolution::Daily, now))
            .filter(|(_, s)| s.count > 0)
            .filter(|((_, _, start), _)| Bucket::containing(*start, Resolution::Daily).is_complete(now))
            .map(|(_, s)| wh_to_kwh(s.wh))
            .fold(None, |acc, kwh| Some(acc.unwrap_or(0.0) + kwh))
    })
}

fn push_period(out: &mut ReadingSet, totals: &Totals, label: &str, metrics: [Metric; 5]) {
    let [compressor, heater, electricity, heat_output, cop] = metrics;
    let values = [
        (compressor, totals.compressor),
        (heater, totals.heater),
        (electricity, totals.electricity()),
        (heat_output, totals.heat_output),
        (cop, totals.cop()),
    ];
    for (metric, value) in values {
        out.insert(
            metric,
            Reading {
                metric,
                value,
                unit: metric.unit(),
                bucket_label: label.to_string(),
            },
        );
    }
}

/// Compute every [`Metric`] from `recordings` as of `now`.
pub fn aggregate(recordings: &[Recording], now: NaiveDateTime) -> ReadingSet {
    let grouped = group(recordings);
    let mut out = ReadingSet::new();

    let hour = Bucket::last_complete_hour(now);
    push_period(
        &mut out,
        &last_hour_totals(&grouped, &hour),
        &hour.label(),
        [
            Metric::CompressorLastHour,
            Metric::EheaterLastHour,
            Metric::ElectricityLastHour,
            Metric::HeatOutputLastHour,
            Metric::CopLastHour,
        ],
    );

    let month_start = now.date().with_day(1).unwrap_or(now.date()).and_time(NaiveTime::MIN);
    push_period(
        &mut out,
        &month_to_date_totals(&grouped, month_start, now),
        &Bucket::containing(month_start, Resolution::Daily).label(),
        [
            Metric::CompressorMonth,
            Metric::EheaterMonth,
            Metric::ElectricityMonth,
            Metric::HeatOutputMonth,
            Metric::CopMonth,
        ],
    );

    out
}
