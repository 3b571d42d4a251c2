//! Energy-monitoring domain types shared by the client and the aggregator.

use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Electricity,
    CompressorElectricity,
    HeaterElectricity,
    HeatOutput,
}

impl Quantity {
    /// Quantities requested from the bulk endpoint for every window.
    pub const FETCHED: [Quantity; 3] = [
        Quantity::CompressorElectricity,
        Quantity::HeaterElectricity,
        Quantity::HeatOutput,
    ];

    /// Last segment of the energy-monitoring resource path.
    pub fn resource_name(self) -> Option<&'static str> {
        match self {
            Quantity::CompressorElectricity => Some("compressor"),
            Quantity::HeaterElectricity => Some("eheater"),
            Quantity::HeatOutput => Some("outputProduced"),
            Quantity::Electricity => None,
        }
    }

    pub fn from_resource_path(path: &str) -> Option<Quantity> {
        Quantity::FETCHED.into_iter().find(|q| {
            q.resource_name()
                .is_some_and(|name| path.contains(&format!("/energyMonitoring/{}?interval=", name)))
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Hourly,
    Daily,
}

impl Resolution {
    pub fn step(self) -> TimeDelta {
        match self {
            Resolution::Hourly => TimeDelta::hours(1),
            Resolution::Daily => TimeDelta::days(1),
        }
    }

    /// Start of the bucket at this resolution that contains `ts`.
    pub fn truncate(self, ts: NaiveDateTime) -> NaiveDateTime {
        match self {
            Resolution::Hourly => ts.date().and_time(NaiveTime::MIN) + TimeDelta::hours(i64::from(ts.hour())),
            Resolution::Daily => ts.date().and_time(NaiveTime::MIN),
        }
    }

    /// ISO-8601 sample rate as used by the recordings API.
    pub fn from_sample_rate(s: &str) -> Option<Resolution> {
        match s {
            "P1H" | "PT1H" => Some(Resolution::Hourly),
            "P1D" => Some(Resolution::Daily),
            _ => None,
        }
    }
}

/// One energy sample. Timestamps are the controller's local wall-clock time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub timestamp: NaiveDateTime,
    pub quantity: Quantity,
    pub value_wh: f64,
    pub resolution: Resolution,
}

/// Range of recordings requested in one bulk call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Window {
    /// Hourly samples of one day.
    Day(NaiveDate),
    /// Daily samples of one month; the date is the first of the month.
    Month(NaiveDate),
}

impl Window {
    pub fn month_of(date: NaiveDate) -> Window {
        Window::Month(date.with_day(1).unwrap_or(date))
    }

    pub fn interval(self) -> String {
        match self {
            Window::Day(d) => d.format("%Y-%m-%d").to_string(),
            Window::Month(d) => d.format("%Y-%m").to_string(),
        }
    }

    pub fn start(self) -> NaiveDateTime {
        match self {
            Window::Day(d) | Window::Month(d) => d.and_time(NaiveTime::MIN),
        }
    }

    /// Exclusive end: next midnight, or the first of the next month.
    pub fn end(self) -> NaiveDateTime {
        let next = match self {
            Window::Day(d) => d.checked_add_days(Days::new(1)),
            Window::Month(d) => d.checked_add_months(Months::new(1)),
        };
        next.unwrap_or(NaiveDate::MAX).and_time(NaiveTime::MIN)
    }

    pub fn resolution(self) -> Resolution {
        match self {
            Window::Day(_) => Resolution::Hourly,
            Window::Month(_) => Resolution::Daily,
        }
    }

    pub fn resource_path(self, quantity: Quantity) -> Option<String> {
        quantity.resource_name().map(|name| {
            format!(
                "/recordings/heatSources/total/energyMonitoring/{}?interval={}",
                name,
                self.interval()
            )
        })
    }
}

impl core::fmt::Display for Window {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Window::Day(_) => write!(f, "day {}", self.interval()),
            Window::Month(_) => write!(f, "month {}", self.interval()),
        }
    }
}
