//! The fixed set of schedules an agent's `check` can run on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a valid schedule")]
pub struct ScheduleError(pub String);

/// The repeat intervals a schedule can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    OneMinute,
    TwoMinutes,
    FiveMinutes,
    TenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FiveHours,
    TwelveHours,
    OneDay,
    TwoDays,
    SevenDays,
}

impl Interval {
    pub const ALL: [Interval; 12] = [
        Interval::OneMinute,
        Interval::TwoMinutes,
        Interval::FiveMinutes,
        Interval::TenMinutes,
        Interval::ThirtyMinutes,
        Interval::OneHour,
        Interval::TwoHours,
        Interval::FiveHours,
        Interval::TwelveHours,
        Interval::OneDay,
        Interval::TwoDays,
        Interval::SevenDays,
    ];

    pub const fn minutes(self) -> u32 {
        match self {
            Interval::OneMinute => 1,
            Interval::TwoMinutes => 2,
            Interval::FiveMinutes => 5,
            Interval::TenMinutes => 10,
            Interval::ThirtyMinutes => 30,
            Interval::OneHour => 60,
            Interval::TwoHours => 120,
            Interval::FiveHours => 300,
            Interval::TwelveHours => 720,
            Interval::OneDay => 1440,
            Interval::TwoDays => 2880,
            Interval::SevenDays => 10080,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Interval::OneMinute => "every_1m",
            Interval::TwoMinutes => "every_2m",
            Interval::FiveMinutes => "every_5m",
            Interval::TenMinutes => "every_10m",
            Interval::ThirtyMinutes => "every_30m",
            Interval::OneHour => "every_1h",
            Interval::TwoHours => "every_2h",
            Interval::FiveHours => "every_5h",
            Interval::TwelveHours => "every_12h",
            Interval::OneDay => "every_1d",
            Interval::TwoDays => "every_2d",
            Interval::SevenDays => "every_7d",
        }
    }
}

/// An hour of the day, 0 to 23.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hour(u8);

impl Hour {
    pub const MIDNIGHT: Hour = Hour(0);
    pub const NOON: Hour = Hour(12);

    pub const fn new(hour: u8) -> Option<Hour> {
        if hour < 24 { Some(Hour(hour)) } else { None }
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

/// When the external scheduler should fire `check` for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    Every(Interval),
    /// Once a day at the given hour.
    Daily(Hour),
    #[default]
    Never,
}

impl Schedule {
    pub fn is_scheduled(&self) -> bool {
        !matches!(self, Schedule::Never)
    }

    /// Every valid schedule name, in display order.
    pub fn names() -> Vec<String> {
        let mut names: Vec<String> = Interval::ALL.iter().map(|i| i.name().to_string()).collect();
        names.extend((0..24).filter_map(Hour::new).map(|h| Schedule::Daily(h).to_string()));
        names.push("never".into());
        names
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(interval) = Interval::ALL.iter().find(|i| i.name() == s) {
            return Ok(Schedule::Every(*interval));
        }
        match s {
            "never" => return Ok(Schedule::Never),
            "midnight" => return Ok(Schedule::Daily(Hour::MIDNIGHT)),
            "noon" => return Ok(Schedule::Daily(Hour::NOON)),
            _ => {}
        }

        let hour = |digits: &str| digits.parse::<u8>().ok().filter(|h| (1..=11).contains(h));
        let daily = match (s.strip_suffix("am").and_then(hour), s.strip_suffix("pm").and_then(hour)) {
            (Some(h), _) => Hour::new(h),
            (_, Some(h)) => Hour::new(h + 12),
            _ => None,
        };
        daily
            .map(Schedule::Daily)
            .ok_or_else(|| ScheduleError(s.to_string()))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Schedule::Never => f.write_str("never"),
            Schedule::Every(interval) => f.write_str(interval.name()),
            Schedule::Daily(hour) => match hour.get() {
                0 => f.write_str("midnight"),
                12 => f.write_str("noon"),
                h if h < 12 => write!(f, "{h}am"),
                h => write!(f, "{}pm", h - 12),
            },
        }
    }
}

impl TryFrom<String> for Schedule {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Schedule> for String {
    fn from(s: Schedule) -> Self {
        s.to_string()
    }
}
