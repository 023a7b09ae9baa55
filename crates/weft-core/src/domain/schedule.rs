//! Schedule - カレンダー型の繰り返し設定
//!
//! 毎時 M 分 / 毎日 H:M / 毎週 曜日 H:M の 3 種類。
//! 設定の外部表現は以下の形:
//!
//! ```json
//! { "interval": "weekly", "time": { "weekday": "Mon", "hour": 9, "minute": 30 } }
//! ```
//!
//! 時刻は固定オフセット（既定 UTC）の壁時計で解釈します。

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, NaiveTime, Offset, Timelike, Utc,
    Weekday,
};
use serde::{Deserialize, Serialize};

use super::errors::{Result, WeftError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Hourly,
    Daily,
    Weekly(Weekday),
}

/// A validated calendar recurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScheduleSpec", into = "ScheduleSpec")]
pub struct Schedule {
    recurrence: Recurrence,
    at: NaiveTime,
    offset: FixedOffset,
}

impl Schedule {
    /// Every hour at `minute`.
    pub fn hourly(minute: u32) -> Result<Self> {
        Self::build(Recurrence::Hourly, 0, minute)
    }

    /// Every day at `hour:minute`.
    pub fn daily(hour: u32, minute: u32) -> Result<Self> {
        Self::build(Recurrence::Daily, hour, minute)
    }

    /// Every week on `weekday` at `hour:minute`.
    pub fn weekly(weekday: Weekday, hour: u32, minute: u32) -> Result<Self> {
        Self::build(Recurrence::Weekly(weekday), hour, minute)
    }

    /// Interpret times in a fixed offset from UTC instead of UTC itself.
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    fn build(recurrence: Recurrence, hour: u32, minute: u32) -> Result<Self> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
            WeftError::InvalidSchedule(format!("{hour:02}:{minute:02} is not a time of day"))
        })?;
        Ok(Self {
            recurrence,
            at,
            offset: Utc.fix(),
        })
    }

    pub fn recurrence(&self) -> Recurrence {
        self.recurrence
    }

    /// Smallest instant `>= now` that matches this schedule.
    ///
    /// If the target for the current hour/day/week has already passed, the
    /// result rolls forward by one hour/day/week.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.naive_utc() + Duration::seconds(self.offset.local_minus_utc() as i64);
        let midnight = local.date().and_time(NaiveTime::MIN);

        let (candidate, step): (NaiveDateTime, Duration) = match self.recurrence {
            Recurrence::Hourly => (
                midnight + Duration::hours(local.hour() as i64) + Duration::minutes(self.at.minute() as i64),
                Duration::hours(1),
            ),
            Recurrence::Daily => (local.date().and_time(self.at), Duration::days(1)),
            Recurrence::Weekly(weekday) => {
                let ahead = (weekday.num_days_from_monday() + 7
                    - local.weekday().num_days_from_monday())
                    % 7;
                (
                    (local.date() + Duration::days(ahead as i64)).and_time(self.at),
                    Duration::weeks(1),
                )
            }
        };

        let next = if candidate < local { candidate + step } else { candidate };
        (next - Duration::seconds(self.offset.local_minus_utc() as i64)).and_utc()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hourly,
    Daily,
    Weekly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpec {
    pub minute: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday: Option<Weekday>,
}

/// Wire form of [`Schedule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub interval: Interval,
    pub time: TimeSpec,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub utc_offset_minutes: i32,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl TryFrom<ScheduleSpec> for Schedule {
    type Error = WeftError;

    fn try_from(spec: ScheduleSpec) -> Result<Self> {
        let TimeSpec { minute, hour, weekday } = spec.time;
        let schedule = match spec.interval {
            Interval::Hourly => Schedule::hourly(minute)?,
            Interval::Daily => {
                let hour = hour.ok_or_else(|| {
                    WeftError::InvalidSchedule("daily schedule needs time.hour".to_string())
                })?;
                Schedule::daily(hour, minute)?
            }
            Interval::Weekly => {
                let (hour, weekday) = hour.zip(weekday).ok_or_else(|| {
                    WeftError::InvalidSchedule(
                        "weekly schedule needs time.hour and time.weekday".to_string(),
                    )
                })?;
                Schedule::weekly(weekday, hour, minute)?
            }
        };
        let offset = FixedOffset::east_opt(spec.utc_offset_minutes * 60).ok_or_else(|| {
            WeftError::InvalidSchedule(format!(
                "utc offset of {} minutes is out of range",
                spec.utc_offset_minutes
            ))
        })?;
        Ok(schedule.with_offset(offset))
    }
}

impl From<Schedule> for ScheduleSpec {
    fn from(s: Schedule) -> Self {
        let (interval, hour, weekday) = match s.recurrence {
            Recurrence::Hourly => (Interval::Hourly, None, None),
            Recurrence::Daily => (Interval::Daily, Some(s.at.hour()), None),
            Recurrence::Weekly(wd) => (Interval::Weekly, Some(s.at.hour()), Some(wd)),
        };
        Self {
            interval,
            time: TimeSpec {
                minute: s.at.minute(),
                hour,
                weekday,
            },
            utc_offset_minutes: s.offset.local_minus_utc() / 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    // 2024-01-03 is a Wednesday.
    #[rstest]
    #[case(Schedule::hourly(30).unwrap(), at(2024, 1, 3, 10, 15, 0), at(2024, 1, 3, 10, 30, 0))]
    #[case(Schedule::hourly(30).unwrap(), at(2024, 1, 3, 10, 45, 0), at(2024, 1, 3, 11, 30, 0))]
    #[case(Schedule::hourly(30).unwrap(), at(2024, 1, 3, 23, 31, 0), at(2024, 1, 4, 0, 30, 0))]
    #[case(Schedule::daily(9, 0).unwrap(), at(2024, 1, 3, 8, 0, 0), at(2024, 1, 3, 9, 0, 0))]
    #[case(Schedule::daily(9, 0).unwrap(), at(2024, 1, 3, 9, 0, 1), at(2024, 1, 4, 9, 0, 0))]
    #[case(Schedule::daily(9, 0).unwrap(), at(2024, 12, 31, 10, 0, 0), at(2025, 1, 1, 9, 0, 0))]
    #[case(Schedule::weekly(Weekday::Fri, 18, 0).unwrap(), at(2024, 1, 3, 12, 0, 0), at(2024, 1, 5, 18, 0, 0))]
    #[case(Schedule::weekly(Weekday::Mon, 9, 0).unwrap(), at(2024, 1, 3, 12, 0, 0), at(2024, 1, 8, 9, 0, 0))]
    #[case(Schedule::weekly(Weekday::Wed, 9, 0).unwrap(), at(2024, 1, 3, 8, 0, 0), at(2024, 1, 3, 9, 0, 0))]
    #[case(Schedule::weekly(Weekday::Wed, 9, 0).unwrap(), at(2024, 1, 3, 10, 0, 0), at(2024, 1, 10, 9, 0, 0))]
    fn next_occurrence_rolls_forward_only_when_passed(
        #[case] schedule: Schedule,
        #[case] now: DateTime<Utc>,
        #[case] expected: DateTime<Utc>,
    ) {
        assert_eq!(schedule.next_occurrence(now), expected);
    }

    #[test]
    fn exact_match_is_returned_as_is() {
        let now = at(2024, 1, 3, 9, 0, 0);
        assert_eq!(Schedule::daily(9, 0).unwrap().next_occurrence(now), now);
    }

    #[test]
    fn offset_shifts_wall_clock() {
        // 09:00 at UTC+9 is 00:00 UTC.
        let schedule = Schedule::daily(9, 0)
            .unwrap()
            .with_offset(FixedOffset::east_opt(9 * 3600).unwrap());
        assert_eq!(
            schedule.next_occurrence(at(2024, 1, 2, 23, 0, 0)),
            at(2024, 1, 3, 0, 0, 0)
        );
    }

    #[rstest]
    #[case(60, 0)]
    #[case(0, 24)]
    fn out_of_range_times_are_rejected(#[case] minute: u32, #[case] hour: u32) {
        assert!(matches!(
            Schedule::daily(hour, minute),
            Err(WeftError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn parses_wire_form() {
        let schedule: Schedule = serde_json::from_value(serde_json::json!({
            "interval": "weekly",
            "time": { "weekday": "Mon", "hour": 9, "minute": 30 }
        }))
        .unwrap();
        assert_eq!(schedule, Schedule::weekly(Weekday::Mon, 9, 30).unwrap());

        let daily_without_hour = serde_json::from_value::<Schedule>(serde_json::json!({
            "interval": "daily",
            "time": { "minute": 0 }
        }));
        assert!(daily_without_hour.is_err());
    }
}
