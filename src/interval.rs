//! Chart intervals supported by TradingView

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TvError;

/// Chart interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    Min1,
    Min3,
    Min5,
    Min15,
    Min30,
    Min45,
    Hour1,
    Hour2,
    Hour3,
    Hour4,
    Daily,
    Weekly,
    Monthly,
}

impl Interval {
    pub const ALL: [Interval; 13] = [
        Interval::Min1,
        Interval::Min3,
        Interval::Min5,
        Interval::Min15,
        Interval::Min30,
        Interval::Min45,
        Interval::Hour1,
        Interval::Hour2,
        Interval::Hour3,
        Interval::Hour4,
        Interval::Daily,
        Interval::Weekly,
        Interval::Monthly,
    ];

    /// Label used on the wire in `create_series`
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Min1 => "1",
            Interval::Min3 => "3",
            Interval::Min5 => "5",
            Interval::Min15 => "15",
            Interval::Min30 => "30",
            Interval::Min45 => "45",
            Interval::Hour1 => "1H",
            Interval::Hour2 => "2H",
            Interval::Hour3 => "3H",
            Interval::Hour4 => "4H",
            Interval::Daily => "1D",
            Interval::Weekly => "1W",
            Interval::Monthly => "1M",
        }
    }

    /// Nominal length. A month counts as 30 days.
    pub fn duration(&self) -> Duration {
        match self {
            Interval::Min1 => Duration::minutes(1),
            Interval::Min3 => Duration::minutes(3),
            Interval::Min5 => Duration::minutes(5),
            Interval::Min15 => Duration::minutes(15),
            Interval::Min30 => Duration::minutes(30),
            Interval::Min45 => Duration::minutes(45),
            Interval::Hour1 => Duration::hours(1),
            Interval::Hour2 => Duration::hours(2),
            Interval::Hour3 => Duration::hours(3),
            Interval::Hour4 => Duration::hours(4),
            Interval::Daily => Duration::days(1),
            Interval::Weekly => Duration::weeks(1),
            Interval::Monthly => Duration::days(30),
        }
    }

    /// Add one interval to `dt`, using calendar months for `Monthly`
    pub fn advance(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Interval::Monthly => dt
                .checked_add_months(Months::new(1))
                .unwrap_or(dt + self.duration()),
            _ => dt + self.duration(),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = TvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let interval = match s.trim() {
            "1" | "Min1" | "in_1_minute" => Interval::Min1,
            "3" | "Min3" | "in_3_minute" => Interval::Min3,
            "5" | "Min5" | "in_5_minute" => Interval::Min5,
            "15" | "Min15" | "in_15_minute" => Interval::Min15,
            "30" | "Min30" | "in_30_minute" => Interval::Min30,
            "45" | "Min45" | "in_45_minute" => Interval::Min45,
            "1H" | "Hour1" | "in_1_hour" => Interval::Hour1,
            "2H" | "Hour2" | "in_2_hour" => Interval::Hour2,
            "3H" | "Hour3" | "in_3_hour" => Interval::Hour3,
            "4H" | "Hour4" | "in_4_hour" => Interval::Hour4,
            "1D" | "Daily" | "in_daily" => Interval::Daily,
            "1W" | "Weekly" | "in_weekly" => Interval::Weekly,
            "1M" | "Monthly" | "in_monthly" => Interval::Monthly,
            other => {
                return Err(TvError::validation(
                    "interval",
                    other,
                    "expected one of 1, 3, 5, 15, 30, 45, 1H, 2H, 3H, 4H, 1D, 1W, 1M",
                ))
            }
        };
        Ok(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_labels_round_trip() {
        for interval in Interval::ALL {
            assert_eq!(interval.as_str().parse::<Interval>().unwrap(), interval);
        }
        assert_eq!("in_1_hour".parse::<Interval>().unwrap(), Interval::Hour1);
        assert!("2D".parse::<Interval>().is_err());
    }

    #[test]
    fn test_advance() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        assert_eq!(
            Interval::Hour4.advance(dt),
            Utc.with_ymd_and_hms(2024, 1, 31, 16, 0, 0).unwrap()
        );
        // Calendar month, clamped to the end of February
        assert_eq!(
            Interval::Monthly.advance(dt),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );
        assert_eq!(Interval::Monthly.duration(), Duration::days(30));
    }
}
