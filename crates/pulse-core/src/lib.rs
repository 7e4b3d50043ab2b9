//! Core domain model, fetch-window planning and credential contracts for Pulse.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pulse-core";

/// Upper bound on the lookback window a single invocation may request.
pub const MAX_DAYS_TO_FETCH: i64 = 3650;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: days_to_fetch must be positive, got {0}")]
    NonPositiveWindow(i64),
    #[error("invalid configuration: days_to_fetch {0} exceeds the 3650-day lookback")]
    WindowTooLarge(i64),
    #[error("invalid configuration: window before {0} is outside the supported calendar")]
    DateOutOfRange(NaiveDate),
    #[error("invalid configuration: {0} is not set")]
    Missing(&'static str),
    #[error("invalid configuration: {key}={value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Inclusive range of calendar days in the source system's timezone.
///
/// Planned windows always cover the `days_to_fetch` whole days that end
/// yesterday: `[today - days_to_fetch, today - 1]`. Today is still being
/// recorded on the source side and is never part of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn plan(days_to_fetch: i64, today: NaiveDate) -> Result<Self, ConfigError> {
        if days_to_fetch <= 0 {
            return Err(ConfigError::NonPositiveWindow(days_to_fetch));
        }
        if days_to_fetch > MAX_DAYS_TO_FETCH {
            return Err(ConfigError::WindowTooLarge(days_to_fetch));
        }
        let end = today
            .pred_opt()
            .ok_or(ConfigError::DateOutOfRange(today))?;
        let start = today
            .checked_sub_days(Days::new(days_to_fetch.unsigned_abs()))
            .ok_or(ConfigError::DateOutOfRange(today))?;
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        usize::try_from((self.end - self.start).num_days() + 1).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Ascending, gap-free sequence of every date in the window.
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.start.iter_days().take(self.len()).collect()
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Calendar date of `now` as seen from the source system's timezone.
pub fn source_today(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SleepSummary {
    pub total_seconds: u32,
    pub deep_seconds: Option<u32>,
    pub light_seconds: Option<u32>,
    pub rem_seconds: Option<u32>,
    pub awake_seconds: Option<u32>,
    pub score: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BodyBattery {
    pub charged: Option<u8>,
    pub drained: Option<u8>,
    pub highest: Option<u8>,
    pub lowest: Option<u8>,
}

/// One day of wellness metrics. Re-fetching a date replaces the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub steps: u32,
    pub distance_meters: Option<f64>,
    pub resting_heart_rate: Option<u16>,
    pub average_heart_rate: Option<u16>,
    pub max_heart_rate: Option<u16>,
    pub sleep: Option<SleepSummary>,
    pub body_battery: Option<BodyBattery>,
    pub respiration_rate: Option<f64>,
    pub spo2_average: Option<f64>,
    pub vo2_max: Option<f64>,
}

impl DailySummary {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            steps: 0,
            distance_meters: None,
            resting_heart_rate: None,
            average_heart_rate: None,
            max_heart_rate: None,
            sleep: None,
            body_battery: None,
            respiration_rate: None,
            spo2_average: None,
            vo2_max: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SportKind {
    Swim,
    Bike,
    Row,
    Run,
    Other,
}

impl SportKind {
    /// Classify a vendor activity type key such as `lap_swimming` or `road_biking`.
    pub fn from_type_key(type_key: &str) -> Self {
        let key = type_key.to_ascii_lowercase();
        if key.contains("swimming") || key.contains("open_water") {
            Self::Swim
        } else if key.contains("cycling") || key.contains("biking") {
            Self::Bike
        } else if key.contains("rowing") {
            Self::Row
        } else if key.contains("running") {
            Self::Run
        } else {
            Self::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Swim => "swim",
            Self::Bike => "bike",
            Self::Row => "row",
            Self::Run => "run",
            Self::Other => "other",
        }
    }
}

/// Sport-specific payload; each variant only carries metrics its sport records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SportMetrics {
    Swim {
        strokes: Option<u32>,
        average_stroke_distance: Option<f64>,
        swolf: Option<f64>,
    },
    Bike {
        average_cadence: Option<f64>,
        max_cadence: Option<f64>,
        average_power: Option<f64>,
    },
    Row {
        average_stroke_rate: Option<f64>,
        max_stroke_rate: Option<f64>,
    },
    Run {
        average_cadence: Option<f64>,
        /// Seconds per kilometre.
        average_pace: Option<f64>,
    },
    Other,
}

impl SportMetrics {
    pub fn kind(&self) -> SportKind {
        match self {
            Self::Swim { .. } => SportKind::Swim,
            Self::Bike { .. } => SportKind::Bike,
            Self::Row { .. } => SportKind::Row,
            Self::Run { .. } => SportKind::Run,
            Self::Other => SportKind::Other,
        }
    }
}

/// Listing entry returned by the remote activity search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRef {
    pub activity_id: String,
    pub type_key: String,
    pub start_time_local: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub activity_id: String,
    pub name: Option<String>,
    pub type_key: String,
    pub start_time_utc: DateTime<Utc>,
    pub start_time_local: NaiveDateTime,
    pub duration_seconds: f64,
    pub distance_meters: Option<f64>,
    pub average_heart_rate: Option<u16>,
    pub max_heart_rate: Option<u16>,
    pub calories: Option<f64>,
    pub average_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub elevation_gain: Option<f64>,
    pub elevation_loss: Option<f64>,
    pub metrics: SportMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Milliseconds since the activity started.
    pub offset_ms: u32,
    pub bpm: u16,
}

/// An activity together with its full, ordered heart-rate trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDetail {
    pub activity: Activity,
    pub samples: Vec<HeartRateSample>,
}

/// Account credentials for the source system.
#[derive(Debug)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::from(password.into()),
        }
    }
}

/// Resolves credentials for one invocation. The sync engine never reads
/// configuration itself.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Result<Credentials, ConfigError>;
}

/// Fixed credentials, mostly for tests and fixture-backed runs.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    email: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> Result<Credentials, ConfigError> {
        if self.email.trim().is_empty() {
            return Err(ConfigError::Missing("account email"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing("account password"));
        }
        Ok(Credentials::new(self.email.clone(), self.password.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn single_day_window_is_yesterday() {
        let window = DateWindow::plan(1, d(2026, 2, 10)).unwrap();
        assert_eq!(window.dates(), vec![d(2026, 2, 9)]);
    }

    #[test]
    fn week_window_ends_yesterday() {
        let window = DateWindow::plan(7, d(2026, 2, 10)).unwrap();
        let dates = window.dates();
        assert_eq!(dates.len(), 7);
        assert_eq!(dates.first(), Some(&d(2026, 2, 3)));
        assert_eq!(dates.last(), Some(&d(2026, 2, 9)));
        assert!(dates.windows(2).all(|w| w[1] == w[0].succ_opt().unwrap()));
    }

    #[test]
    fn window_crosses_month_boundary() {
        let window = DateWindow::plan(3, d(2026, 3, 1)).unwrap();
        assert_eq!(
            window.dates(),
            vec![d(2026, 2, 26), d(2026, 2, 27), d(2026, 2, 28)]
        );
    }

    #[test]
    fn window_length_holds_across_leap_and_year_boundaries() {
        for (today, days) in [
            (d(2024, 3, 1), 2),
            (d(2025, 1, 1), 400),
            (d(2028, 3, 1), 60),
            (d(2026, 1, 1), 1),
        ] {
            let window = DateWindow::plan(days, today).unwrap();
            assert_eq!(window.len(), days as usize);
            assert_eq!(window.dates().len(), days as usize);
            assert_eq!(window.end, today.pred_opt().unwrap());
        }
        let leap = DateWindow::plan(2, d(2024, 3, 1)).unwrap();
        assert_eq!(leap.dates(), vec![d(2024, 2, 28), d(2024, 2, 29)]);
    }

    #[test]
    fn non_positive_window_is_invalid_configuration() {
        assert_eq!(
            DateWindow::plan(0, d(2026, 2, 10)),
            Err(ConfigError::NonPositiveWindow(0))
        );
        assert_eq!(
            DateWindow::plan(-3, d(2026, 2, 10)),
            Err(ConfigError::NonPositiveWindow(-3))
        );
        assert!(matches!(
            DateWindow::plan(MAX_DAYS_TO_FETCH + 1, d(2026, 2, 10)),
            Err(ConfigError::WindowTooLarge(_))
        ));
    }

    #[test]
    fn source_today_uses_source_timezone() {
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 2, 30, 0).single().unwrap();
        assert_eq!(source_today(now, chrono_tz::UTC), d(2026, 2, 10));
        assert_eq!(
            source_today(now, chrono_tz::America::Los_Angeles),
            d(2026, 2, 9)
        );
    }

    #[test]
    fn sport_kind_classification() {
        assert_eq!(SportKind::from_type_key("lap_swimming"), SportKind::Swim);
        assert_eq!(SportKind::from_type_key("open_water_swimming"), SportKind::Swim);
        assert_eq!(SportKind::from_type_key("road_biking"), SportKind::Bike);
        assert_eq!(SportKind::from_type_key("indoor_cycling"), SportKind::Bike);
        assert_eq!(SportKind::from_type_key("indoor_rowing"), SportKind::Row);
        assert_eq!(SportKind::from_type_key("trail_running"), SportKind::Run);
        assert_eq!(SportKind::from_type_key("yoga"), SportKind::Other);
    }

    #[test]
    fn sport_metrics_serialize_with_kind_tag() {
        let metrics = SportMetrics::Row {
            average_stroke_rate: Some(24.0),
            max_stroke_rate: Some(31.0),
        };
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["kind"], "row");
        assert_eq!(metrics.kind(), SportKind::Row);
        let back: SportMetrics = serde_json::from_value(json).unwrap();
        assert_eq!(back, metrics);
    }

    #[test]
    fn static_credentials_reject_blank_values() {
        assert_eq!(
            StaticCredentials::new(" ", "pw").credentials().unwrap_err(),
            ConfigError::Missing("account email")
        );
        assert!(StaticCredentials::new("me@example.com", "pw")
            .credentials()
            .is_ok());
    }
}
