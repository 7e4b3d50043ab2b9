//! Remote client contracts + Connect-style HTTP and fixture-backed implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use pulse_core::{
    Activity, ActivityDetail, ActivityRef, BodyBattery, Credentials, DailySummary, DateWindow,
    HeartRateSample, SleepSummary, SportKind, SportMetrics,
};
use pulse_storage::{FetchError, HttpFetcher, RetryDisposition};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "pulse-adapters";

const ACTIVITY_PAGE_SIZE: usize = 100;
const MAX_ACTIVITY_PAGES: usize = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("no data: {0}")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Only transient transport/throttling failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_))
    }

    fn from_fetch(err: &FetchError, what: &str) -> Self {
        match err.status() {
            Some(401 | 403) => Self::AuthenticationFailed(format!("{what}: session rejected ({err})")),
            Some(404) => Self::NotFound(what.to_string()),
            _ if err.disposition() == RetryDisposition::Retryable => {
                Self::RemoteUnavailable(format!("{what}: {err}"))
            }
            _ => Self::Malformed(format!("{what}: {err}")),
        }
    }
}

/// Opaque, per-invocation handle returned by `authenticate`. Never persisted.
#[derive(Debug)]
pub struct Session {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn bearer(&self) -> &str {
        self.token.expose_secret()
    }
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, RemoteError>;

    async fn fetch_daily_summary(
        &self,
        session: &Session,
        date: NaiveDate,
    ) -> Result<DailySummary, RemoteError>;

    async fn fetch_activities(
        &self,
        session: &Session,
        window: DateWindow,
    ) -> Result<ActivityListing, RemoteError>;

    async fn fetch_activity_detail(
        &self,
        session: &Session,
        activity_id: &str,
    ) -> Result<ActivityDetail, RemoteError>;
}

/// Listing entry that could not be decoded; the rest of the listing still counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedEntry {
    pub activity_id: Option<String>,
    pub reason: String,
}

/// Activities found in a window, ordered by local start time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityListing {
    pub refs: Vec<ActivityRef>,
    pub rejected: Vec<RejectedEntry>,
    /// The page cap stopped the walk while the remote still had entries.
    pub truncated: bool,
}

impl ActivityListing {
    fn push_entry(&mut self, entry: &JsonValue, window: DateWindow) {
        match decode_activity_ref(entry) {
            Ok(activity_ref) if window.contains(activity_ref.start_time_local.date()) => {
                self.refs.push(activity_ref);
            }
            Ok(_) => {}
            Err(err) => {
                let activity_id = activity_id_of(entry);
                warn!(activity_id = activity_id.as_deref().unwrap_or("?"), "skipping listing entry: {err}");
                self.rejected.push(RejectedEntry {
                    activity_id,
                    reason: err.to_string(),
                });
            }
        }
    }

    fn finish(mut self) -> Self {
        self.refs.sort_by(|a, b| {
            a.start_time_local
                .cmp(&b.start_time_local)
                .then_with(|| a.activity_id.cmp(&b.activity_id))
        });
        self.refs.dedup_by(|a, b| a.activity_id == b.activity_id);
        self
    }
}

/// Raw per-day payloads as served by the wellness endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyPayloads {
    pub stats: JsonValue,
    #[serde(default)]
    pub heart_rate: JsonValue,
    #[serde(default)]
    pub sleep: Option<JsonValue>,
    #[serde(default)]
    pub body_battery: Option<JsonValue>,
    #[serde(default)]
    pub respiration: Option<JsonValue>,
    #[serde(default)]
    pub spo2: Option<JsonValue>,
}

/// Raw payloads for one activity: listing entry, detail document, heart-rate trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityPayloads {
    pub summary: JsonValue,
    #[serde(default)]
    pub detail: Option<JsonValue>,
    #[serde(default)]
    pub heart_rate: Option<JsonValue>,
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    (!cur.is_null()).then_some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_at(value, path)?.as_f64()
}

fn json_u32(value: &JsonValue, path: &[&str]) -> Option<u32> {
    json_f64(value, path)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.round().min(f64::from(u32::MAX)) as u32)
}

fn json_u16(value: &JsonValue, path: &[&str]) -> Option<u16> {
    json_u32(value, path).and_then(|v| u16::try_from(v).ok())
}

fn json_u8(value: &JsonValue, path: &[&str]) -> Option<u8> {
    json_u32(value, path).and_then(|v| u8::try_from(v).ok())
}

/// Look a field up in the detail's `summaryDTO`, falling back to the top level.
fn detail_f64(detail: &JsonValue, key: &str) -> Option<f64> {
    json_f64(detail, &["summaryDTO", key]).or_else(|| json_f64(detail, &[key]))
}

fn detail_str<'a>(detail: &'a JsonValue, key: &str) -> Option<&'a str> {
    json_str(detail, &["summaryDTO", key]).or_else(|| json_str(detail, &[key]))
}

fn is_empty_payload(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Pairs of `[timestamp_ms, value]`, skipping entries without a value.
fn timestamped_values(value: Option<&JsonValue>) -> Vec<(i64, f64)> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let pair = entry.as_array()?;
                    let ts = pair.first()?.as_i64()?;
                    let v = pair.get(1)?.as_f64()?;
                    Some((ts, v))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_vendor_datetime(text: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text.trim(), fmt).ok())
}

pub fn decode_daily_summary(
    date: NaiveDate,
    payloads: &DailyPayloads,
) -> Result<DailySummary, RemoteError> {
    let stats = &payloads.stats;
    if is_empty_payload(stats) || json_at(stats, &["totalSteps"]).is_none() {
        return Err(RemoteError::NotFound(format!("daily summary for {date}")));
    }
    if let Some(calendar_date) = json_str(stats, &["calendarDate"]) {
        if calendar_date != date.format("%Y-%m-%d").to_string() {
            return Err(RemoteError::Malformed(format!(
                "stats for {date} reported calendarDate {calendar_date}"
            )));
        }
    }

    let steps = json_u32(stats, &["totalSteps"])
        .ok_or_else(|| RemoteError::Malformed(format!("totalSteps for {date} is not a count")))?;

    let hr = &payloads.heart_rate;
    let hr_values = timestamped_values(json_at(hr, &["heartRateValues"]));
    let average_heart_rate = (!hr_values.is_empty()).then(|| {
        let sum: f64 = hr_values.iter().map(|(_, v)| v).sum();
        (sum / hr_values.len() as f64).round() as u16
    });

    let sleep = payloads.sleep.as_ref().and_then(|sleep| {
        let total_seconds = json_u32(sleep, &["dailySleepDTO", "sleepTimeSeconds"])?;
        Some(SleepSummary {
            total_seconds,
            deep_seconds: json_u32(sleep, &["dailySleepDTO", "deepSleepSeconds"]),
            light_seconds: json_u32(sleep, &["dailySleepDTO", "lightSleepSeconds"]),
            rem_seconds: json_u32(sleep, &["dailySleepDTO", "remSleepSeconds"]),
            awake_seconds: json_u32(sleep, &["dailySleepDTO", "awakeSleepSeconds"]),
            score: json_u8(sleep, &["dailySleepDTO", "sleepScores", "overall", "value"]),
        })
    });

    let body_battery = payloads
        .body_battery
        .as_ref()
        .and_then(|reports| reports.as_array()?.first().cloned())
        .map(|report| {
            let levels = timestamped_values(json_at(&report, &["bodyBatteryValuesArray"]));
            let level = |v: f64| u8::try_from(v.round() as i64).ok();
            BodyBattery {
                charged: json_u8(&report, &["charged"]),
                drained: json_u8(&report, &["drained"]),
                highest: levels.iter().map(|(_, v)| *v).reduce(f64::max).and_then(level),
                lowest: levels.iter().map(|(_, v)| *v).reduce(f64::min).and_then(level),
            }
        })
        .filter(|battery| *battery != BodyBattery::default());

    let respiration_rate = payloads
        .respiration
        .as_ref()
        .and_then(|r| json_f64(r, &["avgWakingRespirationValue"]));
    let spo2_average = payloads.spo2.as_ref().and_then(|s| {
        json_f64(s, &["averageSpO2"]).or_else(|| json_f64(s, &["averageSpo2"]))
    });

    Ok(DailySummary {
        date,
        steps,
        distance_meters: json_f64(stats, &["totalDistanceMeters"]),
        resting_heart_rate: json_u16(hr, &["restingHeartRate"])
            .or_else(|| json_u16(stats, &["restingHeartRate"])),
        average_heart_rate,
        max_heart_rate: json_u16(hr, &["maxHeartRate"]).or_else(|| json_u16(stats, &["maxHeartRate"])),
        sleep,
        body_battery,
        respiration_rate,
        spo2_average,
        vo2_max: json_f64(stats, &["vo2Max"]),
    })
}

fn activity_id_of(value: &JsonValue) -> Option<String> {
    match json_at(value, &["activityId"])? {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn type_key_of(value: &JsonValue) -> String {
    json_str(value, &["activityTypeDTO", "typeKey"])
        .or_else(|| json_str(value, &["activityType", "typeKey"]))
        .unwrap_or("unknown")
        .to_string()
}

pub fn decode_activity_ref(value: &JsonValue) -> Result<ActivityRef, RemoteError> {
    let activity_id = activity_id_of(value)
        .ok_or_else(|| RemoteError::Malformed("activity listing entry without activityId".into()))?;
    let start_time_local = json_str(value, &["startTimeLocal"])
        .and_then(parse_vendor_datetime)
        .ok_or_else(|| RemoteError::Malformed(format!("activity {activity_id} has no startTimeLocal")))?;
    Ok(ActivityRef {
        activity_id,
        type_key: type_key_of(value),
        start_time_local,
    })
}

fn decode_sport_metrics(type_key: &str, detail: &JsonValue) -> SportMetrics {
    match SportKind::from_type_key(type_key) {
        SportKind::Swim => SportMetrics::Swim {
            strokes: detail_f64(detail, "strokes").map(|v| v.round().max(0.0) as u32),
            average_stroke_distance: detail_f64(detail, "avgStrokeDistance"),
            swolf: detail_f64(detail, "swolfAverage").or_else(|| detail_f64(detail, "averageSwolf")),
        },
        SportKind::Bike => SportMetrics::Bike {
            average_cadence: detail_f64(detail, "averageBikingCadenceInRevPerMinute")
                .or_else(|| detail_f64(detail, "averageBikeCadence")),
            max_cadence: detail_f64(detail, "maxBikingCadenceInRevPerMinute")
                .or_else(|| detail_f64(detail, "maxBikeCadence")),
            average_power: detail_f64(detail, "avgPower").or_else(|| detail_f64(detail, "averagePower")),
        },
        SportKind::Row => SportMetrics::Row {
            average_stroke_rate: detail_f64(detail, "averageStrokeRate"),
            max_stroke_rate: detail_f64(detail, "maxStrokeRate"),
        },
        SportKind::Run => SportMetrics::Run {
            average_cadence: detail_f64(detail, "averageRunningCadenceInStepsPerMinute")
                .or_else(|| detail_f64(detail, "averageRunCadence")),
            average_pace: detail_f64(detail, "averageSpeed")
                .filter(|speed| *speed > 0.0)
                .map(|speed| 1000.0 / speed),
        },
        SportKind::Other => SportMetrics::Other,
    }
}

/// Build the canonical activity plus its ordered heart-rate trace.
pub fn decode_activity_detail(payloads: &ActivityPayloads) -> Result<ActivityDetail, RemoteError> {
    let summary = &payloads.summary;
    let detail = payloads.detail.as_ref().unwrap_or(summary);

    let activity_id = activity_id_of(detail)
        .or_else(|| activity_id_of(summary))
        .ok_or_else(|| RemoteError::Malformed("activity detail without activityId".into()))?;
    let type_key = {
        let from_detail = type_key_of(detail);
        if from_detail == "unknown" {
            type_key_of(summary)
        } else {
            from_detail
        }
    };
    let field = |key: &str| detail_f64(detail, key).or_else(|| json_f64(summary, &[key]));
    let text = |key: &str| detail_str(detail, key).or_else(|| json_str(summary, &[key]));

    let start_time_local = text("startTimeLocal")
        .and_then(parse_vendor_datetime)
        .ok_or_else(|| RemoteError::Malformed(format!("activity {activity_id} has no startTimeLocal")))?;
    let start_time_utc = text("startTimeGMT")
        .and_then(parse_vendor_datetime)
        .map(|gmt| Utc.from_utc_datetime(&gmt))
        .unwrap_or_else(|| Utc.from_utc_datetime(&start_time_local));
    let duration_seconds = field("duration")
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| RemoteError::Malformed(format!("activity {activity_id} has no duration")))?;
    let heart_rate = |key: &str| field(key).filter(|v| *v >= 0.0).and_then(|v| u16::try_from(v.round() as i64).ok());

    let activity = Activity {
        activity_id: activity_id.clone(),
        name: text("activityName").map(str::to_string),
        metrics: decode_sport_metrics(&type_key, detail),
        type_key,
        start_time_utc,
        start_time_local,
        duration_seconds,
        distance_meters: field("distance"),
        average_heart_rate: heart_rate("averageHR"),
        max_heart_rate: heart_rate("maxHR"),
        calories: field("calories"),
        average_speed: field("averageSpeed"),
        max_speed: field("maxSpeed"),
        elevation_gain: field("elevationGain"),
        elevation_loss: field("elevationLoss"),
    };

    let start_ms = start_time_utc.timestamp_millis();
    let mut samples: Vec<HeartRateSample> = timestamped_values(
        payloads
            .heart_rate
            .as_ref()
            .and_then(|hr| json_at(hr, &["heartRateValues"])),
    )
    .into_iter()
    .filter(|(_, bpm)| *bpm > 0.0)
    .filter_map(|(ts, bpm)| {
        Some(HeartRateSample {
            offset_ms: u32::try_from(ts.saturating_sub(start_ms).max(0)).ok()?,
            bpm: u16::try_from(bpm.round() as i64).ok()?,
        })
    })
    .collect();
    samples.sort_by_key(|s| s.offset_ms);

    Ok(ActivityDetail { activity, samples })
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// JSON client for a Connect-style wellness API.
#[derive(Debug)]
pub struct ConnectClient {
    http: HttpFetcher,
    base_url: String,
}

impl ConnectClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json(
        &self,
        session: &Session,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<JsonValue, RemoteError> {
        let resp = self
            .http
            .get(&self.url(path), Some(session.bearer()), query)
            .await
            .map_err(|err| RemoteError::from_fetch(&err, what))?;
        if resp.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(JsonValue::Null);
        }
        resp.json()
            .map_err(|err| RemoteError::Malformed(format!("{what}: {err}")))
    }

    /// Optional sub-metric: "no data" leaves the field empty, anything else fails the day.
    async fn get_optional_json(
        &self,
        session: &Session,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<Option<JsonValue>, RemoteError> {
        match self.get_json(session, path, query, what).await {
            Ok(value) if is_empty_payload(&value) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl RemoteClient for ConnectClient {
    fn source_id(&self) -> &'static str {
        "connect"
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, RemoteError> {
        let body = json!({
            "username": credentials.email,
            "password": credentials.password.expose_secret(),
        });
        let resp = self
            .http
            .post_json(&self.url("/auth/login"), &body)
            .await
            .map_err(|err| match err.status() {
                Some(400 | 401 | 403) => {
                    RemoteError::AuthenticationFailed(format!("login rejected ({err})"))
                }
                _ => match RemoteError::from_fetch(&err, "login") {
                    RemoteError::NotFound(what) => {
                        RemoteError::AuthenticationFailed(format!("{what}: endpoint not found"))
                    }
                    other => other,
                },
            })?;
        let login: LoginResponse = resp
            .json()
            .map_err(|err| RemoteError::AuthenticationFailed(format!("unreadable login response: {err}")))?;
        if login.access_token.is_empty() {
            return Err(RemoteError::AuthenticationFailed("empty access token".into()));
        }
        let ttl = ChronoDuration::seconds(login.expires_in.unwrap_or(3600).max(0));
        debug!(expires_in = ttl.num_seconds(), "authenticated");
        Ok(Session::new(login.access_token, Utc::now() + ttl))
    }

    async fn fetch_daily_summary(
        &self,
        session: &Session,
        date: NaiveDate,
    ) -> Result<DailySummary, RemoteError> {
        let day = date.format("%Y-%m-%d").to_string();
        let stats = self
            .get_json(
                session,
                "/usersummary-service/usersummary/daily",
                &[("calendarDate", day.clone())],
                &format!("stats for {day}"),
            )
            .await?;
        if is_empty_payload(&stats) {
            return Err(RemoteError::NotFound(format!("daily summary for {day}")));
        }
        let heart_rate = self
            .get_json(
                session,
                "/wellness-service/wellness/dailyHeartRate",
                &[("date", day.clone())],
                &format!("heart rate for {day}"),
            )
            .await?;
        let sleep = self
            .get_optional_json(
                session,
                "/wellness-service/wellness/dailySleepData",
                &[("date", day.clone())],
                &format!("sleep for {day}"),
            )
            .await?;
        let body_battery = self
            .get_optional_json(
                session,
                "/wellness-service/wellness/bodyBattery/reports/daily",
                &[("startDate", day.clone()), ("endDate", day.clone())],
                &format!("body battery for {day}"),
            )
            .await?;
        let respiration = self
            .get_optional_json(
                session,
                &format!("/wellness-service/wellness/daily/respiration/{day}"),
                &[],
                &format!("respiration for {day}"),
            )
            .await?;
        let spo2 = self
            .get_optional_json(
                session,
                &format!("/wellness-service/wellness/daily/spo2/{day}"),
                &[],
                &format!("spo2 for {day}"),
            )
            .await?;

        decode_daily_summary(
            date,
            &DailyPayloads {
                stats,
                heart_rate,
                sleep,
                body_battery,
                respiration,
                spo2,
            },
        )
    }

    async fn fetch_activities(
        &self,
        session: &Session,
        window: DateWindow,
    ) -> Result<ActivityListing, RemoteError> {
        let mut listing = ActivityListing::default();
        let mut exhausted = false;
        for page in 0..MAX_ACTIVITY_PAGES {
            let entries = self
                .get_json(
                    session,
                    "/activitylist-service/activities/search/activities",
                    &[
                        ("startDate", window.start.format("%Y-%m-%d").to_string()),
                        ("endDate", window.end.format("%Y-%m-%d").to_string()),
                        ("start", (page * ACTIVITY_PAGE_SIZE).to_string()),
                        ("limit", ACTIVITY_PAGE_SIZE.to_string()),
                    ],
                    &format!("activity list page {page}"),
                )
                .await?;
            let entries = match entries {
                JsonValue::Null => Vec::new(),
                JsonValue::Array(items) => items,
                other => {
                    return Err(RemoteError::Malformed(format!(
                        "activity list page {page} is not an array: {other}"
                    )))
                }
            };
            for entry in &entries {
                listing.push_entry(entry, window);
            }
            if entries.len() < ACTIVITY_PAGE_SIZE {
                exhausted = true;
                break;
            }
        }
        if !exhausted {
            warn!(
                %window,
                pages = MAX_ACTIVITY_PAGES,
                page_size = ACTIVITY_PAGE_SIZE,
                "activity list page cap reached; later activities may be missing"
            );
            listing.truncated = true;
        }
        Ok(listing.finish())
    }

    async fn fetch_activity_detail(
        &self,
        session: &Session,
        activity_id: &str,
    ) -> Result<ActivityDetail, RemoteError> {
        let detail = self
            .get_json(
                session,
                &format!("/activity-service/activity/{activity_id}"),
                &[],
                &format!("activity {activity_id}"),
            )
            .await?;
        if is_empty_payload(&detail) {
            return Err(RemoteError::NotFound(format!("activity {activity_id}")));
        }
        let heart_rate = self
            .get_optional_json(
                session,
                &format!("/activity-service/activity/{activity_id}/details"),
                &[],
                &format!("heart rate trace for activity {activity_id}"),
            )
            .await?;
        decode_activity_detail(&ActivityPayloads {
            summary: detail.clone(),
            detail: Some(detail),
            heart_rate,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureAccount {
    pub email: String,
    pub password: String,
}

/// Captured vendor payloads served by `FixtureClient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub captured_at: DateTime<Utc>,
    pub account: FixtureAccount,
    #[serde(default)]
    pub days: BTreeMap<NaiveDate, DailyPayloads>,
    #[serde(default)]
    pub activities: Vec<ActivityPayloads>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Offline client replaying a fixture bundle through the same decoders as `ConnectClient`.
#[derive(Debug, Clone)]
pub struct FixtureClient {
    bundle: FixtureBundle,
}

impl FixtureClient {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }

    fn activity_payloads(&self, activity_id: &str) -> Option<&ActivityPayloads> {
        self.bundle
            .activities
            .iter()
            .find(|a| activity_id_of(&a.summary).as_deref() == Some(activity_id))
    }
}

#[async_trait]
impl RemoteClient for FixtureClient {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, RemoteError> {
        let account = &self.bundle.account;
        if credentials.email != account.email
            || credentials.password.expose_secret() != account.password.as_str()
        {
            return Err(RemoteError::AuthenticationFailed(format!(
                "fixture {} rejected credentials for {}",
                self.bundle.fixture_id, credentials.email
            )));
        }
        Ok(Session::new(
            format!("fixture-{}", self.bundle.fixture_id),
            Utc::now() + ChronoDuration::hours(1),
        ))
    }

    async fn fetch_daily_summary(
        &self,
        _session: &Session,
        date: NaiveDate,
    ) -> Result<DailySummary, RemoteError> {
        let payloads = self
            .bundle
            .days
            .get(&date)
            .ok_or_else(|| RemoteError::NotFound(format!("daily summary for {date}")))?;
        decode_daily_summary(date, payloads)
    }

    async fn fetch_activities(
        &self,
        _session: &Session,
        window: DateWindow,
    ) -> Result<ActivityListing, RemoteError> {
        let mut listing = ActivityListing::default();
        for activity in &self.bundle.activities {
            listing.push_entry(&activity.summary, window);
        }
        Ok(listing.finish())
    }

    async fn fetch_activity_detail(
        &self,
        _session: &Session,
        activity_id: &str,
    ) -> Result<ActivityDetail, RemoteError> {
        let payloads = self
            .activity_payloads(activity_id)
            .ok_or_else(|| RemoteError::NotFound(format!("activity {activity_id}")))?;
        decode_activity_detail(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use pulse_storage::HttpClientConfig;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn sample_bundle_path() -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join("connect")
            .join("sample")
            .join("bundle.json")
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn connect_client(server: &MockServer) -> ConnectClient {
        let http = HttpFetcher::new(HttpClientConfig {
            token_bucket: None,
            ..Default::default()
        })
        .unwrap();
        ConnectClient::new(http, server.base_url())
    }

    fn session() -> Session {
        Session::new("token-123", Utc::now() + ChronoDuration::hours(1))
    }

    #[test]
    fn decodes_full_daily_payload() {
        let payloads = DailyPayloads {
            stats: json!({"calendarDate": "2026-02-09", "totalSteps": 8421, "totalDistanceMeters": 6512.5, "vo2Max": 51.0}),
            heart_rate: json!({"restingHeartRate": 52, "maxHeartRate": 151, "heartRateValues": [[1, 60], [2, null], [3, 70]]}),
            sleep: Some(json!({"dailySleepDTO": {"sleepTimeSeconds": 27000, "deepSleepSeconds": 5400, "sleepScores": {"overall": {"value": 81}}}})),
            body_battery: Some(json!([{"charged": 64, "drained": 58, "bodyBatteryValuesArray": [[1, 40], [2, 92], [3, 21]]}])),
            respiration: Some(json!({"avgWakingRespirationValue": 14.5})),
            spo2: Some(json!({"averageSpO2": 96.0})),
        };

        let summary = decode_daily_summary(d(2026, 2, 9), &payloads).unwrap();
        assert_eq!(summary.steps, 8421);
        assert_eq!(summary.distance_meters, Some(6512.5));
        assert_eq!(summary.resting_heart_rate, Some(52));
        assert_eq!(summary.average_heart_rate, Some(65));
        assert_eq!(summary.max_heart_rate, Some(151));
        let sleep = summary.sleep.unwrap();
        assert_eq!(sleep.total_seconds, 27000);
        assert_eq!(sleep.deep_seconds, Some(5400));
        assert_eq!(sleep.light_seconds, None);
        assert_eq!(sleep.score, Some(81));
        assert_eq!(
            summary.body_battery,
            Some(BodyBattery {
                charged: Some(64),
                drained: Some(58),
                highest: Some(92),
                lowest: Some(21),
            })
        );
        assert_eq!(summary.respiration_rate, Some(14.5));
        assert_eq!(summary.spo2_average, Some(96.0));
        assert_eq!(summary.vo2_max, Some(51.0));
    }

    #[test]
    fn empty_stats_mean_no_data() {
        let payloads = DailyPayloads {
            stats: json!({"calendarDate": "2026-02-09", "totalSteps": null}),
            heart_rate: JsonValue::Null,
            ..Default::default()
        };
        assert!(matches!(
            decode_daily_summary(d(2026, 2, 9), &payloads),
            Err(RemoteError::NotFound(_))
        ));
    }

    #[test]
    fn mismatched_calendar_date_is_malformed() {
        let payloads = DailyPayloads {
            stats: json!({"calendarDate": "2026-02-08", "totalSteps": 10}),
            heart_rate: JsonValue::Null,
            ..Default::default()
        };
        assert!(matches!(
            decode_daily_summary(d(2026, 2, 9), &payloads),
            Err(RemoteError::Malformed(_))
        ));
    }

    #[test]
    fn sport_metrics_follow_the_activity_type() {
        let swim = ActivityPayloads {
            summary: json!({
                "activityId": 9001,
                "activityName": "Pool",
                "activityType": {"typeKey": "lap_swimming"},
                "startTimeLocal": "2026-02-09 07:15:00",
                "startTimeGMT": "2026-02-09 06:15:00",
                "duration": 1800.0,
                "distance": 1500.0,
                "averageHR": 131.4,
                "maxHR": 160.0,
            }),
            detail: Some(json!({
                "activityId": 9001,
                "summaryDTO": {"strokes": 612.0, "avgStrokeDistance": 2.4, "swolfAverage": 38.0}
            })),
            heart_rate: Some(json!({"heartRateValues": [
                [1770617730000_i64, 120],
                [1770617710000_i64, 110],
                [1770617720000_i64, null]
            ]})),
        };

        let detail = decode_activity_detail(&swim).unwrap();
        assert_eq!(detail.activity.activity_id, "9001");
        assert_eq!(detail.activity.type_key, "lap_swimming");
        assert_eq!(detail.activity.average_heart_rate, Some(131));
        assert_eq!(
            detail.activity.metrics,
            SportMetrics::Swim {
                strokes: Some(612),
                average_stroke_distance: Some(2.4),
                swolf: Some(38.0),
            }
        );
        let start_ms = detail.activity.start_time_utc.timestamp_millis();
        let offsets: Vec<_> = detail.samples.iter().map(|s| i64::from(s.offset_ms)).collect();
        assert_eq!(
            offsets,
            vec![1770617710000 - start_ms, 1770617730000 - start_ms]
        );
        assert_eq!(detail.samples[0].bpm, 110);
    }

    #[test]
    fn run_pace_is_derived_from_speed() {
        let run = ActivityPayloads {
            summary: json!({
                "activityId": "r-1",
                "activityType": {"typeKey": "running"},
                "startTimeLocal": "2026-02-09T18:00:00.0",
                "duration": 1500.0,
                "averageSpeed": 4.0,
                "averageRunningCadenceInStepsPerMinute": 172.0
            }),
            detail: None,
            heart_rate: None,
        };
        let detail = decode_activity_detail(&run).unwrap();
        assert_eq!(
            detail.activity.metrics,
            SportMetrics::Run {
                average_cadence: Some(172.0),
                average_pace: Some(250.0),
            }
        );
        assert!(detail.samples.is_empty());
    }

    #[tokio::test]
    async fn fixture_client_replays_sample_bundle() {
        let client = FixtureClient::from_path(sample_bundle_path()).unwrap();
        let account = client.bundle().account.clone();
        let session = client
            .authenticate(&Credentials::new(account.email, account.password))
            .await
            .unwrap();

        let summary = client.fetch_daily_summary(&session, d(2026, 2, 9)).await.unwrap();
        assert_eq!(summary.steps, 8421);
        assert!(matches!(
            client.fetch_daily_summary(&session, d(2026, 2, 11)).await,
            Err(RemoteError::NotFound(_))
        ));

        let listing = client
            .fetch_activities(&session, DateWindow::new(d(2026, 2, 8), d(2026, 2, 10)))
            .await
            .unwrap();
        assert!(listing.rejected.is_empty());
        assert!(!listing.truncated);
        let refs = listing.refs;
        assert!(!refs.is_empty());
        for r in &refs {
            let detail = client.fetch_activity_detail(&session, &r.activity_id).await.unwrap();
            assert_eq!(detail.activity.activity_id, r.activity_id);
            assert!(detail.samples.windows(2).all(|w| w[0].offset_ms <= w[1].offset_ms));
        }
    }

    #[tokio::test]
    async fn fixture_client_rejects_wrong_password() {
        let client = FixtureClient::from_path(sample_bundle_path()).unwrap();
        let email = client.bundle().account.email.clone();
        assert!(matches!(
            client.authenticate(&Credentials::new(email, "wrong")).await,
            Err(RemoteError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn connect_login_maps_unauthorized_to_authentication_failed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/auth/login");
                then.status(401).body("bad credentials");
            })
            .await;

        let client = connect_client(&server);
        let err = client
            .authenticate(&Credentials::new("me@example.com", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::AuthenticationFailed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn connect_login_returns_session() {
        let server = MockServer::start_async().await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/auth/login")
                    .json_body(json!({"username": "me@example.com", "password": "pw"}));
                then.status(200)
                    .json_body(json!({"access_token": "abc", "expires_in": 600}));
            })
            .await;

        let session = connect_client(&server)
            .authenticate(&Credentials::new("me@example.com", "pw"))
            .await
            .unwrap();
        login.assert_async().await;
        assert!(!session.is_expired(Utc::now()));
        assert!(session.is_expired(Utc::now() + ChronoDuration::minutes(11)));
    }

    #[tokio::test]
    async fn connect_daily_summary_tolerates_missing_optional_metrics() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/usersummary-service/usersummary/daily")
                    .query_param("calendarDate", "2026-02-09");
                then.status(200)
                    .json_body(json!({"calendarDate": "2026-02-09", "totalSteps": 6200}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/wellness-service/wellness/dailyHeartRate");
                then.status(200).json_body(json!({"restingHeartRate": 50}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/wellness-service/wellness/dailySleepData");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/wellness-service/wellness/bodyBattery/reports/daily");
                then.status(200).json_body(json!([]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/wellness-service/wellness/daily/respiration/2026-02-09");
                then.status(200).body("");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/wellness-service/wellness/daily/spo2/2026-02-09");
                then.status(200).json_body(json!({"averageSpO2": 95.0}));
            })
            .await;

        let summary = connect_client(&server)
            .fetch_daily_summary(&session(), d(2026, 2, 9))
            .await
            .unwrap();
        assert_eq!(summary.steps, 6200);
        assert_eq!(summary.resting_heart_rate, Some(50));
        assert_eq!(summary.sleep, None);
        assert_eq!(summary.body_battery, None);
        assert_eq!(summary.respiration_rate, None);
        assert_eq!(summary.spo2_average, Some(95.0));
    }

    #[tokio::test]
    async fn connect_throttling_is_remote_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/usersummary-service/usersummary/daily");
                then.status(429);
            })
            .await;

        let err = connect_client(&server)
            .fetch_daily_summary(&session(), d(2026, 2, 9))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }

    #[tokio::test]
    async fn connect_activity_list_filters_to_window() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/activitylist-service/activities/search/activities")
                    .query_param("startDate", "2026-02-08")
                    .query_param("endDate", "2026-02-09")
                    .query_param("start", "0");
                then.status(200).json_body(json!([
                    {"activityId": 2, "activityType": {"typeKey": "road_biking"}, "startTimeLocal": "2026-02-09 17:00:00"},
                    {"activityId": 1, "activityType": {"typeKey": "running"}, "startTimeLocal": "2026-02-08 07:00:00"},
                    {"activityId": 3, "activityType": {"typeKey": "running"}, "startTimeLocal": "2026-02-10 07:00:00"}
                ]));
            })
            .await;

        let listing = connect_client(&server)
            .fetch_activities(&session(), DateWindow::new(d(2026, 2, 8), d(2026, 2, 9)))
            .await
            .unwrap();
        let ids: Vec<_> = listing.refs.iter().map(|r| r.activity_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(listing.rejected.is_empty());
        assert!(!listing.truncated);
    }

    #[tokio::test]
    async fn connect_activity_list_skips_undecodable_entries() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/activitylist-service/activities/search/activities")
                    .query_param("start", "0");
                then.status(200).json_body(json!([
                    {"activityId": 1, "activityType": {"typeKey": "running"}, "startTimeLocal": "2026-02-08 07:00:00"},
                    {"activityId": 2, "activityType": {"typeKey": "running"}},
                    {"activityId": 3, "activityType": {"typeKey": "lap_swimming"}, "startTimeLocal": "2026-02-09 12:00:00"}
                ]));
            })
            .await;

        let listing = connect_client(&server)
            .fetch_activities(&session(), DateWindow::new(d(2026, 2, 8), d(2026, 2, 9)))
            .await
            .unwrap();

        let ids: Vec<_> = listing.refs.iter().map(|r| r.activity_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(listing.rejected.len(), 1);
        assert_eq!(listing.rejected[0].activity_id.as_deref(), Some("2"));
        assert!(listing.rejected[0].reason.contains("startTimeLocal"));
    }

    #[tokio::test]
    async fn connect_activity_list_flags_page_cap() {
        let server = MockServer::start_async().await;
        let full_page: Vec<JsonValue> = (1..=ACTIVITY_PAGE_SIZE)
            .map(|id| {
                json!({
                    "activityId": id,
                    "activityType": {"typeKey": "running"},
                    "startTimeLocal": "2026-02-08 07:00:00"
                })
            })
            .collect();
        let pages = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/activitylist-service/activities/search/activities");
                then.status(200).json_body(JsonValue::Array(full_page));
            })
            .await;

        let listing = connect_client(&server)
            .fetch_activities(&session(), DateWindow::new(d(2026, 2, 8), d(2026, 2, 9)))
            .await
            .unwrap();

        pages.assert_hits_async(MAX_ACTIVITY_PAGES).await;
        assert!(listing.truncated);
        assert_eq!(listing.refs.len(), ACTIVITY_PAGE_SIZE);
    }
}
