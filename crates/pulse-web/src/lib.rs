//! Read-only dashboard and JSON query API over the health store.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use chrono_tz::Tz;
use pulse_core::{source_today, Activity, DailySummary, DateWindow, SportMetrics, MAX_DAYS_TO_FETCH};
use pulse_storage::HealthStore;
use pulse_sync::{render_csv, SyncConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "pulse-web";

const DEFAULT_HEALTH_DAYS: i64 = 30;
const DEFAULT_EXPORT_DAYS: i64 = 90;
const DEFAULT_RECENT_LIMIT: u32 = 10;
const MAX_RECENT_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: HealthStore,
    pub source_tz: Tz,
    /// Pins "today" for deterministic windows.
    pub today: Option<NaiveDate>,
}

impl AppState {
    pub fn new(store: HealthStore, source_tz: Tz) -> Self {
        Self {
            store,
            source_tz,
            today: None,
        }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today
            .unwrap_or_else(|| source_today(Utc::now(), self.source_tz))
    }

    /// Trailing window of `days` days ending today, clamped to the supported lookback.
    fn trailing_window(&self, days: Option<i64>, default: i64) -> DateWindow {
        let days = days.unwrap_or(default).clamp(1, MAX_DAYS_TO_FETCH);
        let today = self.today();
        DateWindow::new(today - ChronoDuration::days(days), today)
    }
}

#[derive(Debug, Deserialize, Default)]
struct DaysQuery {
    days: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<u32>,
}

/// Row shape of `/api/health-data`; field names match what existing dashboards expect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthDataRow {
    pub date: NaiveDate,
    pub steps: u32,
    pub distance_meters: Option<f64>,
    pub resting_hr: Option<u16>,
    pub average_hr: Option<u16>,
    pub max_hr: Option<u16>,
    pub sleep_duration: Option<u32>,
    pub sleep_score: Option<u8>,
    pub deep_sleep: Option<u32>,
    pub light_sleep: Option<u32>,
    pub rem_sleep: Option<u32>,
    pub awake_sleep: Option<u32>,
    pub body_battery: Option<u8>,
    pub body_battery_highest: Option<u8>,
    pub body_battery_lowest: Option<u8>,
    pub respiration_rate: Option<f64>,
    pub spo2_avg: Option<f64>,
    pub vo2_max: Option<f64>,
}

impl From<&DailySummary> for HealthDataRow {
    fn from(s: &DailySummary) -> Self {
        let sleep = s.sleep.as_ref();
        let battery = s.body_battery.as_ref();
        Self {
            date: s.date,
            steps: s.steps,
            distance_meters: s.distance_meters,
            resting_hr: s.resting_heart_rate,
            average_hr: s.average_heart_rate,
            max_hr: s.max_heart_rate,
            sleep_duration: sleep.map(|sl| sl.total_seconds),
            sleep_score: sleep.and_then(|sl| sl.score),
            deep_sleep: sleep.and_then(|sl| sl.deep_seconds),
            light_sleep: sleep.and_then(|sl| sl.light_seconds),
            rem_sleep: sleep.and_then(|sl| sl.rem_seconds),
            awake_sleep: sleep.and_then(|sl| sl.awake_seconds),
            body_battery: battery.and_then(|b| b.charged),
            body_battery_highest: battery.and_then(|b| b.highest),
            body_battery_lowest: battery.and_then(|b| b.lowest),
            respiration_rate: s.respiration_rate,
            spo2_avg: s.spo2_average,
            vo2_max: s.vo2_max,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityRow {
    pub activity_id: String,
    pub name: Option<String>,
    pub activity_type: String,
    pub sport: String,
    pub start_time: String,
    pub start_time_utc: String,
    pub duration_seconds: f64,
    pub distance_meters: Option<f64>,
    pub average_hr: Option<u16>,
    pub max_hr: Option<u16>,
    pub calories: Option<f64>,
    pub metrics: SportMetrics,
}

impl From<&Activity> for ActivityRow {
    fn from(a: &Activity) -> Self {
        Self {
            activity_id: a.activity_id.clone(),
            name: a.name.clone(),
            activity_type: a.type_key.clone(),
            sport: a.metrics.kind().as_str().to_string(),
            start_time: a.start_time_local.format("%Y-%m-%d %H:%M:%S").to_string(),
            start_time_utc: a.start_time_utc.to_rfc3339(),
            duration_seconds: a.duration_seconds,
            distance_meters: a.distance_meters,
            average_hr: a.average_heart_rate,
            max_hr: a.max_heart_rate,
            calories: a.calories,
            metrics: a.metrics.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct DayView {
    date: String,
    has_data: bool,
    steps: String,
    resting_hr: String,
    sleep: String,
    sleep_score: String,
    body_battery: String,
    vo2_max: String,
}

#[derive(Debug, Clone)]
struct ActivityView {
    activity_id: String,
    name: String,
    sport: String,
    start_time: String,
    duration: String,
    distance_km: String,
    average_hr: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    window_label: String,
    days_with_data: usize,
    days_in_window: usize,
    average_steps: String,
    days: Vec<DayView>,
    activities: Vec<ActivityView>,
}

#[derive(Template)]
#[template(path = "activity.html")]
struct ActivityTemplate {
    activity: ActivityView,
    metrics: Vec<(String, String)>,
    sample_count: usize,
    bpm_range: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/activities/{id}", get(activity_page_handler))
        .route("/api/health-data", get(health_data_handler))
        .route("/api/daily-stats", get(health_data_handler))
        .route("/api/recent-activities", get(recent_activities_handler))
        .route("/api/activities/{id}", get(activity_detail_handler))
        .route("/api/export-csv", get(export_csv_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let port: u16 = std::env::var("PULSE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5000);
    let store = HealthStore::open(&config.database_url).await?;
    let state = AppState::new(store, config.source_tz);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, database_url = %config.database_url, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let window = state.trailing_window(None, DEFAULT_HEALTH_DAYS);
    let summaries = match state.store.query_range(window.start, window.end).await {
        Ok(rows) => rows,
        Err(err) => return server_error(err.into()),
    };
    let recent = match state.store.recent_activities(DEFAULT_RECENT_LIMIT).await {
        Ok(rows) => rows,
        Err(err) => return server_error(err.into()),
    };

    let average_steps = if summaries.is_empty() {
        "n/a".to_string()
    } else {
        let total: u64 = summaries.iter().map(|s| u64::from(s.steps)).sum();
        (total / summaries.len() as u64).to_string()
    };
    let mut days = Vec::with_capacity(window.len());
    for date in window.dates().into_iter().rev() {
        match summaries.iter().find(|s| s.date == date) {
            Some(s) => days.push(day_view(s)),
            None => days.push(gap_view(date)),
        }
    }

    render_html(IndexTemplate {
        window_label: window.to_string(),
        days_with_data: summaries.len(),
        days_in_window: window.len(),
        average_steps,
        days,
        activities: recent.iter().map(activity_view).collect(),
    })
}

async fn activity_page_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.store.activity_detail(&id).await {
        Ok(Some(detail)) => {
            let bpm_range = match (
                detail.samples.iter().map(|s| s.bpm).min(),
                detail.samples.iter().map(|s| s.bpm).max(),
            ) {
                (Some(lo), Some(hi)) => format!("{lo}-{hi} bpm"),
                _ => "no trace".to_string(),
            };
            render_html(ActivityTemplate {
                activity: activity_view(&detail.activity),
                metrics: metric_rows(&detail.activity.metrics),
                sample_count: detail.samples.len(),
                bpm_range,
            })
        }
        Ok(None) => (StatusCode::NOT_FOUND, Html("Activity not found".to_string())).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn health_data_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaysQuery>,
) -> Response {
    let window = state.trailing_window(query.days, DEFAULT_HEALTH_DAYS);
    match state.store.query_range(window.start, window.end).await {
        Ok(rows) => {
            let data = rows.iter().rev().map(HealthDataRow::from).collect::<Vec<_>>();
            Json(data).into_response()
        }
        Err(err) => json_error(err.into()),
    }
}

async fn recent_activities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).clamp(1, MAX_RECENT_LIMIT);
    match state.store.recent_activities(limit).await {
        Ok(rows) => Json(rows.iter().map(ActivityRow::from).collect::<Vec<_>>()).into_response(),
        Err(err) => json_error(err.into()),
    }
}

async fn activity_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.store.activity_detail(&id).await {
        Ok(Some(detail)) => Json(serde_json::json!({
            "activity": ActivityRow::from(&detail.activity),
            "samples": detail.samples,
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("activity {id} not found") })),
        )
            .into_response(),
        Err(err) => json_error(err.into()),
    }
}

async fn export_csv_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaysQuery>,
) -> Response {
    let window = state.trailing_window(query.days, DEFAULT_EXPORT_DAYS);
    match state.store.query_range(window.start, window.end).await {
        Ok(rows) => {
            let disposition = format!(
                "attachment; filename=health_data_{}.csv",
                state.today().format("%Y%m%d")
            );
            (
                [
                    (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                render_csv(&rows),
            )
                .into_response()
        }
        Err(err) => json_error(err.into()),
    }
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn hours(seconds: u32) -> String {
    format!("{}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
}

fn day_view(s: &DailySummary) -> DayView {
    let sleep = s.sleep.as_ref();
    DayView {
        date: s.date.to_string(),
        has_data: true,
        steps: s.steps.to_string(),
        resting_hr: opt(s.resting_heart_rate),
        sleep: sleep.map(|sl| hours(sl.total_seconds)).unwrap_or_else(|| "-".to_string()),
        sleep_score: opt(sleep.and_then(|sl| sl.score)),
        body_battery: opt(s.body_battery.as_ref().and_then(|b| b.charged)),
        vo2_max: opt(s.vo2_max),
    }
}

fn gap_view(date: NaiveDate) -> DayView {
    DayView {
        date: date.to_string(),
        has_data: false,
        steps: String::new(),
        resting_hr: String::new(),
        sleep: String::new(),
        sleep_score: String::new(),
        body_battery: String::new(),
        vo2_max: String::new(),
    }
}

fn activity_view(a: &Activity) -> ActivityView {
    let minutes = (a.duration_seconds / 60.0).round() as u64;
    ActivityView {
        activity_id: a.activity_id.clone(),
        name: a.name.clone().unwrap_or_else(|| a.type_key.clone()),
        sport: a.metrics.kind().as_str().to_string(),
        start_time: a.start_time_local.format("%Y-%m-%d %H:%M").to_string(),
        duration: format!("{minutes} min"),
        distance_km: a
            .distance_meters
            .map(|m| format!("{:.2}", m / 1000.0))
            .unwrap_or_else(|| "-".to_string()),
        average_hr: opt(a.average_heart_rate),
    }
}

fn metric_rows(metrics: &SportMetrics) -> Vec<(String, String)> {
    let fmt = |v: Option<f64>| v.map(|x| format!("{x:.1}")).unwrap_or_else(|| "-".to_string());
    let rows: Vec<(&str, String)> = match metrics {
        SportMetrics::Swim {
            strokes,
            average_stroke_distance,
            swolf,
        } => vec![
            ("Strokes", opt(*strokes)),
            ("Avg stroke distance (m)", fmt(*average_stroke_distance)),
            ("SWOLF", fmt(*swolf)),
        ],
        SportMetrics::Bike {
            average_cadence,
            max_cadence,
            average_power,
        } => vec![
            ("Avg cadence (rpm)", fmt(*average_cadence)),
            ("Max cadence (rpm)", fmt(*max_cadence)),
            ("Avg power (W)", fmt(*average_power)),
        ],
        SportMetrics::Row {
            average_stroke_rate,
            max_stroke_rate,
        } => vec![
            ("Avg stroke rate (spm)", fmt(*average_stroke_rate)),
            ("Max stroke rate (spm)", fmt(*max_stroke_rate)),
        ],
        SportMetrics::Run {
            average_cadence,
            average_pace,
        } => vec![
            ("Avg cadence (spm)", fmt(*average_cadence)),
            (
                "Avg pace (min/km)",
                average_pace
                    .map(|p| format!("{}:{:02}", (p / 60.0) as u64, (p % 60.0).round() as u64))
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ],
        SportMetrics::Other => Vec::new(),
    };
    rows.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!("dashboard request failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn json_error(err: anyhow::Error) -> Response {
    error!("api request failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
