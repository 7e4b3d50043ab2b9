//! Sync engine: plan the window, pull from the remote client, upsert into the store.

use std::fmt::Display;
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use parquet::arrow::ArrowWriter;
use pulse_adapters::{ConnectClient, FixtureClient, RemoteClient, RemoteError, Session};
use pulse_core::{
    source_today, Activity, ConfigError, CredentialProvider, Credentials, DailySummary, DateWindow,
};
use pulse_storage::{BackoffPolicy, HealthStore, HttpClientConfig, HttpFetcher, StoreError, WriterLease};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pulse-sync";

pub const CSV_HEADERS: [&str; 11] = [
    "Date",
    "Steps",
    "Distance (meters)",
    "Resting HR",
    "Max HR",
    "Sleep Duration (seconds)",
    "Sleep Score",
    "Body Battery",
    "Respiration Rate",
    "SpO2 Avg",
    "VO2 Max",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Connect,
    Fixture,
}

impl SourceMode {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "connect" => Ok(Self::Connect),
            "fixture" => Ok(Self::Fixture),
            other => Err(ConfigError::InvalidValue {
                key: "PULSE_SOURCE_MODE",
                value: other.to_string(),
                reason: "expected `connect` or `fixture`".to_string(),
            }),
        }
    }
}

#[derive(Debug)]
pub struct SyncConfig {
    pub database_url: String,
    pub email: Option<String>,
    pub password: Option<SecretString>,
    pub days_to_fetch: i64,
    pub source_tz: Tz,
    pub source_mode: SourceMode,
    pub api_base_url: String,
    pub fixture_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retry: BackoffPolicy,
    pub writer_lease_secs: u64,
    pub reports_dir: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys fall back to defaults, unparsable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let source_tz = match var("PULSE_SOURCE_TZ") {
            Some(name) => name.trim().parse::<Tz>().map_err(|err| ConfigError::InvalidValue {
                key: "PULSE_SOURCE_TZ",
                value: name.clone(),
                reason: err.to_string(),
            })?,
            None => Tz::UTC,
        };
        let source_mode = match var("PULSE_SOURCE_MODE") {
            Some(mode) => SourceMode::parse(&mode)?,
            None => SourceMode::Connect,
        };
        let defaults = BackoffPolicy::default();

        Ok(Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://health.db".to_string()),
            email: var("PULSE_EMAIL").map(|v| v.trim().to_string()),
            password: var("PULSE_PASSWORD").map(SecretString::from),
            days_to_fetch: parse_or(var("DAYS_TO_FETCH"), "DAYS_TO_FETCH", 1)?,
            source_tz,
            source_mode,
            api_base_url: var("PULSE_API_BASE_URL")
                .unwrap_or_else(|| "https://connectapi.garmin.com".to_string()),
            fixture_path: var("PULSE_FIXTURE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("fixtures/connect/sample/bundle.json")),
            user_agent: var("PULSE_USER_AGENT").unwrap_or_else(|| "pulse-sync/0.1".to_string()),
            http_timeout_secs: parse_or(var("PULSE_HTTP_TIMEOUT_SECS"), "PULSE_HTTP_TIMEOUT_SECS", 20)?,
            retry: BackoffPolicy {
                max_attempts: parse_or(
                    var("PULSE_RETRY_MAX_ATTEMPTS"),
                    "PULSE_RETRY_MAX_ATTEMPTS",
                    defaults.max_attempts,
                )?,
                base_delay: Duration::from_millis(parse_or(
                    var("PULSE_RETRY_BASE_DELAY_MS"),
                    "PULSE_RETRY_BASE_DELAY_MS",
                    u64::try_from(defaults.base_delay.as_millis()).unwrap_or(2000),
                )?),
                max_delay: defaults.max_delay,
            },
            writer_lease_secs: parse_or(var("PULSE_WRITER_LEASE_SECS"), "PULSE_WRITER_LEASE_SECS", 900)?,
            reports_dir: var("PULSE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
        })
    }

    pub fn credential_provider(&self) -> EnvCredentialProvider {
        EnvCredentialProvider {
            email: self.email.clone(),
            password: self
                .password
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret().to_owned())),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            days_to_fetch: self.days_to_fetch,
            source_tz: self.source_tz,
            backoff: self.retry,
            lease_ttl: Duration::from_secs(self.writer_lease_secs.max(1)),
            today: None,
        }
    }
}

fn parse_or<T>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: err.to_string(),
        }),
    }
}

/// Credentials taken from `PULSE_EMAIL` / `PULSE_PASSWORD`.
#[derive(Debug)]
pub struct EnvCredentialProvider {
    email: Option<String>,
    password: Option<SecretString>,
}

impl CredentialProvider for EnvCredentialProvider {
    fn credentials(&self) -> Result<Credentials, ConfigError> {
        let email = self
            .email
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or(ConfigError::Missing("PULSE_EMAIL"))?;
        let password = self
            .password
            .as_ref()
            .map(|p| p.expose_secret())
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::Missing("PULSE_PASSWORD"))?;
        Ok(Credentials::new(email, password))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    InvalidConfiguration(#[from] ConfigError),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("remote unavailable during authentication: {0}")]
    RemoteUnavailable(String),
    #[error("writer conflict: sync lease is held by {holder}")]
    WriterConflict { holder: String },
    #[error("store failure: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WriterConflict { holder } => Self::WriterConflict { holder },
            other => Self::Storage(other),
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> AbortKind {
        match self {
            Self::InvalidConfiguration(_) => AbortKind::InvalidConfiguration,
            Self::AuthenticationFailed(_) => AbortKind::AuthenticationFailed,
            Self::RemoteUnavailable(_) => AbortKind::RemoteUnavailable,
            Self::WriterConflict { .. } => AbortKind::WriterConflict,
            Self::Storage(_) => AbortKind::Storage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortKind {
    InvalidConfiguration,
    AuthenticationFailed,
    RemoteUnavailable,
    WriterConflict,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    PartialFailure,
    Aborted { kind: AbortKind, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    pub attempted: u32,
    pub succeeded: u32,
    pub no_data: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub unit: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub window: Option<DateWindow>,
    pub days: UnitCounts,
    pub activities: UnitCounts,
    pub failed_dates: Vec<FailedUnit>,
    pub failed_activities: Vec<FailedUnit>,
    pub activity_listing_error: Option<String>,
    pub status: RunStatus,
}

impl SyncRunReport {
    /// 0 on success and partial failure (2 with `strict`), 1 on any fatal abort.
    pub fn exit_code(&self, strict: bool) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::PartialFailure if strict => 2,
            RunStatus::PartialFailure => 0,
            RunStatus::Aborted { .. } => 1,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RunStatus::Aborted { .. })
    }
}

#[derive(Debug, Default)]
struct RunTally {
    window: Option<DateWindow>,
    days: UnitCounts,
    activities: UnitCounts,
    failed_dates: Vec<FailedUnit>,
    failed_activities: Vec<FailedUnit>,
    activity_listing_error: Option<String>,
}

impl RunTally {
    fn has_failures(&self) -> bool {
        self.days.failed > 0 || self.activities.failed > 0 || self.activity_listing_error.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub days_to_fetch: i64,
    pub source_tz: Tz,
    pub backoff: BackoffPolicy,
    pub lease_ttl: Duration,
    /// Pins "today" instead of reading the clock.
    pub today: Option<NaiveDate>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            days_to_fetch: 1,
            source_tz: Tz::UTC,
            backoff: BackoffPolicy::default(),
            lease_ttl: Duration::from_secs(900),
            today: None,
        }
    }
}

enum UnitOutcome<T> {
    Fetched(T),
    NoData,
    Failed(String),
}

pub struct SyncEngine {
    client: Arc<dyn RemoteClient>,
    credentials: Box<dyn CredentialProvider>,
    store: HealthStore,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        credentials: Box<dyn CredentialProvider>,
        store: HealthStore,
        options: SyncOptions,
    ) -> Self {
        Self {
            client,
            credentials,
            store,
            options,
        }
    }

    /// One full invocation. Fatal errors end up in the report as `Aborted`.
    pub async fn run(&self) -> SyncRunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut tally = RunTally::default();
        let span = info_span!("sync_run", %run_id, source = self.client.source_id());

        let outcome = self.run_inner(run_id, &mut tally).instrument(span).await;
        let status = match outcome {
            Ok(()) if tally.has_failures() => RunStatus::PartialFailure,
            Ok(()) => RunStatus::Succeeded,
            Err(err) => {
                error!(%run_id, kind = ?err.kind(), "sync aborted: {err}");
                RunStatus::Aborted {
                    kind: err.kind(),
                    reason: err.to_string(),
                }
            }
        };

        let report = SyncRunReport {
            run_id,
            source_id: self.client.source_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            window: tally.window,
            days: tally.days,
            activities: tally.activities,
            failed_dates: tally.failed_dates,
            failed_activities: tally.failed_activities,
            activity_listing_error: tally.activity_listing_error,
            status,
        };
        log_summary(&report);
        report
    }

    async fn run_inner(&self, run_id: Uuid, tally: &mut RunTally) -> Result<(), SyncError> {
        let today = self
            .options
            .today
            .unwrap_or_else(|| source_today(Utc::now(), self.options.source_tz));
        let window = DateWindow::plan(self.options.days_to_fetch, today)?;
        tally.window = Some(window);
        info!(%window, days = window.len(), "planned sync window");

        let credentials = self.credentials.credentials()?;
        let client = self.client.as_ref();
        let creds = &credentials;
        let session = self
            .with_retry("authenticate", move || client.authenticate(creds))
            .await
            .map_err(|err| match err {
                RemoteError::RemoteUnavailable(reason) => SyncError::RemoteUnavailable(reason),
                other => SyncError::AuthenticationFailed(other.to_string()),
            })?;
        drop(credentials);

        let holder = format!("pulse-sync:{}:{run_id}", std::process::id());
        let lease = self.store.acquire_writer(&holder, self.options.lease_ttl).await?;
        let outcome = self.sync_window(&session, &lease, window, tally).await;
        match self.store.release_writer(lease).await {
            Ok(()) => {}
            Err(err) if outcome.is_ok() => return Err(err.into()),
            Err(err) => warn!("releasing writer lease after abort failed: {err}"),
        }
        outcome
    }

    async fn sync_window(
        &self,
        session: &Session,
        lease: &WriterLease,
        window: DateWindow,
        tally: &mut RunTally,
    ) -> Result<(), SyncError> {
        let client = self.client.as_ref();

        for date in window.dates() {
            ensure_live(session)?;
            tally.days.attempted += 1;
            let fetched = self
                .with_retry("daily summary", move || client.fetch_daily_summary(session, date))
                .await;
            match unit_outcome(fetched)? {
                UnitOutcome::Fetched(summary) => {
                    self.store.upsert_daily_summary(lease, &summary).await?;
                    tally.days.succeeded += 1;
                    info!(%date, steps = summary.steps, "✓ {date}");
                }
                UnitOutcome::NoData => {
                    tally.days.no_data += 1;
                    info!(%date, "– {date}: no data");
                }
                UnitOutcome::Failed(reason) => {
                    tally.days.failed += 1;
                    warn!(%date, "✗ {date}: {reason}");
                    tally.failed_dates.push(FailedUnit {
                        unit: date.to_string(),
                        reason,
                    });
                }
            }
        }

        ensure_live(session)?;
        let listed = self
            .with_retry("activity list", move || client.fetch_activities(session, window))
            .await;
        let refs = match unit_outcome(listed)? {
            UnitOutcome::Fetched(listing) => {
                for entry in listing.rejected {
                    let unit = entry
                        .activity_id
                        .unwrap_or_else(|| "unidentified listing entry".to_string());
                    tally.activities.attempted += 1;
                    tally.activities.failed += 1;
                    warn!(activity_id = %unit, "✗ activity {unit}: {}", entry.reason);
                    tally.failed_activities.push(FailedUnit {
                        unit,
                        reason: entry.reason,
                    });
                }
                if listing.truncated {
                    let reason = format!(
                        "activity list truncated after {} entries; later activities were not synced",
                        listing.refs.len()
                    );
                    warn!(%window, "✗ activity list: {reason}");
                    tally.activity_listing_error = Some(reason);
                }
                listing.refs
            }
            UnitOutcome::NoData => Vec::new(),
            UnitOutcome::Failed(reason) => {
                warn!(%window, "✗ activity list: {reason}");
                tally.activity_listing_error = Some(reason);
                Vec::new()
            }
        };
        info!(count = refs.len(), "listed activities");

        for activity_ref in refs {
            ensure_live(session)?;
            tally.activities.attempted += 1;
            let id = activity_ref.activity_id.as_str();
            let fetched = self
                .with_retry("activity detail", move || client.fetch_activity_detail(session, id))
                .await;
            match unit_outcome(fetched)? {
                UnitOutcome::Fetched(detail) => {
                    self.store
                        .upsert_activity(lease, &detail.activity, &detail.samples)
                        .await?;
                    tally.activities.succeeded += 1;
                    info!(
                        activity_id = id,
                        sport = detail.activity.metrics.kind().as_str(),
                        samples = detail.samples.len(),
                        "✓ activity {id}"
                    );
                }
                UnitOutcome::NoData => {
                    tally.activities.no_data += 1;
                    info!(activity_id = id, "– activity {id}: no data");
                }
                UnitOutcome::Failed(reason) => {
                    tally.activities.failed += 1;
                    warn!(activity_id = id, "✗ activity {id}: {reason}");
                    tally.failed_activities.push(FailedUnit {
                        unit: id.to_string(),
                        reason,
                    });
                }
            }
        }

        Ok(())
    }

    /// Sequential retry of `RemoteUnavailable` with the configured backoff.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let backoff = self.options.backoff;
        let attempts = backoff.attempts();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = backoff.delay_for_attempt(attempt - 1);
                    warn!(attempt, max_attempts = attempts, ?delay, "{what}: {err}; retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// An expired session would only be rejected by the remote; stop before the call.
fn ensure_live(session: &Session) -> Result<(), SyncError> {
    if session.is_expired(Utc::now()) {
        return Err(SyncError::AuthenticationFailed(format!(
            "session expired at {}",
            session.expires_at().to_rfc3339()
        )));
    }
    Ok(())
}

/// Fold a per-unit remote result; only a rejected session escapes as fatal.
fn unit_outcome<T>(result: Result<T, RemoteError>) -> Result<UnitOutcome<T>, SyncError> {
    match result {
        Ok(value) => Ok(UnitOutcome::Fetched(value)),
        Err(RemoteError::NotFound(_)) => Ok(UnitOutcome::NoData),
        Err(RemoteError::AuthenticationFailed(reason)) => Err(SyncError::AuthenticationFailed(reason)),
        Err(err @ (RemoteError::RemoteUnavailable(_) | RemoteError::Malformed(_))) => {
            Ok(UnitOutcome::Failed(err.to_string()))
        }
    }
}

fn log_summary(report: &SyncRunReport) {
    let window = report
        .window
        .map(|w| w.to_string())
        .unwrap_or_else(|| "-".to_string());
    info!(
        run_id = %report.run_id,
        window = %window,
        days_attempted = report.days.attempted,
        days_succeeded = report.days.succeeded,
        days_no_data = report.days.no_data,
        days_failed = report.days.failed,
        activities_attempted = report.activities.attempted,
        activities_succeeded = report.activities.succeeded,
        activities_no_data = report.activities.no_data,
        activities_failed = report.activities.failed,
        elapsed_ms = report.elapsed_ms,
        status = ?report.status,
        "sync finished"
    );
}

pub fn build_remote_client(config: &SyncConfig) -> Result<Arc<dyn RemoteClient>> {
    match config.source_mode {
        SourceMode::Fixture => {
            let client = FixtureClient::from_path(&config.fixture_path)?;
            Ok(Arc::new(client))
        }
        SourceMode::Connect => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })
            .context("building http client")?;
            Ok(Arc::new(ConnectClient::new(http, config.api_base_url.clone())))
        }
    }
}

/// Result of `run_sync_once`: the run report plus where its files landed.
#[derive(Debug)]
pub struct SyncInvocation {
    pub report: SyncRunReport,
    pub reports_dir: PathBuf,
}

pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncInvocation> {
    let store = HealthStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;
    let client = build_remote_client(config)?;
    let engine = SyncEngine::new(
        client,
        Box::new(config.credential_provider()),
        store.clone(),
        config.sync_options(),
    );
    let report = engine.run().await;
    store.close().await;
    let reports_dir = write_run_report(&report, &config.reports_dir).await?;
    Ok(SyncInvocation {
        report,
        reports_dir,
    })
}

/// Write `sync_run.json` and `run_brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_run_report(report: &SyncRunReport, reports_root: &Path) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing sync run report")?;
    fs::write(reports_dir.join("sync_run.json"), json)
        .await
        .context("writing sync_run.json")?;
    fs::write(reports_dir.join("run_brief.md"), render_brief(report))
        .await
        .context("writing run_brief.md")?;
    Ok(reports_dir)
}

pub fn render_brief(report: &SyncRunReport) -> String {
    let status = match &report.status {
        RunStatus::Succeeded => "succeeded".to_string(),
        RunStatus::PartialFailure => "partial failure".to_string(),
        RunStatus::Aborted { kind, reason } => format!("aborted ({kind:?}): {reason}"),
    };
    let window = report
        .window
        .map(|w| w.to_string())
        .unwrap_or_else(|| "not planned".to_string());
    let counts = |c: &UnitCounts| {
        format!(
            "attempted {}, succeeded {}, no data {}, failed {}",
            c.attempted, c.succeeded, c.no_data, c.failed
        )
    };
    let failures = report
        .failed_dates
        .iter()
        .map(|f| format!("- date {}: {}", f.unit, f.reason))
        .chain(
            report
                .activity_listing_error
                .iter()
                .map(|reason| format!("- activity list: {reason}")),
        )
        .chain(
            report
                .failed_activities
                .iter()
                .map(|f| format!("- activity {}: {}", f.unit, f.reason)),
        )
        .collect::<Vec<_>>();

    format!(
        "# Pulse Sync Brief\n\n- Run ID: `{}`\n- Source: {}\n- Started: {}\n- Finished: {}\n- Elapsed: {} ms\n- Window: {}\n- Status: {}\n\n## Counts\n- Days: {}\n- Activities: {}\n\n## Failures\n{}\n",
        report.run_id,
        report.source_id,
        report.started_at,
        report.finished_at,
        report.elapsed_ms,
        window,
        status,
        counts(&report.days),
        counts(&report.activities),
        if failures.is_empty() {
            "- none".to_string()
        } else {
            failures.join("\n")
        }
    )
}

fn cell<T: Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Flat CSV of daily summaries, newest first. Dates without a record are simply absent.
pub fn render_csv(summaries: &[DailySummary]) -> String {
    let mut rows: Vec<&DailySummary> = summaries.iter().collect();
    rows.sort_by(|a, b| b.date.cmp(&a.date));

    let mut out = CSV_HEADERS.join(",");
    out.push_str("\r\n");
    for s in rows {
        let line = [
            s.date.format("%Y-%m-%d").to_string(),
            s.steps.to_string(),
            cell(s.distance_meters),
            cell(s.resting_heart_rate),
            cell(s.max_heart_rate),
            cell(s.sleep.as_ref().map(|sl| sl.total_seconds)),
            cell(s.sleep.as_ref().and_then(|sl| sl.score)),
            cell(s.body_battery.as_ref().and_then(|b| b.charged)),
            cell(s.respiration_rate),
            cell(s.spo2_average),
            cell(s.vo2_max),
        ]
        .join(",");
        out.push_str(&line);
        out.push_str("\r\n");
    }
    out
}

pub async fn export_csv(store: &HealthStore, window: DateWindow) -> Result<String> {
    let summaries = store
        .query_range(window.start, window.end)
        .await
        .with_context(|| format!("querying summaries for {window}"))?;
    Ok(render_csv(&summaries))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub window: DateWindow,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Snapshot the window into Parquet files plus a `manifest.json` of SHA-256 digests.
pub async fn export_parquet_snapshot(
    store: &HealthStore,
    window: DateWindow,
    out_dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let summaries = store
        .query_range(window.start, window.end)
        .await
        .context("querying daily summaries")?;
    let activities = store
        .query_activities(window.start, window.end)
        .await
        .context("querying activities")?;
    let mut samples = Vec::new();
    for activity in &activities {
        let trace = store
            .activity_samples(&activity.activity_id)
            .await
            .with_context(|| format!("querying samples for activity {}", activity.activity_id))?;
        samples.extend(trace.into_iter().map(|s| (activity.activity_id.clone(), s.offset_ms, s.bpm)));
    }

    let summaries_path = out_dir.join("daily_summaries.parquet");
    let activities_path = out_dir.join("activities.parquet");
    let samples_path = out_dir.join("activity_heart_rate.parquet");
    write_daily_summaries_parquet(&summaries_path, &summaries)?;
    write_activities_parquet(&activities_path, &activities)?;
    write_samples_parquet(&samples_path, &samples)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        window,
        files: vec![
            manifest_entry("daily_summaries", out_dir, &summaries_path, summaries.len())?,
            manifest_entry("activities", out_dir, &activities_path, activities.len())?,
            manifest_entry("activity_heart_rate", out_dir, &samples_path, samples.len())?,
        ],
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_daily_summaries_parquet(path: &Path, summaries: &[DailySummary]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("steps", DataType::UInt32, false),
        ArrowField::new("distance_meters", DataType::Float64, true),
        ArrowField::new("resting_heart_rate", DataType::UInt32, true),
        ArrowField::new("max_heart_rate", DataType::UInt32, true),
        ArrowField::new("sleep_total_seconds", DataType::UInt32, true),
        ArrowField::new("sleep_score", DataType::UInt32, true),
        ArrowField::new("body_battery_charged", DataType::UInt32, true),
        ArrowField::new("respiration_rate", DataType::Float64, true),
        ArrowField::new("spo2_average", DataType::Float64, true),
        ArrowField::new("vo2_max", DataType::Float64, true),
    ]));

    let dates = StringArray::from(
        summaries
            .iter()
            .map(|s| Some(s.date.to_string()))
            .collect::<Vec<_>>(),
    );
    let steps = UInt32Array::from(summaries.iter().map(|s| s.steps).collect::<Vec<_>>());
    let distance = Float64Array::from(summaries.iter().map(|s| s.distance_meters).collect::<Vec<_>>());
    let resting = UInt32Array::from(
        summaries
            .iter()
            .map(|s| s.resting_heart_rate.map(u32::from))
            .collect::<Vec<_>>(),
    );
    let max_hr = UInt32Array::from(
        summaries
            .iter()
            .map(|s| s.max_heart_rate.map(u32::from))
            .collect::<Vec<_>>(),
    );
    let sleep_total = UInt32Array::from(
        summaries
            .iter()
            .map(|s| s.sleep.as_ref().map(|sl| sl.total_seconds))
            .collect::<Vec<_>>(),
    );
    let sleep_score = UInt32Array::from(
        summaries
            .iter()
            .map(|s| s.sleep.as_ref().and_then(|sl| sl.score).map(u32::from))
            .collect::<Vec<_>>(),
    );
    let battery = UInt32Array::from(
        summaries
            .iter()
            .map(|s| s.body_battery.as_ref().and_then(|b| b.charged).map(u32::from))
            .collect::<Vec<_>>(),
    );
    let respiration = Float64Array::from(summaries.iter().map(|s| s.respiration_rate).collect::<Vec<_>>());
    let spo2 = Float64Array::from(summaries.iter().map(|s| s.spo2_average).collect::<Vec<_>>());
    let vo2 = Float64Array::from(summaries.iter().map(|s| s.vo2_max).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dates),
            Arc::new(steps),
            Arc::new(distance),
            Arc::new(resting),
            Arc::new(max_hr),
            Arc::new(sleep_total),
            Arc::new(sleep_score),
            Arc::new(battery),
            Arc::new(respiration),
            Arc::new(spo2),
            Arc::new(vo2),
        ],
    )
    .context("building daily_summaries record batch")?;
    write_parquet(path, batch)
}

fn write_activities_parquet(path: &Path, activities: &[Activity]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("activity_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, true),
        ArrowField::new("type_key", DataType::Utf8, false),
        ArrowField::new("sport_kind", DataType::Utf8, false),
        ArrowField::new("start_time_utc", DataType::Utf8, false),
        ArrowField::new("duration_seconds", DataType::Float64, false),
        ArrowField::new("distance_meters", DataType::Float64, true),
        ArrowField::new("average_heart_rate", DataType::UInt32, true),
        ArrowField::new("max_heart_rate", DataType::UInt32, true),
        ArrowField::new("calories", DataType::Float64, true),
        ArrowField::new("sport_metrics_json", DataType::Utf8, false),
    ]));

    let metrics = activities
        .iter()
        .map(|a| serde_json::to_string(&a.metrics))
        .collect::<Result<Vec<_>, _>>()
        .context("serializing sport metrics")?;

    let ids = StringArray::from(
        activities
            .iter()
            .map(|a| Some(a.activity_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let names = StringArray::from(activities.iter().map(|a| a.name.as_deref()).collect::<Vec<_>>());
    let type_keys = StringArray::from(
        activities
            .iter()
            .map(|a| Some(a.type_key.as_str()))
            .collect::<Vec<_>>(),
    );
    let kinds = StringArray::from(
        activities
            .iter()
            .map(|a| Some(a.metrics.kind().as_str()))
            .collect::<Vec<_>>(),
    );
    let starts = StringArray::from(
        activities
            .iter()
            .map(|a| Some(a.start_time_utc.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let durations = Float64Array::from(activities.iter().map(|a| a.duration_seconds).collect::<Vec<_>>());
    let distances = Float64Array::from(activities.iter().map(|a| a.distance_meters).collect::<Vec<_>>());
    let avg_hr = UInt32Array::from(
        activities
            .iter()
            .map(|a| a.average_heart_rate.map(u32::from))
            .collect::<Vec<_>>(),
    );
    let max_hr = UInt32Array::from(
        activities
            .iter()
            .map(|a| a.max_heart_rate.map(u32::from))
            .collect::<Vec<_>>(),
    );
    let calories = Float64Array::from(activities.iter().map(|a| a.calories).collect::<Vec<_>>());
    let metrics = StringArray::from(metrics.iter().map(|m| Some(m.as_str())).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(names),
            Arc::new(type_keys),
            Arc::new(kinds),
            Arc::new(starts),
            Arc::new(durations),
            Arc::new(distances),
            Arc::new(avg_hr),
            Arc::new(max_hr),
            Arc::new(calories),
            Arc::new(metrics),
        ],
    )
    .context("building activities record batch")?;
    write_parquet(path, batch)
}

fn write_samples_parquet(path: &Path, samples: &[(String, u32, u16)]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("activity_id", DataType::Utf8, false),
        ArrowField::new("offset_ms", DataType::UInt32, false),
        ArrowField::new("bpm", DataType::UInt32, false),
    ]));
    let ids = StringArray::from(
        samples
            .iter()
            .map(|(id, _, _)| Some(id.as_str()))
            .collect::<Vec<_>>(),
    );
    let offsets = UInt32Array::from(samples.iter().map(|(_, o, _)| *o).collect::<Vec<_>>());
    let bpms = UInt32Array::from(samples.iter().map(|(_, _, b)| u32::from(*b)).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(schema, vec![Arc::new(ids), Arc::new(offsets), Arc::new(bpms)])
        .context("building activity_heart_rate record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, root: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}
