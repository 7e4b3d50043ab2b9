//! SQLite health store + HTTP fetch utilities for Pulse.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use pulse_core::{
    Activity, ActivityDetail, BodyBattery, DailySummary, HeartRateSample, SleepSummary,
    SportMetrics,
};
use reqwest::StatusCode;
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "pulse-storage";

/// Bounded wait for a competing connection to release SQLite's write lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SAMPLE_INSERT_BATCH: usize = 200;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("writer conflict: sync lease is held by {holder}")]
    WriterConflict { holder: String },
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let busy = err
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| matches!(code.as_ref(), "5" | "6" | "517"));
        if busy {
            Self::WriterConflict {
                holder: "another connection (database is locked)".to_string(),
            }
        } else {
            Self::Database(err)
        }
    }
}

/// Proof that the caller is the single writer. Every upsert re-validates it.
#[derive(Debug)]
pub struct WriterLease {
    holder: String,
    ttl: Duration,
}

impl WriterLease {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX / 2)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub daily_summaries: u64,
    pub activities: u64,
    pub heart_rate_samples: u64,
}

/// Upsert-by-key store for daily summaries and activities.
///
/// Runs SQLite in WAL mode: each upsert is one transaction, so readers see
/// either the previous or the new complete value for a key and never block on
/// a writer beyond a single commit.
#[derive(Debug, Clone)]
pub struct HealthStore {
    pool: SqlitePool,
}

impl HealthStore {
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::open_with(options).await
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::open_with(options).await
    }

    async fn open_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Take the single-writer lease, reclaiming it if the previous holder let it expire.
    pub async fn acquire_writer(
        &self,
        holder: &str,
        ttl: Duration,
    ) -> Result<WriterLease, StoreError> {
        let lease = WriterLease {
            holder: holder.to_string(),
            ttl,
        };
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO sync_lease (id, holder, acquired_at, expires_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT (id) DO UPDATE
               SET holder = excluded.holder,
                   acquired_at = excluded.acquired_at,
                   expires_at = excluded.expires_at
             WHERE sync_lease.holder = excluded.holder
                OR sync_lease.expires_at <= ?2
            "#,
        )
        .bind(&lease.holder)
        .bind(now)
        .bind(now.saturating_add(lease.ttl_ms()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let mut conn = self.pool.acquire().await?;
            let holder = current_lease_holder(&mut conn)
                .await?
                .unwrap_or_else(|| "unknown".to_string());
            return Err(StoreError::WriterConflict { holder });
        }
        debug!(holder = %lease.holder, "acquired writer lease");
        Ok(lease)
    }

    pub async fn release_writer(&self, lease: WriterLease) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_lease WHERE id = 1 AND holder = ?")
            .bind(&lease.holder)
            .execute(&self.pool)
            .await?;
        debug!(holder = %lease.holder, "released writer lease");
        Ok(())
    }

    /// Insert or fully replace the summary for `summary.date`.
    pub async fn upsert_daily_summary(
        &self,
        lease: &WriterLease,
        summary: &DailySummary,
    ) -> Result<(), StoreError> {
        let sleep = summary.sleep.as_ref();
        let battery = summary.body_battery.as_ref();

        let mut tx = self.pool.begin().await?;
        renew_lease(&mut tx, lease).await?;
        sqlx::query(
            r#"
            INSERT INTO daily_summaries (
                date, steps, distance_meters, resting_heart_rate, average_heart_rate,
                max_heart_rate, sleep_total_seconds, sleep_deep_seconds, sleep_light_seconds,
                sleep_rem_seconds, sleep_awake_seconds, sleep_score, body_battery_charged,
                body_battery_drained, body_battery_highest, body_battery_lowest,
                respiration_rate, spo2_average, vo2_max
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (date) DO UPDATE SET
                steps = excluded.steps,
                distance_meters = excluded.distance_meters,
                resting_heart_rate = excluded.resting_heart_rate,
                average_heart_rate = excluded.average_heart_rate,
                max_heart_rate = excluded.max_heart_rate,
                sleep_total_seconds = excluded.sleep_total_seconds,
                sleep_deep_seconds = excluded.sleep_deep_seconds,
                sleep_light_seconds = excluded.sleep_light_seconds,
                sleep_rem_seconds = excluded.sleep_rem_seconds,
                sleep_awake_seconds = excluded.sleep_awake_seconds,
                sleep_score = excluded.sleep_score,
                body_battery_charged = excluded.body_battery_charged,
                body_battery_drained = excluded.body_battery_drained,
                body_battery_highest = excluded.body_battery_highest,
                body_battery_lowest = excluded.body_battery_lowest,
                respiration_rate = excluded.respiration_rate,
                spo2_average = excluded.spo2_average,
                vo2_max = excluded.vo2_max
            "#,
        )
        .bind(summary.date)
        .bind(i64::from(summary.steps))
        .bind(summary.distance_meters)
        .bind(summary.resting_heart_rate.map(i64::from))
        .bind(summary.average_heart_rate.map(i64::from))
        .bind(summary.max_heart_rate.map(i64::from))
        .bind(sleep.map(|s| i64::from(s.total_seconds)))
        .bind(sleep.and_then(|s| s.deep_seconds).map(i64::from))
        .bind(sleep.and_then(|s| s.light_seconds).map(i64::from))
        .bind(sleep.and_then(|s| s.rem_seconds).map(i64::from))
        .bind(sleep.and_then(|s| s.awake_seconds).map(i64::from))
        .bind(sleep.and_then(|s| s.score).map(i64::from))
        .bind(battery.and_then(|b| b.charged).map(i64::from))
        .bind(battery.and_then(|b| b.drained).map(i64::from))
        .bind(battery.and_then(|b| b.highest).map(i64::from))
        .bind(battery.and_then(|b| b.lowest).map(i64::from))
        .bind(summary.respiration_rate)
        .bind(summary.spo2_average)
        .bind(summary.vo2_max)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace an activity row and its whole heart-rate trace in one transaction.
    pub async fn upsert_activity(
        &self,
        lease: &WriterLease,
        activity: &Activity,
        samples: &[HeartRateSample],
    ) -> Result<(), StoreError> {
        let metrics_json = serde_json::to_string(&activity.metrics)?;
        let span = info_span!("upsert_activity", activity_id = %activity.activity_id, samples = samples.len());

        async {
            let mut tx = self.pool.begin().await?;
            renew_lease(&mut tx, lease).await?;
            sqlx::query(
                r#"
                INSERT INTO activities (
                    activity_id, name, type_key, sport_kind, start_time_utc, start_time_local,
                    start_date_local, duration_seconds, distance_meters, average_heart_rate,
                    max_heart_rate, calories, average_speed, max_speed, elevation_gain,
                    elevation_loss, sport_metrics_json
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (activity_id) DO UPDATE SET
                    name = excluded.name,
                    type_key = excluded.type_key,
                    sport_kind = excluded.sport_kind,
                    start_time_utc = excluded.start_time_utc,
                    start_time_local = excluded.start_time_local,
                    start_date_local = excluded.start_date_local,
                    duration_seconds = excluded.duration_seconds,
                    distance_meters = excluded.distance_meters,
                    average_heart_rate = excluded.average_heart_rate,
                    max_heart_rate = excluded.max_heart_rate,
                    calories = excluded.calories,
                    average_speed = excluded.average_speed,
                    max_speed = excluded.max_speed,
                    elevation_gain = excluded.elevation_gain,
                    elevation_loss = excluded.elevation_loss,
                    sport_metrics_json = excluded.sport_metrics_json
                "#,
            )
            .bind(&activity.activity_id)
            .bind(&activity.name)
            .bind(&activity.type_key)
            .bind(activity.metrics.kind().as_str())
            .bind(activity.start_time_utc)
            .bind(activity.start_time_local)
            .bind(activity.start_time_local.date())
            .bind(activity.duration_seconds)
            .bind(activity.distance_meters)
            .bind(activity.average_heart_rate.map(i64::from))
            .bind(activity.max_heart_rate.map(i64::from))
            .bind(activity.calories)
            .bind(activity.average_speed)
            .bind(activity.max_speed)
            .bind(activity.elevation_gain)
            .bind(activity.elevation_loss)
            .bind(&metrics_json)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM activity_heart_rate WHERE activity_id = ?")
                .bind(&activity.activity_id)
                .execute(&mut *tx)
                .await?;

            for (chunk_no, chunk) in samples.chunks(SAMPLE_INSERT_BATCH).enumerate() {
                let base = chunk_no * SAMPLE_INSERT_BATCH;
                let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "INSERT INTO activity_heart_rate (activity_id, seq, offset_ms, bpm) ",
                );
                builder.push_values(chunk.iter().enumerate(), |mut row, (idx, sample)| {
                    row.push_bind(activity.activity_id.clone())
                        .push_bind(i64::try_from(base + idx).unwrap_or(i64::MAX))
                        .push_bind(i64::from(sample.offset_ms))
                        .push_bind(i64::from(sample.bpm));
                });
                builder.build().execute(&mut *tx).await?;
            }

            tx.commit().await?;
            Ok::<(), StoreError>(())
        }
        .instrument(span)
        .await
    }

    /// Summaries with `start <= date <= end`, ascending by date. Missing days are gaps.
    pub async fn query_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailySummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM daily_summaries
             WHERE date >= ? AND date <= ?
             ORDER BY date ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(daily_summary_from_row).collect()
    }

    /// Activities whose local start date falls in `start..=end`, ascending by start time.
    pub async fn query_activities(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Activity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM activities
             WHERE start_date_local >= ? AND start_date_local <= ?
             ORDER BY start_time_utc ASC, activity_id ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }

    pub async fn recent_activities(&self, limit: u32) -> Result<Vec<Activity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM activities
             ORDER BY start_time_utc DESC, activity_id DESC
             LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }

    pub async fn activity_samples(
        &self,
        activity_id: &str,
    ) -> Result<Vec<HeartRateSample>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT offset_ms, bpm
              FROM activity_heart_rate
             WHERE activity_id = ?
             ORDER BY seq ASC
            "#,
        )
        .bind(activity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sample_from_row).collect()
    }

    /// Activity row and trace read from one snapshot.
    pub async fn activity_detail(
        &self,
        activity_id: &str,
    ) -> Result<Option<ActivityDetail>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM activities WHERE activity_id = ?")
            .bind(activity_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let activity = activity_from_row(&row)?;
        let samples = sqlx::query(
            "SELECT offset_ms, bpm FROM activity_heart_rate WHERE activity_id = ? ORDER BY seq ASC",
        )
        .bind(activity_id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(sample_from_row)
        .collect::<Result<Vec<_>, _>>()?;
        tx.commit().await?;
        Ok(Some(ActivityDetail { activity, samples }))
    }

    pub async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM daily_summaries) AS daily_summaries,
                   (SELECT COUNT(*) FROM activities) AS activities,
                   (SELECT COUNT(*) FROM activity_heart_rate) AS heart_rate_samples
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreCounts {
            daily_summaries: count_column(&row, "daily_summaries")?,
            activities: count_column(&row, "activities")?,
            heart_rate_samples: count_column(&row, "heart_rate_samples")?,
        })
    }
}

async fn renew_lease(conn: &mut SqliteConnection, lease: &WriterLease) -> Result<(), StoreError> {
    let expires_at = Utc::now().timestamp_millis().saturating_add(lease.ttl_ms());
    let result = sqlx::query("UPDATE sync_lease SET expires_at = ? WHERE id = 1 AND holder = ?")
        .bind(expires_at)
        .bind(&lease.holder)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        let holder = current_lease_holder(conn)
            .await?
            .unwrap_or_else(|| "nobody (lease was released)".to_string());
        return Err(StoreError::WriterConflict { holder });
    }
    Ok(())
}

async fn current_lease_holder(conn: &mut SqliteConnection) -> Result<Option<String>, StoreError> {
    let holder = sqlx::query_scalar::<_, String>("SELECT holder FROM sync_lease WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?;
    Ok(holder)
}

fn count_column(row: &SqliteRow, column: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    Ok(u64::try_from(value).unwrap_or(0))
}

fn narrow<T: TryFrom<i64>>(
    value: Option<i64>,
    table: &'static str,
    column: &str,
) -> Result<Option<T>, StoreError> {
    value
        .map(|v| {
            T::try_from(v).map_err(|_| StoreError::CorruptRow {
                table,
                reason: format!("{column}={v} out of range"),
            })
        })
        .transpose()
}

fn daily_summary_from_row(row: &SqliteRow) -> Result<DailySummary, StoreError> {
    const TABLE: &str = "daily_summaries";
    let opt = |column: &str| -> Result<Option<i64>, StoreError> { Ok(row.try_get(column)?) };

    let sleep = match narrow::<u32>(opt("sleep_total_seconds")?, TABLE, "sleep_total_seconds")? {
        Some(total_seconds) => Some(SleepSummary {
            total_seconds,
            deep_seconds: narrow(opt("sleep_deep_seconds")?, TABLE, "sleep_deep_seconds")?,
            light_seconds: narrow(opt("sleep_light_seconds")?, TABLE, "sleep_light_seconds")?,
            rem_seconds: narrow(opt("sleep_rem_seconds")?, TABLE, "sleep_rem_seconds")?,
            awake_seconds: narrow(opt("sleep_awake_seconds")?, TABLE, "sleep_awake_seconds")?,
            score: narrow(opt("sleep_score")?, TABLE, "sleep_score")?,
        }),
        None => None,
    };

    let battery = BodyBattery {
        charged: narrow(opt("body_battery_charged")?, TABLE, "body_battery_charged")?,
        drained: narrow(opt("body_battery_drained")?, TABLE, "body_battery_drained")?,
        highest: narrow(opt("body_battery_highest")?, TABLE, "body_battery_highest")?,
        lowest: narrow(opt("body_battery_lowest")?, TABLE, "body_battery_lowest")?,
    };
    let body_battery = (battery != BodyBattery::default()).then_some(battery);

    let steps: i64 = row.try_get("steps")?;
    Ok(DailySummary {
        date: row.try_get("date")?,
        steps: narrow(Some(steps), TABLE, "steps")?.unwrap_or_default(),
        distance_meters: row.try_get("distance_meters")?,
        resting_heart_rate: narrow(opt("resting_heart_rate")?, TABLE, "resting_heart_rate")?,
        average_heart_rate: narrow(opt("average_heart_rate")?, TABLE, "average_heart_rate")?,
        max_heart_rate: narrow(opt("max_heart_rate")?, TABLE, "max_heart_rate")?,
        sleep,
        body_battery,
        respiration_rate: row.try_get("respiration_rate")?,
        spo2_average: row.try_get("spo2_average")?,
        vo2_max: row.try_get("vo2_max")?,
    })
}

fn activity_from_row(row: &SqliteRow) -> Result<Activity, StoreError> {
    const TABLE: &str = "activities";
    let metrics_json: String = row.try_get("sport_metrics_json")?;
    let metrics: SportMetrics = serde_json::from_str(&metrics_json)?;
    Ok(Activity {
        activity_id: row.try_get("activity_id")?,
        name: row.try_get("name")?,
        type_key: row.try_get("type_key")?,
        start_time_utc: row.try_get("start_time_utc")?,
        start_time_local: row.try_get("start_time_local")?,
        duration_seconds: row.try_get("duration_seconds")?,
        distance_meters: row.try_get("distance_meters")?,
        average_heart_rate: narrow(row.try_get("average_heart_rate")?, TABLE, "average_heart_rate")?,
        max_heart_rate: narrow(row.try_get("max_heart_rate")?, TABLE, "max_heart_rate")?,
        calories: row.try_get("calories")?,
        average_speed: row.try_get("average_speed")?,
        max_speed: row.try_get("max_speed")?,
        elevation_gain: row.try_get("elevation_gain")?,
        elevation_loss: row.try_get("elevation_loss")?,
        metrics,
    })
}

fn sample_from_row(row: &SqliteRow) -> Result<HeartRateSample, StoreError> {
    const TABLE: &str = "activity_heart_rate";
    let offset_ms: i64 = row.try_get("offset_ms")?;
    let bpm: i64 = row.try_get("bpm")?;
    Ok(HeartRateSample {
        offset_ms: narrow(Some(offset_ms), TABLE, "offset_ms")?.unwrap_or_default(),
        bpm: narrow(Some(bpm), TABLE, "bpm")?.unwrap_or_default(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff: `max_attempts` total tries, delays
/// `base_delay * 2^n` capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt_index` (0 = first retry).
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            token_bucket: Some(TokenBucketConfig {
                capacity: 4,
                refill_every: Duration::from_millis(500),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request pacer keeping calls under the remote rate limit.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills =
                    u32::try_from(elapsed.as_millis() / self.refill_every.as_millis()).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::HttpStatus { status, .. } => Some(*status),
        }
    }
}

/// Paced JSON-over-HTTP client. Performs exactly one attempt per call; retry
/// decisions belong to the caller.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<SimpleTokenBucket>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        let token_bucket = config
            .token_bucket
            .map(|c| SimpleTokenBucket::new(c.capacity, c.refill_every));

        Ok(Self {
            client,
            token_bucket,
        })
    }

    pub async fn get(
        &self,
        url: &str,
        bearer: Option<&str>,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.send(url, request).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.post(url).json(body);
        self.send(url, request).await
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", url);
        async {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                debug!(status = status.as_u16(), "non-success response");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
