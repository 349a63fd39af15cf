use crate::pricing::{compute_cost, pricing_for};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use troupe_core::{TroupeError, TroupeResult};
use uuid::Uuid;

/// One immutable row in the usage log. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Row identifier.
    pub id: Uuid,
    /// Agent label the call is attributed to (a worker name, or
    /// `"router"` for dispatch decisions).
    pub agent: String,
    /// Model identifier the call went to.
    pub model: String,
    /// Input tokens consumed.
    pub tokens_in: u64,
    /// Output tokens produced.
    pub tokens_out: u64,
    /// Computed price in USD, rounded to 6 decimal places.
    pub cost_usd: f64,
    /// Wall-clock latency of the call.
    pub latency_ms: u64,
    /// Conversation thread, when known.
    pub thread_id: Option<Uuid>,
    /// Insert timestamp.
    pub created_at: DateTime<Utc>,
}

/// Query filter over the usage log. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    /// Inclusive lower bound on `created_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub until: Option<DateTime<Utc>>,
    /// Restrict to one agent label.
    pub agent: Option<String>,
    /// Restrict to one model.
    pub model: Option<String>,
    /// Restrict to one thread.
    pub thread_id: Option<Uuid>,
}

impl UsageFilter {
    /// A filter covering one UTC calendar day.
    pub fn for_day(date: NaiveDate) -> Self {
        let start = date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        Self {
            since: start,
            until: start.map(|s| s + Duration::days(1)),
            ..Self::default()
        }
    }

    fn matches(&self, record: &UsageRecord) -> bool {
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.created_at >= until {
                return false;
            }
        }
        if let Some(ref agent) = self.agent {
            if &record.agent != agent {
                return false;
            }
        }
        if let Some(ref model) = self.model {
            if &record.model != model {
                return false;
            }
        }
        if let Some(thread_id) = self.thread_id {
            if record.thread_id != Some(thread_id) {
                return false;
            }
        }
        true
    }
}

/// Storage seam for the usage log.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Appends a record.
    async fn insert(&self, record: &UsageRecord) -> TroupeResult<()>;
    /// Returns records matching the filter, oldest first.
    async fn query(&self, filter: &UsageFilter) -> TroupeResult<Vec<UsageRecord>>;
}

/// In-memory usage store for tests and short-lived runs.
#[derive(Default)]
pub struct InMemoryUsageStore {
    rows: RwLock<Vec<UsageRecord>>,
}

impl InMemoryUsageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn insert(&self, record: &UsageRecord) -> TroupeResult<()> {
        self.rows.write().await.push(record.clone());
        Ok(())
    }

    async fn query(&self, filter: &UsageFilter) -> TroupeResult<Vec<UsageRecord>> {
        let rows = self.rows.read().await;
        Ok(rows.iter().filter(|r| filter.matches(r)).cloned().collect())
    }
}

/// SQLite-backed durable usage store.
///
/// rusqlite is synchronous; the connection sits behind a `parking_lot`
/// mutex and no await happens while it is held.
pub struct SqliteUsageStore {
    conn: Mutex<Connection>,
}

impl SqliteUsageStore {
    /// Opens (or creates) the database at `path` and ensures the schema.
    pub fn open(path: &Path) -> TroupeResult<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS usage_records (
                id TEXT PRIMARY KEY,
                agent TEXT NOT NULL,
                model TEXT NOT NULL,
                tokens_in INTEGER NOT NULL,
                tokens_out INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                latency_ms INTEGER NOT NULL,
                thread_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_created_at
                ON usage_records (created_at);",
        )
        .map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn storage_err(e: rusqlite::Error) -> TroupeError {
    TroupeError::Storage(e.to_string())
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn insert(&self, record: &UsageRecord) -> TroupeResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO usage_records
             (id, agent, model, tokens_in, tokens_out, cost_usd, latency_ms, thread_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                record.id.to_string(),
                record.agent,
                record.model,
                record.tokens_in as i64,
                record.tokens_out as i64,
                record.cost_usd,
                record.latency_ms as i64,
                record.thread_id.map(|t| t.to_string()),
                record.created_at.to_rfc3339(),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    async fn query(&self, filter: &UsageFilter) -> TroupeResult<Vec<UsageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, agent, model, tokens_in, tokens_out, cost_usd, latency_ms, thread_id, created_at FROM usage_records ORDER BY created_at ASC")
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .map_err(storage_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, agent, model, tokens_in, tokens_out, cost_usd, latency_ms, thread, created) =
                row.map_err(storage_err)?;
            let record = UsageRecord {
                id: Uuid::parse_str(&id)
                    .map_err(|e| TroupeError::Storage(format!("bad row id: {e}")))?,
                agent,
                model,
                tokens_in: tokens_in as u64,
                tokens_out: tokens_out as u64,
                cost_usd,
                latency_ms: latency_ms as u64,
                thread_id: match thread {
                    Some(t) => Some(
                        Uuid::parse_str(&t)
                            .map_err(|e| TroupeError::Storage(format!("bad thread id: {e}")))?,
                    ),
                    None => None,
                },
                created_at: DateTime::parse_from_rfc3339(&created)
                    .map_err(|e| TroupeError::Storage(format!("bad timestamp: {e}")))?
                    .with_timezone(&Utc),
            };
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Per-agent cost aggregate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentCost {
    /// Total spend in USD.
    pub cost_usd: f64,
    /// Number of calls.
    pub calls: u64,
    /// Input tokens.
    pub tokens_in: u64,
    /// Output tokens.
    pub tokens_out: u64,
}

/// Aggregate view over a period.
#[derive(Debug, Clone, Serialize)]
pub struct CostSummary {
    /// Total spend in USD.
    pub total_cost_usd: f64,
    /// Total calls.
    pub total_calls: u64,
    /// Total input tokens.
    pub total_tokens_in: u64,
    /// Total output tokens.
    pub total_tokens_out: u64,
    /// Spend keyed by agent label.
    pub by_agent: HashMap<String, f64>,
    /// Spend keyed by model.
    pub by_model: HashMap<String, f64>,
    /// Spend keyed by ISO date, ordered.
    pub by_day: BTreeMap<String, f64>,
}

/// Spend trend over the analyzed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    /// Second-half average daily cost more than 5% above the first half.
    Increasing,
    /// More than 5% below.
    Decreasing,
    /// Within ±5%.
    Stable,
}

/// Cost projection derived from recent history.
#[derive(Debug, Clone, Serialize)]
pub struct CostProjection {
    /// Average daily spend over the analyzed window.
    pub daily_average_usd: f64,
    /// Daily average extrapolated to 30 days.
    pub projected_monthly_usd: f64,
    /// Direction of spend between window halves.
    pub trend: Trend,
}

/// Durable log of every inference call's token counts and price, plus
/// budget and aggregate-cost queries over it.
///
/// Shared across all conversations; the store implementation provides the
/// synchronization.
pub struct CostLedger {
    store: Arc<dyn UsageStore>,
    daily_budget_usd: f64,
}

impl CostLedger {
    /// Creates a ledger over the given store with a daily budget ceiling.
    pub fn new(store: Arc<dyn UsageStore>, daily_budget_usd: f64) -> Self {
        Self {
            store,
            daily_budget_usd,
        }
    }

    /// The configured daily ceiling in USD.
    pub fn daily_budget_usd(&self) -> f64 {
        self.daily_budget_usd
    }

    /// Prices and logs one inference call. Returns the inserted record.
    pub async fn log_usage(
        &self,
        agent: &str,
        model: &str,
        tokens_in: u64,
        tokens_out: u64,
        latency_ms: u64,
        thread_id: Option<Uuid>,
    ) -> TroupeResult<UsageRecord> {
        let pricing = pricing_for(model);
        let record = UsageRecord {
            id: Uuid::new_v4(),
            agent: agent.to_string(),
            model: model.to_string(),
            tokens_in,
            tokens_out,
            cost_usd: compute_cost(tokens_in, tokens_out, &pricing),
            latency_ms,
            thread_id,
            created_at: Utc::now(),
        };
        self.store.insert(&record).await?;
        debug!(
            agent,
            model,
            cost_usd = record.cost_usd,
            latency_ms,
            "Usage logged"
        );
        Ok(record)
    }

    /// Total spend on one UTC calendar day.
    pub async fn daily_cost(&self, date: NaiveDate) -> TroupeResult<f64> {
        let records = self.store.query(&UsageFilter::for_day(date)).await?;
        Ok(records.iter().map(|r| r.cost_usd).sum())
    }

    /// Fails fast with [`TroupeError::BudgetExceeded`] when today's spend
    /// has reached the daily ceiling.
    ///
    /// A storage failure during the check fails OPEN: the call is allowed
    /// rather than blocking all traffic on a broken ledger.
    pub async fn check_budget(&self) -> TroupeResult<()> {
        let today = Utc::now().date_naive();
        let spent = match self.daily_cost(today).await {
            Ok(spent) => spent,
            Err(e) => {
                warn!(error = %e, "Budget check failed, allowing call (fail-open)");
                return Ok(());
            }
        };
        if spent >= self.daily_budget_usd {
            return Err(TroupeError::BudgetExceeded {
                spent_usd: spent,
                limit_usd: self.daily_budget_usd,
            });
        }
        Ok(())
    }

    /// Per-agent aggregates over a time range.
    pub async fn agent_costs(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> TroupeResult<HashMap<String, AgentCost>> {
        let records = self
            .store
            .query(&UsageFilter {
                since: Some(since),
                until: Some(until),
                ..UsageFilter::default()
            })
            .await?;

        let mut by_agent: HashMap<String, AgentCost> = HashMap::new();
        for record in &records {
            let entry = by_agent.entry(record.agent.clone()).or_default();
            entry.cost_usd += record.cost_usd;
            entry.calls += 1;
            entry.tokens_in += record.tokens_in;
            entry.tokens_out += record.tokens_out;
        }
        Ok(by_agent)
    }

    /// Full aggregate view over a time range.
    pub async fn cost_summary(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> TroupeResult<CostSummary> {
        let records = self
            .store
            .query(&UsageFilter {
                since: Some(since),
                until: Some(until),
                ..UsageFilter::default()
            })
            .await?;

        let mut summary = CostSummary {
            total_cost_usd: 0.0,
            total_calls: 0,
            total_tokens_in: 0,
            total_tokens_out: 0,
            by_agent: HashMap::new(),
            by_model: HashMap::new(),
            by_day: BTreeMap::new(),
        };
        for record in &records {
            summary.total_cost_usd += record.cost_usd;
            summary.total_calls += 1;
            summary.total_tokens_in += record.tokens_in;
            summary.total_tokens_out += record.tokens_out;
            *summary
                .by_agent
                .entry(record.agent.clone())
                .or_default() += record.cost_usd;
            *summary.by_model.entry(record.model.clone()).or_default() += record.cost_usd;
            *summary
                .by_day
                .entry(record.created_at.date_naive().to_string())
                .or_default() += record.cost_usd;
        }
        Ok(summary)
    }

    /// Projects spend from the last `days_to_analyze` days.
    ///
    /// The window is split into two halves and their average daily costs
    /// compared: more than 5% up is increasing, more than 5% down is
    /// decreasing, anything else is stable.
    pub async fn cost_projection(&self, days_to_analyze: u32) -> TroupeResult<CostProjection> {
        let days = days_to_analyze.max(2);
        let today = Utc::now().date_naive();
        let start = today - Duration::days(i64::from(days) - 1);
        let since = start
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .ok_or_else(|| TroupeError::Storage("invalid window start".to_string()))?;

        let records = self
            .store
            .query(&UsageFilter {
                since: Some(since),
                ..UsageFilter::default()
            })
            .await?;

        // Daily totals over the whole window, zero-filled for quiet days.
        let mut daily: Vec<f64> = vec![0.0; days as usize];
        for record in &records {
            let offset = (record.created_at.date_naive().num_days_from_ce()
                - start.num_days_from_ce()) as isize;
            if offset >= 0 && (offset as usize) < daily.len() {
                daily[offset as usize] += record.cost_usd;
            }
        }

        let total: f64 = daily.iter().sum();
        let daily_average = total / daily.len() as f64;

        let mid = daily.len() / 2;
        let first: f64 = daily[..mid].iter().sum::<f64>() / mid.max(1) as f64;
        let second: f64 = daily[mid..].iter().sum::<f64>() / (daily.len() - mid).max(1) as f64;

        let trend = if first == 0.0 {
            if second > 0.0 {
                Trend::Increasing
            } else {
                Trend::Stable
            }
        } else {
            let change = (second - first) / first;
            if change > 0.05 {
                Trend::Increasing
            } else if change < -0.05 {
                Trend::Decreasing
            } else {
                Trend::Stable
            }
        };

        Ok(CostProjection {
            daily_average_usd: daily_average,
            projected_monthly_usd: daily_average * 30.0,
            trend,
        })
    }
}
