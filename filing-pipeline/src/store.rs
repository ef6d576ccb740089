use crate::types::{
    Admission, FilingQuery, FilingRef, FilingSummaryRow, PipelineError, QueueItem, QueueStats, QueueStatus, Result,
    SeenRecord, Signal,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const QUEUE_COLUMNS: &str =
    "id, adsh, form, cik, company_name, filing_date, document_urls, enqueued_ts, status, attempts, last_error, updated_ts";

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: i64,
    adsh: String,
    form: String,
    cik: String,
    company_name: Option<String>,
    filing_date: Option<NaiveDate>,
    document_urls: String,
    enqueued_ts: DateTime<Utc>,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    updated_ts: DateTime<Utc>,
}

impl TryFrom<QueueRow> for QueueItem {
    type Error = PipelineError;

    fn try_from(row: QueueRow) -> Result<Self> {
        Ok(QueueItem {
            sequence_id: row.id,
            filing: FilingRef {
                accession: row.adsh,
                company_id: row.cik,
                company_name: row.company_name,
                form_type: row.form,
                filing_date: row.filing_date,
                document_urls: serde_json::from_str(&row.document_urls)?,
            },
            enqueued_at: row.enqueued_ts,
            status: row.status.parse()?,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            updated_at: row.updated_ts,
        })
    }
}

fn into_items(rows: Vec<QueueRow>) -> Result<Vec<QueueItem>> {
    rows.into_iter().map(QueueItem::try_from).collect()
}

async fn insert_queue_row(conn: &mut SqliteConnection, filing: &FilingRef, now: DateTime<Utc>) -> Result<i64> {
    let document_urls = serde_json::to_string(&filing.document_urls)?;

    let result = sqlx::query(
        r#"
        INSERT INTO dispatch_queue (adsh, form, cik, company_name, filing_date, document_urls, enqueued_ts, status, attempts, updated_ts)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?)
        "#,
    )
    .bind(&filing.accession)
    .bind(&filing.form_type)
    .bind(&filing.company_id)
    .bind(&filing.company_name)
    .bind(filing.filing_date)
    .bind(document_urls)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(PipelineError::DuplicateKey {
            accession: filing.accession.clone(),
        }),
        Err(e) => Err(e.into()),
    }
}

async fn insert_seen_row(conn: &mut SqliteConnection, accession: &str, at: DateTime<Utc>) -> Result<()> {
    let result = sqlx::query("INSERT INTO adsh_seen (adsh, first_seen_ts) VALUES (?, ?)")
        .bind(accession)
        .bind(at)
        .execute(&mut *conn)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(PipelineError::DuplicateKey {
            accession: accession.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Durable dedup set, dispatch queue and signal table in one SQLite file.
///
/// This is the single point of coordination between the poller and the
/// coordinator workers; nothing authoritative is cached in memory.
///
/// Every open store gets its own claim owner id. Claims taken through it can
/// only be settled through it (or a clone), and recovery never touches them.
#[derive(Clone)]
pub struct FilingStore {
    pool: SqlitePool,
    owner: String,
}

impl FilingStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let owner = Uuid::new_v4().to_string();
        info!("Opened filing store at {} as claim owner {}", path.as_ref().display(), owner);
        Ok(Self { pool, owner })
    }

    /// Claim owner id recorded on every item this store dequeues
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Closed filing store");
    }

    // --- dedup set ---

    pub async fn has_seen(&self, accession: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM adsh_seen WHERE adsh = ?")
            .bind(accession)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Fails with `DuplicateKey` if the accession is already present.
    pub async fn mark_seen(&self, accession: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_seen_row(&mut conn, accession, at).await
    }

    pub async fn seen_record(&self, accession: &str) -> Result<Option<SeenRecord>> {
        let row = sqlx::query_as::<_, (String, DateTime<Utc>)>("SELECT adsh, first_seen_ts FROM adsh_seen WHERE adsh = ?")
            .bind(accession)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(accession, first_seen_at)| SeenRecord { accession, first_seen_at }))
    }

    // --- dispatch queue ---

    pub async fn enqueue(&self, filing: &FilingRef, now: DateTime<Utc>) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_queue_row(&mut conn, filing, now).await
    }

    /// Enqueue a filing and mark it seen as one transaction.
    ///
    /// Either both rows exist afterwards or neither does. A duplicate on
    /// either side rolls the whole unit back and reports `AlreadySeen`.
    pub async fn admit(&self, filing: &FilingRef, now: DateTime<Utc>) -> Result<Admission> {
        let mut tx = self.pool.begin().await?;

        let sequence_id = match insert_queue_row(&mut tx, filing, now).await {
            Ok(id) => id,
            Err(PipelineError::DuplicateKey { .. }) => {
                warn!("Accession {} already queued, skipping", filing.accession);
                tx.rollback().await?;
                return Ok(Admission::AlreadySeen);
            }
            Err(e) => return Err(e),
        };

        match insert_seen_row(&mut tx, &filing.accession, now).await {
            Ok(()) => {}
            Err(PipelineError::DuplicateKey { .. }) => {
                debug!("Accession {} marked seen concurrently, rolling back enqueue", filing.accession);
                tx.rollback().await?;
                return Ok(Admission::AlreadySeen);
            }
            Err(e) => return Err(e),
        }

        tx.commit().await?;
        Ok(Admission::Queued(sequence_id))
    }

    /// Claim up to `max_n` pending items, oldest first.
    ///
    /// The claim is one UPDATE statement, so two concurrent callers can
    /// never receive the same sequence id. Items requeued with a delay are
    /// skipped until their not-before time has passed.
    pub async fn dequeue_batch(&self, max_n: usize) -> Result<Vec<QueueItem>> {
        if max_n == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            UPDATE dispatch_queue
            SET status = 'in_progress', claim_owner = ?, claimed_ts = ?, not_before_ts = NULL, updated_ts = ?
            WHERE status = 'pending'
              AND id IN (
                  SELECT id FROM dispatch_queue
                  WHERE status = 'pending' AND (not_before_ts IS NULL OR not_before_ts <= ?)
                  ORDER BY id LIMIT ?
              )
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        );

        let now = Utc::now();
        let rows = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(&self.owner)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(max_n as i64)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING gives no ordering guarantee
        let mut items = into_items(rows)?;
        items.sort_by_key(|item| item.sequence_id);
        Ok(items)
    }

    /// Refresh the claim time of an item this store holds, confirming the
    /// claim is still ours before work on it starts.
    pub async fn renew_claim(&self, sequence_id: i64) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE dispatch_queue SET claimed_ts = ?, updated_ts = ?
            WHERE id = ? AND status = 'in_progress' AND claim_owner = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(sequence_id)
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotClaimed { sequence_id });
        }
        Ok(())
    }

    pub async fn mark_done(&self, sequence_id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_queue SET status = 'done', last_error = NULL, updated_ts = ?
            WHERE id = ? AND status = 'in_progress' AND claim_owner = ?
            "#,
        )
        .bind(Utc::now())
        .bind(sequence_id)
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotClaimed { sequence_id });
        }
        Ok(())
    }

    pub async fn mark_failed(&self, sequence_id: i64, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_queue SET status = 'failed', last_error = ?, updated_ts = ?
            WHERE id = ? AND status = 'in_progress' AND claim_owner = ?
            "#,
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(sequence_id)
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotClaimed { sequence_id });
        }
        Ok(())
    }

    /// Put an in-progress item back to pending, claimable right away.
    pub async fn requeue(&self, sequence_id: i64) -> Result<()> {
        self.requeue_after(sequence_id, Duration::ZERO).await
    }

    /// Put an in-progress item back to pending, not claimable before `delay` has passed.
    pub async fn requeue_after(&self, sequence_id: i64, delay: Duration) -> Result<()> {
        let now = Utc::now();
        let not_before = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| PipelineError::Config(format!("retry delay out of range: {:?}", delay)))?;

        let result = sqlx::query(
            r#"
            UPDATE dispatch_queue
            SET status = 'pending', claim_owner = NULL, claimed_ts = NULL, not_before_ts = ?, updated_ts = ?
            WHERE id = ? AND status = 'in_progress' AND claim_owner = ?
            "#,
        )
        .bind(not_before)
        .bind(now)
        .bind(sequence_id)
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotClaimed { sequence_id });
        }
        Ok(())
    }

    /// Count one failed attempt against an in-progress item; returns the new total.
    pub async fn record_failed_attempt(&self, sequence_id: i64, reason: &str) -> Result<u32> {
        let attempts = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE dispatch_queue
            SET attempts = attempts + 1, last_error = ?, updated_ts = ?
            WHERE id = ? AND status = 'in_progress' AND claim_owner = ?
            RETURNING attempts
            "#,
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(sequence_id)
        .bind(&self.owner)
        .fetch_optional(&self.pool)
        .await?;

        match attempts {
            Some(n) => Ok(n.max(0) as u32),
            None => Err(PipelineError::NotClaimed { sequence_id }),
        }
    }

    /// Startup reconciliation: claims held by another owner whose claim time
    /// is older than `lease` go back to pending. Our own claims and fresh
    /// claims of a live process are left alone, as are attempt counts.
    pub async fn recover_in_progress(&self, lease: Duration) -> Result<u64> {
        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
        else {
            debug!("Claim lease {:?} reaches past the epoch, nothing to recover", lease);
            return Ok(0);
        };

        let result = sqlx::query(
            r#"
            UPDATE dispatch_queue
            SET status = 'pending', claim_owner = NULL, claimed_ts = NULL, updated_ts = ?
            WHERE status = 'in_progress'
              AND (claim_owner IS NULL OR (claim_owner != ? AND (claimed_ts IS NULL OR claimed_ts <= ?)))
            "#,
        )
        .bind(now)
        .bind(&self.owner)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!("Requeued {} items abandoned by an earlier run", recovered);
        }
        Ok(recovered)
    }

    pub async fn queue_item(&self, sequence_id: i64) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {} FROM dispatch_queue WHERE id = ?", QUEUE_COLUMNS);
        let row = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(sequence_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(QueueItem::try_from).transpose()
    }

    pub async fn queue_items_with_status(&self, status: QueueStatus) -> Result<Vec<QueueItem>> {
        let sql = format!("SELECT {} FROM dispatch_queue WHERE status = ? ORDER BY id", QUEUE_COLUMNS);
        let rows = sqlx::query_as::<_, QueueRow>(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        into_items(rows)
    }

    // --- signal history ---

    pub async fn record_signals(&self, sequence_id: i64, signals: &[Signal]) -> Result<()> {
        if signals.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for signal in signals {
            sqlx::query(
                r#"
                INSERT INTO signals (id, queue_id, adsh, cik, signal_type, strength, reasoning, generated_ts)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(signal.id.to_string())
            .bind(sequence_id)
            .bind(&signal.accession)
            .bind(&signal.company_id)
            .bind(&signal.signal_type)
            .bind(signal.strength)
            .bind(&signal.reasoning)
            .bind(signal.generated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("Stored {} signals for queue item {}", signals.len(), sequence_id);
        Ok(())
    }

    pub async fn recent_signals(&self, limit: usize) -> Result<Vec<Signal>> {
        let rows = sqlx::query_as::<_, (String, String, String, String, f64, String, DateTime<Utc>)>(
            r#"
            SELECT id, adsh, cik, signal_type, strength, reasoning, generated_ts
            FROM signals
            ORDER BY generated_ts DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, accession, company_id, signal_type, strength, reasoning, generated_at)| {
                let id = Uuid::parse_str(&id)
                    .map_err(|e| PipelineError::General(format!("bad signal id {}: {}", id, e)))?;
                Ok(Signal {
                    id,
                    accession,
                    company_id,
                    signal_type,
                    strength,
                    reasoning,
                    generated_at,
                })
            })
            .collect()
    }

    // --- reporting ---

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();

        let by_status = sqlx::query_as::<_, (String, i64)>("SELECT status, COUNT(*) FROM dispatch_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for (status, count) in by_status {
            match status.parse::<QueueStatus>()? {
                QueueStatus::Pending => stats.pending = count,
                QueueStatus::InProgress => stats.in_progress = count,
                QueueStatus::Done => stats.done = count,
                QueueStatus::Failed => stats.failed = count,
            }
        }

        stats.seen = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM adsh_seen")
            .fetch_one(&self.pool)
            .await?;

        stats.signals = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM signals")
            .fetch_one(&self.pool)
            .await?;

        stats.top_forms = sqlx::query_as::<_, (String, i64)>(
            "SELECT form, COUNT(*) AS n FROM dispatch_queue GROUP BY form ORDER BY n DESC, form LIMIT 10",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(stats)
    }

    /// Filings per company and form type with a filing date on or after `since`.
    pub async fn filing_summary(&self, since: NaiveDate) -> Result<Vec<FilingSummaryRow>> {
        let rows = sqlx::query_as::<_, (String, String, i64, Option<String>)>(
            r#"
            SELECT cik, form, COUNT(*), MAX(filing_date)
            FROM dispatch_queue
            WHERE filing_date >= ?
            GROUP BY cik, form
            ORDER BY cik, form
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(company_id, form_type, filing_count, latest)| FilingSummaryRow {
                company_id,
                form_type,
                filing_count,
                latest_filing: latest.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
            })
            .collect())
    }

    pub async fn search_filings(&self, query: &FilingQuery) -> Result<Vec<QueueItem>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM dispatch_queue WHERE 1 = 1", QUEUE_COLUMNS));

        // CIKs arrive zero-padded from the feed but are often typed without padding
        if let Some(company_id) = &query.company_id {
            builder
                .push(" AND ltrim(cik, '0') = ltrim(")
                .push_bind(company_id.clone())
                .push(", '0')");
        }
        if let Some(form_type) = &query.form_type {
            builder.push(" AND form = ").push_bind(form_type.clone());
        }
        if let Some(date_from) = query.date_from {
            builder.push(" AND filing_date >= ").push_bind(date_from);
        }
        if let Some(date_to) = query.date_to {
            builder.push(" AND filing_date <= ").push_bind(date_to);
        }

        let limit = if query.limit == 0 { 100 } else { query.limit };
        builder
            .push(" ORDER BY filing_date DESC, id DESC LIMIT ")
            .push_bind(limit as i64);

        let rows = builder.build_query_as::<QueueRow>().fetch_all(&self.pool).await?;
        into_items(rows)
    }
}
