use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::fetcher::RawContent;
use crate::jobs::{DocType, Job, JobStatus, Outcome, Transition};
use crate::parser::articles::{clean_content, ParsedArticle};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS crawl_jobs (
            id           INTEGER PRIMARY KEY,
            doc_id       TEXT NOT NULL,
            doc_type     TEXT NOT NULL CHECK(doc_type IN ('law','judgment','qa')),
            status       TEXT NOT NULL DEFAULT 'pending'
                         CHECK(status IN ('pending','processing','success','failed')),
            retry_count  INTEGER NOT NULL DEFAULT 0 CHECK(retry_count >= 0),
            created_at   TEXT NOT NULL,
            last_attempt TEXT,
            error_log    TEXT,
            UNIQUE(doc_id, doc_type)
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON crawl_jobs(doc_type, status, retry_count, created_at);

        CREATE TABLE IF NOT EXISTS documents (
            doc_id          TEXT NOT NULL,
            doc_type        TEXT NOT NULL,
            document_number TEXT NOT NULL,
            title           TEXT,
            metadata        TEXT NOT NULL DEFAULT '{}',
            markup          TEXT,
            blocks          TEXT NOT NULL DEFAULT '[]',
            fetched_at      TEXT NOT NULL,
            PRIMARY KEY (doc_id, doc_type),
            FOREIGN KEY (doc_id, doc_type) REFERENCES crawl_jobs(doc_id, doc_type)
        );
        CREATE INDEX IF NOT EXISTS idx_documents_number ON documents(document_number);

        CREATE TABLE IF NOT EXISTS articles (
            article_id     TEXT PRIMARY KEY,
            doc_id         TEXT NOT NULL,
            doc_type       TEXT NOT NULL,
            article_number TEXT NOT NULL,
            title          TEXT NOT NULL,
            content        TEXT NOT NULL,
            clean_content  TEXT NOT NULL,
            hierarchy_path TEXT NOT NULL DEFAULT '[]',
            processed_at   TEXT NOT NULL,
            FOREIGN KEY (doc_id, doc_type) REFERENCES documents(doc_id, doc_type)
        );
        CREATE INDEX IF NOT EXISTS idx_articles_doc ON articles(doc_id, doc_type);

        -- Parse outcomes: one row per stored article, plus one document-level
        -- row (article_id NULL) holding the latest whole-document outcome.
        CREATE TABLE IF NOT EXISTS process_records (
            id          INTEGER PRIMARY KEY,
            doc_id      TEXT NOT NULL,
            doc_type    TEXT NOT NULL,
            article_id  TEXT,
            status      TEXT NOT NULL CHECK(status IN ('pending','processing','success','failed')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            error_log   TEXT,
            finished_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_process_doc ON process_records(doc_id, doc_type);
        CREATE INDEX IF NOT EXISTS idx_process_status ON process_records(status);
        ",
    )?;
    Ok(())
}

impl ToSql for DocType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DocType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

// ── Jobs ──

const JOB_COLUMNS: &str =
    "doc_id, doc_type, status, retry_count, created_at, last_attempt, error_log";

fn job_from_row(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    Ok(Job {
        doc_id: row.get(0)?,
        doc_type: row.get(1)?,
        status: row.get(2)?,
        retry_count: row.get(3)?,
        created_at: row.get(4)?,
        last_attempt: row.get(5)?,
        error_log: row.get(6)?,
    })
}

/// Insert ids not yet tracked for `doc_type` as pending jobs.
/// Returns how many rows were actually created.
pub fn insert_new_jobs(conn: &Connection, doc_type: DocType, ids: &[String]) -> Result<usize> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let mut count = 0;
    {
        let mut exists = tx.prepare(
            "SELECT 1 FROM crawl_jobs WHERE doc_type = ?1 AND doc_id = ?2",
        )?;
        let mut insert = tx.prepare(
            "INSERT OR IGNORE INTO crawl_jobs (doc_id, doc_type, status, retry_count, created_at)
             VALUES (?1, ?2, 'pending', 0, ?3)",
        )?;
        for id in ids {
            if exists.exists(rusqlite::params![doc_type, id])? {
                continue;
            }
            count += insert.execute(rusqlite::params![id, doc_type, Utc::now()])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

/// Oldest retryable jobs first, capped at `limit`.
pub fn claim_batch(
    conn: &Connection,
    doc_type: DocType,
    max_retries: u32,
    limit: usize,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT doc_id FROM crawl_jobs
         WHERE doc_type = ?1
           AND status IN ('pending', 'failed')
           AND retry_count < ?2
         ORDER BY created_at, id
         LIMIT ?3",
    )?;
    let ids = stmt
        .query_map(rusqlite::params![doc_type, max_retries, limit as i64], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

pub fn get_job(conn: &Connection, doc_id: &str, doc_type: DocType) -> Result<Option<Job>> {
    let sql = format!(
        "SELECT {} FROM crawl_jobs WHERE doc_id = ?1 AND doc_type = ?2",
        JOB_COLUMNS
    );
    let job = conn
        .query_row(&sql, rusqlite::params![doc_id, doc_type], job_from_row)
        .optional()?;
    Ok(job)
}

/// Apply one attempt's outcome to a job row inside a single write transaction.
pub fn record_outcome(
    conn: &Connection,
    doc_id: &str,
    doc_type: DocType,
    outcome: &Outcome,
    max_retries: u32,
    max_error_chars: usize,
) -> Result<Transition> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let job = get_job(&tx, doc_id, doc_type)?
        .with_context(|| format!("No {} job {}", doc_type, doc_id))?;
    let next = job.apply(outcome, max_retries, max_error_chars);
    tx.execute(
        "UPDATE crawl_jobs
         SET status = ?1, retry_count = ?2, error_log = ?3, last_attempt = ?4
         WHERE doc_id = ?5 AND doc_type = ?6",
        rusqlite::params![
            next.status, next.retry_count, next.error_log, Utc::now(), doc_id, doc_type,
        ],
    )?;
    tx.commit()?;
    Ok(next)
}

/// Put failed jobs back in the claim set with their retry count reset.
pub fn requeue_failed(conn: &Connection, doc_type: DocType, doc_id: Option<&str>) -> Result<usize> {
    let n = match doc_id {
        Some(id) => conn.execute(
            "UPDATE crawl_jobs SET status = 'pending', retry_count = 0, error_log = NULL
             WHERE doc_type = ?1 AND status = 'failed' AND doc_id = ?2",
            rusqlite::params![doc_type, id],
        )?,
        None => conn.execute(
            "UPDATE crawl_jobs SET status = 'pending', retry_count = 0, error_log = NULL
             WHERE doc_type = ?1 AND status = 'failed'",
            rusqlite::params![doc_type],
        )?,
    };
    Ok(n)
}

// ── Documents ──

/// Fetched document as the structural parser reads it back.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub doc_id: String,
    pub doc_type: DocType,
    pub document_number: String,
    pub title: Option<String>,
    pub blocks: Vec<String>,
}

/// Store (or replace) the raw payload of a fetched document.
pub fn save_document(
    conn: &Connection,
    doc_id: &str,
    doc_type: DocType,
    raw: &RawContent,
) -> Result<()> {
    let metadata = serde_json::to_string(&raw.metadata)?;
    let blocks = serde_json::to_string(&raw.blocks)?;
    conn.execute(
        "INSERT INTO documents
         (doc_id, doc_type, document_number, title, metadata, markup, blocks, fetched_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(doc_id, doc_type) DO UPDATE SET
            document_number = excluded.document_number,
            title = excluded.title,
            metadata = excluded.metadata,
            markup = excluded.markup,
            blocks = excluded.blocks,
            fetched_at = excluded.fetched_at",
        rusqlite::params![
            doc_id, doc_type, raw.document_number, raw.title, metadata, raw.markup, blocks,
            Utc::now(),
        ],
    )?;
    Ok(())
}

/// Documents whose fetch succeeded and that have no parse outcome yet.
/// With `reparse`, every successfully fetched document is returned.
pub fn fetch_unparsed(
    conn: &Connection,
    doc_type: DocType,
    limit: Option<usize>,
    reparse: bool,
) -> Result<Vec<StoredDocument>> {
    let sql = format!(
        "SELECT d.doc_id, d.doc_type, d.document_number, d.title, d.blocks
         FROM documents d
         JOIN crawl_jobs j ON j.doc_id = d.doc_id AND j.doc_type = d.doc_type
         WHERE d.doc_type = ?1
           AND j.status = 'success'
           {}
         ORDER BY j.created_at, j.id{}",
        if reparse {
            ""
        } else {
            "AND NOT EXISTS (
                SELECT 1 FROM process_records p
                WHERE p.doc_id = d.doc_id AND p.doc_type = d.doc_type
            )"
        },
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params![doc_type], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, DocType>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(doc_id, doc_type, document_number, title, blocks)| {
            let blocks: Vec<String> = serde_json::from_str(&blocks)
                .with_context(|| format!("Corrupt blocks for {} {}", doc_type, doc_id))?;
            Ok(StoredDocument {
                doc_id,
                doc_type,
                document_number,
                title,
                blocks,
            })
        })
        .collect()
}

// ── Articles ──

/// Insert articles that are not stored yet (keyed by article_id) and write
/// the matching process records. Returns the number of new articles.
pub fn save_articles(
    conn: &Connection,
    doc: &StoredDocument,
    articles: &[ParsedArticle],
) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let now = Utc::now();
    let mut inserted = 0;
    {
        let mut a_stmt = tx.prepare(
            "INSERT OR IGNORE INTO articles
             (article_id, doc_id, doc_type, article_number, title, content, clean_content,
              hierarchy_path, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        let mut p_stmt = tx.prepare(
            "INSERT INTO process_records (doc_id, doc_type, article_id, status, finished_at)
             VALUES (?1, ?2, ?3, 'success', ?4)",
        )?;
        for a in articles {
            let path = serde_json::to_string(&a.hierarchy_path)?;
            let n = a_stmt.execute(rusqlite::params![
                a.article_id,
                doc.doc_id,
                doc.doc_type,
                a.number,
                a.title,
                a.content.join("\n"),
                clean_content(&a.content),
                path,
                now,
            ])?;
            if n == 1 {
                p_stmt.execute(rusqlite::params![doc.doc_id, doc.doc_type, a.article_id, now])?;
            }
            inserted += n;
        }
    }
    set_document_outcome(&tx, doc, JobStatus::Success, 0, None, now)?;
    tx.commit()?;
    Ok(inserted)
}

/// Record a whole-document parse failure. Failed parses are not retried
/// automatically.
pub fn record_parse_failure(conn: &Connection, doc: &StoredDocument, error: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    set_document_outcome(&tx, doc, JobStatus::Failed, 1, Some(error), Utc::now())?;
    tx.commit()?;
    Ok(())
}

fn set_document_outcome(
    tx: &Transaction,
    doc: &StoredDocument,
    status: JobStatus,
    retry_count: u32,
    error: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "DELETE FROM process_records
         WHERE doc_id = ?1 AND doc_type = ?2 AND article_id IS NULL",
        rusqlite::params![doc.doc_id, doc.doc_type],
    )?;
    tx.execute(
        "INSERT INTO process_records (doc_id, doc_type, article_id, status, retry_count, error_log, finished_at)
         VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6)",
        rusqlite::params![doc.doc_id, doc.doc_type, status, retry_count, error, at],
    )?;
    Ok(())
}

// ── Stats ──

#[derive(Debug, Default)]
pub struct TypeStats {
    pub total: usize,
    pub pending: usize,
    pub success: usize,
    pub failed: usize,
    pub retrying: usize,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub per_type: Vec<(DocType, TypeStats)>,
    pub documents: usize,
    pub articles: usize,
    pub parse_failures: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let mut per_type = Vec::new();
    for doc_type in DocType::ALL {
        let count = |status: &str| -> Result<usize> {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM crawl_jobs WHERE doc_type = ?1 AND status = ?2",
                rusqlite::params![doc_type, status],
                |r| r.get(0),
            )?)
        };
        let total: usize = conn.query_row(
            "SELECT COUNT(*) FROM crawl_jobs WHERE doc_type = ?1",
            rusqlite::params![doc_type],
            |r| r.get(0),
        )?;
        let retrying: usize = conn.query_row(
            "SELECT COUNT(*) FROM crawl_jobs
             WHERE doc_type = ?1 AND status = 'pending' AND retry_count > 0",
            rusqlite::params![doc_type],
            |r| r.get(0),
        )?;
        per_type.push((
            doc_type,
            TypeStats {
                total,
                pending: count("pending")?,
                success: count("success")?,
                failed: count("failed")?,
                retrying,
            },
        ));
    }
    let documents: usize = conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))?;
    let articles: usize = conn.query_row("SELECT COUNT(*) FROM articles", [], |r| r.get(0))?;
    let parse_failures: usize = conn.query_row(
        "SELECT COUNT(*) FROM process_records WHERE article_id IS NULL AND status = 'failed'",
        [],
        |r| r.get(0),
    )?;
    Ok(Stats {
        per_type,
        documents,
        articles,
        parse_failures,
    })
}

// ── Tests ──
