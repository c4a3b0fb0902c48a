use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::db::{self, StoredDocument};
use crate::jobs::{truncate_chars, DocType};
use crate::parser;

const CHUNK_SIZE: usize = 500;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParseCounts {
    pub documents: usize,
    pub parsed: usize,
    pub failed: usize,
    pub articles_found: usize,
    pub articles_stored: usize,
}

impl ParseCounts {
    pub fn print(&self) {
        println!(
            "Parsed {}/{} documents ({} failed): {} articles found, {} new stored.",
            self.parsed, self.documents, self.failed, self.articles_found, self.articles_stored,
        );
    }
}

/// Parse fetched documents into articles. Parsing runs in parallel per chunk;
/// each document's results are written in their own transaction, so one bad
/// document never touches another's articles.
pub fn process_documents(
    conn: &Connection,
    doc_type: DocType,
    limit: Option<usize>,
    reparse: bool,
    max_error_chars: usize,
) -> Result<ParseCounts> {
    let docs = db::fetch_unparsed(conn, doc_type, limit, reparse)?;
    let mut counts = ParseCounts {
        documents: docs.len(),
        ..Default::default()
    };
    if docs.is_empty() {
        return Ok(counts);
    }
    info!(doc_type = %doc_type, documents = docs.len(), reparse, "Parsing documents");

    let pb = ProgressBar::new(docs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
            .progress_chars("#>-"),
    );

    for chunk in docs.chunks(CHUNK_SIZE) {
        let results: Vec<_> = chunk.par_iter().map(parser::parse).collect();

        for (doc, result) in chunk.iter().zip(results) {
            match result {
                Ok(articles) => {
                    counts.articles_found += articles.len();
                    match db::save_articles(conn, doc, &articles) {
                        Ok(stored) => {
                            debug!(doc_id = %doc.doc_id, found = articles.len(), stored, "Articles saved");
                            counts.parsed += 1;
                            counts.articles_stored += stored;
                        }
                        Err(e) => {
                            warn!(doc_id = %doc.doc_id, "Saving articles failed: {:#}", e);
                            fail(conn, doc, &format!("{:#}", e), max_error_chars, &mut counts);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        doc_id = %doc.doc_id,
                        title = doc.title.as_deref().unwrap_or(""),
                        "Parse failed: {}",
                        e
                    );
                    fail(conn, doc, &e.to_string(), max_error_chars, &mut counts);
                }
            }
        }
        pb.inc(chunk.len() as u64);
    }

    pb.finish_and_clear();
    info!(
        parsed = counts.parsed,
        failed = counts.failed,
        stored = counts.articles_stored,
        "Parsing complete"
    );
    Ok(counts)
}

fn fail(
    conn: &Connection,
    doc: &StoredDocument,
    error: &str,
    max_error_chars: usize,
    counts: &mut ParseCounts,
) {
    counts.failed += 1;
    if let Err(e) = db::record_parse_failure(conn, doc, &truncate_chars(error, max_error_chars)) {
        warn!(doc_id = %doc.doc_id, "Could not record parse failure: {:#}", e);
    }
}
