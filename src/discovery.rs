use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::db;
use crate::fetcher::{fetch_html, FetchError};
use crate::jobs::DocType;

/// Pages scanned when no end page is given.
pub const DEFAULT_PAGE_SPAN: u32 = 100;

static LAW_ID_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p.nqTitle[lawid]").unwrap());
static JUDGMENT_LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a.h5.font-weight-bold[href*="/ban-an/"]"#).unwrap());

/// One page of an external listing, as ids.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn listing_ids(&self, doc_type: DocType, page: u32) -> Result<Vec<String>, FetchError>;
}

pub struct HttpListing {
    client: reqwest::Client,
}

impl HttpListing {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ListingSource for HttpListing {
    async fn listing_ids(&self, doc_type: DocType, page: u32) -> Result<Vec<String>, FetchError> {
        let url = listing_url(doc_type, page)?;
        let html = fetch_html(&self.client, &url).await?;
        Ok(extract_listing_ids(doc_type, &html))
    }
}

pub fn listing_url(doc_type: DocType, page: u32) -> Result<String, FetchError> {
    match doc_type {
        DocType::Law => Ok(format!(
            "https://thuvienphapluat.vn/page/tim-van-ban.aspx?type=0&page={}",
            page
        )),
        DocType::Judgment => Ok(format!(
            "https://thuvienphapluat.vn/banan/tim-ban-an?type_q=0&sortType=1&Category=0&page={}",
            page
        )),
        DocType::Qa => Err(FetchError::NoListing(doc_type)),
    }
}

/// Ids on a listing page, in page order. May contain duplicates.
pub fn extract_listing_ids(doc_type: DocType, html: &str) -> Vec<String> {
    let page = Html::parse_document(html);
    match doc_type {
        DocType::Law => page
            .select(&LAW_ID_SEL)
            .filter_map(|p| p.value().attr("lawid"))
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect(),
        // ".../ban-an-12-2023-ds-pt-...-2233" -> "2233"
        DocType::Judgment => page
            .select(&JUDGMENT_LINK_SEL)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(|href| href.rsplit('-').next())
            .filter_map(|tail| tail.split('/').next())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect(),
        DocType::Qa => Vec::new(),
    }
}

/// Inclusive page interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn pages(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

/// Cut `[start, end]` into at most `parts` contiguous, disjoint, ordered ranges.
pub fn split_page_range(start: u32, end: Option<u32>, parts: usize) -> Vec<PageRange> {
    let end = end.unwrap_or(start.saturating_add(DEFAULT_PAGE_SPAN));
    if end < start {
        return Vec::new();
    }
    let total = (end - start) as usize + 1;
    let parts = parts.clamp(1, total);
    let chunk = total.div_ceil(parts);

    (0..total)
        .step_by(chunk)
        .map(|offset| {
            let first = start + offset as u32;
            let last = (first as usize + chunk - 1).min(end as usize) as u32;
            PageRange {
                start: first,
                end: last,
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub max_empty_pages: u32,
    pub workers: usize,
    pub page_delay: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RangeReport {
    pub new_ids: usize,
    pub pages_visited: usize,
    pub pages_failed: usize,
}

/// Scan one sub-range with its own connection, stopping after
/// `max_empty_pages` consecutive pages with no ids.
pub async fn discover_range(
    conn: Connection,
    source: Arc<dyn ListingSource>,
    doc_type: DocType,
    range: PageRange,
    max_empty_pages: u32,
    page_delay: Duration,
) -> Result<RangeReport> {
    let mut report = RangeReport::default();
    let mut empty_run = 0u32;

    for page in range.pages() {
        if !page_delay.is_zero() {
            tokio::time::sleep(page_delay).await;
        }
        report.pages_visited += 1;

        let ids = match source.listing_ids(doc_type, page).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(page, doc_type = %doc_type, "Listing page failed, skipping: {}", e);
                report.pages_failed += 1;
                continue;
            }
        };

        let mut seen = HashSet::new();
        let ids: Vec<String> = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();

        if ids.is_empty() {
            empty_run += 1;
            debug!(page, empty_run, "Empty listing page");
            if empty_run >= max_empty_pages {
                info!(page, doc_type = %doc_type, "Reached end of listing");
                break;
            }
            continue;
        }
        empty_run = 0;

        let inserted = match db::insert_new_jobs(&conn, doc_type, &ids) {
            Ok(n) => n,
            Err(e) => {
                warn!(page, doc_type = %doc_type, "Storing listing ids failed, skipping: {:#}", e);
                report.pages_failed += 1;
                continue;
            }
        };
        debug!(page, found = ids.len(), inserted, "Listing page stored");
        report.new_ids += inserted;
    }

    Ok(report)
}

/// Run every sub-range concurrently; returns the number of new jobs created.
pub async fn discover(
    db_path: &Path,
    source: Arc<dyn ListingSource>,
    doc_type: DocType,
    start_page: u32,
    end_page: Option<u32>,
    opts: &DiscoverOptions,
) -> Result<usize> {
    let ranges = split_page_range(start_page, end_page, opts.workers);
    info!(doc_type = %doc_type, ranges = ranges.len(), "Starting discovery");

    let mut handles = Vec::with_capacity(ranges.len());
    for range in ranges {
        let conn = db::connect(db_path)?;
        let source = Arc::clone(&source);
        let handle = tokio::spawn(discover_range(
            conn,
            source,
            doc_type,
            range,
            opts.max_empty_pages,
            opts.page_delay,
        ));
        handles.push((range, handle));
    }

    let mut total = 0;
    for (range, handle) in handles {
        match handle.await {
            Ok(Ok(report)) => {
                info!(
                    start = range.start,
                    end = range.end,
                    new_ids = report.new_ids,
                    pages = report.pages_visited,
                    failed_pages = report.pages_failed,
                    "Range done"
                );
                total += report.new_ids;
            }
            Ok(Err(e)) => warn!(start = range.start, end = range.end, "Range aborted: {:#}", e),
            Err(e) => warn!(start = range.start, end = range.end, "Range task panicked: {}", e),
        }
    }

    info!(doc_type = %doc_type, total, "Discovery complete");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;
    use crate::db::testing::temp_db;

    /// Serves canned pages and remembers which pages were asked for.
    struct FakeListing {
        pages: HashMap<u32, Result<Vec<String>, u16>>,
        visited: Mutex<Vec<u32>>,
    }

    impl FakeListing {
        fn new(pages: Vec<(u32, Result<Vec<&str>, u16>)>) -> Self {
            let pages = pages
                .into_iter()
                .map(|(p, r)| (p, r.map(|ids| ids.iter().map(|s| s.to_string()).collect())))
                .collect();
            Self {
                pages,
                visited: Mutex::new(Vec::new()),
            }
        }

        fn visited(&self) -> Vec<u32> {
            self.visited.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ListingSource for FakeListing {
        async fn listing_ids(&self, _doc_type: DocType, page: u32) -> Result<Vec<String>, FetchError> {
            self.visited.lock().unwrap().push(page);
            match self.pages.get(&page) {
                Some(Ok(ids)) => Ok(ids.clone()),
                Some(Err(status)) => Err(FetchError::Status {
                    status: *status,
                    url: format!("page {}", page),
                }),
                None => Ok(Vec::new()),
            }
        }
    }

    /// Drops the job table when `breaking_page` is requested, so every
    /// insert from then on fails.
    struct BreakingListing {
        path: PathBuf,
        breaking_page: u32,
        visited: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ListingSource for BreakingListing {
        async fn listing_ids(&self, _doc_type: DocType, page: u32) -> Result<Vec<String>, FetchError> {
            self.visited.lock().unwrap().push(page);
            if page == self.breaking_page {
                db::connect(&self.path)
                    .unwrap()
                    .execute_batch("DROP TABLE crawl_jobs")
                    .unwrap();
            }
            Ok(vec![format!("p{}a", page), format!("p{}b", page)])
        }
    }

    fn five(prefix: &str) -> Vec<String> {
        (1..=5).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn split_covers_range_without_overlap() {
        let ranges = split_page_range(1, Some(10), 3);
        assert_eq!(
            ranges,
            vec![
                PageRange { start: 1, end: 4 },
                PageRange { start: 5, end: 8 },
                PageRange { start: 9, end: 10 },
            ]
        );
        assert_eq!(split_page_range(3, Some(4), 8).len(), 2);
        assert_eq!(split_page_range(1, None, 1), vec![PageRange { start: 1, end: 101 }]);
        assert!(split_page_range(5, Some(4), 2).is_empty());
        assert_eq!(split_page_range(1, Some(1), 0), vec![PageRange { start: 1, end: 1 }]);
    }

    #[tokio::test]
    async fn stops_after_consecutive_empty_pages() {
        let (_dir, path, _conn) = temp_db();
        let five_a = five("a");
        let five_b = five("b");
        let source = Arc::new(FakeListing::new(vec![
            (1, Ok(five_a.iter().map(String::as_str).collect())),
            (2, Ok(vec![])),
            (3, Ok(vec![])),
            (4, Ok(vec![])),
            (5, Ok(five_b.iter().map(String::as_str).collect())),
        ]));

        let report = discover_range(
            db::connect(&path).unwrap(),
            source.clone(),
            DocType::Law,
            PageRange { start: 1, end: 5 },
            3,
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert_eq!(source.visited(), vec![1, 2, 3, 4]);
        assert_eq!(report.new_ids, 5);
    }

    #[tokio::test]
    async fn failed_page_is_skipped_not_fatal() {
        let (_dir, path, conn) = temp_db();
        db::insert_new_jobs(&conn, DocType::Law, &["x1".to_string()]).unwrap();
        let source = Arc::new(FakeListing::new(vec![
            (1, Ok(vec!["x1", "x2", "x2"])),
            (2, Err(503)),
            (3, Ok(vec!["x3"])),
        ]));

        let report = discover_range(
            db::connect(&path).unwrap(),
            source.clone(),
            DocType::Law,
            PageRange { start: 1, end: 3 },
            3,
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert_eq!(source.visited(), vec![1, 2, 3]);
        assert_eq!(report.pages_failed, 1);
        // x1 was already tracked; x2 appears twice on the page.
        assert_eq!(report.new_ids, 2);
    }

    #[tokio::test]
    async fn parallel_ranges_sum_new_ids() {
        let (_dir, path, conn) = temp_db();
        let source = Arc::new(FakeListing::new(vec![
            (1, Ok(vec!["1", "2"])),
            (2, Ok(vec!["2", "3"])),
            (3, Ok(vec!["4"])),
            (4, Ok(vec!["5", "6"])),
        ]));
        let opts = DiscoverOptions {
            max_empty_pages: 3,
            workers: 2,
            page_delay: Duration::ZERO,
        };

        let total = discover(&path, source.clone(), DocType::Judgment, 1, Some(4), &opts)
            .await
            .unwrap();
        assert_eq!(total, 6);

        let mut visited = source.visited();
        visited.sort();
        assert_eq!(visited, vec![1, 2, 3, 4]);
        assert_eq!(db::get_stats(&conn).unwrap().per_type[1].1.pending, 6);

        // A second pass finds nothing new.
        let again = discover(&path, source, DocType::Judgment, 1, Some(4), &opts)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn store_error_skips_page_and_keeps_earlier_count() {
        let (_dir, path, _conn) = temp_db();
        let source = Arc::new(BreakingListing {
            path: path.clone(),
            breaking_page: 2,
            visited: Mutex::new(Vec::new()),
        });

        let report = discover_range(
            db::connect(&path).unwrap(),
            source.clone(),
            DocType::Law,
            PageRange { start: 1, end: 3 },
            3,
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert_eq!(*source.visited.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(report.new_ids, 2);
        assert_eq!(report.pages_failed, 2);
    }

    #[tokio::test]
    async fn store_error_does_not_zero_the_total() {
        let (_dir, path, _conn) = temp_db();
        let source = Arc::new(BreakingListing {
            path: path.clone(),
            breaking_page: 2,
            visited: Mutex::new(Vec::new()),
        });
        let opts = DiscoverOptions {
            max_empty_pages: 3,
            workers: 1,
            page_delay: Duration::ZERO,
        };

        let total = discover(&path, source, DocType::Law, 1, Some(3), &opts)
            .await
            .unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn law_listing_ids() {
        let html = std::fs::read_to_string("tests/fixtures/law_listing.html").unwrap();
        assert_eq!(
            extract_listing_ids(DocType::Law, &html),
            vec!["598765", "598766", "598765"]
        );
    }

    #[test]
    fn judgment_listing_ids() {
        let html = std::fs::read_to_string("tests/fixtures/judgment_listing.html").unwrap();
        assert_eq!(extract_listing_ids(DocType::Judgment, &html), vec!["2233", "1187"]);
    }

    #[test]
    fn qa_has_no_listing() {
        assert!(matches!(listing_url(DocType::Qa, 1), Err(FetchError::NoListing(_))));
        assert!(listing_url(DocType::Law, 7).unwrap().ends_with("page=7"));
    }
}
