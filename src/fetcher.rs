use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

use crate::settings::Settings;
use crate::jobs::DocType;

const BASE_URL: &str = "https://thuvienphapluat.vn";

/// Metadata values the site shows in place of missing data.
const PLACEHOLDERS: [&str; 2] = ["Đang cập nhật", "Chưa xác định"];

static LAW_META_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div#divThuocTinh td").unwrap());
static LAW_CONTENT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.content1").unwrap());
static JUDGMENT_META_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("ul.list-group.detail-item > li").unwrap());
static JUDGMENT_VALUE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.col-xl-9").unwrap());
static JUDGMENT_CONTENT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div#vanban_content").unwrap());
static QA_CONTENT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div#news-content, div.news-content, article").unwrap());
static BOLD_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("b").unwrap());
static PARAGRAPH_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("p").unwrap());
static HEADING_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").unwrap());
static TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());

/// Payload of one fetched document, ready for storage.
#[derive(Debug, Clone, Default)]
pub struct RawContent {
    pub document_number: String,
    pub title: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub markup: String,
    /// Ordered text blocks (paragraphs) of the document body.
    pub blocks: Vec<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("no content container in {0}")]
    MissingContent(String),
    #[error("{0} documents have no listing pages")]
    NoListing(DocType),
}

/// Retrieves one document by external id.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, id: &str, doc_type: DocType) -> Result<RawContent, FetchError>;
}

pub fn document_url(doc_type: DocType, id: &str) -> String {
    match doc_type {
        DocType::Law => format!("{}/van-ban/Xay-dung-Do-thi/x-{}.aspx", BASE_URL, id),
        DocType::Judgment => format!("{}/banan/ban-an/x-{}", BASE_URL, id),
        DocType::Qa => format!("{}/hoidap/{}", BASE_URL, id),
    }
}

pub fn build_client(settings: &Settings) -> anyhow::Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        reqwest::header::HeaderValue::from_static("vi-VN,vi;q=0.9,en;q=0.5"),
    );

    reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.request_timeout_secs))
        .user_agent(settings.user_agent.clone())
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .context("Failed to create HTTP client")
}

pub async fn fetch_html(client: &reqwest::Client, url: &str) -> Result<String, FetchError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    Ok(response.text().await?)
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, id: &str, doc_type: DocType) -> Result<RawContent, FetchError> {
        let url = document_url(doc_type, id);
        debug!(doc_id = id, %url, "Fetching");
        let html = fetch_html(&self.client, &url).await?;
        extract_document(id, doc_type, &html)
    }
}

// ── Extraction ──

/// Pull number, title, metadata and body blocks out of a document page.
pub fn extract_document(id: &str, doc_type: DocType, html: &str) -> Result<RawContent, FetchError> {
    let page = Html::parse_document(html);

    let (metadata, content_sel) = match doc_type {
        DocType::Law => (law_metadata(&page), &*LAW_CONTENT_SEL),
        DocType::Judgment => (judgment_metadata(&page), &*JUDGMENT_CONTENT_SEL),
        DocType::Qa => (BTreeMap::new(), &*QA_CONTENT_SEL),
    };

    let content = page
        .select(content_sel)
        .next()
        .ok_or_else(|| FetchError::MissingContent(document_url(doc_type, id)))?;

    let title = match doc_type {
        DocType::Judgment => metadata.get("Tên bản án").cloned(),
        DocType::Law | DocType::Qa => None,
    }
    .or_else(|| first_text(&page, &HEADING_SEL))
    .or_else(|| first_text(&page, &TITLE_SEL));

    let document_number = metadata
        .get("Số hiệu")
        .cloned()
        .unwrap_or_else(|| id.to_string());

    Ok(RawContent {
        document_number,
        title,
        metadata,
        markup: content.html(),
        blocks: content_blocks(content),
    })
}

/// Law pages keep attributes in a table: `<td><b>Label:</b></td><td>value</td>`.
fn law_metadata(page: &Html) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for cell in page.select(&LAW_META_SEL) {
        let Some(label) = cell.select(&BOLD_SEL).next().map(element_text) else {
            continue;
        };
        let Some(value_cell) = cell.next_siblings().find_map(ElementRef::wrap) else {
            continue;
        };
        insert_field(&mut out, &label, &element_text(value_cell));
    }
    out
}

/// Judgment pages use `<li><b>Label:</b> ... <div class="col-xl-9">value</div></li>`.
fn judgment_metadata(page: &Html) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for item in page.select(&JUDGMENT_META_SEL) {
        let label = item.select(&BOLD_SEL).next().map(element_text);
        let value = item.select(&JUDGMENT_VALUE_SEL).next().map(element_text);
        if let (Some(label), Some(value)) = (label, value) {
            insert_field(&mut out, &label, &value);
        }
    }
    out
}

fn insert_field(out: &mut BTreeMap<String, String>, label: &str, value: &str) {
    let label = label.trim().trim_end_matches(':').trim();
    if label.is_empty() || value.is_empty() || PLACEHOLDERS.iter().any(|p| value.contains(p)) {
        return;
    }
    out.entry(label.to_string()).or_insert_with(|| value.to_string());
}

fn content_blocks(content: ElementRef) -> Vec<String> {
    let paragraphs: Vec<String> = content
        .select(&PARAGRAPH_SEL)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect();
    if !paragraphs.is_empty() {
        return paragraphs;
    }
    content
        .text()
        .flat_map(str::lines)
        .map(normalize)
        .filter(|t| !t.is_empty())
        .collect()
}

fn first_text(page: &Html, sel: &Selector) -> Option<String> {
    page.select(sel)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
}

fn element_text(el: ElementRef) -> String {
    normalize(&el.text().collect::<Vec<_>>().join(" "))
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}", name)).unwrap()
    }

    #[test]
    fn urls_per_type() {
        assert_eq!(
            document_url(DocType::Law, "123"),
            "https://thuvienphapluat.vn/van-ban/Xay-dung-Do-thi/x-123.aspx"
        );
        assert_eq!(
            document_url(DocType::Judgment, "45"),
            "https://thuvienphapluat.vn/banan/ban-an/x-45"
        );
        assert_eq!(document_url(DocType::Qa, "9"), "https://thuvienphapluat.vn/hoidap/9");
    }

    #[test]
    fn law_page() {
        let raw = extract_document("598765", DocType::Law, &fixture("law_page.html")).unwrap();
        assert_eq!(raw.document_number, "15/2024/NĐ-CP");
        assert_eq!(raw.metadata.get("Loại văn bản").unwrap(), "Nghị định");
        assert_eq!(raw.metadata.get("Người ký").unwrap(), "Trần Văn A");
        // Placeholder values are not kept.
        assert!(!raw.metadata.contains_key("Ngày hiệu lực"));
        assert_eq!(raw.title.as_deref(), Some("Nghị định 15/2024/NĐ-CP quản lý dự án"));
        assert_eq!(raw.blocks[0], "Chương I");
        assert!(raw.blocks.contains(&"Điều 1. Phạm vi điều chỉnh".to_string()));
        assert!(raw.blocks.contains(&"1. Nội dung A".to_string()));
        assert!(raw.markup.contains("content1"));
    }

    #[test]
    fn judgment_page() {
        let raw =
            extract_document("2233", DocType::Judgment, &fixture("judgment_page.html")).unwrap();
        assert_eq!(raw.document_number, "12/2023/DS-PT");
        assert_eq!(raw.title.as_deref(), Some("Bản án về tranh chấp hợp đồng vay tài sản"));
        assert!(!raw.metadata.contains_key("Lĩnh vực"));
        assert_eq!(raw.blocks, vec!["NHẬN THẤY:", "Nguyên đơn trình bày", "QUYẾT ĐỊNH:"]);
    }

    #[test]
    fn missing_number_falls_back_to_id() {
        let html = r#"<html><body><article><p>Hỏi: thủ tục?</p><p>Trả lời</p></article></body></html>"#;
        let raw = extract_document("777", DocType::Qa, html).unwrap();
        assert_eq!(raw.document_number, "777");
        assert_eq!(raw.blocks, vec!["Hỏi: thủ tục?", "Trả lời"]);
        assert_eq!(raw.title, None);
    }

    #[test]
    fn text_lines_when_no_paragraphs() {
        let html = "<div class=\"content1\">Điều 1. A\n  1.   Khoản\n\n</div>";
        let raw = extract_document("1", DocType::Law, html).unwrap();
        assert_eq!(raw.blocks, vec!["Điều 1. A", "1. Khoản"]);
    }

    #[test]
    fn missing_container_is_an_error() {
        let err = extract_document("1", DocType::Law, "<html><body>404</body></html>").unwrap_err();
        assert!(matches!(err, FetchError::MissingContent(_)));
    }
}
