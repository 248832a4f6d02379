//! Shandong bureau policy column, served through the portal's data proxy.
//!
//! The proxy pages by record range and wraps each list entry as an HTML
//! snippet in a CDATA `record`. It ignores the range now and then and replays
//! the same records, so the crawl stops on content rather than on a count.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use super::{Pagination, SiteAdapter, StopPolicy};
use crate::config::Selection;
use crate::driver::{PageDriver, RequestDescriptor, DEFAULT_TIMEOUT};
use crate::error::{ConfigError, FetchError};
use crate::extractor::{absolute_link, element_text, is_interstitial, truncate_chars, DetailExtractor, Extractor};
use crate::model::{col, Column, DetailFields, DocumentReference, Field, ListPage, PageRequest, Section, LINK_HEADER};
use crate::status::Effectiveness;

const SITE_ROOT: &str = "https://shandong.chinatax.gov.cn";
const DATA_PROXY: &str = "https://shandong.chinatax.gov.cn/module/web/jpage/dataproxy.jsp";
const HOME_PAGE: &str = "https://shandong.chinatax.gov.cn/col/col1053/index.html?number=A0301";
const COLUMN_ID: &str = "1053";
const UNIT_ID: &str = "48166";
const WEB_NAME: &str = "国家税务总局山东省税务局";
const BATCH_SIZE: u32 = 45;
/// The column never lists more than this many records.
const RECORD_CAP: u32 = 3000;
const BODY_CHARS: usize = 30_000;
const NOT_STATED: &str = "未注明";
/// The proxy is a portal page; give it a moment before reading it.
pub const LIST_SETTLE: Duration = Duration::from_millis(500);

pub const SHEET: &str = "政策法规";

const COLUMNS: &[Column] = &[
    col("标题", Field::Title),
    col("发文机构", Field::IssuingUnit),
    col("发文字号", Field::DocNumber),
    col("发文日期", Field::PublishDate),
    col("有效性", Field::Effectiveness),
    col("是否涉税法律", Field::TaxRelated),
    col("正文内容", Field::Body),
    col("附件文件名", Field::AttachmentNames),
    col("附件链接", Field::AttachmentLinks),
    col(LINK_HEADER, Field::Link),
];

/// HTML snippets carried by the `record` elements of a proxy answer.
fn record_snippets(xml: &str) -> Result<Vec<String>, FetchError> {
    let mut snippets = Vec::new();
    let mut in_record = false;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"record" => in_record = true,
            Ok(Event::End(ref e)) if e.name().as_ref() == b"record" => in_record = false,
            Ok(Event::CData(ref e)) if in_record => {
                snippets.push(String::from_utf8_lossy(e).to_string());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::Decode(format!("data proxy answer: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(snippets)
}

/// Detail pages: the `xxgkbg` disclosure table first, then text fallbacks.
pub struct ShandongExtractor {
    fields: Extractor,
    table_cells: Selector,
    main_content: Selector,
    body_primary: Selector,
    body_fallback: Selector,
    date_label: Regex,
    effectiveness_label: Regex,
}

impl Default for ShandongExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShandongExtractor {
    pub fn new() -> Self {
        ShandongExtractor {
            fields: Extractor::new(),
            table_cells: Selector::parse("table#xxgkbg td").expect("table selector"),
            main_content: Selector::parse("div.main_content").expect("content selector"),
            body_primary: Selector::parse("#zoom, .TRS_Editor").expect("body selector"),
            body_fallback: Selector::parse("div.main_content3").expect("body selector"),
            date_label: Regex::new(r"日期[：:]\s*(\d{4}-\d{2}-\d{2})").expect("date pattern"),
            effectiveness_label: Regex::new(r"有效性[：:]\s*(\S+)").expect("effectiveness pattern"),
        }
    }

    /// Label cell → following value cell.
    fn read_table(&self, document: &Html, detail: &mut DetailFields) {
        let cells: Vec<String> = document.select(&self.table_cells).map(|td| element_text(td, "")).collect();
        for pair in cells.windows(2) {
            let (label, value) = (pair[0].as_str(), pair[1].trim());
            if value.is_empty() {
                continue;
            }
            if detail.issuing_unit.is_empty() && (label.contains("发文机关") || label.contains("发布机构")) {
                detail.issuing_unit = value.to_string();
            } else if detail.doc_number.is_empty() && label.contains("发文字号") {
                detail.doc_number = value.to_string();
            } else if detail.publish_date.is_empty() && label.contains("日期") {
                detail.publish_date = value.to_string();
            } else if detail.effectiveness.is_none() && label.contains("有效性") {
                detail.effectiveness = Some(Effectiveness::Stated(value.to_string()));
            } else if label.contains("是否涉税法律") {
                detail.tax_related = Some(value.to_string());
            }
        }
    }

    fn capture(regex: &Regex, text: &str) -> Option<String> {
        regex.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str().trim().to_string())
    }
}

impl DetailExtractor for ShandongExtractor {
    fn extract(&self, url: &str, content: &str) -> Result<DetailFields, FetchError> {
        if is_interstitial(content) {
            return Err(FetchError::Blocked(url.to_string()));
        }
        let document = Html::parse_document(content);
        let mut detail = DetailFields {
            attachments: self.fields.attachments(&document, url),
            ..Default::default()
        };
        self.read_table(&document, &mut detail);

        if let Some(main) = document.select(&self.main_content).next() {
            let text = element_text(main, " ");
            if detail.publish_date.is_empty() {
                detail.publish_date = Self::capture(&self.date_label, &text).unwrap_or_default();
            }
            if detail.effectiveness.is_none() {
                detail.effectiveness = Self::capture(&self.effectiveness_label, &text).map(Effectiveness::Stated);
            }
        }
        detail.title = self.fields.meta_content(&document, "ArticleTitle").unwrap_or_default();

        let body = document
            .select(&self.body_primary)
            .next()
            .or_else(|| document.select(&self.body_fallback).next())
            .map(|el| truncate_chars(&element_text(el, ""), BODY_CHARS))
            .unwrap_or_default();
        if detail.doc_number.is_empty() {
            detail.doc_number = self.fields.doc_number_from_body(&body).unwrap_or_default();
        }
        detail.body = body;

        detail
            .effectiveness
            .get_or_insert_with(|| Effectiveness::Stated(NOT_STATED.to_string()));
        detail.tax_related.get_or_insert_with(|| NOT_STATED.to_string());
        Ok(detail)
    }
}

/// The single policy column of the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShandongKey;

impl std::fmt::Display for ShandongKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (column {})", SHEET, COLUMN_ID)
    }
}

pub struct ShandongAdapter {
    driver: Arc<dyn PageDriver>,
    extractor: ShandongExtractor,
    anchor: Selector,
    timeout: Duration,
}

impl ShandongAdapter {
    pub fn new(driver: Arc<dyn PageDriver>) -> Self {
        ShandongAdapter {
            driver,
            extractor: ShandongExtractor::new(),
            anchor: Selector::parse("a[href]").expect("anchor selector"),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Proxy URL for one record range. Both the page number and the range are
    /// sent; the server honours one or the other.
    pub fn proxy_url(request: &PageRequest) -> Result<Url, FetchError> {
        let (start, end) = request.record_range();
        let params = [
            ("col", "1".to_string()),
            ("appid", "1".to_string()),
            ("webid", "1".to_string()),
            ("path", "/".to_string()),
            ("columnid", COLUMN_ID.to_string()),
            ("unitid", UNIT_ID.to_string()),
            ("webname", WEB_NAME.to_string()),
            ("permissiontype", "0".to_string()),
            ("page", request.page.to_string()),
            ("startrecord", start.to_string()),
            ("endrecord", end.to_string()),
        ];
        Url::parse_with_params(DATA_PROXY, &params).map_err(|e| FetchError::Decode(format!("proxy url: {}", e)))
    }

    fn reference(&self, snippet: &str) -> Option<DocumentReference> {
        let fragment = Html::parse_fragment(snippet);
        let anchor = fragment.select(&self.anchor).next()?;
        let link = absolute_link(SITE_ROOT, anchor.value().attr("href")?);
        if link.is_empty() {
            return None;
        }
        let title = anchor
            .value()
            .attr("title")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| element_text(anchor, ""));
        Some(DocumentReference {
            identifier: link.clone(),
            link,
            title,
            category: SHEET.to_string(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl SiteAdapter for ShandongAdapter {
    type Key = ShandongKey;

    fn name(&self) -> &'static str {
        "shandong"
    }

    fn keys(&self, selection: &Selection) -> Result<Vec<ShandongKey>, ConfigError> {
        selection
            .categories
            .expand(&[SHEET], |name| ConfigError::UnknownCategory { site: "shandong", name })?;
        Ok(vec![ShandongKey])
    }

    fn sections(&self) -> Vec<Section> {
        vec![Section::new(SHEET, COLUMNS)]
    }

    fn section_for(&self, _key: &ShandongKey) -> Section {
        Section::new(SHEET, COLUMNS)
    }

    fn pagination(&self, _key: &ShandongKey) -> Pagination {
        Pagination {
            page_size: BATCH_SIZE,
            stop: StopPolicy::content_based(),
            max_pages: Some(RECORD_CAP.div_ceil(BATCH_SIZE)),
        }
    }

    async fn fetch_list_page(&self, key: &ShandongKey, request: &PageRequest) -> Result<ListPage, FetchError> {
        let url = Self::proxy_url(request)?;
        let descriptor = RequestDescriptor::get(url.as_str())
            .header("Referer", HOME_PAGE)
            .timeout(self.timeout)
            .settle(LIST_SETTLE);
        let body = self.driver.fetch(&descriptor).await?.into_success(url.as_str())?;
        if is_interstitial(&body) {
            warn!("{}: anti-bot gateway answered page {}", key, request.page);
            return Err(FetchError::Blocked(url.to_string()));
        }

        let snippets = record_snippets(&body)?;
        if snippets.len() > (request.page_size as usize) * 2 {
            warn!(
                "{}: proxy ignored the record range ({} records for page {})",
                key,
                snippets.len(),
                request.page
            );
        }
        let references: Vec<DocumentReference> = snippets.iter().filter_map(|s| self.reference(s)).collect();
        debug!("{} page {}: {} link(s)", key, request.page, references.len());
        Ok(ListPage {
            references,
            total_known: None,
            last_page: false,
        })
    }

    async fn fetch_detail(&self, reference: &DocumentReference) -> Result<DetailFields, FetchError> {
        let url = reference.link.as_str();
        let body = self
            .driver
            .fetch(&RequestDescriptor::get(url).timeout(self.timeout))
            .await?
            .into_success(url)?;
        self.extractor.extract(url, &body)
    }
}
