//! Ningbo bureau policy library.
//!
//! The listing is a single page whose pager is driven by script: there is no
//! URL for page N, only a "next" button. Page 1 is opened in the driver's
//! session tab and every later page is one click further.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use scraper::{Html, Selector};

use super::{Pagination, SiteAdapter, StopPolicy};
use crate::config::Selection;
use crate::driver::{PageAction, PageDriver, RequestDescriptor, DEFAULT_TIMEOUT};
use crate::error::{ConfigError, FetchError};
use crate::extractor::{absolute_link, element_text, is_interstitial, DetailExtractor, Extractor};
use crate::model::{col, Column, DetailFields, DocumentReference, Field, ListPage, PageRequest, Section, LINK_HEADER};

const LISTING_URL: &str = "https://ningbo.chinatax.gov.cn/zcwj/zcfgk/index.html";
/// Pager buttons, most specific first.
const NEXT_BUTTON: [&str; 2] = [".right-box .layui-laypage-next", ".layui-laypage-next"];
/// The first load pulls the pager script as well as the list.
pub const FIRST_LOAD_SETTLE: Duration = Duration::from_secs(3);
/// The pager redraws the list in place; there is no navigation event to wait for.
pub const PAGE_TURN_SETTLE: Duration = Duration::from_secs(3);
/// Anchors with shorter text are navigation, not documents.
const MIN_TITLE_CHARS: usize = 5;
/// Nominal; the pager script decides how many links a page shows.
const PAGE_SIZE: u32 = 15;

pub const SHEET: &str = "政策法规库";

const COLUMNS: &[Column] = &[
    col("标题", Field::Title),
    col("发布日期", Field::PublishDate),
    col("发文单位", Field::IssuingUnit),
    col("文号", Field::DocNumber),
    col("正文", Field::Body),
    col("附件文件名", Field::AttachmentNames),
    col("附件链接", Field::AttachmentLinks),
    col(LINK_HEADER, Field::Link),
];

/// Article pages live under `/art/` or `/content/`, or carry a year in the path.
/// Column pages end in `index.html`.
fn is_article(url: &str) -> bool {
    let article = url.contains("/art/") || url.contains("/content/") || url.contains("202");
    article && !url.ends_with("index.html")
}

pub struct NingboExtractor {
    fields: Extractor,
}

impl Default for NingboExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl NingboExtractor {
    pub fn new() -> Self {
        NingboExtractor { fields: Extractor::new() }
    }
}

impl DetailExtractor for NingboExtractor {
    fn extract(&self, url: &str, content: &str) -> Result<DetailFields, FetchError> {
        if is_interstitial(content) {
            return Err(FetchError::Blocked(url.to_string()));
        }
        let document = Html::parse_document(content);
        let body = self
            .fields
            .first_text(&document, &["#zoom", ".info-cont"], "\n")
            .ok_or_else(|| FetchError::Decode(format!("no article body at {}", url)))?;

        // PubDate carries a time after the date.
        let publish_date = self
            .fields
            .meta_content(&document, "PubDate")
            .and_then(|d| d.split_whitespace().next().map(str::to_string))
            .unwrap_or_default();

        Ok(DetailFields {
            title: self.fields.meta_content(&document, "ArticleTitle").unwrap_or_default(),
            issuing_unit: self.fields.meta_content(&document, "ContentSource").unwrap_or_default(),
            doc_number: self.fields.doc_number_from_body(&body).unwrap_or_default(),
            publish_date,
            attachments: self.fields.attachments(&document, url),
            body,
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NingboKey;

impl std::fmt::Display for NingboKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(SHEET)
    }
}

pub struct NingboAdapter {
    driver: Arc<dyn PageDriver>,
    extractor: NingboExtractor,
    anchor: Selector,
    next_buttons: Vec<Selector>,
    timeout: Duration,
}

impl NingboAdapter {
    pub fn new(driver: Arc<dyn PageDriver>) -> Self {
        NingboAdapter {
            driver,
            extractor: NingboExtractor::new(),
            anchor: Selector::parse("a[href]").expect("anchor selector"),
            next_buttons: NEXT_BUTTON
                .iter()
                .map(|s| Selector::parse(s).expect("pager selector"))
                .collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn action(&self, request: &PageRequest) -> PageAction {
        if request.page <= 1 {
            PageAction::Open(
                RequestDescriptor::get(LISTING_URL)
                    .timeout(self.timeout)
                    .settle(FIRST_LOAD_SETTLE),
            )
        } else {
            PageAction::Click {
                selectors: NEXT_BUTTON.iter().map(|s| s.to_string()).collect(),
                settle: PAGE_TURN_SETTLE,
            }
        }
    }

    /// Article links on the rendered page, and whether the pager has nothing after it.
    pub fn parse_listing(&self, html: &str) -> (Vec<DocumentReference>, bool) {
        let document = Html::parse_document(html);
        let references = document
            .select(&self.anchor)
            .filter_map(|a| {
                let href = a.value().attr("href")?;
                if href.contains("javascript") {
                    return None;
                }
                let title = element_text(a, "");
                if title.chars().count() < MIN_TITLE_CHARS {
                    return None;
                }
                let link = absolute_link(LISTING_URL, href);
                if !is_article(&link) {
                    return None;
                }
                Some(DocumentReference {
                    identifier: link.clone(),
                    link,
                    title,
                    category: SHEET.to_string(),
                    ..Default::default()
                })
            })
            .collect();

        let next = self
            .next_buttons
            .iter()
            .find_map(|selector| document.select(selector).next());
        let last_page = match next {
            Some(button) => button.value().attr("class").map_or(false, |c| c.contains("disabled")),
            None => true,
        };
        (references, last_page)
    }
}

#[async_trait]
impl SiteAdapter for NingboAdapter {
    type Key = NingboKey;

    fn name(&self) -> &'static str {
        "ningbo"
    }

    fn keys(&self, selection: &Selection) -> Result<Vec<NingboKey>, ConfigError> {
        selection
            .categories
            .expand(&[SHEET], |name| ConfigError::UnknownCategory { site: "ningbo", name })?;
        Ok(vec![NingboKey])
    }

    fn sections(&self) -> Vec<Section> {
        vec![Section::new(SHEET, COLUMNS)]
    }

    fn section_for(&self, _key: &NingboKey) -> Section {
        Section::new(SHEET, COLUMNS)
    }

    fn pagination(&self, _key: &NingboKey) -> Pagination {
        Pagination {
            page_size: PAGE_SIZE,
            stop: StopPolicy::content_based(),
            max_pages: None,
        }
    }

    async fn fetch_list_page(&self, key: &NingboKey, request: &PageRequest) -> Result<ListPage, FetchError> {
        let content = self.driver.perform(&self.action(request)).await?;
        let body = content.into_success(LISTING_URL)?;
        if is_interstitial(&body) {
            warn!("{}: anti-bot gateway answered page {}", key, request.page);
            return Err(FetchError::Blocked(LISTING_URL.to_string()));
        }
        let (references, last_page) = self.parse_listing(&body);
        debug!("{} page {}: {} link(s)", key, request.page, references.len());
        if last_page {
            debug!("{}: pager has no next page after page {}", key, request.page);
        }
        Ok(ListPage {
            references,
            total_known: None,
            last_page,
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
