//! Shanghai bureau policy library.
//!
//! Four sections come from the WAS full-text search (form POST, XML answer
//! with a record count). The per-tax-type directories are static HTML lists
//! with no reliable page count, so they are walked until pages run dry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::{Html, Selector};

use super::{Pagination, SiteAdapter, StopPolicy};
use crate::config::Selection;
use crate::driver::{PageDriver, RequestDescriptor, DEFAULT_TIMEOUT};
use crate::error::{ConfigError, FetchError};
use crate::extractor::{absolute_link, element_text, is_interstitial, truncate_chars, DetailExtractor, Extractor};
use crate::model::{col, Column, DetailFields, DocumentReference, Field, ListPage, PageRequest, Section, LINK_HEADER};

const WAS_SEARCH: &str = "https://shanghai.chinatax.gov.cn/was5/web/search";
const LIBRARY_BASE: &str = "https://shanghai.chinatax.gov.cn/zcfw/zcfgk/";
const CHANNEL_ID: &str = "123952";
const PAGE_SIZE: u32 = 15;
const STATIC_PAGE_CAP: u32 = 200;
const BODY_FALLBACK_CHARS: usize = 12_000;

pub const TAX_TYPE_SHEET: &str = "按税种分类";

/// WAS sections and their filter clauses, in sheet order.
pub const SEARCH_SECTIONS: [(&str, &str); 4] = [
    ("国务院文件", "CHARACTERUNIT='国务院'  and  CHARACTERUNIT!=('%办%','%委员会%')"),
    (
        "总局文件",
        "CHARACTERUNIT=('国家税务总局','税务总局')  and  CHARACTERUNIT!=('%上海%','%上海市%')",
    ),
    (
        "市政府文件",
        "CHARACTERUNIT='上海市人民政府' and  CHARACTERUNIT!=('%法制办公室%','合作交流办公室')",
    ),
    (
        "市局文件",
        "CHARACTERUNIT=('上海市国家税务局','上海市地方税务局','上海市国家税务局上海市地方税务局','国家税务总M局上海市税务局')",
    ),
];

/// Static directories under the library root, one per tax type.
pub const TAX_PATHS: [&str; 22] = [
    "swzsgl", "nsfw", "zzs", "xfs", "qysds", "grsds", "jckss", "ccs", "zys", "cztdsys", "tdzzs", "dcs", "yhs", "qs",
    "node94", "ssxd", "hbs", "zhsszc", "sbf", "fssr", "ykgf", "node92",
];

const COLUMNS: &[Column] = &[
    col("标题", Field::Title),
    col(LINK_HEADER, Field::Link),
    col("文号", Field::DocNumber),
    col("发布日期", Field::PublishDate),
    col("发文单位", Field::IssuingUnit),
    col("栏目", Field::Category),
    col("正文", Field::Body),
    col("附件文件名", Field::AttachmentNames),
    col("附件链接", Field::AttachmentLinks),
];

const BODY_SELECTORS: [&str; 8] = [
    ".TRS_Editor",
    ".Custom_UnionStyle",
    ".conTxt",
    ".article-content",
    ".main-content",
    "#zoom",
    ".zw",
    ".detail-content",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShanghaiKey {
    Search { section: &'static str, filter: &'static str },
    TaxType(&'static str),
}

impl ShanghaiKey {
    pub fn section_name(&self) -> &'static str {
        match self {
            ShanghaiKey::Search { section, .. } => *section,
            ShanghaiKey::TaxType(_) => TAX_TYPE_SHEET,
        }
    }
}

impl fmt::Display for ShanghaiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShanghaiKey::Search { section, .. } => f.write_str(section),
            ShanghaiKey::TaxType(path) => write!(f, "{} ({})", TAX_TYPE_SHEET, path),
        }
    }
}

/// `index.html` for the first page, `index_<n>.html` after it.
pub fn static_page_url(path: &str, page: u32) -> String {
    if page <= 1 {
        format!("{}{}/index.html", LIBRARY_BASE, path)
    } else {
        format!("{}{}/index_{}.html", LIBRARY_BASE, path, page - 1)
    }
}

/// One `REC` of a WAS search answer.
#[derive(Debug, Default, Clone, PartialEq)]
struct SearchRecord {
    title: String,
    url: String,
    doc_number: String,
    issuing_unit: String,
    publish_date: String,
}

/// Reads the `REC` records and the `RECORDCOUNT` of a WAS answer.
fn parse_search_xml(xml: &str) -> Result<(Vec<SearchRecord>, Option<u64>), FetchError> {
    let mut records = Vec::new();
    let mut total = None;
    let mut current: Option<SearchRecord> = None;
    let mut tag = String::new();

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        let text = match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "REC" {
                    current = Some(SearchRecord::default());
                }
                None
            }
            Ok(Event::Text(ref e)) => Some(e.unescape().unwrap_or_default().trim().to_string()),
            Ok(Event::CData(ref e)) => Some(String::from_utf8_lossy(e).trim().to_string()),
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"REC" {
                    if let Some(record) = current.take() {
                        records.push(record);
                    }
                }
                tag.clear();
                None
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::Decode(format!("search answer: {}", e))),
            _ => None,
        };

        if let Some(text) = text.filter(|t| !t.is_empty()) {
            match (current.as_mut(), tag.as_str()) {
                (Some(rec), "TITLE") => rec.title = text,
                (Some(rec), "URL") => rec.url = text,
                (Some(rec), "WH") => rec.doc_number = text,
                (Some(rec), "FWDW") => rec.issuing_unit = text,
                (Some(rec), "PRINTTIME") => rec.publish_date = text,
                (None, "RECORDCOUNT") => total = text.parse().ok(),
                _ => {}
            }
        }
        buf.clear();
    }

    Ok((records, total))
}

/// Links of a static directory listing, with whatever metadata the `li` carries.
fn parse_static_list(html: &str, page_url: &str, category: &str) -> Vec<DocumentReference> {
    let document = Html::parse_document(html);
    let primary = Selector::parse("ul#zcfglist a[href]").expect("list selector");
    let fallback =
        Selector::parse("ul.infolist li a[href], ul.list li a[href], .mainbox_r .list ul li a[href]").expect("list selector");
    let date = Selector::parse(".time, .printtime, .date").expect("date selector");
    let doc_number = Selector::parse(".wh").expect("doc number selector");

    let mut anchors: Vec<_> = document.select(&primary).collect();
    if anchors.is_empty() {
        anchors = document.select(&fallback).collect();
    }

    anchors
        .into_iter()
        .filter_map(|a| {
            let link = absolute_link(page_url, a.value().attr("href")?);
            if link.is_empty() {
                return None;
            }
            let title = a
                .value()
                .attr("title")
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| element_text(a, ""));
            let item = a.ancestors().filter_map(scraper::ElementRef::wrap).find(|e| e.value().name() == "li");
            let field = |selector: &Selector| {
                item.and_then(|li| li.select(selector).next())
                    .map(|e| element_text(e, ""))
                    .unwrap_or_default()
            };
            Some(DocumentReference {
                identifier: link.clone(),
                publish_date: field(&date),
                doc_number: field(&doc_number),
                title,
                link,
                category: category.to_string(),
                ..Default::default()
            })
        })
        .collect()
}

/// Detail pages: body from the first content container, metadata from `.head_show`.
pub struct ShanghaiExtractor {
    fields: Extractor,
    body_selector: Selector,
    meta_selector: Selector,
}

impl Default for ShanghaiExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShanghaiExtractor {
    pub fn new() -> Self {
        ShanghaiExtractor {
            fields: Extractor::new(),
            body_selector: Selector::parse("body").expect("body selector"),
            meta_selector: Selector::parse(".head_show").expect("meta selector"),
        }
    }
}

impl DetailExtractor for ShanghaiExtractor {
    fn extract(&self, url: &str, content: &str) -> Result<DetailFields, FetchError> {
        if is_interstitial(content) {
            return Err(FetchError::Blocked(url.to_string()));
        }
        let document = Html::parse_document(content);

        let body = self
            .fields
            .first_text(&document, &BODY_SELECTORS, "\n")
            .or_else(|| {
                document
                    .select(&self.body_selector)
                    .next()
                    .map(|b| truncate_chars(&element_text(b, "\n"), BODY_FALLBACK_CHARS))
            })
            .unwrap_or_default();

        let mut detail = DetailFields {
            attachments: self.fields.attachments(&document, url),
            ..Default::default()
        };
        if let Some(meta) = document.select(&self.meta_selector).next() {
            for line in element_text(meta, "\n").lines() {
                let value = || {
                    line.split_once(|c| c == '：' || c == ':')
                        .map(|(_, v)| v.trim().to_string())
                        .unwrap_or_default()
                };
                if detail.doc_number.is_empty() && line.contains("文号") {
                    detail.doc_number = value();
                }
                if detail.issuing_unit.is_empty() && line.contains("发文单位") {
                    detail.issuing_unit = value();
                }
                if detail.publish_date.is_empty() && line.contains("发文日期") {
                    detail.publish_date = value();
                }
            }
        }
        if detail.publish_date.is_empty() {
            detail.publish_date = self.fields.first_date(content).unwrap_or_default();
        }
        if detail.doc_number.is_empty() {
            detail.doc_number = self.fields.doc_number_from_body(&body).unwrap_or_default();
        }
        detail.body = body;
        Ok(detail)
    }
}

pub struct ShanghaiAdapter {
    driver: Arc<dyn PageDriver>,
    extractor: ShanghaiExtractor,
    timeout: Duration,
}

impl ShanghaiAdapter {
    pub fn new(driver: Arc<dyn PageDriver>) -> Self {
        ShanghaiAdapter {
            driver,
            extractor: ShanghaiExtractor::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn search_page(&self, section: &str, filter: &str, request: &PageRequest) -> Result<ListPage, FetchError> {
        let form = vec![
            ("channelid".to_string(), CHANNEL_ID.to_string()),
            ("searchword".to_string(), String::new()),
            ("extrasql".to_string(), filter.to_string()),
            ("page".to_string(), request.page.to_string()),
            ("prepage".to_string(), request.page_size.to_string()),
        ];
        let descriptor = RequestDescriptor::post_form(WAS_SEARCH, form).timeout(self.timeout);
        let body = self.driver.fetch(&descriptor).await?.into_success(WAS_SEARCH)?;
        if is_interstitial(&body) {
            warn!("{}: anti-bot gateway answered page {}", section, request.page);
            return Err(FetchError::Blocked(WAS_SEARCH.to_string()));
        }
        let (records, total) = parse_search_xml(&body)?;

        let references = records
            .into_iter()
            .filter_map(|rec| {
                let link = absolute_link(LIBRARY_BASE, &rec.url);
                if link.is_empty() {
                    return None;
                }
                Some(DocumentReference {
                    identifier: link.clone(),
                    link,
                    title: rec.title,
                    category: section.to_string(),
                    doc_number: rec.doc_number,
                    issuing_unit: rec.issuing_unit,
                    publish_date: rec.publish_date,
                    ..Default::default()
                })
            })
            .collect();
        Ok(ListPage {
            references,
            total_known: total,
            last_page: false,
        })
    }

    async fn static_page(&self, path: &str, request: &PageRequest) -> Result<ListPage, FetchError> {
        let url = static_page_url(path, request.page);
        let content = self
            .driver
            .fetch(&RequestDescriptor::get(url.as_str()).timeout(self.timeout))
            .await?;
        // Past the last page the server answers 404.
        if content.status >= 400 {
            debug!("{} answered {}, treating as empty", url, content.status);
            return Ok(ListPage::empty());
        }
        if is_interstitial(&content.body) {
            warn!("{}: anti-bot gateway answered page {}", path, request.page);
            return Err(FetchError::Blocked(url));
        }
        Ok(ListPage {
            references: parse_static_list(&content.body, &url, path),
            total_known: None,
            last_page: false,
        })
    }
}

#[async_trait]
impl SiteAdapter for ShanghaiAdapter {
    type Key = ShanghaiKey;

    fn name(&self) -> &'static str {
        "shanghai"
    }

    /// Categories pick sheets (the four search sections and `按税种分类`);
    /// regions pick tax-type directories.
    fn keys(&self, selection: &Selection) -> Result<Vec<ShanghaiKey>, ConfigError> {
        let mut sheets: Vec<&str> = SEARCH_SECTIONS.iter().map(|(name, _)| *name).collect();
        sheets.push(TAX_TYPE_SHEET);
        let sheets = selection
            .categories
            .expand(&sheets, |name| ConfigError::UnknownCategory { site: "shanghai", name })?;
        let paths = selection
            .regions
            .expand(&TAX_PATHS, |name| ConfigError::UnknownRegion { site: "shanghai", name })?;

        let mut keys = Vec::new();
        for (section, filter) in SEARCH_SECTIONS {
            if sheets.iter().any(|s| s == section) {
                keys.push(ShanghaiKey::Search { section, filter });
            }
        }
        if sheets.iter().any(|s| s == TAX_TYPE_SHEET) {
            for path in TAX_PATHS {
                if paths.iter().any(|p| p == path) {
                    keys.push(ShanghaiKey::TaxType(path));
                }
            }
        }
        Ok(keys)
    }

    fn sections(&self) -> Vec<Section> {
        SEARCH_SECTIONS
            .iter()
            .map(|(name, _)| *name)
            .chain([TAX_TYPE_SHEET])
            .map(|name| Section::new(name, COLUMNS))
            .collect()
    }

    fn section_for(&self, key: &ShanghaiKey) -> Section {
        Section::new(key.section_name(), COLUMNS)
    }

    fn pagination(&self, key: &ShanghaiKey) -> Pagination {
        match key {
            ShanghaiKey::Search { .. } => Pagination {
                page_size: PAGE_SIZE,
                stop: StopPolicy::CountBased,
                max_pages: None,
            },
            ShanghaiKey::TaxType(_) => Pagination {
                page_size: PAGE_SIZE,
                stop: StopPolicy::content_based(),
                max_pages: Some(STATIC_PAGE_CAP),
            },
        }
    }

    async fn fetch_list_page(&self, key: &ShanghaiKey, request: &PageRequest) -> Result<ListPage, FetchError> {
        let page = match key {
            ShanghaiKey::Search { section, filter } => self.search_page(section, filter, request).await?,
            ShanghaiKey::TaxType(path) => self.static_page(path, request).await?,
        };
        debug!("{} page {}: {} link(s)", key, request.page, page.references.len());
        Ok(page)
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
