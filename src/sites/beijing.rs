//! National tax knowledge base, served from the Beijing bureau's host.
//!
//! The listing API is a JSON POST that already returns the full answer text,
//! so the detail step only resolves the effectiveness code.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Pagination, SiteAdapter, StopPolicy};
use crate::config::Selection;
use crate::driver::{PageDriver, RequestDescriptor, DEFAULT_TIMEOUT};
use crate::error::{ConfigError, FetchError};
use crate::extractor::Extractor;
use crate::model::{col, Column, DetailFields, DocumentReference, Field, ListPage, PageRequest, Section, LINK_HEADER};
use crate::status::StatusTable;

const LIST_API: &str = "https://znhd.beijing.chinatax.gov.cn:8443/zsknsrd/api/zsknsrdsjjsService/search/v1/listKnowledge";
const ORIGIN: &str = "https://znhd.beijing.chinatax.gov.cn:8443";
const REFERER: &str = "https://znhd.beijing.chinatax.gov.cn:8443/znhdzsknsrd/index?from=zcfg";
const PAGE_SIZE: u32 = 20;

pub const SHEET: &str = "政策数据";

const COLUMNS: &[Column] = &[
    col("地区", Field::Region),
    col("栏目", Field::Category),
    col("标题", Field::Title),
    col("文号", Field::DocNumber),
    col("发布日期", Field::PublishDate),
    col("生效日期", Field::Effectiveness),
    col("更新时间", Field::UpdatedAt),
    col("正文", Field::Body),
    col(LINK_HEADER, Field::Link),
];

/// Region name → `Zsqy` id, in enumeration order.
pub const REGIONS: [(&str, u32); 37] = [
    ("总局", 12703),
    ("北京", 12704),
    ("天津", 12709),
    ("河北", 12710),
    ("山西", 12711),
    ("内蒙古", 12712),
    ("辽宁", 12713),
    ("吉林", 12714),
    ("黑龙江", 12715),
    ("上海", 12716),
    ("江苏", 12717),
    ("浙江", 12718),
    ("安徽", 12719),
    ("福建", 12720),
    ("江西", 12721),
    ("山东", 12722),
    ("河南", 12723),
    ("湖北", 12724),
    ("湖南", 12725),
    ("广东", 12726),
    ("广西", 12727),
    ("四川", 12728),
    ("贵州", 12729),
    ("云南", 12730),
    ("西藏", 12731),
    ("陕西", 12732),
    ("甘肃", 12733),
    ("青海", 12734),
    ("宁夏", 12735),
    ("新疆", 12736),
    ("海南", 12739),
    ("重庆", 12740),
    ("大连", 12741),
    ("宁波", 12742),
    ("厦门", 12743),
    ("青岛", 12744),
    ("深圳", 12745),
];

/// Category name → `Field` id.
pub const CATEGORIES: [(&str, u32); 5] = [
    ("政策法规", 180),
    ("问题解答", 181),
    ("常用资料", 182),
    ("表证单书", 183),
    ("办税指南", 184),
];

/// One region × category listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeijingKey {
    pub region: String,
    pub region_id: u32,
    pub category: String,
    pub category_id: u32,
}

impl fmt::Display for BeijingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.region, self.category)
    }
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    #[serde(rename = "Response")]
    response: Option<ListResponse>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(rename = "Data")]
    data: Option<ListData>,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(rename = "List", default)]
    list: Vec<KnowledgeItem>,
    #[serde(rename = "Total", default)]
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct KnowledgeItem {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    question: Value,
    #[serde(default)]
    answer: Value,
    #[serde(default)]
    fwzh: Value,
    #[serde(default)]
    fwrq: Value,
    #[serde(rename = "updateTime", default)]
    update_time: Value,
    #[serde(default)]
    yxx: Value,
}

/// Strings and numbers as text; null and anything else as empty.
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn document_link(id: &str) -> String {
    format!("{}&id={}", REFERER, id)
}

pub struct BeijingAdapter {
    driver: Arc<dyn PageDriver>,
    statuses: StatusTable,
    extractor: Extractor,
    id_regex: Regex,
    timeout: Duration,
}

impl BeijingAdapter {
    pub fn new(driver: Arc<dyn PageDriver>, statuses: StatusTable) -> Self {
        BeijingAdapter {
            driver,
            statuses,
            extractor: Extractor::new(),
            id_regex: Regex::new(r"id=(\d+)").expect("id pattern"),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn payload(key: &BeijingKey, request: &PageRequest) -> Value {
        json!({
            "Field": key.category_id,
            "SortBy": "UpdateTime",
            "PageNumber": request.page,
            "PageSize": request.page_size,
            "Order": "desc",
            "Range": [1, 2, 6],
            "Ztfl": [],
            "Yxx": [],
            "Zssx": [[], []],
            "Text": "",
            "Zsqy": [key.region_id],
        })
    }

    fn parse_list(&self, key: &BeijingKey, body: &str) -> Result<ListPage, FetchError> {
        let envelope: ListEnvelope =
            serde_json::from_str(body).map_err(|e| FetchError::Decode(format!("knowledge list: {}", e)))?;
        let Some(data) = envelope.response.and_then(|r| r.data) else {
            return Ok(ListPage::empty());
        };

        let references = data
            .list
            .into_iter()
            .filter_map(|item| {
                let id = text(&item.id);
                if id.is_empty() {
                    return None;
                }
                Some(DocumentReference {
                    link: document_link(&id),
                    identifier: id,
                    title: text(&item.question),
                    region: key.region.clone(),
                    category: key.category.clone(),
                    doc_number: text(&item.fwzh),
                    publish_date: text(&item.fwrq),
                    updated_at: text(&item.update_time),
                    body: text(&item.answer),
                    status_code: code(&item.yxx),
                    ..Default::default()
                })
            })
            .collect();

        Ok(ListPage {
            references,
            total_known: data.total,
            last_page: false,
        })
    }
}

#[async_trait]
impl SiteAdapter for BeijingAdapter {
    type Key = BeijingKey;

    fn name(&self) -> &'static str {
        "beijing"
    }

    fn keys(&self, selection: &Selection) -> Result<Vec<BeijingKey>, ConfigError> {
        let region_names: Vec<&str> = REGIONS.iter().map(|(n, _)| *n).collect();
        let category_names: Vec<&str> = CATEGORIES.iter().map(|(n, _)| *n).collect();
        let regions = selection
            .regions
            .expand(&region_names, |name| ConfigError::UnknownRegion { site: "beijing", name })?;
        let categories = selection
            .categories
            .expand(&category_names, |name| ConfigError::UnknownCategory { site: "beijing", name })?;

        let mut keys = Vec::with_capacity(regions.len() * categories.len());
        for region in &regions {
            let Some((_, region_id)) = REGIONS.iter().find(|(n, _)| n == region) else {
                continue;
            };
            for category in &categories {
                let Some((_, category_id)) = CATEGORIES.iter().find(|(n, _)| n == category) else {
                    continue;
                };
                keys.push(BeijingKey {
                    region: region.clone(),
                    region_id: *region_id,
                    category: category.clone(),
                    category_id: *category_id,
                });
            }
        }
        Ok(keys)
    }

    fn sections(&self) -> Vec<Section> {
        vec![Section::new(SHEET, COLUMNS)]
    }

    fn section_for(&self, _key: &BeijingKey) -> Section {
        Section::new(SHEET, COLUMNS)
    }

    fn pagination(&self, _key: &BeijingKey) -> Pagination {
        Pagination {
            page_size: PAGE_SIZE,
            stop: StopPolicy::CountBased,
            max_pages: None,
        }
    }

    /// Links carry the numeric id as `id=<n>`.
    fn identifier_from_link(&self, link: &str) -> Option<String> {
        self.id_regex
            .captures(link)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    async fn fetch_list_page(&self, key: &BeijingKey, request: &PageRequest) -> Result<ListPage, FetchError> {
        let descriptor = RequestDescriptor::post_json(LIST_API, Self::payload(key, request))
            .header("Accept", "application/json, text/plain, */*")
            .header("Origin", ORIGIN)
            .header("Referer", REFERER)
            .timeout(self.timeout);
        let body = self.driver.fetch(&descriptor).await?.into_success(LIST_API)?;
        let page = self.parse_list(key, &body)?;
        debug!(
            "{} page {}: {} item(s), total {:?}",
            key,
            request.page,
            page.references.len(),
            page.total_known
        );
        Ok(page)
    }

    async fn fetch_detail(&self, reference: &DocumentReference) -> Result<DetailFields, FetchError> {
        let doc_number = if reference.doc_number.is_empty() {
            self.extractor.doc_number_from_body(&reference.body).unwrap_or_default()
        } else {
            String::new()
        };
        Ok(DetailFields {
            body: reference.body.clone(),
            doc_number,
            effectiveness: Some(self.statuses.resolve(reference.status_code)),
            ..Default::default()
        })
    }
}
