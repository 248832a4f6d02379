use crate::error::FetchError;
use crate::status::Effectiveness;

/// Header of the column every section stores its document link in.
pub const LINK_HEADER: &str = "链接";

/// Prefix written into the body of a record whose detail fetch failed.
pub const FAILURE_MARKER: &str = "抓取失败";

/// A candidate document seen on a listing page, before any detail fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentReference {
    pub identifier: String,
    pub title: String,
    pub link: String,
    pub region: String,
    pub category: String,
    pub doc_number: String,
    pub issuing_unit: String,
    pub publish_date: String,
    pub updated_at: String,
    pub body: String,
    pub status_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailFields {
    pub title: String,
    pub body: String,
    pub doc_number: String,
    pub issuing_unit: String,
    pub publish_date: String,
    pub effectiveness: Option<Effectiveness>,
    pub tax_related: Option<String>,
    pub attachments: Vec<Attachment>,
    pub failed: bool,
}

impl DetailFields {
    /// The value recorded in place of a detail page that could not be fetched or parsed.
    pub fn failed(err: &FetchError) -> Self {
        DetailFields {
            body: format!("{}: {}", FAILURE_MARKER, err),
            failed: true,
            ..Default::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarvestedRecord {
    pub identifier: String,
    pub region: String,
    pub category: String,
    pub title: String,
    pub link: String,
    pub doc_number: String,
    pub issuing_unit: String,
    pub publish_date: String,
    pub updated_at: String,
    pub effectiveness: String,
    pub tax_related: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub failed: bool,
}

fn prefer(listing: String, detail: String) -> String {
    if listing.trim().is_empty() {
        detail
    } else {
        listing
    }
}

impl HarvestedRecord {
    /// Merges listing metadata with detail fields: a non-empty listing value wins,
    /// otherwise the detail value is used.
    pub fn merge(reference: DocumentReference, detail: DetailFields) -> Self {
        let failed = detail.is_failure();
        HarvestedRecord {
            identifier: reference.identifier,
            region: reference.region,
            category: reference.category,
            title: prefer(reference.title, detail.title),
            link: reference.link,
            doc_number: prefer(reference.doc_number, detail.doc_number),
            issuing_unit: prefer(reference.issuing_unit, detail.issuing_unit),
            publish_date: prefer(reference.publish_date, detail.publish_date),
            updated_at: reference.updated_at,
            effectiveness: detail.effectiveness.map(|e| e.label()).unwrap_or_default(),
            tax_related: detail.tax_related.unwrap_or_default(),
            body: prefer(detail.body, reference.body),
            attachments: detail.attachments,
            failed,
        }
    }

    pub fn cell(&self, field: Field) -> String {
        match field {
            Field::Region => self.region.clone(),
            Field::Category => self.category.clone(),
            Field::Title => self.title.clone(),
            Field::DocNumber => self.doc_number.clone(),
            Field::IssuingUnit => self.issuing_unit.clone(),
            Field::PublishDate => self.publish_date.clone(),
            Field::Effectiveness => self.effectiveness.clone(),
            Field::UpdatedAt => self.updated_at.clone(),
            Field::TaxRelated => self.tax_related.clone(),
            Field::Body => self.body.clone(),
            Field::AttachmentNames => join(self.attachments.iter().map(|a| a.name.as_str())),
            Field::AttachmentLinks => join(self.attachments.iter().map(|a| a.url.as_str())),
            Field::Link => self.link.clone(),
        }
    }
}

fn join<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts.collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Region,
    Category,
    Title,
    DocNumber,
    IssuingUnit,
    PublishDate,
    Effectiveness,
    UpdatedAt,
    TaxRelated,
    Body,
    AttachmentNames,
    AttachmentLinks,
    Link,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub header: &'static str,
    pub field: Field,
}

pub const fn col(header: &'static str, field: Field) -> Column {
    Column { header, field }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Section {
    pub fn new(name: impl Into<String>, columns: &[Column]) -> Self {
        Section {
            name: name.into(),
            columns: columns.to_vec(),
        }
    }

    pub fn headers(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.header.to_string()).collect()
    }

    pub fn row(&self, record: &HarvestedRecord) -> Vec<String> {
        self.columns.iter().map(|c| record.cell(c.field)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn first(page_size: u32) -> Self {
        PageRequest { page: 1, page_size }
    }

    pub fn next(&self) -> Self {
        PageRequest {
            page: self.page + 1,
            page_size: self.page_size,
        }
    }

    /// Inclusive 1-based record range covered by this page.
    pub fn record_range(&self) -> (u32, u32) {
        let start = (self.page - 1) * self.page_size + 1;
        (start, start + self.page_size - 1)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub references: Vec<DocumentReference>,
    pub total_known: Option<u64>,
    /// The source says there is nothing after this page.
    pub last_page: bool,
}

impl ListPage {
    pub fn empty() -> Self {
        ListPage::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMNS: &[Column] = &[
        col("标题", Field::Title),
        col("文号", Field::DocNumber),
        col("附件文件名", Field::AttachmentNames),
        col("附件链接", Field::AttachmentLinks),
        col(LINK_HEADER, Field::Link),
    ];

    #[test]
    fn listing_values_win_when_present() {
        let reference = DocumentReference {
            identifier: "1".into(),
            title: "Listing title".into(),
            doc_number: "".into(),
            publish_date: "2024-01-02".into(),
            ..Default::default()
        };
        let detail = DetailFields {
            title: "Detail title".into(),
            doc_number: "税总发〔2024〕1号".into(),
            publish_date: "2024-01-03".into(),
            body: "text".into(),
            ..Default::default()
        };
        let record = HarvestedRecord::merge(reference, detail);
        assert_eq!(record.title, "Listing title");
        assert_eq!(record.doc_number, "税总发〔2024〕1号");
        assert_eq!(record.publish_date, "2024-01-02");
        assert_eq!(record.body, "text");
    }

    #[test]
    fn failed_detail_keeps_marker_in_body() {
        let reference = DocumentReference {
            body: "listing body".into(),
            ..Default::default()
        };
        let detail = DetailFields::failed(&FetchError::Connection("reset".into()));
        let record = HarvestedRecord::merge(reference, detail);
        assert!(record.failed);
        assert!(record.body.starts_with(FAILURE_MARKER));
    }

    #[test]
    fn rows_are_padded_to_every_column() {
        let section = Section::new("s", COLUMNS);
        let record = HarvestedRecord {
            title: "t".into(),
            link: "http://x/1".into(),
            ..Default::default()
        };
        let row = section.row(&record);
        assert_eq!(row.len(), COLUMNS.len());
        assert_eq!(row, vec!["t", "", "", "", "http://x/1"]);
    }

    #[test]
    fn attachments_are_joined() {
        let record = HarvestedRecord {
            attachments: vec![
                Attachment { name: "a.pdf".into(), url: "http://x/a.pdf".into() },
                Attachment { name: "b.doc".into(), url: "http://x/b.doc".into() },
            ],
            ..Default::default()
        };
        assert_eq!(record.cell(Field::AttachmentNames), "a.pdf; b.doc");
        assert_eq!(record.cell(Field::AttachmentLinks), "http://x/a.pdf; http://x/b.doc");
    }

    #[test]
    fn record_range_follows_page_index() {
        let first = PageRequest::first(45);
        assert_eq!(first.record_range(), (1, 45));
        assert_eq!(first.next().record_range(), (46, 90));
    }
}
