use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::FetchError;
use crate::model::{Attachment, DetailFields};

/// Turns the raw content of one detail page into `DetailFields`.
/// One implementation per site; the site configuration picks it.
pub trait DetailExtractor: Send + Sync {
    fn extract(&self, url: &str, content: &str) -> Result<DetailFields, FetchError>;
}

/// The anti-bot gateway in front of the bureau portals answers with its own
/// page, whose markup mentions `wzws`.
pub fn is_interstitial(content: &str) -> bool {
    content.contains("wzws") || content.contains("<title>安全检查")
}

const ATTACHMENT_EXTENSIONS: [&str; 7] = [".doc", ".docx", ".xls", ".xlsx", ".pdf", ".zip", ".rar"];

/// Field helpers shared by the site extractors.
pub struct Extractor {
    date_regex: Regex,
    doc_number_label: &'static str,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    pub fn new() -> Self {
        Extractor {
            // 2024-01-02, 2024/1/2, 2024年1月2日
            date_regex: Regex::new(r"\d{4}[-/年]\d{1,2}[-/月]\d{1,2}").expect("date pattern"),
            doc_number_label: "发布文号",
        }
    }

    /// First date-looking token in `text`, normalized to `YYYY-M-D` separators.
    pub fn first_date(&self, text: &str) -> Option<String> {
        self.date_regex.find(text).map(|m| {
            m.as_str()
                .replace('年', "-")
                .replace('月', "-")
                .replace('/', "-")
                .replace('日', "")
        })
    }

    /// Doc number announced as `【发布文号】...` near the top of the body.
    pub fn doc_number_from_body(&self, body: &str) -> Option<String> {
        let head: String = body.chars().take(300).collect();
        let (_, rest) = head.split_once(self.doc_number_label)?;
        let line = rest.lines().next().unwrap_or("");
        let candidate = line
            .replace('】', "")
            .replace(':', "")
            .replace('：', "")
            .trim()
            .to_string();
        if candidate.is_empty() {
            None
        } else {
            Some(candidate)
        }
    }

    /// Text of the first selector that matches with non-empty content.
    pub fn first_text(&self, document: &Html, selectors: &[&str], separator: &str) -> Option<String> {
        selectors
            .iter()
            .filter_map(|s| Selector::parse(s).ok())
            .find_map(|selector| {
                document
                    .select(&selector)
                    .map(|el| element_text(el, separator))
                    .find(|text| !text.is_empty())
            })
    }

    /// `content` of `<meta name="...">`.
    pub fn meta_content(&self, document: &Html, name: &str) -> Option<String> {
        let selector = Selector::parse(&format!(r#"meta[name="{}"]"#, name)).ok()?;
        document
            .select(&selector)
            .filter_map(|el| el.value().attr("content"))
            .map(|c| c.trim().to_string())
            .find(|c| !c.is_empty())
    }

    /// Links to downloadable office/archive files, resolved against the page URL.
    pub fn attachments(&self, document: &Html, page_url: &str) -> Vec<Attachment> {
        let Ok(selector) = Selector::parse("a[href]") else {
            return Vec::new();
        };
        let base = Url::parse(page_url).ok();
        let mut found: Vec<Attachment> = Vec::new();
        for element in document.select(&selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let lower = href.trim().to_lowercase();
            if !ATTACHMENT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
                continue;
            }
            let url = match &base {
                Some(base) => base.join(href.trim()).map(|u| u.to_string()).unwrap_or_else(|_| href.to_string()),
                None => href.to_string(),
            };
            if found.iter().any(|a| a.url == url) {
                continue;
            }
            let name = element_text(element, "");
            found.push(Attachment {
                name: if name.is_empty() { url.clone() } else { name },
                url,
            });
        }
        found
    }
}

/// Trimmed text nodes of an element joined with `separator`.
pub fn element_text(element: ElementRef<'_>, separator: &str) -> String {
    element
        .text()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Resolves `href` against `base`; empty when `href` is.
pub fn absolute_link(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() {
        return String::new();
    }
    Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
