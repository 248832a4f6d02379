//! Site adapters: one per source, each bundling a listing fetcher, a detail
//! fetcher and a pagination policy behind [`SiteAdapter`].

use std::fmt;

use async_trait::async_trait;

use crate::config::Selection;
use crate::error::{ConfigError, FetchError};
use crate::model::{DetailFields, DocumentReference, ListPage, PageRequest, Section};

pub mod beijing;
pub mod ningbo;
pub mod shandong;
pub mod shanghai;

pub use beijing::BeijingAdapter;
pub use ningbo::NingboAdapter;
pub use shandong::ShandongAdapter;
pub use shanghai::ShanghaiAdapter;

/// Pages in a row without a single new reference before a content-based crawl gives up.
pub const CONSECUTIVE_EMPTY_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    CountBased,
    /// Stop after this many consecutive pages with nothing new. Used where the
    /// "last page" signal is unreliable; a later page with data is never reached.
    ContentBased { max_consecutive_empty: u32 },
}

impl StopPolicy {
    pub fn content_based() -> Self {
        StopPolicy::ContentBased {
            max_consecutive_empty: CONSECUTIVE_EMPTY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page_size: u32,
    pub stop: StopPolicy,
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageProgress {
    pub pages_requested: u32,
    pub raw_count: usize,
    pub last_batch_size: usize,
    /// Last total reported by the source; kept across failed pages.
    pub total_known: Option<u64>,
    pub consecutive_empty: u32,
    pub reached_end: bool,
}

impl Pagination {
    pub fn first_page(&self) -> PageRequest {
        PageRequest::first(self.page_size)
    }

    pub fn next(&self, current: &PageRequest, progress: &PageProgress) -> Option<PageRequest> {
        if progress.reached_end || self.max_pages.map_or(false, |max| current.page >= max) {
            return None;
        }
        match self.stop {
            StopPolicy::CountBased => {
                let total = progress.total_known?;
                let pages = total.div_ceil(u64::from(self.page_size.max(1)));
                if u64::from(current.page) < pages {
                    Some(current.next())
                } else {
                    None
                }
            }
            StopPolicy::ContentBased { max_consecutive_empty } => {
                if progress.consecutive_empty >= max_consecutive_empty {
                    None
                } else {
                    Some(current.next())
                }
            }
        }
    }
}

/// Capability bundle for one source.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    type Key: Clone + fmt::Display + Send + Sync;

    fn name(&self) -> &'static str;

    fn keys(&self, selection: &Selection) -> Result<Vec<Self::Key>, ConfigError>;

    fn sections(&self) -> Vec<Section>;

    fn section_for(&self, key: &Self::Key) -> Section;

    fn pagination(&self, key: &Self::Key) -> Pagination;

    fn first_page(&self, key: &Self::Key) -> PageRequest {
        self.pagination(key).first_page()
    }

    fn next_page_request(
        &self,
        key: &Self::Key,
        current: &PageRequest,
        progress: &PageProgress,
    ) -> Option<PageRequest> {
        self.pagination(key).next(current, progress)
    }

    fn identifier_from_link(&self, link: &str) -> Option<String> {
        let link = link.trim();
        if link.is_empty() {
            None
        } else {
            Some(link.to_string())
        }
    }

    async fn fetch_list_page(&self, key: &Self::Key, request: &PageRequest) -> Result<ListPage, FetchError>;

    async fn fetch_detail(&self, reference: &DocumentReference) -> Result<DetailFields, FetchError>;
}
