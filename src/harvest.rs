//! The harvest loop. It alone owns the checkpoint and the in-memory workbook;
//! detail results are folded in one at a time, and saves only happen between
//! pages once the page's fetches have drained.

use std::collections::HashSet;
use std::pin::pin;

use futures::StreamExt;
use log::{error, info, warn};

use crate::config::{HarvestConfig, Selection};
use crate::delay_manager;
use crate::error::ConfigError;
use crate::model::{DocumentReference, HarvestedRecord, ListPage, PageRequest, Section};
use crate::resume_manager::CheckpointSet;
use crate::scheduler::{Completed, FetchScheduler};
use crate::sites::{PageProgress, SiteAdapter};
use crate::store::{save_with_retry, RecordStore, Workbook};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyStats {
    pub key: String,
    pub pages: u32,
    pub new_records: usize,
    pub failed_details: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub keys: Vec<KeyStats>,
    pub saves: usize,
    pub failed_saves: usize,
}

impl RunStats {
    pub fn new_records(&self) -> usize {
        self.keys.iter().map(|k| k.new_records).sum()
    }

    pub fn failed_details(&self) -> usize {
        self.keys.iter().map(|k| k.failed_details).sum()
    }
}

pub struct Harvester<'a, A, S>
where
    A: SiteAdapter,
    S: RecordStore + ?Sized,
{
    adapter: &'a A,
    store: &'a S,
    config: HarvestConfig,
    scheduler: FetchScheduler,
    checkpoint: CheckpointSet,
    workbook: Workbook,
    since_flush: usize,
    backed_up: bool,
    stats: RunStats,
}

impl<'a, A, S> Harvester<'a, A, S>
where
    A: SiteAdapter,
    S: RecordStore + ?Sized,
{
    /// Loads the prior artifact into the workbook and the checkpoint. A missing
    /// or unreadable artifact means a fresh harvest.
    pub fn new(adapter: &'a A, store: &'a S, config: HarvestConfig) -> Self {
        let (prior, checkpoint) = CheckpointSet::load(store, |link| adapter.identifier_from_link(link));
        let workbook = Workbook::with_sections(&adapter.sections(), prior);
        let scheduler = FetchScheduler::new(config.concurrency, config.fetch_timeout);
        Harvester {
            adapter,
            store,
            config,
            scheduler,
            checkpoint,
            workbook,
            since_flush: 0,
            backed_up: false,
            stats: RunStats::default(),
        }
    }

    pub fn checkpoint(&self) -> &CheckpointSet {
        &self.checkpoint
    }

    pub fn workbook(&self) -> &Workbook {
        &self.workbook
    }

    pub async fn run(&mut self, keys: &[A::Key]) -> RunStats {
        for (i, key) in keys.iter().enumerate() {
            info!("[{}/{}] Harvesting {} - {}", i + 1, keys.len(), self.adapter.name(), key);
            let stats = self.harvest_key(key).await;
            if stats.pages == 1 && stats.new_records == 0 {
                info!("    {}: nothing new", key);
            } else {
                info!(
                    "    {}: {} new record(s) over {} page(s), {} failed detail(s)",
                    key, stats.new_records, stats.pages, stats.failed_details
                );
            }
            self.stats.keys.push(stats);
        }

        self.flush().await;
        info!(
            "Harvest finished: {} new record(s), {} failed detail(s), {} save(s) ({} failed). {} rows in {:?}.",
            self.stats.new_records(),
            self.stats.failed_details(),
            self.stats.saves,
            self.stats.failed_saves,
            self.workbook.row_count(),
            self.store.location()
        );
        self.stats.clone()
    }

    /// One key's sub-crawl. Never fails: listing failures become empty pages and
    /// detail failures become error-marker records.
    pub async fn harvest_key(&mut self, key: &A::Key) -> KeyStats {
        let adapter = self.adapter;
        let section = adapter.section_for(key);
        let mut stats = KeyStats {
            key: key.to_string(),
            ..Default::default()
        };
        let mut progress = PageProgress::default();
        let mut request = Some(adapter.first_page(key));

        while let Some(current) = request.take() {
            let page = self.list_page(key, &current).await;
            stats.pages += 1;

            if page.total_known.is_some() {
                progress.total_known = page.total_known;
            }
            progress.reached_end = page.last_page;
            let raw_count = page.references.len();
            let fresh = self.fresh_references(page.references);
            progress.pages_requested = stats.pages;
            progress.raw_count = raw_count;
            progress.last_batch_size = fresh.len();
            progress.consecutive_empty = if fresh.is_empty() {
                progress.consecutive_empty + 1
            } else {
                0
            };

            if !fresh.is_empty() {
                info!(
                    "    page {}: {} listed, {} new{}",
                    current.page,
                    raw_count,
                    fresh.len(),
                    progress
                        .total_known
                        .map(|t| format!(" (source reports {} total)", t))
                        .unwrap_or_default()
                );
                let mut completed = pin!(self.scheduler.dispatch(adapter, fresh));
                while let Some(done) = completed.next().await {
                    self.accept(&section, done, &mut stats);
                }
            }
            if self.since_flush >= self.config.flush_threshold {
                self.flush().await;
            }

            request = adapter.next_page_request(key, &current, &progress);
        }
        stats
    }

    /// Fetches one listing page, retrying transient failures. A page that keeps
    /// failing counts as empty with no known total.
    async fn list_page(&self, key: &A::Key, request: &PageRequest) -> ListPage {
        let attempts = self.config.list_attempts.max(1);
        for attempt in 1..=attempts {
            match self.adapter.fetch_list_page(key, request).await {
                Ok(page) => return page,
                Err(e) => {
                    warn!(
                        "Listing page {} of {} failed (attempt {}/{}): {}",
                        request.page, key, attempt, attempts, e
                    );
                    if attempt < attempts {
                        delay_manager::list_retry(self.config.list_retry_delay).await;
                    }
                }
            }
        }
        ListPage::empty()
    }

    fn fresh_references(&self, references: Vec<DocumentReference>) -> Vec<DocumentReference> {
        let mut seen = HashSet::new();
        references
            .into_iter()
            .filter(|r| {
                !r.identifier.is_empty()
                    && !self.checkpoint.contains(&r.identifier)
                    && seen.insert(r.identifier.clone())
            })
            .collect()
    }

    fn accept(&mut self, section: &Section, done: Completed, stats: &mut KeyStats) {
        if !self.checkpoint.add(done.reference.identifier.clone()) {
            return;
        }
        let record = HarvestedRecord::merge(done.reference, done.detail);
        if record.failed {
            stats.failed_details += 1;
        }
        self.workbook.append(section, &record);
        stats.new_records += 1;
        self.since_flush += 1;
    }

    /// Saves the whole workbook. A failed save keeps every row in memory and the
    /// next flush point tries again.
    async fn flush(&mut self) -> bool {
        if !self.backed_up {
            match self.store.backup() {
                Ok(Some(path)) => info!("Backed up previous output to {:?}", path),
                Ok(None) => {}
                Err(e) => warn!("Could not back up previous output: {}", e),
            }
            self.backed_up = true;
        }

        self.since_flush = 0;
        self.stats.saves += 1;
        let result = save_with_retry(
            self.store,
            &self.workbook,
            self.config.save_attempts,
            self.config.save_backoff,
        )
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                self.stats.failed_saves += 1;
                if e.is_locked() {
                    error!(
                        "Save failed: {}. Rows are kept in memory; close the spreadsheet before the next save.",
                        e
                    );
                } else {
                    error!("Save failed: {}. Rows are kept in memory and the next save retries.", e);
                }
                false
            }
        }
    }
}

/// Expands the selection, then harvests every key into `store`. Only an
/// invalid selection fails, and it fails before any network activity.
pub async fn harvest<A, S>(
    adapter: &A,
    store: &S,
    config: HarvestConfig,
    selection: &Selection,
) -> Result<RunStats, ConfigError>
where
    A: SiteAdapter,
    S: RecordStore + ?Sized,
{
    config.validate()?;
    let keys = adapter.keys(selection)?;
    let mut harvester = Harvester::new(adapter, store, config);
    Ok(harvester.run(&keys).await)
}
