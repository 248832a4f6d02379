use std::collections::HashSet;
use log::{info, warn};

use crate::error::StoreError;
use crate::model::LINK_HEADER;
use crate::store::{RecordStore, Workbook};

/// Identifiers already harvested, by this run or an earlier one.
#[derive(Debug, Default, Clone)]
pub struct CheckpointSet {
    ids: HashSet<String>,
}

impl CheckpointSet {
    pub fn new() -> Self {
        CheckpointSet::default()
    }

    /// Collects the identifier behind every link cell of every sheet.
    /// Sheets without a link column contribute nothing.
    pub fn from_workbook<F>(book: &Workbook, identify: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let ids = book
            .sheets()
            .iter()
            .flat_map(|sheet| sheet.values(LINK_HEADER))
            .filter_map(|link| identify(link))
            .collect();
        CheckpointSet { ids }
    }

    /// Reads the prior artifact. Never fails: a missing or unreadable artifact is
    /// treated as no history and the run starts fresh.
    pub fn load<S, F>(store: &S, identify: F) -> (Workbook, Self)
    where
        S: RecordStore + ?Sized,
        F: Fn(&str) -> Option<String>,
    {
        match store.load() {
            Ok(book) => {
                let checkpoint = CheckpointSet::from_workbook(&book, identify);
                info!(
                    "Resumed previous session: {} documents already in {:?}.",
                    checkpoint.len(),
                    store.location()
                );
                (book, checkpoint)
            }
            Err(StoreError::Missing(_)) => {
                info!("No previous output at {:?}. Starting fresh.", store.location());
                (Workbook::new(), CheckpointSet::new())
            }
            Err(e) => {
                warn!("Failed to read previous output: {}. Starting fresh.", e);
                (Workbook::new(), CheckpointSet::new())
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn add(&mut self, id: impl Into<String>) -> bool {
        self.ids.insert(id.into())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
