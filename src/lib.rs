pub mod config;
pub mod delay_manager;
pub mod driver;
pub mod error;
pub mod extractor;
pub mod harvest;
pub mod logger;
pub mod model;
pub mod resume_manager;
pub mod scheduler;
pub mod sites;
pub mod status;
pub mod store;

// Exporting types for convenience
pub use config::{Cli, HarvestConfig, Selection, Site};
pub use driver::{BrowserDriver, HttpDriver, PageAction, PageDriver, RequestDescriptor};
pub use error::{ConfigError, FetchError, StoreError};
pub use harvest::{harvest, Harvester, RunStats};
pub use model::{DetailFields, DocumentReference, HarvestedRecord, ListPage, PageRequest, Section};
pub use resume_manager::CheckpointSet;
pub use sites::{BeijingAdapter, NingboAdapter, ShandongAdapter, ShanghaiAdapter, SiteAdapter};
pub use status::{Effectiveness, StatusTable};
pub use store::{open_store, RecordStore, Workbook};
