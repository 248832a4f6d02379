use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use tax_policy_harvester::config::Choice;
use tax_policy_harvester::model::{col, Column, Field, FAILURE_MARKER, LINK_HEADER};
use tax_policy_harvester::sites::{Pagination, StopPolicy};
use tax_policy_harvester::store::{CsvStore, Sheet};
use tax_policy_harvester::{
    harvest, ConfigError, DetailFields, DocumentReference, FetchError, HarvestConfig, Harvester, ListPage,
    PageRequest, RecordStore, Section, Selection, SiteAdapter, StoreError, Workbook,
};

const COLUMNS: &[Column] = &[
    col("标题", Field::Title),
    col("正文", Field::Body),
    col(LINK_HEADER, Field::Link),
];

/// Keeps the saved workbook in memory and can pretend the file is locked.
struct MemoryStore {
    path: PathBuf,
    saved: Mutex<Option<Workbook>>,
    saves: AtomicUsize,
    attempts: AtomicUsize,
    locked_attempts: AtomicUsize,
}

impl MemoryStore {
    fn new() -> Self {
        MemoryStore {
            path: PathBuf::from("memory.xlsx"),
            saved: Mutex::new(None),
            saves: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            locked_attempts: AtomicUsize::new(0),
        }
    }

    fn with_prior(book: Workbook) -> Self {
        let store = MemoryStore::new();
        *store.saved.lock().unwrap() = Some(book);
        store
    }

    fn lock_for(&self, attempts: usize) {
        self.locked_attempts.store(attempts, Ordering::SeqCst);
    }

    fn saved(&self) -> Workbook {
        self.saved.lock().unwrap().clone().expect("nothing saved")
    }

    fn rows(&self, sheet: &str) -> usize {
        self.saved().sheet(sheet).map_or(0, |s| s.rows.len())
    }
}

impl RecordStore for MemoryStore {
    fn location(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Workbook, StoreError> {
        self.saved
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| StoreError::Missing(self.path.clone()))
    }

    fn save(&self, book: &Workbook) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let locked = self.locked_attempts.load(Ordering::SeqCst);
        if locked > 0 {
            self.locked_attempts.store(locked - 1, Ordering::SeqCst);
            return Err(StoreError::Locked(self.path.clone()));
        }
        *self.saved.lock().unwrap() = Some(book.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type Script = Vec<Result<ListPage, FetchError>>;

/// Serves scripted listing pages per key. Links containing `broken` fail their detail fetch.
struct ScriptedSite {
    keys: Vec<String>,
    pagination: Pagination,
    pages: HashMap<String, Script>,
    list_requests: Mutex<Vec<(String, u32)>>,
    detail_requests: AtomicUsize,
}

impl ScriptedSite {
    fn new(pagination: Pagination) -> Self {
        ScriptedSite {
            keys: Vec::new(),
            pagination,
            pages: HashMap::new(),
            list_requests: Mutex::new(Vec::new()),
            detail_requests: AtomicUsize::new(0),
        }
    }

    fn key(mut self, key: &str, pages: Script) -> Self {
        self.keys.push(key.to_string());
        self.pages.insert(key.to_string(), pages);
        self
    }

    fn list_requests_for(&self, key: &str) -> Vec<u32> {
        self.list_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, page)| *page)
            .collect()
    }
}

#[async_trait]
impl SiteAdapter for ScriptedSite {
    type Key = String;

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn keys(&self, selection: &Selection) -> Result<Vec<String>, ConfigError> {
        let universe: Vec<&str> = self.keys.iter().map(String::as_str).collect();
        selection
            .categories
            .expand(&universe, |name| ConfigError::UnknownCategory { site: "scripted", name })
    }

    fn sections(&self) -> Vec<Section> {
        vec![Section::new("docs", COLUMNS)]
    }

    fn section_for(&self, _key: &String) -> Section {
        Section::new("docs", COLUMNS)
    }

    fn pagination(&self, _key: &String) -> Pagination {
        self.pagination
    }

    async fn fetch_list_page(&self, key: &String, request: &PageRequest) -> Result<ListPage, FetchError> {
        self.list_requests.lock().unwrap().push((key.clone(), request.page));
        self.pages
            .get(key)
            .and_then(|pages| pages.get(request.page as usize - 1))
            .cloned()
            .unwrap_or_else(|| Ok(ListPage::empty()))
    }

    async fn fetch_detail(&self, reference: &DocumentReference) -> Result<DetailFields, FetchError> {
        self.detail_requests.fetch_add(1, Ordering::SeqCst);
        // A request then a settle wait; later documents take longer to answer.
        let n: u64 = reference.link.rsplit('/').next().and_then(|n| n.parse().ok()).unwrap_or(1);
        tokio::time::sleep(Duration::from_millis(5 * n)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        if reference.link.contains("broken") {
            return Err(FetchError::Status {
                status: 502,
                url: reference.link.clone(),
            });
        }
        Ok(DetailFields {
            body: format!("body of {}", reference.title),
            ..Default::default()
        })
    }
}

fn refs(prefix: &str, range: std::ops::RangeInclusive<usize>) -> Vec<DocumentReference> {
    range
        .map(|i| {
            let link = format!("https://docs.test/{}/{}", prefix, i);
            DocumentReference {
                identifier: link.clone(),
                title: format!("{} #{}", prefix, i),
                link,
                ..Default::default()
            }
        })
        .collect()
}

fn page(references: Vec<DocumentReference>, total: Option<u64>) -> Result<ListPage, FetchError> {
    Ok(ListPage {
        references,
        total_known: total,
        last_page: false,
    })
}

fn count_based(page_size: u32) -> Pagination {
    Pagination {
        page_size,
        stop: StopPolicy::CountBased,
        max_pages: None,
    }
}

fn config() -> HarvestConfig {
    HarvestConfig {
        concurrency: 4,
        list_retry_delay: Duration::ZERO,
        save_backoff: Duration::from_secs(1),
        ..HarvestConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn count_based_key_reads_exactly_the_reported_pages() {
    let site = ScriptedSite::new(count_based(20)).key(
        "policies",
        vec![
            page(refs("p", 1..=20), Some(47)),
            page(refs("p", 21..=40), Some(47)),
            page(refs("p", 41..=47), Some(47)),
            page(refs("p", 48..=52), Some(47)),
        ],
    );
    let store = MemoryStore::new();

    let stats = harvest(&site, &store, config(), &Selection::all()).await.unwrap();

    assert_eq!(site.list_requests_for("policies"), vec![1, 2, 3]);
    assert_eq!(stats.new_records(), 47);
    assert_eq!(store.rows("docs"), 47);
}

#[tokio::test(start_paused = true)]
async fn content_based_key_stops_after_three_empty_pages() {
    let pagination = Pagination {
        page_size: 15,
        stop: StopPolicy::content_based(),
        max_pages: None,
    };
    let site = ScriptedSite::new(pagination).key(
        "static",
        vec![page(vec![], None), page(vec![], None), page(vec![], None), page(refs("late", 1..=15), None)],
    );
    let store = MemoryStore::new();

    let stats = harvest(&site, &store, config(), &Selection::all()).await.unwrap();

    assert_eq!(site.list_requests_for("static"), vec![1, 2, 3]);
    assert_eq!(stats.new_records(), 0);
    assert_eq!(site.detail_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn second_run_over_the_same_output_adds_nothing() {
    let site = ScriptedSite::new(count_based(10))
        .key("a", vec![page(refs("a", 1..=10), Some(12)), page(refs("a", 11..=12), Some(12))])
        .key("b", vec![page(refs("b", 1..=5), Some(5))]);
    let store = MemoryStore::new();

    let first = harvest(&site, &store, config(), &Selection::all()).await.unwrap();
    assert_eq!(first.new_records(), 17);
    let after_first = store.saved();
    let details_after_first = site.detail_requests.load(Ordering::SeqCst);

    let second = harvest(&site, &store, config(), &Selection::all()).await.unwrap();
    assert_eq!(second.new_records(), 0);
    assert_eq!(site.detail_requests.load(Ordering::SeqCst), details_after_first);
    assert_eq!(store.saved(), after_first);
}

#[tokio::test(start_paused = true)]
async fn saves_happen_at_each_threshold_and_once_at_the_end() {
    let pages = (0..19)
        .map(|i| page(refs("bulk", i * 50 + 1..=i * 50 + 50), Some(950)))
        .collect();
    let site = ScriptedSite::new(count_based(50)).key("bulk", pages);
    let store = MemoryStore::new();
    let config = HarvestConfig {
        flush_threshold: 300,
        concurrency: 20,
        ..config()
    };

    let stats = harvest(&site, &store, config, &Selection::all()).await.unwrap();

    assert_eq!(stats.new_records(), 950);
    assert_eq!(stats.saves, 4);
    assert_eq!(store.saves.load(Ordering::SeqCst), 4);
    assert_eq!(store.rows("docs"), 950);
}

#[tokio::test(start_paused = true)]
async fn a_failing_key_does_not_stop_the_next_one() {
    let down = vec![Err(FetchError::Connection("refused".into()))];
    let site = ScriptedSite::new(count_based(10))
        .key("down", down)
        .key("up", vec![page(refs("up", 1..=3), Some(3))]);
    let store = MemoryStore::new();
    let config = HarvestConfig {
        list_attempts: 1,
        ..config()
    };

    let stats = harvest(&site, &store, config, &Selection::all()).await.unwrap();

    assert_eq!(site.list_requests_for("down"), vec![1]);
    assert_eq!(stats.keys[0].new_records, 0);
    assert_eq!(stats.keys[1].new_records, 3);
    assert_eq!(store.rows("docs"), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_listing_pages_are_retried_then_skipped() {
    let site = ScriptedSite::new(count_based(10)).key(
        "gappy",
        vec![
            page(refs("g", 1..=10), Some(25)),
            Err(FetchError::Timeout(Duration::from_secs(15))),
            page(refs("g", 21..=25), Some(25)),
        ],
    );
    let store = MemoryStore::new();
    let config = HarvestConfig {
        list_attempts: 2,
        ..config()
    };

    let stats = harvest(&site, &store, config, &Selection::all()).await.unwrap();

    // Page 2 is tried twice; the remembered total still leads to page 3.
    assert_eq!(site.list_requests_for("gappy"), vec![1, 2, 2, 3]);
    assert_eq!(stats.new_records(), 15);
}

#[tokio::test(start_paused = true)]
async fn failed_details_are_recorded_with_the_marker_and_not_retried() {
    let mut references = refs("ok", 1..=3);
    references.extend(refs("broken", 1..=1));
    let site = ScriptedSite::new(count_based(10)).key("mixed", vec![page(references, Some(4))]);
    let store = MemoryStore::new();

    let stats = harvest(&site, &store, config(), &Selection::all()).await.unwrap();
    assert_eq!(stats.new_records(), 4);
    assert_eq!(stats.failed_details(), 1);

    let book = store.saved();
    let sheet = book.sheet("docs").unwrap();
    let body = sheet.column("正文").unwrap();
    let link = sheet.column(LINK_HEADER).unwrap();
    let broken = sheet.rows.iter().find(|r| r[link].contains("broken")).unwrap();
    assert!(broken[body].starts_with(FAILURE_MARKER));

    let again = harvest(&site, &store, config(), &Selection::all()).await.unwrap();
    assert_eq!(again.new_records(), 0);
}

#[tokio::test(start_paused = true)]
async fn prior_rows_are_kept_and_remapped_onto_the_schema() {
    let mut prior = Sheet::new("docs", vec![LINK_HEADER.to_string(), "标题".to_string()]);
    prior.rows.push(vec!["https://docs.test/p/1".into(), "old title".into()]);
    let store = MemoryStore::with_prior(Workbook::from_sheets(vec![prior]));
    let site = ScriptedSite::new(count_based(10)).key("p", vec![page(refs("p", 1..=3), Some(3))]);

    let stats = harvest(&site, &store, config(), &Selection::all()).await.unwrap();
    assert_eq!(stats.new_records(), 2);

    let book = store.saved();
    let sheet = book.sheet("docs").unwrap();
    assert_eq!(sheet.headers, vec!["标题", "正文", LINK_HEADER]);
    assert_eq!(sheet.rows[0], vec!["old title", "", "https://docs.test/p/1"]);
    assert_eq!(sheet.rows.len(), 3);
    assert!(sheet.rows.iter().all(|r| r.len() == 3));
}

#[tokio::test(start_paused = true)]
async fn locked_output_is_retried_until_released() {
    let site = ScriptedSite::new(count_based(10)).key("k", vec![page(refs("k", 1..=5), Some(5))]);
    let store = MemoryStore::new();
    store.lock_for(2);
    let config = HarvestConfig {
        save_attempts: 3,
        ..config()
    };

    let stats = harvest(&site, &store, config, &Selection::all()).await.unwrap();

    assert_eq!(stats.failed_saves, 0);
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(store.rows("docs"), 5);
}

#[tokio::test(start_paused = true)]
async fn rows_survive_a_failed_save_until_the_next_one() {
    let site = ScriptedSite::new(count_based(10))
        .key("first", vec![page(refs("first", 1..=4), Some(4))])
        .key("second", vec![page(refs("second", 1..=2), Some(2))]);
    let store = MemoryStore::new();
    let config = HarvestConfig {
        save_attempts: 2,
        ..config()
    };
    let mut harvester = Harvester::new(&site, &store, config);

    store.lock_for(2);
    let stats = harvester.run(&["first".to_string()]).await;
    assert_eq!(stats.failed_saves, 1);
    assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    assert_eq!(harvester.workbook().row_count(), 4);

    let stats = harvester.run(&["second".to_string()]).await;
    assert_eq!(stats.saves, 2);
    assert_eq!(store.rows("docs"), 6);
}

#[tokio::test]
async fn unknown_selection_fails_before_any_request() {
    let site = ScriptedSite::new(count_based(10)).key("k", vec![page(refs("k", 1..=1), Some(1))]);
    let store = MemoryStore::new();
    let selection = Selection {
        regions: Choice::All,
        categories: Choice::parse("nope"),
    };

    let err = harvest(&site, &store, config(), &selection).await.unwrap_err();

    assert_eq!(
        err,
        ConfigError::UnknownCategory {
            site: "scripted",
            name: "nope".into()
        }
    );
    assert!(site.list_requests.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn saves_wait_for_in_flight_fetches() {
    let site = ScriptedSite::new(count_based(8)).key("slow", vec![page(refs("slow", 1..=8), Some(8))]);
    let store = MemoryStore::new();
    store.lock_for(1);
    let config = HarvestConfig {
        concurrency: 4,
        flush_threshold: 2,
        fetch_timeout: Duration::from_secs(1),
        save_attempts: 2,
        save_backoff: Duration::from_secs(10),
        ..config()
    };

    let stats = harvest(&site, &store, config, &Selection::all()).await.unwrap();

    assert_eq!(stats.failed_details(), 0);
    assert_eq!(stats.new_records(), 8);
    assert_eq!(stats.failed_saves, 0);
    // One save after the page (locked once, then written) and the final one.
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    let book = store.saved();
    let sheet = book.sheet("docs").unwrap();
    let body = sheet.column("正文").unwrap();
    assert!(sheet.rows.iter().all(|r| !r[body].starts_with(FAILURE_MARKER)));
}

#[tokio::test(start_paused = true)]
async fn unreadable_csv_does_not_cost_earlier_rows() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(
        out.join("docs.csv"),
        "标题,正文,链接\nold #1,body,https://docs.test/old/1\nold #2,body,https://docs.test/old/2\n",
    )
    .unwrap();
    // GBK text saved by a spreadsheet program.
    let gbk = [0xb1u8, 0xea, 0xcc, 0xe2, b'\n'];
    std::fs::write(out.join("notes.csv"), gbk).unwrap();

    let site = ScriptedSite::new(count_based(10)).key(
        "mixed",
        vec![page(
            refs("old", 1..=2).into_iter().chain(refs("new", 1..=1)).collect(),
            Some(3),
        )],
    );
    let store = CsvStore::new(&out);

    let stats = harvest(&site, &store, config(), &Selection::all()).await.unwrap();
    assert_eq!(stats.new_records(), 1);
    assert_eq!(stats.failed_saves, 0);

    let saved = std::fs::read_to_string(out.join("docs.csv")).unwrap();
    assert!(saved.contains("https://docs.test/old/1"));
    assert!(saved.contains("https://docs.test/old/2"));
    assert!(saved.contains("https://docs.test/new/1"));
    assert_eq!(std::fs::read(out.join("notes.csv")).unwrap(), gbk);
    assert!(dir.path().join("out.bak").join("docs.csv").exists());
}
