use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use calamine::{open_workbook, Reader, Xlsx};
use log::{info, warn};

use crate::delay_manager;
use crate::error::StoreError;
use crate::model::{HarvestedRecord, Section};

/// Excel refuses cells longer than 32767 characters.
const MAX_CELL_CHARS: usize = 32_000;
const MAX_SHEET_NAME_CHARS: usize = 31;
const UTF8_BOM: &str = "\u{feff}";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>, headers: Vec<String>) -> Self {
        Sheet {
            name: name.into(),
            headers,
            rows: Vec::new(),
        }
    }

    pub fn column(&self, header: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.trim() == header)
    }

    pub fn values<'a>(&'a self, header: &str) -> impl Iterator<Item = &'a str> + 'a {
        let idx = self.column(header);
        self.rows
            .iter()
            .filter_map(move |row| idx.and_then(|i| row.get(i)))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn push_padded(&mut self, mut row: Vec<String>) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workbook {
    sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new() -> Self {
        Workbook::default()
    }

    pub fn from_sheets(sheets: Vec<Sheet>) -> Self {
        Workbook { sheets }
    }

    /// Lays out one sheet per section in the given order and re-maps prior rows onto
    /// each section's fixed columns by header name. Prior sheets no section claims are kept.
    pub fn with_sections(sections: &[Section], prior: Workbook) -> Self {
        let mut prior = prior.sheets;
        let mut sheets = Vec::with_capacity(sections.len());
        for section in sections {
            let mut sheet = Sheet::new(section.name.clone(), section.headers());
            if let Some(pos) = prior.iter().position(|s| s.name == section.name) {
                let old = prior.remove(pos);
                let mapping: Vec<Option<usize>> =
                    sheet.headers.iter().map(|h| old.column(h)).collect();
                for old_row in old.rows {
                    let row = mapping
                        .iter()
                        .map(|m| m.and_then(|i| old_row.get(i).cloned()).unwrap_or_default())
                        .collect();
                    sheet.push_padded(row);
                }
            }
            sheets.push(sheet);
        }
        sheets.extend(prior);
        Workbook { sheets }
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn append(&mut self, section: &Section, record: &HarvestedRecord) {
        let row = section.row(record);
        match self.sheets.iter_mut().find(|s| s.name == section.name) {
            Some(sheet) => sheet.push_padded(row),
            None => {
                let mut sheet = Sheet::new(section.name.clone(), section.headers());
                sheet.push_padded(row);
                self.sheets.push(sheet);
            }
        }
    }

    pub fn row_count(&self) -> usize {
        self.sheets.iter().map(|s| s.rows.len()).sum()
    }
}

pub trait RecordStore {
    fn location(&self) -> &Path;
    fn load(&self) -> Result<Workbook, StoreError>;
    fn save(&self, book: &Workbook) -> Result<(), StoreError>;

    fn backup(&self) -> Result<Option<PathBuf>, StoreError> {
        Ok(None)
    }
}

pub fn open_store(path: &Path) -> Box<dyn RecordStore> {
    let is_excel = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("xlsx"));
    if is_excel {
        Box::new(XlsxStore::new(path))
    } else {
        Box::new(CsvStore::new(path))
    }
}

/// Saves, retrying lock failures with a fixed backoff. Other failures return at once.
pub async fn save_with_retry<S: RecordStore + ?Sized>(
    store: &S,
    book: &Workbook,
    attempts: u32,
    backoff: Duration,
) -> Result<(), StoreError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match store.save(book) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_locked() && attempt < attempts => {
                warn!("{} (attempt {}/{})", e, attempt, attempts);
                delay_manager::lock_backoff(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn clip(cell: &str) -> &str {
    match cell.char_indices().nth(MAX_CELL_CHARS) {
        Some((idx, _)) => &cell[..idx],
        None => cell,
    }
}

fn sheet_name(name: &str) -> String {
    name.chars()
        .map(|c| if "[]:*?/\\".contains(c) { '_' } else { c })
        .take(MAX_SHEET_NAME_CHARS)
        .collect()
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Writes `bytes` next to `path` and renames over it, so a failed write never
/// leaves a truncated artifact behind.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| StoreError::from_io(parent, e))?;
        }
    }
    let tmp = sibling(path, ".tmp");
    fs::write(&tmp, bytes).map_err(|e| StoreError::from_io(&tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::from_io(path, e));
    }
    Ok(())
}

pub struct XlsxStore {
    path: PathBuf,
}

impl XlsxStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        XlsxStore { path: path.into() }
    }
}

impl RecordStore for XlsxStore {
    fn location(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Workbook, StoreError> {
        if !self.path.exists() {
            return Err(StoreError::Missing(self.path.clone()));
        }
        let mut excel: Xlsx<_> = open_workbook(&self.path).map_err(|e: calamine::XlsxError| StoreError::Format {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut sheets = Vec::new();
        for (name, range) in excel.worksheets() {
            let mut rows = range.rows();
            let headers: Vec<String> = match rows.next() {
                Some(header_row) => header_row.iter().map(|c| c.to_string().trim().to_string()).collect(),
                None => continue,
            };
            let mut sheet = Sheet::new(name, headers);
            for row in rows {
                let cells: Vec<String> = row.iter().map(|c| c.to_string()).collect();
                if cells.iter().all(|c| c.is_empty()) {
                    continue;
                }
                sheet.push_padded(cells);
            }
            sheets.push(sheet);
        }
        info!("Read {} sheet(s) from {:?}", sheets.len(), self.path);
        Ok(Workbook::from_sheets(sheets))
    }

    fn save(&self, book: &Workbook) -> Result<(), StoreError> {
        let format_err = |e: rust_xlsxwriter::XlsxError| StoreError::Format {
            path: self.path.clone(),
            reason: e.to_string(),
        };

        let mut workbook = rust_xlsxwriter::Workbook::new();
        for sheet in book.sheets() {
            let worksheet = workbook.add_worksheet();
            worksheet.set_name(sheet_name(&sheet.name)).map_err(format_err)?;
            for (col, header) in sheet.headers.iter().enumerate() {
                worksheet.write_string(0, col as u16, header).map_err(format_err)?;
            }
            for (r, row) in sheet.rows.iter().enumerate() {
                for (col, cell) in row.iter().enumerate() {
                    if cell.is_empty() {
                        continue;
                    }
                    worksheet
                        .write_string(r as u32 + 1, col as u16, clip(cell))
                        .map_err(format_err)?;
                }
            }
        }
        let bytes = workbook.save_to_buffer().map_err(format_err)?;
        replace_file(&self.path, &bytes)?;
        info!("Saved {} rows to {:?}", book.row_count(), self.path);
        Ok(())
    }

    fn backup(&self) -> Result<Option<PathBuf>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bak = sibling(&self.path, ".bak");
        fs::copy(&self.path, &bak).map_err(|e| StoreError::from_io(&bak, e))?;
        Ok(Some(bak))
    }
}

/// One `<section>.csv` per sheet inside a directory, UTF-8 with a BOM so Excel opens it.
///
/// Sheets are read one file at a time. A file that cannot be read is left out
/// of the workbook and is never overwritten afterwards.
pub struct CsvStore {
    dir: PathBuf,
    unreadable: Mutex<HashSet<PathBuf>>,
}

impl CsvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CsvStore {
            dir: dir.into(),
            unreadable: Mutex::new(HashSet::new()),
        }
    }

    fn sheet_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", sheet_name(name)))
    }

    fn csv_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::from_io(&self.dir, e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "csv"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn unreadable(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.unreadable.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_sheet(&self, path: &Path) -> Result<Sheet, StoreError> {
        let file = File::open(path).map_err(|e| StoreError::from_io(path, e))?;
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(file);
        let format_err = |e: csv::Error| StoreError::Format {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let headers = rdr
            .headers()
            .map_err(format_err)?
            .iter()
            .map(|h| h.trim_start_matches(UTF8_BOM).trim().to_string())
            .collect();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut sheet = Sheet::new(name, headers);
        for result in rdr.records() {
            let record = result.map_err(format_err)?;
            sheet.push_padded(record.iter().map(|c| c.to_string()).collect());
        }
        Ok(sheet)
    }
}

impl RecordStore for CsvStore {
    fn location(&self) -> &Path {
        &self.dir
    }

    fn load(&self) -> Result<Workbook, StoreError> {
        if !self.dir.exists() {
            return Err(StoreError::Missing(self.dir.clone()));
        }
        let mut unreadable = self.unreadable();
        let mut sheets = Vec::new();
        for path in self.csv_files()? {
            match self.read_sheet(&path) {
                Ok(sheet) => sheets.push(sheet),
                Err(e) => {
                    warn!("Skipping {:?}, it will not be overwritten: {}", path, e);
                    unreadable.insert(path);
                }
            }
        }
        info!("Read {} CSV sheet(s) from {:?}", sheets.len(), self.dir);
        Ok(Workbook::from_sheets(sheets))
    }

    fn save(&self, book: &Workbook) -> Result<(), StoreError> {
        let protected = self.unreadable().clone();
        let mut skipped = None;
        for sheet in book.sheets() {
            let path = self.sheet_path(&sheet.name);
            if protected.contains(&path) {
                skipped = Some(path);
                continue;
            }
            let mut buf = Vec::new();
            buf.write_all(UTF8_BOM.as_bytes())
                .map_err(|e| StoreError::from_io(&path, e))?;
            {
                let mut wtr = csv::WriterBuilder::new().from_writer(&mut buf);
                let csv_err = |e: csv::Error| StoreError::Format {
                    path: path.clone(),
                    reason: e.to_string(),
                };
                wtr.write_record(&sheet.headers).map_err(csv_err)?;
                for row in &sheet.rows {
                    wtr.write_record(row.iter().map(|c| clip(c))).map_err(csv_err)?;
                }
                wtr.flush().map_err(|e| StoreError::from_io(&path, e))?;
            }
            replace_file(&path, &buf)?;
        }
        if let Some(path) = skipped {
            return Err(StoreError::Format {
                path,
                reason: "left untouched because it could not be read when the run started".into(),
            });
        }
        info!("Saved {} rows to {:?}", book.row_count(), self.dir);
        Ok(())
    }

    fn backup(&self) -> Result<Option<PathBuf>, StoreError> {
        if !self.dir.is_dir() {
            return Ok(None);
        }
        let bak = sibling(&self.dir, ".bak");
        fs::create_dir_all(&bak).map_err(|e| StoreError::from_io(&bak, e))?;
        for path in self.csv_files()? {
            if let Some(name) = path.file_name() {
                let target = bak.join(name);
                fs::copy(&path, &target).map_err(|e| StoreError::from_io(&target, e))?;
            }
        }
        Ok(Some(bak))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{col, Field, LINK_HEADER};
    use std::cell::Cell;

    fn section() -> Section {
        Section::new(
            "政策法规",
            &[
                col("标题", Field::Title),
                col("文号", Field::DocNumber),
                col("附件链接", Field::AttachmentLinks),
                col(LINK_HEADER, Field::Link),
            ],
        )
    }

    fn record(id: &str) -> HarvestedRecord {
        HarvestedRecord {
            identifier: id.into(),
            title: format!("doc {}", id),
            link: format!("http://example.test/{}", id),
            ..Default::default()
        }
    }

    #[test]
    fn prior_rows_are_remapped_onto_the_schema() {
        let mut old = Sheet::new("政策法规", vec![LINK_HEADER.into(), "标题".into(), "旧列".into()]);
        old.push_padded(vec!["http://example.test/1".into(), "one".into(), "x".into()]);
        let book = Workbook::with_sections(&[section()], Workbook::from_sheets(vec![old]));

        let sheet = book.sheet("政策法规").unwrap();
        assert_eq!(sheet.headers, section().headers());
        assert_eq!(sheet.rows[0], vec!["one", "", "", "http://example.test/1"]);
    }

    #[test]
    fn xlsx_round_trip_keeps_the_column_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = XlsxStore::new(dir.path().join("out.xlsx"));
        let mut book = Workbook::with_sections(&[section()], Workbook::new());
        book.append(&section(), &record("1"));
        book.append(&section(), &record("2"));
        store.save(&book).unwrap();

        let loaded = store.load().unwrap();
        let sheet = loaded.sheet("政策法规").unwrap();
        assert_eq!(sheet.headers, section().headers());
        assert_eq!(sheet.rows.len(), 2);
        assert!(sheet.rows.iter().all(|r| r.len() == 4));
        assert_eq!(sheet.values(LINK_HEADER).count(), 2);
        assert!(!dir.path().join("out.xlsx.tmp").exists());
    }

    #[test]
    fn empty_sheet_still_has_headers_after_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = XlsxStore::new(dir.path().join("out.xlsx"));
        let book = Workbook::with_sections(&[section()], Workbook::new());
        store.save(&book).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.sheet("政策法规").unwrap().headers, section().headers());
    }

    #[test]
    fn csv_round_trip_strips_bom() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("out"));
        let mut book = Workbook::with_sections(&[section()], Workbook::new());
        book.append(&section(), &record("1"));
        store.save(&book).unwrap();

        let loaded = store.load().unwrap();
        let sheet = loaded.sheet("政策法规").unwrap();
        assert_eq!(sheet.headers[0], "标题");
        assert_eq!(sheet.rows[0][3], "http://example.test/1");
    }

    #[test]
    fn unreadable_csv_is_skipped_and_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let gbk = [0xb1u8, 0xea, 0xcc, 0xe2, b'\n'];
        fs::write(out.join("政策法规.csv"), gbk).unwrap();
        fs::write(out.join("other.csv"), "标题,链接\nold,http://example.test/0\n").unwrap();

        let store = CsvStore::new(&out);
        let loaded = store.load().unwrap();
        assert!(loaded.sheet("政策法规").is_none());
        assert_eq!(loaded.sheet("other").unwrap().rows.len(), 1);

        let mut book = Workbook::with_sections(&[section()], loaded);
        book.append(&section(), &record("1"));
        let err = store.save(&book).unwrap_err();
        assert!(matches!(err, StoreError::Format { .. }));
        assert!(!err.is_locked());
        assert_eq!(fs::read(out.join("政策法规.csv")).unwrap(), gbk);
        assert!(fs::read_to_string(out.join("other.csv")).unwrap().contains("http://example.test/0"));
    }

    #[test]
    fn csv_backup_copies_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let store = CsvStore::new(&out);
        assert_eq!(store.backup().unwrap(), None);

        let mut book = Workbook::with_sections(&[section()], Workbook::new());
        book.append(&section(), &record("1"));
        store.save(&book).unwrap();

        let bak = store.backup().unwrap().unwrap();
        assert_eq!(bak, dir.path().join("out.bak"));
        assert_eq!(
            fs::read(bak.join("政策法规.csv")).unwrap(),
            fs::read(out.join("政策法规.csv")).unwrap()
        );
    }

    #[test]
    fn missing_and_corrupt_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.xlsx");
        assert!(matches!(XlsxStore::new(&path).load(), Err(StoreError::Missing(_))));

        fs::write(&path, b"not a zip").unwrap();
        assert!(matches!(XlsxStore::new(&path).load(), Err(StoreError::Format { .. })));
    }

    #[test]
    fn long_cells_are_clipped_on_char_boundary() {
        let long = "税".repeat(MAX_CELL_CHARS + 10);
        assert_eq!(clip(&long).chars().count(), MAX_CELL_CHARS);
        assert_eq!(clip("short"), "short");
    }

    #[test]
    fn sheet_names_are_sanitized() {
        assert_eq!(sheet_name("a/b:c"), "a_b_c");
        assert_eq!(sheet_name(&"x".repeat(40)).chars().count(), 31);
    }

    struct LockedOnce {
        calls: Cell<u32>,
        saved: Cell<usize>,
    }

    impl RecordStore for LockedOnce {
        fn location(&self) -> &Path {
            Path::new("locked.xlsx")
        }
        fn load(&self) -> Result<Workbook, StoreError> {
            Ok(Workbook::new())
        }
        fn save(&self, book: &Workbook) -> Result<(), StoreError> {
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() == 1 {
                return Err(StoreError::Locked(PathBuf::from("locked.xlsx")));
            }
            self.saved.set(book.row_count());
            Ok(())
        }
    }

    #[tokio::test]
    async fn lock_is_retried_without_losing_rows() {
        let store = LockedOnce { calls: Cell::new(0), saved: Cell::new(0) };
        let mut book = Workbook::with_sections(&[section()], Workbook::new());
        book.append(&section(), &record("1"));
        book.append(&section(), &record("2"));

        save_with_retry(&store, &book, 3, Duration::ZERO).await.unwrap();
        assert_eq!(store.calls.get(), 2);
        assert_eq!(store.saved.get(), 2);
    }
}
