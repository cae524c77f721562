use std::{
    collections::BTreeMap,
    ops::Bound,
    path::PathBuf,
    time::Instant,
};

use chrono::NaiveDate;
use metrics::{counter, histogram};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::{IndexError, Result},
    event::EventPosition,
    model::{
        Address, BatchRecord, CategoryRecord, DailyStats, GlobalStats, IngestCursor,
        IntegrityFault, LogEntry, LogUpdate, UserCategoryRecord, UserRecord,
    },
};

const SEP: u8 = 0x1F;
const PREFIX_LOG: &str = "log";
const PREFIX_LOG_UPDATE: &str = "upd";
const PREFIX_BATCH: &str = "batch";
const PREFIX_USER: &str = "user";
const PREFIX_CATEGORY: &str = "cat";
const PREFIX_USER_CATEGORY: &str = "ucat";
const PREFIX_DAY: &str = "day";
const PREFIX_FAULT: &str = "fault";
const PREFIX_IDX_TIME: &str = "idx-time";
const PREFIX_IDX_CREATOR: &str = "idx-creator";
const PREFIX_IDX_CATEGORY: &str = "idx-cat";
const PREFIX_IDX_BATCH_CREATOR: &str = "idx-batch";
const KEY_GLOBAL: &str = "global";
const KEY_CURSOR: &str = "cursor";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Ascending),
            "desc" | "descending" => Ok(SortOrder::Descending),
            _ => Err(format!("unsupported sort order '{value}'")),
        }
    }
}

/// Visitor over key/value pairs; return `false` to stop the scan.
pub type ScanVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<bool> + 'a;

pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn scan_prefix(&self, prefix: &[u8], order: SortOrder, visit: &mut ScanVisitor<'_>)
    -> Result<()>;
}

pub struct RocksBackend {
    db: DBWithThreadMode<MultiThreaded>,
}

impl RocksBackend {
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path)?;
        Ok(Self { db })
    }

    pub fn open_read_only(path: PathBuf) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(false);
        let db = DBWithThreadMode::<MultiThreaded>::open_for_read_only(&options, path, false)?;
        Ok(Self { db })
    }
}

impl StorageBackend for RocksBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.put(key, value)?)
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        order: SortOrder,
        visit: &mut ScanVisitor<'_>,
    ) -> Result<()> {
        match order {
            SortOrder::Ascending => {
                let iter = self
                    .db
                    .iterator(IteratorMode::From(prefix, Direction::Forward));
                for item in iter {
                    let (key, value) = item?;
                    if !key.starts_with(prefix) {
                        break;
                    }
                    if !visit(key.as_ref(), value.as_ref())? {
                        break;
                    }
                }
            }
            SortOrder::Descending => {
                let iter = match prefix_successor(prefix) {
                    Some(bound) => self
                        .db
                        .iterator(IteratorMode::From(bound.as_slice(), Direction::Reverse)),
                    None => self.db.iterator(IteratorMode::End),
                };
                for item in iter {
                    let (key, value) = item?;
                    if !key.starts_with(prefix) {
                        if key.as_ref() > prefix {
                            continue;
                        }
                        break;
                    }
                    if !visit(key.as_ref(), value.as_ref())? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Ordered in-process backend for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        order: SortOrder,
        visit: &mut ScanVisitor<'_>,
    ) -> Result<()> {
        let guard = self.entries.read();
        let upper = match prefix_successor(prefix) {
            Some(bound) => Bound::Excluded(bound),
            None => Bound::Unbounded,
        };
        let range = guard.range::<Vec<u8>, _>((Bound::Included(prefix.to_vec()), upper));
        match order {
            SortOrder::Ascending => {
                for (key, value) in range {
                    if !visit(key.as_slice(), value.as_slice())? {
                        break;
                    }
                }
            }
            SortOrder::Descending => {
                for (key, value) in range.rev() {
                    if !visit(key.as_slice(), value.as_slice())? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Which secondary index a log scan walks. Every index is ordered by
/// creation timestamp, then log id.
#[derive(Debug, Clone, Copy)]
pub enum LogIndexScope<'a> {
    All,
    Creator(&'a Address),
    Category(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogIndexEntry {
    pub timestamp: u64,
    pub id: u64,
}

/// Keyed aggregate store. Each entity record is read with get-or-default
/// semantics and written back with a single overwrite.
pub struct IndexStore {
    backend: Box<dyn StorageBackend>,
    write_lock: Mutex<()>,
    read_only: bool,
}

impl IndexStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        Ok(Self::with_backend(Box::new(RocksBackend::open(path)?)))
    }

    pub fn open_read_only(path: PathBuf) -> Result<Self> {
        let backend = RocksBackend::open_read_only(path)?;
        Ok(Self {
            backend: Box::new(backend),
            write_lock: Mutex::new(()),
            read_only: true,
        })
    }

    pub fn in_memory() -> Self {
        Self::with_backend(Box::new(MemoryBackend::new()))
    }

    pub fn with_backend(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
            read_only: false,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Serializes writers. Held by the ingester for the whole of one event.
    pub fn writer(&self) -> Result<MutexGuard<'_, ()>> {
        if self.read_only {
            return Err(IndexError::ReadOnly);
        }
        Ok(self.write_lock.lock())
    }

    pub fn log(&self, id: u64) -> Result<Option<LogEntry>> {
        self.load("get_log", &log_key(id))
    }

    pub fn save_log(&self, entry: &LogEntry) -> Result<()> {
        self.save("put_log", &log_key(entry.id), entry)
    }

    /// Writes the three secondary index entries for a log. The keys derive
    /// from immutable fields, so rewriting them is harmless.
    pub fn index_log(&self, entry: &LogEntry) -> Result<()> {
        let suffix = index_suffix(entry.created_at, entry.id);
        let keys = [
            [key_with_segments(&[PREFIX_IDX_TIME]), suffix.clone()].concat(),
            [
                key_with_segments(&[PREFIX_IDX_CREATOR, entry.creator.as_str()]),
                suffix.clone(),
            ]
            .concat(),
            [
                key_with_segments(&[PREFIX_IDX_CATEGORY, &entry.category]),
                suffix,
            ]
            .concat(),
        ];
        for key in keys {
            self.put_raw("put_log_index", &key, &[])?;
        }
        Ok(())
    }

    pub fn scan_log_index(
        &self,
        scope: LogIndexScope<'_>,
        order: SortOrder,
        mut visit: impl FnMut(LogIndexEntry) -> Result<bool>,
    ) -> Result<()> {
        let mut prefix = match scope {
            LogIndexScope::All => key_with_segments(&[PREFIX_IDX_TIME]),
            LogIndexScope::Creator(creator) => {
                key_with_segments(&[PREFIX_IDX_CREATOR, creator.as_str()])
            }
            LogIndexScope::Category(category) => {
                key_with_segments(&[PREFIX_IDX_CATEGORY, category])
            }
        };
        prefix.push(SEP);
        let expected_len = prefix.len() + 16;
        self.scan("scan_log_index", &prefix, order, &mut |key: &[u8], _: &[u8]| {
            if key.len() != expected_len {
                return Ok(true);
            }
            let timestamp = read_u64(&key[key.len() - 16..key.len() - 8])?;
            let id = read_u64(&key[key.len() - 8..])?;
            visit(LogIndexEntry { timestamp, id })
        })
    }

    pub fn log_updates(&self, log_id: u64, skip: usize, take: usize) -> Result<Vec<LogUpdate>> {
        let mut prefix = key_with_segments(&[PREFIX_LOG_UPDATE]);
        prefix.push(SEP);
        prefix.extend_from_slice(&log_id.to_be_bytes());
        prefix.push(SEP);
        self.collect_page("scan_log_updates", &prefix, SortOrder::Ascending, skip, take)
    }

    pub fn save_log_update(&self, update: &LogUpdate) -> Result<()> {
        let mut key = key_with_segments(&[PREFIX_LOG_UPDATE]);
        key.push(SEP);
        key.extend_from_slice(&update.log_id.to_be_bytes());
        key.push(SEP);
        key.extend_from_slice(&update.sequence.to_be_bytes());
        self.save("put_log_update", &key, update)
    }

    pub fn save_batch(&self, batch: &BatchRecord) -> Result<()> {
        let position = position_bytes(batch.position);
        let key = [key_with_segments(&[PREFIX_BATCH]), position.clone()].concat();
        self.save("put_batch", &key, batch)?;
        let index_key = [
            key_with_segments(&[PREFIX_IDX_BATCH_CREATOR, batch.creator.as_str()]),
            position,
        ]
        .concat();
        self.put_raw("put_batch_index", &index_key, &key)
    }

    pub fn batch(&self, position: EventPosition) -> Result<Option<BatchRecord>> {
        let key = [key_with_segments(&[PREFIX_BATCH]), position_bytes(position)].concat();
        self.load("get_batch", &key)
    }

    pub fn batches(
        &self,
        creator: Option<&Address>,
        skip: usize,
        take: usize,
    ) -> Result<Vec<BatchRecord>> {
        let Some(creator) = creator else {
            let mut prefix = key_with_segments(&[PREFIX_BATCH]);
            prefix.push(SEP);
            return self.collect_page("scan_batches", &prefix, SortOrder::Descending, skip, take);
        };

        let mut prefix = key_with_segments(&[PREFIX_IDX_BATCH_CREATOR, creator.as_str()]);
        prefix.push(SEP);
        let mut keys = Vec::new();
        let mut seen = 0usize;
        self.scan(
            "scan_batch_index",
            &prefix,
            SortOrder::Descending,
            &mut |_: &[u8], value: &[u8]| {
                if keys.len() >= take {
                    return Ok(false);
                }
                if seen >= skip {
                    keys.push(value.to_vec());
                }
                seen += 1;
                Ok(true)
            },
        )?;

        let mut batches = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(batch) = self.load("get_batch", &key)? {
                batches.push(batch);
            }
        }
        Ok(batches)
    }

    pub fn user(&self, address: &Address) -> Result<Option<UserRecord>> {
        self.load("get_user", &key_with_segments(&[PREFIX_USER, address.as_str()]))
    }

    /// Returns the stored user or a fresh zero-state record, plus whether it
    /// was freshly created.
    pub fn user_or_default(&self, address: &Address, seen_at: u64) -> Result<(UserRecord, bool)> {
        Ok(match self.user(address)? {
            Some(user) => (user, false),
            None => (UserRecord::new(address.clone(), seen_at), true),
        })
    }

    pub fn save_user(&self, user: &UserRecord) -> Result<()> {
        let key = key_with_segments(&[PREFIX_USER, user.address.as_str()]);
        self.save("put_user", &key, user)
    }

    pub fn users(&self, skip: usize, take: usize) -> Result<Vec<UserRecord>> {
        let mut prefix = key_with_segments(&[PREFIX_USER]);
        prefix.push(SEP);
        self.collect_page("scan_users", &prefix, SortOrder::Ascending, skip, take)
    }

    pub fn category(&self, name: &str) -> Result<Option<CategoryRecord>> {
        self.load("get_category", &key_with_segments(&[PREFIX_CATEGORY, name]))
    }

    pub fn category_or_default(&self, name: &str) -> Result<(CategoryRecord, bool)> {
        Ok(match self.category(name)? {
            Some(category) => (category, false),
            None => (CategoryRecord::new(name), true),
        })
    }

    pub fn save_category(&self, category: &CategoryRecord) -> Result<()> {
        let key = key_with_segments(&[PREFIX_CATEGORY, &category.name]);
        self.save("put_category", &key, category)
    }

    pub fn categories(&self, skip: usize, take: usize) -> Result<Vec<CategoryRecord>> {
        let mut prefix = key_with_segments(&[PREFIX_CATEGORY]);
        prefix.push(SEP);
        self.collect_page("scan_categories", &prefix, SortOrder::Ascending, skip, take)
    }

    pub fn user_category(
        &self,
        user: &Address,
        category: &str,
    ) -> Result<Option<UserCategoryRecord>> {
        let key = key_with_segments(&[PREFIX_USER_CATEGORY, user.as_str(), category]);
        self.load("get_user_category", &key)
    }

    pub fn user_category_or_default(
        &self,
        user: &Address,
        category: &str,
    ) -> Result<UserCategoryRecord> {
        Ok(self
            .user_category(user, category)?
            .unwrap_or_else(|| UserCategoryRecord::new(user.clone(), category)))
    }

    pub fn save_user_category(&self, record: &UserCategoryRecord) -> Result<()> {
        let key = key_with_segments(&[
            PREFIX_USER_CATEGORY,
            record.user.as_str(),
            &record.category,
        ]);
        self.save("put_user_category", &key, record)
    }

    pub fn user_categories(&self, user: &Address) -> Result<Vec<UserCategoryRecord>> {
        let mut prefix = key_with_segments(&[PREFIX_USER_CATEGORY, user.as_str()]);
        prefix.push(SEP);
        self.collect_page(
            "scan_user_categories",
            &prefix,
            SortOrder::Ascending,
            0,
            usize::MAX,
        )
    }

    pub fn daily(&self, day: NaiveDate) -> Result<Option<DailyStats>> {
        self.load("get_daily", &day_key(day))
    }

    pub fn daily_or_default(&self, day: NaiveDate) -> Result<DailyStats> {
        Ok(self.daily(day)?.unwrap_or_else(|| DailyStats::new(day)))
    }

    pub fn save_daily(&self, stats: &DailyStats) -> Result<()> {
        self.save("put_daily", &day_key(stats.day), stats)
    }

    /// Daily buckets between `from` and `to` inclusive, newest first.
    pub fn daily_range(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        skip: usize,
        take: usize,
    ) -> Result<Vec<DailyStats>> {
        let mut prefix = key_with_segments(&[PREFIX_DAY]);
        prefix.push(SEP);
        let mut items = Vec::new();
        let mut seen = 0usize;
        self.scan(
            "scan_daily",
            &prefix,
            SortOrder::Descending,
            &mut |_: &[u8], value: &[u8]| {
                if items.len() >= take {
                    return Ok(false);
                }
                let stats: DailyStats = serde_json::from_slice(value)?;
                if to.is_some_and(|to| stats.day > to) {
                    return Ok(true);
                }
                if from.is_some_and(|from| stats.day < from) {
                    return Ok(false);
                }
                if seen >= skip {
                    items.push(stats);
                }
                seen += 1;
                Ok(true)
            },
        )?;
        Ok(items)
    }

    pub fn global(&self) -> Result<GlobalStats> {
        Ok(self
            .load("get_global", &key_with_segments(&[KEY_GLOBAL]))?
            .unwrap_or_default())
    }

    pub fn save_global(&self, stats: &GlobalStats) -> Result<()> {
        self.save("put_global", &key_with_segments(&[KEY_GLOBAL]), stats)
    }

    pub fn cursor(&self) -> Result<IngestCursor> {
        Ok(self
            .load("get_cursor", &key_with_segments(&[KEY_CURSOR]))?
            .unwrap_or_default())
    }

    pub fn save_cursor(&self, cursor: &IngestCursor) -> Result<()> {
        self.save("put_cursor", &key_with_segments(&[KEY_CURSOR]), cursor)
    }

    pub fn record_fault(&self, fault: &IntegrityFault) -> Result<()> {
        let key = [
            key_with_segments(&[PREFIX_FAULT]),
            position_bytes(fault.position),
            vec![SEP],
            fault.entity.as_bytes().to_vec(),
            vec![SEP],
            fault.counter.as_bytes().to_vec(),
        ]
        .concat();
        self.save("put_fault", &key, fault)
    }

    pub fn faults(&self, skip: usize, take: usize) -> Result<Vec<IntegrityFault>> {
        let mut prefix = key_with_segments(&[PREFIX_FAULT]);
        prefix.push(SEP);
        self.collect_page("scan_faults", &prefix, SortOrder::Descending, skip, take)
    }

    fn load<T>(&self, operation: &'static str, key: &[u8]) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let start = Instant::now();
        let result: Result<Option<T>> = (|| match self.backend.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        })();
        record_store_op(operation, &result, start);
        result
    }

    fn save<T>(&self, operation: &'static str, key: &[u8], value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let bytes = serde_json::to_vec(value)?;
        self.put_raw(operation, key, &bytes)
    }

    fn put_raw(&self, operation: &'static str, key: &[u8], value: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(IndexError::ReadOnly);
        }
        let start = Instant::now();
        let result = self.backend.put(key, value);
        record_store_op(operation, &result, start);
        result
    }

    fn scan(
        &self,
        operation: &'static str,
        prefix: &[u8],
        order: SortOrder,
        visit: &mut ScanVisitor<'_>,
    ) -> Result<()> {
        let start = Instant::now();
        let result = self.backend.scan_prefix(prefix, order, visit);
        record_store_op(operation, &result, start);
        result
    }

    fn collect_page<T>(
        &self,
        operation: &'static str,
        prefix: &[u8],
        order: SortOrder,
        skip: usize,
        take: usize,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut seen = 0usize;
        self.scan(operation, prefix, order, &mut |_: &[u8], value: &[u8]| {
            if items.len() >= take {
                return Ok(false);
            }
            if seen >= skip {
                items.push(serde_json::from_slice(value)?);
            }
            seen += 1;
            Ok(true)
        })?;
        Ok(items)
    }
}

fn log_key(id: u64) -> Vec<u8> {
    let mut key = key_with_segments(&[PREFIX_LOG]);
    key.push(SEP);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn day_key(day: NaiveDate) -> Vec<u8> {
    key_with_segments(&[PREFIX_DAY, &day.format("%Y-%m-%d").to_string()])
}

fn index_suffix(timestamp: u64, id: u64) -> Vec<u8> {
    let mut suffix = Vec::with_capacity(17);
    suffix.push(SEP);
    suffix.extend_from_slice(&timestamp.to_be_bytes());
    suffix.extend_from_slice(&id.to_be_bytes());
    suffix
}

fn position_bytes(position: EventPosition) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(17);
    bytes.push(SEP);
    bytes.extend_from_slice(&position.block_number.to_be_bytes());
    bytes.extend_from_slice(&position.log_index.to_be_bytes());
    bytes
}

fn read_u64(bytes: &[u8]) -> Result<u64> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| IndexError::Storage("index key too short".into()))?;
    Ok(u64::from_be_bytes(buf))
}

fn key_with_segments(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    let mut iter = parts.iter();
    if let Some(first) = iter.next() {
        key.extend_from_slice(first.as_bytes());
    }
    for part in iter {
        key.push(SEP);
        key.extend_from_slice(part.as_bytes());
    }
    key
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

fn record_store_op<T>(operation: &'static str, result: &Result<T>, start: Instant) {
    let status = if result.is_ok() { "ok" } else { "err" };
    let labels = [("operation", operation), ("status", status)];
    counter!("chainlog_store_operations_total", &labels).increment(1);
    histogram!("chainlog_store_operation_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());
}
