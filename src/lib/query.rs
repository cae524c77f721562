use std::sync::Arc;

use chrono::NaiveDate;

use crate::{
    error::{IndexError, Result},
    model::{
        Address, BatchRecord, CategoryRecord, DailyStats, GlobalStats, IngestCursor,
        IntegrityFault, LogEntry, LogUpdate, Severity, UserCategoryRecord, UserRecord,
    },
    store::{IndexStore, LogIndexScope, SortOrder},
};

/// Offset pagination. `first` is capped at the service's page limit and
/// falls back to its default page size when absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub first: Option<usize>,
    pub skip: usize,
}

impl Page {
    pub fn new(first: Option<usize>, skip: Option<usize>) -> Self {
        Self {
            first,
            skip: skip.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub creator: Option<Address>,
    pub category: Option<String>,
    pub level: Option<Severity>,
    pub active: Option<bool>,
    pub from_timestamp: Option<u64>,
    pub to_timestamp: Option<u64>,
    pub order: SortOrder,
}

impl LogFilter {
    fn matches(&self, entry: &LogEntry) -> bool {
        self.creator
            .as_ref()
            .is_none_or(|creator| &entry.creator == creator)
            && self
                .category
                .as_ref()
                .is_none_or(|category| &entry.category == category)
            && self.level.is_none_or(|level| entry.level == level)
            && self.active.is_none_or(|active| entry.active == active)
    }

    fn validate(&self) -> Result<()> {
        if let (Some(from), Some(to)) = (self.from_timestamp, self.to_timestamp) {
            if from > to {
                return Err(IndexError::InvalidQuery(format!(
                    "from_timestamp {from} is after to_timestamp {to}"
                )));
            }
        }
        Ok(())
    }
}

/// Read-only projections over the aggregate store.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<IndexStore>,
    default_page_size: usize,
    page_limit: usize,
}

impl QueryService {
    pub fn new(store: Arc<IndexStore>, default_page_size: usize, page_limit: usize) -> Self {
        let page_limit = page_limit.max(1);
        Self {
            store,
            default_page_size: default_page_size.clamp(1, page_limit),
            page_limit,
        }
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn page_limit(&self) -> usize {
        self.page_limit
    }

    fn take(&self, page: Page) -> usize {
        page.first
            .unwrap_or(self.default_page_size)
            .min(self.page_limit)
    }

    pub fn log(&self, id: u64) -> Result<Option<LogEntry>> {
        self.store.log(id)
    }

    pub fn logs(&self, filter: &LogFilter, page: Page) -> Result<Vec<LogEntry>> {
        filter.validate()?;
        let take = self.take(page);
        if take == 0 {
            return Ok(Vec::new());
        }

        let scope = match (&filter.creator, &filter.category) {
            (Some(creator), _) => LogIndexScope::Creator(creator),
            (None, Some(category)) => LogIndexScope::Category(category),
            (None, None) => LogIndexScope::All,
        };
        let from = filter.from_timestamp.unwrap_or(0);
        let to = filter.to_timestamp.unwrap_or(u64::MAX);

        let mut entries = Vec::new();
        let mut matched = 0usize;
        self.store.scan_log_index(scope, filter.order, |item| {
            if item.timestamp < from {
                return Ok(filter.order == SortOrder::Ascending);
            }
            if item.timestamp > to {
                return Ok(filter.order == SortOrder::Descending);
            }
            let Some(entry) = self.store.log(item.id)? else {
                return Ok(true);
            };
            if !filter.matches(&entry) {
                return Ok(true);
            }
            if matched >= page.skip {
                entries.push(entry);
            }
            matched += 1;
            Ok(entries.len() < take)
        })?;
        Ok(entries)
    }

    pub fn log_updates(&self, id: u64, page: Page) -> Result<Vec<LogUpdate>> {
        if self.store.log(id)?.is_none() {
            return Err(IndexError::LogNotFound(id));
        }
        let take = self.take(page);
        if take == 0 {
            return Ok(Vec::new());
        }
        self.store.log_updates(id, page.skip, take)
    }

    pub fn user(&self, address: &Address) -> Result<Option<UserRecord>> {
        self.store.user(address)
    }

    pub fn users(&self, page: Page) -> Result<Vec<UserRecord>> {
        let take = self.take(page);
        if take == 0 {
            return Ok(Vec::new());
        }
        self.store.users(page.skip, take)
    }

    pub fn user_logs(&self, address: &Address, page: Page) -> Result<Vec<LogEntry>> {
        let filter = LogFilter {
            creator: Some(address.clone()),
            ..LogFilter::default()
        };
        self.logs(&filter, page)
    }

    pub fn user_categories(&self, address: &Address) -> Result<Vec<UserCategoryRecord>> {
        self.store.user_categories(address)
    }

    pub fn category(&self, name: &str) -> Result<Option<CategoryRecord>> {
        self.store.category(name)
    }

    pub fn categories(&self, page: Page) -> Result<Vec<CategoryRecord>> {
        let take = self.take(page);
        if take == 0 {
            return Ok(Vec::new());
        }
        self.store.categories(page.skip, take)
    }

    pub fn category_logs(&self, name: &str, page: Page) -> Result<Vec<LogEntry>> {
        let filter = LogFilter {
            category: Some(name.to_string()),
            ..LogFilter::default()
        };
        self.logs(&filter, page)
    }

    pub fn user_category(
        &self,
        address: &Address,
        name: &str,
    ) -> Result<Option<UserCategoryRecord>> {
        self.store.user_category(address, name)
    }

    pub fn daily_stats(&self, day: NaiveDate) -> Result<Option<DailyStats>> {
        self.store.daily(day)
    }

    pub fn daily_range(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        page: Page,
    ) -> Result<Vec<DailyStats>> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(IndexError::InvalidQuery(format!(
                    "day range starts after it ends ({from} > {to})"
                )));
            }
        }
        let take = self.take(page);
        if take == 0 {
            return Ok(Vec::new());
        }
        self.store.daily_range(from, to, page.skip, take)
    }

    pub fn global_stats(&self) -> Result<GlobalStats> {
        self.store.global()
    }

    pub fn batches(&self, creator: Option<&Address>, page: Page) -> Result<Vec<BatchRecord>> {
        let take = self.take(page);
        if take == 0 {
            return Ok(Vec::new());
        }
        self.store.batches(creator, page.skip, take)
    }

    pub fn cursor(&self) -> Result<IngestCursor> {
        self.store.cursor()
    }

    pub fn integrity_faults(&self, page: Page) -> Result<Vec<IntegrityFault>> {
        let take = self.take(page);
        if take == 0 {
            return Ok(Vec::new());
        }
        self.store.faults(page.skip, take)
    }
}
