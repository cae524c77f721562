use async_graphql::Result as GqlResult;
use async_graphql::{
    ComplexObject, Context, EmptyMutation, EmptySubscription, Enum, InputObject, Object, Schema,
    SimpleObject,
};
use chrono::NaiveDate;

use crate::error::IndexError;
use crate::model::{
    Address, BatchRecord, CategoryRecord, DailyStats, GlobalStats, IngestCursor, IntegrityFault,
    LevelCounts, LogEntry, LogUpdate, Severity, UserCategoryRecord, UserRecord,
};
use crate::query::{LogFilter, Page, QueryService};
use crate::store::SortOrder;

pub type IndexSchema = Schema<QueryRoot, EmptyMutation, EmptySubscription>;

pub fn build_schema(service: QueryService) -> IndexSchema {
    Schema::build(QueryRoot, EmptyMutation, EmptySubscription)
        .data(service)
        .finish()
}

#[derive(Default)]
pub struct QueryRoot;

#[Object]
impl QueryRoot {
    async fn log_entry(&self, ctx: &Context<'_>, id: String) -> GqlResult<Option<LogEntryObject>> {
        let service = ctx.data::<QueryService>()?;
        Ok(service.log(parse_id(&id)?)?.map(Into::into))
    }

    async fn log_entries(
        &self,
        ctx: &Context<'_>,
        #[graphql(name = "where")] filter: Option<LogEntryFilter>,
        first: Option<usize>,
        skip: Option<usize>,
        order_direction: Option<OrderDirection>,
    ) -> GqlResult<Vec<LogEntryObject>> {
        let service = ctx.data::<QueryService>()?;
        let mut filter = match filter {
            Some(filter) => filter.into_filter()?,
            None => LogFilter::default(),
        };
        filter.order = order_direction.unwrap_or_default().into();
        let entries = service.logs(&filter, Page::new(first, skip))?;
        Ok(entries.into_iter().map(Into::into).collect())
    }

    async fn log_updates(
        &self,
        ctx: &Context<'_>,
        log_id: String,
        first: Option<usize>,
        skip: Option<usize>,
    ) -> GqlResult<Vec<LogUpdateObject>> {
        let service = ctx.data::<QueryService>()?;
        let updates = service.log_updates(parse_id(&log_id)?, Page::new(first, skip))?;
        Ok(updates.into_iter().map(Into::into).collect())
    }

    async fn user(&self, ctx: &Context<'_>, address: String) -> GqlResult<Option<UserObject>> {
        let service = ctx.data::<QueryService>()?;
        Ok(service.user(&parse_address(&address)?)?.map(Into::into))
    }

    async fn users(
        &self,
        ctx: &Context<'_>,
        first: Option<usize>,
        skip: Option<usize>,
    ) -> GqlResult<Vec<UserObject>> {
        let service = ctx.data::<QueryService>()?;
        let users = service.users(Page::new(first, skip))?;
        Ok(users.into_iter().map(Into::into).collect())
    }

    async fn category(&self, ctx: &Context<'_>, name: String) -> GqlResult<Option<CategoryObject>> {
        let service = ctx.data::<QueryService>()?;
        Ok(service.category(&name)?.map(Into::into))
    }

    async fn categories(
        &self,
        ctx: &Context<'_>,
        first: Option<usize>,
        skip: Option<usize>,
    ) -> GqlResult<Vec<CategoryObject>> {
        let service = ctx.data::<QueryService>()?;
        let categories = service.categories(Page::new(first, skip))?;
        Ok(categories.into_iter().map(Into::into).collect())
    }

    async fn user_category(
        &self,
        ctx: &Context<'_>,
        user: String,
        category: String,
    ) -> GqlResult<Option<UserCategoryObject>> {
        let service = ctx.data::<QueryService>()?;
        Ok(service
            .user_category(&parse_address(&user)?, &category)?
            .map(Into::into))
    }

    async fn daily_stats(&self, ctx: &Context<'_>, day: String) -> GqlResult<Option<DailyStatsObject>> {
        let service = ctx.data::<QueryService>()?;
        Ok(service.daily_stats(parse_day(&day)?)?.map(Into::into))
    }

    async fn daily_stats_range(
        &self,
        ctx: &Context<'_>,
        from: Option<String>,
        to: Option<String>,
        first: Option<usize>,
        skip: Option<usize>,
    ) -> GqlResult<Vec<DailyStatsObject>> {
        let service = ctx.data::<QueryService>()?;
        let from = from.as_deref().map(parse_day).transpose()?;
        let to = to.as_deref().map(parse_day).transpose()?;
        let days = service.daily_range(from, to, Page::new(first, skip))?;
        Ok(days.into_iter().map(Into::into).collect())
    }

    async fn global_stats(&self, ctx: &Context<'_>) -> GqlResult<GlobalStatsObject> {
        let service = ctx.data::<QueryService>()?;
        Ok(service.global_stats()?.into())
    }

    async fn batches(
        &self,
        ctx: &Context<'_>,
        creator: Option<String>,
        first: Option<usize>,
        skip: Option<usize>,
    ) -> GqlResult<Vec<BatchObject>> {
        let service = ctx.data::<QueryService>()?;
        let creator = creator.as_deref().map(parse_address).transpose()?;
        let batches = service.batches(creator.as_ref(), Page::new(first, skip))?;
        Ok(batches.into_iter().map(Into::into).collect())
    }

    async fn indexer_status(
        &self,
        ctx: &Context<'_>,
        recent_faults: Option<usize>,
    ) -> GqlResult<IndexerStatus> {
        let service = ctx.data::<QueryService>()?;
        let cursor = service.cursor()?;
        let faults = service.integrity_faults(Page::new(Some(recent_faults.unwrap_or(10)), None))?;
        Ok(IndexerStatus::new(cursor, faults))
    }
}

#[derive(Enum, Copy, Clone, Eq, PartialEq)]
#[graphql(name = "Severity")]
pub enum SeverityLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<Severity> for SeverityLevel {
    fn from(value: Severity) -> Self {
        match value {
            Severity::Debug => SeverityLevel::Debug,
            Severity::Info => SeverityLevel::Info,
            Severity::Warn => SeverityLevel::Warn,
            Severity::Error => SeverityLevel::Error,
            Severity::Fatal => SeverityLevel::Fatal,
        }
    }
}

impl From<SeverityLevel> for Severity {
    fn from(value: SeverityLevel) -> Self {
        match value {
            SeverityLevel::Debug => Severity::Debug,
            SeverityLevel::Info => Severity::Info,
            SeverityLevel::Warn => Severity::Warn,
            SeverityLevel::Error => Severity::Error,
            SeverityLevel::Fatal => Severity::Fatal,
        }
    }
}

#[derive(Enum, Copy, Clone, Default, Eq, PartialEq)]
pub enum OrderDirection {
    Asc,
    #[default]
    Desc,
}

impl From<OrderDirection> for SortOrder {
    fn from(value: OrderDirection) -> Self {
        match value {
            OrderDirection::Asc => SortOrder::Ascending,
            OrderDirection::Desc => SortOrder::Descending,
        }
    }
}

#[derive(InputObject, Default)]
pub struct LogEntryFilter {
    creator: Option<String>,
    category: Option<String>,
    level: Option<SeverityLevel>,
    active: Option<bool>,
    from_timestamp: Option<u64>,
    to_timestamp: Option<u64>,
}

impl LogEntryFilter {
    fn into_filter(self) -> GqlResult<LogFilter> {
        Ok(LogFilter {
            creator: self.creator.as_deref().map(parse_address).transpose()?,
            category: self.category,
            level: self.level.map(Into::into),
            active: self.active,
            from_timestamp: self.from_timestamp,
            to_timestamp: self.to_timestamp,
            order: SortOrder::default(),
        })
    }
}

#[derive(SimpleObject)]
struct LogEntryObject {
    id: String,
    creator: String,
    level: SeverityLevel,
    category: String,
    message: String,
    metadata: Option<String>,
    timestamp: u64,
    block_number: u64,
    transaction_hash: Option<String>,
    active: bool,
    update_count: u64,
    updated_at: Option<u64>,
}

impl From<LogEntry> for LogEntryObject {
    fn from(value: LogEntry) -> Self {
        Self {
            id: value.id.to_string(),
            creator: value.creator.to_string(),
            level: value.level.into(),
            category: value.category,
            message: value.message,
            metadata: value.metadata,
            timestamp: value.created_at,
            block_number: value.block_number,
            transaction_hash: value.transaction_hash,
            active: value.active,
            update_count: value.update_count,
            updated_at: value.updated_at,
        }
    }
}

#[derive(SimpleObject)]
struct LogUpdateObject {
    log_id: String,
    sequence: u64,
    updater: String,
    previous_message: String,
    message: String,
    metadata: Option<String>,
    timestamp: u64,
    block_number: u64,
}

impl From<LogUpdate> for LogUpdateObject {
    fn from(value: LogUpdate) -> Self {
        Self {
            log_id: value.log_id.to_string(),
            sequence: value.sequence,
            updater: value.updater.to_string(),
            previous_message: value.previous_message,
            message: value.message,
            metadata: value.metadata,
            timestamp: value.timestamp,
            block_number: value.block_number,
        }
    }
}

#[derive(SimpleObject)]
#[graphql(complex)]
struct UserObject {
    address: String,
    total_logs: u64,
    active_logs: u64,
    updates_made: u64,
    first_log_at: Option<u64>,
    last_log_at: Option<u64>,
    first_seen_at: u64,
}

#[ComplexObject]
impl UserObject {
    async fn logs(
        &self,
        ctx: &Context<'_>,
        first: Option<usize>,
        skip: Option<usize>,
    ) -> GqlResult<Vec<LogEntryObject>> {
        let service = ctx.data::<QueryService>()?;
        let entries = service.user_logs(&parse_address(&self.address)?, Page::new(first, skip))?;
        Ok(entries.into_iter().map(Into::into).collect())
    }

    async fn categories(&self, ctx: &Context<'_>) -> GqlResult<Vec<UserCategoryObject>> {
        let service = ctx.data::<QueryService>()?;
        let records = service.user_categories(&parse_address(&self.address)?)?;
        Ok(records.into_iter().map(Into::into).collect())
    }
}

impl From<UserRecord> for UserObject {
    fn from(value: UserRecord) -> Self {
        Self {
            address: value.address.to_string(),
            total_logs: value.counters.total_logs,
            active_logs: value.counters.active_logs,
            updates_made: value.updates_made,
            first_log_at: value.counters.first_log_at,
            last_log_at: value.counters.last_log_at,
            first_seen_at: value.first_seen_at,
        }
    }
}

#[derive(SimpleObject)]
#[graphql(complex)]
struct CategoryObject {
    name: String,
    total_logs: u64,
    active_logs: u64,
    first_log_at: Option<u64>,
    last_log_at: Option<u64>,
}

#[ComplexObject]
impl CategoryObject {
    async fn logs(
        &self,
        ctx: &Context<'_>,
        first: Option<usize>,
        skip: Option<usize>,
    ) -> GqlResult<Vec<LogEntryObject>> {
        let service = ctx.data::<QueryService>()?;
        let entries = service.category_logs(&self.name, Page::new(first, skip))?;
        Ok(entries.into_iter().map(Into::into).collect())
    }
}

impl From<CategoryRecord> for CategoryObject {
    fn from(value: CategoryRecord) -> Self {
        Self {
            name: value.name,
            total_logs: value.counters.total_logs,
            active_logs: value.counters.active_logs,
            first_log_at: value.counters.first_log_at,
            last_log_at: value.counters.last_log_at,
        }
    }
}

#[derive(SimpleObject)]
struct UserCategoryObject {
    user: String,
    category: String,
    total_logs: u64,
    active_logs: u64,
    first_log_at: Option<u64>,
    last_log_at: Option<u64>,
}

impl From<UserCategoryRecord> for UserCategoryObject {
    fn from(value: UserCategoryRecord) -> Self {
        Self {
            user: value.user.to_string(),
            category: value.category,
            total_logs: value.counters.total_logs,
            active_logs: value.counters.active_logs,
            first_log_at: value.counters.first_log_at,
            last_log_at: value.counters.last_log_at,
        }
    }
}

#[derive(SimpleObject)]
struct LevelCountsObject {
    debug: u64,
    info: u64,
    warn: u64,
    error: u64,
    fatal: u64,
}

impl From<LevelCounts> for LevelCountsObject {
    fn from(value: LevelCounts) -> Self {
        Self {
            debug: value.debug,
            info: value.info,
            warn: value.warn,
            error: value.error,
            fatal: value.fatal,
        }
    }
}

#[derive(SimpleObject)]
struct DailyStatsObject {
    day: String,
    day_start: u64,
    total_logs: u64,
    levels: LevelCountsObject,
    updates: u64,
}

impl From<DailyStats> for DailyStatsObject {
    fn from(value: DailyStats) -> Self {
        Self {
            day: value.day.format("%Y-%m-%d").to_string(),
            day_start: value.day_start,
            total_logs: value.total_logs,
            levels: value.levels.into(),
            updates: value.updates,
        }
    }
}

#[derive(SimpleObject)]
struct GlobalStatsObject {
    total_logs: u64,
    active_logs: u64,
    levels: LevelCountsObject,
    total_users: u64,
    total_categories: u64,
    total_updates: u64,
    total_batches: u64,
}

impl From<GlobalStats> for GlobalStatsObject {
    fn from(value: GlobalStats) -> Self {
        Self {
            total_logs: value.total_logs,
            active_logs: value.active_logs,
            levels: value.levels.into(),
            total_users: value.total_users,
            total_categories: value.total_categories,
            total_updates: value.total_updates,
            total_batches: value.total_batches,
        }
    }
}

#[derive(SimpleObject)]
struct BatchObject {
    creator: String,
    log_ids: Vec<String>,
    count: u64,
    timestamp: u64,
    block_number: u64,
}

impl From<BatchRecord> for BatchObject {
    fn from(value: BatchRecord) -> Self {
        Self {
            creator: value.creator.to_string(),
            log_ids: value.log_ids.iter().map(u64::to_string).collect(),
            count: value.count,
            timestamp: value.timestamp,
            block_number: value.block_number,
        }
    }
}

#[derive(SimpleObject)]
struct IntegrityFaultObject {
    entity: String,
    counter: String,
    detail: String,
    block_number: u64,
    log_index: u64,
    detected_at: String,
}

impl From<IntegrityFault> for IntegrityFaultObject {
    fn from(value: IntegrityFault) -> Self {
        Self {
            entity: value.entity,
            counter: value.counter,
            detail: value.detail,
            block_number: value.position.block_number,
            log_index: value.position.log_index,
            detected_at: value.detected_at.to_rfc3339(),
        }
    }
}

#[derive(SimpleObject)]
struct IndexerStatus {
    block_number: Option<u64>,
    log_index: Option<u64>,
    events_applied: u64,
    events_skipped: u64,
    updated_at: Option<String>,
    recent_faults: Vec<IntegrityFaultObject>,
}

impl IndexerStatus {
    fn new(cursor: IngestCursor, faults: Vec<IntegrityFault>) -> Self {
        Self {
            block_number: cursor.position.map(|position| position.block_number),
            log_index: cursor.position.map(|position| position.log_index),
            events_applied: cursor.events_applied,
            events_skipped: cursor.events_skipped,
            updated_at: cursor.updated_at.map(|at| at.to_rfc3339()),
            recent_faults: faults.into_iter().map(Into::into).collect(),
        }
    }
}

fn parse_id(value: &str) -> GqlResult<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| IndexError::InvalidQuery(format!("'{value}' is not a valid log id")).into())
}

fn parse_address(value: &str) -> GqlResult<Address> {
    Address::parse(value).map_err(|err| IndexError::InvalidQuery(err.to_string()).into())
}

fn parse_day(value: &str) -> GqlResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|err| {
        IndexError::InvalidQuery(format!("'{value}' is not a YYYY-MM-DD day: {err}")).into()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        event::{ChainEvent, EventEnvelope, LogStored},
        ingest::{IngestOptions, Ingester},
        store::IndexStore,
    };

    const ALICE: &str = "0x00000000000000000000000000000000000000a1";

    fn schema() -> IndexSchema {
        let store = Arc::new(IndexStore::in_memory());
        let events = (1..=3).map(|id| {
            EventEnvelope::new(
                id,
                0,
                ChainEvent::Stored(LogStored {
                    id,
                    creator: Address::parse(ALICE).unwrap(),
                    level: if id == 2 { Severity::Error } else { Severity::Info },
                    category: "payments".into(),
                    message: format!("entry {id}"),
                    metadata: None,
                    timestamp: 1_709_337_600 + id * 300,
                }),
            )
        });
        Ingester::new(&store, IngestOptions::default())
            .apply_all(events)
            .unwrap();
        build_schema(QueryService::new(store, 10, 100))
    }

    #[tokio::test]
    async fn resolves_filtered_log_entries() {
        let response = schema()
            .execute(
                r#"{ logEntries(where: { level: ERROR }) { id level category } }"#,
            )
            .await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        let data = response.data.into_json().unwrap();
        assert_eq!(data["logEntries"][0]["id"], "2");
        assert_eq!(data["logEntries"][0]["level"], "ERROR");
        assert_eq!(data["logEntries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolves_nested_user_logs_and_stats() {
        let query = format!(
            r#"{{
                user(address: "{ALICE}") {{ totalLogs logs(first: 2, skip: 1) {{ id }} }}
                globalStats {{ totalLogs levels {{ info error }} }}
                dailyStats(day: "2024-03-02") {{ totalLogs }}
            }}"#
        );
        let response = schema().execute(query.as_str()).await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        let data = response.data.into_json().unwrap();
        assert_eq!(data["user"]["totalLogs"], 3);
        assert_eq!(data["user"]["logs"][0]["id"], "2");
        assert_eq!(data["globalStats"]["levels"]["info"], 2);
        assert_eq!(data["dailyStats"]["totalLogs"], 3);
    }

    #[tokio::test]
    async fn rejects_malformed_arguments() {
        let response = schema().execute(r#"{ logEntry(id: "abc") { id } }"#).await;
        assert_eq!(response.errors.len(), 1);
        assert!(response.errors[0].message.contains("not a valid log id"));
    }
}
