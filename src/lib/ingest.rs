use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    error::{IndexError, Result},
    event::{
        BatchStored, ChainEvent, EventEnvelope, EventPosition, LogDeactivated, LogReactivated,
        LogStored, LogUpdated, StatsQueried,
    },
    model::{
        Address, BatchRecord, CounterFault, IntegrityFault, LogCounters, LogEntry, LogUpdate,
        Severity, Tracked, UserRecord, day_for_timestamp,
    },
    store::IndexStore,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Abort the event (and leave the cursor behind it) on the first
    /// integrity fault instead of recording it and carrying on.
    pub halt_on_integrity_fault: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { faults: Vec<IntegrityFault> },
    /// The position is at or behind the cursor: already applied.
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub applied: u64,
    pub duplicates: u64,
    pub faults: Vec<IntegrityFault>,
}

/// A batch that stopped at `failed_at`. Events before it stay applied and
/// are counted in `report`.
#[derive(Debug)]
pub struct BatchFailure {
    pub report: IngestReport,
    pub failed_at: EventPosition,
    pub error: IndexError,
}

pub struct Ingester<'a> {
    store: &'a IndexStore,
    options: IngestOptions,
}

impl<'a> Ingester<'a> {
    pub fn new(store: &'a IndexStore, options: IngestOptions) -> Self {
        Self { store, options }
    }

    /// Applies one event completely before returning. The cursor advances
    /// only after every entity write for the event succeeded.
    pub fn apply(&mut self, envelope: EventEnvelope) -> Result<ApplyOutcome> {
        envelope.event.validate()?;
        let _guard = self.store.writer()?;

        let position = envelope.position();
        let kind = envelope.event.kind();
        let mut cursor = self.store.cursor()?;
        if cursor.position.is_some_and(|last| position <= last) {
            cursor.events_skipped += 1;
            cursor.updated_at = Some(Utc::now());
            self.store.save_cursor(&cursor)?;
            counter!("chainlog_events_skipped_total", "kind" => kind).increment(1);
            debug!(%position, kind, "skipping event at or behind cursor");
            return Ok(ApplyOutcome::Duplicate);
        }

        let mut pass = EventPass {
            store: self.store,
            options: self.options,
            position,
            block_number: envelope.block_number,
            transaction_hash: envelope.transaction_hash,
            delta: GlobalDelta::default(),
            faults: Vec::new(),
        };

        match envelope.event {
            ChainEvent::Stored(event) => pass.stored(event)?,
            ChainEvent::Updated(event) => pass.updated(event)?,
            ChainEvent::Deactivated(event) => pass.deactivated(event)?,
            ChainEvent::Reactivated(event) => pass.reactivated(event)?,
            ChainEvent::BatchStored(event) => pass.batch_stored(event)?,
            ChainEvent::StatsQueried(event) => pass.stats_queried(event)?,
        }
        pass.commit_global()?;

        cursor.position = Some(position);
        cursor.events_applied += 1;
        cursor.updated_at = Some(Utc::now());
        self.store.save_cursor(&cursor)?;

        counter!("chainlog_events_ingested_total", "kind" => kind).increment(1);
        debug!(%position, kind, "applied event");
        Ok(ApplyOutcome::Applied {
            faults: pass.faults,
        })
    }

    pub fn apply_all<I>(&mut self, envelopes: I) -> Result<IngestReport>
    where
        I: IntoIterator<Item = EventEnvelope>,
    {
        self.apply_batch(envelopes).map_err(|failure| failure.error)
    }

    /// Like `apply_all`, but a failure carries the partial report and the
    /// position of the event that was refused.
    pub fn apply_batch<I>(&mut self, envelopes: I) -> std::result::Result<IngestReport, BatchFailure>
    where
        I: IntoIterator<Item = EventEnvelope>,
    {
        let mut report = IngestReport::default();
        for envelope in envelopes {
            let position = envelope.position();
            match self.apply(envelope) {
                Ok(ApplyOutcome::Applied { faults }) => {
                    report.applied += 1;
                    report.faults.extend(faults);
                }
                Ok(ApplyOutcome::Duplicate) => report.duplicates += 1,
                Err(error) => {
                    warn!(
                        applied = report.applied,
                        duplicates = report.duplicates,
                        %position,
                        "event batch stopped: {error}"
                    );
                    return Err(BatchFailure {
                        report,
                        failed_at: position,
                        error,
                    });
                }
            }
        }
        info!(
            applied = report.applied,
            duplicates = report.duplicates,
            faults = report.faults.len(),
            "ingested event batch"
        );
        Ok(report)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Deactivate,
    Reactivate,
}

impl Activity {
    fn apply(self, counters: &mut LogCounters) -> std::result::Result<(), CounterFault> {
        match self {
            Activity::Deactivate => counters.deactivate(),
            Activity::Reactivate => counters.reactivate(),
        }
    }

    fn target_state(self) -> bool {
        matches!(self, Activity::Reactivate)
    }

    fn label(self) -> &'static str {
        match self {
            Activity::Deactivate => "deactivation",
            Activity::Reactivate => "reactivation",
        }
    }
}

/// Changes to the global singleton accumulated over one event and written
/// once at the end.
#[derive(Debug, Default)]
struct GlobalDelta {
    stored: Option<Severity>,
    activity: Option<Activity>,
    users: u64,
    categories: u64,
    updates: u64,
    batches: u64,
}

impl GlobalDelta {
    fn is_empty(&self) -> bool {
        self.stored.is_none()
            && self.activity.is_none()
            && self.users == 0
            && self.categories == 0
            && self.updates == 0
            && self.batches == 0
    }
}

struct EventPass<'s> {
    store: &'s IndexStore,
    options: IngestOptions,
    position: EventPosition,
    block_number: u64,
    transaction_hash: Option<String>,
    delta: GlobalDelta,
    faults: Vec<IntegrityFault>,
}

impl EventPass<'_> {
    fn stored(&mut self, event: LogStored) -> Result<()> {
        let day = day_for_timestamp(event.timestamp)?;
        match self.store.log(event.id)? {
            Some(existing) if existing.last_event != Some(self.position) => {
                warn!(
                    "log {} already stored at block {}; ignoring stored event at {}",
                    event.id, existing.block_number, self.position
                );
                return Ok(());
            }
            // Same position: a replay after a crash may have stopped between
            // the entry and its index keys.
            Some(existing) => self.store.index_log(&existing)?,
            None => {
                let entry = LogEntry {
                    id: event.id,
                    creator: event.creator.clone(),
                    level: event.level,
                    category: event.category.clone(),
                    message: event.message,
                    metadata: event.metadata,
                    created_at: event.timestamp,
                    block_number: self.block_number,
                    transaction_hash: self.transaction_hash.clone(),
                    active: true,
                    update_count: 0,
                    updated_at: None,
                    last_event: Some(self.position),
                };
                self.store.save_log(&entry)?;
                self.store.index_log(&entry)?;
            }
        }

        let timestamp = event.timestamp;
        let mut user = self.load_user(&event.creator, timestamp)?;
        if user.accepts(self.position) {
            user.counters.record_log(timestamp);
            user.set_last_event(self.position);
            self.store.save_user(&user)?;
        }

        let (mut category, created) = self.store.category_or_default(&event.category)?;
        if created {
            category.first_event = Some(self.position);
        }
        if category.first_event == Some(self.position) {
            self.delta.categories += 1;
        }
        if category.accepts(self.position) {
            category.counters.record_log(timestamp);
            category.set_last_event(self.position);
            self.store.save_category(&category)?;
        }

        let mut pair = self
            .store
            .user_category_or_default(&event.creator, &event.category)?;
        if pair.accepts(self.position) {
            pair.counters.record_log(timestamp);
            pair.set_last_event(self.position);
            self.store.save_user_category(&pair)?;
        }

        let mut daily = self.store.daily_or_default(day)?;
        if daily.accepts(self.position) {
            daily.total_logs += 1;
            daily.levels.increment(event.level);
            daily.set_last_event(self.position);
            self.store.save_daily(&daily)?;
        }

        self.delta.stored = Some(event.level);
        Ok(())
    }

    fn updated(&mut self, event: LogUpdated) -> Result<()> {
        let day = day_for_timestamp(event.timestamp)?;
        let mut updater = self.load_user(&event.updater, event.timestamp)?;

        let Some(mut entry) = self.store.log(event.id)? else {
            warn!(
                "update at {} references unknown log {}; recording updater only",
                self.position, event.id
            );
            return self.save_if_new(&updater);
        };

        if entry.accepts(self.position) {
            let sequence = entry.update_count + 1;
            let update = LogUpdate {
                log_id: entry.id,
                sequence,
                updater: event.updater.clone(),
                previous_message: entry.message.clone(),
                message: event.new_message.clone(),
                metadata: event.new_metadata.clone(),
                timestamp: event.timestamp,
                block_number: self.block_number,
                position: self.position,
            };
            self.store.save_log_update(&update)?;

            entry.message = event.new_message;
            entry.metadata = event.new_metadata;
            entry.update_count = sequence;
            entry.updated_at = Some(event.timestamp);
            entry.set_last_event(self.position);
            self.store.save_log(&entry)?;
        }

        if updater.accepts(self.position) {
            updater.updates_made += 1;
            updater.set_last_event(self.position);
            self.store.save_user(&updater)?;
        }

        let mut daily = self.store.daily_or_default(day)?;
        if daily.accepts(self.position) {
            daily.updates += 1;
            daily.set_last_event(self.position);
            self.store.save_daily(&daily)?;
        }

        self.delta.updates += 1;
        Ok(())
    }

    fn deactivated(&mut self, event: LogDeactivated) -> Result<()> {
        self.toggle_activity(
            event.id,
            &event.deactivator,
            event.timestamp,
            Activity::Deactivate,
        )
    }

    fn reactivated(&mut self, event: LogReactivated) -> Result<()> {
        self.toggle_activity(
            event.id,
            &event.reactivator,
            event.timestamp,
            Activity::Reactivate,
        )
    }

    fn toggle_activity(
        &mut self,
        id: u64,
        actor: &Address,
        timestamp: u64,
        activity: Activity,
    ) -> Result<()> {
        let Some(mut entry) = self.store.log(id)? else {
            warn!(
                "{} at {} references unknown log {}; recording actor only",
                activity.label(),
                self.position,
                id
            );
            let user = self.load_user(actor, timestamp)?;
            return self.save_if_new(&user);
        };

        let replaying = entry.last_event == Some(self.position);
        if entry.active == activity.target_state() && !replaying {
            warn!(
                "{} at {} leaves log {} unchanged (active={})",
                activity.label(),
                self.position,
                id,
                entry.active
            );
            let user = self.load_user(actor, timestamp)?;
            return self.save_if_new(&user);
        }

        if entry.accepts(self.position) {
            entry.active = activity.target_state();
            entry.set_last_event(self.position);
            self.store.save_log(&entry)?;
        }

        let (mut creator, _) = self.store.user_or_default(&entry.creator, entry.created_at)?;
        if creator.accepts(self.position) {
            let entity = format!("user:{}", creator.address);
            if self.adjust(&entity, &mut creator.counters, activity)? {
                creator.set_last_event(self.position);
                self.store.save_user(&creator)?;
            }
        }

        let (mut category, _) = self.store.category_or_default(&entry.category)?;
        if category.accepts(self.position) {
            let entity = format!("category:{}", category.name);
            if self.adjust(&entity, &mut category.counters, activity)? {
                category.set_last_event(self.position);
                self.store.save_category(&category)?;
            }
        }

        let mut pair = self
            .store
            .user_category_or_default(&entry.creator, &entry.category)?;
        if pair.accepts(self.position) {
            let entity = format!("user_category:{}:{}", pair.user, pair.category);
            if self.adjust(&entity, &mut pair.counters, activity)? {
                pair.set_last_event(self.position);
                self.store.save_user_category(&pair)?;
            }
        }

        if actor != &entry.creator {
            let user = self.load_user(actor, timestamp)?;
            self.save_if_new(&user)?;
        }

        self.delta.activity = Some(activity);
        Ok(())
    }

    fn batch_stored(&mut self, event: BatchStored) -> Result<()> {
        if self.store.batch(self.position)?.is_none() {
            self.store.save_batch(&BatchRecord {
                creator: event.creator.clone(),
                log_ids: event.ids,
                count: event.count,
                timestamp: event.timestamp,
                block_number: self.block_number,
                position: self.position,
            })?;
        }
        let user = self.load_user(&event.creator, event.timestamp)?;
        self.save_if_new(&user)?;
        self.delta.batches += 1;
        Ok(())
    }

    fn stats_queried(&mut self, event: StatsQueried) -> Result<()> {
        let user = self.load_user(&event.querier, event.timestamp)?;
        self.save_if_new(&user)
    }

    /// Loads a user, creating the zero-state record on first reference and
    /// counting it towards the global user total.
    fn load_user(&mut self, address: &Address, seen_at: u64) -> Result<UserRecord> {
        let (mut user, created) = self.store.user_or_default(address, seen_at)?;
        if created {
            user.first_event = Some(self.position);
        }
        if user.first_event == Some(self.position) {
            self.delta.users += 1;
        }
        Ok(user)
    }

    fn save_if_new(&self, user: &UserRecord) -> Result<()> {
        if user.first_event == Some(self.position) && user.last_event.is_none() {
            self.store.save_user(user)?;
        }
        Ok(())
    }

    /// Applies an activity change to one counter record. On a fault the
    /// record is left untouched and `false` is returned.
    fn adjust(
        &mut self,
        entity: &str,
        counters: &mut LogCounters,
        activity: Activity,
    ) -> Result<bool> {
        let mut candidate = *counters;
        match activity.apply(&mut candidate) {
            Ok(()) => {
                *counters = candidate;
                Ok(true)
            }
            Err(fault) => {
                self.report_fault(entity, fault)?;
                Ok(false)
            }
        }
    }

    fn report_fault(&mut self, entity: &str, fault: CounterFault) -> Result<()> {
        let record = IntegrityFault {
            entity: entity.to_string(),
            counter: "active_logs".to_string(),
            detail: fault.to_string(),
            position: self.position,
            detected_at: Utc::now(),
        };
        error!(
            entity,
            position = %self.position,
            "integrity fault: {} (possible missed or duplicated event)",
            fault
        );
        counter!("chainlog_integrity_faults_total", "kind" => fault_label(fault)).increment(1);
        self.store.record_fault(&record)?;
        self.faults.push(record);

        if self.options.halt_on_integrity_fault {
            return Err(IndexError::IntegrityFault(format!(
                "{entity} at {}: {fault}",
                self.position
            )));
        }
        Ok(())
    }

    fn commit_global(&mut self) -> Result<()> {
        if self.delta.is_empty() {
            return Ok(());
        }
        let mut global = self.store.global()?;
        if !global.accepts(self.position) {
            return Ok(());
        }

        if let Some(level) = self.delta.stored {
            global.total_logs += 1;
            global.active_logs += 1;
            global.levels.increment(level);
        }
        if let Some(activity) = self.delta.activity {
            let mut counters = global.active_counters();
            if self.adjust("global", &mut counters, activity)? {
                global.active_logs = counters.active_logs;
            }
        }
        global.total_users += self.delta.users;
        global.total_categories += self.delta.categories;
        global.total_updates += self.delta.updates;
        global.total_batches += self.delta.batches;
        global.set_last_event(self.position);
        self.store.save_global(&global)
    }
}

fn fault_label(fault: CounterFault) -> &'static str {
    match fault {
        CounterFault::Underflow => "underflow",
        CounterFault::ExceedsTotal => "exceeds_total",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(tail: &str) -> Address {
        Address::parse(&format!("0x{:0>40}", tail)).unwrap()
    }

    fn stored(block: u64, id: u64, creator: &Address, category: &str, level: Severity) -> EventEnvelope {
        EventEnvelope::new(
            block,
            0,
            ChainEvent::Stored(LogStored {
                id,
                creator: creator.clone(),
                level,
                category: category.into(),
                message: format!("log {id}"),
                metadata: None,
                timestamp: 1_700_000_000 + block,
            }),
        )
    }

    #[test]
    fn redelivered_event_is_skipped() {
        let store = IndexStore::in_memory();
        let mut ingester = Ingester::new(&store, IngestOptions::default());
        let alice = address("a1");

        let event = stored(1, 1, &alice, "info", Severity::Info);
        assert!(matches!(
            ingester.apply(event.clone()).unwrap(),
            ApplyOutcome::Applied { .. }
        ));
        assert_eq!(ingester.apply(event).unwrap(), ApplyOutcome::Duplicate);

        let global = store.global().unwrap();
        assert_eq!(global.total_logs, 1);
        assert_eq!(global.total_users, 1);
        let cursor = store.cursor().unwrap();
        assert_eq!(cursor.events_applied, 1);
        assert_eq!(cursor.events_skipped, 1);
    }

    #[test]
    fn reapplying_a_partially_applied_event_does_not_double_count() {
        let store = IndexStore::in_memory();
        let alice = address("a1");
        let event = stored(7, 1, &alice, "info", Severity::Warn);

        {
            let mut ingester = Ingester::new(&store, IngestOptions::default());
            ingester.apply(event.clone()).unwrap();
        }
        // Simulate a crash before the cursor write: rewind the cursor only.
        store.save_cursor(&Default::default()).unwrap();

        let mut ingester = Ingester::new(&store, IngestOptions::default());
        ingester.apply(event).unwrap();

        let global = store.global().unwrap();
        assert_eq!(global.total_logs, 1);
        assert_eq!(global.total_users, 1);
        assert_eq!(global.total_categories, 1);
        assert_eq!(global.levels.warn, 1);
        let user = store.user(&alice).unwrap().unwrap();
        assert_eq!(user.counters.total_logs, 1);
        let category = store.category("info").unwrap().unwrap();
        assert_eq!(category.counters.total_logs, 1);
    }

    #[test]
    fn halting_mode_surfaces_integrity_faults() {
        let store = IndexStore::in_memory();
        let alice = address("a1");
        {
            let mut ingester = Ingester::new(&store, IngestOptions::default());
            ingester
                .apply(stored(1, 1, &alice, "info", Severity::Info))
                .unwrap();
        }

        // Corrupt the user record so the next deactivation underflows.
        let mut user = store.user(&alice).unwrap().unwrap();
        user.counters.active_logs = 0;
        store.save_user(&user).unwrap();

        let mut ingester = Ingester::new(
            &store,
            IngestOptions {
                halt_on_integrity_fault: true,
            },
        );
        let err = ingester
            .apply(EventEnvelope::new(
                2,
                0,
                ChainEvent::Deactivated(LogDeactivated {
                    id: 1,
                    deactivator: alice.clone(),
                    timestamp: 1_700_000_010,
                }),
            ))
            .unwrap_err();
        assert!(matches!(err, IndexError::IntegrityFault(_)));
        assert_eq!(
            store.cursor().unwrap().position,
            Some(EventPosition::new(1, 0))
        );
        assert_eq!(store.faults(0, 10).unwrap().len(), 1);
        assert_eq!(store.user(&alice).unwrap().unwrap().counters.active_logs, 0);
    }

    #[test]
    fn duplicate_log_id_from_another_position_is_ignored() {
        let store = IndexStore::in_memory();
        let mut ingester = Ingester::new(&store, IngestOptions::default());
        let alice = address("a1");
        let bob = address("b2");

        ingester
            .apply(stored(1, 5, &alice, "info", Severity::Info))
            .unwrap();
        ingester
            .apply(stored(2, 5, &bob, "error", Severity::Error))
            .unwrap();

        let entry = store.log(5).unwrap().unwrap();
        assert_eq!(entry.creator, alice);
        assert_eq!(store.global().unwrap().total_logs, 1);
        assert!(store.category("error").unwrap().is_none());
    }

    #[test]
    fn failed_batch_reports_what_was_applied() {
        let store = IndexStore::in_memory();
        let alice = address("a1");
        let mut broken = stored(3, 2, &alice, "info", Severity::Info);
        if let ChainEvent::Stored(event) = &mut broken.event {
            event.category = " ".into();
        }

        let failure = Ingester::new(&store, IngestOptions::default())
            .apply_batch(vec![
                stored(1, 1, &alice, "info", Severity::Info),
                stored(1, 1, &alice, "info", Severity::Info),
                broken,
                stored(4, 3, &alice, "info", Severity::Info),
            ])
            .unwrap_err();
        assert_eq!(failure.report.applied, 1);
        assert_eq!(failure.report.duplicates, 1);
        assert_eq!(failure.failed_at, EventPosition::new(3, 0));
        assert!(matches!(failure.error, IndexError::InvalidEvent(_)));
        assert!(store.log(3).unwrap().is_none());
    }
}
