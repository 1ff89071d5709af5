use super::observer::{ObserverRegistry, StoreSubscription, SubscriptionId};
use crate::core::{CollectionScope, Identifier, Record, Result, SyncError};
use crate::ledger::PendingLedger;
use im::OrdMap;
use std::collections::HashSet;
use tracing::{Level, event};

/// Cheap, immutable view of the store at one point in time.
pub type StoreSnapshot = OrdMap<Identifier, Record>;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Upserted(Record),
    Removed(Identifier),
    Rekeyed { from: Identifier, to: Identifier },
    Authoritative(ApplyReport),
    Cleared,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    /// Strictly increasing per store.
    pub sequence: u64,
    pub change: StoreChange,
}

/// Outcome of merging one authoritative batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    pub scope: CollectionScope,
    pub applied: Vec<Identifier>,
    pub unchanged: usize,
    /// Incoming records skipped because an optimistic operation owns them.
    pub deferred: Vec<Identifier>,
    pub removed: Vec<Identifier>,
    /// Absent from the batch but kept (unconfirmed, in flight, or just committed).
    pub retained: Vec<Identifier>,
}

impl ApplyReport {
    fn new(scope: CollectionScope) -> Self {
        Self {
            scope,
            applied: Vec::new(),
            unchanged: 0,
            deferred: Vec::new(),
            removed: Vec::new(),
            retained: Vec::new(),
        }
    }

    pub fn changed_anything(&self) -> bool {
        !self.applied.is_empty() || !self.removed.is_empty()
    }
}

/// Observable in-memory collection of records keyed by identifier.
///
/// Every mutating call emits exactly one event to subscribers, synchronously
/// and in call order. Batching is left to callers.
#[derive(Debug, Default)]
pub struct EntityStore {
    records: OrdMap<Identifier, Record>,
    observers: ObserverRegistry,
    sequence: u64,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> StoreSubscription {
        self.observers.subscribe()
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Inserts or replaces by id and returns the replaced record.
    pub fn upsert(&mut self, record: Record) -> Option<Record> {
        let previous = self.records.insert(record.id.clone(), record.clone());
        self.notify(StoreChange::Upserted(record));
        previous
    }

    /// Removes by id. Absent ids are a silent no-op.
    pub fn remove(&mut self, id: &Identifier) -> Option<Record> {
        let removed = self.records.remove(id)?;
        self.notify(StoreChange::Removed(id.clone()));
        Some(removed)
    }

    /// Moves a record from a temporary id to its server id in one step.
    ///
    /// If an authoritative copy already arrived under `to`, it wins over the
    /// optimistic draft.
    pub fn rekey(&mut self, from: &Identifier, to: Identifier) -> Result<Record> {
        let mut record = self
            .records
            .remove(from)
            .ok_or_else(|| SyncError::NotFound(format!("record {} is not in the store", from)))?;

        let landed = match self.records.get(&to) {
            Some(existing) => existing.clone(),
            None => {
                record.id = to.clone();
                self.records.insert(to.clone(), record.clone());
                record
            }
        };

        self.notify(StoreChange::Rekeyed {
            from: from.clone(),
            to,
        });
        Ok(landed)
    }

    /// Merges an authoritative snapshot of `scope`.
    ///
    /// Records owned by an in-flight operation are left untouched, whether
    /// they appear in the batch or not. Records of the scope missing from the
    /// batch are removed unless they are unconfirmed or were committed within
    /// the ledger's grace window.
    pub fn apply_authoritative(
        &mut self,
        records: Vec<Record>,
        scope: &CollectionScope,
        ledger: &PendingLedger,
    ) -> ApplyReport {
        let mut report = ApplyReport::new(scope.clone());
        let mut seen = HashSet::with_capacity(records.len());

        for record in records {
            seen.insert(record.id.clone());
            if ledger.is_in_flight(&record.id) {
                report.deferred.push(record.id);
                continue;
            }
            if self.records.get(&record.id) == Some(&record) {
                report.unchanged += 1;
                continue;
            }
            report.applied.push(record.id.clone());
            self.records.insert(record.id.clone(), record);
        }

        let missing: Vec<Identifier> = self
            .records
            .iter()
            .filter(|(id, record)| scope.contains(record) && !seen.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();

        for id in missing {
            if !id.is_confirmed() || ledger.is_in_flight(&id) || ledger.is_recently_committed(&id) {
                report.retained.push(id);
                continue;
            }
            self.records.remove(&id);
            report.removed.push(id);
        }

        if !report.deferred.is_empty() {
            event!(
                Level::DEBUG,
                scope = %scope,
                deferred = report.deferred.len(),
                "authoritative records deferred behind optimistic state"
            );
        }

        self.notify(StoreChange::Authoritative(report.clone()));
        report
    }

    /// Drops every record; used at sign-out.
    pub fn clear(&mut self) {
        self.records.clear();
        self.notify(StoreChange::Cleared);
    }

    pub fn get(&self, id: &Identifier) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.records.clone()
    }

    pub fn records_in(&self, scope: &CollectionScope) -> Vec<Record> {
        self.records
            .values()
            .filter(|record| scope.contains(record))
            .cloned()
            .collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub(crate) fn close_observers(&mut self) {
        self.observers.clear();
    }

    fn notify(&mut self, change: StoreChange) {
        self.sequence += 1;
        let event = StoreEvent {
            sequence: self.sequence,
            change,
        };
        self.observers.notify(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Collection;
    use crate::ledger::OperationKind;

    fn family(id: &str, name: &str) -> Record {
        Record::new(Identifier::from(id), Collection::Families)
            .with_field("name", name)
            .with_members(["u1"])
    }

    fn scope() -> CollectionScope {
        CollectionScope::member_of(Collection::Families, "u1")
    }

    #[test]
    fn test_upsert_and_remove_notify_in_order() {
        let mut store = EntityStore::new();
        let mut sub = store.subscribe();

        store.upsert(family("f1", "Tanaka"));
        store.upsert(family("f1", "Sato"));
        store.remove(&Identifier::from("f1"));
        store.remove(&Identifier::from("f1"));

        let events = sub.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(matches!(events[2].change, StoreChange::Removed(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut store = EntityStore::new();
        let mut sub = store.subscribe();
        assert!(store.unsubscribe(sub.id()));
        assert!(!store.unsubscribe(sub.id()));

        store.upsert(family("f1", "Tanaka"));
        assert!(sub.try_recv().is_none());
        assert_eq!(store.observer_count(), 0);
    }

    #[test]
    fn test_dropped_subscriptions_are_pruned() {
        let mut store = EntityStore::new();
        let sub = store.subscribe();
        let _kept = store.subscribe();
        drop(sub);

        store.upsert(family("f1", "Tanaka"));
        assert_eq!(store.observer_count(), 1);
    }

    #[test]
    fn test_rekey_moves_record_to_server_id() {
        let mut store = EntityStore::new();
        let temp = Identifier::pending();
        let mut draft = family("ignored", "Tanaka");
        draft.id = temp.clone();
        store.upsert(draft);

        let landed = store.rekey(&temp, Identifier::from("srv-1")).unwrap();
        assert_eq!(landed.id, Identifier::from("srv-1"));
        assert!(!store.contains(&temp));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rekey_prefers_authoritative_copy() {
        let mut store = EntityStore::new();
        let temp = Identifier::pending();
        let mut draft = family("ignored", "Draft");
        draft.id = temp.clone();
        store.upsert(draft);
        store.upsert(family("srv-1", "Server"));

        let landed = store.rekey(&temp, Identifier::from("srv-1")).unwrap();
        assert_eq!(landed.display_name(), Some("Server"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rekey_unknown_is_not_found() {
        let mut store = EntityStore::new();
        let err = store
            .rekey(&Identifier::pending(), Identifier::from("srv-1"))
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn test_authoritative_batch_does_not_clobber_in_flight() {
        let mut store = EntityStore::new();
        let mut ledger = PendingLedger::default();
        store.upsert(family("f2", "Optimistic"));
        ledger
            .begin(Identifier::from("f2"), Collection::Families, OperationKind::Update, Some(family("f2", "Before")))
            .unwrap();

        let report = store.apply_authoritative(vec![family("f2", "Server")], &scope(), &ledger);

        assert_eq!(report.deferred, vec![Identifier::from("f2")]);
        assert_eq!(
            store.get(&Identifier::from("f2")).unwrap().display_name(),
            Some("Optimistic")
        );
    }

    #[test]
    fn test_authoritative_batch_replaces_and_removes() {
        let mut store = EntityStore::new();
        let ledger = PendingLedger::default();
        store.upsert(family("f1", "Old"));
        store.upsert(family("gone", "Gone"));
        store.upsert(
            Record::new(Identifier::from("p1"), Collection::Projects).with_field("name", "Other scope"),
        );

        let report = store.apply_authoritative(
            vec![family("f1", "New"), family("f3", "Added")],
            &scope(),
            &ledger,
        );

        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.removed, vec![Identifier::from("gone")]);
        assert!(store.contains(&Identifier::from("p1")));
        assert_eq!(store.get(&Identifier::from("f1")).unwrap().display_name(), Some("New"));
    }

    #[test]
    fn test_authoritative_batch_keeps_unconfirmed_and_recently_committed() {
        let mut store = EntityStore::new();
        let mut ledger = PendingLedger::default();

        let mut draft = family("x", "Draft");
        draft.id = Identifier::pending();
        let temp = draft.id.clone();
        store.upsert(draft);

        store.upsert(family("srv-1", "Just created"));
        let op = ledger
            .begin(Identifier::from("srv-1"), Collection::Families, OperationKind::Create, None)
            .unwrap();
        ledger.commit(op).unwrap();

        let report = store.apply_authoritative(Vec::new(), &scope(), &ledger);

        assert!(report.removed.is_empty());
        assert_eq!(report.retained.len(), 2);
        assert!(store.contains(&temp));
        assert!(store.contains(&Identifier::from("srv-1")));
    }

    #[test]
    fn test_authoritative_apply_emits_single_event() {
        let mut store = EntityStore::new();
        let ledger = PendingLedger::default();
        let mut sub = store.subscribe();

        store.apply_authoritative(
            vec![family("f1", "A"), family("f2", "B"), family("f3", "C")],
            &scope(),
            &ledger,
        );

        let events = sub.drain();
        assert_eq!(events.len(), 1);
        match &events[0].change {
            StoreChange::Authoritative(report) => assert_eq!(report.applied.len(), 3),
            other => panic!("unexpected change {:?}", other),
        }
    }
}
