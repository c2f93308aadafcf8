//! Versioned document store with optimistic multi-document transactions.
//!
//! Every document is kept as `commonware-codec` bytes next to the version of the
//! commit that last wrote it. A commit carries the versions its transaction read
//! and is rejected with [StoreError::Conflict] if any of them moved, so among
//! concurrent transactions built on the same snapshot at most one lands.
//!
//! Mutations are staged against the current rows before anything is written:
//! a commit either applies every mutation or none of them.

use bytes::Bytes;
use commonware_codec::{DecodeExt, Encode};
use parlor_types::{GameKind, Key, ProfitLogEntry, RoundRecord, Treasury, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Sequence number of the commit that last wrote a document.
pub type Version = u64;

/// Versions observed by a transaction; `None` records that the key was absent.
pub type ReadSet = BTreeMap<Key, Option<Version>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    pub version: Version,
    pub value: Value,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflicting commit on {0:?}")]
    Conflict(Key),
    #[error("document {0:?} does not exist")]
    Missing(Key),
    #[error("insufficient balance for {participant} (available={available}, requested={requested})")]
    InsufficientBalance {
        participant: String,
        available: u64,
        requested: u64,
    },
    #[error("balance overflow for {0}")]
    Overflow(String),
    #[error("document {key:?} is unreadable")]
    Decode {
        key: Key,
        #[source]
        source: commonware_codec::Error,
    },
    #[error("document {0:?} holds an unexpected value")]
    UnexpectedValue(Key),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Put(Key, Value),
    /// Signed adjustment of an existing balance; never drives it below zero.
    AdjustBalance { participant: String, delta: i64 },
    /// Increment of the treasury singleton (created on first credit).
    CreditTreasury(u64),
    /// Append to the profit log at the next free position.
    AppendProfit(ProfitLogEntry),
}

/// The shared state store consumed by every actor.
pub trait Store: Send + Sync {
    fn read(&self, key: &Key) -> Result<Option<Document>, StoreError>;

    /// Current version of `key` without decoding it.
    fn version(&self, key: &Key) -> Result<Option<Version>, StoreError>;

    /// Push updates for `key`; the channel carries the document written by each commit.
    fn subscribe(&self, key: &Key) -> Result<watch::Receiver<Option<Document>>, StoreError>;

    /// Apply `mutations` if every version in `reads` is still current.
    fn commit(&self, reads: &ReadSet, mutations: &[Mutation]) -> Result<Version, StoreError>;
}

/// The participant balance service.
pub trait Balances: Send + Sync {
    /// Atomically add `delta` to a participant's balance and return the new balance.
    ///
    /// A debit larger than the available balance fails without effect.
    fn atomic_adjust(&self, participant: &str, delta: i64) -> Result<u64, StoreError>;
}

/// Buffered reads and writes of one transaction attempt.
pub struct Txn<'a, S: ?Sized> {
    store: &'a S,
    reads: ReadSet,
    cache: BTreeMap<Key, Option<Value>>,
    mutations: Vec<Mutation>,
}

impl<'a, S: Store + ?Sized> Txn<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            reads: BTreeMap::new(),
            cache: BTreeMap::new(),
            mutations: Vec::new(),
        }
    }

    /// Read a document, pinning the observed version into the read set.
    ///
    /// Repeated reads of the same key return the first snapshot.
    pub fn get(&mut self, key: &Key) -> Result<Option<Value>, StoreError> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(cached.clone());
        }
        let document = self.store.read(key)?;
        let (version, value) = match document {
            Some(Document { version, value }) => (Some(version), Some(value)),
            None => (None, None),
        };
        self.reads.entry(key.clone()).or_insert(version);
        self.cache.insert(key.clone(), value.clone());
        Ok(value)
    }

    /// Pin the current version of `key` without decoding it, so the commit can
    /// overwrite a document that no longer decodes.
    pub fn pin(&mut self, key: &Key) -> Result<Option<Version>, StoreError> {
        if let Some(version) = self.reads.get(key) {
            return Ok(*version);
        }
        let version = self.store.version(key)?;
        self.reads.insert(key.clone(), version);
        Ok(version)
    }

    pub fn round(&mut self, game: GameKind) -> Result<Option<RoundRecord>, StoreError> {
        let key = Key::Round(game);
        match self.get(&key)? {
            Some(Value::Round(record)) => Ok(Some(record)),
            Some(_) => Err(StoreError::UnexpectedValue(key)),
            None => Ok(None),
        }
    }

    /// Highest round id issued for `game` (0 before the first round).
    pub fn round_counter(&mut self, game: GameKind) -> Result<u64, StoreError> {
        let key = Key::RoundCounter(game);
        match self.get(&key)? {
            Some(Value::RoundCounter(counter)) => Ok(counter),
            Some(_) => Err(StoreError::UnexpectedValue(key)),
            None => Ok(0),
        }
    }

    pub fn put(&mut self, key: Key, value: Value) {
        self.mutations.push(Mutation::Put(key, value));
    }

    pub fn adjust_balance(&mut self, participant: impl Into<String>, delta: i64) {
        self.mutations.push(Mutation::AdjustBalance {
            participant: participant.into(),
            delta,
        });
    }

    pub fn credit_treasury(&mut self, amount: u64) {
        if amount > 0 {
            self.mutations.push(Mutation::CreditTreasury(amount));
        }
    }

    pub fn append_profit(&mut self, entry: ProfitLogEntry) {
        self.mutations.push(Mutation::AppendProfit(entry));
    }

    fn into_parts(self) -> (ReadSet, Vec<Mutation>) {
        (self.reads, self.mutations)
    }
}

#[derive(Debug, Error)]
pub enum TxnError<E> {
    #[error("transaction aborted: {0}")]
    Aborted(E),
    #[error(transparent)]
    Store(StoreError),
    #[error("transaction gave up after {0} conflicting attempts")]
    Exhausted(usize),
}

/// Run `body` against a fresh snapshot and commit its writes, retrying on conflict.
///
/// The body is re-run from scratch on every attempt and must derive everything it
/// writes from what it reads in that attempt. An `Err` from the body aborts without
/// writing anything.
pub fn transaction<S, T, E, F>(store: &S, max_attempts: usize, mut body: F) -> Result<T, TxnError<E>>
where
    S: Store + ?Sized,
    F: FnMut(&mut Txn<'_, S>) -> Result<T, E>,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let mut txn = Txn::new(store);
        let output = body(&mut txn).map_err(TxnError::Aborted)?;
        let (reads, mutations) = txn.into_parts();
        match store.commit(&reads, &mutations) {
            Ok(_) => return Ok(output),
            Err(StoreError::Conflict(key)) => {
                debug!(?key, attempt, "transaction conflict");
            }
            Err(err) => return Err(TxnError::Store(err)),
        }
    }
    Err(TxnError::Exhausted(attempts))
}

/// Create a balance document for `participant` unless one exists. Returns whether it was created.
pub fn open_account<S: Store + ?Sized>(
    store: &S,
    participant: &str,
    balance: u64,
) -> Result<bool, StoreError> {
    let key = Key::Balance(participant.to_string());
    let result = transaction(store, 3, |txn| {
        if txn.get(&key)?.is_some() {
            return Ok(false);
        }
        txn.put(key.clone(), Value::Balance(balance));
        Ok::<_, StoreError>(true)
    });
    match result {
        Ok(created) => Ok(created),
        Err(TxnError::Aborted(err)) | Err(TxnError::Store(err)) => Err(err),
        Err(TxnError::Exhausted(_)) => Err(StoreError::Conflict(key)),
    }
}

pub fn read_balance<S: Store + ?Sized>(store: &S, participant: &str) -> Result<Option<u64>, StoreError> {
    let key = Key::Balance(participant.to_string());
    match store.read(&key)? {
        Some(Document {
            value: Value::Balance(balance),
            ..
        }) => Ok(Some(balance)),
        Some(_) => Err(StoreError::UnexpectedValue(key)),
        None => Ok(None),
    }
}

pub fn read_round<S: Store + ?Sized>(store: &S, game: GameKind) -> Result<Option<(Version, RoundRecord)>, StoreError> {
    let key = Key::Round(game);
    match store.read(&key)? {
        Some(Document {
            version,
            value: Value::Round(record),
        }) => Ok(Some((version, record))),
        Some(_) => Err(StoreError::UnexpectedValue(key)),
        None => Ok(None),
    }
}

pub fn read_treasury<S: Store + ?Sized>(store: &S) -> Result<Treasury, StoreError> {
    match store.read(&Key::Treasury)? {
        Some(Document {
            value: Value::Treasury(treasury),
            ..
        }) => Ok(treasury),
        Some(_) => Err(StoreError::UnexpectedValue(Key::Treasury)),
        None => Ok(Treasury::default()),
    }
}

/// Number of profit log entries, found by probing versions without decoding.
pub fn profit_log_len<S: Store + ?Sized>(store: &S) -> Result<u64, StoreError> {
    let present = |position: u64| -> Result<bool, StoreError> {
        Ok(store.version(&Key::ProfitLog(position))?.is_some())
    };
    if !present(0)? {
        return Ok(0);
    }
    // Gallop to a missing position, then bisect the boundary.
    let mut low = 0u64;
    let mut high = 1u64;
    while present(high)? {
        low = high;
        high = high
            .checked_mul(2)
            .ok_or_else(|| StoreError::Overflow("profit log length".to_string()))?;
    }
    while high - low > 1 {
        let mid = low + (high - low) / 2;
        if present(mid)? {
            low = mid;
        } else {
            high = mid;
        }
    }
    Ok(high)
}

/// Read the profit log from position `from` until the first gap.
pub fn read_profit_log<S: Store + ?Sized>(
    store: &S,
    from: u64,
    limit: usize,
) -> Result<Vec<ProfitLogEntry>, StoreError> {
    let mut entries = Vec::new();
    let mut position = from;
    while entries.len() < limit {
        let key = Key::ProfitLog(position);
        match store.read(&key)? {
            Some(Document {
                value: Value::ProfitLog(entry),
                ..
            }) => entries.push(entry),
            Some(_) => return Err(StoreError::UnexpectedValue(key)),
            None => break,
        }
        position += 1;
    }
    Ok(entries)
}

fn apply_delta(participant: &str, current: u64, delta: i64) -> Result<u64, StoreError> {
    if delta >= 0 {
        current
            .checked_add(delta as u64)
            .ok_or_else(|| StoreError::Overflow(participant.to_string()))
    } else {
        let requested = delta.unsigned_abs();
        current
            .checked_sub(requested)
            .ok_or_else(|| StoreError::InsufficientBalance {
                participant: participant.to_string(),
                available: current,
                requested,
            })
    }
}

struct Row {
    version: Version,
    bytes: Bytes,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<Key, Row>,
    sequence: Version,
    profit_len: u64,
    watchers: HashMap<Key, watch::Sender<Option<Document>>>,
}

impl Inner {
    fn decode(&self, key: &Key) -> Result<Option<Document>, StoreError> {
        let Some(row) = self.rows.get(key) else {
            return Ok(None);
        };
        let value = Value::decode(row.bytes.as_ref()).map_err(|source| StoreError::Decode {
            key: key.clone(),
            source,
        })?;
        Ok(Some(Document {
            version: row.version,
            value,
        }))
    }

    /// Current value of `key` as seen by a commit that already staged `staged`.
    fn staged_value(
        &self,
        staged: &BTreeMap<Key, Value>,
        key: &Key,
    ) -> Result<Option<Value>, StoreError> {
        if let Some(value) = staged.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(self.decode(key)?.map(|document| document.value))
    }

    fn stage(&self, mutations: &[Mutation]) -> Result<(BTreeMap<Key, Value>, u64), StoreError> {
        let mut staged = BTreeMap::new();
        let mut appended = 0u64;
        for mutation in mutations {
            match mutation {
                Mutation::Put(key, value) => {
                    staged.insert(key.clone(), value.clone());
                }
                Mutation::AdjustBalance { participant, delta } => {
                    let key = Key::Balance(participant.clone());
                    let current = match self.staged_value(&staged, &key)? {
                        Some(Value::Balance(balance)) => balance,
                        Some(_) => return Err(StoreError::UnexpectedValue(key)),
                        None => return Err(StoreError::Missing(key)),
                    };
                    let next = apply_delta(participant, current, *delta)?;
                    staged.insert(key, Value::Balance(next));
                }
                Mutation::CreditTreasury(amount) => {
                    let current = match self.staged_value(&staged, &Key::Treasury)? {
                        Some(Value::Treasury(treasury)) => treasury,
                        Some(_) => return Err(StoreError::UnexpectedValue(Key::Treasury)),
                        None => Treasury::default(),
                    };
                    let balance = current
                        .balance
                        .checked_add(*amount)
                        .ok_or_else(|| StoreError::Overflow("treasury".to_string()))?;
                    staged.insert(Key::Treasury, Value::Treasury(Treasury { balance }));
                }
                Mutation::AppendProfit(entry) => {
                    let key = Key::ProfitLog(self.profit_len + appended);
                    appended += 1;
                    staged.insert(key, Value::ProfitLog(entry.clone()));
                }
            }
        }
        Ok((staged, appended))
    }
}

/// In-process [Store] and [Balances] shared by all local actors.
#[derive(Default)]
pub struct Memory {
    inner: Mutex<Inner>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("state lock poisoned".to_string()))
    }

    /// Overwrite a document with bytes that do not decode.
    #[cfg(any(test, feature = "mocks"))]
    pub fn corrupt(&self, key: &Key) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.sequence += 1;
        let version = inner.sequence;
        inner.rows.insert(
            key.clone(),
            Row {
                version,
                bytes: Bytes::from_static(&[0xff, 0xff, 0xff]),
            },
        );
        Ok(())
    }

    /// Drop a document outright.
    #[cfg(any(test, feature = "mocks"))]
    pub fn remove(&self, key: &Key) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.rows.remove(key);
        if let Some(watcher) = inner.watchers.get(key) {
            watcher.send_replace(None);
        }
        Ok(())
    }
}

impl Store for Memory {
    fn read(&self, key: &Key) -> Result<Option<Document>, StoreError> {
        self.lock()?.decode(key)
    }

    fn version(&self, key: &Key) -> Result<Option<Version>, StoreError> {
        Ok(self.lock()?.rows.get(key).map(|row| row.version))
    }

    fn subscribe(&self, key: &Key) -> Result<watch::Receiver<Option<Document>>, StoreError> {
        let mut inner = self.lock()?;
        if let Some(watcher) = inner.watchers.get(key) {
            return Ok(watcher.subscribe());
        }
        // An unreadable document starts the channel empty rather than failing the subscriber.
        let current = inner.decode(key).unwrap_or(None);
        let (sender, receiver) = watch::channel(current);
        inner.watchers.insert(key.clone(), sender);
        Ok(receiver)
    }

    fn commit(&self, reads: &ReadSet, mutations: &[Mutation]) -> Result<Version, StoreError> {
        let mut inner = self.lock()?;
        for (key, expected) in reads {
            let current = inner.rows.get(key).map(|row| row.version);
            if current != *expected {
                return Err(StoreError::Conflict(key.clone()));
            }
        }

        let (staged, appended) = inner.stage(mutations)?;

        inner.sequence += 1;
        let version = inner.sequence;
        inner.profit_len += appended;
        let Inner { rows, watchers, .. } = &mut *inner;
        for (key, value) in staged {
            let bytes = value.encode().freeze();
            rows.insert(key.clone(), Row { version, bytes });
            if let Some(watcher) = watchers.get(&key) {
                watcher.send_replace(Some(Document { version, value }));
            }
        }
        Ok(version)
    }
}

impl Balances for Memory {
    fn atomic_adjust(&self, participant: &str, delta: i64) -> Result<u64, StoreError> {
        let key = Key::Balance(participant.to_string());
        let mutation = Mutation::AdjustBalance {
            participant: participant.to_string(),
            delta,
        };
        let mut inner = self.lock()?;
        let (staged, _) = inner.stage(std::slice::from_ref(&mutation))?;
        let Some(Value::Balance(balance)) = staged.get(&key).cloned() else {
            return Err(StoreError::UnexpectedValue(key));
        };
        inner.sequence += 1;
        let version = inner.sequence;
        let value = Value::Balance(balance);
        inner.rows.insert(
            key.clone(),
            Row {
                version,
                bytes: value.encode().freeze(),
            },
        );
        if let Some(watcher) = inner.watchers.get(&key) {
            watcher.send_replace(Some(Document { version, value }));
        }
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_types::RoundRecord;

    fn round_doc(game: GameKind, round_id: u64) -> Value {
        Value::Round(RoundRecord::fresh(game, round_id, 0, 1_000))
    }

    #[test]
    fn commit_rejects_stale_reads() {
        let store = Memory::new();
        let key = Key::Round(GameKind::Dice);

        let mut first = Txn::new(&store);
        assert!(first.get(&key).unwrap().is_none());
        first.put(key.clone(), round_doc(GameKind::Dice, 1));

        let mut second = Txn::new(&store);
        assert!(second.get(&key).unwrap().is_none());
        second.put(key.clone(), round_doc(GameKind::Dice, 1));

        let (reads, mutations) = first.into_parts();
        store.commit(&reads, &mutations).unwrap();

        let (reads, mutations) = second.into_parts();
        assert!(matches!(
            store.commit(&reads, &mutations),
            Err(StoreError::Conflict(k)) if k == key
        ));
    }

    #[test]
    fn failed_mutation_applies_nothing() {
        let store = Memory::new();
        open_account(&store, "alice", 100).unwrap();

        let mut txn = Txn::new(&store);
        txn.adjust_balance("alice", 50);
        txn.credit_treasury(10);
        txn.adjust_balance("ghost", 5);
        let (reads, mutations) = txn.into_parts();
        assert!(matches!(
            store.commit(&reads, &mutations),
            Err(StoreError::Missing(Key::Balance(p))) if p == "ghost"
        ));

        assert_eq!(read_balance(&store, "alice").unwrap(), Some(100));
        assert_eq!(read_treasury(&store).unwrap().balance, 0);
    }

    #[test]
    fn atomic_adjust_refuses_overdraft() {
        let store = Memory::new();
        open_account(&store, "bob", 30).unwrap();

        assert_eq!(store.atomic_adjust("bob", -20).unwrap(), 10);
        assert!(matches!(
            store.atomic_adjust("bob", -11),
            Err(StoreError::InsufficientBalance {
                available: 10,
                requested: 11,
                ..
            })
        ));
        assert_eq!(store.atomic_adjust("bob", 5).unwrap(), 15);
        assert!(matches!(
            store.atomic_adjust("nobody", 5),
            Err(StoreError::Missing(_))
        ));
    }

    #[test]
    fn open_account_is_idempotent() {
        let store = Memory::new();
        assert!(open_account(&store, "carol", 500).unwrap());
        assert!(!open_account(&store, "carol", 900).unwrap());
        assert_eq!(read_balance(&store, "carol").unwrap(), Some(500));
    }

    #[test]
    fn profit_log_appends_in_order() {
        let store = Memory::new();
        assert_eq!(profit_log_len(&store).unwrap(), 0);
        for round_id in 1..=3 {
            let mut txn = Txn::new(&store);
            txn.append_profit(ProfitLogEntry {
                game: GameKind::Race,
                round_id,
                amount: 10,
                fee_bps: 1_000,
                total_wagered: 100,
                total_paid: 90,
                timestamp_ms: round_id,
            });
            let (reads, mutations) = txn.into_parts();
            store.commit(&reads, &mutations).unwrap();
        }
        let entries = read_profit_log(&store, 0, 10).unwrap();
        let ids: Vec<u64> = entries.iter().map(|entry| entry.round_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(read_profit_log(&store, 2, 10).unwrap().len(), 1);
        assert_eq!(profit_log_len(&store).unwrap(), 3);
    }

    #[test]
    fn profit_log_len_counts_long_logs() {
        let store = Memory::new();
        for round_id in 1..=37 {
            let mut txn = Txn::new(&store);
            txn.append_profit(ProfitLogEntry {
                game: GameKind::Ladder,
                round_id,
                amount: 5,
                fee_bps: 1_500,
                total_wagered: 50,
                total_paid: 45,
                timestamp_ms: round_id,
            });
            let (reads, mutations) = txn.into_parts();
            store.commit(&reads, &mutations).unwrap();
            assert_eq!(profit_log_len(&store).unwrap(), round_id);
        }
    }

    #[test]
    fn transaction_retries_after_conflict() {
        let store = Memory::new();
        let key = Key::RoundCounter(GameKind::Crash);
        let mut attempts = 0;
        let result = transaction(&store, 3, |txn| {
            attempts += 1;
            let current = txn.round_counter(GameKind::Crash)?;
            if attempts == 1 {
                // Another writer lands between our read and our commit.
                store.commit(&ReadSet::new(), &[Mutation::Put(key.clone(), Value::RoundCounter(5))])?;
            }
            txn.put(key.clone(), Value::RoundCounter(current + 1));
            Ok::<_, StoreError>(current + 1)
        });
        assert_eq!(result.unwrap(), 6);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn transaction_abort_writes_nothing() {
        let store = Memory::new();
        let result: Result<(), TxnError<&str>> = transaction(&store, 3, |txn| {
            txn.credit_treasury(99);
            Err("precondition")
        });
        assert!(matches!(result, Err(TxnError::Aborted("precondition"))));
        assert_eq!(read_treasury(&store).unwrap().balance, 0);
    }

    #[test]
    fn corrupt_documents_surface_decode_errors() {
        let store = Memory::new();
        store.corrupt(&Key::Round(GameKind::Ladder)).unwrap();
        assert!(matches!(
            read_round(&store, GameKind::Ladder),
            Err(StoreError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn subscribers_see_committed_documents() {
        let store = Memory::new();
        let key = Key::Round(GameKind::ColorWheel);
        let mut updates = store.subscribe(&key).unwrap();
        assert!(updates.borrow().is_none());

        store
            .commit(&ReadSet::new(), &[Mutation::Put(key.clone(), round_doc(GameKind::ColorWheel, 4))])
            .unwrap();
        updates.changed().await.unwrap();
        let document = updates.borrow_and_update().clone().unwrap();
        assert_eq!(document.value, round_doc(GameKind::ColorWheel, 4));
    }
}
