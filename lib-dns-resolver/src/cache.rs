//! A TTL-aware cache of positive answers, shared between the server
//! tasks and a background sweeper, with a binary on-disk snapshot.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use dns_types::protocol::types::*;

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

/// How long `shutdown` waits for the sweeper to finish its current
/// pass.
const SWEEPER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A `(domain, record type)`-keyed cache of record sets, shared
/// between threads.  Invoking `clone` gives a new handle to the same
/// underlying cache.
///
/// An entry is fresh while strictly less time than the smallest TTL
/// in its record set has passed since insertion; once any record
/// would have expired the whole set is evicted, either lazily by
/// `get` or by the background sweeper.  Entries are never mutated in
/// place.
#[derive(Debug, Clone)]
pub struct SharedCache {
    cache: Arc<Mutex<Cache>>,
    path: PathBuf,
    sweeper_shutdown: Arc<Notify>,
    sweeper_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SharedCache {
    /// Make a new, empty, shared cache which persists to the given
    /// file.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        SharedCache {
            cache: Arc::new(Mutex::new(Cache::default())),
            path: path.as_ref().to_path_buf(),
            sweeper_shutdown: Arc::new(Notify::new()),
            sweeper_handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Get a record set from the cache, if it is still fresh.  A
    /// stale entry is evicted on the way and reported as a miss.
    ///
    /// The records are handed out without copying; the TTLs are as
    /// they were when the entry was inserted.
    pub fn get(&self, name: &DomainName, rtype: RecordType) -> Option<Arc<[ResourceRecord]>> {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .get(name, rtype, SystemTime::now())
    }

    /// Insert a record set.  If there is already an entry for this
    /// `(domain, record type)` this does nothing: the existing entry
    /// wins until it expires, which preserves the TTL clock of the
    /// first observation.  Empty record sets are never stored.
    pub fn put(&self, name: DomainName, rtype: RecordType, records: Vec<ResourceRecord>) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .put(name, rtype, records, SystemTime::now());
    }

    /// Load the cache from its file.  A missing file is created
    /// empty; an empty or unreadable file leaves the cache empty.
    pub async fn load(&self) {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                if bytes.is_empty() {
                    return;
                }
                match Snapshot::decode(&bytes) {
                    Ok(snapshot) => {
                        let entries = snapshot.entries.len();
                        self.cache
                            .lock()
                            .expect(MUTEX_POISON_MESSAGE)
                            .restore(snapshot);
                        tracing::info!(%entries, path = %self.path.display(), "loaded cache");
                    }
                    Err(error) => {
                        tracing::warn!(%error, path = %self.path.display(), "could not parse cache file, starting empty");
                    }
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                match tokio::fs::File::create(&self.path).await {
                    Ok(_) => {
                        tracing::info!(path = %self.path.display(), "created new cache file");
                    }
                    Err(error) => {
                        tracing::warn!(?error, path = %self.path.display(), "could not create cache file");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(?error, path = %self.path.display(), "could not read cache file, starting empty");
            }
        }
    }

    /// Write the whole cache to its file.  Errors are logged and
    /// swallowed so a failed persist cannot block shutdown.
    pub async fn persist(&self) {
        let snapshot = self.cache.lock().expect(MUTEX_POISON_MESSAGE).snapshot();
        let entries = snapshot.entries.len();

        match snapshot.encode() {
            Ok(bytes) => match tokio::fs::write(&self.path, bytes).await {
                Ok(()) => tracing::info!(%entries, path = %self.path.display(), "persisted cache"),
                Err(error) => {
                    tracing::warn!(?error, path = %self.path.display(), "could not write cache file");
                }
            },
            Err(error) => tracing::warn!(%error, "could not serialise cache"),
        }
    }

    /// Start the background sweeper, which evicts expired entries
    /// every `period`.
    pub fn start_sweeper(&self, period: Duration) {
        let cache = Arc::clone(&self.cache);
        let shutdown = Arc::clone(&self.sweeper_shutdown);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = sleep(period) => sweep(&cache),
                    () = shutdown.notified() => break,
                }
            }
        });

        *self.sweeper_handle.lock().expect(MUTEX_POISON_MESSAGE) = Some(handle);
    }

    /// Stop the sweeper, joining it with a short timeout, and persist
    /// the cache.
    pub async fn shutdown(&self) {
        self.sweeper_shutdown.notify_one();

        let handle = self
            .sweeper_handle
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .take();
        if let Some(handle) = handle {
            if timeout(SWEEPER_JOIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("sweeper did not stop promptly");
            }
        }

        self.persist().await;
    }
}

/// One pass of the sweeper.  The domain and type lists are
/// snapshotted up front, and the lock is reacquired for each eviction
/// so readers are not starved during a large pass.
fn sweep(cache: &Mutex<Cache>) {
    let domains = cache.lock().expect(MUTEX_POISON_MESSAGE).domains();
    let mut evicted = 0;

    for name in domains {
        let rtypes = cache.lock().expect(MUTEX_POISON_MESSAGE).rtypes(&name);
        for rtype in rtypes {
            if cache
                .lock()
                .expect(MUTEX_POISON_MESSAGE)
                .evict_if_stale(&name, rtype, SystemTime::now())
            {
                evicted += 1;
            }
        }
    }

    if evicted > 0 {
        tracing::info!(%evicted, "evicted expired cache entries");
    }
}

/// The cache map itself: domain, then record type, then the entry.
/// The two-level shape lets the sweeper walk per-domain cheaply and
/// lets a domain collapse when its last type is evicted.
#[derive(Debug, Clone, Default)]
struct Cache {
    entries: HashMap<DomainName, HashMap<RecordType, CacheEntry>>,
}

/// A cached record set.  The records are immutable once inserted, so
/// they can be handed to readers without copying.
///
/// INVARIANT: `records` is never empty.
#[derive(Debug, Clone)]
struct CacheEntry {
    inserted_at: SystemTime,
    records: Arc<[ResourceRecord]>,
}

impl CacheEntry {
    fn is_fresh(&self, now: SystemTime) -> bool {
        // a clock that has gone backwards reads as no time elapsed
        let elapsed = now
            .duration_since(self.inserted_at)
            .unwrap_or(Duration::ZERO);

        self.records
            .iter()
            .map(|rr| u64::from(rr.ttl))
            .min()
            .is_some_and(|min_ttl| elapsed.as_secs() < min_ttl)
    }
}

impl Cache {
    fn get(
        &mut self,
        name: &DomainName,
        rtype: RecordType,
        now: SystemTime,
    ) -> Option<Arc<[ResourceRecord]>> {
        let entry = self.entries.get(name)?.get(&rtype)?;
        if entry.is_fresh(now) {
            Some(Arc::clone(&entry.records))
        } else {
            self.evict(name, rtype);
            None
        }
    }

    fn put(
        &mut self,
        name: DomainName,
        rtype: RecordType,
        records: Vec<ResourceRecord>,
        now: SystemTime,
    ) {
        if records.is_empty() {
            return;
        }

        self.entries
            .entry(name)
            .or_default()
            .entry(rtype)
            .or_insert_with(|| CacheEntry {
                inserted_at: now,
                records: records.into(),
            });
    }

    fn evict(&mut self, name: &DomainName, rtype: RecordType) {
        if let Some(by_rtype) = self.entries.get_mut(name) {
            by_rtype.remove(&rtype);
            if by_rtype.is_empty() {
                self.entries.remove(name);
            }
        }
    }

    fn evict_if_stale(&mut self, name: &DomainName, rtype: RecordType, now: SystemTime) -> bool {
        let stale = self
            .entries
            .get(name)
            .and_then(|by_rtype| by_rtype.get(&rtype))
            .is_some_and(|entry| !entry.is_fresh(now));

        if stale {
            self.evict(name, rtype);
        }
        stale
    }

    fn domains(&self) -> Vec<DomainName> {
        self.entries.keys().cloned().collect()
    }

    fn rtypes(&self, name: &DomainName) -> Vec<RecordType> {
        self.entries
            .get(name)
            .map(|by_rtype| by_rtype.keys().copied().collect())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Snapshot {
        let mut entries = Vec::new();
        for (name, by_rtype) in &self.entries {
            for (rtype, entry) in by_rtype {
                entries.push(SnapshotEntry {
                    name: name.clone(),
                    rtype: *rtype,
                    inserted_unix_secs: entry
                        .inserted_at
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or(Duration::ZERO)
                        .as_secs(),
                    records: entry.records.to_vec(),
                });
            }
        }

        Snapshot {
            version: SNAPSHOT_VERSION,
            entries,
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        for entry in snapshot.entries {
            if entry.records.is_empty() {
                continue;
            }

            let inserted_at = UNIX_EPOCH + Duration::from_secs(entry.inserted_unix_secs);
            self.entries
                .entry(entry.name)
                .or_default()
                .insert(
                    entry.rtype,
                    CacheEntry {
                        inserted_at,
                        records: entry.records.into(),
                    },
                );
        }
    }
}

const SNAPSHOT_VERSION: u32 = 1;

/// The on-disk form of the cache: a flat, version-tagged list of
/// entries.  Timestamps are absolute (unix seconds), so freshness is
/// always judged against the current clock at read, not at load.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    name: DomainName,
    rtype: RecordType,
    inserted_unix_secs: u64,
    records: Vec<ResourceRecord>,
}

impl Snapshot {
    fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        let snapshot: Snapshot = bincode::deserialize(bytes)?;
        if snapshot.version == SNAPSHOT_VERSION {
            Ok(snapshot)
        } else {
            Err(Box::new(bincode::ErrorKind::Custom(format!(
                "unsupported cache file version {}",
                snapshot.version
            ))))
        }
    }
}
