//! ---
//! gw_section: "03-persistence-logging"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Priority-ordered store of undelivered messages backed by a flat file."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adagw_common::{is_valid_timestamp, CacheConfig, Clock, TimedMutex};
use adagw_msg::{to_plain_text, GatewayIdentity, Message, Priority, RecordDecoder, RecordEncoder};
use tracing::{debug, info, trace, warn};

use crate::{PersistenceError, Result};

/// Tunables for [`PriorityCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Backing file location.
    pub path: PathBuf,
    /// Entries required before a periodic store happens.
    pub min_items: usize,
    /// How long the queue must stay non-empty before a periodic store.
    pub min_saving_interval: Duration,
    /// Budget for every lock acquisition.
    pub lock_timeout: Duration,
}

impl CacheOptions {
    /// Options for a cache stored at `path` with default thresholds.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let defaults = CacheConfig::default();
        Self {
            path: path.into(),
            ..Self::from_config(&defaults)
        }
    }

    /// Options derived from the `[cache]` configuration section.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            path: config.permanent_cache_path.clone(),
            min_items: config.minimal_items_cached,
            min_saving_interval: config.minimal_saving_interval(),
            lock_timeout: config.lock_timeout,
        }
    }
}

/// Sort key: higher priority first, then older timestamp, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CacheKey {
    priority: Reverse<Priority>,
    timestamp: i64,
    seq: u64,
}

#[derive(Debug)]
struct CacheState {
    entries: BTreeMap<CacheKey, Message>,
    next_seq: u64,
    /// Start of the current non-empty period or time of the last store.
    last_store: Instant,
}

impl CacheState {
    fn insert(&mut self, msg: Message) {
        let key = CacheKey {
            priority: Reverse(msg.priority),
            timestamp: msg.timestamp,
            seq: self.next_seq,
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        self.entries.insert(key, msg);
    }

    fn take_first_valid(&mut self) -> Option<Message> {
        let key = self
            .entries
            .iter()
            .find(|(_, msg)| msg.valid)
            .map(|(key, _)| *key)?;
        self.entries.remove(&key)
    }
}

/// Durable at-least-once buffer of messages the server has not accepted yet.
///
/// Delivery order is priority descending, then timestamp ascending. The
/// `valid` flag is not part of the key: [`PriorityCache::drain_one`] scans for
/// the first sendable entry instead, so clock repair never re-sorts the map.
pub struct PriorityCache {
    state: TimedMutex<CacheState>,
    options: CacheOptions,
    template: Message,
    encoder: Option<Arc<dyn RecordEncoder>>,
}

impl PriorityCache {
    /// Empty cache; reloaded records inherit the identity of `identity`.
    pub fn new(options: CacheOptions, identity: &GatewayIdentity) -> Self {
        Self {
            state: TimedMutex::new(
                "priority-cache",
                CacheState {
                    entries: BTreeMap::new(),
                    next_seq: 0,
                    last_store: Instant::now(),
                },
            ),
            options,
            template: Message::from_identity(identity),
            encoder: None,
        }
    }

    /// Attach the record encoder; without one [`PriorityCache::persist`] is a no-op.
    pub fn with_encoder(mut self, encoder: Arc<dyn RecordEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.options.path
    }

    /// Insert `msg`. Returns `false` when the lock budget expired and the insert was skipped.
    pub fn enqueue(&self, msg: Message) -> bool {
        let Some(mut state) = self.state.lock_within(self.options.lock_timeout) else {
            warn!(euid = msg.device.euid, "cache busy, message not stored");
            return false;
        };
        if state.entries.is_empty() {
            state.last_store = Instant::now();
        }
        debug!(
            euid = msg.device.euid,
            priority = ?msg.priority,
            valid = msg.valid,
            "message stored in cache"
        );
        state.insert(msg);
        true
    }

    /// Remove and return the highest-ranked entry whose timestamp is valid.
    pub fn drain_one(&self) -> Option<Message> {
        self.state
            .lock_within(self.options.lock_timeout)?
            .take_first_valid()
    }

    /// One iteration of the drain loop under a single lock acquisition.
    ///
    /// A non-empty cache is stored if the periodic trigger is due and the
    /// first valid entry is returned. An empty cache restarts the store timer
    /// and removes the backing file.
    pub fn drain_tick(&self, budget: Duration) -> Option<Message> {
        let mut state = self.state.lock_within(budget)?;
        if state.entries.is_empty() {
            state.last_store = Instant::now();
            if let Err(err) = self.clear_backing_file() {
                warn!(error = %err, path = %self.options.path.display(), "failed to remove cache file");
            }
            return None;
        }
        if self.is_due(&state) {
            if let Err(err) = self.write_locked(&mut state) {
                warn!(error = %err, "periodic cache store failed");
            }
        }
        state.take_first_valid()
    }

    fn is_due(&self, state: &CacheState) -> bool {
        state.entries.len() >= self.options.min_items
            && state.last_store.elapsed() > self.options.min_saving_interval
    }

    /// Store the cache if it has been non-empty long enough and holds enough entries.
    pub fn persist_if_due(&self) -> Result<bool> {
        let mut state = self
            .state
            .lock_within(self.options.lock_timeout)
            .ok_or(PersistenceError::LockTimeout { operation: "persist" })?;
        if !self.is_due(&state) {
            return Ok(false);
        }
        self.write_locked(&mut state)?;
        Ok(true)
    }

    /// Rewrite the backing file with every entry. Returns how many records were written.
    pub fn persist(&self) -> Result<usize> {
        let mut state = self
            .state
            .lock_within(self.options.lock_timeout)
            .ok_or(PersistenceError::LockTimeout { operation: "persist" })?;
        self.write_locked(&mut state)
    }

    fn write_locked(&self, state: &mut CacheState) -> Result<usize> {
        let Some(encoder) = self.encoder.as_deref() else {
            info!("no record encoder available, cache not stored");
            return Ok(0);
        };

        let path = &self.options.path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let staging = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            for msg in state.entries.values() {
                writer.write_all(encoder.encode_record(msg).as_bytes())?;
            }
            writer.flush()?;
        }
        fs::rename(&staging, path)?;

        state.last_store = Instant::now();
        let count = state.entries.len();
        info!(records = count, path = %path.display(), "cache stored");
        Ok(count)
    }

    /// Re-insert every record of the backing file. Absence of the file is not an error.
    ///
    /// Records whose own timestamp is valid become sendable. Otherwise, while
    /// the clock is still invalid, `offset` is set relative to now so a later
    /// repair can reconstruct the time. A record with an invalid timestamp read
    /// under a valid clock has nothing to anchor to and stays unsendable.
    pub fn reload(&self, clock: &dyn Clock) -> Result<usize> {
        let path = &self.options.path;
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no cache file to reload");
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };

        let mut state = self
            .state
            .lock_within(self.options.lock_timeout)
            .ok_or(PersistenceError::LockTimeout { operation: "reload" })?;
        if state.entries.is_empty() {
            state.last_store = Instant::now();
        }

        let mut restored = 0usize;
        for record in RecordDecoder::new(BufReader::new(file), self.template.clone()) {
            let mut msg = match record {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "skipping malformed cache record");
                    continue;
                }
            };
            if is_valid_timestamp(msg.timestamp) {
                msg.valid = true;
                msg.offset = 0;
            } else if clock.is_valid() {
                warn!(
                    euid = msg.device.euid,
                    timestamp = msg.timestamp,
                    "cached message has no recoverable timestamp"
                );
            } else {
                msg.valid = false;
                msg.offset = msg.timestamp - clock.unix_now();
            }
            trace!(message = %to_plain_text(&msg), "restored cached message");
            state.insert(msg);
            restored += 1;
        }
        info!(records = restored, path = %path.display(), "cache reloaded");
        Ok(restored)
    }

    /// Stamp every invalid entry with `now - blackout + offset` and mark it valid.
    ///
    /// Keys are left untouched. Returns the number of repaired entries.
    pub fn repair(&self, now: i64, blackout_secs: i64) -> Result<usize> {
        let mut state = self
            .state
            .lock_within(self.options.lock_timeout)
            .ok_or(PersistenceError::LockTimeout { operation: "repair" })?;
        let mut repaired = 0usize;
        for msg in state.entries.values_mut().filter(|msg| !msg.valid) {
            msg.timestamp = now - blackout_secs + msg.offset;
            msg.offset = 0;
            msg.valid = true;
            repaired += 1;
        }
        info!(repaired, blackout_secs, "cached timestamps repaired");
        Ok(repaired)
    }

    /// Remove the backing file; a missing file is fine.
    pub fn clear_backing_file(&self) -> Result<()> {
        match fs::remove_file(&self.options.path) {
            Ok(()) => {
                debug!(path = %self.options.path.display(), "cache file removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Clone of every entry in drain order, `None` when the lock budget expired.
    pub fn snapshot(&self) -> Option<Vec<Message>> {
        let state = self.state.lock_within(self.options.lock_timeout)?;
        Some(state.entries.values().cloned().collect())
    }

    /// Number of entries; `0` when the lock budget expired.
    pub fn len(&self) -> usize {
        self.state
            .lock_within(self.options.lock_timeout)
            .map_or(0, |state| state.entries.len())
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PriorityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityCache")
            .field("path", &self.options.path)
            .field("has_encoder", &self.encoder.is_some())
            .finish_non_exhaustive()
    }
}
