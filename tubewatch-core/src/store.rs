//! Durable channel state: one JSON snapshot rewritten atomically on every
//! mutation.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::de::{DeserializeOwned, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::channel::{Health, WatchedChannel};
use crate::error::StoreError;

pub const SNAPSHOT_FILE: &str = "channels.json";
pub const LEGACY_FILE: &str = "channels_watching.json";
pub const LOCK_FILE: &str = "channels.lock";

/// JSON object whose key order is kept as read and as written.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, V)> = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    if entries.iter().all(|(existing, _)| existing != &key) {
                        entries.push((key, value));
                    }
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordRef<'a> {
    alias: Option<&'a str>,
    last_notified_item_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_notified_published_at: Option<DateTime<Utc>>,
    last_polled_at: Option<DateTime<Utc>>,
    health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<&'a str>,
    added_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    last_notified_item_id: Option<String>,
    #[serde(default)]
    last_notified_published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_polled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    health: Health,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    added_at: Option<DateTime<Utc>>,
}

fn encode_snapshot(channels: &[WatchedChannel]) -> Result<Vec<u8>, StoreError> {
    let map = OrderedMap(
        channels
            .iter()
            .map(|c| {
                (
                    c.id.clone(),
                    RecordRef {
                        alias: c.alias.as_deref(),
                        last_notified_item_id: c.last_notified_item_id.as_deref(),
                        last_notified_published_at: c.last_notified_published_at,
                        last_polled_at: c.last_polled_at,
                        health: c.health,
                        last_error: c.last_error.as_deref(),
                        added_at: c.added_at,
                    },
                )
            })
            .collect(),
    );
    Ok(serde_json::to_vec_pretty(&map)?)
}

/// Also reports whether any record predates `addedAt` and was stamped now.
fn channels_from_map(map: OrderedMap<Record>) -> (Vec<WatchedChannel>, bool) {
    let now = Utc::now();
    let mut stamped = false;
    let channels = map
        .0
        .into_iter()
        .map(|(id, r)| WatchedChannel {
            id,
            alias: r.alias,
            last_notified_item_id: r.last_notified_item_id,
            last_notified_published_at: r.last_notified_published_at,
            last_polled_at: r.last_polled_at,
            health: r.health,
            last_error: r.last_error,
            added_at: r.added_at.unwrap_or_else(|| {
                stamped = true;
                now
            }),
        })
        .collect();
    (channels, stamped)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.display().to_string();
    move |source| StoreError::Io { path, source }
}

/// Writes `bytes` next to `path`, syncs, then renames over `path`. A reader
/// sees either the old file or the new one.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_error(parent))?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await.map_err(io_error(&tmp))?;
    file.write_all(bytes).await.map_err(io_error(&tmp))?;
    file.sync_all().await.map_err(io_error(&tmp))?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(io_error(path))?;
    Ok(())
}

/// Reads a JSON document, falling back to a complete leftover temp file when
/// the main file cannot be parsed. `Ok(None)` means neither file exists.
pub(crate) async fn read_json_with_tmp_fallback<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreError> {
    let main_err = match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
            Ok(v) => return Ok(Some(v)),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to parse JSON, trying tmp fallback");
                Some(e)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(source) => return Err(io_error(path)(source)),
    };

    let tmp = path.with_extension("json.tmp");
    if let Ok(tmp_bytes) = tokio::fs::read(&tmp).await {
        if let Ok(v) = serde_json::from_slice::<T>(&tmp_bytes) {
            info!(path = %tmp.display(), "recovered state from tmp file");
            return Ok(Some(v));
        }
    }

    match main_err {
        Some(source) => Err(StoreError::Corrupt {
            path: path.display().to_string(),
            source,
        }),
        None => Ok(None),
    }
}

/// Field updates produced by one poll of one channel, persisted as a unit.
#[derive(Debug, Clone, Default)]
pub struct PollRecord {
    pub watermark: Option<(String, Option<DateTime<Utc>>)>,
    pub health: Option<Health>,
    pub polled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// When set, the record only applies to the channel instance added at
    /// this time; results for a removed and re-added channel are dropped.
    pub added_at: Option<DateTime<Utc>>,
}

/// How a store opened from disk may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Holds `channels.lock` until the last clone of the store is dropped.
    /// Only one process can hold it.
    Exclusive,
    /// Loads the current snapshot without locking; every mutation fails.
    ReadOnly,
}

#[derive(Debug, Clone, Copy)]
enum OnPersistFailure {
    /// Restore the previous in-memory state; the caller sees no change.
    Rollback,
    /// Keep the change in memory and retry on the next `flush`.
    Defer,
}

#[derive(Debug, Default)]
struct WriterState {
    dirty: bool,
}

/// Shared handle to the watched-channel set. Mutations are serialized and each
/// one rewrites the snapshot file; reads return point-in-time copies.
#[derive(Debug, Clone)]
pub struct ChannelStore {
    channels: Arc<RwLock<Vec<WatchedChannel>>>,
    writer: Arc<Mutex<WriterState>>,
    path: Option<PathBuf>,
    access: Access,
    _lock: Option<Arc<File>>,
}

impl ChannelStore {
    pub fn in_memory() -> Self {
        Self {
            channels: Arc::new(RwLock::new(Vec::new())),
            writer: Arc::new(Mutex::new(WriterState::default())),
            path: None,
            access: Access::Exclusive,
            _lock: None,
        }
    }

    /// Opens `dir` for exclusive use. Fails with `StoreError::Locked` while
    /// another process has it open.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(dir, Access::Exclusive).await
    }

    pub async fn open_read_only(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(dir, Access::ReadOnly).await
    }

    /// Loads `channels.json` from `dir`. When no snapshot exists yet, a legacy
    /// `channels_watching.json` list is absorbed with empty watermarks.
    pub async fn open_with(dir: impl AsRef<Path>, access: Access) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        let path = dir.join(SNAPSHOT_FILE);
        let lock = match access {
            Access::Exclusive => Some(Arc::new(acquire_lock(dir)?)),
            Access::ReadOnly => None,
        };

        let (channels, upgraded) =
            match read_json_with_tmp_fallback::<OrderedMap<Record>>(&path).await? {
                Some(map) => {
                    let (channels, stamped) = channels_from_map(map);
                    debug!(count = channels.len(), path = %path.display(), "loaded channel snapshot");
                    (channels, stamped)
                }
                None => {
                    let legacy = read_legacy(&dir.join(LEGACY_FILE)).await;
                    let migrated = !legacy.is_empty();
                    if migrated {
                        info!(count = legacy.len(), "migrating legacy channel list");
                    }
                    (legacy, migrated)
                }
            };

        let store = Self {
            channels: Arc::new(RwLock::new(channels)),
            writer: Arc::new(Mutex::new(WriterState { dirty: upgraded })),
            path: Some(path),
            access,
            _lock: lock,
        };
        if upgraded && access == Access::Exclusive {
            if let Err(e) = store.flush().await {
                warn!(error = %e, "failed to persist upgraded channel snapshot");
            }
        }
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Point-in-time copy in insertion order.
    pub async fn list(&self) -> Vec<WatchedChannel> {
        self.channels.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<WatchedChannel> {
        self.channels.read().await.iter().find(|c| c.id == id).cloned()
    }

    /// Looks a channel up by identifier first, then by alias.
    pub async fn find(&self, input: &str) -> Option<WatchedChannel> {
        let channels = self.channels.read().await;
        channels
            .iter()
            .find(|c| c.id == input)
            .or_else(|| channels.iter().find(|c| c.matches(input)))
            .cloned()
    }

    pub async fn is_dirty(&self) -> bool {
        self.writer.lock().await.dirty
    }

    pub async fn add(&self, id: &str, alias: Option<String>) -> Result<WatchedChannel, StoreError> {
        self.mutate(OnPersistFailure::Rollback, |channels| {
            if channels.iter().any(|c| c.id == id) {
                return Err(StoreError::AlreadyExists(id.to_owned()));
            }
            let channel = WatchedChannel::new(id, alias);
            channels.push(channel.clone());
            Ok(channel)
        })
        .await
    }

    pub async fn remove(&self, id: &str) -> Result<WatchedChannel, StoreError> {
        self.mutate(OnPersistFailure::Rollback, |channels| {
            let pos = channels
                .iter()
                .position(|c| c.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
            Ok(channels.remove(pos))
        })
        .await
    }

    /// Overwrites the alias; identifier and watermark are untouched.
    pub async fn rename(&self, id: &str, alias: Option<String>) -> Result<(), StoreError> {
        self.mutate(OnPersistFailure::Rollback, |channels| {
            let channel = find_mut(channels, id)?;
            channel.alias = alias;
            Ok(())
        })
        .await
    }

    pub async fn set_health(&self, id: &str, health: Health) -> Result<(), StoreError> {
        self.mutate(OnPersistFailure::Rollback, |channels| {
            let channel = find_mut(channels, id)?;
            channel.health = health;
            if health == Health::Healthy {
                channel.last_error = None;
            }
            Ok(())
        })
        .await
    }

    pub async fn update_watermark(
        &self,
        id: &str,
        item_id: &str,
        published_at: Option<DateTime<Utc>>,
        polled_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.record_poll(
            id,
            PollRecord {
                watermark: Some((item_id.to_owned(), published_at)),
                health: None,
                polled_at: Some(polled_at),
                error: None,
                added_at: None,
            },
        )
        .await
    }

    /// Applies one channel's poll results in a single write. Returns `false`
    /// without writing when the channel was removed in the meantime. On a
    /// failed write the update stays in memory and is retried by `flush`.
    pub async fn record_poll(&self, id: &str, record: PollRecord) -> Result<bool, StoreError> {
        self.mutate(OnPersistFailure::Defer, |channels| {
            let Some(channel) = channels.iter_mut().find(|c| c.id == id) else {
                return Ok(None);
            };
            if record.added_at.is_some_and(|at| at != channel.added_at) {
                debug!(channel = %id, "dropping poll result for an earlier instance of the channel");
                return Ok(None);
            }
            if let Some((item_id, published_at)) = record.watermark {
                channel.last_notified_item_id = Some(item_id);
                channel.last_notified_published_at = published_at;
            }
            if let Some(health) = record.health {
                channel.health = health;
            }
            if record.polled_at.is_some() {
                channel.last_polled_at = record.polled_at;
            }
            channel.last_error = record.error;
            Ok(Some(()))
        })
        .await
        .map(|applied| applied.is_some())
    }

    /// Persists the current state if an earlier write failed.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        if !writer.dirty || self.access == Access::ReadOnly {
            return Ok(());
        }
        let snapshot = self.channels.read().await.clone();
        self.persist(&snapshot).await?;
        writer.dirty = false;
        Ok(())
    }

    async fn mutate<R, F>(&self, on_failure: OnPersistFailure, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Vec<WatchedChannel>) -> Result<R, StoreError>,
        R: MaybeUnchanged,
    {
        if self.access == Access::ReadOnly {
            return Err(StoreError::ReadOnly);
        }
        let mut writer = self.writer.lock().await;
        let (result, previous, snapshot) = {
            let mut channels = self.channels.write().await;
            let previous = channels.clone();
            let result = f(&mut *channels)?;
            if result.is_unchanged() {
                return Ok(result);
            }
            (result, previous, channels.clone())
        };

        match self.persist(&snapshot).await {
            Ok(()) => {
                writer.dirty = false;
                Ok(result)
            }
            Err(err) => {
                match on_failure {
                    OnPersistFailure::Rollback => {
                        *self.channels.write().await = previous;
                    }
                    OnPersistFailure::Defer => writer.dirty = true,
                }
                Err(err)
            }
        }
    }

    async fn persist(&self, snapshot: &[WatchedChannel]) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            debug!("channel store is in-memory only; skipping persist");
            return Ok(());
        };
        let bytes = encode_snapshot(snapshot)?;
        write_atomic(path, &bytes).await
    }
}

fn acquire_lock(dir: &Path) -> Result<File, StoreError> {
    std::fs::create_dir_all(dir).map_err(io_error(dir))?;
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(io_error(&path))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            Err(StoreError::Locked(dir.display().to_string()))
        }
        Err(source) => Err(io_error(&path)(source)),
    }
}

fn find_mut<'a>(channels: &'a mut [WatchedChannel], id: &str) -> Result<&'a mut WatchedChannel, StoreError> {
    channels
        .iter_mut()
        .find(|c| c.id == id)
        .ok_or_else(|| StoreError::NotFound(id.to_owned()))
}

/// Lets a mutation report that it changed nothing, skipping the write.
trait MaybeUnchanged {
    fn is_unchanged(&self) -> bool {
        false
    }
}

impl MaybeUnchanged for () {}
impl MaybeUnchanged for WatchedChannel {}
impl<T> MaybeUnchanged for Option<T> {
    fn is_unchanged(&self) -> bool {
        self.is_none()
    }
}

/// Legacy layout: user input -> channel id, an empty id meaning the key is
/// already the identifier.
async fn read_legacy(path: &Path) -> Vec<WatchedChannel> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(_) => return Vec::new(),
    };
    let map: OrderedMap<String> = match serde_json::from_slice(&bytes) {
        Ok(map) => map,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "ignoring unreadable legacy channel list");
            return Vec::new();
        }
    };

    let mut channels: Vec<WatchedChannel> = Vec::with_capacity(map.0.len());
    for (input, mapped) in map.0 {
        let (id, alias) = if mapped.trim().is_empty() {
            (input, None)
        } else if mapped == input {
            (mapped, None)
        } else {
            (mapped, Some(input))
        };
        if channels.iter().all(|c| c.id != id) {
            channels.push(WatchedChannel::new(id, alias));
        }
    }
    channels
}
