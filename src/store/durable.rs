//! Directory-backed object store.

use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{BrokerError, Result};
use crate::store::log::{LogOp, ObjectLog};
use crate::store::memory::ObjectTable;
use crate::store::ObjectStore;
use crate::types::{ObjectInput, ObjectRef, TaggedObject, Version, WriteOutcome};

/// Durable store configuration.
#[derive(Clone, Debug)]
pub struct DurableStoreConfig {
    /// Base directory for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the log every N writes.
    pub sync_interval: u64,
}

impl Default for DurableStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./objects"),
            create_if_missing: true,
            sync_interval: ObjectLog::DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"TCS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Object store persisted as an append-only log.
///
/// Every write or delete is appended to `objects.log` before it is applied
/// to the in-memory table, so a write that returns `Ok` survives a restart
/// once synced and a write that returns `Err` leaves nothing behind.
/// Opening replays the log.
pub struct DurableStore {
    config: DurableStoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: ObjectLog,

    table: RwLock<ObjectTable>,

    published: AtomicU64,
}

impl DurableStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: DurableStoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(BrokerError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: DurableStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        let log = ObjectLog::open_with_sync_interval(
            config.path.join("objects.log"),
            config.sync_interval,
        )?;

        tracing::info!(path = %config.path.display(), "created object store");

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            table: RwLock::new(ObjectTable::default()),
            published: AtomicU64::new(0),
        })
    }

    /// Open an existing store and rebuild its objects from the log.
    pub fn open(config: DurableStoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        let log = ObjectLog::open_with_sync_interval(
            config.path.join("objects.log"),
            config.sync_interval,
        )?;

        let table = Self::rebuild_table(&log)?;
        let head = table.head();

        tracing::info!(
            path = %config.path.display(),
            objects = table.len(),
            version = head.0,
            "opened object store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            table: RwLock::new(table),
            published: AtomicU64::new(head.0),
        })
    }

    fn rebuild_table(log: &ObjectLog) -> Result<ObjectTable> {
        let mut table = ObjectTable::default();

        for entry in log.entries()? {
            if entry.version <= table.head() {
                return Err(BrokerError::Corruption(format!(
                    "log version {} does not follow {}",
                    entry.version,
                    table.head()
                )));
            }

            match &entry.op {
                LogOp::Put { .. } => {
                    if let Some(object) = entry.to_object()? {
                        table.put(object);
                    }
                }
                LogOp::Delete { owner, key } => {
                    table.remove(&ObjectRef::new(owner.clone(), key.clone()), entry.version);
                }
            }
        }

        Ok(table)
    }

    /// Flush pending log frames to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(BrokerError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(BrokerError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| BrokerError::Locked)?;

        Ok(lock_file)
    }
}

impl ObjectStore for DurableStore {
    fn write(&self, owner: &str, input: ObjectInput) -> Result<WriteOutcome> {
        let mut table = self.table.write();

        let version = table.head().next();
        let object = input.into_object(owner, version);
        self.log.append(version, &LogOp::put(&object)?)?;

        let created = table.put(object.clone()).is_none();
        self.published.store(version.0, Ordering::SeqCst);

        Ok(WriteOutcome { object, created })
    }

    fn delete(&self, owner: &str, key: &str) -> Result<Option<TaggedObject>> {
        let mut table = self.table.write();

        let object_ref = ObjectRef::new(owner, key);
        if !table.contains(&object_ref) {
            return Ok(None);
        }

        let version = table.head().next();
        self.log.append(version, &LogOp::delete(owner, key))?;

        let removed = table.remove(&object_ref, version).map(|mut object| {
            object.version = version;
            object
        });
        self.published.store(version.0, Ordering::SeqCst);

        Ok(removed)
    }

    fn get(&self, owner: &str, key: &str) -> Result<Option<TaggedObject>> {
        Ok(self.table.read().get(&ObjectRef::new(owner, key)).cloned())
    }

    fn query_by_tags(
        &self,
        tags: &BTreeSet<String>,
        ceiling: Version,
    ) -> Result<Vec<TaggedObject>> {
        Ok(self.table.read().query(tags, ceiling))
    }

    fn query_page(
        &self,
        tags: &BTreeSet<String>,
        ceiling: Version,
        after: Option<&ObjectRef>,
        limit: usize,
    ) -> Result<Vec<TaggedObject>> {
        Ok(self.table.read().query_page(tags, ceiling, after, limit))
    }

    fn current_version(&self) -> Version {
        Version(self.published.load(Ordering::SeqCst))
    }

    fn tags_visible_to(&self, viewer: Option<&str>) -> Result<BTreeSet<String>> {
        Ok(self.table.read().tags_visible_to(viewer))
    }
}

impl Drop for DurableStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
