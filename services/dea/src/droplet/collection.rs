//! Node-wide instance registry and its snapshot file.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dea_id::{DropletId, InstanceId};
use dea_messages::{HeartbeatMessage, InstanceState, StartRequest};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::instance::DropletInstance;
use super::properties::DropletInstanceProperties;

/// Errors from reading or writing the snapshot file.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How [`DropletCollection::for_each`] holds the collection lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalMode {
    /// Hold the read lock for the whole traversal.
    Read,
    /// Copy the instance set under a brief upgradable read, then visit
    /// without any collection lock held.
    Upgradable,
}

/// Instances of one droplet, keyed by instance id.
#[derive(Debug, Default)]
pub struct Droplet {
    instances: HashMap<InstanceId, Arc<DropletInstance>>,
}

impl Droplet {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> impl Iterator<Item = &Arc<DropletInstance>> {
        self.instances.values()
    }
}

/// The registry: droplet id → droplet → instance id → instance.
pub struct DropletCollection {
    droplets: RwLock<HashMap<DropletId, Droplet>>,
    snapshot_file: PathBuf,
    snapshot_scheduled: AtomicBool,
    /// Held from collecting a snapshot until its rename, so writes land in
    /// the order their contents were taken.
    snapshot_write: Mutex<()>,
}

impl DropletCollection {
    pub fn new(snapshot_file: impl Into<PathBuf>) -> Self {
        Self {
            droplets: RwLock::new(HashMap::new()),
            snapshot_file: snapshot_file.into(),
            snapshot_scheduled: AtomicBool::new(false),
            snapshot_write: Mutex::new(()),
        }
    }

    pub fn snapshot_file(&self) -> &Path {
        &self.snapshot_file
    }

    /// Create a STARTING instance for `request` and register it.
    pub fn create_instance(&self, request: &StartRequest) -> Arc<DropletInstance> {
        self.insert(DropletInstanceProperties::from_start_request(request))
    }

    /// Register an instance built from already prepared properties.
    pub fn insert(&self, props: DropletInstanceProperties) -> Arc<DropletInstance> {
        let instance = Arc::new(DropletInstance::new(props));
        self.add_instance(Arc::clone(&instance));
        instance
    }

    pub fn add_instance(&self, instance: Arc<DropletInstance>) {
        let mut droplets = self.droplets.write();
        droplets
            .entry(instance.droplet_id().clone())
            .or_default()
            .instances
            .insert(instance.instance_id(), instance);
    }

    /// Remove an instance, dropping its droplet once empty.
    pub fn remove_instance(&self, instance: &DropletInstance) -> bool {
        let mut droplets = self.droplets.write();
        let Some(droplet) = droplets.get_mut(instance.droplet_id()) else {
            return false;
        };
        let removed = droplet.instances.remove(&instance.instance_id()).is_some();
        if droplet.is_empty() {
            droplets.remove(instance.droplet_id());
        }
        removed
    }

    pub fn for_each<F>(&self, mode: TraversalMode, mut f: F)
    where
        F: FnMut(&Arc<DropletInstance>),
    {
        match mode {
            TraversalMode::Read => {
                let droplets = self.droplets.read();
                for instance in droplets.values().flat_map(Droplet::instances) {
                    f(instance);
                }
            }
            TraversalMode::Upgradable => {
                for instance in self.instances() {
                    f(&instance);
                }
            }
        }
    }

    /// Copy of the current instance set, taken under an upgradable read.
    pub fn instances(&self) -> Vec<Arc<DropletInstance>> {
        let droplets = self.droplets.upgradable_read();
        let instances = droplets
            .values()
            .flat_map(Droplet::instances)
            .cloned()
            .collect();
        drop(droplets);
        instances
    }

    pub fn instances_of(&self, droplet_id: &DropletId) -> Vec<Arc<DropletInstance>> {
        let droplets = self.droplets.read();
        droplets
            .get(droplet_id)
            .map(|d| d.instances().cloned().collect())
            .unwrap_or_default()
    }

    pub fn find(&self, droplet_id: &DropletId, instance_id: InstanceId) -> Option<Arc<DropletInstance>> {
        let droplets = self.droplets.read();
        droplets
            .get(droplet_id)
            .and_then(|d| d.instances.get(&instance_id))
            .cloned()
    }

    pub fn droplet_count(&self) -> usize {
        self.droplets.read().len()
    }

    pub fn instance_count(&self) -> usize {
        self.droplets.read().values().map(Droplet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.droplets.read().is_empty()
    }

    /// True if some droplet entry has no instances. Never expected to hold.
    pub fn has_empty_droplet(&self) -> bool {
        self.droplets.read().values().any(Droplet::is_empty)
    }

    /// Aggregate heartbeat over every instance that is not STOPPED.
    pub fn generate_heartbeat_message(&self) -> HeartbeatMessage {
        let mut droplets = Vec::new();
        self.for_each(TraversalMode::Read, |instance| {
            let data = instance.read();
            if data.properties.state != InstanceState::Stopped {
                droplets.push(data.generate_instance_heartbeat());
            }
        });
        HeartbeatMessage { droplets }
    }

    /// True if no instance is STARTING or RUNNING.
    pub fn no_monitorable_apps(&self) -> bool {
        let mut monitorable = false;
        self.for_each(TraversalMode::Read, |instance| {
            monitorable |= instance.state().is_monitorable();
        });
        !monitorable
    }

    /// Write every instance's properties to the snapshot file.
    ///
    /// The file is replaced by renaming a fully written temp file over it,
    /// so readers see either the previous or the new snapshot.
    pub fn snapshot_app_state(&self) -> Result<(), SnapshotError> {
        let _writing = self.snapshot_write.lock();
        let mut snapshot = Vec::new();
        self.for_each(TraversalMode::Read, |instance| {
            snapshot.push(instance.read().properties.clone());
        });

        let json = serde_json::to_vec_pretty(&snapshot)?;
        write_atomically(&self.snapshot_file, |file| file.write_all(&json))?;

        debug!(
            instances = snapshot.len(),
            path = %self.snapshot_file.display(),
            "Snapshot written"
        );
        Ok(())
    }

    /// Request a snapshot on a blocking thread.
    ///
    /// A request made while another is pending or being written is dropped;
    /// returns false in that case.
    pub fn schedule_snapshot_app_state(self: &Arc<Self>) -> bool {
        if self
            .snapshot_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let this = Arc::clone(self);
        let write = move || {
            if let Err(e) = this.snapshot_app_state() {
                warn!(error = %e, "Failed to write snapshot");
            }
            this.snapshot_scheduled.store(false, Ordering::Release);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
        true
    }

    /// True from a scheduled snapshot's request until its write finishes.
    pub fn snapshot_pending(&self) -> bool {
        self.snapshot_scheduled.load(Ordering::Acquire)
    }

    /// Read a snapshot file. A missing file is an empty snapshot.
    pub fn load_snapshot(path: &Path) -> Result<Vec<DropletInstanceProperties>, SnapshotError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let instances: Vec<DropletInstanceProperties> = serde_json::from_slice(&raw)?;
        info!(count = instances.len(), path = %path.display(), "Loaded snapshot");
        Ok(instances)
    }
}

/// Replace `path` with whatever `write` produces.
///
/// The content goes to a temp file in the same directory, which is synced
/// and then renamed over `path`. If anything fails, `path` is untouched and
/// the temp file is removed.
fn write_atomically<F>(path: &Path, write: F) -> Result<(), SnapshotError>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    fs::create_dir_all(&dir).map_err(|source| SnapshotError::Io {
        path: dir.clone(),
        source,
    })?;
    let tmp = dir.join(format!(
        "snap_{}.tmp",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));

    let written = File::create(&tmp)
        .and_then(|mut file| {
            write(&mut file)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if let Err(source) = written {
        let _ = fs::remove_file(&tmp);
        return Err(SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
