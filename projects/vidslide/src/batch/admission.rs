use crate::config::DISK_FLOOR_MB;
use std::path::Path;
use std::sync::Arc;
use sysinfo::Disks;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Free-space lookup for the admission check.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available on the volume holding `path`, if known.
    fn free_bytes(&self, path: &Path) -> Option<u64>;
}

/// Queries mounted volumes through sysinfo.
pub struct SystemSpace;

impl SpaceProbe for SystemSpace {
    fn free_bytes(&self, path: &Path) -> Option<u64> {
        let path = path.canonicalize().ok()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Outcome of the disk check made before a task is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Below the floor; carries the free space in MB.
    LowDisk(u64),
}

pub fn check_disk(space: &dyn SpaceProbe, dir: &Path) -> Admission {
    match space.free_bytes(dir) {
        Some(free) if free < DISK_FLOOR_MB * 1024 * 1024 => Admission::LowDisk(free / (1024 * 1024)),
        Some(_) => Admission::Admit,
        None => {
            tracing::debug!("Admission: free space unknown for {}, admitting", dir.display());
            Admission::Admit
        }
    }
}

/// Worker slots. Replaced wholesale when the worker limit changes; the old
/// semaphore is closed so nobody waits on it forever.
#[derive(Debug, Clone)]
pub struct WorkerSlots {
    semaphore: Arc<Semaphore>,
}

impl WorkerSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Waits for a slot. `None` once these slots have been retired.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn retire(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSpace(Option<u64>);

    impl SpaceProbe for FixedSpace {
        fn free_bytes(&self, _: &Path) -> Option<u64> {
            self.0
        }
    }

    #[test]
    fn test_disk_floor() {
        let dir = Path::new(".");
        let mb = 1024 * 1024;
        assert_eq!(check_disk(&FixedSpace(Some(100 * mb)), dir), Admission::LowDisk(100));
        assert_eq!(check_disk(&FixedSpace(Some(4096 * mb)), dir), Admission::Admit);
        assert_eq!(check_disk(&FixedSpace(None), dir), Admission::Admit);
    }

    #[test]
    fn test_system_space_reports_temp_dir() {
        let free = SystemSpace.free_bytes(&std::env::temp_dir());
        if let Some(free) = free {
            assert!(free > 0);
        }
    }

    #[tokio::test]
    async fn test_slots_bound_and_retire() {
        let slots = WorkerSlots::new(2);
        let a = slots.acquire().await.unwrap();
        let _b = slots.acquire().await.unwrap();
        assert_eq!(slots.available(), 0);
        drop(a);
        assert_eq!(slots.available(), 1);

        slots.retire();
        assert!(slots.acquire().await.is_none());
    }
}
