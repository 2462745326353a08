//! Virtual filesystem layer
//!
//! Uniform file API over concrete filesystems. Drivers register by name,
//! instances mount under short names, and paths route as `mount:subpath`
//! where the subpath starts with `/`. Filesystems only ever see subpaths
//! relative to their mount; all path grammar lives here and in the shell.

pub mod devfs;
pub mod exfat;

use alloc::{string::String, sync::Arc, vec::Vec};

use spin::RwLock;

use crate::block::{self, BlockDevice};
use crate::error::KernelError;

/// Driver registry capacity.
pub const MAX_FILESYSTEMS: usize = 4;
/// Mount table capacity.
pub const MAX_MOUNTS: usize = 4;
/// Longest allowed mount name.
pub const MOUNT_NAME_MAX: usize = 7;

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
}

/// Stat result for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub node_type: NodeType,
    pub size: u64,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Directory
    }
}

/// An open node handle. Filesystems attach their per-open state to the
/// implementing type; the handle is released by dropping the `Arc`.
pub trait VfsNode: Send + Sync + core::fmt::Debug {
    fn node_type(&self) -> NodeType;

    /// Current size in bytes (0 for directories).
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`; returns the count, 0 at
    /// end of file.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, KernelError>;

    /// Write `data` at `offset`. Optional; the default refuses.
    fn write(&self, _offset: u64, _data: &[u8]) -> Result<usize, KernelError> {
        Err(KernelError::PermissionDenied)
    }

    /// Name of directory entry `index`, or None past the end. Fails on
    /// non-directories.
    fn readdir(&self, index: usize) -> Result<Option<String>, KernelError>;
}

/// A mounted filesystem instance.
pub trait Filesystem: Send + Sync + core::fmt::Debug {
    /// Open the node at a subpath (`/` opens the root directory).
    fn open(&self, path: &str) -> Result<Arc<dyn VfsNode>, KernelError>;

    /// Stat a subpath without keeping a handle.
    fn stat(&self, path: &str) -> Result<Metadata, KernelError>;

    /// Create an empty file. Optional.
    fn create(&self, _path: &str) -> Result<(), KernelError> {
        Err(KernelError::PermissionDenied)
    }

    /// Remove a file. Optional.
    fn unlink(&self, _path: &str) -> Result<(), KernelError> {
        Err(KernelError::PermissionDenied)
    }

    /// Flush cached state to the backing device. The default is a no-op,
    /// which suits write-through filesystems.
    fn sync(&self) -> Result<(), KernelError> {
        Ok(())
    }
}

/// A mountable filesystem type.
pub trait FilesystemDriver: Send + Sync {
    /// Name used in `mount` commands.
    fn name(&self) -> &'static str;

    /// Whether this filesystem reads a block device. Virtual filesystems
    /// return false and must be mounted without a device.
    fn needs_device(&self) -> bool;

    /// Build a filesystem instance over `device` (present exactly when
    /// [`FilesystemDriver::needs_device`] says so).
    fn mount(
        &self,
        device: Option<Arc<dyn BlockDevice>>,
    ) -> Result<Arc<dyn Filesystem>, KernelError>;
}

struct Mount {
    name: String,
    fs: Arc<dyn Filesystem>,
}

static DRIVERS: RwLock<Vec<Arc<dyn FilesystemDriver>>> = RwLock::new(Vec::new());
static MOUNTS: RwLock<Vec<Mount>> = RwLock::new(Vec::new());

/// Register a filesystem driver.
pub fn register_driver(driver: Arc<dyn FilesystemDriver>) -> Result<(), KernelError> {
    let mut drivers = DRIVERS.write();
    if drivers.len() >= MAX_FILESYSTEMS {
        return Err(KernelError::ResourceExhausted);
    }
    if drivers.iter().any(|d| d.name() == driver.name()) {
        // a re-registration of the same type is harmless
        return Ok(());
    }
    log::info!(target: "vfs", "registered filesystem driver {}", driver.name());
    drivers.push(driver);
    Ok(())
}

fn find_driver(name: &str) -> Option<Arc<dyn FilesystemDriver>> {
    DRIVERS.read().iter().find(|d| d.name() == name).cloned()
}

/// Mount `fs_name` as `mount_name`, over block device `device` when the
/// driver requires one.
pub fn mount(fs_name: &str, mount_name: &str, device: Option<&str>) -> Result<(), KernelError> {
    if mount_name.is_empty() || mount_name.len() > MOUNT_NAME_MAX || mount_name.contains([':', '/'])
    {
        return Err(KernelError::InvalidArgument);
    }
    let driver = find_driver(fs_name).ok_or(KernelError::NotFound)?;

    let bdev = match (driver.needs_device(), device) {
        (true, Some(name)) => Some(block::find(name).ok_or(KernelError::NotFound)?),
        (false, None) => None,
        // one canonical form only: a device exactly when the fs reads one
        _ => return Err(KernelError::InvalidArgument),
    };

    let mut mounts = MOUNTS.write();
    if mounts.len() >= MAX_MOUNTS {
        return Err(KernelError::ResourceExhausted);
    }
    if mounts.iter().any(|m| m.name == mount_name) {
        return Err(KernelError::InvalidArgument);
    }
    let fs = driver.mount(bdev)?;
    mounts.push(Mount {
        name: String::from(mount_name),
        fs,
    });
    log::info!(target: "vfs", "mounted {fs_name} on {mount_name}");
    Ok(())
}

/// Remove a mount. Open nodes keep their filesystem alive until dropped.
pub fn umount(mount_name: &str) -> Result<(), KernelError> {
    let mut mounts = MOUNTS.write();
    let index = mounts
        .iter()
        .position(|m| m.name == mount_name)
        .ok_or(KernelError::NotFound)?;
    mounts.remove(index);
    Ok(())
}

/// Mount names in mount order.
pub fn mount_names() -> Vec<String> {
    MOUNTS.read().iter().map(|m| m.name.clone()).collect()
}

/// True when `name` is a current mount.
pub fn is_mounted(name: &str) -> bool {
    MOUNTS.read().iter().any(|m| m.name == name)
}

fn find_mount(name: &str) -> Result<Arc<dyn Filesystem>, KernelError> {
    MOUNTS
        .read()
        .iter()
        .find(|m| m.name == name)
        .map(|m| m.fs.clone())
        .ok_or(KernelError::NotFound)
}

/// Split `mount:subpath` on the first colon. The subpath must begin with
/// `/` (the root is `mount:/`).
pub fn split_path(path: &str) -> Result<(&str, &str), KernelError> {
    let (mount, sub) = path.split_once(':').ok_or(KernelError::InvalidArgument)?;
    if mount.is_empty() || !sub.starts_with('/') {
        return Err(KernelError::InvalidArgument);
    }
    Ok((mount, sub))
}

/// Open the node at `mount:subpath`.
pub fn open(path: &str) -> Result<Arc<dyn VfsNode>, KernelError> {
    let (mount, sub) = split_path(path)?;
    find_mount(mount)?.open(sub)
}

/// Stat the node at `mount:subpath`.
pub fn stat(path: &str) -> Result<Metadata, KernelError> {
    let (mount, sub) = split_path(path)?;
    find_mount(mount)?.stat(sub)
}

/// Create an empty file at `mount:subpath`.
pub fn create(path: &str) -> Result<(), KernelError> {
    let (mount, sub) = split_path(path)?;
    find_mount(mount)?.create(sub)
}

/// Remove the file at `mount:subpath`.
pub fn unlink(path: &str) -> Result<(), KernelError> {
    let (mount, sub) = split_path(path)?;
    find_mount(mount)?.unlink(sub)
}

/// Serializes tests that populate the global mount table, so the small
/// capacity stays deterministic under the parallel test harness. Every
/// guarded test unmounts what it mounted.
#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn mount_test_guard() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
