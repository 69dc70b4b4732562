//! Filesystem interfaces
//!
//! The per-node capability surface every filesystem implements, plus the
//! volatile in-memory filesystem ([`ramfs`]). Path resolution beyond
//! component-at-a-time lookup lives above this layer.

pub mod ramfs;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::KernelResult;

/// Node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
}

/// Node metadata snapshot
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub node_type: NodeType,
    pub size: usize,
    pub inode: u64,
    pub created_ticks: u64,
    pub modified_ticks: u64,
}

/// One directory listing entry
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub node_type: NodeType,
}

/// The per-node operation table.
///
/// File operations (`read_at`, `write_at`) fail with `IsADirectory` on
/// directories; directory operations (`lookup`, `create`, `remove`,
/// `readdir`) fail with `NotADirectory` on files.
pub trait VfsNode: Send + Sync {
    fn node_type(&self) -> NodeType;
    fn metadata(&self) -> Metadata;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read; zero past the end.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> KernelResult<usize>;

    /// Write `data` at `offset`, growing the file as needed.
    fn write_at(&self, offset: usize, data: &[u8]) -> KernelResult<usize>;

    /// Find a direct child by name.
    fn lookup(&self, name: &str) -> KernelResult<Arc<dyn VfsNode>>;

    /// Create a direct child.
    fn create(&self, name: &str, node_type: NodeType) -> KernelResult<Arc<dyn VfsNode>>;

    /// Remove a direct child. Non-empty directories are refused.
    fn remove(&self, name: &str) -> KernelResult<()>;

    /// List the direct children.
    fn readdir(&self) -> KernelResult<Vec<DirEntry>>;
}

/// A mounted filesystem instance.
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &'static str;
    fn root(&self) -> Arc<dyn VfsNode>;
}
