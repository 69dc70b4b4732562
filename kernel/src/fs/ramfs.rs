//! RAM filesystem
//!
//! A volatile tree of reference-counted nodes. Directories hold their
//! children in an ordered map; parent links do not exist, so the tree is
//! owned top-down and nodes die when the last handle drops.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, RwLock};

use super::{DirEntry, Filesystem, Metadata, NodeType, VfsNode};
use crate::error::{KernelError, KernelResult};

struct RamNode {
    node_type: NodeType,
    inode: u64,
    data: RwLock<Vec<u8>>,
    children: RwLock<BTreeMap<String, Arc<RamNode>>>,
    created_ticks: u64,
    modified_ticks: AtomicU64,
    /// Inode counter shared with the owning filesystem.
    next_inode: Arc<AtomicU64>,
}

impl RamNode {
    fn new(node_type: NodeType, inode: u64, next_inode: Arc<AtomicU64>) -> Self {
        let now = crate::arch::now_ticks();
        Self {
            node_type,
            inode,
            data: RwLock::new(Vec::new()),
            children: RwLock::new(BTreeMap::new()),
            created_ticks: now,
            modified_ticks: AtomicU64::new(now),
            next_inode,
        }
    }

    fn touch(&self) {
        self.modified_ticks
            .store(crate::arch::now_ticks(), Ordering::Relaxed);
    }

    fn require_dir(&self) -> KernelResult<()> {
        match self.node_type {
            NodeType::Directory => Ok(()),
            NodeType::File => Err(KernelError::NotADirectory),
        }
    }

    fn require_file(&self) -> KernelResult<()> {
        match self.node_type {
            NodeType::File => Ok(()),
            NodeType::Directory => Err(KernelError::IsADirectory),
        }
    }
}

impl VfsNode for RamNode {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn metadata(&self) -> Metadata {
        Metadata {
            node_type: self.node_type,
            size: self.data.read().len(),
            inode: self.inode,
            created_ticks: self.created_ticks,
            modified_ticks: self.modified_ticks.load(Ordering::Relaxed),
        }
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> KernelResult<usize> {
        self.require_file()?;
        let data = self.data.read();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: usize, incoming: &[u8]) -> KernelResult<usize> {
        self.require_file()?;
        let mut data = self.data.write();
        let end = offset + incoming.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(incoming);
        self.touch();
        Ok(incoming.len())
    }

    fn lookup(&self, name: &str) -> KernelResult<Arc<dyn VfsNode>> {
        self.require_dir()?;
        self.children
            .read()
            .get(name)
            .cloned()
            .map(|n| n as Arc<dyn VfsNode>)
            .ok_or(KernelError::NotFound {
                what: "directory entry",
            })
    }

    fn create(&self, name: &str, node_type: NodeType) -> KernelResult<Arc<dyn VfsNode>> {
        self.require_dir()?;
        if name.is_empty() || name.contains('/') {
            return Err(KernelError::InvalidArgument {
                what: "file name",
            });
        }
        let mut children = self.children.write();
        if children.contains_key(name) {
            return Err(KernelError::AlreadyExists {
                what: "directory entry",
            });
        }
        let inode = self.next_inode.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(RamNode::new(node_type, inode, self.next_inode.clone()));
        children.insert(String::from(name), node.clone());
        self.touch();
        Ok(node)
    }

    fn remove(&self, name: &str) -> KernelResult<()> {
        self.require_dir()?;
        let mut children = self.children.write();
        let node = children.get(name).ok_or(KernelError::NotFound {
            what: "directory entry",
        })?;
        if node.node_type == NodeType::Directory && !node.children.read().is_empty() {
            return Err(KernelError::InvalidArgument {
                what: "directory not empty",
            });
        }
        children.remove(name);
        self.touch();
        Ok(())
    }

    fn readdir(&self) -> KernelResult<Vec<DirEntry>> {
        self.require_dir()?;
        Ok(self
            .children
            .read()
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                node_type: node.node_type,
            })
            .collect())
    }
}

/// The volatile in-memory filesystem.
pub struct RamFs {
    root: Arc<RamNode>,
}

impl RamFs {
    pub fn new() -> Self {
        let next_inode = Arc::new(AtomicU64::new(2));
        Self {
            root: Arc::new(RamNode::new(NodeType::Directory, 1, next_inode)),
        }
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn root(&self) -> Arc<dyn VfsNode> {
        self.root.clone()
    }
}

static ROOT_FS: Mutex<Option<RamFs>> = Mutex::new(None);

/// Driver entry: mount a fresh ramfs as the root filesystem.
pub fn init() -> KernelResult<()> {
    let fs = RamFs::new();
    fs.root().create("tmp", NodeType::Directory)?;
    *ROOT_FS.lock() = Some(fs);
    log::info!("ramfs: mounted as root");
    Ok(())
}

/// Root node of the mounted ramfs.
pub fn root() -> KernelResult<Arc<dyn VfsNode>> {
    ROOT_FS
        .lock()
        .as_ref()
        .map(|fs| fs.root())
        .ok_or(KernelError::NotFound {
            what: "root filesystem",
        })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn create_lookup_roundtrip() {
        let fs = RamFs::new();
        let root = fs.root();
        let file = root.create("hello.txt", NodeType::File).unwrap();
        assert_eq!(file.node_type(), NodeType::File);

        let found = root.lookup("hello.txt").unwrap();
        assert_eq!(found.metadata().inode, file.metadata().inode);

        assert!(matches!(
            root.lookup("absent"),
            Err(KernelError::NotFound { .. })
        ));
        assert!(matches!(
            root.create("hello.txt", NodeType::File),
            Err(KernelError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn file_read_write_with_offsets() {
        let fs = RamFs::new();
        let file = fs.root().create("data", NodeType::File).unwrap();

        assert_eq!(file.write_at(0, b"hello world").unwrap(), 11);
        assert_eq!(file.metadata().size, 11);

        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");

        // Reads past the end return zero bytes.
        assert_eq!(file.read_at(100, &mut buf).unwrap(), 0);

        // A sparse write zero-fills the gap.
        file.write_at(16, b"!").unwrap();
        assert_eq!(file.metadata().size, 17);
        let mut gap = [0xFFu8; 2];
        file.read_at(12, &mut gap).unwrap();
        assert_eq!(gap, [0, 0]);
    }

    #[test]
    fn type_mismatches_surface_the_right_errors() {
        let fs = RamFs::new();
        let root = fs.root();
        let file = root.create("f", NodeType::File).unwrap();
        let dir = root.create("d", NodeType::Directory).unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(
            dir.read_at(0, &mut buf),
            Err(KernelError::IsADirectory)
        ));
        assert!(matches!(dir.write_at(0, b"x"), Err(KernelError::IsADirectory)));
        assert!(matches!(file.lookup("x"), Err(KernelError::NotADirectory)));
        assert!(matches!(
            file.create("x", NodeType::File),
            Err(KernelError::NotADirectory)
        ));
        assert!(matches!(file.readdir(), Err(KernelError::NotADirectory)));
    }

    #[test]
    fn readdir_lists_children_in_order() {
        let fs = RamFs::new();
        let root = fs.root();
        root.create("b", NodeType::File).unwrap();
        root.create("a", NodeType::Directory).unwrap();
        root.create("c", NodeType::File).unwrap();

        let entries = root.readdir().unwrap();
        let names: std::vec::Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(entries[0].node_type, NodeType::Directory);
    }

    #[test]
    fn remove_refuses_non_empty_directories() {
        let fs = RamFs::new();
        let root = fs.root();
        let dir = root.create("nested", NodeType::Directory).unwrap();
        dir.create("child", NodeType::File).unwrap();

        assert!(matches!(
            root.remove("nested"),
            Err(KernelError::InvalidArgument { .. })
        ));
        dir.remove("child").unwrap();
        root.remove("nested").unwrap();
        assert!(matches!(
            root.lookup("nested"),
            Err(KernelError::NotFound { .. })
        ));
    }
}
