//! Page-level file I/O for the disk tree.
//!
//! Every call reads or writes exactly one fixed-size page. Page 0 holds the
//! header; node pages live at `page_id * PAGE_SIZE`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::rtree_constants::PAGE_SIZE;
use super::rtree_types::{FileHeader, Node, PageId, PageWithChecksum};
use crate::errors::{RRTreeError, RRTreeResult};

/// Reads and writes individual pages of a tree file.
pub struct Storage {
    file: Mutex<File>,
    path: PathBuf,
    page_size: usize,
}

impl Storage {
    /// Create a new storage file, truncating any existing one
    pub fn create(path: &Path) -> RRTreeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            page_size: PAGE_SIZE,
        })
    }

    /// Open an existing storage file
    pub fn open(path: &Path) -> RRTreeResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            page_size: PAGE_SIZE,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_header(&self) -> RRTreeResult<FileHeader> {
        let buffer = self.read_raw(0)?;
        bincode::serde::decode_from_slice(&buffer, bincode::config::legacy())
            .map(|(header, _)| header)
            .map_err(|e| RRTreeError::Serialization(e.to_string()))
    }

    pub fn write_header(&self, header: &FileHeader) -> RRTreeResult<()> {
        let bytes = bincode::serde::encode_to_vec(header, bincode::config::legacy())
            .map_err(|e| RRTreeError::Serialization(e.to_string()))?;
        self.write_raw(0, bytes)
    }

    /// Read and verify one node page
    pub fn read_page(&self, page_id: PageId) -> RRTreeResult<Node> {
        Self::check_node_page(page_id)?;
        let buffer = self.read_raw(page_id)?;

        let page: PageWithChecksum =
            bincode::serde::decode_from_slice(&buffer, bincode::config::legacy())
                .map(|(page, _)| page)
                .map_err(|e| RRTreeError::Serialization(e.to_string()))?;

        page.into_node()
    }

    /// Write one node page with its checksum
    pub fn write_page(&self, page_id: PageId, node: &Node) -> RRTreeResult<()> {
        Self::check_node_page(page_id)?;

        let page = PageWithChecksum::new(node.clone())?;
        let bytes = bincode::serde::encode_to_vec(&page, bincode::config::legacy())
            .map_err(|e| RRTreeError::Serialization(e.to_string()))?;

        if bytes.len() > self.page_size {
            return Err(RRTreeError::corrupted(format!(
                "Node too large: {} bytes (max {})",
                bytes.len(),
                self.page_size
            )));
        }

        self.write_raw(page_id, bytes)
    }

    pub fn sync(&self) -> RRTreeResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Drops every page after the header
    pub fn truncate_nodes(&self) -> RRTreeResult<()> {
        self.file.lock().set_len(self.page_size as u64)?;
        Ok(())
    }

    fn check_node_page(page_id: PageId) -> RRTreeResult<()> {
        if page_id == 0 {
            return Err(RRTreeError::InvalidOperation(
                "page 0 is reserved for the header".into(),
            ));
        }
        Ok(())
    }

    fn read_raw(&self, page_id: PageId) -> RRTreeResult<Vec<u8>> {
        let offset = page_id * self.page_size as u64;
        let mut buffer = vec![0u8; self.page_size];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write_raw(&self, page_id: PageId, mut bytes: Vec<u8>) -> RRTreeResult<()> {
        bytes.resize(self.page_size, 0);
        let offset = page_id * self.page_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::BoundingBox;
    use crate::config::NodeCapacity;
    use crate::disk_rtree::rtree_types::{ChildRef, LeafEntry};
    use tempfile::tempdir;

    #[test]
    fn test_storage_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let storage = Storage::create(&path).unwrap();
        storage.write_header(&FileHeader::new(NodeCapacity::default())).unwrap();
        drop(storage);

        let storage = Storage::open(&path).unwrap();
        assert_eq!(storage.path(), path.as_path());
        assert!(storage.read_header().unwrap().validate().is_ok());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempdir().unwrap();
        let result = Storage::open(&dir.path().join("missing.rtree"));
        assert!(matches!(result, Err(RRTreeError::Io(_))));
    }

    #[test]
    fn test_storage_header_read_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let storage = Storage::create(&path).unwrap();

        let mut header = FileHeader::new(NodeCapacity::new(8, 3, 6));
        header.root_page = 1;
        header.next_page_id = 5;
        header.entry_count = 100;
        header.height = 3;

        storage.write_header(&header).unwrap();
        assert_eq!(storage.read_header().unwrap(), header);
    }

    #[test]
    fn test_storage_page_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let storage = Storage::create(&path).unwrap();

        let leaf = Node::Leaf {
            entries: vec![LeafEntry::new(BoundingBox::new(0.0, 0.0, 1.0, 1.0), 42)],
        };
        let internal = Node::Internal {
            children: vec![ChildRef {
                bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
                page_id: 1,
            }],
            level: 1,
        };

        storage.write_page(1, &leaf).unwrap();
        storage.write_page(2, &internal).unwrap();
        assert_eq!(storage.read_page(1).unwrap(), leaf);
        assert_eq!(storage.read_page(2).unwrap(), internal);
    }

    #[test]
    fn test_storage_page_zero_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let storage = Storage::create(&path).unwrap();

        let node = Node::Leaf { entries: vec![] };
        assert!(storage.write_page(0, &node).is_err());
        assert!(storage.read_page(0).is_err());
    }

    #[test]
    fn test_oversized_node_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let storage = Storage::create(&path).unwrap();

        let entries = (0..1000)
            .map(|i| LeafEntry::new(BoundingBox::new(0.0, 0.0, 1.0, 1.0), i))
            .collect();
        assert!(storage.write_page(1, &Node::Leaf { entries }).is_err());
    }

    #[test]
    fn test_corrupted_page_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let storage = Storage::create(&path).unwrap();
        let node = Node::Leaf {
            entries: vec![LeafEntry::new(BoundingBox::new(0.0, 0.0, 1.0, 1.0), 7)],
        };
        storage.write_page(1, &node).unwrap();

        // Flip a byte inside the encoded entry id.
        let mut raw = storage.read_raw(1).unwrap();
        raw[4 + 4 + 8 + 32] ^= 0xFF;
        storage.write_raw(1, raw).unwrap();

        assert!(storage.read_page(1).is_err());
    }

    #[test]
    fn test_truncate_nodes_keeps_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.rtree");
        let storage = Storage::create(&path).unwrap();
        let header = FileHeader::new(NodeCapacity::default());
        storage.write_header(&header).unwrap();
        storage.write_page(3, &Node::Leaf { entries: vec![] }).unwrap();

        storage.truncate_nodes().unwrap();
        assert_eq!(storage.read_header().unwrap(), header);
        assert!(storage.read_page(3).is_err());
    }
}
