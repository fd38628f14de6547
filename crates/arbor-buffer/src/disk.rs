//! Disk manager for container files.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use arbor_common::page::{PageId, PAGE_SIZE};
use arbor_common::{ArborError, ContainerConfig, Result};

/// Reads and writes container pages.
///
/// Each container maps to one data file; page `n` lives at byte offset
/// `n * PAGE_SIZE`. Page 0 is never written, so the file of a container
/// with pages 1..=n holds n + 1 page slots.
pub struct DiskManager {
    config: ContainerConfig,
    /// Open file handles keyed by container id.
    files: Mutex<HashMap<u32, FileHandle>>,
}

struct FileHandle {
    file: File,
    /// Number of page slots in the file.
    num_pages: u32,
}

impl DiskManager {
    /// Creates a disk manager rooted at the configured data directory.
    pub fn new(config: ContainerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn file_path(&self, container_id: u32) -> PathBuf {
        self.config.data_dir.join(format!("{:08}.ctr", container_id))
    }

    /// Returns true if a file exists for the container.
    pub fn container_exists(&self, container_id: u32) -> bool {
        self.files.lock().contains_key(&container_id) || self.file_path(container_id).exists()
    }

    fn with_file<T>(
        &self,
        container_id: u32,
        f: impl FnOnce(&mut FileHandle) -> Result<T>,
    ) -> Result<T> {
        let mut files = self.files.lock();

        if !files.contains_key(&container_id) {
            let path = self.file_path(container_id);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            let num_pages = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;
            files.insert(container_id, FileHandle { file, num_pages });
        }

        let handle = files
            .get_mut(&container_id)
            .ok_or(ArborError::ContainerNotFound { container_id })?;
        f(handle)
    }

    /// Reads a page image.
    pub fn read_page(&self, page_id: PageId) -> Result<Box<[u8; PAGE_SIZE]>> {
        self.with_file(page_id.container_id, |handle| {
            if page_id.page_num >= handle.num_pages {
                return Err(ArborError::PageNotFound {
                    container_id: page_id.container_id,
                    page_num: page_id.page_num,
                });
            }

            let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
            handle.file.seek(SeekFrom::Start(offset))?;

            let mut buffer = Box::new([0u8; PAGE_SIZE]);
            handle.file.read_exact(&mut buffer[..])?;
            Ok(buffer)
        })
    }

    /// Writes a page image, extending the file if needed.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        self.with_file(page_id.container_id, |handle| {
            let offset = (page_id.page_num as u64) * (PAGE_SIZE as u64);
            handle.file.seek(SeekFrom::Start(offset))?;
            handle.file.write_all(data)?;

            if page_id.page_num >= handle.num_pages {
                handle.num_pages = page_id.page_num + 1;
            }
            Ok(())
        })
    }

    /// Returns the number of page slots in a container file.
    pub fn num_pages(&self, container_id: u32) -> Result<u32> {
        self.with_file(container_id, |handle| Ok(handle.num_pages))
    }

    /// Syncs one container file if fsync is enabled.
    pub fn sync(&self, container_id: u32) -> Result<()> {
        if !self.config.fsync_enabled {
            return Ok(());
        }
        self.with_file(container_id, |handle| {
            handle.file.sync_all()?;
            Ok(())
        })
    }

    /// Closes a specific container file.
    pub fn close_file(&self, container_id: u32) -> Result<()> {
        let mut files = self.files.lock();
        if let Some(handle) = files.remove(&container_id) {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes all open files.
    pub fn close_all(&self) -> Result<()> {
        let mut files = self.files.lock();
        for (_, handle) in files.drain() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a container file.
    pub fn delete_file(&self, container_id: u32) -> Result<()> {
        self.close_file(container_id)?;
        let path = self.file_path(container_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = ContainerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        };
        let dm = DiskManager::new(config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_new() {
        let (dm, _dir) = create_test_disk_manager();
        assert!(dm.data_dir().exists());
        assert!(!dm.container_exists(5));
    }

    #[test]
    fn test_write_and_read_page() {
        let (dm, _dir) = create_test_disk_manager();
        let page_id = PageId::new(5, 3);

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xCD;
        dm.write_page(page_id, &data).unwrap();

        assert_eq!(dm.num_pages(5).unwrap(), 4);
        let read = dm.read_page(page_id).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[PAGE_SIZE - 1], 0xCD);
        assert!(dm.container_exists(5));
    }

    #[test]
    fn test_read_missing_page() {
        let (dm, _dir) = create_test_disk_manager();
        let result = dm.read_page(PageId::new(1, 9));
        assert!(matches!(result, Err(ArborError::PageNotFound { .. })));
    }

    #[test]
    fn test_reopen_sees_written_pages() {
        let dir = tempdir().unwrap();
        let config = ContainerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
            ..Default::default()
        };

        {
            let dm = DiskManager::new(config.clone()).unwrap();
            dm.write_page(PageId::new(2, 1), &[7u8; PAGE_SIZE]).unwrap();
            dm.sync(2).unwrap();
        }

        let dm = DiskManager::new(config).unwrap();
        assert_eq!(dm.num_pages(2).unwrap(), 2);
        assert_eq!(dm.read_page(PageId::new(2, 1)).unwrap()[100], 7);
    }

    #[test]
    fn test_delete_file() {
        let (dm, _dir) = create_test_disk_manager();
        dm.write_page(PageId::new(4, 1), &[0u8; PAGE_SIZE]).unwrap();
        dm.delete_file(4).unwrap();
        assert!(!dm.container_exists(4));
    }
}
