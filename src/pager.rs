//! Fixed-size page read/write with atomic-rename commit.
//!
//! `PagedFile` is the page-granular I/O primitive shared by the WAL (its
//! own append-only file) and the relationship statistics catalog (its
//! snapshot files). The buffer manager that owns "original" node-property
//! and adjacency-column-property pages is an external collaborator;
//! `PageStore` is the minimal trait that contract must satisfy, and
//! `PagedFile` doubles as the one concrete, uncached implementation this
//! crate ships so the checkpoint/recovery path is exercisable without a
//! real buffer manager.

use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::FileExt as _;
#[cfg(windows)]
use std::os::windows::fs::FileExt as _;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(u64);

impl PageId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// A page-granular store a WAL shadow page can be copied into on
/// checkpoint. The real implementation (buffer manager + file handle) is
/// out of scope for this crate; `PagedFile` below is a faithful but
/// uncached stand-in.
pub trait PageStore {
    fn page_size(&self) -> usize;
    fn read_page(&mut self, page_id: PageId) -> Result<Vec<u8>>;
    fn write_page(&mut self, page_id: PageId, page: &[u8]) -> Result<()>;
}

#[derive(Debug)]
pub struct PagedFile {
    path: PathBuf,
    file: File,
    page_size: usize,
}

impl PagedFile {
    pub fn create_or_open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            page_size,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> Result<u64> {
        let len = self.file.metadata()?.len();
        Ok(len / self.page_size as u64)
    }

    /// Appends a zero-filled page at the current tail and returns its id.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let id = self.page_count()?;
        let required = (id + 1) * self.page_size as u64;
        self.file.set_len(required)?;
        Ok(PageId::new(id))
    }

    pub fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        let offset = page_id.as_u64() * self.page_size as u64;
        read_exact_at(&self.file, offset, &mut buf)?;
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, page: &[u8]) -> Result<()> {
        if page.len() != self.page_size {
            return Err(Error::Logic("page buffer length must equal page_size"));
        }
        let offset = page_id.as_u64() * self.page_size as u64;
        write_all_at(&self.file, offset, page)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Drops the file to `num_pages` pages, discarding everything past it.
    /// Used by `Wal::clear_wal`.
    pub fn truncate_to(&self, num_pages: u64) -> Result<()> {
        self.file.set_len(num_pages * self.page_size as u64)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replaces `target` with `bytes` durably and atomically: write to a
    /// sibling `.tmp` file, fsync it, then `rename` over `target`. Used
    /// for both WAL header persistence and the statistics catalog's
    /// snapshot files.
    pub fn atomic_replace(target: impl AsRef<Path>, bytes: &[u8]) -> Result<()> {
        let target = target.as_ref();
        let tmp = tmp_sibling(target);
        {
            let tmp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            write_all_at(&tmp_file, 0, bytes)?;
            tmp_file.sync_data()?;
        }
        std::fs::rename(&tmp, target)?;
        Ok(())
    }
}

impl PageStore for PagedFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&mut self, page_id: PageId) -> Result<Vec<u8>> {
        PagedFile::read_page(self, page_id)
    }

    fn write_page(&mut self, page_id: PageId, page: &[u8]) -> Result<()> {
        PagedFile::write_page(self, page_id, page)
    }
}

fn tmp_sibling(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = read_at(file, offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read_at returned 0 bytes",
            ));
        }
        offset = offset.saturating_add(n as u64);
        buf = &mut buf[n..];
    }
    Ok(())
}

fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = write_at(file, offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write_at returned 0 bytes",
            ));
        }
        offset = offset.saturating_add(n as u64);
        buf = &buf[n..];
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    file.seek_write(buf, offset)
}
