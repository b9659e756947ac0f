use alloc::sync::Arc;
use spin::Mutex;

use crate::fs::SimpleFs;

/// A file handle: an inumber bound to its mounted volume.
///
/// The namespace is flat, so unlike a name-based vfs there is nothing to
/// look up; handles come straight from `create` or from a known inumber.
pub struct Inode {
  inumber: u32,
  fs: Arc<Mutex<SimpleFs>>,
}

impl Inode {
  /// Allocate a new empty file, None when the inode table is full
  pub fn create(fs: &Arc<Mutex<SimpleFs>>) -> Option<Inode> {
    let inumber = fs.lock().create()?;
    Some(Self {
      inumber,
      fs: fs.clone(),
    })
  }

  /// Handle to an existing file, None if `inumber` is not one
  pub fn open(fs: &Arc<Mutex<SimpleFs>>, inumber: u32) -> Option<Inode> {
    fs.lock().size(inumber)?;
    Some(Self {
      inumber,
      fs: fs.clone(),
    })
  }

  pub fn inumber(&self) -> u32 {
    self.inumber
  }

  /// Logical size in bytes; None once the file has been removed under us
  pub fn size(&self) -> Option<u32> {
    self.fs.lock().size(self.inumber)
  }

  pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
    self.fs.lock().read_at(self.inumber, offset, buf)
  }

  pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
    self.fs.lock().write_at(self.inumber, offset, buf)
  }

  /// Delete the file and consume the handle
  pub fn remove(self) -> bool {
    self.fs.lock().remove(self.inumber)
  }
}
