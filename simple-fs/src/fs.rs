use core::cmp::min;
use core::fmt::Write;

use alloc::string::String;
use alloc::sync::Arc;
use log::{debug, warn};
use spin::Mutex;

use crate::{
  BLOCK_SZ, DataBlock,
  bitmap::Bitmap,
  block_cache::{block_cache_sync_all, get_block_cache},
  block_dev::BlockDevice,
  layout::{
    DiskInode, IndirectBlock, InodeBlock, SuperBlock,
    INODES_PER_BLOCK, INODE_DIRECT_COUNT, MAX_FILE_BLOCKS, NO_BLOCK,
  },
};

/// A mounted volume: the device plus both in-memory free bitmaps.
///
/// Nothing here is persisted. Dropping the value is "unmount"; the next
/// `mount` rebuilds the bitmaps from the inode table on disk.
pub struct SimpleFs {
  block_dev: Arc<dyn BlockDevice>,
  block_bitmap: Bitmap,
  inode_bitmap: Bitmap,

  total_blocks: usize,
  inode_blocks: usize,
}

impl SimpleFs {
  /// inode-table blocks: one tenth of the device, rounded, at least one
  fn inode_area_blocks(total_blocks: usize) -> usize {
    ((total_blocks + 5) / 10).max(1)
  }

  /// Write a fresh filesystem onto the device: zero every inode record,
  /// then put the superblock at block 0. Data blocks are left as-is.
  ///
  /// Returns false, leaving the device untouched, when it cannot even
  /// hold the superblock plus the inode table.
  pub fn format(block_dev: &Arc<dyn BlockDevice>) -> bool {
    let total_blocks = block_dev.num_blocks();
    let inode_blocks = Self::inode_area_blocks(total_blocks);
    if inode_blocks >= total_blocks {
      warn!("format: device of {} blocks is too small", total_blocks);
      return false;
    }

    for block_id in 1..=inode_blocks {
      get_block_cache(block_id, block_dev.clone())
        .lock()
        .modify(0, |blk: &mut DataBlock| {
          blk.iter_mut().for_each(|byte| *byte = 0);
        });
    }

    let inodes = inode_blocks * INODES_PER_BLOCK;
    get_block_cache(0, block_dev.clone())
      .lock()
      .modify(0, |super_blk: &mut SuperBlock| {
        *super_blk = SuperBlock::new(total_blocks as u32, inode_blocks as u32, inodes as u32);
      });
    block_cache_sync_all();
    debug!(
      "format: {} blocks, {} inode blocks, {} inodes",
      total_blocks, inode_blocks, inodes
    );
    true
  }

  /// Mount the device: check the magic, then rebuild both bitmaps by
  /// walking every inode's direct and indirect pointers.
  ///
  /// Geometry is re-derived from the live device size and the fixed 10%
  /// ratio rather than trusted from the stored superblock, so a resized
  /// device still mounts. Returns None if block 0 carries no filesystem.
  pub fn mount(block_dev: Arc<dyn BlockDevice>) -> Option<Arc<Mutex<Self>>> {
    let magic_ok = get_block_cache(0, block_dev.clone())
      .lock()
      .read(0, |super_blk: &SuperBlock| super_blk.is_valid());
    if !magic_ok {
      warn!("mount: bad magic, not a filesystem");
      return None;
    }

    let total_blocks = block_dev.num_blocks();
    let inode_blocks = Self::inode_area_blocks(total_blocks);
    if inode_blocks >= total_blocks {
      warn!("mount: device of {} blocks is too small", total_blocks);
      return None;
    }
    let inodes = inode_blocks * INODES_PER_BLOCK;

    let mut block_bitmap = Bitmap::new(total_blocks);
    let mut inode_bitmap = Bitmap::new(inodes);

    // the superblock and the whole inode table are never data blocks
    for block_id in 0..=inode_blocks {
      block_bitmap.set(block_id);
    }
    // inumber 0 is reserved and never issued
    inode_bitmap.set(0);

    let mark = |ptr: u32, block_bitmap: &mut Bitmap| {
      // stale out-of-range pointers are skipped, same as in dump
      if ptr != NO_BLOCK && (ptr as usize) < total_blocks {
        block_bitmap.set(ptr as usize);
      }
    };

    for table_idx in 0..inode_blocks {
      get_block_cache(1 + table_idx, block_dev.clone())
        .lock()
        .read(0, |inode_blk: &InodeBlock| {
          for (slot, disk_inode) in inode_blk.iter().enumerate() {
            if !disk_inode.is_valid() {
              continue;
            }
            inode_bitmap.set(table_idx * INODES_PER_BLOCK + slot);
            for &ptr in disk_inode.direct.iter() {
              mark(ptr, &mut block_bitmap);
            }
            if disk_inode.indirect != NO_BLOCK && (disk_inode.indirect as usize) < total_blocks {
              block_bitmap.set(disk_inode.indirect as usize);
              get_block_cache(disk_inode.indirect as usize, block_dev.clone())
                .lock()
                .read(0, |indirect: &IndirectBlock| {
                  for &ptr in indirect.iter() {
                    mark(ptr, &mut block_bitmap);
                  }
                });
            }
          }
        });
    }

    debug!(
      "mount: {} blocks total, {} in use, {} inodes in use",
      total_blocks,
      block_bitmap.count_set(),
      inode_bitmap.count_set() - 1
    );
    Some(Arc::new(Mutex::new(Self {
      block_dev,
      block_bitmap,
      inode_bitmap,
      total_blocks,
      inode_blocks,
    })))
  }

  /// (block_id, inner_block_offset) of `inumber`'s packed record
  fn disk_inode_pos(&self, inumber: u32) -> (usize, usize) {
    let inumber = inumber as usize;
    (
      1 + inumber / INODES_PER_BLOCK,
      inumber % INODES_PER_BLOCK * core::mem::size_of::<DiskInode>(),
    )
  }

  fn inode_in_use(&self, inumber: u32) -> bool {
    inumber != 0 && self.inode_bitmap.get(inumber as usize)
  }

  /// Allocate a new zero-length file, first-fit from inumber 1
  pub fn create(&mut self) -> Option<u32> {
    let inumber = match self.inode_bitmap.alloc() {
      Some(inumber) => inumber as u32,
      None => {
        warn!("create: inode table exhausted");
        return None;
      }
    };
    let (block_id, offset) = self.disk_inode_pos(inumber);
    get_block_cache(block_id, self.block_dev.clone())
      .lock()
      .modify(offset, |disk_inode: &mut DiskInode| {
        disk_inode.initialize();
      });
    block_cache_sync_all();
    Some(inumber)
  }

  /// Delete `inumber`: release every block it reaches, then the record
  /// itself. Returns false for an inumber that is not currently a file.
  pub fn remove(&mut self, inumber: u32) -> bool {
    if !self.inode_in_use(inumber) {
      return false;
    }
    let (block_id, offset) = self.disk_inode_pos(inumber);
    let block_dev = self.block_dev.clone();
    let freed = get_block_cache(block_id, block_dev.clone())
      .lock()
      .modify(offset, |disk_inode: &mut DiskInode| {
        disk_inode.clear(&block_dev)
      });
    for block_id in freed {
      self.free_block(block_id);
    }
    self.inode_bitmap.clear(inumber as usize);
    block_cache_sync_all();
    debug!("remove: inode {} gone", inumber);
    true
  }

  /// Logical size in bytes, or None for an inumber that is not a file.
  /// Some(0) is a real (empty) file, not a failure.
  pub fn size(&self, inumber: u32) -> Option<u32> {
    if !self.inode_in_use(inumber) {
      return None;
    }
    let (block_id, offset) = self.disk_inode_pos(inumber);
    let size = get_block_cache(block_id, self.block_dev.clone())
      .lock()
      .read(offset, |disk_inode: &DiskInode| disk_inode.size);
    Some(size)
  }

  /// Read up to `buf.len()` bytes at `offset`, clamped to the file size
  pub fn read_at(&self, inumber: u32, offset: usize, buf: &mut [u8]) -> usize {
    if !self.inode_in_use(inumber) {
      return 0;
    }
    let (block_id, inner_offset) = self.disk_inode_pos(inumber);
    get_block_cache(block_id, self.block_dev.clone())
      .lock()
      .read(inner_offset, |disk_inode: &DiskInode| {
        disk_inode.read_at(offset, buf, &self.block_dev)
      })
  }

  /// Write `buf` at `offset`, growing the block chain on demand.
  ///
  /// Returns the bytes actually written; short only when the device (or
  /// the 5-direct-plus-one-indirect file shape) runs out. Everything is
  /// flushed before return, so the device reflects exactly the returned
  /// prefix.
  pub fn write_at(&mut self, inumber: u32, offset: usize, buf: &[u8]) -> usize {
    if !self.inode_in_use(inumber) {
      return 0;
    }
    let (inode_block, inode_offset) = self.disk_inode_pos(inumber);
    let block_dev = self.block_dev.clone();
    let mut written = 0usize;
    while written < buf.len() {
      let pos = offset + written;
      // logical index comes from the byte position, never from a count
      // of physical blocks touched
      let logical = pos / BLOCK_SZ;
      if logical >= MAX_FILE_BLOCKS {
        break;
      }
      let block_id = match self.map_block(inode_block, inode_offset, logical) {
        Some(block_id) => block_id,
        None => break, // device full: keep what we already wrote
      };
      let begin = pos % BLOCK_SZ;
      let len = min(BLOCK_SZ - begin, buf.len() - written);
      get_block_cache(block_id as usize, block_dev.clone())
        .lock()
        .modify(0, |data: &mut DataBlock| {
          data[begin..begin + len].copy_from_slice(&buf[written..written + len]);
        });
      written += len;
      let end = (pos + len) as u32;
      get_block_cache(inode_block, block_dev.clone())
        .lock()
        .modify(inode_offset, |disk_inode: &mut DiskInode| {
          if end > disk_inode.size {
            disk_inode.size = end;
          }
        });
    }
    block_cache_sync_all();
    written
  }

  /// Back logical block `logical` of the inode at (inode_block,
  /// inode_offset) with a physical block, allocating the data block and,
  /// past the direct range, the indirect block on first use. None when
  /// the device is exhausted.
  fn map_block(&mut self, inode_block: usize, inode_offset: usize, logical: usize) -> Option<u32> {
    let block_dev = self.block_dev.clone();
    if logical < INODE_DIRECT_COUNT {
      let cur = get_block_cache(inode_block, block_dev.clone())
        .lock()
        .read(inode_offset, |disk_inode: &DiskInode| disk_inode.direct[logical]);
      if cur != NO_BLOCK {
        return Some(cur);
      }
      let block_id = self.alloc_block()?;
      get_block_cache(inode_block, block_dev)
        .lock()
        .modify(inode_offset, |disk_inode: &mut DiskInode| {
          disk_inode.direct[logical] = block_id;
        });
      Some(block_id)
    } else {
      let slot = logical - INODE_DIRECT_COUNT;
      let mut indirect = get_block_cache(inode_block, block_dev.clone())
        .lock()
        .read(inode_offset, |disk_inode: &DiskInode| disk_inode.indirect);
      if indirect == NO_BLOCK {
        indirect = self.alloc_block()?; // comes back zeroed
        get_block_cache(inode_block, block_dev.clone())
          .lock()
          .modify(inode_offset, |disk_inode: &mut DiskInode| {
            disk_inode.indirect = indirect;
          });
      }
      let cur = get_block_cache(indirect as usize, block_dev.clone())
        .lock()
        .read(0, |indirect_blk: &IndirectBlock| indirect_blk[slot]);
      if cur != NO_BLOCK {
        return Some(cur);
      }
      let block_id = self.alloc_block()?;
      get_block_cache(indirect as usize, block_dev)
        .lock()
        .modify(0, |indirect_blk: &mut IndirectBlock| {
          indirect_blk[slot] = block_id;
        });
      Some(block_id)
    }
  }

  /// Reserve a free data block and hand it back zeroed.
  ///
  /// Block 0 and the inode-table region were pre-marked at mount, so the
  /// first-fit scan can never return them; a result of None means the
  /// device is full.
  fn alloc_block(&mut self) -> Option<u32> {
    let block_id = match self.block_bitmap.alloc() {
      Some(block_id) => block_id,
      None => {
        debug!("alloc_block: device full");
        return None;
      }
    };
    get_block_cache(block_id, self.block_dev.clone())
      .lock()
      .modify(0, |data: &mut DataBlock| {
        data.iter_mut().for_each(|byte| *byte = 0);
      });
    Some(block_id as u32)
  }

  /// Release one block: zero it and clear its bitmap bit.
  ///
  /// A block that is already free is skipped, so a corrupted image where
  /// the same address shows up behind two pointers cannot double-free.
  fn free_block(&mut self, block_id: u32) {
    if block_id == NO_BLOCK
      || block_id as usize >= self.total_blocks
      || !self.block_bitmap.get(block_id as usize)
    {
      return;
    }
    get_block_cache(block_id as usize, self.block_dev.clone())
      .lock()
      .modify(0, |data: &mut DataBlock| {
        data.iter_mut().for_each(|byte| *byte = 0);
      });
    self.block_bitmap.clear(block_id as usize);
  }

  pub fn total_blocks(&self) -> usize {
    self.total_blocks
  }

  /// Data blocks still available for allocation
  pub fn free_blocks(&self) -> usize {
    self.total_blocks - self.block_bitmap.count_set()
  }

  /// Total inode slots, the reserved inumber 0 included
  pub fn inode_capacity(&self) -> usize {
    self.inode_blocks * INODES_PER_BLOCK
  }

  /// Render the on-disk metadata as a report: superblock fields, then
  /// every valid inode's size and populated pointers. Read-only.
  pub fn dump(&self) -> String {
    let mut out = String::new();
    get_block_cache(0, self.block_dev.clone())
      .lock()
      .read(0, |super_blk: &SuperBlock| {
        let _ = writeln!(out, "superblock:");
        let _ = writeln!(
          out,
          "    magic number is {}",
          if super_blk.is_valid() { "valid" } else { "invalid" }
        );
        let _ = writeln!(out, "    {} blocks", super_blk.total_blocks);
        let _ = writeln!(out, "    {} inode blocks", super_blk.inode_blocks);
        let _ = writeln!(out, "    {} inodes", super_blk.inodes);
      });

    for table_idx in 0..self.inode_blocks {
      get_block_cache(1 + table_idx, self.block_dev.clone())
        .lock()
        .read(0, |inode_blk: &InodeBlock| {
          for (slot, disk_inode) in inode_blk.iter().enumerate() {
            if !disk_inode.is_valid() {
              continue;
            }
            let inumber = table_idx * INODES_PER_BLOCK + slot;
            let _ = writeln!(out, "inode {}:", inumber);
            let _ = writeln!(out, "    size {} bytes", disk_inode.size);
            let _ = write!(out, "    direct blocks:");
            for &ptr in disk_inode.direct.iter() {
              if ptr != NO_BLOCK {
                let _ = write!(out, " {} ", ptr);
              }
            }
            let _ = writeln!(out);
            if disk_inode.indirect != NO_BLOCK {
              let _ = writeln!(out, "    indirect block: {}", disk_inode.indirect);
              let _ = write!(out, "    indirect data blocks:");
              if (disk_inode.indirect as usize) < self.total_blocks {
                get_block_cache(disk_inode.indirect as usize, self.block_dev.clone())
                  .lock()
                  .read(0, |indirect: &IndirectBlock| {
                    for &ptr in indirect.iter() {
                      if ptr != NO_BLOCK && (ptr as usize) < self.total_blocks {
                        let _ = write!(out, " {} ", ptr);
                      }
                    }
                  });
              }
              let _ = writeln!(out);
            }
          }
        });
    }
    out
  }
}
