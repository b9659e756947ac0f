//! On-disk layout: superblock, packed inode records, indirect pointer blocks.
use core::{fmt::{Debug, Formatter, Result}, mem::size_of, cmp::min};

use alloc::{sync::Arc, vec::Vec};

use crate::{BLOCK_SZ, block_dev::BlockDevice, block_cache::get_block_cache, DataBlock};

/// FileSystem Magic Number
pub const FS_MAGIC: u32 = 0xf0f03410;
/// Direct pointers per inode
pub const INODE_DIRECT_COUNT: usize = 5;
/// Packed inode records per inode-table block
pub const INODES_PER_BLOCK: usize = BLOCK_SZ / size_of::<DiskInode>();
/// Block addresses per indirect block
pub const POINTERS_PER_BLOCK: usize = BLOCK_SZ / size_of::<u32>();
/// Largest file, in blocks: direct pointers plus one indirect block
pub const MAX_FILE_BLOCKS: usize = INODE_DIRECT_COUNT + POINTERS_PER_BLOCK;

/// Address 0 holds the superblock, so a stored pointer of 0 always means
/// "unallocated". The allocator never hands out block 0.
pub const NO_BLOCK: u32 = 0;

/// Block that stores an indirect pointer array
pub type IndirectBlock = [u32; POINTERS_PER_BLOCK];
/// Block that stores packed inode records
pub type InodeBlock = [DiskInode; INODES_PER_BLOCK];

/// Super block of a filesystem, lives at block 0
#[repr(C)]
pub struct SuperBlock {
  magic: u32,
  pub total_blocks: u32,
  pub inode_blocks: u32,
  pub inodes: u32,
}

impl Debug for SuperBlock {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.debug_struct("SuperBlock")
      .field("total_blocks", &self.total_blocks)
      .field("inode_blocks", &self.inode_blocks)
      .field("inodes", &self.inodes)
      .finish()
  }
}

impl SuperBlock {
  pub fn new(total_blocks: u32, inode_blocks: u32, inodes: u32) -> Self {
    Self {
      magic: FS_MAGIC,
      total_blocks,
      inode_blocks,
      inodes,
    }
  }

  pub fn is_valid(&self) -> bool {
    self.magic == FS_MAGIC
  }
}

/// One packed 32-byte inode record
#[repr(C)]
pub struct DiskInode {
  valid: u32,
  /// file's total bytes
  pub size: u32,
  /// direct slot i addresses logical block i
  pub direct: [u32; INODE_DIRECT_COUNT],
  /// indirect slot j addresses logical block INODE_DIRECT_COUNT + j
  pub indirect: u32,
}

impl DiskInode {
  /// Turn this record into a fresh zero-length file
  pub fn initialize(&mut self) {
    self.valid = 1;
    self.size = 0;
    self.direct.iter_mut().for_each(|a| *a = NO_BLOCK);
    self.indirect = NO_BLOCK;
  }

  pub fn is_valid(&self) -> bool {
    self.valid != 0
  }

  /// physical block backing logical block `logical`, NO_BLOCK for a hole
  pub fn block_for(&self, logical: usize, block_dev: &Arc<dyn BlockDevice>) -> u32 {
    if logical < INODE_DIRECT_COUNT {
      self.direct[logical]
    } else if logical < MAX_FILE_BLOCKS {
      if self.indirect == NO_BLOCK {
        return NO_BLOCK;
      }
      get_block_cache(self.indirect as usize, block_dev.clone())
        .lock()
        .read(0, |indirect: &IndirectBlock| {
          indirect[logical - INODE_DIRECT_COUNT]
        })
    } else {
      NO_BLOCK
    }
  }

  /// read data from disk inode to `buf`, clamped to the file size
  pub fn read_at(&self, offset: usize, buf: &mut [u8], block_dev: &Arc<dyn BlockDevice>) -> usize {
    // [start, end)
    let mut start = offset;
    let end = min(self.size as usize, start + buf.len());
    if start >= end {
      return 0;
    }
    let mut start_block = start / BLOCK_SZ;
    let mut read_size = 0usize;
    loop {
      let cur_block_end = min(end, (start / BLOCK_SZ + 1) * BLOCK_SZ);
      let block_read_size = cur_block_end - start;
      let dst = &mut buf[read_size..read_size + block_read_size];
      let block_id = self.block_for(start_block, block_dev);
      if block_id == NO_BLOCK {
        // hole inside the sized range reads as zeroes
        dst.iter_mut().for_each(|byte| *byte = 0);
      } else {
        get_block_cache(block_id as usize, block_dev.clone())
          .lock()
          .read(0, |data: &DataBlock| {
            let begin = start % BLOCK_SZ;
            dst.copy_from_slice(&data[begin..begin + block_read_size]);
          });
      }
      read_size += block_read_size;
      start += block_read_size;
      start_block += 1;
      if end == cur_block_end {
        break;
      }
    }
    read_size
  }

  /// Wipe the record and return every block it was holding, the indirect
  /// block itself included, so the caller can release them.
  pub fn clear(&mut self, block_dev: &Arc<dyn BlockDevice>) -> Vec<u32> {
    let mut freed: Vec<u32> = Vec::new();
    for slot in self.direct.iter_mut() {
      if *slot != NO_BLOCK {
        freed.push(*slot);
        *slot = NO_BLOCK;
      }
    }
    if self.indirect != NO_BLOCK {
      get_block_cache(self.indirect as usize, block_dev.clone())
        .lock()
        .modify(0, |indirect: &mut IndirectBlock| {
          for slot in indirect.iter_mut() {
            if *slot != NO_BLOCK {
              freed.push(*slot);
              *slot = NO_BLOCK;
            }
          }
        });
      freed.push(self.indirect);
      self.indirect = NO_BLOCK;
    }
    self.size = 0;
    self.valid = 0;
    freed
  }
}
