//! A flat, inode-based filesystem over a fixed-size block device.
//!
//! There are no names or directories: a file is just an inumber handed out
//! by `create`, backed by 5 direct block pointers and one single-level
//! indirect block. Free space is never stored on disk; both bitmaps are
//! rebuilt from the inode table on every mount.
#![no_std]

extern crate alloc;

mod block_dev;
mod block_cache;
mod bitmap;
mod layout;
mod fs;
mod vfs;

pub use block_dev::BlockDevice;
pub use fs::SimpleFs;
pub use vfs::Inode;
pub use layout::{INODE_DIRECT_COUNT, INODES_PER_BLOCK, POINTERS_PER_BLOCK, MAX_FILE_BLOCKS};

pub const BLOCK_SZ: usize = 4096;
type DataBlock = [u8; BLOCK_SZ];
