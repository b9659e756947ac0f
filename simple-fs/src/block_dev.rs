use core::any::Any;

/// Interface the filesystem needs from the underlying device
pub trait BlockDevice: Send + Sync + Any {
  /// read one block's bytes at `block_id` into `buf`
  fn read_block(&self, block_id: usize, buf: &mut [u8]);

  /// write one block's bytes back to `block_id`, durable on return
  fn write_block(&self, block_id: usize, buf: &[u8]);

  /// total addressable blocks on the device
  fn num_blocks(&self) -> usize;
}
