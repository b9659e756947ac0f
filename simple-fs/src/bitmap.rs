use alloc::vec;
use alloc::vec::Vec;

/// In-memory free map, one bit per block or per inode.
///
/// Never persisted: the mounted volume rebuilds both of its bitmaps from
/// the inode table on every mount, so on-disk metadata is the only truth.
pub struct Bitmap {
  bits: Vec<u64>,
  len: usize,
}

fn decompose(bit: usize) -> (usize, usize) {
  (bit / 64, bit % 64)
}

impl Bitmap {
  /// A new all-clear bitmap covering `len` bits
  pub fn new(len: usize) -> Self {
    Self {
      bits: vec![0u64; (len + 63) / 64],
      len,
    }
  }

  /// First-fit: mark and return the lowest clear bit, None when full
  pub fn alloc(&mut self) -> Option<usize> {
    if let Some((word_pos, inner_pos)) =
      self.bits.iter()
      .enumerate()
      .find(|(_, word)| **word != u64::MAX)
      .map(|(idx, word)| (idx, word.trailing_ones() as usize)) {
      let bit = word_pos * 64 + inner_pos;
      if bit >= self.len {
        return None;
      }
      self.bits[word_pos] |= 1u64 << inner_pos;
      Some(bit)
    } else {
      None
    }
  }

  pub fn set(&mut self, bit: usize) {
    assert!(bit < self.len);
    let (word_pos, inner_pos) = decompose(bit);
    self.bits[word_pos] |= 1u64 << inner_pos;
  }

  /// Release `bit`; it must currently be marked used
  pub fn clear(&mut self, bit: usize) {
    assert!(bit < self.len);
    let (word_pos, inner_pos) = decompose(bit);
    assert_eq!(1, self.bits[word_pos] >> inner_pos & 1);
    self.bits[word_pos] ^= 1u64 << inner_pos;
  }

  pub fn get(&self, bit: usize) -> bool {
    if bit >= self.len {
      return false;
    }
    let (word_pos, inner_pos) = decompose(bit);
    self.bits[word_pos] >> inner_pos & 1 == 1
  }

  /// Number of bits currently marked used
  pub fn count_set(&self) -> usize {
    self.bits.iter().map(|word| word.count_ones() as usize).sum()
  }
}
