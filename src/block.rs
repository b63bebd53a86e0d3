//! A pool of fixed-size, zero-initialized memory blocks addressed by an
//! opaque handle. Segments build their chains out of these.

use antidote::Mutex;
use byteorder::{BigEndian, ByteOrder};

use crate::error::Error;

/// The minimum usable block size: enough to hold the segment header (40
/// bytes) plus at least a handful of payload bytes.
const MIN_BLOCK_SIZE: usize = 48;

/// Default block size used by [`crate::factory::EncoderFactory`] when the
/// caller doesn't pick one.
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// An opaque handle to a block. `0` is never returned by `malloc` and is
/// used internally to mean "no block" (e.g. the terminal next-pointer).
pub type Address = u64;

struct Inner {
	blocks: Vec<Option<Box<[u8]>>>,
	free_list: Vec<usize>,
	outstanding: usize,
}

/// Thread-safe allocator of fixed-size blocks. `malloc`/`free` may be called
/// from any thread; the contents of a block already handed out are not
/// further synchronized, which is fine because a segment's block chain is
/// owned by a single writer or reader at a time.
///
/// Constructed directly by callers and then handed to
/// [`crate::factory::EncoderFactory::new`] alongside a [`crate::Collector`];
/// the accessors below (`malloc`/`free`/byte and word get/set) are only
/// ever exercised by [`crate::segment::Segment`], not by external callers.
pub struct BlockPool {
	block_size: usize,
	max_blocks: Option<usize>,
	inner: Mutex<Inner>,
}

impl BlockPool {
	/// Creates a new pool with no cap on the number of outstanding blocks.
	/// `block_size` must be a power of two, a multiple of 8, and large
	/// enough to hold the segment header.
	pub fn new(block_size: usize) -> BlockPool {
		Self::with_max_blocks(block_size, None)
	}

	/// Creates a pool that returns [`Error::AllocationFailed`] from
	/// `malloc` once `max_blocks` blocks are outstanding simultaneously.
	/// Mainly useful for exercising allocation-failure handling in tests;
	/// a real off-heap allocator fails the same way when the underlying
	/// system allocator returns null.
	pub fn bounded(block_size: usize, max_blocks: usize) -> BlockPool {
		Self::with_max_blocks(block_size, Some(max_blocks))
	}

	fn with_max_blocks(block_size: usize, max_blocks: Option<usize>) -> BlockPool {
		assert!(block_size >= MIN_BLOCK_SIZE, "block_size too small");
		assert!(block_size.is_power_of_two(), "block_size must be a power of two");
		assert_eq!(block_size % 8, 0, "block_size must be a multiple of 8");

		BlockPool {
			block_size,
			max_blocks,
			inner: Mutex::new(Inner {
				blocks: Vec::new(),
				free_list: Vec::new(),
				outstanding: 0,
			}),
		}
	}

	pub fn block_size(&self) -> usize {
		self.block_size
	}

	/// Number of blocks currently handed out (not yet freed).
	pub fn outstanding_blocks(&self) -> usize {
		self.inner.lock().outstanding
	}

	/// Allocates a zero-initialized block, returning its address.
	pub fn malloc(&self) -> Result<Address, Error> {
		let mut inner = self.inner.lock();
		if let Some(max) = self.max_blocks {
			if inner.outstanding >= max {
				return Err(Error::AllocationFailed);
			}
		}
		let index = if let Some(index) = inner.free_list.pop() {
			inner.blocks[index] = Some(vec![0u8; self.block_size].into_boxed_slice());
			index
		} else {
			let index = inner.blocks.len();
			inner.blocks.push(Some(vec![0u8; self.block_size].into_boxed_slice()));
			index
		};
		inner.outstanding += 1;
		Ok((index + 1) as Address)
	}

	/// Returns a block to the pool. Double-frees and frees of address `0`
	/// are programmer errors and panic in debug builds.
	pub fn free(&self, addr: Address) {
		debug_assert_ne!(addr, 0, "attempt to free the null address");
		let index = (addr - 1) as usize;
		let mut inner = self.inner.lock();
		debug_assert!(inner.blocks[index].is_some(), "double free of block {addr}");
		inner.blocks[index] = None;
		inner.free_list.push(index);
		inner.outstanding -= 1;
	}

	pub fn get_bytes(&self, addr: Address, offset: usize, out: &mut [u8]) {
		let inner = self.inner.lock();
		let block = self.block(&inner, addr);
		debug_assert!(offset + out.len() <= block.len());
		out.copy_from_slice(&block[offset..offset + out.len()]);
	}

	pub fn set_bytes(&self, addr: Address, offset: usize, data: &[u8]) {
		let mut inner = self.inner.lock();
		let block = self.block_mut(&mut inner, addr);
		debug_assert!(offset + data.len() <= block.len());
		block[offset..offset + data.len()].copy_from_slice(data);
	}

	/// Reads the big-endian 64-bit word at word index `word_ix` (i.e. byte
	/// offset `word_ix * 8`). Big-endian, rather than native-endian, so that
	/// the raw bytes `serialize` copies out of a block match the MSB-first
	/// bit order the Gorilla codec packs into each word, independent of the
	/// host's own endianness.
	pub fn get_word(&self, addr: Address, word_ix: usize) -> u64 {
		let inner = self.inner.lock();
		let block = self.block(&inner, addr);
		let offset = word_ix * 8;
		debug_assert!(offset + 8 <= block.len());
		BigEndian::read_u64(&block[offset..offset + 8])
	}

	pub fn set_word(&self, addr: Address, word_ix: usize, value: u64) {
		let mut inner = self.inner.lock();
		let block = self.block_mut(&mut inner, addr);
		let offset = word_ix * 8;
		debug_assert!(offset + 8 <= block.len());
		BigEndian::write_u64(&mut block[offset..offset + 8], value);
	}

	fn block<'a>(&self, inner: &'a Inner, addr: Address) -> &'a [u8] {
		let index = (addr - 1) as usize;
		inner.blocks[index].as_deref().expect("use of freed block")
	}

	fn block_mut<'a>(&self, inner: &'a mut Inner, addr: Address) -> &'a mut [u8] {
		let index = (addr - 1) as usize;
		inner.blocks[index].as_deref_mut().expect("use of freed block")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn malloc_is_zeroed_and_reusable() {
		let pool = BlockPool::new(DEFAULT_BLOCK_SIZE);
		let a = pool.malloc().unwrap();
		assert_eq!(pool.outstanding_blocks(), 1);
		let mut buf = [0xffu8; 8];
		pool.get_bytes(a, 0, &mut buf);
		assert_eq!(buf, [0u8; 8]);

		pool.free(a);
		assert_eq!(pool.outstanding_blocks(), 0);

		let b = pool.malloc().unwrap();
		assert_eq!(a, b, "freed block should be recycled");
		assert_eq!(pool.outstanding_blocks(), 1);
	}

	#[test]
	fn word_round_trip() {
		let pool = BlockPool::new(DEFAULT_BLOCK_SIZE);
		let a = pool.malloc().unwrap();
		pool.set_word(a, 1, 0x1122_3344_5566_7788);
		assert_eq!(pool.get_word(a, 1), 0x1122_3344_5566_7788);
	}

	#[test]
	fn bounded_pool_refuses_allocation_past_the_cap() {
		let pool = BlockPool::bounded(DEFAULT_BLOCK_SIZE, 1);
		let a = pool.malloc().unwrap();
		assert!(matches!(pool.malloc(), Err(crate::error::Error::AllocationFailed)));
		pool.free(a);
		pool.malloc().expect("freeing should make room again");
	}

	#[test]
	fn distinct_addresses_are_independent() {
		let pool = BlockPool::new(DEFAULT_BLOCK_SIZE);
		let a = pool.malloc().unwrap();
		let b = pool.malloc().unwrap();
		assert_ne!(a, b);
		pool.set_bytes(a, 0, &[1, 2, 3]);
		let mut buf = [0u8; 3];
		pool.get_bytes(b, 0, &mut buf);
		assert_eq!(buf, [0, 0, 0]);
	}
}
