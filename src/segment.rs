//! The bit-packed block chain and header bookkeeping that an [`Encoder`]
//! compresses samples onto.
//!
//! A segment's header lives entirely in the first 40 bytes of its first
//! block; the payload bitstream starts at bit 320 of that same block and
//! continues, 8 bytes of next-pointer skipped per block, into however many
//! further blocks the session has needed.
//!
//! [`Encoder`]: crate::encoder::Encoder

use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;

use crate::block::{Address, BlockPool};
use crate::error::Error;
use crate::{GORILLA_LOSSLESS_SECONDS, GORILLA_LOSSY_SECONDS};

pub(crate) const HEADER_LEN: usize = 40;
pub(crate) const HEADER_BITS: u32 = (HEADER_LEN * 8) as u32;

const OFF_SEGMENT_TIME: usize = 8;
const OFF_CURRENT_BLOCK: usize = 12;
const OFF_LAST_TIMESTAMP: usize = 20;
const OFF_LAST_VALUE: usize = 24;
const OFF_NUM_POINTS: usize = 32;
const OFF_BIT_INDEX: usize = 34;
const OFF_LAST_DELTA: usize = 36;
const OFF_LZ_FLAGS: usize = 38;
const OFF_TZ_FLAGS: usize = 39;

const DIRTY_BIT: u8 = 0x80;
const HAS_WINDOW_BIT: u8 = 0x40;
const ZERO_COUNT_MASK: u8 = 0x3F;
const OOO_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
	Write,
	Read,
}

/// A restore point for the write cursor and dirty flag, taken before a
/// sample's encode sequence begins. If any `write_data` call in that
/// sequence fails partway through, [`Segment::rollback`] undoes everything
/// written since, so the sample leaves no trace in the bitstream.
pub(crate) struct WriteCheckpoint {
	current_block: Address,
	bit_index: u32,
	dirty: bool,
}

/// A segment's bit-packed block chain, bound to a single [`BlockPool`].
///
/// Crate-internal: external callers only ever see a [`crate::encoder::Encoder`],
/// which wires up a `Segment` for them via [`crate::factory::EncoderFactory`].
pub(crate) struct Segment {
	pool: Arc<BlockPool>,
	addr: Address,
	current_block: Address,
	bit_index: u32,
	mode: Mode,
	lossy: bool,
}

#[inline]
fn mask64(n: u32) -> u64 {
	if n >= 64 {
		u64::MAX
	} else {
		(1u64 << n) - 1
	}
}

impl Segment {
	pub(crate) fn create(pool: Arc<BlockPool>, segment_time: i32) -> Result<Segment, Error> {
		let addr = pool.malloc()?;
		let seg = Segment {
			pool,
			addr,
			current_block: addr,
			bit_index: HEADER_BITS,
			mode: Mode::Write,
			lossy: false,
		};
		seg.set_segment_time(segment_time);
		seg.set_current_block_header(addr);
		seg.set_last_timestamp(segment_time);
		seg.set_header_bit_index(HEADER_BITS);
		Ok(seg)
	}

	pub(crate) fn open(pool: Arc<BlockPool>, addr: Address) -> Result<Segment, Error> {
		let mut seg = Segment {
			pool,
			addr,
			current_block: addr,
			bit_index: 0,
			mode: Mode::Write,
			lossy: false,
		};
		seg.current_block = seg.current_block_header();
		seg.bit_index = seg.header_bit_index();
		Ok(seg)
	}

	pub(crate) fn addr(&self) -> Address {
		self.addr
	}

	pub(crate) fn set_lossy(&mut self, lossy: bool) {
		self.lossy = lossy;
	}

	pub(crate) fn is_lossy(&self) -> bool {
		self.lossy
	}

	// ── header field access ────────────────────────────────────────────

	fn read_u64(&self, offset: usize) -> u64 {
		let mut b = [0u8; 8];
		self.pool.get_bytes(self.addr, offset, &mut b);
		BigEndian::read_u64(&b)
	}

	fn write_u64(&self, offset: usize, v: u64) {
		let mut b = [0u8; 8];
		BigEndian::write_u64(&mut b, v);
		self.pool.set_bytes(self.addr, offset, &b);
	}

	fn read_u32(&self, offset: usize) -> u32 {
		let mut b = [0u8; 4];
		self.pool.get_bytes(self.addr, offset, &mut b);
		BigEndian::read_u32(&b)
	}

	fn write_u32(&self, offset: usize, v: u32) {
		let mut b = [0u8; 4];
		BigEndian::write_u32(&mut b, v);
		self.pool.set_bytes(self.addr, offset, &b);
	}

	fn read_u16(&self, offset: usize) -> u16 {
		let mut b = [0u8; 2];
		self.pool.get_bytes(self.addr, offset, &mut b);
		BigEndian::read_u16(&b)
	}

	fn write_u16(&self, offset: usize, v: u16) {
		let mut b = [0u8; 2];
		BigEndian::write_u16(&mut b, v);
		self.pool.set_bytes(self.addr, offset, &b);
	}

	fn read_u8(&self, offset: usize) -> u8 {
		let mut b = [0u8; 1];
		self.pool.get_bytes(self.addr, offset, &mut b);
		b[0]
	}

	fn write_u8(&self, offset: usize, v: u8) {
		self.pool.set_bytes(self.addr, offset, &[v]);
	}

	pub(crate) fn segment_time(&self) -> i32 {
		self.read_u32(OFF_SEGMENT_TIME) as i32
	}

	fn set_segment_time(&self, t: i32) {
		self.write_u32(OFF_SEGMENT_TIME, t as u32);
	}

	fn current_block_header(&self) -> Address {
		self.read_u64(OFF_CURRENT_BLOCK)
	}

	fn set_current_block_header(&self, addr: Address) {
		self.write_u64(OFF_CURRENT_BLOCK, addr);
	}

	pub(crate) fn last_timestamp(&self) -> i32 {
		self.read_u32(OFF_LAST_TIMESTAMP) as i32
	}

	pub(crate) fn set_last_timestamp(&self, ts: i32) {
		self.write_u32(OFF_LAST_TIMESTAMP, ts as u32);
	}

	pub(crate) fn last_value(&self) -> u64 {
		self.read_u64(OFF_LAST_VALUE)
	}

	pub(crate) fn set_last_value(&self, v: u64) {
		self.write_u64(OFF_LAST_VALUE, v);
	}

	pub(crate) fn num_data_points(&self) -> u16 {
		self.read_u16(OFF_NUM_POINTS)
	}

	pub(crate) fn set_num_data_points(&self, n: u16) {
		self.write_u16(OFF_NUM_POINTS, n);
	}

	pub(crate) fn increment_num_data_points(&self) {
		let n = self.num_data_points();
		self.set_num_data_points(n + 1);
	}

	fn header_bit_index(&self) -> u32 {
		self.read_u16(OFF_BIT_INDEX) as u32
	}

	fn set_header_bit_index(&self, bit_index: u32) {
		self.write_u16(OFF_BIT_INDEX, bit_index as u16);
	}

	pub(crate) fn last_delta(&self) -> i16 {
		self.read_u16(OFF_LAST_DELTA) as i16
	}

	pub(crate) fn set_last_delta(&self, delta: i16) {
		self.write_u16(OFF_LAST_DELTA, delta as u16);
	}

	pub(crate) fn last_leading_zeros(&self) -> u32 {
		(self.read_u8(OFF_LZ_FLAGS) & ZERO_COUNT_MASK) as u32
	}

	pub(crate) fn last_trailing_zeros(&self) -> u32 {
		(self.read_u8(OFF_TZ_FLAGS) & ZERO_COUNT_MASK) as u32
	}

	pub(crate) fn has_window(&self) -> bool {
		self.read_u8(OFF_LZ_FLAGS) & HAS_WINDOW_BIT != 0
	}

	/// Updates the carried XOR-window state (stored leading/trailing zero
	/// counts, plus the has-window flag), preserving the dirty and ooo bits
	/// that share these two bytes.
	pub(crate) fn set_window(&self, leading_zeros: u32, trailing_zeros: u32, has_window: bool) {
		let mut lz_byte = (leading_zeros as u8) & ZERO_COUNT_MASK;
		if has_window {
			lz_byte |= HAS_WINDOW_BIT;
		}
		if self.is_dirty() {
			lz_byte |= DIRTY_BIT;
		}
		self.write_u8(OFF_LZ_FLAGS, lz_byte);

		let mut tz_byte = (trailing_zeros as u8) & ZERO_COUNT_MASK;
		if self.has_dupes_or_out_of_order() {
			tz_byte |= OOO_BIT;
		}
		self.write_u8(OFF_TZ_FLAGS, tz_byte);
	}

	pub(crate) fn is_dirty(&self) -> bool {
		self.read_u8(OFF_LZ_FLAGS) & DIRTY_BIT != 0
	}

	fn mark_dirty(&self) {
		let b = self.read_u8(OFF_LZ_FLAGS) | DIRTY_BIT;
		self.write_u8(OFF_LZ_FLAGS, b);
	}

	pub(crate) fn mark_flushed(&self) {
		let b = self.read_u8(OFF_LZ_FLAGS) & !DIRTY_BIT;
		self.write_u8(OFF_LZ_FLAGS, b);
	}

	pub(crate) fn has_dupes_or_out_of_order(&self) -> bool {
		self.read_u8(OFF_TZ_FLAGS) & OOO_BIT != 0
	}

	pub(crate) fn set_out_of_order(&self) {
		let b = self.read_u8(OFF_TZ_FLAGS) | OOO_BIT;
		self.write_u8(OFF_TZ_FLAGS, b);
	}

	/// Persists the in-memory write cursor into block 0's header. The
	/// current-block pointer is already persisted the moment it changes
	/// (see [`Self::allocate_next_block`]); only `bit_index` is deliberately
	/// cached and flushed here on demand.
	pub(crate) fn update_header(&self) {
		self.set_header_bit_index(self.bit_index);
	}

	// ── bit-stream I/O ──────────────────────────────────────────────────

	fn block_bits(&self) -> u32 {
		(self.pool.block_size() * 8) as u32
	}

	fn allocate_next_block(&mut self) -> Result<(), Error> {
		let new_addr = self.pool.malloc()?;
		self.pool.set_word(self.current_block, 0, new_addr);
		self.current_block = new_addr;
		self.bit_index = 64;
		self.set_current_block_header(new_addr);
		Ok(())
	}

	/// Appends the low `n_bits` of `value`, MSB first, at the write cursor.
	pub(crate) fn write_data(&mut self, value: u64, n_bits: u32) -> Result<(), Error> {
		if self.mode != Mode::Write {
			return Err(Error::NotInWriteMode);
		}
		if n_bits == 0 || n_bits > 64 {
			return Err(Error::InvalidBitWidth(n_bits));
		}
		self.mark_dirty();

		let value = value & mask64(n_bits);
		let block_bits = self.block_bits();
		let mut remaining = n_bits;
		while remaining > 0 {
			if self.bit_index == block_bits {
				self.allocate_next_block()?;
			}
			let word_ix = (self.bit_index / 64) as usize;
			let bit_off = self.bit_index % 64;
			let space = 64 - bit_off;
			let take = remaining.min(space);

			let shift_from_value = remaining - take;
			let chunk = (value >> shift_from_value) & mask64(take);
			let shift_in_word = space - take;

			let word = self.pool.get_word(self.current_block, word_ix);
			self.pool
				.set_word(self.current_block, word_ix, word | (chunk << shift_in_word));

			self.bit_index += take;
			remaining -= take;
		}
		Ok(())
	}

	/// Captures the write cursor and dirty flag, for a later [`Self::rollback`]
	/// if the sample being encoded on top of this checkpoint doesn't make it
	/// to completion.
	pub(crate) fn checkpoint(&self) -> WriteCheckpoint {
		WriteCheckpoint {
			current_block: self.current_block,
			bit_index: self.bit_index,
			dirty: self.is_dirty(),
		}
	}

	/// Undoes every block allocated and bit written since `checkpoint`. Frees
	/// any newly allocated blocks (they come back pre-zeroed from the pool's
	/// next `malloc`), zeroes the bits the aborted attempt left behind in the
	/// retained block (a later `write_data` call ORs its bits in, so stray
	/// 1-bits from the aborted attempt would otherwise leak through), and
	/// restores the cursor and dirty flag to their pre-checkpoint values.
	pub(crate) fn rollback(&mut self, checkpoint: WriteCheckpoint) {
		let mut addr = self.pool.get_word(checkpoint.current_block, 0);
		while addr != 0 {
			let next = self.pool.get_word(addr, 0);
			self.pool.free(addr);
			addr = next;
		}
		self.pool.set_word(checkpoint.current_block, 0, 0);
		self.clear_tail_bits(checkpoint.current_block, checkpoint.bit_index);

		self.current_block = checkpoint.current_block;
		self.bit_index = checkpoint.bit_index;
		self.set_current_block_header(checkpoint.current_block);
		if !checkpoint.dirty {
			self.mark_flushed();
		}
	}

	/// Zeroes every bit of `addr` from `from_bit` to the end of the block.
	fn clear_tail_bits(&self, addr: Address, from_bit: u32) {
		let block_bits = self.block_bits();
		let mut bit = from_bit;
		while bit < block_bits {
			let word_ix = (bit / 64) as usize;
			let bit_off = bit % 64;
			let space = 64 - bit_off;
			let word = self.pool.get_word(addr, word_ix);
			self.pool.set_word(addr, word_ix, word & !mask64(space));
			bit += space;
		}
	}

	/// Consumes `n_bits` from the read cursor, MSB first, zero-extended.
	pub(crate) fn read_data(&mut self, n_bits: u32) -> Result<u64, Error> {
		if self.mode != Mode::Read {
			return Err(Error::NotInReadMode);
		}
		if n_bits > 64 {
			return Err(Error::InvalidBitWidth(n_bits));
		}
		if n_bits == 0 {
			return Ok(0);
		}

		let block_bits = self.block_bits();
		let mut remaining = n_bits;
		let mut result: u64 = 0;
		while remaining > 0 {
			if self.bit_index == block_bits {
				let next = self.pool.get_word(self.current_block, 0);
				if next == 0 {
					return Err(Error::UnexpectedEndOfStream);
				}
				self.current_block = next;
				self.bit_index = 64;
			}
			let word_ix = (self.bit_index / 64) as usize;
			let bit_off = self.bit_index % 64;
			let space = 64 - bit_off;
			let take = remaining.min(space);

			let word = self.pool.get_word(self.current_block, word_ix);
			let shift_in_word = space - take;
			let chunk = (word >> shift_in_word) & mask64(take);

			result = if take == 64 { chunk } else { (result << take) | chunk };
			self.bit_index += take;
			remaining -= take;
		}
		Ok(result)
	}

	/// Rebinds the cursor to the start of the payload and enters read mode.
	pub(crate) fn reset_cursor(&mut self) {
		self.current_block = self.addr;
		self.bit_index = HEADER_BITS;
		self.mode = Mode::Read;
	}

	/// Equivalent to [`Self::reset_cursor`]; kept as a distinct named
	/// operation for parity with the external operation list, where some
	/// callers conceptually distinguish "rewind to re-read" from "switch
	/// to read mode".
	pub(crate) fn reset(&mut self) {
		self.reset_cursor();
	}

	/// Walks the block chain from block 0, freeing every block.
	pub(crate) fn free(self) {
		let mut addr = self.addr;
		loop {
			let next = self.pool.get_word(addr, 0);
			self.pool.free(addr);
			if next == 0 {
				break;
			}
			addr = next;
		}
	}

	/// Returns, in chain order, `(block address, payload byte offset,
	/// payload byte length)` for every block currently holding written
	/// data. Used by both `serialization_length` and `serialize` so they
	/// agree by construction.
	fn payload_chunks(&self) -> Vec<(Address, usize, usize)> {
		// Use the live cursor fields, not the persisted header (bytes 12/34),
		// which only reflect the last `update_header()` call and would make
		// this under-report the payload for every write since.
		let tail = self.current_block;
		let tail_bit_index = self.bit_index;
		let block_size = self.pool.block_size();

		let mut chunks = Vec::new();
		let mut addr = self.addr;
		let mut header_bits = HEADER_BITS;
		loop {
			let payload_offset = (header_bits / 8) as usize;
			if addr == tail {
				let used_bits = tail_bit_index.saturating_sub(header_bits);
				let len = ((used_bits + 7) / 8) as usize;
				chunks.push((addr, payload_offset, len));
				break;
			}
			let len = block_size - payload_offset;
			chunks.push((addr, payload_offset, len));
			addr = self.pool.get_word(addr, 0);
			header_bits = 64;
		}
		chunks
	}

	/// The number of bytes `serialize` would write given a buffer large
	/// enough to hold all of them. Never mutates the segment.
	pub(crate) fn serialization_length(&self) -> usize {
		let n = self.num_data_points();
		let count_len = if n <= 127 { 1 } else { 2 };
		let payload: usize = self.payload_chunks().iter().map(|(_, _, len)| *len).sum();
		1 + count_len + payload
	}

	/// Copies the serialized representation of this segment into
	/// `buf[offset..offset+length]`, writing at most `length` bytes and
	/// returning the number actually written. `offset + length` must fit in
	/// `buf`, or this returns [`Error::BufferTooSmall`]. A `length` smaller
	/// than [`Self::serialization_length`] is documented truncation, not an
	/// error.
	pub(crate) fn serialize(&self, buf: &mut [u8], offset: usize, length: usize) -> Result<usize, Error> {
		offset
			.checked_add(length)
			.filter(|&end| end <= buf.len())
			.ok_or(Error::BufferTooSmall {
				needed: offset + length,
				available: buf.len(),
			})?;

		let n = self.num_data_points();
		let mut out = Vec::with_capacity(self.serialization_length());
		out.push(if self.lossy {
			GORILLA_LOSSY_SECONDS
		} else {
			GORILLA_LOSSLESS_SECONDS
		});
		if n <= 127 {
			out.push(n as u8);
		} else {
			out.push(((n >> 8) as u8) | 0x80);
			out.push((n & 0xFF) as u8);
		}
		let mut tmp = vec![0u8; self.pool.block_size()];
		for (addr, payload_offset, len) in self.payload_chunks() {
			self.pool.get_bytes(addr, payload_offset, &mut tmp[..len]);
			out.extend_from_slice(&tmp[..len]);
		}

		let to_write = length.min(out.len());
		buf[offset..offset + to_write].copy_from_slice(&out[..to_write]);
		Ok(to_write)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::block::DEFAULT_BLOCK_SIZE;

	fn pool() -> Arc<BlockPool> {
		Arc::new(BlockPool::new(DEFAULT_BLOCK_SIZE))
	}

	#[test]
	fn create_starts_clean() {
		let p = pool();
		let seg = Segment::create(p, 1_600_000_000).unwrap();
		assert_eq!(seg.segment_time(), 1_600_000_000);
		assert_eq!(seg.num_data_points(), 0);
		assert!(!seg.is_dirty());
		assert!(!seg.has_dupes_or_out_of_order());
		assert_eq!(seg.serialization_length(), 2);
	}

	#[test]
	fn write_then_read_roundtrips_arbitrary_widths() {
		let p = pool();
		let mut seg = Segment::create(p, 0).unwrap();
		let widths_and_values: &[(u32, u64)] = &[
			(1, 1),
			(7, 0x5A),
			(14, 0x1FFF),
			(32, 0xDEAD_BEEF),
			(64, 0x0123_4567_89AB_CDEF),
			(9, 0x1AA),
		];
		for &(w, v) in widths_and_values {
			seg.write_data(v, w).unwrap();
		}
		seg.update_header();
		seg.reset_cursor();
		for &(w, v) in widths_and_values {
			assert_eq!(seg.read_data(w).unwrap(), v & mask64(w));
		}
		seg.free();
	}

	#[test]
	fn write_crosses_many_block_boundaries() {
		let p = pool();
		let mut seg = Segment::create(p.clone(), 0).unwrap();
		let before = p.outstanding_blocks();
		let mut values = Vec::new();
		for i in 0u64..500 {
			let v = i.wrapping_mul(0x9E37_79B9);
			seg.write_data(v, 37).unwrap();
			values.push(v & mask64(37));
		}
		assert!(p.outstanding_blocks() > before + 1, "should have allocated extra blocks");
		seg.update_header();
		seg.reset_cursor();
		for v in values {
			assert_eq!(seg.read_data(37).unwrap(), v);
		}
		seg.free();
		assert_eq!(p.outstanding_blocks(), 0);
	}

	#[test]
	fn read_before_reset_cursor_fails() {
		let p = pool();
		let mut seg = Segment::create(p, 0).unwrap();
		seg.write_data(1, 1).unwrap();
		assert!(matches!(seg.read_data(1), Err(Error::NotInReadMode)));
	}

	#[test]
	fn write_after_reset_cursor_fails() {
		let p = pool();
		let mut seg = Segment::create(p, 0).unwrap();
		seg.reset_cursor();
		assert!(matches!(seg.write_data(1, 1), Err(Error::NotInWriteMode)));
	}

	#[test]
	fn dirty_and_flush_cycle() {
		let p = pool();
		let mut seg = Segment::create(p, 0).unwrap();
		assert!(!seg.is_dirty());
		seg.write_data(1, 1).unwrap();
		assert!(seg.is_dirty());
		seg.mark_flushed();
		assert!(!seg.is_dirty());
		seg.write_data(1, 1).unwrap();
		assert!(seg.is_dirty());
	}

	#[test]
	fn reopen_restores_cursor_and_flags() {
		let p = pool();
		let mut seg = Segment::create(p.clone(), 42).unwrap();
		seg.write_data(0xABCD, 16).unwrap();
		seg.set_out_of_order();
		seg.update_header();
		let addr = seg.addr();

		let mut reopened = Segment::open(p, addr).unwrap();
		assert!(reopened.has_dupes_or_out_of_order());
		reopened.reset_cursor();
		assert_eq!(reopened.read_data(16).unwrap(), 0xABCD);
	}

	#[test]
	fn serialize_reflects_writes_without_requiring_update_header() {
		let p = pool();
		let mut seg = Segment::create(p, 1_000).unwrap();
		for i in 0..50u64 {
			seg.write_data(i.wrapping_mul(0x1234_5678), 37).unwrap();
		}
		// Deliberately no `update_header()` call before serializing.
		let expected_payload_bits = 37 * 50;
		let expected_len = 1 + 1 + ((expected_payload_bits + 7) / 8) as usize;
		assert_eq!(seg.serialization_length(), expected_len);

		let mut buf = vec![0u8; expected_len + 16];
		let written = seg.serialize(&mut buf, 0, buf.len()).unwrap();
		assert_eq!(written, expected_len, "serialize must agree with serialization_length even without update_header");
	}

	#[test]
	fn rollback_restores_cursor_frees_new_blocks_and_erases_partial_bits() {
		// A 64-byte block leaves little payload room, so a handful of wide
		// writes reliably force a block-boundary crossing.
		let p = Arc::new(BlockPool::new(64));
		let mut seg = Segment::create(p.clone(), 0).unwrap();
		seg.write_data(0x1, 4).unwrap();

		let checkpoint = seg.checkpoint();
		let blocks_before = p.outstanding_blocks();
		let cursor_before = (seg.current_block, seg.bit_index);

		// Simulate a sample that wrote some bits, crossed into a new block,
		// and then (conceptually) failed: roll it back without ever letting
		// the caller see the new block or its bits.
		seg.write_data(0xFFFF_FFFF_FFFF_FFFF, 64).unwrap();
		seg.write_data(0xFFFF_FFFF_FFFF_FFFF, 64).unwrap();
		seg.write_data(0xFFFF_FFFF_FFFF_FFFF, 64).unwrap();
		assert!(p.outstanding_blocks() > blocks_before, "the simulated sample should have grown the chain");

		seg.rollback(checkpoint);
		assert_eq!((seg.current_block, seg.bit_index), cursor_before);
		assert_eq!(p.outstanding_blocks(), blocks_before, "blocks allocated since the checkpoint must be freed");

		// A fresh write at the restored cursor must not OR stray bits left
		// behind by the rolled-back attempt.
		seg.write_data(0x0, 4).unwrap();
		seg.update_header();
		seg.reset_cursor();
		assert_eq!(seg.read_data(4).unwrap(), 0x1);
		assert_eq!(seg.read_data(4).unwrap(), 0x0);
		seg.free();
	}
}
