//! Gorilla delta-of-delta timestamp and XOR value compression on top of a
//! [`Segment`]'s bit-packed block chain.

use std::sync::Arc;

use crate::block::Address;
use crate::error::Error;
use crate::metrics::EncoderMetrics;
use crate::segment::Segment;

/// Number of bits used to store the first sample's timestamp delta from
/// `segment_time`. 14 bits covers a two-hour segment at one-second
/// granularity (2 * 60 * 60 = 7200 < 2^14).
const FIRST_DELTA_BITS: u32 = 14;

/// The 13 least-significant mantissa bits cleared in lossy mode.
const LOSSY_MANTISSA_MASK: u64 = (1 << 13) - 1;

/// Encodes and decodes `(timestamp, value)` pairs onto a single [`Segment`].
///
/// An `Encoder` is single-writer, single-reader: it is either in write mode
/// (after [`crate::factory::EncoderFactory::create_segment`] or
/// [`crate::factory::EncoderFactory::open_segment`]) or read mode (after a
/// call to [`Encoder::read`]/[`Encoder::read_and_dedupe`] resets the
/// cursor); see the segment's own mode machine.
pub struct Encoder {
	segment: Segment,
	metrics: Arc<dyn EncoderMetrics>,
}

impl Encoder {
	pub(crate) fn new(segment: Segment, metrics: Arc<dyn EncoderMetrics>) -> Encoder {
		Encoder { segment, metrics }
	}

	/// Toggles lossy mantissa masking for this segment. Builder-style, for
	/// use immediately after construction by [`crate::factory::EncoderFactory`].
	pub fn with_lossy(mut self, lossy: bool) -> Encoder {
		self.segment.set_lossy(lossy);
		self
	}

	pub fn addr(&self) -> Address {
		self.segment.addr()
	}

	pub fn segment_time(&self) -> i32 {
		self.segment.segment_time()
	}

	pub fn num_data_points(&self) -> u16 {
		self.segment.num_data_points()
	}

	pub fn is_dirty(&self) -> bool {
		self.segment.is_dirty()
	}

	pub fn has_dupes_or_out_of_order(&self) -> bool {
		self.segment.has_dupes_or_out_of_order()
	}

	pub fn mark_flushed(&self) {
		self.segment.mark_flushed();
	}

	/// Persists the in-memory write cursor into the header so a later
	/// `open_segment` resumes exactly where this session left off.
	pub fn update_header(&self) {
		self.segment.update_header();
	}

	/// Consumes the encoder, releasing every block in its chain back to the
	/// pool.
	pub fn free(self) {
		self.segment.free();
	}

	pub fn serialization_length(&self) -> usize {
		self.segment.serialization_length()
	}

	pub fn serialize(&self, buf: &mut [u8], offset: usize, length: usize) -> Result<usize, Error> {
		self.segment.serialize(buf, offset, length)
	}

	/// Appends one `(timestamp, value)` pair, Gorilla-compressing it
	/// against the previously written point.
	pub fn add_data_point(&mut self, ts: i32, v: f64) -> Result<(), Error> {
		let mut raw = v.to_bits();
		if self.segment.is_lossy() {
			raw &= !LOSSY_MANTISSA_MASK;
		}

		let checkpoint = self.segment.checkpoint();

		let result = if self.segment.num_data_points() == 0 {
			let delta = (ts as i64 - self.segment.segment_time() as i64) as i64;
			self.segment
				.write_data(delta as u64, FIRST_DELTA_BITS)
				.and_then(|()| self.segment.write_data(raw, 64))
				.map(|()| {
					self.segment.set_last_timestamp(ts);
					self.segment.set_last_value(raw);
					self.segment.set_last_delta(delta as i16);
					self.segment.set_window(0, 0, false);
					self.segment.set_num_data_points(1);
				})
		} else {
			let prev_t = self.segment.last_timestamp();
			let out_of_order = ts <= prev_t;

			let prev_delta = self.segment.last_delta() as i64;
			let delta = ts as i64 - prev_t as i64;
			let dod = delta - prev_delta;
			let xor = raw ^ self.segment.last_value();
			self.encode_dod(dod as i32).and_then(|()| self.encode_value(xor, raw)).map(|()| {
				if out_of_order {
					self.segment.set_out_of_order();
					self.metrics.record_out_of_order();
				}
				self.segment.set_last_timestamp(ts);
				self.segment.set_last_delta(delta as i16);
				self.segment.increment_num_data_points();
			})
		};

		// A sample that didn't make it to completion must leave no trace: an
		// allocation failure can land partway through a value's bits, and
		// nothing above rolls back bits already written by the same sample's
		// earlier, individually-successful `write_data` calls.
		if result.is_err() {
			self.segment.rollback(checkpoint);
		}

		match &result {
			Err(Error::AllocationFailed) => self.metrics.record_allocation_failure(),
			Err(_) => {}
			Ok(()) => self.metrics.record_points_written(1),
		}
		result
	}

	fn encode_dod(&mut self, dod: i32) -> Result<(), Error> {
		if dod == 0 {
			self.segment.write_data(0, 1)
		} else if (-63..=64).contains(&dod) {
			self.segment.write_data(0b10, 2)?;
			self.segment.write_data(dod as i64 as u64, 7)
		} else if (-255..=256).contains(&dod) {
			self.segment.write_data(0b110, 3)?;
			self.segment.write_data(dod as i64 as u64, 9)
		} else if (-2047..=2048).contains(&dod) {
			self.segment.write_data(0b1110, 4)?;
			self.segment.write_data(dod as i64 as u64, 12)
		} else {
			self.segment.write_data(0b1111, 4)?;
			self.segment.write_data(dod as u32 as u64, 32)
		}
	}

	fn encode_value(&mut self, xor: u64, raw: u64) -> Result<(), Error> {
		if xor == 0 {
			self.segment.write_data(0, 1)?;
		} else {
			self.segment.write_data(1, 1)?;

			// Clamped to fit the 5-bit wire field; any extra leading zeros
			// just widen the emitted meaningful-bit span.
			let lz = xor.leading_zeros().min(31);
			let tz = xor.trailing_zeros();
			let prev_lz = self.segment.last_leading_zeros();
			let prev_tz = self.segment.last_trailing_zeros();

			if self.segment.has_window() && lz >= prev_lz && tz >= prev_tz {
				self.segment.write_data(0, 1)?;
				let meaningful_bits = 64 - prev_lz - prev_tz;
				let meaningful_value = (xor >> prev_tz) & mask64(meaningful_bits);
				self.segment.write_data(meaningful_value, meaningful_bits)?;
			} else {
				self.segment.write_data(1, 1)?;
				let meaningful_bits = 64 - lz - tz;
				self.segment.write_data(lz as u64, 5)?;
				self.segment.write_data((meaningful_bits - 1) as u64, 6)?;
				let meaningful_value = (xor >> tz) & mask64(meaningful_bits);
				self.segment.write_data(meaningful_value, meaningful_bits)?;
				self.segment.set_window(lz, tz, true);
			}
		}
		self.segment.set_last_value(raw);
		Ok(())
	}

	/// Replays every written sample in emission order, calling `consumer`
	/// with each `(timestamp, value)` pair. Switches the segment into read
	/// mode (via [`Segment::reset_cursor`]); a subsequent `add_data_point`
	/// would fail until the segment is reopened.
	pub fn read(&mut self, mut consumer: impl FnMut(i32, f64)) -> Result<(), Error> {
		let n = self.segment.num_data_points();
		self.segment.reset_cursor();
		if n == 0 {
			return Ok(());
		}

		let t0 = self.segment.segment_time();
		let first_delta = self.segment.read_data(FIRST_DELTA_BITS)? as i32;
		let mut prev_t = t0.wrapping_add(first_delta);
		let mut prev_delta = first_delta;
		let mut prev_value = self.segment.read_data(64)?;
		consumer(prev_t, f64::from_bits(prev_value));

		let mut prev_lz = 0u32;
		let mut prev_tz = 0u32;

		for _ in 1..n {
			let dod = self.decode_dod()?;
			let delta = prev_delta.wrapping_add(dod);
			let t = prev_t.wrapping_add(delta);

			let changed = self.segment.read_data(1)?;
			let value = if changed == 0 {
				prev_value
			} else {
				let new_window = self.segment.read_data(1)?;
				if new_window == 0 {
					let meaningful_bits = 64 - prev_lz - prev_tz;
					let meaningful_value = self.segment.read_data(meaningful_bits)?;
					prev_value ^ (meaningful_value << prev_tz)
				} else {
					let lz = self.segment.read_data(5)? as u32;
					let meaningful_bits = self.segment.read_data(6)? as u32 + 1;
					let tz = 64 - lz - meaningful_bits;
					let meaningful_value = self.segment.read_data(meaningful_bits)?;
					prev_lz = lz;
					prev_tz = tz;
					prev_value ^ (meaningful_value << tz)
				}
			};

			consumer(t, f64::from_bits(value));
			prev_t = t;
			prev_delta = delta;
			prev_value = value;
		}
		Ok(())
	}

	fn decode_dod(&mut self) -> Result<i32, Error> {
		if self.segment.read_data(1)? == 0 {
			return Ok(0);
		}
		if self.segment.read_data(1)? == 0 {
			let v = self.segment.read_data(7)?;
			return Ok(sign_extend(v, 7));
		}
		if self.segment.read_data(1)? == 0 {
			let v = self.segment.read_data(9)?;
			return Ok(sign_extend(v, 9));
		}
		if self.segment.read_data(1)? == 0 {
			let v = self.segment.read_data(12)?;
			return Ok(sign_extend(v, 12));
		}
		let v = self.segment.read_data(32)?;
		Ok(v as u32 as i32)
	}

	/// Replays the full sample sequence and writes each decoded value into
	/// `buf[timestamp - segment_time]`, last-writer-wins. Requires
	/// `buf.len()` to cover the segment's full time window (e.g. 7200 for a
	/// two-hour, one-second-granularity segment). Returns the number of
	/// distinct slots written.
	pub fn read_and_dedupe(&mut self, buf: &mut [f64]) -> Result<usize, Error> {
		let t0 = self.segment.segment_time();
		let mut seen = vec![false; buf.len()];
		let mut count = 0usize;
		self.read(|t, v| {
			let idx = (t - t0) as isize;
			if idx >= 0 && (idx as usize) < buf.len() {
				let idx = idx as usize;
				if !seen[idx] {
					seen[idx] = true;
					count += 1;
				}
				buf[idx] = v;
			}
		})?;
		Ok(count)
	}
}

#[inline]
fn mask64(n: u32) -> u64 {
	if n >= 64 {
		u64::MAX
	} else {
		(1u64 << n) - 1
	}
}

/// Sign-extends the low `bits` of `v` (already zero-extended by
/// `read_data`) to a full `i32`.
fn sign_extend(v: u64, bits: u32) -> i32 {
	let shift = 32 - bits;
	(((v as u32) << shift) as i32) >> shift
}
