//! Wires a [`BlockPool`], a [`Collector`], and an injected metrics sink
//! into ready-to-use [`Encoder`]s — the only public constructor path
//! external callers are expected to use. [`crate::segment::Segment`] and
//! [`BlockPool`] themselves are crate-internal.

use std::sync::Arc;

use crate::block::{Address, BlockPool};
use crate::collector::Collector;
use crate::encoder::Encoder;
use crate::error::Error;
use crate::metrics::{EncoderMetrics, NullMetrics};
use crate::segment::Segment;

/// Constructs [`Encoder`]s bound to a shared block pool, collector, and
/// metrics sink.
pub struct EncoderFactory {
	pool: Arc<BlockPool>,
	collector: Arc<Collector>,
	metrics: Arc<dyn EncoderMetrics>,
	lossy: bool,
}

impl EncoderFactory {
	pub fn new(pool: Arc<BlockPool>, collector: Arc<Collector>, metrics: Arc<dyn EncoderMetrics>) -> EncoderFactory {
		EncoderFactory {
			pool,
			collector,
			metrics,
			lossy: false,
		}
	}

	/// Convenience constructor wiring up [`NullMetrics`] for embedding
	/// contexts that don't have a real metrics client to hand.
	pub fn with_null_metrics(pool: Arc<BlockPool>, collector: Arc<Collector>) -> EncoderFactory {
		EncoderFactory::new(pool, collector, Arc::new(NullMetrics))
	}

	/// Every [`Encoder`] subsequently created or opened through this
	/// factory will mask its values' low 13 mantissa bits before encoding.
	pub fn with_lossy(mut self, lossy: bool) -> EncoderFactory {
		self.lossy = lossy;
		self
	}

	pub fn pool(&self) -> &Arc<BlockPool> {
		&self.pool
	}

	pub fn collector(&self) -> &Arc<Collector> {
		&self.collector
	}

	/// Allocates a new segment with base timestamp `segment_time` and
	/// returns an `Encoder` ready to accept `add_data_point` calls.
	pub fn create_segment(&self, segment_time: i32) -> Result<Encoder, Error> {
		let segment = Segment::create(self.pool.clone(), segment_time)?;
		Ok(self.wrap(segment))
	}

	/// Binds an `Encoder` to a previously created segment, restoring its
	/// write cursor, dirty flag, and out-of-order flag from the persisted
	/// header.
	pub fn open_segment(&self, addr: Address) -> Result<Encoder, Error> {
		let segment = Segment::open(self.pool.clone(), addr)?;
		Ok(self.wrap(segment))
	}

	fn wrap(&self, segment: Segment) -> Encoder {
		Encoder::new(segment, self.metrics.clone()).with_lossy(self.lossy)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::block::DEFAULT_BLOCK_SIZE;
	use std::time::Duration;

	fn factory() -> EncoderFactory {
		let pool = Arc::new(BlockPool::new(DEFAULT_BLOCK_SIZE));
		let collector = Arc::new(Collector::new(pool.clone(), 16, Duration::from_secs(60)));
		EncoderFactory::with_null_metrics(pool, collector)
	}

	#[test]
	fn create_then_open_resumes_the_same_segment() {
		let f = factory();
		let mut enc = f.create_segment(1_000).unwrap();
		enc.add_data_point(1_000, 1.0).unwrap();
		enc.add_data_point(1_001, 2.0).unwrap();
		enc.update_header();
		let addr = enc.addr();

		let mut reopened = f.open_segment(addr).unwrap();
		let mut out = Vec::new();
		reopened.read(|t, v| out.push((t, v))).unwrap();
		assert_eq!(out, vec![(1_000, 1.0), (1_001, 2.0)]);
	}

	#[test]
	fn lossy_flag_propagates_to_every_created_encoder() {
		let pool = Arc::new(BlockPool::new(DEFAULT_BLOCK_SIZE));
		let collector = Arc::new(Collector::new(pool.clone(), 16, Duration::from_secs(60)));
		let f = EncoderFactory::with_null_metrics(pool, collector).with_lossy(true);

		let enc = f.create_segment(0).unwrap();
		let mut buf = [0u8; 4];
		enc.serialize(&mut buf, 0, buf.len()).unwrap();
		assert_eq!(buf[0], crate::GORILLA_LOSSY_SECONDS);
	}

	#[test]
	fn collector_round_trips_through_the_factorys_pool() {
		let f = factory();
		let enc = f.create_segment(0).unwrap();
		let addr = enc.addr();
		f.collector().collect_segment(addr);
		f.collector().free_collected_segments();
		assert_eq!(f.collector().pending_len(), 0);
	}
}
