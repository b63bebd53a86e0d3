/// Everything that can go wrong while allocating, writing to, or reading from
/// a segment.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The block pool could not produce a new block.
	#[error("allocation failed: pool exhausted")]
	AllocationFailed,

	/// A read ran off the end of the block chain (a corrupt or truncated
	/// next-pointer). The segment should be treated as poisoned.
	#[error("unexpected end of stream while reading segment")]
	UnexpectedEndOfStream,

	/// `n_bits` passed to `write_data`/`read_data` was out of range.
	#[error("invalid bit width {0} (must be in 1..=64)")]
	InvalidBitWidth(u32),

	/// A read was attempted before `reset_cursor`/`reset` switched the
	/// segment into read mode.
	#[error("segment is not in read mode")]
	NotInReadMode,

	/// A write was attempted after the segment was switched into read mode.
	#[error("segment is not in write mode")]
	NotInWriteMode,

	/// The caller-supplied window into the destination buffer does not fit.
	#[error("buffer too small: need {needed} bytes, have {available}")]
	BufferTooSmall { needed: usize, available: usize },

	/// A byte or word offset fell outside a block's bounds. The in-memory
	/// pool enforces this with a `debug_assert!` rather than returning this
	/// variant; it exists for pool backends that validate at the boundary.
	#[error("offset {offset} out of range for block of size {block_size}")]
	InvalidOffset { offset: usize, block_size: usize },
}
