#![forbid(unsafe_code)]

use bytes::{Buf, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

/// Big-endian `u32` payload length in front of every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("stream ended inside a frame: buffered={buffered}")]
	Truncated {
		buffered: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

fn check_len(len: usize, max: usize) -> Result<(), FramingError> {
	if len > max {
		return Err(FramingError::FrameTooLarge { len, max });
	}
	Ok(())
}

fn peek_len(src: &[u8]) -> Option<usize> {
	let prefix: [u8; LENGTH_PREFIX_LEN] = src.get(..LENGTH_PREFIX_LEN)?.try_into().ok()?;
	Some(u32::from_be_bytes(prefix) as usize)
}

/// Encode `msg` as a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	check_len(payload_len, max_frame_size)?;

	let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload_len);
	out.extend_from_slice(&(payload_len as u32).to_be_bytes());
	msg.encode(&mut out)?;
	Ok(out)
}

/// Decode one frame from the start of `src`; returns the message and bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let Some(len) = peek_len(src) else {
		return Err(FramingError::InsufficientData {
			need: LENGTH_PREFIX_LEN,
			have: src.len(),
		});
	};
	check_len(len, max_frame_size)?;

	let need = LENGTH_PREFIX_LEN + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[LENGTH_PREFIX_LEN..need])?;
	Ok((msg, need))
}

/// Write one frame and flush.
pub async fn write_frame<W, M>(dst: &mut W, msg: &M, max_frame_size: usize) -> Result<(), FramingError>
where
	W: AsyncWrite + Unpin + ?Sized,
	M: Message,
{
	let frame = encode_frame(msg, max_frame_size)?;
	dst.write_all(&frame).await?;
	dst.flush().await?;
	Ok(())
}

/// Incremental frame reader over any async byte stream.
///
/// Bytes past the end of a decoded frame stay buffered for the next call, so
/// one reader must be kept per stream.
#[derive(Debug)]
pub struct FrameReader {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameReader {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(8 * 1024),
			max_frame_size,
		}
	}

	/// Bytes buffered but not yet consumed by a frame.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Feed bytes obtained out of band.
	pub fn extend(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Decode one frame from the buffer if a complete frame is available.
	pub fn try_next<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		let Some(len) = peek_len(&self.buf) else {
			return Ok(None);
		};
		check_len(len, self.max_frame_size)?;

		if self.buf.len() < LENGTH_PREFIX_LEN + len {
			return Ok(None);
		}

		self.buf.advance(LENGTH_PREFIX_LEN);
		let payload = self.buf.split_to(len);
		Ok(Some(M::decode(payload)?))
	}

	/// Read the next frame. `Ok(None)` means the stream ended cleanly between frames.
	pub async fn read_frame<R, M>(&mut self, src: &mut R) -> Result<Option<M>, FramingError>
	where
		R: AsyncRead + Unpin + ?Sized,
		M: Message + Default,
	{
		loop {
			if let Some(msg) = self.try_next::<M>()? {
				return Ok(Some(msg));
			}

			if src.read_buf(&mut self.buf).await? == 0 {
				if self.buf.is_empty() {
					return Ok(None);
				}
				return Err(FramingError::Truncated {
					buffered: self.buf.len(),
				});
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, PartialEq, ::prost::Message)]
	struct Probe {
		#[prost(string, tag = "1")]
		text: String,
		#[prost(int64, tag = "2")]
		id: i64,
	}

	#[test]
	fn decode_reports_missing_bytes() {
		let frame = encode_frame(
			&Probe {
				text: "x".repeat(10),
				id: 7,
			},
			DEFAULT_MAX_FRAME_SIZE,
		)
		.expect("encode");

		match decode_frame::<Probe>(&frame[..2], DEFAULT_MAX_FRAME_SIZE).unwrap_err() {
			FramingError::InsufficientData { need, have } => {
				assert_eq!(need, LENGTH_PREFIX_LEN);
				assert_eq!(have, 2);
			}
			other => panic!("unexpected error: {other:?}"),
		}

		match decode_frame::<Probe>(&frame[..6], DEFAULT_MAX_FRAME_SIZE).unwrap_err() {
			FramingError::InsufficientData { need, have } => assert!(need > have),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn encode_rejects_oversized_payload() {
		let msg = Probe {
			text: "a".repeat(1_000),
			id: 1,
		};
		assert!(matches!(
			encode_frame(&msg, 32),
			Err(FramingError::FrameTooLarge { max: 32, .. })
		));
	}

	#[test]
	fn reader_rejects_oversized_prefix_before_payload_arrives() {
		let mut reader = FrameReader::new(16);
		reader.extend(&17u32.to_be_bytes());
		assert!(matches!(
			reader.try_next::<Probe>(),
			Err(FramingError::FrameTooLarge { len: 17, max: 16 })
		));
	}

	#[tokio::test]
	async fn reader_keeps_trailing_bytes_for_next_frame() {
		let a = Probe {
			text: "first".into(),
			id: 1,
		};
		let b = Probe {
			text: "second".into(),
			id: 2,
		};

		let mut wire = encode_frame(&a, DEFAULT_MAX_FRAME_SIZE).expect("encode a");
		wire.extend(encode_frame(&b, DEFAULT_MAX_FRAME_SIZE).expect("encode b"));

		let mut src: &[u8] = &wire;
		let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_SIZE);
		assert_eq!(reader.read_frame::<_, Probe>(&mut src).await.expect("a"), Some(a));
		assert_eq!(reader.read_frame::<_, Probe>(&mut src).await.expect("b"), Some(b));
		assert_eq!(reader.read_frame::<_, Probe>(&mut src).await.expect("eof"), None);
	}

	#[tokio::test]
	async fn reader_flags_truncated_stream() {
		let wire = encode_frame(
			&Probe {
				text: "cut".into(),
				id: 3,
			},
			DEFAULT_MAX_FRAME_SIZE,
		)
		.expect("encode");

		let mut src: &[u8] = &wire[..wire.len() - 1];
		let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_SIZE);
		assert!(matches!(
			reader.read_frame::<_, Probe>(&mut src).await,
			Err(FramingError::Truncated { .. })
		));
	}
}
