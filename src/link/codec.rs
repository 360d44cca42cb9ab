// Wire framing between the host and the motor controller
//
// Frame format: [Delimiter..., Length, Payload..., Checksum]
// The checksum covers the length field and the payload. Delimiter, length
// width and checksum algorithm come from `FramingConfig`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_16_IBM_3740, Crc};
use tracing::trace;

use crate::config::{ChecksumKind, FramingConfig, LengthField};

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF)
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Built by `FrameCodec::encode` for the controller
    Outbound,
    /// Verified by `FrameDecoder`
    Inbound,
}

/// A single verified unit of the wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    pub payload: Bytes,
    /// Checksum value carried by the frame
    pub tag: u16,
    wire: Bytes,
}

impl Frame {
    /// The frame exactly as it travels on the link, delimiter to checksum
    pub fn wire(&self) -> &[u8] {
        &self.wire
    }
}

impl ChecksumKind {
    pub fn compute(self, data: &[u8]) -> u16 {
        match self {
            ChecksumKind::Additive8 => data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) as u16,
            ChecksumKind::Xor8 => data.iter().fold(0u8, |acc, &b| acc ^ b) as u16,
            ChecksumKind::Crc16CcittFalse => CRC16.checksum(data),
        }
    }

    fn put(self, value: u16, out: &mut BytesMut) {
        match self.width() {
            1 => out.put_u8(value as u8),
            _ => out.put_u16_le(value),
        }
    }

    fn get(self, bytes: &[u8]) -> u16 {
        match self.width() {
            1 => bytes[0] as u16,
            _ => u16::from_le_bytes([bytes[0], bytes[1]]),
        }
    }
}

impl LengthField {
    fn put(self, len: usize, out: &mut BytesMut) {
        match self {
            LengthField::U8 => out.put_u8(len as u8),
            LengthField::U16 => out.put_u16_le(len as u16),
        }
    }

    fn get(self, bytes: &[u8]) -> usize {
        match self {
            LengthField::U8 => bytes[0] as usize,
            LengthField::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as usize,
        }
    }
}

/// Symmetric frame encoder; hands out decoders sharing the same layout
#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: FramingConfig,
}

impl FrameCodec {
    pub fn new(framing: FramingConfig) -> Self {
        Self { framing }
    }

    pub fn framing(&self) -> &FramingConfig {
        &self.framing
    }

    /// Wrap a payload into exactly one outbound frame
    pub fn encode(&self, payload: &[u8]) -> Result<Frame, CodecError> {
        let framing = &self.framing;
        if payload.len() > framing.max_payload {
            return Err(CodecError::PayloadTooLarge {
                len: payload.len(),
                max: framing.max_payload,
            });
        }

        let mut out = BytesMut::with_capacity(
            framing.header_len() + payload.len() + framing.checksum.width(),
        );
        out.put_slice(&framing.delimiter);
        framing.length.put(payload.len(), &mut out);
        out.put_slice(payload);

        let checksum = framing.checksum.compute(&out[framing.delimiter.len()..]);
        framing.checksum.put(checksum, &mut out);

        let wire = out.freeze();
        Ok(Frame {
            direction: Direction::Outbound,
            payload: wire.slice(framing.header_len()..framing.header_len() + payload.len()),
            tag: checksum,
            wire,
        })
    }

    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.framing.clone())
    }
}

/// Counters for everything the decoder threw away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames: u64,
    pub checksum_errors: u64,
    pub oversize_lengths: u64,
    pub discarded_bytes: u64,
}

/// Incremental decoder over an arbitrarily chunked byte stream
pub struct FrameDecoder {
    framing: FramingConfig,
    buf: BytesMut,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new(framing: FramingConfig) -> Self {
        let capacity = framing.max_buffer;
        Self {
            framing,
            buf: BytesMut::with_capacity(capacity),
            stats: DecoderStats::default(),
        }
    }

    /// Append received bytes; the oldest bytes go once the buffer is full
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.framing.max_buffer {
            let excess = self.buf.len() - self.framing.max_buffer;
            self.discard(excess);
        }
    }

    /// Drop any partially received frame (used after the link is lost)
    pub fn clear(&mut self) {
        self.stats.discarded_bytes += self.buf.len() as u64;
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Drain every complete frame currently buffered
    pub fn frames(&mut self) -> impl Iterator<Item = Frame> + '_ {
        std::iter::from_fn(move || self.next_frame())
    }

    /// Next verified frame, or `None` until more bytes arrive
    pub fn next_frame(&mut self) -> Option<Frame> {
        let delimiter_len = self.framing.delimiter.len();
        let header_len = self.framing.header_len();
        let checksum = self.framing.checksum;

        loop {
            let Some(start) = find(&self.buf, &self.framing.delimiter) else {
                // keep a tail that could be the start of a split delimiter
                let keep = delimiter_len - 1;
                if self.buf.len() > keep {
                    self.discard(self.buf.len() - keep);
                }
                return None;
            };
            if start > 0 {
                self.discard(start);
            }

            if self.buf.len() < header_len {
                return None;
            }
            let declared = self.framing.length.get(&self.buf[delimiter_len..header_len]);
            if declared > self.framing.max_payload {
                trace!("Declared length {} exceeds limit, resyncing", declared);
                self.stats.oversize_lengths += 1;
                self.discard(1);
                continue;
            }

            let body_end = header_len + declared;
            let total = body_end + checksum.width();
            if self.buf.len() < total {
                // a corrupted length can claim bytes that belong to the next frame
                if let Some(next) = self.later_frame_start() {
                    trace!("Incomplete frame overtaken by a valid one at +{}", next);
                    self.stats.checksum_errors += 1;
                    self.discard(next);
                    continue;
                }
                return None;
            }

            let expected = checksum.compute(&self.buf[delimiter_len..body_end]);
            let received = checksum.get(&self.buf[body_end..total]);
            if expected != received {
                trace!(
                    "Checksum mismatch: expected 0x{:04X}, got 0x{:04X}",
                    expected, received
                );
                self.stats.checksum_errors += 1;
                self.discard(1);
                continue;
            }

            let frame = self.buf.split_to(total).freeze();
            self.stats.frames += 1;
            return Some(Frame {
                direction: Direction::Inbound,
                payload: frame.slice(header_len..body_end),
                tag: received,
                wire: frame,
            });
        }
    }

    /// Total length of a complete, checksum-valid frame starting at `start`
    fn valid_frame_at(&self, start: usize) -> Option<usize> {
        let framing = &self.framing;
        let buf = &self.buf[start..];
        let delimiter_len = framing.delimiter.len();
        let header_len = framing.header_len();
        if buf.len() < header_len || !buf.starts_with(&framing.delimiter) {
            return None;
        }

        let declared = framing.length.get(&buf[delimiter_len..header_len]);
        if declared > framing.max_payload {
            return None;
        }
        let body_end = header_len + declared;
        let total = body_end + framing.checksum.width();
        if buf.len() < total {
            return None;
        }
        let expected = framing.checksum.compute(&buf[delimiter_len..body_end]);
        (expected == framing.checksum.get(&buf[body_end..total])).then_some(total)
    }

    /// Offset of the first delimiter past the head that starts a valid frame
    fn later_frame_start(&self) -> Option<usize> {
        let mut from = 1;
        while let Some(offset) = find(&self.buf[from..], &self.framing.delimiter) {
            let start = from + offset;
            if self.valid_frame_at(start).is_some() {
                return Some(start);
            }
            from = start + 1;
        }
        None
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.stats.discarded_bytes += n as u64;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
