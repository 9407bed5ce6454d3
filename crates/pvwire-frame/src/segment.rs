use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::codec::{flags, Header, Segment, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE, PAYLOAD_SIZE_OFFSET};
use crate::error::{FrameError, Result};

/// Reassembles one segmented message at a time.
///
/// Owned by the receiving thread of a connection. The merged message keeps
/// the header of the first segment with its segment bits cleared, so it reads
/// exactly like the unsegmented message would have.
#[derive(Debug)]
pub struct SegmentAccumulator {
    buf: BytesMut,
    command: Option<u8>,
    max_message_size: usize,
}

impl Default for SegmentAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl SegmentAccumulator {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            command: None,
            max_message_size,
        }
    }

    /// Is a segmented message being accumulated?
    pub fn is_active(&self) -> bool {
        self.command.is_some()
    }

    /// Drop any partial message.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.command = None;
    }

    /// Feed one complete segment (header and payload).
    ///
    /// Returns the merged message once the last segment arrived. A middle or
    /// last segment without a first one, or one for another command, is
    /// rejected and never merged.
    pub fn accept(&mut self, header: &Header, message: &[u8]) -> Result<Option<&[u8]>> {
        let segment = header.segment();
        match segment {
            Segment::None => Err(FrameError::malformed(
                "segment",
                "unsegmented message fed to the accumulator",
            )),
            Segment::First => {
                if let Some(previous) = self.command {
                    trace!(command = previous, "discarding unfinished segmented message");
                }
                self.check_size(message.len())?;
                self.buf.clear();
                self.buf.extend_from_slice(message);
                self.buf[2] &= !flags::SEGMENT_MASK;
                self.command = Some(header.command);
                Ok(None)
            }
            Segment::Middle | Segment::Last => {
                let Some(expected) = self.command else {
                    return Err(FrameError::SegmentOutOfOrder {
                        segment,
                        command: header.command,
                    });
                };
                if expected != header.command {
                    self.reset();
                    return Err(FrameError::SegmentCommandMismatch {
                        expected,
                        actual: header.command,
                    });
                }

                let payload = &message[HEADER_SIZE.min(message.len())..];
                if let Err(err) = self.check_size(self.buf.len() + payload.len()) {
                    self.reset();
                    return Err(err);
                }
                self.buf.extend_from_slice(payload);

                let merged = Header::decode(&self.buf)?;
                let total = (self.buf.len() - HEADER_SIZE) as u32;
                self.buf[PAYLOAD_SIZE_OFFSET..HEADER_SIZE]
                    .copy_from_slice(&merged.order().u32_bytes(total));

                if segment == Segment::Last {
                    self.command = None;
                    Ok(Some(&self.buf[..]))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_message_size {
            return Err(FrameError::SegmentTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

/// Split an encoded message into segments carrying at most `max_payload`
/// payload bytes each.
///
/// A message that already fits is returned unchanged as a single element.
pub fn split_message(message: &[u8], max_payload: usize) -> Result<Vec<Bytes>> {
    let header = Header::decode(message)?;
    if header.is_control() || header.segment() != Segment::None {
        return Err(FrameError::malformed(
            "segment",
            "only unsegmented application messages can be split",
        ));
    }
    let payload = message
        .get(HEADER_SIZE..header.message_size())
        .ok_or(FrameError::Truncated {
            needed: header.message_size(),
            remaining: message.len(),
        })?;
    if payload.len() <= max_payload || max_payload == 0 {
        return Ok(vec![Bytes::copy_from_slice(&message[..header.message_size()])]);
    }

    let chunks: Vec<&[u8]> = payload.chunks(max_payload).collect();
    let last = chunks.len() - 1;
    let order = header.order();
    let segments = chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let segment = match i {
                0 => Segment::First,
                i if i == last => Segment::Last,
                _ => Segment::Middle,
            };
            let mut out = BytesMut::with_capacity(HEADER_SIZE + chunk.len());
            out.extend_from_slice(&message[..HEADER_SIZE]);
            out[2] = (out[2] & !flags::SEGMENT_MASK) | segment.flag();
            out[PAYLOAD_SIZE_OFFSET..HEADER_SIZE]
                .copy_from_slice(&order.u32_bytes(chunk.len() as u32));
            out.extend_from_slice(chunk);
            out.freeze()
        })
        .collect();
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteOrder;
    use crate::wire::WireWriter;

    fn message(order: ByteOrder, command: u8, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut w = WireWriter::new(&mut buf, order);
        let mark = w.begin_message(command);
        w.put_bytes(payload);
        w.end_message(mark).unwrap();
        buf
    }

    fn feed(acc: &mut SegmentAccumulator, segments: &[Bytes]) -> Vec<Vec<u8>> {
        let mut merged = Vec::new();
        for segment in segments {
            let header = Header::decode(segment).unwrap();
            if let Some(done) = acc.accept(&header, segment).unwrap() {
                merged.push(done.to_vec());
            }
        }
        merged
    }

    #[test]
    fn segmented_equals_unsegmented() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let original = message(order, 10, &payload);
            for chunk in [1, 7, 333, 999] {
                let segments = split_message(&original, chunk).unwrap();
                assert!(segments.len() >= 2);

                let mut acc = SegmentAccumulator::default();
                let merged = feed(&mut acc, &segments);
                assert_eq!(merged, vec![original.to_vec()]);
                assert!(!acc.is_active());
            }
        }
    }

    #[test]
    fn small_message_is_not_split() {
        let original = message(ByteOrder::Little, 11, b"abc");
        let segments = split_message(&original, 16).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(&segments[0][..], &original[..]);
    }

    #[test]
    fn middle_without_first_is_rejected() {
        let original = message(ByteOrder::Little, 10, &[1; 30]);
        let segments = split_message(&original, 10).unwrap();

        let mut acc = SegmentAccumulator::default();
        let header = Header::decode(&segments[1]).unwrap();
        let err = acc.accept(&header, &segments[1]).unwrap_err();
        assert!(matches!(
            err,
            FrameError::SegmentOutOfOrder {
                segment: Segment::Middle,
                command: 10
            }
        ));
    }

    #[test]
    fn last_without_first_is_rejected() {
        let original = message(ByteOrder::Big, 10, &[1; 20]);
        let segments = split_message(&original, 10).unwrap();

        let mut acc = SegmentAccumulator::default();
        let header = Header::decode(&segments[1]).unwrap();
        assert_eq!(header.segment(), Segment::Last);
        assert!(acc.accept(&header, &segments[1]).is_err());
    }

    #[test]
    fn command_mismatch_is_rejected() {
        let first = split_message(&message(ByteOrder::Little, 10, &[1; 20]), 10).unwrap();
        let other = split_message(&message(ByteOrder::Little, 11, &[2; 20]), 10).unwrap();

        let mut acc = SegmentAccumulator::default();
        let header = Header::decode(&first[0]).unwrap();
        assert!(acc.accept(&header, &first[0]).unwrap().is_none());

        let header = Header::decode(&other[1]).unwrap();
        let err = acc.accept(&header, &other[1]).unwrap_err();
        assert!(matches!(
            err,
            FrameError::SegmentCommandMismatch {
                expected: 10,
                actual: 11
            }
        ));
        assert!(!acc.is_active());
    }

    #[test]
    fn new_first_restarts_accumulation() {
        let stale = split_message(&message(ByteOrder::Little, 10, &[9; 30]), 10).unwrap();
        let fresh_msg = message(ByteOrder::Little, 10, &[4; 25]);
        let fresh = split_message(&fresh_msg, 10).unwrap();

        let mut acc = SegmentAccumulator::default();
        let mut stream = vec![stale[0].clone(), stale[1].clone()];
        stream.extend(fresh.iter().cloned());
        let merged = feed(&mut acc, &stream);
        assert_eq!(merged, vec![fresh_msg.to_vec()]);
    }

    #[test]
    fn oversized_reassembly_is_rejected() {
        let segments = split_message(&message(ByteOrder::Little, 10, &[0; 64]), 16).unwrap();
        let mut acc = SegmentAccumulator::new(40);
        let mut failure = None;
        for segment in &segments {
            let header = Header::decode(segment).unwrap();
            if let Err(err) = acc.accept(&header, segment) {
                failure = Some(err);
                break;
            }
        }
        assert!(matches!(failure, Some(FrameError::SegmentTooLarge { max: 40, .. })));
        assert!(!acc.is_active());
    }
}
