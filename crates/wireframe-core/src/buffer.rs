use bytes::{Buf, BytesMut};

use crate::error::{CoreError, ErrorKind};

/// Accumulates inbound bytes up to `max_package_size`. Growing past the
/// limit is a fatal protocol error per the data-model invariant
/// `recvBuffer.length <= maxPackageSize`.
#[derive(Debug)]
pub struct RecvBuffer {
    bytes: BytesMut,
    max_package_size: usize,
}

impl RecvBuffer {
    pub fn new(max_package_size: usize) -> Self {
        Self {
            bytes: BytesMut::new(),
            max_package_size,
        }
    }

    /// Appends freshly-read bytes. Returns a [`ErrorKind::PackageTooBig`]
    /// error without mutating the buffer if the append would exceed the
    /// configured bound.
    pub fn extend(&mut self, data: &[u8]) -> Result<(), CoreError> {
        if self.bytes.len() + data.len() > self.max_package_size {
            return Err(CoreError::new(
                ErrorKind::PackageTooBig,
                format!(
                    "recv buffer would grow to {} bytes, exceeding max_package_size {}",
                    self.bytes.len() + data.len(),
                    self.max_package_size
                ),
            ));
        }
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Consumes exactly `n` bytes from the head of the buffer, returning
    /// them as an owned frame. Panics if `n` exceeds the buffered length —
    /// callers (the frame loop) always bound `n` by `self.len()` first.
    pub fn take_frame(&mut self, n: usize) -> BytesMut {
        assert!(n <= self.bytes.len(), "take_frame beyond buffered length");
        self.bytes.split_to(n)
    }

    /// Drops the entire buffer, used when a codec signals an unrecoverable
    /// framing error and the connection is about to close.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn max_package_size(&self) -> usize {
        self.max_package_size
    }
}

/// The outbound byte queue, bounded by `max_send_buffer_size`. Tracks
/// whether the `onBufferFull` / `onBufferDrain` edge has already fired so
/// callers can enforce the "exactly one" alternation invariant.
#[derive(Debug)]
pub struct SendBuffer {
    bytes: BytesMut,
    max_send_buffer_size: usize,
    full: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureEdge {
    None,
    BecameFull,
    Drained,
}

impl SendBuffer {
    pub fn new(max_send_buffer_size: usize) -> Self {
        Self {
            bytes: BytesMut::new(),
            max_send_buffer_size,
            full: false,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Appends data to the tail. Returns `Err` (a `SEND_FAIL` equivalent,
    /// left to the caller to raise) if the buffer would overflow
    /// `max_send_buffer_size` rather than silently truncating.
    pub fn push(&mut self, data: &[u8]) -> Result<BackpressureEdge, ()> {
        if self.bytes.len() + data.len() > self.max_send_buffer_size {
            return Err(());
        }
        self.bytes.extend_from_slice(data);
        Ok(self.refresh_edge())
    }

    /// Removes `n` bytes from the head after a successful kernel write.
    pub fn consume(&mut self, n: usize) -> BackpressureEdge {
        self.bytes.advance(n.min(self.bytes.len()));
        self.refresh_edge()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn refresh_edge(&mut self) -> BackpressureEdge {
        let now_full = self.bytes.len() >= self.max_send_buffer_size;
        if now_full && !self.full {
            self.full = true;
            BackpressureEdge::BecameFull
        } else if !now_full && self.full {
            self.full = false;
            BackpressureEdge::Drained
        } else {
            BackpressureEdge::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_buffer_rejects_growth_past_bound() {
        let mut buf = RecvBuffer::new(4);
        buf.extend(b"abcd").unwrap();
        let err = buf.extend(b"e").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PackageTooBig);
        assert_eq!(buf.len(), 4, "rejected append must not mutate the buffer");
    }

    #[test]
    fn recv_buffer_accepts_exactly_the_bound() {
        let mut buf = RecvBuffer::new(4);
        assert!(buf.extend(b"abcd").is_ok());
    }

    #[test]
    fn send_buffer_fires_full_then_drain_exactly_once() {
        let mut buf = SendBuffer::new(4);
        assert_eq!(buf.push(b"abcd").unwrap(), BackpressureEdge::BecameFull);
        // still full: pushing zero bytes should not re-fire.
        assert_eq!(buf.push(b"").unwrap(), BackpressureEdge::None);
        assert_eq!(buf.consume(4), BackpressureEdge::Drained);
        assert_eq!(buf.consume(0), BackpressureEdge::None);
    }

    #[test]
    fn send_buffer_rejects_overflow() {
        let mut buf = SendBuffer::new(2);
        assert!(buf.push(b"abc").is_err());
    }

    use proptest::prelude::*;

    proptest! {
        /// spec.md §8's round-trip law for the recv buffer: no matter how
        /// the source bytes are chopped into `extend` calls, `take_frame`
        /// reads back exactly what was appended.
        #[test]
        fn extend_then_take_frame_round_trips(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 0..8),
        ) {
            let whole: Vec<u8> = chunks.iter().flatten().copied().collect();
            let mut buf = RecvBuffer::new(whole.len().max(1) * 2 + 1);
            for chunk in &chunks {
                buf.extend(chunk).unwrap();
            }
            prop_assert_eq!(buf.len(), whole.len());
            let frame = buf.take_frame(whole.len());
            prop_assert_eq!(frame.as_ref(), whole.as_slice());
            prop_assert!(buf.is_empty());
        }

        /// Split-point law: taking a prefix leaves exactly the remaining
        /// suffix buffered, regardless of where the split falls.
        #[test]
        fn take_frame_splits_at_any_point(
            data in prop::collection::vec(any::<u8>(), 1..64),
            cut_fraction in 0usize..100,
        ) {
            let mut buf = RecvBuffer::new(data.len() + 1);
            buf.extend(&data).unwrap();
            let cut = (cut_fraction * data.len()) / 100;

            let head = buf.take_frame(cut);
            prop_assert_eq!(head.as_ref(), &data[..cut]);
            prop_assert_eq!(buf.as_slice(), &data[cut..]);
        }
    }
}
