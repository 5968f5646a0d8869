use std::collections::BTreeMap;

use bytes::{Buf, Bytes};

/// Reassembles out-of-order stream data into a contiguous byte sequence
///
/// Holds non-overlapping chunks keyed by stream offset. Data below the read
/// cursor, or already covered by a buffered chunk, is discarded on insert, so
/// memory use is bounded by the receive window regardless of how peers
/// fragment or duplicate their transmissions.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    data: BTreeMap<u64, Bytes>,
    bytes_read: u64,
}

impl Assembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Buffer a chunk received at `offset`, discarding whatever is redundant
    pub(crate) fn insert(&mut self, offset: u64, mut data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut start = offset.max(self.bytes_read);
        if start >= offset + data.len() as u64 {
            return;
        }
        data.advance((start - offset) as usize);

        // Trim against the chunk at or before `start`
        if let Some((&prev_off, prev)) = self.data.range(..=start).next_back() {
            let prev_end = prev_off + prev.len() as u64;
            if prev_end >= start + data.len() as u64 {
                return;
            }
            if prev_end > start {
                data.advance((prev_end - start) as usize);
                start = prev_end;
            }
        }

        // Fill the gaps between any chunks above `start`
        while !data.is_empty() {
            let end = start + data.len() as u64;
            match self.data.range(start..end).next().map(|(&o, c)| (o, c.len() as u64)) {
                None => {
                    self.data.insert(start, data);
                    break;
                }
                Some((next_off, next_len)) => {
                    if next_off > start {
                        let piece = data.split_to((next_off - start) as usize);
                        self.data.insert(start, piece);
                    }
                    let next_end = next_off + next_len;
                    let skip = (next_end - start).min(data.len() as u64);
                    data.advance(skip as usize);
                    start = next_end;
                }
            }
        }
    }

    /// Pop up to `max_len` contiguous bytes at the read cursor
    pub(crate) fn read(&mut self, max_len: usize) -> Option<Bytes> {
        let (&offset, chunk) = self.data.iter().next()?;
        if offset != self.bytes_read {
            return None;
        }
        if chunk.len() <= max_len {
            let chunk = self.data.remove(&offset).unwrap();
            self.bytes_read += chunk.len() as u64;
            Some(chunk)
        } else {
            let mut chunk = self.data.remove(&offset).unwrap();
            let out = chunk.split_to(max_len);
            self.bytes_read += max_len as u64;
            self.data.insert(self.bytes_read, chunk);
            Some(out)
        }
    }

    /// Copy up to `max_len` bytes at `cursor` without consuming them
    ///
    /// `cursor` must not precede the read cursor. Returns `None` when the
    /// byte at `cursor` has not arrived yet.
    pub(crate) fn peek(&self, cursor: u64, max_len: usize) -> Option<Bytes> {
        debug_assert!(cursor >= self.bytes_read);
        let (&offset, chunk) = self.data.range(..=cursor).next_back()?;
        let end = offset + chunk.len() as u64;
        if end <= cursor {
            return None;
        }
        let begin = (cursor - offset) as usize;
        let take = chunk.len().min(begin + max_len);
        Some(chunk.slice(begin..take))
    }

    /// First offset not yet consumed by `read`
    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// One past the end of the contiguous run beginning at the read cursor
    pub(crate) fn contiguous_end(&self) -> u64 {
        let mut pos = self.bytes_read;
        for (&offset, chunk) in self.data.range(self.bytes_read..) {
            if offset != pos {
                break;
            }
            pos = offset + chunk.len() as u64;
        }
        pos
    }

    /// Whether every byte in `0..=x` has been received (read or buffered)
    pub(crate) fn received_through(&self, x: u64) -> bool {
        self.contiguous_end() > x
    }

    /// Discard all buffered data, e.g. when the stream is stopped
    pub(crate) fn clear(&mut self) {
        self.data.clear();
    }

    /// Discard buffered data at offsets `end` and beyond
    pub(crate) fn truncate(&mut self, end: u64) {
        self.data.split_off(&end);
        let straddler = self
            .data
            .iter()
            .next_back()
            .map(|(&o, c)| (o, c.len() as u64))
            .filter(|&(o, len)| o + len > end);
        if let Some((offset, _)) = straddler {
            let chunk = self.data.get_mut(&offset).unwrap();
            chunk.truncate((end - offset) as usize);
            if chunk.is_empty() {
                self.data.remove(&offset);
            }
        }
    }

    /// Advance the read cursor without delivering data
    pub(crate) fn set_bytes_read(&mut self, offset: u64) {
        if offset > self.bytes_read {
            self.bytes_read = offset;
            // Anything below the new cursor will never be read
            self.data.retain(|&o, c| o + c.len() as u64 > offset);
            if let Some((&first, _)) = self.data.iter().next() {
                if first < offset {
                    let mut chunk = self.data.remove(&first).unwrap();
                    chunk.advance((offset - first) as usize);
                    if !chunk.is_empty() {
                        self.data.insert(offset, chunk);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(chunks: &[(u64, &[u8])]) -> Assembler {
        let mut x = Assembler::new();
        for &(offset, data) in chunks {
            x.insert(offset, Bytes::copy_from_slice(data));
        }
        x
    }

    fn read_all(x: &mut Assembler) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = x.read(usize::MAX) {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn in_order() {
        let mut x = assemble(&[(0, b"hel"), (3, b"lo")]);
        assert_eq!(read_all(&mut x), b"hello");
        assert_eq!(x.bytes_read(), 5);
    }

    #[test]
    fn out_of_order_blocks_then_delivers() {
        let mut x = assemble(&[(3, b"lo")]);
        assert_eq!(x.read(usize::MAX), None);
        x.insert(0, Bytes::from_static(b"hel"));
        assert_eq!(read_all(&mut x), b"hello");
    }

    #[test]
    fn duplicate_and_overlap_discarded() {
        let mut x = assemble(&[(0, b"hello"), (0, b"hello"), (2, b"llop")]);
        assert_eq!(read_all(&mut x), b"hellop");
    }

    #[test]
    fn overlap_bridging_gap() {
        let mut x = assemble(&[(0, b"ab"), (4, b"ef"), (1, b"bcde")]);
        assert_eq!(read_all(&mut x), b"abcdef");
    }

    #[test]
    fn old_data_ignored_after_read() {
        let mut x = assemble(&[(0, b"abc")]);
        assert_eq!(read_all(&mut x), b"abc");
        x.insert(0, Bytes::from_static(b"abc"));
        assert_eq!(x.read(usize::MAX), None);
        assert_eq!(x.bytes_read(), 3);
    }

    #[test]
    fn bounded_read() {
        let mut x = assemble(&[(0, b"abcdef")]);
        assert_eq!(&x.read(2).unwrap()[..], b"ab");
        assert_eq!(&x.read(100).unwrap()[..], b"cdef");
    }

    #[test]
    fn peek_does_not_consume() {
        let x = assemble(&[(0, b"abcdef")]);
        assert_eq!(&x.peek(2, 3).unwrap()[..], b"cde");
        assert_eq!(&x.peek(0, 100).unwrap()[..], b"abcdef");
        assert_eq!(x.bytes_read(), 0);
    }

    #[test]
    fn peek_past_gap() {
        let x = assemble(&[(0, b"ab"), (5, b"fg")]);
        assert_eq!(x.peek(3, 1), None);
        assert_eq!(&x.peek(5, 2).unwrap()[..], b"fg");
    }

    #[test]
    fn received_through_tracks_gaps() {
        let mut x = assemble(&[(0, b"abc"), (5, b"f")]);
        assert!(x.received_through(2));
        assert!(!x.received_through(3));
        x.insert(3, Bytes::from_static(b"de"));
        assert!(x.received_through(5));
    }

    #[test]
    fn truncate_drops_tail() {
        let mut x = assemble(&[(0, b"abcd"), (6, b"gh")]);
        x.truncate(2);
        assert_eq!(read_all(&mut x), b"ab");
        let mut y = assemble(&[(0, b"abcd")]);
        y.truncate(4);
        assert_eq!(read_all(&mut y), b"abcd");
    }

    #[test]
    fn skip_via_set_bytes_read() {
        let mut x = assemble(&[(0, b"abcdef")]);
        x.set_bytes_read(4);
        assert_eq!(read_all(&mut x), b"ef");
    }
}
