use rustc_hash::FxHashMap;

use crate::StreamId;

/// List size at which the id-to-node side table is built
const BUILD_INDEX_THRESHOLD: usize = 30;
/// List size below which the side table is discarded
const DESTROY_INDEX_THRESHOLD: usize = 10;

/// Cyclic round-robin scheduler over active stream ids
///
/// The cursor advances after a configurable number of `get_next` calls or
/// after a configurable number of bytes have been consumed from the current
/// stream. Small lists are searched linearly around the cursor on erase (the
/// erased id is overwhelmingly often the one just serviced); once the list
/// grows past [`BUILD_INDEX_THRESHOLD`] entries a side table makes erase O(1).
///
/// The sequence of scheduling decisions for a given trace of operations is
/// deterministic, and identical whether or not the side table is active.
#[derive(Debug, Default)]
pub(crate) struct RoundRobin {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    cursor: Option<usize>,
    len: usize,
    index: FxHashMap<StreamId, usize>,
    use_index: bool,
    mode: AdvanceMode,
    advance_after: u64,
    current: u64,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    value: StreamId,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum AdvanceMode {
    Nexts,
    Bytes,
}

impl Default for AdvanceMode {
    fn default() -> Self {
        Self::Nexts
    }
}

impl RoundRobin {
    pub(crate) fn new() -> Self {
        Self {
            advance_after: 1,
            ..Self::default()
        }
    }

    /// Advance the cursor after `n` calls to `get_next`
    pub(crate) fn advance_after_next(&mut self, n: u64) {
        if self.mode == AdvanceMode::Bytes {
            self.current = 0;
        }
        self.mode = AdvanceMode::Nexts;
        self.advance_after = n;
    }

    /// Advance the cursor once at least `bytes` have been consumed from the
    /// current stream
    pub(crate) fn advance_after_bytes(&mut self, bytes: u64) {
        if self.mode == AdvanceMode::Nexts {
            self.current = 0;
        }
        self.mode = AdvanceMode::Bytes;
        self.advance_after = bytes;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn contains(&self, value: StreamId) -> bool {
        if self.use_index {
            return self.index.contains_key(&value);
        }
        let mut it = self.head;
        while let Some(n) = it {
            if self.nodes[n].value == value {
                return true;
            }
            it = self.nodes[n].next;
        }
        false
    }

    /// Insert a new id, serviced last in the current cycle
    ///
    /// The caller must never insert a duplicate.
    pub(crate) fn insert(&mut self, value: StreamId) {
        debug_assert!(!self.contains(value), "duplicate stream id inserted");
        if !self.use_index && self.len >= BUILD_INDEX_THRESHOLD {
            self.use_index = true;
            self.build_index();
        }
        let node = self.alloc(value);
        match self.cursor {
            None => {
                self.head = Some(node);
                self.tail = Some(node);
                self.cursor = Some(node);
            }
            Some(cur) => {
                // Insert immediately before the cursor
                let prev = self.nodes[cur].prev;
                self.nodes[node].prev = prev;
                self.nodes[node].next = Some(cur);
                self.nodes[cur].prev = Some(node);
                match prev {
                    Some(p) => self.nodes[p].next = Some(node),
                    None => self.head = Some(node),
                }
            }
        }
        self.len += 1;
        if self.use_index {
            self.index.insert(value, node);
        }
    }

    pub(crate) fn erase(&mut self, value: StreamId) -> bool {
        if self.len == 0 {
            return false;
        }
        if self.use_index {
            let node = match self.index.remove(&value) {
                Some(x) => x,
                None => return false,
            };
            self.unlink(node);
            return true;
        }
        let cur = self.cursor.unwrap();
        // The most likely erase is the cursor or its immediate neighborhood
        if self.nodes[cur].value == value {
            self.unlink(cur);
            self.current = 0;
            return true;
        }
        // Search backwards towards the front of the list
        let mut it = self.nodes[cur].prev;
        while let Some(n) = it {
            if self.nodes[n].value == value {
                self.unlink(n);
                return true;
            }
            it = self.nodes[n].prev;
        }
        // Then forwards towards the back
        let mut it = self.nodes[cur].next;
        while let Some(n) = it {
            if self.nodes[n].value == value {
                self.unlink(n);
                return true;
            }
            it = self.nodes[n].next;
        }
        false
    }

    /// The stream to service now; `bytes` is how much will be consumed from it
    pub(crate) fn get_next(&mut self, bytes: Option<u64>) -> StreamId {
        let cur = self.cursor.expect("get_next on an empty scheduler");
        let ret = self.nodes[cur].value;
        self.consume(bytes);
        ret
    }

    pub(crate) fn peek_next(&self) -> StreamId {
        let cur = self.cursor.expect("peek_next on an empty scheduler");
        self.nodes[cur].value
    }

    /// Account consumption against the current stream and advance the cursor
    /// when the threshold is reached
    pub(crate) fn consume(&mut self, bytes: Option<u64>) {
        match self.mode {
            AdvanceMode::Bytes => self.current += bytes.unwrap_or(0),
            AdvanceMode::Nexts => self.current += 1,
        }
        self.maybe_advance();
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.cursor = None;
        self.len = 0;
        self.current = 0;
        if self.use_index {
            self.index.clear();
            self.use_index = false;
        }
    }

    fn maybe_advance(&mut self) {
        debug_assert!(self.len > 0);
        if self.current >= self.advance_after {
            let cur = self.cursor.unwrap();
            self.cursor = self.nodes[cur].next.or(self.head);
            self.current = 0;
        }
    }

    fn alloc(&mut self, value: StreamId) -> usize {
        let node = Node {
            value,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn unlink(&mut self, node: usize) {
        let Node { prev, next, .. } = self.nodes[node];
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        if self.cursor == Some(node) {
            // Erasing the element under the cursor advances it, wrapping to
            // the front, and restarts the advance counter
            self.cursor = next.or(self.head);
            self.current = 0;
        }
        self.free.push(node);
        self.len -= 1;
        if self.len < DESTROY_INDEX_THRESHOLD && self.use_index {
            self.use_index = false;
            self.index.clear();
        }
    }

    fn build_index(&mut self) {
        let mut it = self.head;
        while let Some(n) = it {
            self.index.insert(self.nodes[n].value, n);
            it = self.nodes[n].next;
        }
    }

    /// Activate the side table regardless of size, for determinism tests
    #[cfg(test)]
    fn force_index(&mut self) {
        self.use_index = true;
        self.build_index();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Dir, Side};

    fn id(n: u64) -> StreamId {
        StreamId::new(Side::Client, Dir::Bi, n)
    }

    fn with_streams(ids: &[u64]) -> RoundRobin {
        let mut rr = RoundRobin::new();
        for &n in ids {
            rr.insert(id(n));
        }
        rr
    }

    #[test]
    fn advance_after_next() {
        let mut rr = with_streams(&[1, 2, 3]);
        rr.advance_after_bytes(3); // mode switch must reset the counter
        rr.advance_after_next(3);
        let got: Vec<_> = (0..9).map(|_| rr.get_next(None)).collect();
        let want: Vec<_> = [1, 1, 1, 2, 2, 2, 3, 3, 3].iter().map(|&n| id(n)).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn advance_after_bytes() {
        let mut rr = with_streams(&[1, 2, 3]);
        rr.advance_after_bytes(10);
        assert_eq!(rr.get_next(None), id(1));
        assert_eq!(rr.get_next(Some(5)), id(1));
        assert_eq!(rr.get_next(Some(5)), id(1));
        assert_eq!(rr.get_next(Some(10)), id(2));
        assert_eq!(rr.get_next(None), id(3));
    }

    #[test]
    fn advance_after_bytes_partial_consumption() {
        let mut rr = with_streams(&[1, 2, 3]);
        rr.advance_after_bytes(100);
        assert_eq!(rr.get_next(Some(60)), id(1));
        assert_eq!(rr.get_next(Some(40)), id(1)); // reaches 100, advances after
        assert_eq!(rr.get_next(Some(10)), id(2));
        assert_eq!(rr.get_next(Some(100)), id(2)); // overshoots, advances after
        assert_eq!(rr.get_next(None), id(3));
    }

    #[test]
    fn nexts_mode_alternates() {
        let mut rr = with_streams(&[1, 2]);
        rr.advance_after_next(2);
        let got: Vec<_> = (0..8).map(|_| rr.get_next(None)).collect();
        let want: Vec<_> = [1, 1, 2, 2, 1, 1, 2, 2].iter().map(|&n| id(n)).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn empty() {
        let mut rr = RoundRobin::new();
        assert!(rr.is_empty());
        assert!(!rr.erase(id(0)));
    }

    #[test]
    fn erase_around_cursor() {
        let mut rr = with_streams(&[1, 2, 3]);
        rr.advance_after_next(2);
        assert!(!rr.erase(id(9)));

        assert_eq!(rr.get_next(None), id(1));
        assert!(rr.erase(id(1)));
        // Erasing the cursor's element resets the counter: 2 gets two nexts
        assert_eq!(rr.get_next(None), id(2));
        assert_eq!(rr.get_next(None), id(2));
        // Erase cursor - 1
        assert!(rr.erase(id(2)));
        rr.insert(id(1));
        // Erase cursor + 1
        assert!(rr.erase(id(1)));

        assert_eq!(rr.get_next(None), id(3));
        assert!(rr.erase(id(3)));
        assert!(rr.is_empty());
    }

    #[test]
    fn erase_before_cursor_wraps() {
        let mut rr = with_streams(&[1, 2, 3]);
        rr.get_next(None);
        rr.get_next(None);
        assert!(rr.erase(id(2)));
        assert_eq!(rr.get_next(None), id(3));
        assert_eq!(rr.get_next(None), id(1));
    }

    #[test]
    fn insert_services_last_in_cycle() {
        let mut rr = with_streams(&[1, 2]);
        assert_eq!(rr.get_next(None), id(1));
        // 3 is inserted before the cursor, so it's serviced after 2
        rr.insert(id(3));
        assert_eq!(rr.get_next(None), id(2));
        assert_eq!(rr.get_next(None), id(3));
        assert_eq!(rr.get_next(None), id(1));
    }

    #[test]
    fn peek_and_clear() {
        let mut rr = with_streams(&[1, 2, 3]);
        assert_eq!(rr.peek_next(), id(1));
        assert_eq!(rr.peek_next(), id(1));
        for n in 4..=40 {
            rr.insert(id(n));
        }
        rr.clear();
        assert!(rr.is_empty());
    }

    #[test]
    fn erase_through_index_transitions() {
        let mut rr = with_streams(&[1, 2, 3]);
        // Push the list well past the build threshold
        for n in 4..=40 {
            rr.insert(id(n));
        }
        for _ in 0..20 {
            rr.get_next(None);
        }
        // Drain from both ends; crosses the destroy threshold on the way down
        for n in 1..20 {
            assert!(rr.erase(id(n)));
            assert!(rr.erase(id(40 - n)));
        }
        assert_eq!(rr.len(), 2);
    }

    #[test]
    fn deterministic_across_index_activation() {
        // Identical traces must produce identical schedules whether or not
        // the side table is active.
        let run = |force_index: bool| -> Vec<StreamId> {
            let mut rr = RoundRobin::new();
            rr.advance_after_next(2);
            for n in 1..=15 {
                rr.insert(id(n));
            }
            if force_index {
                rr.force_index();
            }
            let mut out = Vec::new();
            for _ in 0..7 {
                out.push(rr.get_next(None));
            }
            for n in [3u64, 15, 1, 8] {
                rr.erase(id(n));
            }
            for _ in 0..12 {
                out.push(rr.get_next(None));
            }
            for n in [2u64, 4, 5, 6, 7] {
                rr.erase(id(n));
            }
            for _ in 0..8 {
                out.push(rr.get_next(None));
            }
            out
        };
        assert_eq!(run(false), run(true));
    }

    #[test]
    fn mode_switch_resets_progress() {
        let mut rr = with_streams(&[1, 2]);
        rr.advance_after_next(3);
        rr.get_next(None);
        rr.get_next(None); // current = 2 of 3
        rr.advance_after_bytes(10); // switch resets current
        assert_eq!(rr.get_next(Some(9)), id(1));
        assert_eq!(rr.get_next(Some(1)), id(1)); // reaches 10, advances after
        assert_eq!(rr.get_next(None), id(2));
    }
}
