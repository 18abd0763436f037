// Piece selection: reader windows first, then sequential order.

use std::collections::BTreeMap;

use bitvec::prelude::*;

/// Tracks which pieces are wanted, in flight or done, plus the read-ahead
/// windows of active readers.
///
/// A piece is handed to at most one peer at a time, except for pieces inside
/// a reader window once nothing else is left for that peer (end game). A
/// duplicate download of the same piece is harmless; the first verified copy
/// wins.
#[derive(Debug)]
pub struct PiecePicker {
    done: BitVec,
    wanted: BitVec,
    in_flight: Vec<u16>,
    /// reader id -> pieces `start..end` the reader is about to consume.
    windows: BTreeMap<u64, (usize, usize)>,
    next_reader: u64,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        Self {
            done: bitvec![0; piece_count],
            wanted: bitvec![0; piece_count],
            in_flight: vec![0; piece_count],
            windows: BTreeMap::new(),
            next_reader: 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.done.len()
    }

    pub fn want_all(&mut self) {
        self.wanted.fill(true);
    }

    pub fn is_done(&self, index: usize) -> bool {
        self.done.get(index).is_some_and(|b| *b)
    }

    pub fn all_done(&self) -> bool {
        self.done.all()
    }

    pub fn register_reader(&mut self) -> u64 {
        let id = self.next_reader;
        self.next_reader += 1;
        id
    }

    /// Point a reader's window at `count` pieces starting from `first`.
    pub fn set_window(&mut self, reader: u64, first: usize, count: usize) {
        let end = first.saturating_add(count).min(self.piece_count());
        self.windows.insert(reader, (first.min(end), end));
    }

    pub fn remove_reader(&mut self, reader: u64) {
        self.windows.remove(&reader);
    }

    pub fn active_readers(&self) -> usize {
        self.windows.len()
    }

    /// Claim the next piece to download from a peer advertising `peer_has`.
    pub fn pick(&mut self, peer_has: &BitSlice<u8, Msb0>) -> Option<usize> {
        let available = |i: usize, done: &BitVec| {
            !done[i] && peer_has.get(i).is_some_and(|b| *b)
        };

        let mut end_game = None;
        for &(start, end) in self.windows.values() {
            for i in start..end {
                if !available(i, &self.done) {
                    continue;
                }
                if self.in_flight[i] == 0 {
                    self.in_flight[i] += 1;
                    return Some(i);
                }
                if end_game.is_none() {
                    end_game = Some(i);
                }
            }
        }

        let sequential = (0..self.piece_count())
            .find(|&i| self.wanted[i] && self.in_flight[i] == 0 && available(i, &self.done));
        let choice = sequential.or(end_game)?;
        self.in_flight[choice] = self.in_flight[choice].saturating_add(1);
        Some(choice)
    }

    /// Give back a claim that did not produce a verified piece.
    pub fn release(&mut self, index: usize) {
        if let Some(n) = self.in_flight.get_mut(index) {
            *n = n.saturating_sub(1);
        }
    }

    /// Record a verified piece. Returns `false` if it was already done.
    /// The claim that produced it is released separately.
    pub fn complete(&mut self, index: usize) -> bool {
        if index >= self.done.len() || self.done[index] {
            return false;
        }
        self.done.set(index, true);
        true
    }

    pub fn remaining_bytes(&self, piece_len: impl Fn(usize) -> u64) -> u64 {
        self.done.iter_zeros().map(piece_len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(n: usize) -> BitVec<u8, Msb0> {
        bitvec![u8, Msb0; 1; n]
    }

    #[test]
    fn test_nothing_picked_until_wanted() {
        let mut picker = PiecePicker::new(4);
        assert_eq!(picker.pick(&all(4)), None);
        picker.want_all();
        assert_eq!(picker.pick(&all(4)), Some(0));
        assert_eq!(picker.pick(&all(4)), Some(1));
    }

    #[test]
    fn test_reader_window_takes_priority() {
        let mut picker = PiecePicker::new(10);
        picker.want_all();
        let reader = picker.register_reader();
        picker.set_window(reader, 6, 2);
        assert_eq!(picker.pick(&all(10)), Some(6));
        assert_eq!(picker.pick(&all(10)), Some(7));
        assert_eq!(picker.pick(&all(10)), Some(0));

        picker.remove_reader(reader);
        assert_eq!(picker.active_readers(), 0);
        assert_eq!(picker.pick(&all(10)), Some(1));
    }

    #[test]
    fn test_respects_peer_bitfield() {
        let mut picker = PiecePicker::new(4);
        picker.want_all();
        let mut has = bitvec![u8, Msb0; 0; 4];
        has.set(2, true);
        assert_eq!(picker.pick(&has), Some(2));
        assert_eq!(picker.pick(&has), None);
    }

    #[test]
    fn test_release_and_complete() {
        let mut picker = PiecePicker::new(2);
        picker.want_all();
        assert_eq!(picker.pick(&all(2)), Some(0));
        picker.release(0);
        assert_eq!(picker.pick(&all(2)), Some(0));
        assert!(picker.complete(0));
        assert!(!picker.complete(0));
        assert!(picker.is_done(0));
        assert_eq!(picker.pick(&all(2)), Some(1));
        assert!(picker.complete(1));
        assert!(picker.all_done());
        assert_eq!(picker.pick(&all(2)), None);
    }

    #[test]
    fn test_end_game_duplicates_window_pieces_only() {
        let mut picker = PiecePicker::new(3);
        picker.want_all();
        let reader = picker.register_reader();
        picker.set_window(reader, 0, 1);
        assert_eq!(picker.pick(&all(3)), Some(0));
        assert_eq!(picker.pick(&all(3)), Some(1));
        assert_eq!(picker.pick(&all(3)), Some(2));
        // Everything is claimed; only the window piece gets a second claim.
        assert_eq!(picker.pick(&all(3)), Some(0));
    }

    #[test]
    fn test_remaining_bytes() {
        let mut picker = PiecePicker::new(3);
        picker.complete(1);
        assert_eq!(picker.remaining_bytes(|i| if i == 2 { 5 } else { 10 }), 15);
    }
}
