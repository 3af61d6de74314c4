//! # SortedQ: Sequenced Ring Buffer
//!
//! Fixed-capacity array addressed by absolute sequence number. Slot for `seq`
//! is `seq % capacity`; the valid window is `[tail, tail + capacity)`.
//!
//! Each slot carries a flag byte for protocol hints (NAK sent, NCF seen,
//! permanently lost) addressed identically to the values. Flags are cleared
//! whenever the tail moves past a slot.
//!
//! A stream owns two of these: the data window (pooled packet buffers) and the
//! NAK window (retransmission records). [`SyncSortedQ`] wraps one in a mutex;
//! [`SyncSortedQ::lock`] returns the guard for callers that need several
//! operations under one acquisition.

use parking_lot::{Mutex, MutexGuard};

/// A NAK has been sent for this sequence number.
pub const FLAG_NAK_SENT: u8 = 0x01;
/// The source has confirmed a NAK for this sequence number.
pub const FLAG_NCF_SEEN: u8 = 0x02;
/// Repair was abandoned; the sequence number will never be delivered.
pub const FLAG_LOST: u8 = 0x04;

/// Rejected `put`. Each variant hands the value back so the caller can
/// release it.
#[derive(Debug, PartialEq, Eq)]
pub enum PutError<T> {
    /// `seq < tail`.
    TooOld(T),
    /// `seq >= tail + capacity`.
    TooNew(T),
    /// Slot already occupied; the stored value is untouched.
    Duplicate(T),
}

impl<T> PutError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PutError::TooOld(v) | PutError::TooNew(v) | PutError::Duplicate(v) => v,
        }
    }
}

/// Result of [`SortedQ::get`].
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<'a, T> {
    Present(&'a T),
    /// Inside the window but nothing stored yet.
    NotArrived,
    TooOld,
    TooNew,
}

pub struct SortedQ<T> {
    slots: Box<[Option<T>]>,
    flags: Box<[u8]>,
    tail: u64,
    len: usize,
}

impl<T> SortedQ<T> {
    /// Create a queue whose window starts at `tail`.
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize, tail: u64) -> Self {
        assert!(capacity > 0, "SortedQ capacity must be non-zero");
        SortedQ {
            slots: (0..capacity).map(|_| None).collect(),
            flags: vec![0u8; capacity].into_boxed_slice(),
            tail,
            len: 0,
        }
    }

    #[inline]
    fn index(&self, seq: u64) -> usize {
        (seq % self.slots.len() as u64) as usize
    }

    #[inline]
    fn in_window(&self, seq: u64) -> bool {
        seq >= self.tail && seq - self.tail < self.slots.len() as u64
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// First sequence number past the window.
    pub fn limit(&self) -> u64 {
        self.tail + self.slots.len() as u64
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn put(&mut self, seq: u64, value: T) -> Result<(), PutError<T>> {
        if seq < self.tail {
            return Err(PutError::TooOld(value));
        }
        if !self.in_window(seq) {
            return Err(PutError::TooNew(value));
        }
        let idx = self.index(seq);
        if self.slots[idx].is_some() {
            return Err(PutError::Duplicate(value));
        }
        self.slots[idx] = Some(value);
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, seq: u64) -> Lookup<'_, T> {
        if seq < self.tail {
            return Lookup::TooOld;
        }
        if !self.in_window(seq) {
            return Lookup::TooNew;
        }
        match &self.slots[self.index(seq)] {
            Some(v) => Lookup::Present(v),
            None => Lookup::NotArrived,
        }
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut T> {
        if !self.in_window(seq) {
            return None;
        }
        let idx = self.index(seq);
        self.slots[idx].as_mut()
    }

    pub fn contains(&self, seq: u64) -> bool {
        matches!(self.get(seq), Lookup::Present(_))
    }

    /// Remove the value stored at `seq`, leaving flags intact.
    pub fn take(&mut self, seq: u64) -> Option<T> {
        if !self.in_window(seq) {
            return None;
        }
        let idx = self.index(seq);
        let taken = self.slots[idx].take();
        if taken.is_some() {
            self.len -= 1;
        }
        taken
    }

    /// Clear the tail slot (value and flags) and move the tail forward by one,
    /// whether or not anything was stored there.
    pub fn advance_tail(&mut self) -> Option<T> {
        let idx = self.index(self.tail);
        let taken = self.slots[idx].take();
        if taken.is_some() {
            self.len -= 1;
        }
        self.flags[idx] = 0;
        self.tail += 1;
        taken
    }

    /// Advance the tail until it reaches `target`, dropping everything passed.
    /// Returns the number of values dropped. No-op if `target <= tail`.
    pub fn advance_tail_to(&mut self, target: u64) -> usize {
        if target <= self.tail {
            return 0;
        }
        let before = self.len;
        if target - self.tail >= self.slots.len() as u64 {
            for slot in self.slots.iter_mut() {
                *slot = None;
            }
            self.flags.fill(0);
            self.len = 0;
            self.tail = target;
        } else {
            while self.tail < target {
                self.advance_tail();
            }
        }
        before - self.len
    }

    /// Flag byte for `seq`; zero outside the window.
    pub fn flags(&self, seq: u64) -> u8 {
        if self.in_window(seq) {
            self.flags[self.index(seq)]
        } else {
            0
        }
    }

    /// OR `bits` into the flag byte. Returns false outside the window.
    pub fn set_flags(&mut self, seq: u64, bits: u8) -> bool {
        if !self.in_window(seq) {
            return false;
        }
        let idx = self.index(seq);
        self.flags[idx] |= bits;
        true
    }

    pub fn clear_flags(&mut self, seq: u64, bits: u8) {
        if self.in_window(seq) {
            let idx = self.index(seq);
            self.flags[idx] &= !bits;
        }
    }

    /// Occupied slots in sequence order, starting at the tail.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> + '_ {
        (self.tail..self.limit()).filter_map(move |seq| match &self.slots[self.index(seq)] {
            Some(v) => Some((seq, v)),
            None => None,
        })
    }

    /// Drop every stored value and flag; the tail is unchanged.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.flags.fill(0);
        self.len = 0;
    }
}

impl<T> std::fmt::Debug for SortedQ<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedQ")
            .field("tail", &self.tail)
            .field("capacity", &self.slots.len())
            .field("len", &self.len)
            .finish()
    }
}

// ─── Locked Variant ──────────────────────────────────────────────────────────

/// Mutex-guarded [`SortedQ`]. Single-operation helpers lock internally;
/// [`lock`](Self::lock) hands out the guard for multi-step work.
pub struct SyncSortedQ<T> {
    inner: Mutex<SortedQ<T>>,
}

impl<T> SyncSortedQ<T> {
    pub fn new(capacity: usize, tail: u64) -> Self {
        SyncSortedQ {
            inner: Mutex::new(SortedQ::new(capacity, tail)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SortedQ<T>> {
        self.inner.lock()
    }

    pub fn put(&self, seq: u64, value: T) -> Result<(), PutError<T>> {
        self.inner.lock().put(seq, value)
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.inner.lock().contains(seq)
    }

    pub fn take(&self, seq: u64) -> Option<T> {
        self.inner.lock().take(seq)
    }

    pub fn advance_tail(&self) -> Option<T> {
        self.inner.lock().advance_tail()
    }

    pub fn tail(&self) -> u64 {
        self.inner.lock().tail()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn flags(&self, seq: u64) -> u8 {
        self.inner.lock().flags(seq)
    }

    pub fn set_flags(&self, seq: u64, bits: u8) -> bool {
        self.inner.lock().set_flags(seq, bits)
    }
}

impl<T> std::fmt::Debug for SyncSortedQ<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Some(q) => q.fmt(f),
            None => f.write_str("SyncSortedQ(<locked>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get() {
        let mut q = SortedQ::new(8, 100);
        q.put(103, "c").unwrap();
        assert_eq!(q.get(103), Lookup::Present(&"c"));
        assert_eq!(q.get(102), Lookup::NotArrived);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn put_too_old_and_too_new() {
        let mut q = SortedQ::new(4, 10);
        assert_eq!(q.put(9, 1), Err(PutError::TooOld(1)));
        assert_eq!(q.put(14, 2), Err(PutError::TooNew(2)));
        assert!(q.put(13, 3).is_ok());
        assert_eq!(q.get(9), Lookup::TooOld);
        assert_eq!(q.get(14), Lookup::TooNew);
    }

    #[test]
    fn duplicate_does_not_overwrite() {
        let mut q = SortedQ::new(4, 0);
        q.put(2, "first").unwrap();
        let err = q.put(2, "second").unwrap_err();
        assert_eq!(err.into_inner(), "second");
        assert_eq!(q.get(2), Lookup::Present(&"first"));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn advance_tail_moves_by_one_even_when_empty() {
        let mut q: SortedQ<u32> = SortedQ::new(4, 5);
        assert_eq!(q.advance_tail(), None);
        assert_eq!(q.tail(), 6);
        q.put(6, 60).unwrap();
        assert_eq!(q.advance_tail(), Some(60));
        assert_eq!(q.tail(), 7);
        assert!(q.is_empty());
    }

    #[test]
    fn advance_frees_slot_for_wrapped_sequence() {
        let mut q = SortedQ::new(4, 0);
        for s in 0..4 {
            q.put(s, s).unwrap();
        }
        assert!(matches!(q.put(4, 4), Err(PutError::TooNew(4))));
        assert_eq!(q.advance_tail(), Some(0));
        q.put(4, 4).unwrap();
        assert_eq!(q.get(4), Lookup::Present(&4));
    }

    #[test]
    fn flags_cleared_on_advance() {
        let mut q: SortedQ<()> = SortedQ::new(4, 0);
        assert!(q.set_flags(1, FLAG_NAK_SENT));
        assert!(q.set_flags(1, FLAG_NCF_SEEN));
        assert_eq!(q.flags(1), FLAG_NAK_SENT | FLAG_NCF_SEEN);
        q.clear_flags(1, FLAG_NAK_SENT);
        assert_eq!(q.flags(1), FLAG_NCF_SEEN);
        q.advance_tail_to(2);
        // Slot 1 is now addressed as seq 5.
        assert_eq!(q.flags(5), 0);
        assert!(!q.set_flags(0, FLAG_LOST));
    }

    #[test]
    fn advance_tail_to_far_jump_clears_everything() {
        let mut q = SortedQ::new(4, 0);
        q.put(1, 'a').unwrap();
        q.put(3, 'b').unwrap();
        assert_eq!(q.advance_tail_to(1000), 2);
        assert_eq!(q.tail(), 1000);
        assert!(q.is_empty());
        assert_eq!(q.advance_tail_to(10), 0);
        assert_eq!(q.tail(), 1000);
    }

    #[test]
    fn iter_in_sequence_order_across_wrap() {
        let mut q = SortedQ::new(4, 6);
        q.put(9, 9).unwrap();
        q.put(6, 6).unwrap();
        q.put(8, 8).unwrap();
        let seqs: Vec<u64> = q.iter().map(|(s, _)| s).collect();
        assert_eq!(seqs, vec![6, 8, 9]);
    }

    #[test]
    fn take_leaves_flags() {
        let mut q = SortedQ::new(4, 0);
        q.put(0, 'x').unwrap();
        q.set_flags(0, FLAG_NAK_SENT);
        assert_eq!(q.take(0), Some('x'));
        assert_eq!(q.flags(0), FLAG_NAK_SENT);
        assert_eq!(q.take(0), None);
    }

    #[test]
    fn sync_variant_shares_state_with_guard() {
        let q = SyncSortedQ::new(8, 0);
        q.put(0, 10).unwrap();
        {
            let mut guard = q.lock();
            guard.put(1, 11).unwrap();
            assert_eq!(guard.advance_tail(), Some(10));
        }
        assert_eq!(q.tail(), 1);
        assert!(q.contains(1));
        assert_eq!(q.len(), 1);
    }
}
