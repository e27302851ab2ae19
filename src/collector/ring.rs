use serde::{Deserialize, Serialize};

/// Fixed-capacity ring of history slots with a cursor on the current slot.
///
/// Slots are usually addressed by wall-clock position (second of minute,
/// hour of week, ...) via [`RingBuffer::seek`]; relative accessors wrap
/// around the end of the backing storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RingParts<T>")]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    cursor: usize,
}

#[derive(Deserialize)]
struct RingParts<T> {
    slots: Vec<T>,
    cursor: usize,
}

impl<T> TryFrom<RingParts<T>> for RingBuffer<T> {
    type Error = String;

    fn try_from(parts: RingParts<T>) -> Result<Self, Self::Error> {
        if parts.slots.is_empty() {
            return Err("ring buffer without slots".to_string());
        }
        if parts.cursor >= parts.slots.len() {
            return Err(format!(
                "cursor {} out of range for {} slots",
                parts.cursor,
                parts.slots.len()
            ));
        }
        Ok(Self {
            slots: parts.slots,
            cursor: parts.cursor,
        })
    }
}

impl<T: Clone + Default> RingBuffer<T> {
    /// Creates a ring of `capacity` default slots. A zero capacity is
    /// raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![T::default(); capacity.max(1)],
            cursor: 0,
        }
    }
}

impl<T> RingBuffer<T> {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Moves the cursor to an absolute slot.
    pub fn seek(&mut self, slot: usize) {
        self.cursor = slot % self.slots.len();
    }

    pub fn current(&self) -> &T {
        &self.slots[self.cursor]
    }

    pub fn current_mut(&mut self) -> &mut T {
        &mut self.slots[self.cursor]
    }

    pub fn get(&self, slot: usize) -> &T {
        &self.slots[slot % self.slots.len()]
    }

    pub fn set(&mut self, slot: usize, value: T) {
        let n = self.slots.len();
        self.slots[slot % n] = value;
    }

    /// The slot `n` positions before the cursor.
    pub fn back(&self, n: usize) -> &T {
        let cap = self.slots.len();
        &self.slots[(self.cursor + cap - n % cap) % cap]
    }

    /// Advances the cursor and stores `value` there.
    pub fn push(&mut self, value: T) {
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.slots[self.cursor] = value;
    }

    /// All slots from oldest to newest, ending at the cursor.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let cap = self.slots.len();
        (1..=cap).map(move |i| &self.slots[(self.cursor + i) % cap])
    }

    /// The `n` most recent slots including the current one, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &T> {
        let n = n.min(self.slots.len());
        (0..n).rev().map(move |i| self.back(i))
    }

    /// Backing storage in slot order.
    pub fn as_slice(&self) -> &[T] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ring_buffer_wraps() {
        let mut ring = RingBuffer::<i32>::new(4);
        for v in 1..=5 {
            ring.push(v);
        }
        assert_eq!(*ring.current(), 5);
        assert_eq!(*ring.back(1), 4);
        assert_eq!(*ring.back(3), 2);
        let values: Vec<_> = ring.iter().copied().collect();
        assert_eq!(values, vec![2, 3, 4, 5]);
        let recent: Vec<_> = ring.recent(2).copied().collect();
        assert_eq!(recent, vec![4, 5]);
    }

    #[test]
    fn test_seek_addresses_absolute_slots() {
        let mut ring = RingBuffer::<i32>::new(60);
        ring.seek(0);
        *ring.current_mut() = 7;
        ring.seek(59);
        *ring.current_mut() = 3;
        ring.seek(0);
        assert_eq!(*ring.back(1), 3);
        ring.seek(61);
        assert_eq!(ring.cursor(), 1);
        assert_eq!(*ring.back(1), 7);
    }

    #[test]
    fn test_rejects_corrupt_snapshot() {
        let bytes = bincode::serialize(&(Vec::<i32>::new(), 0usize)).unwrap();
        assert!(bincode::deserialize::<RingBuffer<i32>>(&bytes).is_err());
        let bytes = bincode::serialize(&(vec![1, 2, 3], 5usize)).unwrap();
        assert!(bincode::deserialize::<RingBuffer<i32>>(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn test_back_matches_push_history(cap in 1usize..50, values in prop::collection::vec(any::<i32>(), 1..200)) {
            let mut ring = RingBuffer::<i32>::new(cap);
            for v in &values {
                ring.push(*v);
            }
            for n in 0..cap.min(values.len()) {
                prop_assert_eq!(*ring.back(n), values[values.len() - 1 - n]);
            }
            // a full turn returns to the cursor
            prop_assert_eq!(ring.back(cap), ring.current());
        }

        #[test]
        fn test_iter_ends_at_cursor(cap in 1usize..50, pushes in 0usize..200) {
            let mut ring = RingBuffer::<usize>::new(cap);
            for i in 0..pushes {
                ring.push(i + 1);
            }
            let all: Vec<_> = ring.iter().copied().collect();
            prop_assert_eq!(all.len(), cap);
            prop_assert_eq!(all.last(), Some(ring.current()));
        }

        #[test]
        fn test_snapshot_round_trip(cap in 1usize..100, values in prop::collection::vec(any::<i32>(), 0..300)) {
            let mut ring = RingBuffer::<i32>::new(cap);
            for v in values {
                ring.push(v);
            }
            let bytes = bincode::serialize(&ring).unwrap();
            let back: RingBuffer<i32> = bincode::deserialize(&bytes).unwrap();
            prop_assert_eq!(&back, &ring);
            prop_assert_eq!(bincode::serialize(&back).unwrap(), bytes);
        }
    }
}
