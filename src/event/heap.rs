//! Binary min-heap
//!
//! Priority queue shared by the event scheduler (ordered by due tick) and the
//! pathfinder's open set (ordered by `f` score). Elements carry their own score
//! and an identity key so they can be removed or rescored in place.

use std::fmt;

use tracing::warn;

/// An element that can be ordered by the binary heap
pub trait Scored {
    /// Identity used by `remove` and `rescore` to locate the element
    type Key: PartialEq + fmt::Debug;

    /// Heap priority; lower scores are popped first
    fn score(&self) -> u64;

    /// Identity of this element
    fn key(&self) -> Self::Key;
}

/// Array-backed binary min-heap
///
/// Ties between equal scores are resolved by the heap's internal layout, not by
/// insertion order.
#[derive(Clone)]
pub struct BinaryHeap<T> {
    content: Vec<T>,
}

impl<T: Scored> BinaryHeap<T> {
    /// Create an empty heap
    pub fn new() -> Self {
        Self {
            content: Vec::new(),
        }
    }

    /// Create an empty heap with reserved capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            content: Vec::with_capacity(capacity),
        }
    }

    /// Number of elements in the heap
    #[inline]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Check if the heap holds no elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Reference to the element with the lowest score
    #[inline]
    pub fn peek(&self) -> Option<&T> {
        self.content.first()
    }

    /// True when the heap is empty or its next element scores above `score`
    pub fn has_executed_until(&self, score: u64) -> bool {
        match self.peek() {
            Some(next) => next.score() > score,
            None => true,
        }
    }

    /// Push an element, O(log n)
    pub fn push(&mut self, element: T) {
        self.content.push(element);
        self.sift_up(self.content.len() - 1);
    }

    /// Pop the element with the lowest score, O(log n)
    pub fn pop(&mut self) -> Option<T> {
        if self.content.is_empty() {
            return None;
        }

        let result = self.content.swap_remove(0);

        if !self.content.is_empty() {
            self.sift_down(0);
        }

        Some(result)
    }

    /// Remove an element by identity
    ///
    /// Locating the element is a linear scan from the back (removals usually
    /// target events far in the future); restoring the heap is O(log n).
    pub fn remove(&mut self, key: &T::Key) -> Option<T> {
        let Some(index) = self.content.iter().rposition(|e| e.key() == *key) else {
            warn!(key = ?key, "Attempted to remove a node that does not exist in the heap");
            return None;
        };

        let removed = self.content.swap_remove(index);

        // The removed node was the tail: nothing moved
        if index == self.content.len() {
            return Some(removed);
        }

        if self.content[index].score() < removed.score() {
            self.sift_up(index);
        } else {
            self.sift_down(index);
        }

        Some(removed)
    }

    /// Replace an element with a rescored copy of itself and restore ordering
    ///
    /// Scores may only decrease through this call: the element is moved toward
    /// the root and never sunk.
    pub fn rescore(&mut self, element: T) -> bool {
        let key = element.key();
        let Some(index) = self.content.iter().position(|e| e.key() == key) else {
            warn!(key = ?key, "Attempted to rescore a node that does not exist in the heap");
            return false;
        };

        self.content[index] = element;
        self.sift_up(index);
        true
    }

    /// Check whether an element with this identity is queued
    pub fn contains(&self, key: &T::Key) -> bool {
        self.content.iter().any(|e| e.key() == *key)
    }

    /// Drop every element
    pub fn clear(&mut self) {
        self.content.clear();
    }

    /// Iterate over the elements in heap order (not sorted)
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.content.iter()
    }

    /// Move the element at `n` toward the root while it beats its parent
    fn sift_up(&mut self, mut n: usize) {
        let score = self.content[n].score();

        while n > 0 {
            let parent = (n - 1) / 2;

            if score >= self.content[parent].score() {
                break;
            }

            self.content.swap(n, parent);
            n = parent;
        }
    }

    /// Move the element at `n` toward the leaves while a child beats it
    fn sift_down(&mut self, mut n: usize) {
        let length = self.content.len();
        let score = self.content[n].score();

        loop {
            let right = (n + 1) * 2;
            let left = right - 1;
            let mut swap = None;
            let mut best = score;

            if left < length && self.content[left].score() < best {
                swap = Some(left);
                best = self.content[left].score();
            }

            if right < length && self.content[right].score() < best {
                swap = Some(right);
            }

            match swap {
                Some(child) => {
                    self.content.swap(n, child);
                    n = child;
                }
                None => break,
            }
        }
    }
}

impl<T: Scored> Default for BinaryHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scored> fmt::Debug for BinaryHeap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryHeap")
            .field("len", &self.content.len())
            .field("next_score", &self.peek().map(Scored::score))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Node {
        id: u32,
        score: u64,
    }

    impl Scored for Node {
        type Key = u32;

        fn score(&self) -> u64 {
            self.score
        }

        fn key(&self) -> u32 {
            self.id
        }
    }

    fn node(id: u32, score: u64) -> Node {
        Node { id, score }
    }

    fn drain(heap: &mut BinaryHeap<Node>) -> Vec<u64> {
        let mut scores = Vec::new();
        while let Some(n) = heap.pop() {
            scores.push(n.score);
        }
        scores
    }

    #[test]
    fn test_push_pop_order() {
        let mut heap = BinaryHeap::new();
        for (id, score) in [9, 2, 7, 4, 4, 1, 8].into_iter().enumerate() {
            heap.push(node(id as u32, score));
        }

        assert_eq!(heap.len(), 7);
        assert_eq!(heap.peek().map(|n| n.score), Some(1));
        assert_eq!(drain(&mut heap), vec![1, 2, 4, 4, 7, 8, 9]);
        assert!(heap.is_empty());
        assert!(heap.pop().is_none());
    }

    #[test]
    fn test_has_executed_until() {
        let mut heap = BinaryHeap::new();
        assert!(heap.has_executed_until(0));

        heap.push(node(1, 5));
        assert!(heap.has_executed_until(4));
        assert!(!heap.has_executed_until(5));
        assert!(!heap.has_executed_until(6));
    }

    #[test]
    fn test_remove_middle_element() {
        let mut heap = BinaryHeap::new();
        for id in 0..10 {
            heap.push(node(id, u64::from(id) * 3));
        }

        let removed = heap.remove(&4);
        assert_eq!(removed, Some(node(4, 12)));
        assert!(!heap.contains(&4));
        assert_eq!(drain(&mut heap), vec![0, 3, 6, 9, 15, 18, 21, 24, 27]);
    }

    #[test]
    fn test_remove_tail_and_missing() {
        let mut heap = BinaryHeap::new();
        heap.push(node(1, 1));
        heap.push(node(2, 2));

        assert_eq!(heap.remove(&2), Some(node(2, 2)));
        assert_eq!(heap.remove(&2), None);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_rescore_decrease() {
        let mut heap = BinaryHeap::new();
        heap.push(node(1, 10));
        heap.push(node(2, 20));
        heap.push(node(3, 30));

        assert!(heap.rescore(node(3, 5)));
        assert_eq!(heap.pop(), Some(node(3, 5)));

        assert!(!heap.rescore(node(99, 1)));
        assert_eq!(heap.len(), 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u64),
        Pop,
        Remove(usize),
        Rescore(usize, u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..1000).prop_map(Op::Push),
            Just(Op::Pop),
            (0usize..64).prop_map(Op::Remove),
            ((0usize..64), (0u64..1000)).prop_map(|(i, d)| Op::Rescore(i, d)),
        ]
    }

    proptest! {
        #[test]
        fn prop_pop_returns_global_minimum(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let mut heap = BinaryHeap::new();
            let mut model: Vec<Node> = Vec::new();
            let mut next_id = 0u32;

            for op in ops {
                match op {
                    Op::Push(score) => {
                        let n = node(next_id, score);
                        next_id += 1;
                        heap.push(n);
                        model.push(n);
                    }
                    Op::Pop => {
                        let popped = heap.pop();
                        let min = model.iter().map(|n| n.score).min();
                        prop_assert_eq!(popped.map(|n| n.score), min);
                        if let Some(p) = popped {
                            model.retain(|n| n.id != p.id);
                        }
                    }
                    Op::Remove(i) => {
                        if model.is_empty() {
                            continue;
                        }
                        let target = model[i % model.len()];
                        prop_assert_eq!(heap.remove(&target.id), Some(target));
                        model.retain(|n| n.id != target.id);
                    }
                    Op::Rescore(i, decrease) => {
                        if model.is_empty() {
                            continue;
                        }
                        let index = i % model.len();
                        let lowered = node(model[index].id, model[index].score.saturating_sub(decrease));
                        prop_assert!(heap.rescore(lowered));
                        model[index] = lowered;
                    }
                }
                prop_assert_eq!(heap.len(), model.len());
            }

            let mut expected: Vec<u64> = model.iter().map(|n| n.score).collect();
            expected.sort_unstable();
            prop_assert_eq!(drain(&mut heap), expected);
        }
    }
}
