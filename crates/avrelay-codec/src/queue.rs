//! Buffers shared by the codec engines.

use std::collections::VecDeque;

use crate::Received;

/// Outputs waiting to be drained, plus the end-of-stream latch.
#[derive(Debug)]
pub(crate) struct OutputQueue<T> {
    items: VecDeque<T>,
    limit: usize,
    finished: bool,
}

impl<T> OutputQueue<T> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(limit),
            limit,
            finished: false,
        }
    }

    /// Whether new input must wait for a drain.
    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.limit
    }

    pub(crate) fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub(crate) fn finish(&mut self) {
        self.finished = true;
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn pop(&mut self) -> Received<T> {
        match self.items.pop_front() {
            Some(item) => Received::Output(item),
            None if self.finished => Received::EndOfStream,
            None => Received::NeedMoreInput,
        }
    }
}

/// Accumulates raw bytes and releases them in fixed-size codec frames.
#[derive(Debug)]
pub(crate) struct FrameAccumulator {
    pending: Vec<u8>,
    frame_bytes: usize,
}

impl FrameAccumulator {
    pub(crate) fn new(frame_bytes: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_bytes * 2),
            frame_bytes,
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next whole frame, if one is buffered.
    pub(crate) fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.pending.len() < self.frame_bytes {
            return None;
        }
        let rest = self.pending.split_off(self.frame_bytes);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Whatever is left, shorter than a frame.
    pub(crate) fn take_tail(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub(crate) fn buffered(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_reports_need_more_then_end() {
        let mut queue = OutputQueue::new(2);
        assert!(matches!(queue.pop(), Received::<u8>::NeedMoreInput));

        queue.push(1u8);
        queue.push(2u8);
        assert!(queue.is_full());
        queue.finish();

        assert!(matches!(queue.pop(), Received::Output(1)));
        assert!(matches!(queue.pop(), Received::Output(2)));
        assert!(matches!(queue.pop(), Received::EndOfStream));
    }

    #[test]
    fn test_accumulator_splits_frames() {
        let mut acc = FrameAccumulator::new(4);
        acc.extend(&[1, 2, 3]);
        assert!(acc.next_frame().is_none());

        acc.extend(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(acc.next_frame(), Some(vec![1, 2, 3, 4]));
        assert_eq!(acc.next_frame(), Some(vec![5, 6, 7, 8]));
        assert!(acc.next_frame().is_none());
        assert_eq!(acc.buffered(), 1);
        assert_eq!(acc.take_tail(), Some(vec![9]));
        assert_eq!(acc.take_tail(), None);
    }
}
