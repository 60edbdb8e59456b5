use std::collections::VecDeque;
use std::sync::Mutex;
use bytes::Bytes;
use tracing::trace;

/// Messages accepted by a session's `send` that were not moved into the engine yet. The total
///  size of queued messages is bounded, a message that does not fit is rejected as a whole.
pub struct SendBuffer {
    capacity: usize,
    inner: Mutex<SendBufferInner>,
}

#[derive(Default)]
struct SendBufferInner {
    messages: VecDeque<Bytes>,
    num_bytes: usize,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> SendBuffer {
        SendBuffer {
            capacity,
            inner: Default::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns false without changing the buffer if the message exceeds the remaining capacity
    pub fn push(&self, message: Bytes) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.num_bytes + message.len() > self.capacity {
            trace!("send buffer full: {} of {} bytes used, rejecting {} bytes", inner.num_bytes, self.capacity, message.len());
            return false;
        }

        inner.num_bytes += message.len();
        inner.messages.push_back(message);
        true
    }

    pub fn pop(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner.messages.pop_front()?;
        inner.num_bytes -= message.len();
        Some(message)
    }

    /// Size of the message [SendBuffer::pop] would return next
    pub fn front_len(&self) -> Option<usize> {
        self.inner.lock().unwrap().messages.front().map(|m| m.len())
    }

    pub fn num_bytes(&self) -> usize {
        self.inner.lock().unwrap().num_bytes
    }

    pub fn num_messages(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_messages() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.messages.clear();
        inner.num_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty_buffer(vec![], 10, true)]
    #[case::fits_exactly(vec![4, 2], 4, true)]
    #[case::one_too_many(vec![4, 2], 5, false)]
    #[case::larger_than_capacity(vec![], 11, false)]
    fn test_push(#[case] queued: Vec<usize>, #[case] new_len: usize, #[case] expected: bool) {
        let buffer = SendBuffer::new(10);
        for len in queued {
            assert!(buffer.push(Bytes::from(vec![1u8; len])));
        }
        let before = buffer.num_bytes();

        assert_eq!(buffer.push(Bytes::from(vec![2u8; new_len])), expected);
        assert_eq!(buffer.num_bytes(), if expected { before + new_len } else { before });
    }

    #[test]
    fn test_fifo_and_rejection_keeps_queued_data() {
        let buffer = SendBuffer::new(6);
        assert!(buffer.push(Bytes::from_static(b"abc")));
        assert!(buffer.push(Bytes::from_static(b"de")));
        assert!(!buffer.push(Bytes::from_static(b"fg")));

        assert_eq!(buffer.pop(), Some(Bytes::from_static(b"abc")));
        assert!(buffer.push(Bytes::from_static(b"fg")));
        assert_eq!(buffer.pop(), Some(Bytes::from_static(b"de")));
        assert_eq!(buffer.pop(), Some(Bytes::from_static(b"fg")));
        assert_eq!(buffer.pop(), None);
        assert_eq!(buffer.num_bytes(), 0);
    }

    #[test]
    fn test_clear() {
        let buffer = SendBuffer::new(100);
        buffer.push(Bytes::from_static(b"abc"));
        buffer.push(Bytes::from_static(b"def"));

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.num_bytes(), 0);
        assert_eq!(buffer.capacity(), 100);
    }
}
