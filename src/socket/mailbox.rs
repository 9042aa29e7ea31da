use std::collections::VecDeque;

use bytes::Bytes;

/// A socket's queue of received, not yet consumed payloads. Payloads are kept whole so that a
///  receive never splits a packet.
#[derive(Default)]
pub struct Mailbox {
    queue: VecDeque<Bytes>,
}

impl Mailbox {
    pub fn push(&mut self, payload: Bytes) {
        self.queue.push_back(payload);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Copies as many whole queued payloads into `buf` as fit. Returns `None` if nothing is
    ///  queued, and `Some(0)` if the first payload alone does not fit into `buf`. In both cases
    ///  the queue is unchanged.
    pub fn take_into(&mut self, buf: &mut [u8]) -> Option<usize> {
        if self.is_empty() {
            return None;
        }

        let mut copied = 0;
        while let Some(next) = self.queue.front() {
            if copied + next.len() > buf.len() {
                break;
            }
            buf[copied..copied + next.len()].copy_from_slice(next);
            copied += next.len();
            self.queue.pop_front();
        }
        Some(copied)
    }
}
