//! Ordered handoff buffer between a producing thread and a consuming thread.
//!
//! Each queue has one owning producer and one owning consumer. The mutex
//! covers only the internal buffer, so the consumer's `accept_all` is a
//! constant-time swap and the producer blocks only on lock acquisition.
//! There is no growth bound; backpressure is the emitter's concern and is
//! observable through `len` in status snapshots.

use std::sync::Mutex;

use crate::message::Message;

#[derive(Debug, Default)]
pub struct Queue {
    buffer: Mutex<Vec<Message>>,
}

impl Queue {
    pub fn new() -> Queue {
        Queue::default()
    }

    /// Append one message.
    pub fn enqueue(&self, message: Message) {
        // Lock poisoning means a peer thread panicked mid-push; treat as fatal.
        self.buffer.lock().unwrap().push(message);
    }

    /// Append many messages atomically with respect to the consumer.
    pub fn enqueue_all<I>(&self, messages: I)
    where
        I: IntoIterator<Item = Message>,
    {
        self.buffer.lock().unwrap().extend(messages);
    }

    /// Take ownership of the current batch, leaving the queue empty.
    ///
    /// Returns `None` when there is nothing to accept.
    pub fn accept_all(&self) -> Option<Vec<Message>> {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *buffer))
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CommandBuilder;

    fn command(id: u64) -> Message {
        CommandBuilder::drain().id(id).build()
    }

    #[test]
    fn test_accept_all_empty_is_none() {
        let queue = Queue::new();
        assert!(queue.accept_all().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_order_preserved() {
        let queue = Queue::new();
        queue.enqueue(command(1));
        queue.enqueue(command(2));
        queue.enqueue_all(vec![command(3), command(4)]);
        assert_eq!(queue.len(), 4);

        let batch = queue.accept_all().unwrap();
        let ids: Vec<u64> = batch.iter().map(|m| m.as_command().unwrap().id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(queue.accept_all().is_none());
    }

    #[test]
    fn test_accept_resets_buffer() {
        let queue = Queue::new();
        queue.enqueue(command(1));
        let _ = queue.accept_all();
        queue.enqueue(command(2));
        let batch = queue.accept_all().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].as_command().unwrap().id(), 2);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        use std::sync::Arc;

        let queue = Arc::new(Queue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for id in 0..200 {
                    queue.enqueue(command(id));
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 200 {
            if let Some(batch) = queue.accept_all() {
                seen.extend(batch.into_iter().map(|m| m.as_command().unwrap().id()));
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();

        let expected: Vec<u64> = (0..200).collect();
        assert_eq!(seen, expected);
    }
}
