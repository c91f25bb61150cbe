/// Bounded message ports.
///
/// Every interaction between components goes through a fixed-capacity FIFO.
/// `send` hands the message back when the destination queue is full; the
/// sender keeps it and retries on a later cycle. That is the only
/// backpressure mechanism in the simulator.
///
/// The simulator is single-threaded, so the queue is shared through
/// `Rc<RefCell<..>>`. Several senders may feed one receiver (all CUs report
/// completions to the same dispatcher), and messages from any one sender
/// arrive in the order they were sent.
use std::cell::{Ref, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

struct Queue<T> {
    name: String,
    capacity: usize,
    items: VecDeque<T>,
}

/// Sending half of a port. Cheap to clone.
pub struct Sender<T> {
    queue: Rc<RefCell<Queue<T>>>,
}

/// Receiving half of a port.
pub struct Receiver<T> {
    queue: Rc<RefCell<Queue<T>>>,
}

/// The destination was full; the message is handed back.
#[derive(Debug, PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port is full")
    }
}

/// Create a named port that buffers at most `capacity` messages.
pub fn channel<T>(name: impl Into<String>, capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "port capacity must be positive");
    let queue = Rc::new(RefCell::new(Queue {
        name: name.into(),
        capacity,
        items: VecDeque::with_capacity(capacity),
    }));
    (
        Sender {
            queue: Rc::clone(&queue),
        },
        Receiver { queue },
    )
}

impl<T> Sender<T> {
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        let mut q = self.queue.borrow_mut();
        if q.items.len() >= q.capacity {
            return Err(SendError(msg));
        }
        q.items.push_back(msg);
        Ok(())
    }

    pub fn can_send(&self) -> bool {
        let q = self.queue.borrow();
        q.items.len() < q.capacity
    }

    pub fn name(&self) -> String {
        self.queue.borrow().name.clone()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            queue: Rc::clone(&self.queue),
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sender({})", self.queue.borrow().name)
    }
}

impl<T> Receiver<T> {
    /// Look at the oldest message without consuming it.
    pub fn peek(&self) -> Option<Ref<'_, T>> {
        Ref::filter_map(self.queue.borrow(), |q| q.items.front()).ok()
    }

    /// Consume the oldest message.
    pub fn retrieve(&self) -> Option<T> {
        self.queue.borrow_mut().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().items.is_empty()
    }

    /// A new sender feeding this receiver.
    pub fn sender(&self) -> Sender<T> {
        Sender {
            queue: Rc::clone(&self.queue),
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.queue.borrow();
        write!(f, "Receiver({}, {}/{})", q.name, q.items.len(), q.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_fails_when_full_and_returns_message() {
        let (tx, rx) = channel::<u32>("test", 2);
        assert!(tx.send(1).is_ok());
        assert!(tx.send(2).is_ok());
        assert_eq!(tx.send(3), Err(SendError(3)));
        assert_eq!(rx.retrieve(), Some(1));
        assert!(tx.send(3).is_ok());
    }

    #[test]
    fn peek_does_not_consume() {
        let (tx, rx) = channel::<u32>("test", 4);
        tx.send(7).unwrap();
        assert_eq!(*rx.peek().unwrap(), 7);
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.retrieve(), Some(7));
        assert!(rx.peek().is_none());
    }

    #[test]
    fn multiple_senders_share_fifo_order() {
        let (tx, rx) = channel::<u32>("test", 8);
        let tx2 = tx.clone();
        tx.send(1).unwrap();
        tx2.send(2).unwrap();
        tx.send(3).unwrap();
        let got: Vec<u32> = std::iter::from_fn(|| rx.retrieve()).collect();
        assert_eq!(got, vec![1, 2, 3]);
    }
}
