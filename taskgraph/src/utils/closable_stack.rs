use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Lock-free append-only list that can be closed exactly once.
///
/// Producers push with a CAS on the head. Closing swaps in a sentinel pointer
/// and takes the whole chain, after which every push is rejected and hands the
/// item back to the caller.
pub(crate) struct ClosableStack<T> {
    head: AtomicPtr<Node<T>>,
}

struct Node<T> {
    item: T,
    next: *mut Node<T>,
}

impl<T> ClosableStack<T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    // Never a valid allocation, dangling pointers are aligned and non-null.
    fn closed() -> *mut Node<T> {
        ptr::dangling_mut()
    }

    /// Pushes an item, or returns it back if the stack is already closed.
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        let node = Box::into_raw(Box::new(Node {
            item,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == Self::closed() {
                // Safety: `node` was never published.
                let node = unsafe { Box::from_raw(node) };
                return Err(node.item);
            }

            // Safety: `node` is still exclusively ours until the CAS succeeds.
            unsafe { (*node).next = head };

            match self.head.compare_exchange_weak(
                head,
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => head = actual,
            }
        }
    }

    /// Closes the stack and returns its items in push order, or `None` if the
    /// stack was already closed.
    pub(crate) fn close(&self) -> Option<Vec<T>> {
        let mut cur = self.head.swap(Self::closed(), Ordering::AcqRel);
        if cur == Self::closed() {
            return None;
        }

        let mut items = Vec::new();
        while !cur.is_null() {
            // Safety: the swap detached the chain, we are its only owner.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
            items.push(node.item);
        }

        // Pushes build a LIFO chain.
        items.reverse();
        Some(items)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.head.load(Ordering::Acquire) == Self::closed()
    }
}

impl<T> Default for ClosableStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ClosableStack<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// Safety: items are moved in and out whole, never shared between threads.
unsafe impl<T: Send> Send for ClosableStack<T> {}
unsafe impl<T: Send> Sync for ClosableStack<T> {}

impl<T> fmt::Debug for ClosableStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosableStack")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use std::rc::Rc;
    use std::sync::Arc;
    use std::thread;

    assert_impl_all!(ClosableStack<Arc<u32>>: Send, Sync);
    assert_not_impl_any!(ClosableStack<Rc<u32>>: Send, Sync);

    #[test]
    fn test_close_returns_push_order() {
        let stack = ClosableStack::new();
        for i in 0..5 {
            assert!(stack.push(i).is_ok());
        }

        assert!(!stack.is_closed());
        assert_eq!(stack.close(), Some(vec![0, 1, 2, 3, 4]));
        assert!(stack.is_closed());
    }

    #[test]
    fn test_closed_exactly_once() {
        let stack = ClosableStack::<u8>::new();
        assert_eq!(stack.close(), Some(vec![]));
        assert_eq!(stack.close(), None);
        assert_eq!(stack.push(3), Err(3));
    }

    #[test]
    fn test_drop_releases_items() {
        let item = Arc::new(());
        {
            let stack = ClosableStack::new();
            stack.push(Arc::clone(&item)).unwrap();
            stack.push(Arc::clone(&item)).unwrap();
            assert_eq!(Arc::strong_count(&item), 3);
        }
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[test]
    fn test_concurrent_push_and_close() {
        let stack = Arc::new(ClosableStack::new());

        let pushers = (0..4)
            .map(|t| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    (0..1000)
                        .filter(|i| stack.push(t * 1000 + i).is_err())
                        .count()
                })
            })
            .collect::<Vec<_>>();

        thread::yield_now();
        let accepted = stack.close().unwrap();
        let rejected: usize = pushers.into_iter().map(|h| h.join().unwrap()).sum();

        // Every item was either taken by close or handed back to its pusher.
        assert_eq!(accepted.len() + rejected, 4000);

        // Each pusher's accepted items keep their relative order.
        for t in 0..4 {
            let mine = accepted
                .iter()
                .filter(|v| **v / 1000 == t)
                .collect::<Vec<_>>();
            assert!(mine.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
