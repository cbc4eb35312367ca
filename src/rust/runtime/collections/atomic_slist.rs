// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::collections::task_list::{
    IntrusivelyLinked,
    TaskList,
};
use ::std::{
    marker::PhantomData,
    ptr,
    sync::{
        atomic::{
            AtomicPtr,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Order in which a flush hands back the elements of an [AtomicSlist].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOrder {
    /// Most recently pushed first.
    Lifo,
    /// Least recently pushed first. Approximate because concurrent producers race on the push order.
    ApproximateFifo,
}

/// A lock-free, multi-producer, single-consumer stack of owned elements.
///
/// Producers on any thread push with a compare-and-swap on the head; the consumer takes the whole stack at once by
/// exchanging the head with null and, if it wants submission order, reversing the detached chain.
pub struct AtomicSlist<T: IntrusivelyLinked> {
    head: AtomicPtr<T>,
    phantom: PhantomData<Arc<T>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T: IntrusivelyLinked> AtomicSlist<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            phantom: PhantomData,
        }
    }

    /// Checks whether the stack was empty at the time of the call.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Pushes one element on top of the stack.
    pub fn push(&self, element: Arc<T>) {
        let node: *mut T = Arc::into_raw(element) as *mut T;
        let mut current: *mut T = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: we own the reference that was just converted and nobody else can see the node yet.
            unsafe { (*node).set_next(current) };
            match self
                .head
                .compare_exchange_weak(current, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Pushes a whole list on top of the stack with a single compare-and-swap. The list keeps its order, so its head
    /// ends up on top and is the first element of a LIFO flush. `list` is left empty.
    pub fn concat(&self, list: &mut TaskList<T>) {
        let Some((head, tail)) = list.take_raw_chain() else {
            return;
        };
        let mut current: *mut T = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: the chain was detached from `list`, so we own all of its elements.
            unsafe { tail.as_ref().set_next(current) };
            match self
                .head
                .compare_exchange_weak(current, head.as_ptr(), Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomically takes every element off the stack. Returns an empty list if there was nothing to take.
    pub fn flush(&self, order: FlushOrder) -> TaskList<T> {
        let head: *mut T = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        // Safety: the exchange made this thread the sole owner of the detached chain, whose elements were all
        // produced by Arc::into_raw in push() or by a TaskList in concat().
        let mut list: TaskList<T> = unsafe { TaskList::from_raw_chain(head) };
        if order == FlushOrder::ApproximateFifo {
            list.reverse();
        }
        list
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

// Safety: the stack is only mutated through atomic operations on the head, and owns Arc<T> references.
unsafe impl<T: IntrusivelyLinked + Send + Sync> Send for AtomicSlist<T> {}
unsafe impl<T: IntrusivelyLinked + Send + Sync> Sync for AtomicSlist<T> {}

impl<T: IntrusivelyLinked> Default for AtomicSlist<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: IntrusivelyLinked> Drop for AtomicSlist<T> {
    fn drop(&mut self) {
        self.flush(FlushOrder::Lifo).discard();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        AtomicSlist,
        FlushOrder,
    };
    use crate::runtime::collections::task_list::{
        tests::{
            collect,
            TestThingy,
        },
        TaskList,
    };
    use ::anyhow::Result;
    use ::std::{
        sync::Arc,
        thread,
    };

    #[test]
    fn flush_orders() -> Result<()> {
        let slist: AtomicSlist<TestThingy> = AtomicSlist::new();
        crate::ensure_eq!(slist.is_empty(), true);
        for value in 1..=3 {
            slist.push(TestThingy::new(value));
        }
        crate::ensure_eq!(slist.is_empty(), false);
        crate::ensure_eq!(collect(&mut slist.flush(FlushOrder::Lifo)), vec![3, 2, 1]);
        crate::ensure_eq!(slist.is_empty(), true);

        for value in 1..=3 {
            slist.push(TestThingy::new(value));
        }
        crate::ensure_eq!(collect(&mut slist.flush(FlushOrder::ApproximateFifo)), vec![1, 2, 3]);

        // Flushing an empty stack yields an empty list.
        crate::ensure_eq!(slist.flush(FlushOrder::ApproximateFifo).is_empty(), true);
        Ok(())
    }

    #[test]
    fn concat_pushes_a_batch() -> Result<()> {
        let slist: AtomicSlist<TestThingy> = AtomicSlist::new();
        slist.push(TestThingy::new(1));

        let mut batch: TaskList<TestThingy> = TaskList::new();
        batch.push_back(TestThingy::new(3));
        batch.push_back(TestThingy::new(2));
        slist.concat(&mut batch);
        crate::ensure_eq!(batch.is_empty(), true);

        let mut flushed: TaskList<TestThingy> = slist.flush(FlushOrder::ApproximateFifo);
        crate::ensure_eq!(flushed.len(), 3);
        crate::ensure_eq!(collect(&mut flushed), vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn drop_releases_references() -> Result<()> {
        let element: Arc<TestThingy> = TestThingy::new(1);
        {
            let slist: AtomicSlist<TestThingy> = AtomicSlist::new();
            slist.push(element.clone());
            crate::ensure_eq!(Arc::strong_count(&element), 2);
        }
        crate::ensure_eq!(Arc::strong_count(&element), 1);
        Ok(())
    }

    #[test]
    fn concurrent_producers_lose_nothing() -> Result<()> {
        const PRODUCERS: u32 = 8;
        const PER_PRODUCER: u32 = 1000;
        let slist: Arc<AtomicSlist<TestThingy>> = Arc::new(AtomicSlist::new());

        let mut handles: Vec<thread::JoinHandle<()>> = Vec::new();
        for producer in 0..PRODUCERS {
            let slist: Arc<AtomicSlist<TestThingy>> = slist.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    slist.push(TestThingy::new(producer * PER_PRODUCER + i));
                }
            }));
        }

        // Consume concurrently with the producers.
        let mut seen: Vec<u32> = Vec::new();
        while seen.len() < (PRODUCERS * PER_PRODUCER) as usize {
            seen.extend(collect(&mut slist.flush(FlushOrder::ApproximateFifo)));
            thread::yield_now();
        }
        for handle in handles {
            if handle.join().is_err() {
                anyhow::bail!("producer panicked");
            }
        }

        seen.sort();
        crate::ensure_eq!(seen, (0..PRODUCERS * PER_PRODUCER).collect::<Vec<u32>>());
        Ok(())
    }
}
