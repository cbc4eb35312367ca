// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    marker::PhantomData,
    mem,
    ptr::{
        self,
        NonNull,
    },
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// An intrusive singly-linked list with owned elements.
///
/// Each element on the list accounts for one strong reference of an `Arc<T>`, which the list keeps as a raw pointer
/// and hands back on removal. Links live inside the elements, so no operation allocates. An element must never be on
/// more than one list (or [AtomicSlist](super::atomic_slist::AtomicSlist)) at a time, because it has a single link.
#[derive(Debug)]
pub struct TaskList<T: IntrusivelyLinked> {
    // Pointer to the first element in the list.
    head: Option<NonNull<T>>,
    // Pointer to the last element in the list.
    tail: Option<NonNull<T>>,
    // Length of the list in elements.
    len: usize,
    // Hint to compiler that this struct "owns" an Arc<T> (for safety determinations).
    phantom: PhantomData<Arc<T>>,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Elements that carry their own list link.
pub trait IntrusivelyLinked: Sized {
    /// Returns the next element in the list, or null.
    fn get_next(&self) -> *mut Self;

    /// Sets the next element in the list.
    fn set_next(&self, next: *mut Self);
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T: IntrusivelyLinked> TaskList<T> {
    /// Creates an empty list.
    #[inline]
    pub const fn new() -> Self {
        TaskList {
            head: None,
            tail: None,
            len: 0,
            phantom: PhantomData,
        }
    }

    /// Builds a list from a null-terminated chain of raw element pointers.
    ///
    /// # Safety
    ///
    /// Every element of the chain must have been produced by `Arc::into_raw`, and the chain must be exclusively owned
    /// by the caller.
    pub(crate) unsafe fn from_raw_chain(head: *mut T) -> Self {
        let mut list: Self = Self::new();
        let mut current: *mut T = head;
        while let Some(node) = NonNull::new(current) {
            if list.head.is_none() {
                list.head = Some(node);
            }
            list.tail = Some(node);
            list.len += 1;
            current = node.as_ref().get_next();
        }
        list
    }

    /// Detaches the whole chain from this list, leaving it empty. Ownership of every element moves to the caller.
    pub(crate) fn take_raw_chain(&mut self) -> Option<(NonNull<T>, NonNull<T>)> {
        let head: NonNull<T> = self.head.take()?;
        let tail: Option<NonNull<T>> = self.tail.take();
        self.len = 0;
        tail.map(|tail: NonNull<T>| (head, tail))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Peeks at the first element.
    pub fn front(&self) -> Option<&T> {
        // Safety: the list holds a strong reference on every element it links.
        self.head.map(|head: NonNull<T>| unsafe { &*head.as_ptr() })
    }

    /// Peeks at the last element.
    pub fn back(&self) -> Option<&T> {
        // Safety: the list holds a strong reference on every element it links.
        self.tail.map(|tail: NonNull<T>| unsafe { &*tail.as_ptr() })
    }

    /// Add the given element to the front of the list.
    pub fn push_front(&mut self, added: Arc<T>) {
        // Note: Arc::into_raw does NOT decrement the reference count (which is the behavior we want).
        let added: NonNull<T> = Self::into_node(added);
        let next: *mut T = self.head.map_or(ptr::null_mut(), NonNull::as_ptr);
        // Safety: we own the reference that was just converted.
        unsafe { added.as_ref().set_next(next) };

        if self.tail.is_none() {
            self.tail = Some(added);
        }
        self.head = Some(added);
        self.len += 1;
    }

    /// Add the given element to the back of the list.
    pub fn push_back(&mut self, added: Arc<T>) {
        let added: NonNull<T> = Self::into_node(added);
        // Safety: we own the reference that was just converted.
        unsafe { added.as_ref().set_next(ptr::null_mut()) };

        match self.tail {
            // Point the current last element's next pointer at the new element.
            Some(old_tail) => unsafe { old_tail.as_ref().set_next(added.as_ptr()) },
            // Nothing currently on the list, so the new element also becomes the head.
            None => self.head = Some(added),
        }
        self.tail = Some(added);
        self.len += 1;
    }

    /// Pop the first element off the front of the list.
    pub fn pop_front(&mut self) -> Option<Arc<T>> {
        let head: NonNull<T> = self.head?;

        // Safety: the pointer came from Arc::into_raw when the element was linked, and we give that reference back.
        let popped: Arc<T> = unsafe { Arc::from_raw(head.as_ptr()) };

        // Repoint the head at the next element (or None).
        self.head = NonNull::new(popped.get_next());
        if self.head.is_none() {
            // Clear the tail (which should have been pointing at popped).
            self.tail = None;
        }
        popped.set_next(ptr::null_mut());
        self.len -= 1;
        Some(popped)
    }

    /// Splices all of `other` onto the back of this list in O(1). `other` is left empty.
    pub fn append(&mut self, other: &mut TaskList<T>) {
        let Some((other_head, other_tail)) = other.head.zip(other.tail) else {
            return;
        };
        match self.tail {
            Some(tail) => unsafe { tail.as_ref().set_next(other_head.as_ptr()) },
            None => self.head = Some(other_head),
        }
        self.tail = Some(other_tail);
        self.len += other.len;
        other.head = None;
        other.tail = None;
        other.len = 0;
    }

    /// Splices all of `other` onto the front of this list in O(1). `other` is left empty.
    pub fn prepend(&mut self, other: &mut TaskList<T>) {
        if other.is_empty() {
            return;
        }
        mem::swap(self, other);
        self.append(other);
    }

    /// Moves up to `max_count` elements from the back of this list onto the back of `out`, preserving their order.
    ///
    /// Elements carry a single forward link, shared with [AtomicSlist](super::atomic_slist::AtomicSlist), so locating
    /// the split point walks the elements that stay: the cost is O(n - k) rather than O(k). Splicing the moved run
    /// itself is O(1). Moving the whole list skips the walk.
    pub fn split(&mut self, max_count: usize, out: &mut TaskList<T>) {
        let count: usize = max_count.min(self.len);
        if count == 0 {
            return;
        }
        if count == self.len {
            out.append(self);
            return;
        }

        // Find the last element that stays on this list.
        let keep: usize = self.len - count;
        let mut new_tail: NonNull<T> = match self.head {
            Some(head) => head,
            None => return,
        };
        for _ in 1..keep {
            // Safety: `keep` < `len`, so every link walked here is non-null.
            new_tail = unsafe { NonNull::new_unchecked(new_tail.as_ref().get_next()) };
        }

        let mut moved: TaskList<T> = TaskList::new();
        // Safety: new_tail is a linked element with at least `count` successors.
        unsafe {
            moved.head = NonNull::new(new_tail.as_ref().get_next());
            new_tail.as_ref().set_next(ptr::null_mut());
        }
        moved.tail = self.tail;
        moved.len = count;

        self.tail = Some(new_tail);
        self.len = keep;
        out.append(&mut moved);
    }

    /// Reverses the order of the elements in O(n). Used to restore submission order for batches built as a stack.
    pub fn reverse(&mut self) {
        let mut previous: *mut T = ptr::null_mut();
        let mut current: *mut T = self.head.map_or(ptr::null_mut(), NonNull::as_ptr);
        while let Some(node) = NonNull::new(current) {
            // Safety: every linked pointer refers to an element we hold a reference on.
            unsafe {
                let next: *mut T = node.as_ref().get_next();
                node.as_ref().set_next(previous);
                previous = node.as_ptr();
                current = next;
            }
        }
        mem::swap(&mut self.head, &mut self.tail);
    }

    /// Drops every element on the list.
    pub fn discard(&mut self) {
        while self.pop_front().is_some() {}
    }

    /// Pops every element on the list and hands it to `f`.
    pub fn drain_with<F: FnMut(Arc<T>)>(&mut self, mut f: F) {
        while let Some(element) = self.pop_front() {
            f(element);
        }
    }

    fn into_node(element: Arc<T>) -> NonNull<T> {
        // Safety: Arc::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Arc::into_raw(element) as *mut T) }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

// Safety: the list owns Arc<T> references, which may move between threads when T is Send + Sync.
unsafe impl<T: IntrusivelyLinked + Send + Sync> Send for TaskList<T> {}

impl<T: IntrusivelyLinked> Default for TaskList<T> {
    fn default() -> Self {
        Self::new()
    }
}

// We need an explicit drop implementation because we hold an Arc reference for each element on the list, and since
// we store the Arcs as raw pointers they won't drop automatically.
impl<T: IntrusivelyLinked> Drop for TaskList<T> {
    fn drop(&mut self) {
        self.discard();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
