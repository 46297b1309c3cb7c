//! The buffer `Selector::select` fills with ready events.
//!
//! Starts at 16 entries. Whenever a `select` call fills the buffer to
//! capacity, the next buffer doubles in size, on the theory that a full
//! buffer is evidence the workload wants more headroom, not that this
//! particular wakeup happened to be busy.

const INITIAL_CAPACITY: usize = 16;

pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity.max(1)),
        }
    }

    pub fn clear(&mut self) {
        // Does not shrink capacity; only resets the logical length.
        unsafe { self.inner.set_len(0) };
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_mut_ptr(&mut self) -> *mut libc::epoll_event {
        self.inner.as_mut_ptr()
    }

    /// # Safety
    /// The first `len` elements of the underlying storage must have been
    /// initialized by the caller (normally `epoll_wait`).
    pub unsafe fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.inner.capacity());
        self.inner.set_len(len);
    }

    pub fn iter(&self) -> impl Iterator<Item = &libc::epoll_event> {
        self.inner.iter()
    }

    /// Doubles capacity for the next `select` call. Call this after a
    /// `select` returns exactly `capacity()` events.
    pub fn grow(&mut self) {
        let new_capacity = self.inner.capacity() * 2;
        self.inner.reserve(new_capacity - self.inner.capacity());
    }

    pub fn was_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

impl Default for Events {
    fn default() -> Events {
        Events::with_capacity(INITIAL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_initial_capacity() {
        let events = Events::default();
        assert_eq!(events.capacity(), INITIAL_CAPACITY);
    }

    #[test]
    fn grow_doubles() {
        let mut events = Events::default();
        let before = events.capacity();
        events.grow();
        assert_eq!(events.capacity(), before * 2);
    }
}
