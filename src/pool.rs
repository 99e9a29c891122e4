//! Fixed-capacity slot pool.
//!
//! All objects are created up front when the pool is built, sized once from
//! the benchmark's declared maximum concurrency, so steady-state operation
//! allocates nothing. Exhaustion is a backpressure signal (`None`), not an
//! error. Usage watermarks are tracked so a run report can show how close a
//! phase came to its reserved capacity.

/// A pool of reusable objects with a capacity fixed at construction.
///
/// `acquire` hands out an object or reports exhaustion; `release` returns
/// it. The pool never grows.
#[derive(Debug)]
pub struct Pool<T> {
    free: Vec<T>,
    capacity: usize,
    min_free: usize,
    max_used: usize,
}

impl<T> Pool<T> {
    /// Builds a pool of `capacity` objects produced by `init`.
    pub fn new(capacity: usize, mut init: impl FnMut() -> T) -> Self {
        let mut free = Vec::with_capacity(capacity);
        free.resize_with(capacity, &mut init);
        Pool { free, capacity, min_free: capacity, max_used: 0 }
    }

    /// Builds a pool from pre-created objects; capacity is their count.
    pub fn from_objects(objects: Vec<T>) -> Self {
        let capacity = objects.len();
        Pool { free: objects, capacity, min_free: capacity, max_used: 0 }
    }

    /// Takes an object out of the pool, or `None` when every slot is in use.
    ///
    /// Callers must treat `None` as backpressure and retry after a release,
    /// not as an error to propagate.
    pub fn acquire(&mut self) -> Option<T> {
        let object = self.free.pop()?;
        self.min_free = self.min_free.min(self.free.len());
        self.max_used = self.max_used.max(self.capacity - self.free.len());
        Some(object)
    }

    /// Returns an object to the pool.
    ///
    /// Panics if the pool already holds its full capacity: releasing an
    /// object that was never acquired is a programming bug.
    pub fn release(&mut self, object: T) {
        assert!(self.free.len() < self.capacity, "released into a full pool");
        self.free.push(object);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of objects currently handed out.
    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }

    /// Highest number of objects simultaneously handed out.
    pub fn max_used(&self) -> usize {
        self.max_used
    }

    /// Asserts that every object is back home. Valid only at quiescence;
    /// a missing object means a leaked slot somewhere in the run loop.
    pub fn check_full(&self) {
        assert!(
            self.free.len() == self.capacity,
            "pool not full: {} of {} slots returned",
            self.free.len(),
            self.capacity
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_backpressure() {
        let mut pool = Pool::new(2, || 0u32);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
        pool.release(7);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn tracks_usage_watermark() {
        let mut pool = Pool::new(4, || ());
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.max_used(), 3);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn check_full_passes_at_quiescence() {
        let mut pool = Pool::new(3, || 1u8);
        let x = pool.acquire().unwrap();
        pool.release(x);
        pool.check_full();
    }

    #[test]
    #[should_panic(expected = "pool not full")]
    fn check_full_panics_on_leak() {
        let mut pool = Pool::new(3, || 1u8);
        let _leaked = pool.acquire().unwrap();
        pool.check_full();
    }

    #[test]
    #[should_panic(expected = "released into a full pool")]
    fn release_into_full_pool_panics() {
        let mut pool = Pool::new(1, || 0i64);
        pool.release(1);
    }
}
