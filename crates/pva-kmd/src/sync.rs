use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Locks `mutex`, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves its state consistent at each panic point, so a
/// poisoned lock carries no torn update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counting semaphore with a bounded wait.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: u32) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Takes one permit, waiting at most `timeout`. Returns `false` on timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            permits = match self.cond.wait_timeout(permits, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *permits -= 1;
        true
    }

    pub fn try_acquire(&self) -> bool {
        let mut permits = lock(&self.permits);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn release(&self) {
        *lock(&self.permits) += 1;
        self.cond.notify_one();
    }

    pub fn available(&self) -> u32 {
        *lock(&self.permits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_times_out_when_exhausted() {
        let sema = Semaphore::new(1);
        assert!(sema.acquire_timeout(Duration::from_millis(1)));
        let start = Instant::now();
        assert!(!sema.acquire_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn release_wakes_a_waiter() {
        let sema = Arc::new(Semaphore::new(0));
        let waiter = {
            let sema = Arc::clone(&sema);
            thread::spawn(move || sema.acquire_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        sema.release();
        assert!(waiter.join().unwrap());
        assert_eq!(sema.available(), 0);
    }
}
