use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Per-serial mutual exclusion for operations that must not interleave
/// for the same terminal (poll vs. push vs. result report vs. sweep).
///
/// Different serials never contend. The outer map lock is only held long
/// enough to fetch the serial's slot.
#[derive(Default, Clone)]
pub struct DeviceLocks {
    slots: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the lock for `serial`
    pub fn with_device<T>(&self, serial: &str, f: impl FnOnce() -> T) -> T {
        let slot = self.slot(serial);
        // A panic inside a previous critical section leaves no state behind
        // the unit mutex, so a poisoned lock is still usable.
        let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_serial_is_serialized() {
        let locks = DeviceLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    locks.with_device("T001", || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_different_serials_do_not_block() {
        let locks = DeviceLocks::new();
        let value = locks.with_device("T001", || locks.with_device("T002", || 42));
        assert_eq!(value, 42);
    }
}
