use core::cell::UnsafeCell;
use core::hint;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const INCOMPLETE: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETE: u8 = 2;

/// A synchronization primitive which can be initialized exactly once.
///
/// Unlike a spinlock it can be read from threads that are not bound to a hart, so lock-free
/// debugging dumps may use it.
#[derive(Debug)]
pub struct OnceLock<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(INCOMPLETE),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn is_init(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }

    pub fn initialize<F, E>(&self, f: F)
    where
        F: FnOnce() -> Result<T, E>,
    {
        // if incomplete, initialize.
        // otherwise, another thread must be initializing it, wait for it to finish.
        match self
            .state
            .compare_exchange(INCOMPLETE, RUNNING, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => match f() {
                Ok(value) => {
                    unsafe { (*self.value.get()).write(value) };
                    self.state.store(COMPLETE, Ordering::Release);
                }
                Err(_e) => panic!("failed to init once lock"),
            },
            Err(_) => {
                while !self.is_init() {
                    hint::spin_loop();
                }
            }
        }
    }

    pub fn get(&self) -> Option<&T> {
        if self.is_init() {
            Some(unsafe { self.get_unchecked() })
        } else {
            None
        }
    }

    unsafe fn get_unchecked(&self) -> &T {
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        if self.is_init() {
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
/// The lock can give `&T` from multiple threads, therefore `T` must be `Sync` to ensure that it is
/// safe to share the inner data across threads.
/// The lock can also call `initialize()`, which may initialize the inner data.
/// Therefore, `T` must be `Send` to ensure that it is safe to send the inner data across threads.
unsafe impl<T: Sync + Send> Sync for OnceLock<T> {}

/// # Safety
/// `Send`ing the lock also transfers the ownership of the inner data `T`.
unsafe impl<T: Send> Send for OnceLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializes_once() {
        let cell = OnceLock::new();
        assert!(cell.get().is_none());
        cell.initialize(|| Ok::<_, ()>(3));
        cell.initialize(|| Ok::<_, ()>(4));
        assert_eq!(cell.get(), Some(&3));
    }
}
