//! Recursion guard.
//!
//! While a thread is inside a shim, any libc call the interposer makes on its
//! own behalf (logging, realpath, socket I/O) comes back through the exported
//! symbols. Those nested calls must go straight to the real function.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static IN_SHIM: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as executing interposer code until dropped.
pub struct ShimGuard {
    _not_send: PhantomData<*const ()>,
}

impl ShimGuard {
    /// Returns `None` when the thread is already inside the interposer.
    #[inline]
    pub fn enter() -> Option<Self> {
        IN_SHIM
            .try_with(|flag| {
                if flag.replace(true) {
                    None
                } else {
                    Some(ShimGuard {
                        _not_send: PhantomData,
                    })
                }
            })
            .ok()
            .flatten()
    }

    /// Mark the current thread as permanently inside the interposer.
    /// Used by the recorder's worker thread, which never runs traced code.
    pub fn enter_forever() {
        if let Some(guard) = Self::enter() {
            std::mem::forget(guard);
        }
    }

    pub fn is_active() -> bool {
        IN_SHIM.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for ShimGuard {
    fn drop(&mut self) {
        let _ = IN_SHIM.try_with(|flag| flag.set(false));
    }
}
