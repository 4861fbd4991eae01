//! Access to the thread's `errno`.
//!
//! Shims save it on entry, restore it before the real call and again after
//! their own bookkeeping, so the caller sees exactly what libc left behind.

use libc::c_int;

#[inline]
pub fn get() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
pub fn set(value: c_int) {
    unsafe { *libc::__errno_location() = value }
}

/// Run `f` and put `errno` back to what it was before.
#[inline]
pub fn preserve<R>(f: impl FnOnce() -> R) -> R {
    let saved = get();
    let result = f();
    set(saved);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preserve_restores_errno() {
        set(libc::ENOENT);
        let value = preserve(|| {
            set(libc::EACCES);
            7
        });
        assert_eq!(value, 7);
        assert_eq!(get(), libc::ENOENT);
    }
}
