// =============================================================================
// recorder/worker.rs: background delivery thread
// =============================================================================
//
// Spawned with pthread_create rather than std::thread so nothing runs through
// the std runtime's thread bookkeeping while the host may be mid-init.
//   - spawn(): #[inline(never)] to isolate pthread_create side effects
//   - worker_entry(): adaptive backoff loop (spin → yield → sleep)
// =============================================================================

use super::Recorder;
use crate::guard::ShimGuard;
use std::time::Duration;

/// Start the worker for `recorder`. Returns false if the thread was not created.
#[inline(never)]
pub(super) fn spawn(recorder: &'static Recorder) -> bool {
    unsafe {
        let mut thread: libc::pthread_t = std::mem::zeroed();
        let rc = libc::pthread_create(
            &mut thread,
            std::ptr::null(),
            worker_entry,
            recorder as *const Recorder as *mut libc::c_void,
        );
        if rc != 0 {
            return false;
        }
        libc::pthread_detach(thread);
    }
    true
}

extern "C" fn worker_entry(arg: *mut libc::c_void) -> *mut libc::c_void {
    // Signals belong to the host's threads
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut mask);
        libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
    }
    // Everything this thread does is interposer-internal
    ShimGuard::enter_forever();

    let recorder = unsafe { &*(arg as *const Recorder) };

    let mut backoff_count = 0u32;
    loop {
        if recorder.drain_batch() > 0 {
            backoff_count = 0;
            continue;
        }
        backoff_count = backoff_count.saturating_add(1).min(1000);
        if backoff_count < 10 {
            std::hint::spin_loop();
        } else if backoff_count < 100 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
