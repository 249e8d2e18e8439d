//! Self-unload (spec §4.6 item 6). A process with no third-party modules to
//! run should leave no trace of the agent behind, but `dlclose`-ing the
//! agent's own shared object from code running inside it is fatal the moment
//! the pages are unmapped. The fix, grounded on the reference
//! implementation: hook `pthread_attr_destroy` (same signature as
//! `dlclose(void*)`, and reliably called whenever the VM spins up a new
//! thread), and once unload has been requested, tail-call `dlclose` from
//! inside that hook so the hook's own stack frame is reused instead of
//! returning into code about to disappear.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use log::{debug, warn};

use crate::plt;

static UNLOAD_REQUESTED: AtomicBool = AtomicBool::new(false);
static SELF_HANDLE: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());

/// Output slot for the `pthread_attr_destroy` PLT hook's original function
/// pointer. This must be `'static`, not a stack local: `plt::register` only
/// queues the hook, and the actual write happens later inside `plt::commit`,
/// by which point a stack frame from `install` would already be gone.
/// `AtomicPtr<c_void>` is documented to share `*mut c_void`'s layout, so its
/// own address can stand in as a `*mut *mut c_void` for the plt engine.
static ORIGINAL_PTHREAD_ATTR_DESTROY: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());

pub fn request_unload() {
    UNLOAD_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn is_requested() -> bool {
    UNLOAD_REQUESTED.load(Ordering::SeqCst)
}

/// Queues the `pthread_attr_destroy` hook that will carry out the unload
/// once [`request_unload`] has been called and a daemon thread starts.
/// `self_handle` is the handle the Injector obtained from its own `dlopen`,
/// passed down through the entry point.
pub fn install(self_handle: *mut c_void) -> bool {
    SELF_HANDLE.store(self_handle, Ordering::SeqCst);
    let old_func_out = &ORIGINAL_PTHREAD_ATTR_DESTROY as *const AtomicPtr<c_void> as *mut *mut c_void;
    plt::register(
        r"libart\.so$",
        "pthread_attr_destroy",
        hook_pthread_attr_destroy as *mut c_void,
        old_func_out,
    )
}

/// Drains every GOT patch this agent ever committed and writes the original
/// value back, so a process that's about to unload doesn't leave dangling
/// hooks behind in case unload is aborted partway or re-entered.
fn unhook_all() {
    plt::restore_all(&plt::take_committed());
}

type PthreadAttrDestroyFn = unsafe extern "C" fn(attr: *mut c_void) -> i32;

unsafe extern "C" fn hook_pthread_attr_destroy(attr: *mut c_void) -> i32 {
    let original = ORIGINAL_PTHREAD_ATTR_DESTROY.load(Ordering::SeqCst);
    let result = if original.is_null() {
        0
    } else {
        let original: PthreadAttrDestroyFn = unsafe { std::mem::transmute(original) };
        unsafe { original(attr) }
    };

    let is_main_thread = unsafe { nix::libc::gettid() == nix::libc::getpid() };
    if !is_main_thread || !is_requested() {
        return result;
    }

    let handle = SELF_HANDLE.load(Ordering::SeqCst);
    if handle.is_null() {
        return result;
    }

    debug!("unloading agent from main thread");
    unhook_all();
    // The reference implementation tail-calls `dlclose` here so the unmapped
    // pages are never returned into. Stable Rust has no `musttail`
    // equivalent; closing last and returning a plain `i32` keeps the gap as
    // small as the compiler allows (see DESIGN.md).
    unsafe { nix::libc::dlclose(handle) };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unload_is_not_requested_by_default() {
        assert!(!is_requested());
    }
}
