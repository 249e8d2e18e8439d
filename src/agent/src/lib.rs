//! In-process agent (spec §4.6): the shared object the Injector's remote
//! call `dlopen`s into the init/zygote process. `zygisk_ptrace_agent_entry`
//! is its only external surface — everything else (PLT hooks on
//! `libandroid_runtime.so`, JNI interception of the zygote's native
//! specialize methods, per-spawn module orchestration, fd sanitization,
//! mount namespace cleanup, and the self-unload path) is wired up from
//! there and never called from outside this crate.

mod api;
mod config;
mod context;
mod daemon_client;
mod fds;
mod jni_hook;
mod logcat;
mod maps;
mod plt;
mod unload;
mod unmount;

use std::ffi::{CStr, c_void};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicPtr, Ordering};

use jni_sys::{JNIEnv, JNINativeMethod, jboolean, jclass, jint, jintArray, jlong, jobjectArray, jstring};
use log::{debug, info, warn};
use zp_abi::{AppSpecializeArgsV3, ProcessFlags, ServerSpecializeArgsV1, SpecializeArgs};

const RUNTIME_MAPPING: &str = r"libandroid_runtime\.so$";

type ForkFn = unsafe extern "C" fn() -> nix::libc::pid_t;
type UnshareFn = unsafe extern "C" fn(flags: i32) -> i32;
type StrdupFn = unsafe extern "C" fn(s: *const c_char) -> *mut c_char;
type LogCloseFn = unsafe extern "C" fn();
type ForkAndSpecializeFn = unsafe extern "C" fn(
    env: *mut JNIEnv,
    clazz: jclass,
    uid: jint,
    gid: jint,
    gids: jintArray,
    runtime_flags: jint,
    rlimits: jobjectArray,
    mount_external: jint,
    se_info: jstring,
    nice_name: jstring,
    fds_to_close: jintArray,
    fds_to_ignore: jintArray,
    is_child_zygote: jboolean,
    instruction_set: jstring,
    app_data_dir: jstring,
    is_top_app: jboolean,
    pkg_data_info_list: jobjectArray,
    whitelisted_data_info_list: jobjectArray,
    mount_data_dirs: jboolean,
    mount_storage_dirs: jboolean,
) -> jint;
type ForkSystemServerFn = unsafe extern "C" fn(
    env: *mut JNIEnv,
    clazz: jclass,
    uid: jint,
    gid: jint,
    gids: jintArray,
    runtime_flags: jint,
    rlimits: jobjectArray,
    permitted_capabilities: jlong,
    effective_capabilities: jlong,
) -> jint;

static ORIGINAL_FORK: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());
static ORIGINAL_UNSHARE: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());
static ORIGINAL_STRDUP: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());
static ORIGINAL_LOG_CLOSE: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());
static ORIGINAL_FORK_AND_SPECIALIZE: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());
static ORIGINAL_FORK_SYSTEM_SERVER: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());

fn slot(atomic: &'static AtomicPtr<c_void>) -> *mut *mut c_void {
    atomic as *const AtomicPtr<c_void> as *mut *mut c_void
}

/// Entry point the Injector's remote call invokes: `dlopen`s this library
/// into the target process then calls this symbol with the handle it got
/// back and the supervisor's `magic_path`, exactly as `injector.rs` and
/// `trace_cmd.rs`'s `AGENT_ENTRY_SYMBOL` expect.
///
/// # Safety
/// Called exactly once, from the Injector's remote call, with a valid
/// `dlopen` handle and a NUL-terminated `magic_path`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zygisk_ptrace_agent_entry(handle: *mut c_void, magic_path: *const c_char) {
    logcat::init();
    let Ok(magic_path) = (unsafe { CStr::from_ptr(magic_path) }.to_str()) else {
        warn!("agent entry received non-UTF8 magic_path");
        return;
    };
    config::init(magic_path.to_string());
    info!("agent loaded into pid {}", unsafe { nix::libc::getpid() });

    if let Some(fd) = daemon_client::request_logcat_fd() {
        logcat::redirect_to_daemon(fd);
    }

    if !unload::install(handle) {
        warn!("failed to queue self-unload hook");
    }

    register_runtime_hooks();
    if !plt::commit() {
        warn!("some PLT hooks on libandroid_runtime.so were never satisfied");
    }
}

fn register_runtime_hooks() {
    plt::register(RUNTIME_MAPPING, "fork", hook_fork as *mut c_void, slot(&ORIGINAL_FORK));
    plt::register(RUNTIME_MAPPING, "unshare", hook_unshare as *mut c_void, slot(&ORIGINAL_UNSHARE));
    plt::register(RUNTIME_MAPPING, "strdup", hook_strdup as *mut c_void, slot(&ORIGINAL_STRDUP));
    plt::register(
        RUNTIME_MAPPING,
        "__android_log_close",
        hook_android_log_close as *mut c_void,
        slot(&ORIGINAL_LOG_CLOSE),
    );
}

unsafe extern "C" fn hook_fork() -> nix::libc::pid_t {
    let original = ORIGINAL_FORK.load(Ordering::SeqCst);
    if original.is_null() {
        return -1;
    }
    unsafe { std::mem::transmute::<*mut c_void, ForkFn>(original)() }
}

/// `unshare(CLONE_NEWNS)` succeeding is the zygote's own moment of setting up
/// a fresh mount namespace for the about-to-specialize app; once it returns,
/// any mounts a root solution stacked for module injection are reverted so
/// the app process never sees them (spec §4.6 item 7).
unsafe extern "C" fn hook_unshare(flags: i32) -> i32 {
    let original = ORIGINAL_UNSHARE.load(Ordering::SeqCst);
    let result = if original.is_null() {
        -1
    } else {
        unsafe { std::mem::transmute::<*mut c_void, UnshareFn>(original)(flags) }
    };

    if result == 0 && flags & nix::libc::CLONE_NEWNS != 0 {
        let info_flags = context::current().map(|ctx| ctx.info_flags).unwrap_or(0);
        let is_manager = info_flags & ProcessFlags::ProcessIsManager as u32 != 0;
        let granted_root = info_flags & ProcessFlags::ProcessGrantedRoot as u32 != 0;
        // The module-manager app is the closest analog this ABI exposes to
        // "the system-UI process"; a process with no granted root has no
        // injected mounts to revert in the first place.
        if granted_root && !is_manager {
            unmount::revert_unmount_ksu();
            unmount::revert_unmount_magisk();
        }
    }
    result
}

/// The platform resets its native logging fd to -1 whenever this runs, so
/// the daemon-backed logcat sink can no longer be assumed live either.
unsafe extern "C" fn hook_android_log_close() {
    let original = ORIGINAL_LOG_CLOSE.load(Ordering::SeqCst);
    if !original.is_null() {
        unsafe { std::mem::transmute::<*mut c_void, LogCloseFn>(original)() };
    }
    logcat::reset_redirect();
}

/// `ZygoteInit`'s class name is `strdup`'d once, early, as the zygote main
/// loop starts up — the one reliable signal (short of a dedicated hook
/// point) that `libart.so` is loaded and the zygote's native specialize
/// methods have already been registered, so JNI interception can begin.
unsafe extern "C" fn hook_strdup(s: *const c_char) -> *mut c_char {
    let original = ORIGINAL_STRDUP.load(Ordering::SeqCst);
    let result = if original.is_null() {
        std::ptr::null_mut()
    } else {
        unsafe { std::mem::transmute::<*mut c_void, StrdupFn>(original)(s) }
    };

    if !s.is_null() {
        if let Ok(value) = unsafe { CStr::from_ptr(s) }.to_str() {
            if value == "com.android.internal.os.ZygoteInit" {
                debug!("ZygoteInit observed, initializing JNI hooks");
                initialize_jni_hooks();
            }
        }
    }
    result
}

fn initialize_jni_hooks() {
    let Some(env) = (unsafe { jni_hook::locate_env() }) else {
        warn!("could not locate a JNIEnv to initialize JNI hooks");
        return;
    };
    if !unsafe { jni_hook::initialize(env) } {
        return;
    }

    const FORK_AND_SPECIALIZE_SIG: &CStr =
        c"(II[II[[ILjava/lang/String;Ljava/lang/String;[I[IZLjava/lang/String;Ljava/lang/String;Z[Ljava/lang/String;[Ljava/lang/String;ZZ)I";
    const FORK_SYSTEM_SERVER_SIG: &CStr = c"(II[II[[IJJ)I";

    let mut methods = [
        JNINativeMethod {
            name: c"nativeForkAndSpecialize".as_ptr().cast_mut(),
            signature: FORK_AND_SPECIALIZE_SIG.as_ptr().cast_mut(),
            fnPtr: native_fork_and_specialize as *mut c_void,
        },
        JNINativeMethod {
            name: c"nativeForkSystemServer".as_ptr().cast_mut(),
            signature: FORK_SYSTEM_SERVER_SIG.as_ptr().cast_mut(),
            fnPtr: native_fork_system_server as *mut c_void,
        },
    ];

    unsafe {
        jni_hook::hook_jni_native_methods(env, c"com/android/internal/os/Zygote".as_ptr(), methods.as_mut_ptr(), methods.len() as jint)
    };

    ORIGINAL_FORK_AND_SPECIALIZE.store(methods[0].fnPtr, Ordering::SeqCst);
    ORIGINAL_FORK_SYSTEM_SERVER.store(methods[1].fnPtr, Ordering::SeqCst);
}

/// Replaces `Zygote.nativeForkAndSpecialize`: runs every module's pre-hook
/// with pointers into this frame's own locals (so a module can rewrite
/// `uid`, `niceName`, and friends before the real specialize call sees
/// them), then the original, then every post-hook, then sanitizes fds.
#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn native_fork_and_specialize(
    env: *mut JNIEnv,
    clazz: jclass,
    mut uid: jint,
    mut gid: jint,
    mut gids: jintArray,
    mut runtime_flags: jint,
    rlimits: jobjectArray,
    mut mount_external: jint,
    mut se_info: jstring,
    mut nice_name: jstring,
    fds_to_close: jintArray,
    mut fds_to_ignore: jintArray,
    mut is_child_zygote: jboolean,
    mut instruction_set: jstring,
    mut app_data_dir: jstring,
    mut is_top_app: jboolean,
    mut pkg_data_info_list: jobjectArray,
    mut whitelisted_data_info_list: jobjectArray,
    mut mount_data_dirs: jboolean,
    mut mount_storage_dirs: jboolean,
) -> jint {
    let flags = daemon_client::get_process_flags(uid as u32);
    let is_manager = flags & ProcessFlags::ProcessIsManager as u32 != 0;
    if is_manager {
        unsafe { nix::libc::setenv(c"ZYGISK_ENABLED".as_ptr(), c"1".as_ptr(), 1) };
    }

    let mut args = AppSpecializeArgsV3 {
        uid: &mut uid,
        gid: &mut gid,
        gids: &mut gids,
        runtime_flags: &mut runtime_flags,
        mount_external: &mut mount_external,
        se_info: &mut se_info,
        nice_name: &mut nice_name,
        instruction_set: &mut instruction_set,
        app_data_dir: &mut app_data_dir,
        fds_to_ignore: &mut fds_to_ignore,
        is_child_zygote: &mut is_child_zygote,
        is_top_app: &mut is_top_app,
        pkg_data_info_list: &mut pkg_data_info_list,
        whitelisted_data_info_list: &mut whitelisted_data_info_list,
        mount_data_dirs: &mut mount_data_dirs,
        mount_storage_dirs: &mut mount_storage_dirs,
    };

    context::begin_specialize(env, SpecializeArgs::App(&mut args), "app_process".to_string(), flags, is_manager);
    context::run_modules_pre();
    context::apply_ignore_list();

    let original = ORIGINAL_FORK_AND_SPECIALIZE.load(Ordering::SeqCst);
    let pid = if original.is_null() {
        -1
    } else {
        unsafe {
            std::mem::transmute::<*mut c_void, ForkAndSpecializeFn>(original)(
                env,
                clazz,
                uid,
                gid,
                gids,
                runtime_flags,
                rlimits,
                mount_external,
                se_info,
                nice_name,
                fds_to_close,
                fds_to_ignore,
                is_child_zygote,
                instruction_set,
                app_data_dir,
                is_top_app,
                pkg_data_info_list,
                whitelisted_data_info_list,
                mount_data_dirs,
                mount_storage_dirs,
            )
        }
    };

    let is_child = pid == 0;
    if is_child {
        context::run_modules_post();
    }
    context::end_specialize(-1, is_child);
    pid
}

/// Replaces `Zygote.nativeForkSystemServer`; system_server never loads
/// third-party modules (no per-app policy applies to it) but the fd
/// sanitization and pre/post ordering invariants still hold.
unsafe extern "C" fn native_fork_system_server(
    env: *mut JNIEnv,
    clazz: jclass,
    mut uid: jint,
    mut gid: jint,
    mut gids: jintArray,
    mut runtime_flags: jint,
    rlimits: jobjectArray,
    mut permitted_capabilities: jlong,
    mut effective_capabilities: jlong,
) -> jint {
    let mut args = ServerSpecializeArgsV1 {
        uid: &mut uid,
        gid: &mut gid,
        gids: &mut gids,
        runtime_flags: &mut runtime_flags,
        permitted_capabilities: &mut permitted_capabilities,
        effective_capabilities: &mut effective_capabilities,
    };

    context::begin_specialize(env, SpecializeArgs::Server(&mut args), "system_server".to_string(), 0, true);
    context::run_modules_pre();

    let original = ORIGINAL_FORK_SYSTEM_SERVER.load(Ordering::SeqCst);
    let pid = if original.is_null() {
        -1
    } else {
        unsafe {
            std::mem::transmute::<*mut c_void, ForkSystemServerFn>(original)(
                env,
                clazz,
                uid,
                gid,
                gids,
                runtime_flags,
                rlimits,
                permitted_capabilities,
                effective_capabilities,
            )
        }
    };

    let is_child = pid == 0;
    if is_child {
        context::run_modules_post();
    }
    context::end_specialize(-1, is_child);
    pid
}
