//! Per-spawn state (spec §4.6 item 4, data model `ZygiskContext`). One
//! instance is built right before a managed fork/specialize call and torn
//! down right after; `g_ctx` makes it reachable from the API callbacks a
//! module invokes during its own `pre_*`/`post_*` hooks, mirroring the global
//! pointer the reference implementation keeps for the same reason.

use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};

use jni_sys::JNIEnv;
use log::{debug, warn};
use zp_abi::{AppSpecializeArgsV3, ModuleAbi, ServerSpecializeArgsV1, SpecializeArgs};

use crate::{daemon_client, fds};

/// One loaded third-party module. `abi` is only populated once the module's
/// own `onLoad` calls back through `register_module`; a module that never
/// registers is still tracked (for fd bookkeeping) but contributes no hooks.
pub struct Module {
    pub name: String,
    pub handle: *mut c_void,
    pub abi: Option<*const ModuleAbi>,
    pub index: usize,
    /// Set by `set_option(DlcloseModuleLibrary)`; honored after post-specialize
    /// hooks run rather than immediately, since a module may still be called
    /// into (e.g. its own post hook) after requesting this.
    pub dlclose_requested: bool,
}

unsafe impl Send for Module {}

pub struct ZygiskContext {
    pub env: *mut JNIEnv,
    pub args: SpecializeArgs,
    pub process: String,
    pub info_flags: u32,
    pub allowed_fds: std::collections::HashSet<i32>,
    pub exempted_fds: Vec<i32>,
    pub modules: Vec<Box<Module>>,
}

unsafe impl Send for ZygiskContext {}

static G_CTX: AtomicPtr<ZygiskContext> = AtomicPtr::new(std::ptr::null_mut());

/// Builds the context for one spawn: downloads every module's `.so` from the
/// daemon, `dlopen`s each from its memfd, and calls its `zygisk_module_entry`
/// so it can register itself. Installs the result as `g_ctx`.
pub fn begin_specialize(env: *mut JNIEnv, args: SpecializeArgs, process: String, info_flags: u32, skip_modules: bool) {
    let allowed_fds = fds::snapshot_allowed();
    let mut modules = Vec::new();

    let handles = if skip_modules { Vec::new() } else { daemon_client::read_modules() };
    for (index, handle) in handles.into_iter().enumerate() {
        let path = format!("/proc/self/fd/{}", handle.so.as_raw_fd());
        let Ok(path_c) = CString::new(path) else { continue };
        let dl_handle = unsafe { nix::libc::dlopen(path_c.as_ptr(), nix::libc::RTLD_NOW) };
        if dl_handle.is_null() {
            warn!("failed to dlopen module {}", handle.name);
            continue;
        }

        let mut module = Box::new(Module {
            name: handle.name,
            handle: dl_handle,
            abi: None,
            index,
            dlclose_requested: false,
        });
        let this_module = module.as_ref() as *const Module as *const c_void;
        let api_table = crate::api::build_table(this_module);

        if let Some(entry) = lookup_entry(dl_handle) {
            unsafe { entry(&api_table, env) };
        } else {
            warn!("module {} has no {} export", module.name, zp_abi::MODULE_ENTRY_SYMBOL);
        }
        modules.push(module);
    }

    let ctx =
        Box::new(ZygiskContext { env, args, process, info_flags, allowed_fds, exempted_fds: Vec::new(), modules });
    G_CTX.store(Box::into_raw(ctx), Ordering::SeqCst);
}

fn lookup_entry(handle: *mut c_void) -> Option<zp_abi::ModuleEntryFn> {
    let Ok(symbol) = CString::new(zp_abi::MODULE_ENTRY_SYMBOL) else { return None };
    let sym = unsafe { nix::libc::dlsym(handle, symbol.as_ptr()) };
    if sym.is_null() {
        return None;
    }
    Some(unsafe { std::mem::transmute::<*mut c_void, zp_abi::ModuleEntryFn>(sym) })
}

/// Current context, if a spawn is in flight. Valid only between
/// [`begin_specialize`] and [`end_specialize`].
pub fn current() -> Option<&'static mut ZygiskContext> {
    let ptr = G_CTX.load(Ordering::SeqCst);
    unsafe { ptr.as_mut() }
}

/// Finds the module owning a `this_module` identity pointer a module passed
/// back into an API call.
pub fn module_by_identity(this_module: *const c_void) -> Option<&'static mut Module> {
    let ctx = current()?;
    ctx.modules.iter_mut().find(|m| m.as_ref() as *const Module as *const c_void == this_module).map(Box::as_mut)
}

/// Runs every loaded module's `pre_app_specialize`/`pre_server_specialize` in
/// `ReadModules` order (testable property 6: pre and post both run in that
/// same order, never reversed).
pub fn run_modules_pre() {
    let Some(ctx) = current() else { return };
    match ctx.args {
        SpecializeArgs::App(args) => run_pre_app(ctx, args),
        SpecializeArgs::Server(args) => run_pre_server(ctx, args),
    }
}

fn run_pre_app(ctx: &mut ZygiskContext, args: *mut AppSpecializeArgsV3) {
    for module in &ctx.modules {
        let Some(abi) = module.abi else { continue };
        if let Some(f) = unsafe { (*abi).v1.pre_app_specialize } {
            debug!("running pre_app_specialize for {}", module.name);
            unsafe { f(module.handle, args) };
        }
    }
}

fn run_pre_server(ctx: &mut ZygiskContext, args: *mut ServerSpecializeArgsV1) {
    for module in &ctx.modules {
        let Some(abi) = module.abi else { continue };
        if let Some(f) = unsafe { (*abi).v1.pre_server_specialize } {
            debug!("running pre_server_specialize for {}", module.name);
            unsafe { f(module.handle, args) };
        }
    }
}

/// For application specialize only (spec §4.6 item 5): unions whatever fds
/// modules exempted during `run_modules_pre` into the platform's own
/// `fdsToIgnore` array and writes the combined array back through
/// `args.fds_to_ignore`, so the platform's own subsequent fd bookkeeping
/// (it does its own close-unlisted-fds pass after this call returns) also
/// spares the exempted descriptors. A no-op for system_server, which has no
/// `fds_to_ignore` field to begin with.
pub fn apply_ignore_list() {
    let Some(ctx) = current() else { return };
    let SpecializeArgs::App(args) = ctx.args else { return };
    if ctx.exempted_fds.is_empty() {
        return;
    }
    let env = ctx.env;
    let platform_ignore = unsafe { read_jint_array(env, *(*args).fds_to_ignore) };
    let merged = fds::merge_ignore_list(&platform_ignore, &ctx.exempted_fds);
    if let Some(array) = unsafe { new_jint_array(env, &merged) } {
        unsafe { *(*args).fds_to_ignore = array };
    } else {
        warn!("failed to allocate merged fds_to_ignore array");
    }
}

unsafe fn read_jint_array(env: *mut JNIEnv, array: jni_sys::jintArray) -> Vec<i32> {
    if array.is_null() {
        return Vec::new();
    }
    let Some(get_array_length) = (unsafe { (**env).GetArrayLength }) else { return Vec::new() };
    let Some(get_int_array_region) = (unsafe { (**env).GetIntArrayRegion }) else { return Vec::new() };
    let len = unsafe { get_array_length(env, array) };
    if len <= 0 {
        return Vec::new();
    }
    let mut buf = vec![0i32; len as usize];
    unsafe { get_int_array_region(env, array, 0, len, buf.as_mut_ptr()) };
    buf
}

unsafe fn new_jint_array(env: *mut JNIEnv, values: &[i32]) -> Option<jni_sys::jintArray> {
    let new_int_array = unsafe { (**env).NewIntArray }?;
    let set_int_array_region = unsafe { (**env).SetIntArrayRegion }?;
    let array = unsafe { new_int_array(env, values.len() as jni_sys::jsize) };
    if array.is_null() {
        return None;
    }
    if !values.is_empty() {
        unsafe { set_int_array_region(env, array, 0, values.len() as jni_sys::jsize, values.as_ptr()) };
    }
    Some(array)
}

pub fn run_modules_post() {
    let Some(ctx) = current() else { return };
    match ctx.args {
        SpecializeArgs::App(args) => run_post_app(ctx, args),
        SpecializeArgs::Server(args) => run_post_server(ctx, args),
    }
}

fn run_post_app(ctx: &mut ZygiskContext, args: *mut AppSpecializeArgsV3) {
    for module in &ctx.modules {
        let Some(abi) = module.abi else { continue };
        if let Some(f) = unsafe { (*abi).v1.post_app_specialize } {
            debug!("running post_app_specialize for {}", module.name);
            unsafe { f(module.handle, args as *const AppSpecializeArgsV3) };
        }
    }
}

fn run_post_server(ctx: &mut ZygiskContext, args: *mut ServerSpecializeArgsV1) {
    for module in &ctx.modules {
        let Some(abi) = module.abi else { continue };
        if let Some(f) = unsafe { (*abi).v1.post_server_specialize } {
            debug!("running post_server_specialize for {}", module.name);
            unsafe { f(module.handle, args as *const ServerSpecializeArgsV1) };
        }
    }
}

/// Tears the context down. In the child (`is_child`), post-specialize hooks
/// have already run: dlcloses any module that requested it via
/// `set_option(DlcloseModuleLibrary)` and sanitizes fds not in the pre-fork
/// snapshot or exempted by a module. In the parent, the platform's fork
/// returned the forked child's pid and this process never ran a single
/// module hook against its own, still-live fd table — only the context
/// itself is torn down, matching `fork_post`'s bare `g_ctx = nullptr`.
pub fn end_specialize(dirfd: i32, is_child: bool) {
    let ptr = G_CTX.swap(std::ptr::null_mut(), Ordering::SeqCst);
    if ptr.is_null() {
        return;
    }
    let ctx = unsafe { Box::from_raw(ptr) };
    if !is_child {
        return;
    }
    for module in &ctx.modules {
        if module.dlclose_requested && unsafe { nix::libc::dlclose(module.handle) } != 0 {
            warn!("dlclose requested by {} failed", module.name);
        }
    }
    fds::sanitize(&ctx.allowed_fds, &ctx.exempted_fds, dirfd);
}
