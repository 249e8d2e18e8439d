//! Populates the [`zp_abi::ApiTableV4`] handed to each module's `onLoad`.
//! Every callback here is reached through a module's own copy of the table,
//! whose `this_module` field is a pointer to that module's
//! [`crate::context::Module`] — the only way the agent identifies which
//! module is calling back in, since the C ABI carries no other context.

use std::ffi::CStr;
use std::os::fd::IntoRawFd;
use std::os::raw::{c_char, c_int, c_void};

use jni_sys::JNIEnv;
use log::warn;
use zp_abi::{ApiTableV4, ModuleAbi, ModuleOption};

use crate::{context, daemon_client, jni_hook, plt};

pub fn build_table(this_module: *const c_void) -> ApiTableV4 {
    ApiTableV4 {
        this_module,
        register_module: Some(register_module),
        hook_jni_native_methods: Some(hook_jni_native_methods),
        plt_hook_register: Some(plt_hook_register),
        plt_hook_exclude: Some(plt_hook_exclude),
        plt_hook_commit: Some(plt_hook_commit),
        connect_companion: Some(connect_companion),
        set_option: Some(set_option),
        get_module_dir: Some(get_module_dir),
        get_flags: Some(get_flags),
        exempt_fd: Some(exempt_fd),
        plt_hook_commit_v4: Some(plt_hook_commit),
    }
}

unsafe extern "C" fn register_module(this_module: *const c_void, module: *const ModuleAbi) -> bool {
    let Some(m) = context::module_by_identity(this_module) else { return false };
    if module.is_null() {
        return false;
    }
    let version = unsafe { (*module).api_version };
    if version < 1 {
        warn!("module {} registered with unsupported api_version {version}", m.name);
        return false;
    }
    m.abi = Some(module);
    true
}

unsafe extern "C" fn hook_jni_native_methods(
    env: *mut JNIEnv,
    class_name: *const c_char,
    methods: *mut jni_sys::JNINativeMethod,
    num_methods: c_int,
) {
    unsafe { jni_hook::hook_jni_native_methods(env, class_name, methods, num_methods) };
}

unsafe extern "C" fn plt_hook_register(
    regex: *const c_char,
    symbol: *const c_char,
    new_func: *mut c_void,
    old_func: *mut *mut c_void,
) -> bool {
    let (Some(regex), Some(symbol)) = (c_str(regex), c_str(symbol)) else { return false };
    plt::register(regex, symbol, new_func, old_func)
}

unsafe extern "C" fn plt_hook_exclude(regex: *const c_char, symbol: *const c_char) -> bool {
    let (Some(regex), Some(symbol)) = (c_str(regex), c_str(symbol)) else { return false };
    plt::exclude(regex, symbol)
}

unsafe extern "C" fn plt_hook_commit() -> bool {
    plt::commit()
}

unsafe extern "C" fn connect_companion(self_module: *const c_void) -> c_int {
    let Some(module) = context::module_by_identity(self_module) else { return -1 };
    match daemon_client::request_companion_socket(module.index) {
        Some(stream) => stream.into_raw_fd(),
        None => -1,
    }
}

unsafe extern "C" fn get_module_dir(self_module: *const c_void) -> c_int {
    let Some(module) = context::module_by_identity(self_module) else { return -1 };
    match daemon_client::get_module_dir(module.index) {
        Some(fd) => fd.into_raw_fd(),
        None => -1,
    }
}

unsafe extern "C" fn set_option(self_module: *const c_void, option: ModuleOption) {
    let Some(module) = context::module_by_identity(self_module) else { return };
    match option {
        ModuleOption::ForceDenylistUnmount => {
            if let Some(ctx) = context::current() {
                ctx.info_flags |= zp_abi::ProcessFlags::ProcessOnDenylist as u32;
            }
        }
        ModuleOption::DlcloseModuleLibrary => {
            module.dlclose_requested = true;
        }
    }
}

unsafe extern "C" fn get_flags(_self_module: *const c_void) -> u32 {
    context::current().map(|ctx| ctx.info_flags).unwrap_or(0)
}

unsafe extern "C" fn exempt_fd(fd: c_int) -> bool {
    let Some(ctx) = context::current() else { return false };
    if !ctx.exempted_fds.contains(&fd) {
        ctx.exempted_fds.push(fd);
    }
    true
}

fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}
