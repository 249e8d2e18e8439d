//! The C ABI a third-party module shared object is linked against. Module
//! authors' own code is out of scope for this crate; this module only
//! defines the contract the in-process agent uses to call into them and to
//! hand them an API table to call back through.

use std::os::raw::{c_int, c_long};

use jni_sys::{jint, JNIEnv};

/// Bumped whenever a new `ZygiskApiTableVN` is appended. A module declares the
/// highest version it understands as the first field of its entry struct; the
/// agent only ever populates up to that version and leaves the rest zeroed.
pub const API_VERSION: c_long = 4;

pub const MODULE_ENTRY_SYMBOL: &str = "zygisk_module_entry";

pub type ModuleEntryFn = unsafe extern "C" fn(api_table: *const ApiTableV4, env: *mut JNIEnv);

/// Flags returned by `GetProcessFlags` and surfaced to modules via
/// `ZygiskApi::get_flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessFlags {
    None = 0,
    ProcessGrantedRoot = 1 << 0,
    ProcessOnDenylist = 1 << 1,
    ProcessIsManager = 1 << 2,
}

/// Options a module can request through `ZygiskApi::set_option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(c_int)]
pub enum ModuleOption {
    ForceDenylistUnmount = 0,
    DlcloseModuleLibrary = 1,
}

#[repr(C)]
pub struct AppSpecializeArgsV3 {
    pub uid: *mut jni_sys::jint,
    pub gid: *mut jni_sys::jint,
    pub gids: *mut jni_sys::jintArray,
    pub runtime_flags: *mut jni_sys::jint,
    pub mount_external: *mut jni_sys::jint,
    pub se_info: *mut jni_sys::jstring,
    pub nice_name: *mut jni_sys::jstring,
    pub instruction_set: *mut jni_sys::jstring,
    pub app_data_dir: *mut jni_sys::jstring,
    pub fds_to_ignore: *mut jni_sys::jintArray,
    pub is_child_zygote: *mut jni_sys::jboolean,
    pub is_top_app: *mut jni_sys::jboolean,
    pub pkg_data_info_list: *mut jni_sys::jobjectArray,
    pub whitelisted_data_info_list: *mut jni_sys::jobjectArray,
    pub mount_data_dirs: *mut jni_sys::jboolean,
    pub mount_storage_dirs: *mut jni_sys::jboolean,
}

#[repr(C)]
pub struct ServerSpecializeArgsV1 {
    pub uid: *mut jni_sys::jint,
    pub gid: *mut jni_sys::jint,
    pub gids: *mut jni_sys::jintArray,
    pub runtime_flags: *mut jni_sys::jint,
    pub permitted_capabilities: *mut jni_sys::jlong,
    pub effective_capabilities: *mut jni_sys::jlong,
}

/// Either half of the union the platform's native fork/specialize methods
/// pass; exactly one variant is live for a given spawn, matching
/// `ZygiskContext`'s `args` field in the data model.
#[derive(Clone, Copy)]
pub enum SpecializeArgs {
    App(*mut AppSpecializeArgsV3),
    Server(*mut ServerSpecializeArgsV1),
}

pub type PltHookRegisterFn =
    unsafe extern "C" fn(regex: *const std::os::raw::c_char, symbol: *const std::os::raw::c_char, new_func: *mut std::os::raw::c_void, old_func: *mut *mut std::os::raw::c_void) -> bool;
pub type PltHookExcludeFn =
    unsafe extern "C" fn(regex: *const std::os::raw::c_char, symbol: *const std::os::raw::c_char) -> bool;
pub type PltHookCommitFn = unsafe extern "C" fn() -> bool;
pub type ConnectCompanionFn = unsafe extern "C" fn(self_module: *const std::os::raw::c_void) -> c_int;
pub type GetModuleDirFn = unsafe extern "C" fn(self_module: *const std::os::raw::c_void) -> c_int;
pub type SetOptionFn = unsafe extern "C" fn(self_module: *const std::os::raw::c_void, option: ModuleOption);
pub type GetFlagsFn = unsafe extern "C" fn(self_module: *const std::os::raw::c_void) -> u32;
pub type ExemptFdFn = unsafe extern "C" fn(fd: c_int) -> bool;

/// The table handed to a module's `onLoad`. Fields beyond the module's
/// declared `api_version` are left as null/no-ops; `hook.cpp`'s
/// version-gated population is the reference behavior.
#[repr(C)]
pub struct ApiTableV4 {
    pub this_module: *const std::os::raw::c_void,
    pub register_module: Option<unsafe extern "C" fn(this_module: *const std::os::raw::c_void, module: *const ModuleAbi) -> bool>,
    // v1
    pub hook_jni_native_methods:
        Option<unsafe extern "C" fn(env: *mut JNIEnv, class_name: *const std::os::raw::c_char, methods: *mut jni_sys::JNINativeMethod, num_methods: c_int)>,
    pub plt_hook_register: Option<PltHookRegisterFn>,
    pub plt_hook_exclude: Option<PltHookExcludeFn>,
    pub plt_hook_commit: Option<PltHookCommitFn>,
    pub connect_companion: Option<ConnectCompanionFn>,
    pub set_option: Option<SetOptionFn>,
    pub get_module_dir: Option<GetModuleDirFn>,
    pub get_flags: Option<GetFlagsFn>,
    // v2
    pub exempt_fd: Option<ExemptFdFn>,
    // v4
    pub plt_hook_commit_v4: Option<PltHookCommitFn>,
}

/// A module's own dispatch table, version-tagged in its first field exactly
/// like `ZygiskModule::RegisterModuleImpl` expects.
#[repr(C)]
pub struct ModuleAbi {
    pub api_version: c_long,
    pub v1: ModuleAbiV1,
}

#[repr(C)]
pub struct ModuleAbiV1 {
    pub on_load: Option<unsafe extern "C" fn(this: *mut std::os::raw::c_void, env: *mut JNIEnv)>,
    pub pre_app_specialize: Option<unsafe extern "C" fn(this: *mut std::os::raw::c_void, args: *mut AppSpecializeArgsV3)>,
    pub post_app_specialize: Option<unsafe extern "C" fn(this: *mut std::os::raw::c_void, args: *const AppSpecializeArgsV3)>,
    pub pre_server_specialize: Option<unsafe extern "C" fn(this: *mut std::os::raw::c_void, args: *mut ServerSpecializeArgsV1)>,
    pub post_server_specialize: Option<unsafe extern "C" fn(this: *mut std::os::raw::c_void, args: *const ServerSpecializeArgsV1)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_is_latest_table() {
        assert_eq!(API_VERSION, 4);
    }
}
