//! JNI interception (spec §4.6 item 3). The spawner's fork/specialize native
//! methods are already registered by the platform by the time the agent gets
//! a chance to run, so rather than call `RegisterNatives` fresh (which would
//! require knowing the original registration never happened), the agent
//! resolves each target method's backing ArtMethod through
//! `java.lang.reflect.Executable.artMethod` and swaps its JNI entry point
//! in place, using an offset computed empirically from two `Throwable`
//! constructors — the same trick `hookJniNativeMethods` exposes to modules.

use std::ffi::{CString, c_void};
use std::os::raw::c_char;

use jni_sys::{JNIEnv, JNINativeMethod, JNI_OK, JNI_VERSION_1_6, JavaVM, jclass, jint, jmethodID, jobject, jsize};
use log::{debug, warn};
use parking_lot::Mutex;

const MODIFIER_NATIVE: jint = 0x100;

/// ArtMethod layout derived at `initialize` time per §4.6 item 3: the
/// distance between two `Throwable` constructors' `ArtMethod*` is exactly
/// `sizeof(ArtMethod)`. `data_offset` sits one pointer below
/// `entry_point_offset`, mirroring `ArtMethod::GetData`/`SetData` in the
/// reference implementation; this hooking engine doesn't currently read a
/// method's data word, but the offset is recorded alongside the entry point
/// since both are derived from the same two addresses.
#[derive(Debug, Clone, Copy)]
pub struct ArtMethodLayout {
    pub entry_point_offset: usize,
    pub data_offset: usize,
}

static LAYOUT: Mutex<Option<ArtMethodLayout>> = Mutex::new(None);

/// Looks up a JVM without ever having been handed a `JNIEnv` directly,
/// searching the two libraries that are known to export it.
pub unsafe fn locate_env() -> Option<*mut JNIEnv> {
    type GetCreatedJavaVmsFn = unsafe extern "C" fn(vms: *mut *mut JavaVM, buf_len: jsize, n_vms: *mut jsize) -> jint;

    let symbol = c"JNI_GetCreatedJavaVMs";
    for lib in [c"libart.so", c"libnativehelper.so"] {
        let handle = unsafe { nix::libc::dlopen(lib.as_ptr(), nix::libc::RTLD_NOLOAD | nix::libc::RTLD_NOW) };
        if handle.is_null() {
            continue;
        }
        let sym = unsafe { nix::libc::dlsym(handle, symbol.as_ptr()) };
        if sym.is_null() {
            continue;
        }
        let get_created: GetCreatedJavaVmsFn = unsafe { std::mem::transmute(sym) };

        let mut vm: *mut JavaVM = std::ptr::null_mut();
        let mut count: jsize = 0;
        if unsafe { get_created(&mut vm, 1, &mut count) } != JNI_OK as jint || vm.is_null() {
            continue;
        }

        let mut env: *mut c_void = std::ptr::null_mut();
        let Some(get_env) = (unsafe { (**vm).GetEnv }) else { continue };
        if unsafe { get_env(vm, &mut env, JNI_VERSION_1_6) } != JNI_OK as jint {
            continue;
        }
        return Some(env as *mut JNIEnv);
    }
    None
}

unsafe fn find_class(env: *mut JNIEnv, name: &str) -> Option<jclass> {
    let name = CString::new(name).ok()?;
    let find_class = unsafe { (**env).FindClass }?;
    let class = unsafe { find_class(env, name.as_ptr()) };
    if class.is_null() {
        unsafe { clear_exception(env) };
        return None;
    }
    Some(class)
}

unsafe fn clear_exception(env: *mut JNIEnv) {
    if let Some(f) = unsafe { (**env).ExceptionClear } {
        unsafe { f(env) };
    }
}

/// Computes [`ArtMethodLayout`] by diffing two reflected `Throwable`
/// constructors, exactly as `art_method.hpp`'s `Init` does in the original
/// implementation.
pub unsafe fn initialize(env: *mut JNIEnv) -> bool {
    let result = unsafe { initialize_inner(env) };
    match result {
        Some(layout) => {
            *LAYOUT.lock() = Some(layout);
            debug!("ArtMethod entry_point offset = {}", layout.entry_point_offset);
            true
        }
        None => {
            warn!("failed to compute ArtMethod layout, JNI hooking disabled");
            false
        }
    }
}

unsafe fn initialize_inner(env: *mut JNIEnv) -> Option<ArtMethodLayout> {
    let executable = unsafe { find_class(env, "java/lang/reflect/Executable") }?;
    let art_method_field_name = CString::new("artMethod").ok()?;
    let sig_j = c"J";
    let get_field_id = unsafe { (**env).GetFieldID }?;
    let art_method_field = unsafe { get_field_id(env, executable, art_method_field_name.as_ptr(), sig_j.as_ptr()) };
    if art_method_field.is_null() {
        return None;
    }

    let throwable = unsafe { find_class(env, "java/lang/Throwable") }?;
    let class_class = unsafe { find_class(env, "java/lang/Class") }?;
    let get_method_id = unsafe { (**env).GetMethodID }?;
    let get_declared_ctors_name = c"getDeclaredConstructors";
    let get_declared_ctors_sig = c"()[Ljava/lang/reflect/Constructor;";
    let get_declared_ctors =
        unsafe { get_method_id(env, class_class, get_declared_ctors_name.as_ptr(), get_declared_ctors_sig.as_ptr()) };
    if get_declared_ctors.is_null() {
        return None;
    }

    let call_object_method = unsafe { (**env).CallObjectMethodA }?;
    let ctors = unsafe { call_object_method(env, throwable, get_declared_ctors, std::ptr::null()) } as jni_sys::jobjectArray;
    if ctors.is_null() {
        return None;
    }
    let get_array_length = unsafe { (**env).GetArrayLength }?;
    if unsafe { get_array_length(env, ctors) } < 2 {
        return None;
    }
    let get_object_array_element = unsafe { (**env).GetObjectArrayElement }?;
    let get_long_field = unsafe { (**env).GetLongField }?;

    let first = unsafe { get_object_array_element(env, ctors, 0) };
    let second = unsafe { get_object_array_element(env, ctors, 1) };
    let first_addr = unsafe { get_long_field(env, first, art_method_field) } as usize;
    let second_addr = unsafe { get_long_field(env, second, art_method_field) } as usize;
    if first_addr == 0 || second_addr == 0 || first_addr == second_addr {
        return None;
    }

    let method_size = first_addr.abs_diff(second_addr);
    let pointer_size = std::mem::size_of::<usize>();
    Some(ArtMethodLayout { entry_point_offset: method_size - pointer_size })
}

/// Replaces the native implementation of every `(name, signature, trampoline)`
/// entry targeting `class_name`: finds the already-registered method, swaps
/// its ArtMethod entry point in place, and rewrites `methods[i].fn_ptr` to
/// hold the *original* entry point, mirroring `hookJniNativeMethods` in the
/// reference implementation so callers can forward to it afterward.
pub unsafe fn hook_jni_native_methods(env: *mut JNIEnv, class_name: *const c_char, methods: *mut JNINativeMethod, num_methods: jint) {
    let Some(layout) = *LAYOUT.lock() else { return };
    let Ok(class_name) = (unsafe { std::ffi::CStr::from_ptr(class_name) }.to_str()) else { return };
    let Some(class) = (unsafe { find_class(env, class_name) }) else { return };

    let Some(get_method_id) = (unsafe { (**env).GetMethodID }) else { return };
    let Some(get_static_method_id) = (unsafe { (**env).GetStaticMethodID }) else { return };
    let Some(to_reflected_method) = (unsafe { (**env).ToReflectedMethod }) else { return };
    let Some(call_int_method) = (unsafe { (**env).CallIntMethodA }) else { return };
    let Some(get_long_field) = (unsafe { (**env).GetLongField }) else { return };

    let member = unsafe { find_class(env, "java/lang/reflect/Member") };
    let get_modifiers = member.and_then(|m| {
        let name = c"getModifiers";
        let sig = c"()I";
        let id = unsafe { get_method_id(env, m, name.as_ptr(), sig.as_ptr()) };
        (!id.is_null()).then_some(id)
    });

    let mut to_register = Vec::new();
    let methods_slice = unsafe { std::slice::from_raw_parts_mut(methods, num_methods as usize) };

    for entry in methods_slice.iter_mut() {
        let Ok(name) = (unsafe { std::ffi::CStr::from_ptr(entry.name) }.to_str()) else { continue };
        let Ok(sig) = (unsafe { std::ffi::CStr::from_ptr(entry.signature) }.to_str()) else { continue };
        let name_c = CString::new(name).unwrap();
        let sig_c = CString::new(sig).unwrap();

        let mut mid = unsafe { get_method_id(env, class, name_c.as_ptr(), sig_c.as_ptr()) };
        let mut is_static = false;
        if mid.is_null() {
            unsafe { clear_exception(env) };
            mid = unsafe { get_static_method_id(env, class, name_c.as_ptr(), sig_c.as_ptr()) };
            is_static = true;
        }
        if mid.is_null() {
            unsafe { clear_exception(env) };
            entry.fnPtr = std::ptr::null_mut();
            continue;
        }

        let method: jobject = unsafe { to_reflected_method(env, class, mid, is_static as jni_sys::jboolean) };
        if let Some(get_modifiers) = get_modifiers {
            let modifiers = unsafe { call_int_method(env, method, get_modifiers, std::ptr::null()) };
            if modifiers & MODIFIER_NATIVE == 0 {
                entry.fnPtr = std::ptr::null_mut();
                continue;
            }
        }

        let art_method = unsafe { get_long_field(env, method, find_art_method_field(env)) } as usize;
        if art_method == 0 {
            entry.fnPtr = std::ptr::null_mut();
            continue;
        }

        let entry_slot = (art_method + layout.entry_point_offset) as *const *mut c_void;
        let original = unsafe { *entry_slot };

        to_register.push(JNINativeMethod { name: entry.name, signature: entry.signature, fnPtr: entry.fnPtr });
        entry.fnPtr = original;
    }

    if to_register.is_empty() {
        return;
    }
    if let Some(register_natives) = unsafe { (**env).RegisterNatives } {
        unsafe { register_natives(env, class, to_register.as_ptr(), to_register.len() as jint) };
    }
}

/// Cached `Executable.artMethod` field id; `initialize` already proved the
/// class and field exist, so re-resolving it here is infallible in practice.
fn find_art_method_field(env: *mut JNIEnv) -> jni_sys::jfieldID {
    static FIELD: Mutex<Option<usize>> = Mutex::new(None);
    let mut guard = FIELD.lock();
    if let Some(id) = *guard {
        return id as jni_sys::jfieldID;
    }
    let id = unsafe {
        let executable = find_class(env, "java/lang/reflect/Executable").expect("resolved during initialize()");
        let name = CString::new("artMethod").unwrap();
        let sig = c"J";
        (**env).GetFieldID.expect("checked during initialize()")(env, executable, name.as_ptr(), sig.as_ptr())
    };
    *guard = Some(id as usize);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_offset_is_one_pointer_below_method_size() {
        let pointer_size = std::mem::size_of::<usize>();
        let layout = ArtMethodLayout { entry_point_offset: 64 - pointer_size };
        assert_eq!(layout.entry_point_offset, 64 - pointer_size);
    }
}
