//! Per-ABI helper daemon (spec §4.5): listens on an abstract `AF_UNIX
//! SOCK_STREAM` socket and serves the binary request protocol, one thread
//! per connection. Also doubles as the companion-process entry point when
//! invoked as `zygiskd companion <module.so> <fd>`.

mod config;
mod liteloader;
mod logcat;
mod modules;
mod packages;
mod protocol;

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use anyhow::{Context, Result, bail};
use log::{LevelFilter, error, info, warn};

fn init_logging(tag: &str) {
    if std::env::var_os("KSU").is_some() {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(if cfg!(debug_assertions) { LevelFilter::Trace } else { LevelFilter::Info })
                .with_tag(tag),
        );
    } else {
        env_logger::init();
    }
}

fn bind_listener(name: &str) -> Result<OwnedFd> {
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, bind, socket};
    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .context("creating daemon listen socket")?;
    let addr = UnixAddr::new_abstract(name.as_bytes()).context("building abstract daemon socket address")?;
    bind(fd.as_raw_fd(), &addr).context("binding daemon socket")?;
    let ret = unsafe { nix::libc::listen(fd.as_raw_fd(), 16) };
    if ret < 0 {
        bail!("listen() failed: {}", std::io::Error::last_os_error());
    }
    Ok(fd)
}

fn run_daemon() -> Result<()> {
    config::init()?;
    let cfg = config::instance();

    let _watcher = liteloader::LiteloaderWatcher::spawn(&cfg.liteloader_dir());

    let socket_name = cfg.daemon_socket_name();
    let listener = bind_listener(&socket_name)?;
    info!("daemon{} listening on abstract socket {socket_name}", cfg.abi.bits());

    loop {
        let raw_fd = unsafe { nix::libc::accept(listener.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
        if raw_fd < 0 {
            error!("accept failed: {}", std::io::Error::last_os_error());
            continue;
        }
        let conn = unsafe { OwnedFd::from_raw_fd(raw_fd) };
        std::thread::spawn(move || {
            if let Err(err) = protocol::serve(conn) {
                warn!("connection handler error: {err:#}");
            }
        });
    }
}

/// `zygiskd companion <module.so> <fd>`: dlopens the module's shared object
/// off disk (it's a regular file here, not a memfd) and calls its
/// `zygisk_companion_entry(fd)` handler with the inherited duplex fd, per
/// the companion-process model in spec §4.5/§6.
fn run_companion(so_path: &str, fd: i32) -> Result<()> {
    type CompanionEntryFn = unsafe extern "C" fn(std::os::raw::c_int);

    let path = CString::new(so_path).context("module path has embedded NUL")?;
    let handle = unsafe { nix::libc::dlopen(path.as_ptr(), nix::libc::RTLD_NOW) };
    if handle.is_null() {
        bail!("dlopen({so_path}) failed for companion process");
    }

    let symbol = c"zygisk_companion_entry";
    let sym = unsafe { nix::libc::dlsym(handle, symbol.as_ptr()) };
    if sym.is_null() {
        bail!("{so_path} has no zygisk_companion_entry symbol");
    }

    let entry: CompanionEntryFn = unsafe { std::mem::transmute(sym) };
    unsafe { entry(fd) };
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("companion") => {
            init_logging("zygiskd-companion");
            let (Some(so_path), Some(fd_str)) = (args.get(2), args.get(3)) else {
                error!("companion: missing <module.so> <fd> arguments");
                std::process::exit(1);
            };
            let Ok(fd) = fd_str.parse::<i32>() else {
                error!("companion: invalid fd {fd_str}");
                std::process::exit(1);
            };
            if let Err(err) = run_companion(so_path, fd) {
                error!("companion process failed: {err:#}");
                std::process::exit(1);
            }
        }
        Some("version") => {
            println!("zygiskd {}", env!("CARGO_PKG_VERSION"));
        }
        _ => {
            init_logging("zygiskd");
            if let Err(err) = run_daemon() {
                error!("daemon failed: {err:#}");
                std::process::exit(1);
            }
        }
    }
}
