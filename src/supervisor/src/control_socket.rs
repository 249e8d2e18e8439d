//! The abstract-namespace `AF_UNIX SOCK_DGRAM` control socket: `ctl
//! start|stop|exit` talks to the running supervisor through it, and the
//! monitor loop's other event source decodes datagrams back into commands.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use anyhow::{Context, Result, bail};
use nix::sys::socket::{
    AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr, bind, connect, recv, send, socket,
};
use zp_common::control::ControlCommand;
use zp_common::wire;

use crate::config;

fn abstract_addr(name: &str) -> Result<UnixAddr> {
    // Leading NUL marks a Linux abstract-namespace name; `UnixAddr::new_abstract`
    // handles the kernel encoding.
    UnixAddr::new_abstract(name.as_bytes()).context("building abstract socket address")
}

/// Binds the non-blocking datagram socket the monitor loop polls for
/// `ctl`/internal-daemon commands.
pub fn bind_control_socket() -> Result<OwnedFd> {
    let name = config::instance().control_socket_name();
    let fd = socket(AddressFamily::Unix, SockType::Datagram, SockFlag::SOCK_NONBLOCK, None)
        .context("creating control socket")?;
    bind(fd.as_raw_fd(), &abstract_addr(&name)?).context("binding control socket")?;
    Ok(fd)
}

/// One decoded datagram off the control socket.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    Start,
    Stop,
    Exit,
    Zygote64Injected,
    Zygote32Injected,
    Daemon64SetInfo(String),
    Daemon32SetInfo(String),
    Daemon64SetErrorInfo(String),
    Daemon32SetErrorInfo(String),
}

pub fn decode(buf: &[u8]) -> Result<ControlMessage> {
    let &[opcode, ref rest @ ..] = buf else {
        bail!("empty control datagram");
    };
    let cmd = ControlCommand::from_repr(opcode).context("unknown control opcode")?;

    let payload = || -> Result<String> {
        let mut cur = std::io::Cursor::new(rest);
        let len = wire::read_u32(&mut cur)? as usize;
        let start = cur.position() as usize;
        let bytes = rest
            .get(start..start + len)
            .context("short control datagram payload")?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    };

    Ok(match cmd {
        ControlCommand::Start => ControlMessage::Start,
        ControlCommand::Stop => ControlMessage::Stop,
        ControlCommand::Exit => ControlMessage::Exit,
        ControlCommand::Zygote64Injected => ControlMessage::Zygote64Injected,
        ControlCommand::Zygote32Injected => ControlMessage::Zygote32Injected,
        ControlCommand::Daemon64SetInfo => ControlMessage::Daemon64SetInfo(payload()?),
        ControlCommand::Daemon32SetInfo => ControlMessage::Daemon32SetInfo(payload()?),
        ControlCommand::Daemon64SetErrorInfo => ControlMessage::Daemon64SetErrorInfo(payload()?),
        ControlCommand::Daemon32SetErrorInfo => ControlMessage::Daemon32SetErrorInfo(payload()?),
    })
}

fn encode(cmd: ControlCommand, payload: Option<&str>) -> Vec<u8> {
    let mut buf = vec![cmd as u8];
    if let Some(payload) = payload {
        buf.extend((payload.len() as u32).to_ne_bytes());
        buf.extend(payload.as_bytes());
    }
    buf
}

/// Used by `ctl start|stop|exit`: connects to the running supervisor's
/// socket and fires a single datagram.
pub fn send_control_command(cmd: ControlCommand) -> Result<()> {
    let name = config::instance().control_socket_name();
    let fd = socket(AddressFamily::Unix, SockType::Datagram, SockFlag::empty(), None)
        .context("creating control client socket")?;
    connect(fd.as_raw_fd(), &abstract_addr(&name)?).context("connecting to control socket; is the supervisor running?")?;
    let buf = encode(cmd, None);
    send(fd.as_raw_fd(), &buf, MsgFlags::empty()).context("sending control command")?;
    Ok(())
}

/// Used internally (e.g. by the per-ABI daemon to report its own info/error
/// text back into the published status).
pub fn send_control_command_with_payload(cmd: ControlCommand, payload: &str) -> Result<()> {
    let name = config::instance().control_socket_name();
    let fd = socket(AddressFamily::Unix, SockType::Datagram, SockFlag::empty(), None)?;
    connect(fd.as_raw_fd(), &abstract_addr(&name)?)?;
    let buf = encode(cmd, Some(payload));
    send(fd.as_raw_fd(), &buf, MsgFlags::empty())?;
    Ok(())
}

pub fn recv_datagram(fd: impl AsFd) -> Result<Option<Vec<u8>>> {
    let mut buf = [0u8; 4096];
    match recv(fd.as_fd().as_raw_fd(), &mut buf, MsgFlags::empty()) {
        Ok(n) => Ok(Some(buf[..n].to_vec())),
        Err(nix::Error::EAGAIN) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_decodes_payload_commands() {
        let buf = encode(ControlCommand::Daemon64SetInfo, Some("hello"));
        let msg = decode(&buf).unwrap();
        match msg {
            ControlMessage::Daemon64SetInfo(s) => assert_eq!(s, "hello"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn encodes_and_decodes_bare_commands() {
        let buf = encode(ControlCommand::Start, None);
        assert!(matches!(decode(&buf).unwrap(), ControlMessage::Start));
    }
}
