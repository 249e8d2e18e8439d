//! Binary framing shared by the control socket, the daemon protocol and the
//! agent's logcat redirect: a byte opcode, native-width integers, and
//! length-prefixed strings, plus out-of-band fd transfer via `SCM_RIGHTS`.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};

fn eof() -> io::Error {
    io::Error::new(ErrorKind::UnexpectedEof, "short read on wire socket")
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_ne_bytes())
}

pub fn read_usize<R: Read>(r: &mut R) -> io::Result<usize> {
    let mut buf = [0u8; size_of::<usize>()];
    r.read_exact(&mut buf)?;
    Ok(usize::from_ne_bytes(buf))
}

pub fn write_usize<W: Write>(w: &mut W, v: usize) -> io::Result<()> {
    w.write_all(&v.to_ne_bytes())
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_usize(r)?;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_usize(w, s.len())?;
    w.write_all(s.as_bytes())
}

/// Sends exactly one open file descriptor as ancillary `SCM_RIGHTS` data,
/// along with a one-byte marker in the regular stream so the peer knows a
/// control message is coming (matches the daemon protocol's convention of
/// reusing the request connection itself to carry the fd).
pub fn send_fd<S: AsRawFd>(sock: &S, fd: BorrowedFd<'_>) -> io::Result<()> {
    let fds = [fd.as_raw_fd()];
    let cmsg = ControlMessage::ScmRights(&fds);
    socket::sendmsg::<()>(sock.as_raw_fd(), &[io::IoSlice::new(&[1u8])], &[cmsg], MsgFlags::empty(), None)
        .map_err(io::Error::from)?;
    Ok(())
}

/// Receives exactly one fd sent with [`send_fd`]. Returns `None` if the peer
/// closed instead of sending (treated as `ProtocolMismatch` by callers).
pub fn recv_fd<S: AsRawFd>(sock: &S) -> io::Result<Option<OwnedFd>> {
    let mut marker = [0u8; 1];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let mut iov = [io::IoSliceMut::new(&mut marker)];
    let msg = socket::recvmsg::<()>(sock.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
        .map_err(io::Error::from)?;
    if msg.bytes == 0 {
        return Ok(None);
    }
    use std::os::fd::FromRawFd;
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&raw) = fds.first() {
                // Safety: the kernel handed us ownership of this fd via SCM_RIGHTS.
                return Ok(Some(unsafe { OwnedFd::from_raw_fd(raw) }));
            }
        }
    }
    Err(eof())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn string_round_trips() {
        let mut buf = Vec::new();
        write_string(&mut buf, "hello world").unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_string(&mut cur).unwrap(), "hello world");
    }

    #[test]
    fn empty_string_round_trips() {
        let mut buf = Vec::new();
        write_string(&mut buf, "").unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_string(&mut cur).unwrap(), "");
    }

    #[test]
    fn usize_round_trips() {
        for n in [0usize, 1, 42, usize::MAX] {
            let mut buf = Vec::new();
            write_usize(&mut buf, n).unwrap();
            let mut cur = Cursor::new(buf);
            assert_eq!(read_usize(&mut cur).unwrap(), n);
        }
    }

    #[test]
    fn short_read_is_an_error() {
        let mut cur = Cursor::new(vec![0u8; 2]);
        assert!(read_usize(&mut cur).is_err());
    }
}
