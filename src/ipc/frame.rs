//! Length-prefixed message transfer with peer credentials.
//!
//! Every message travels as two stream-socket writes: a native `usize`
//! length prefix, then the payload. The length counts the terminating NUL
//! byte. On receive, both halves arrive with `SCM_CREDENTIALS` ancillary
//! data (the socket has `SO_PASSCRED` set) and the two credential blocks
//! must match; a payload shorter or longer than announced is rejected
//! before anything is executed.

use std::io::IoSliceMut;
use std::mem;
use std::os::unix::io::RawFd;

use nix::sys::socket::{recvmsg, send, ControlMessageOwned, MsgFlags, UnixAddr, UnixCredentials};

use crate::error::{Error, Result};

/// Upper bound for a single message payload; anything larger is a protocol
/// violation, not a legitimate command.
const MAX_MSG_LEN: usize = 128 * 1024;

/// Send one framed string.
pub fn send_str(fd: RawFd, s: &str) -> Result<()> {
    let len = s.len() + 1;
    let prefix = len.to_ne_bytes();
    send(fd, &prefix, MsgFlags::MSG_NOSIGNAL)
        .map_err(|e| Error::Sys(e))?;
    let mut payload = Vec::with_capacity(len);
    payload.extend_from_slice(s.as_bytes());
    payload.push(0);
    send(fd, &payload, MsgFlags::MSG_NOSIGNAL).map_err(Error::Sys)?;
    Ok(())
}

fn creds_equal(a: &UnixCredentials, b: &UnixCredentials) -> bool {
    a.pid() == b.pid() && a.uid() == b.uid() && a.gid() == b.gid()
}

fn recv_with_creds(fd: RawFd, want: usize) -> Result<(Vec<u8>, UnixCredentials)> {
    let mut buf = vec![0u8; want];
    let mut cmsg_buf = nix::cmsg_space!(UnixCredentials);
    let received;
    let creds;
    {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;
        received = msg.bytes;
        creds = msg.cmsgs().find_map(|c| match c {
            ControlMessageOwned::ScmCredentials(uc) => Some(uc),
            _ => None,
        });
    }
    let creds = creds.ok_or_else(|| {
        Error::InvalidArgument("message arrived without sender credentials".into())
    })?;
    buf.truncate(received);
    Ok((buf, creds))
}

/// Receive one framed string together with the sender's credentials.
pub fn recv_str(fd: RawFd) -> Result<(String, UnixCredentials)> {
    let (prefix, creds_len) = recv_with_creds(fd, mem::size_of::<usize>())?;
    if prefix.len() != mem::size_of::<usize>() {
        return Err(Error::InvalidArgument(format!(
            "length prefix of unexpected size: {} bytes",
            prefix.len()
        )));
    }
    let mut len_bytes = [0u8; mem::size_of::<usize>()];
    len_bytes.copy_from_slice(&prefix);
    let len = usize::from_ne_bytes(len_bytes);
    if len == 0 || len > MAX_MSG_LEN {
        return Err(Error::InvalidArgument(format!(
            "announced message length {} is out of range",
            len
        )));
    }

    let (payload, creds_data) = recv_with_creds(fd, len)?;
    if payload.len() != len {
        return Err(Error::InvalidArgument(format!(
            "announced {} bytes but received {}",
            len,
            payload.len()
        )));
    }
    if !creds_equal(&creds_len, &creds_data) {
        return Err(Error::InvalidArgument(
            "credentials of the two message halves do not match".into(),
        ));
    }

    let text = std::str::from_utf8(&payload[..len - 1])
        .map_err(|_| Error::Parse("message payload is not valid UTF-8".into()))?;
    Ok((text.to_string(), creds_len))
}
