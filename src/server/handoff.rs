//! SCM_RIGHTS handoff receiving.
//!
//! Apache passes the client's TCP socket over a Unix domain socket together
//! with a small JSON payload describing the request.

use nix::cmsg_space;
use nix::sys::socket::{
    getsockopt, recvmsg, sockopt::SockType, ControlMessageOwned, MsgFlags, SockaddrStorage,
};
use serde::Deserialize;
use std::io::IoSliceMut;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::UnixStream;

use crate::error::HandoffError;

/// Request data sent alongside the client fd.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestData {
    pub user_id: Option<i64>,
    pub prompt: Option<String>,
    pub system: Option<String>,
    pub request_id: Option<String>,
}

/// A received client connection.
pub struct Handoff {
    /// The client socket (owned).
    pub client_fd: OwnedFd,
    pub data: RequestData,
    /// Payload length, for logging.
    pub data_len: usize,
}

/// Receive the client fd and request data from Apache, bounded by `timeout`.
pub async fn receive_handoff(
    stream: &UnixStream,
    timeout: Duration,
    buffer_size: usize,
) -> Result<Handoff, HandoffError> {
    tokio::time::timeout(timeout, async {
        stream
            .ready(Interest::READABLE)
            .await
            .map_err(|e| HandoffError::ReceiveFailed(e.to_string()))?;

        // recvmsg with ancillary data has no async equivalent in tokio; the
        // socket is readable, so the blocking call returns promptly.
        let fd = stream.as_raw_fd();
        tokio::task::spawn_blocking(move || receive_blocking(fd, buffer_size))
            .await
            .map_err(|e| HandoffError::ReceiveFailed(format!("spawn_blocking failed: {}", e)))?
    })
    .await
    .map_err(|_| HandoffError::Timeout)?
}

fn receive_blocking(fd: RawFd, buffer_size: usize) -> Result<Handoff, HandoffError> {
    let mut data_buf = vec![0u8; buffer_size];
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);
    let mut iov = [IoSliceMut::new(&mut data_buf)];

    let msg = recvmsg::<SockaddrStorage>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;

    if msg.flags.contains(MsgFlags::MSG_TRUNC) {
        return Err(HandoffError::DataTruncated);
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(HandoffError::ControlMessageTruncated);
    }

    let mut client_fd: Option<OwnedFd> = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for raw in fds {
                // SAFETY: fds received via SCM_RIGHTS are fresh and owned by us.
                let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                if client_fd.is_none() {
                    client_fd = Some(owned);
                } else {
                    tracing::warn!(extra_fd = raw, "Closing unexpected extra fd");
                    // dropped here, which closes it
                }
            }
        }
    }

    let client_fd = client_fd.ok_or(HandoffError::NoFileDescriptor)?;

    let sock_type = getsockopt(&client_fd, SockType).map_err(|_| HandoffError::InvalidSocketType)?;
    if sock_type != nix::sys::socket::SockType::Stream {
        return Err(HandoffError::InvalidSocketType);
    }

    let data_len = msg.bytes;
    let data = parse_request_data(&data_buf[..data_len]);

    Ok(Handoff {
        client_fd,
        data,
        data_len,
    })
}

/// Parse the JSON payload. The payload is optional, so malformed input
/// falls back to defaults.
fn parse_request_data(data: &[u8]) -> RequestData {
    if data.is_empty() {
        return RequestData::default();
    }
    serde_json::from_slice(data).unwrap_or_else(|e| {
        tracing::warn!(
            error = %e,
            data_len = data.len(),
            "Failed to parse handoff data as JSON, using defaults"
        );
        RequestData::default()
    })
}
