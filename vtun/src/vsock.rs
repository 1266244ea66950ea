//! vsock endpoints: the parent-side listener and the enclave-side dialer.

use async_trait::async_trait;
use nix::libc;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};
use tracing::{debug, info};

use crate::engine::Acceptor;
use crate::error::{Error, Result};

/// Default port the enclave connects to.
pub const DEFAULT_PORT: u32 = 1024;

/// CID of the parent instance as seen from inside an enclave.
pub const PARENT_CID: u32 = 3;

/// ioctl request code for IOCTL_VM_SOCKETS_GET_LOCAL_CID (linux/vm_sockets.h)
const IOCTL_VM_SOCKETS_GET_LOCAL_CID: libc::c_ulong = 0x7b9;

/// Look up the local context ID via `/dev/vsock`.
pub fn local_cid() -> io::Result<u32> {
    let file = File::open("/dev/vsock")?;
    let mut cid: u32 = 0;

    let ret = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            IOCTL_VM_SOCKETS_GET_LOCAL_CID as _,
            &mut cid,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(cid)
}

/// Bind a vsock listener on the local context ID and `port`.
pub fn listen(port: u32) -> Result<VsockAcceptor> {
    let cid = local_cid().map_err(Error::Vsock)?;
    let listener = VsockListener::bind(VsockAddr::new(cid, port)).map_err(Error::Vsock)?;

    info!(cid, port, "Listening on vsock");
    Ok(VsockAcceptor { listener })
}

/// Accepts enclave connections on a vsock listener.
pub struct VsockAcceptor {
    listener: VsockListener,
}

#[async_trait]
impl Acceptor for VsockAcceptor {
    type Conn = VsockStream;

    async fn accept(&mut self) -> io::Result<(VsockStream, String)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((stream, format!("vsock:{}:{}", addr.cid(), addr.port())))
    }
}

/// Enclave-side connection source: "accepting" means dialing the parent.
///
/// Plugged into the same engine as the listener, so the enclave reconnects
/// after every session and never runs two sessions at once.
pub struct VsockDialer {
    cid: u32,
    port: u32,
}

impl VsockDialer {
    pub fn new(cid: u32, port: u32) -> Self {
        Self { cid, port }
    }
}

#[async_trait]
impl Acceptor for VsockDialer {
    type Conn = VsockStream;

    async fn accept(&mut self) -> io::Result<(VsockStream, String)> {
        debug!(cid = self.cid, port = self.port, "Connecting to parent");
        let stream = VsockStream::connect(VsockAddr::new(self.cid, self.port)).await?;
        Ok((stream, format!("vsock:{}:{}", self.cid, self.port)))
    }
}
