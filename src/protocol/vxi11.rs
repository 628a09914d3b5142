//! VXI-11 Device Core and Device Abort channel clients (VXI-11 revision 1.0,
//! carried over ONC/RPC).

use std::time::Duration;

use bitflags::bitflags;

use super::rpc::{RpcError, TcpRpcClient};
use super::xdr::Unpacker;

// Device core channel
pub const DEVICE_CORE_PROG: u32 = 0x0607AF;
pub const DEVICE_CORE_VERS: u32 = 1;
const CREATE_LINK: u32 = 10;
const DEVICE_WRITE: u32 = 11;
const DEVICE_READ: u32 = 12;
const DEVICE_READSTB: u32 = 13;
const DEVICE_TRIGGER: u32 = 14;
const DEVICE_CLEAR: u32 = 15;
const DEVICE_REMOTE: u32 = 16;
const DEVICE_LOCAL: u32 = 17;
const DEVICE_LOCK: u32 = 18;
const DEVICE_UNLOCK: u32 = 19;
const DEVICE_ENABLE_SRQ: u32 = 20;
const DESTROY_LINK: u32 = 23;

// Device abort channel
pub const DEVICE_ASYNC_PROG: u32 = 0x0607B0;
pub const DEVICE_ASYNC_VERS: u32 = 1;
const DEVICE_ABORT: u32 = 1;

consts_to_enum! {
    /// `Device_ErrorCode` values returned inside every core-channel reply.
    pub enum DeviceError: u32 {
        NoError 0
        SyntaxError 1
        DeviceNotAccessible 3
        InvalidLinkIdentifier 4
        ParameterError 5
        ChannelNotEstablished 6
        OperationNotSupported 8
        OutOfResources 9
        DeviceLockedByAnotherLink 11
        NoLockHeldByThisLink 12
        IoTimeout 15
        IoError 17
        Abort 23
        ChannelAlreadyEstablished 29
    }
}

impl DeviceError {
    fn from_raw(raw: u32) -> Self {
        DeviceError::try_from(raw).unwrap_or(DeviceError::IoError)
    }
}

bitflags! {
    /// `Device_Flags` sent with core-channel requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u32 {
        /// Block until the device lock is released instead of failing.
        const WAITLOCK = 1;
        /// This write chunk carries the END indicator.
        const END = 8;
        /// The `term_char` field of a `device_read` is significant.
        const TERMCHAR_SET = 128;
    }
}

bitflags! {
    /// `device_read` termination reason bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReadReason: u32 {
        /// Requested byte count reached.
        const REQCNT = 1;
        /// Termination character matched.
        const CHR = 2;
        /// Device asserted the END indicator.
        const END = 4;
    }
}

/// Reply to `create_link`.
#[derive(Debug, Clone)]
pub struct CreateLinkResp {
    pub error: DeviceError,
    pub link_id: i32,
    pub abort_port: u16,
    /// Largest chunk the device accepts in a single `device_write`.
    pub max_recv_size: u32,
}

/// Slack added on top of the RPC-level `io_timeout` so the socket deadline
/// strictly exceeds it and in-protocol timeouts win over socket errors.
const SOCKET_TIMEOUT_SLACK: Duration = Duration::from_secs(1);

fn socket_timeout(io_timeout_ms: u32) -> Option<Duration> {
    if io_timeout_ms == u32::MAX {
        None
    } else {
        Some(Duration::from_millis(io_timeout_ms as u64) + SOCKET_TIMEOUT_SLACK)
    }
}

/// Client for the Device Core channel (program 395183).
#[derive(Debug)]
pub struct CoreClient {
    rpc: TcpRpcClient,
}

impl CoreClient {
    /// Connects to the core channel, looking the port up through the
    /// portmapper unless an explicit `port` is given (useful through
    /// firewalls or ssh tunnels where the portmapper is unreachable).
    pub fn connect(host: &str, port: Option<u16>, open_timeout: Duration) -> Result<Self, RpcError> {
        let rpc = match port {
            Some(port) => {
                TcpRpcClient::connect(host, port, DEVICE_CORE_PROG, DEVICE_CORE_VERS, open_timeout)?
            }
            None => TcpRpcClient::connect_via_portmap(
                host,
                DEVICE_CORE_PROG,
                DEVICE_CORE_VERS,
                open_timeout,
            )?,
        };
        Ok(Self { rpc })
    }

    pub fn stream(&self) -> &std::net::TcpStream {
        self.rpc.stream()
    }

    fn prepare(&mut self, io_timeout_ms: u32) -> Result<(), RpcError> {
        self.rpc.set_io_timeout(socket_timeout(io_timeout_ms))
    }

    pub fn create_link(
        &mut self,
        client_id: i32,
        lock_device: bool,
        lock_timeout_ms: u32,
        device: &str,
    ) -> Result<CreateLinkResp, RpcError> {
        self.prepare(lock_timeout_ms)?;
        let reply = self.rpc.call(CREATE_LINK, |p| {
            p.pack_i32(client_id);
            p.pack_bool(lock_device);
            p.pack_u32(lock_timeout_ms);
            p.pack_opaque(device.as_bytes());
        })?;
        let mut u = Unpacker::new(&reply);
        Ok(CreateLinkResp {
            error: DeviceError::from_raw(u.unpack_u32()?),
            link_id: u.unpack_i32()?,
            abort_port: u.unpack_u32()? as u16,
            max_recv_size: u.unpack_u32()?,
        })
    }

    /// One `device_write` RPC. Returns the device error and the number of
    /// bytes the server accepted.
    pub fn device_write(
        &mut self,
        link_id: i32,
        io_timeout_ms: u32,
        lock_timeout_ms: u32,
        flags: OpFlags,
        data: &[u8],
    ) -> Result<(DeviceError, usize), RpcError> {
        self.prepare(io_timeout_ms)?;
        let reply = self.rpc.call(DEVICE_WRITE, |p| {
            p.pack_i32(link_id);
            p.pack_u32(io_timeout_ms);
            p.pack_u32(lock_timeout_ms);
            p.pack_u32(flags.bits());
            p.pack_opaque(data);
        })?;
        let mut u = Unpacker::new(&reply);
        Ok((DeviceError::from_raw(u.unpack_u32()?), u.unpack_u32()? as usize))
    }

    /// One `device_read` RPC. Returns the device error, the termination
    /// reason bitmask and the payload.
    pub fn device_read(
        &mut self,
        link_id: i32,
        request_size: u32,
        io_timeout_ms: u32,
        lock_timeout_ms: u32,
        flags: OpFlags,
        term_char: u8,
    ) -> Result<(DeviceError, ReadReason, Vec<u8>), RpcError> {
        self.prepare(io_timeout_ms)?;
        let reply = self.rpc.call(DEVICE_READ, |p| {
            p.pack_i32(link_id);
            p.pack_u32(request_size);
            p.pack_u32(io_timeout_ms);
            p.pack_u32(lock_timeout_ms);
            p.pack_u32(flags.bits());
            p.pack_i32(term_char as i32);
        })?;
        let mut u = Unpacker::new(&reply);
        let error = DeviceError::from_raw(u.unpack_u32()?);
        let reason = ReadReason::from_bits_truncate(u.unpack_u32()?);
        let data = u.unpack_opaque()?.to_vec();
        Ok((error, reason, data))
    }

    fn generic_call(
        &mut self,
        proc: u32,
        link_id: i32,
        flags: OpFlags,
        lock_timeout_ms: u32,
        io_timeout_ms: u32,
    ) -> Result<DeviceError, RpcError> {
        self.prepare(io_timeout_ms)?;
        let reply = self.rpc.call(proc, |p| {
            p.pack_i32(link_id);
            p.pack_u32(flags.bits());
            p.pack_u32(lock_timeout_ms);
            p.pack_u32(io_timeout_ms);
        })?;
        Ok(DeviceError::from_raw(Unpacker::new(&reply).unpack_u32()?))
    }

    pub fn device_readstb(
        &mut self,
        link_id: i32,
        flags: OpFlags,
        lock_timeout_ms: u32,
        io_timeout_ms: u32,
    ) -> Result<(DeviceError, u8), RpcError> {
        self.prepare(io_timeout_ms)?;
        let reply = self.rpc.call(DEVICE_READSTB, |p| {
            p.pack_i32(link_id);
            p.pack_u32(flags.bits());
            p.pack_u32(lock_timeout_ms);
            p.pack_u32(io_timeout_ms);
        })?;
        let mut u = Unpacker::new(&reply);
        Ok((DeviceError::from_raw(u.unpack_u32()?), u.unpack_u32()? as u8))
    }

    pub fn device_trigger(
        &mut self,
        link_id: i32,
        flags: OpFlags,
        lock_timeout_ms: u32,
        io_timeout_ms: u32,
    ) -> Result<DeviceError, RpcError> {
        self.generic_call(DEVICE_TRIGGER, link_id, flags, lock_timeout_ms, io_timeout_ms)
    }

    pub fn device_clear(
        &mut self,
        link_id: i32,
        flags: OpFlags,
        lock_timeout_ms: u32,
        io_timeout_ms: u32,
    ) -> Result<DeviceError, RpcError> {
        self.generic_call(DEVICE_CLEAR, link_id, flags, lock_timeout_ms, io_timeout_ms)
    }

    pub fn device_remote(
        &mut self,
        link_id: i32,
        flags: OpFlags,
        lock_timeout_ms: u32,
        io_timeout_ms: u32,
    ) -> Result<DeviceError, RpcError> {
        self.generic_call(DEVICE_REMOTE, link_id, flags, lock_timeout_ms, io_timeout_ms)
    }

    pub fn device_local(
        &mut self,
        link_id: i32,
        flags: OpFlags,
        lock_timeout_ms: u32,
        io_timeout_ms: u32,
    ) -> Result<DeviceError, RpcError> {
        self.generic_call(DEVICE_LOCAL, link_id, flags, lock_timeout_ms, io_timeout_ms)
    }

    pub fn device_lock(
        &mut self,
        link_id: i32,
        flags: OpFlags,
        lock_timeout_ms: u32,
    ) -> Result<DeviceError, RpcError> {
        self.prepare(lock_timeout_ms)?;
        let reply = self.rpc.call(DEVICE_LOCK, |p| {
            p.pack_i32(link_id);
            p.pack_u32(flags.bits());
            p.pack_u32(lock_timeout_ms);
        })?;
        Ok(DeviceError::from_raw(Unpacker::new(&reply).unpack_u32()?))
    }

    pub fn device_unlock(&mut self, link_id: i32) -> Result<DeviceError, RpcError> {
        self.prepare(10_000)?;
        let reply = self.rpc.call(DEVICE_UNLOCK, |p| p.pack_i32(link_id))?;
        Ok(DeviceError::from_raw(Unpacker::new(&reply).unpack_u32()?))
    }

    pub fn device_enable_srq(
        &mut self,
        link_id: i32,
        enable: bool,
        handle: &[u8],
    ) -> Result<DeviceError, RpcError> {
        debug_assert!(handle.len() <= 40);
        self.prepare(10_000)?;
        let reply = self.rpc.call(DEVICE_ENABLE_SRQ, |p| {
            p.pack_i32(link_id);
            p.pack_bool(enable);
            p.pack_opaque(handle);
        })?;
        Ok(DeviceError::from_raw(Unpacker::new(&reply).unpack_u32()?))
    }

    pub fn destroy_link(&mut self, link_id: i32) -> Result<DeviceError, RpcError> {
        self.prepare(10_000)?;
        let reply = self.rpc.call(DESTROY_LINK, |p| p.pack_i32(link_id))?;
        Ok(DeviceError::from_raw(Unpacker::new(&reply).unpack_u32()?))
    }
}

/// Client for the Device Abort channel (program 395184), connected on demand
/// to the `abort_port` returned by `create_link`. Used to interrupt an
/// in-progress core-channel call, e.g. when closing during a blocked read.
#[derive(Debug)]
pub struct AbortClient {
    rpc: TcpRpcClient,
}

impl AbortClient {
    pub fn connect(host: &str, abort_port: u16, open_timeout: Duration) -> Result<Self, RpcError> {
        let rpc = TcpRpcClient::connect(
            host,
            abort_port,
            DEVICE_ASYNC_PROG,
            DEVICE_ASYNC_VERS,
            open_timeout,
        )?;
        Ok(Self { rpc })
    }

    pub fn device_abort(&mut self, link_id: i32) -> Result<DeviceError, RpcError> {
        self.rpc.set_io_timeout(Some(Duration::from_secs(5)))?;
        let reply = self.rpc.call(DEVICE_ABORT, |p| p.pack_i32(link_id))?;
        Ok(DeviceError::from_raw(Unpacker::new(&reply).unpack_u32()?))
    }
}
