//! Ethernet sessions: VXI-11, HiSLIP, raw socket and VICP.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};

use crate::enums::assert::TriggerProtocol;
use crate::enums::attribute::{AttrKind, Attribute, IoProtocol};
use crate::enums::status::{CompletionCode, ErrorCode};
use crate::flags::{AccessMode, FlushMode};
use crate::protocol::hislip::{self, HislipError, LockResponse};
use crate::protocol::rpc::RpcError;
use crate::protocol::vxi11::{AbortClient, CoreClient, DeviceError, OpFlags, ReadReason};
use crate::session::{IoSettings, Session};
use crate::{io_to_visa_err, AccessKey, Error, Result};

/// Default VICP port.
pub const VICP_PORT: u16 = 1861;

/// Lock-wait budget handed to VXI-11 calls that do not take the session
/// timeout, in milliseconds.
const LOCK_TIMEOUT_MS: u32 = 10_000;

fn split_host_port(spec: &str) -> (&str, Option<u16>) {
    match spec.split_once(',') {
        Some((head, port)) => (head, port.parse().ok()),
        None => (spec, None),
    }
}

fn connect_stream(host: &str, port: u16, open_timeout: Duration) -> Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::from(ErrorCode::RsrcNfound))?;
    let mut last = Error::from(ErrorCode::RsrcNfound);
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, open_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(|e| io_to_visa_err(&e))?;
                return Ok(stream);
            }
            Err(e) => last = io_to_visa_err(&e),
        }
    }
    Err(last)
}

fn set_keepalive(stream: &TcpStream, enable: bool) -> Result<()> {
    let sock = SockRef::from(stream);
    if enable {
        let params = TcpKeepalive::new().with_time(Duration::from_secs(60));
        sock.set_tcp_keepalive(&params)
            .map_err(|e| io_to_visa_err(&e))?;
    }
    sock.set_keepalive(enable).map_err(|e| io_to_visa_err(&e))
}

fn get_keepalive(stream: &TcpStream) -> Result<bool> {
    SockRef::from(stream)
        .keepalive()
        .map_err(|e| io_to_visa_err(&e))
}

fn set_nodelay(stream: &TcpStream, enable: bool) -> Result<()> {
    stream.set_nodelay(enable).map_err(|e| io_to_visa_err(&e))
}

// ---------------------------------------------------------------------------
// VXI-11

fn rpc_open_err(e: RpcError) -> Error {
    match e {
        RpcError::AuthError => Error::from(ErrorCode::ConnLost),
        // anything failing during connect/portmap means nobody is there
        _ => Error::from(ErrorCode::RsrcNfound),
    }
}

/// RPC failures during session I/O. A socket-level timeout here means the
/// network died: the socket deadline strictly exceeds the in-protocol
/// `io_timeout`, so a well-behaved server would have answered with
/// `IoTimeout` first.
fn rpc_io_err(e: RpcError) -> Error {
    match e {
        RpcError::ConnLost | RpcError::AuthError | RpcError::Timeout => {
            Error::from(ErrorCode::ConnLost)
        }
        RpcError::Io(_)
        | RpcError::BadRecord
        | RpcError::RpcMismatch
        | RpcError::ProgUnavail
        | RpcError::ProgMismatch
        | RpcError::ProcUnavail
        | RpcError::GarbageArgs
        | RpcError::NotRegistered => Error::from(ErrorCode::Io),
    }
}

fn device_err(error: DeviceError) -> Result<()> {
    let code = match error {
        DeviceError::NoError => return Ok(()),
        DeviceError::SyntaxError => ErrorCode::InvFmt,
        DeviceError::DeviceNotAccessible => ErrorCode::ConnLost,
        DeviceError::InvalidLinkIdentifier => ErrorCode::InvAccessKey,
        DeviceError::ParameterError => ErrorCode::InvParameter,
        DeviceError::OperationNotSupported => ErrorCode::NsupOper,
        DeviceError::OutOfResources => ErrorCode::Alloc,
        DeviceError::DeviceLockedByAnotherLink => ErrorCode::RsrcLocked,
        DeviceError::NoLockHeldByThisLink => ErrorCode::SesnNlocked,
        DeviceError::IoTimeout => ErrorCode::Tmo,
        DeviceError::Abort => ErrorCode::Abort,
        DeviceError::ChannelNotEstablished
        | DeviceError::IoError
        | DeviceError::ChannelAlreadyEstablished => ErrorCode::Io,
    };
    Err(Error::from(code))
}

/// A `TCPIP::host::lan_name::INSTR` session speaking VXI-11.
pub struct Vxi11Session {
    core: CoreClient,
    /// Abort channel, connected on first use to the `abort_port` from
    /// `create_link`.
    abort: Option<AbortClient>,
    host: String,
    abort_port: u16,
    link_id: i32,
    max_recv_size: usize,
    io: IoSettings,
    /// Holding a device lock makes subsequent I/O wait on contention
    /// instead of failing.
    locked: bool,
}

impl Vxi11Session {
    pub fn open(host_spec: &str, lan_device_name: &str, open_timeout: Duration) -> Result<Self> {
        let (host, port) = split_host_port(host_spec);
        let mut core = CoreClient::connect(host, port, open_timeout).map_err(rpc_open_err)?;

        let client_id = {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(0);
            ((std::process::id() ^ nanos) & 0x7FFF_FFFF) as i32
        };
        let link = core
            .create_link(client_id, false, LOCK_TIMEOUT_MS, lan_device_name)
            .map_err(rpc_open_err)?;
        device_err(link.error)?;
        log::debug!(
            "VXI-11 link {} to {}:{}, abort port {}, max_recv_size {}",
            link.link_id,
            host,
            lan_device_name,
            link.abort_port,
            link.max_recv_size
        );

        // honor the server's chunk limit exactly; sending more than
        // max_recv_size in one device_write crashes some servers
        let max_recv_size = match link.max_recv_size as usize {
            0 => 4096,
            m => m.min(1 << 30),
        };
        Ok(Self {
            core,
            abort: None,
            host: host.to_string(),
            abort_port: link.abort_port,
            link_id: link.link_id,
            max_recv_size,
            io: IoSettings::default(),
            locked: false,
        })
    }

    fn op_flags(&self) -> OpFlags {
        if self.locked {
            OpFlags::WAITLOCK
        } else {
            OpFlags::empty()
        }
    }

    /// Sends `device_abort` on the Abort channel, interrupting whatever the
    /// Core channel has in flight. Servers that returned abort port 0 from
    /// `create_link` do not implement the channel.
    fn device_abort(&mut self) -> Result<()> {
        if self.abort_port == 0 {
            return Err(Error::from(ErrorCode::NsupOper));
        }
        if self.abort.is_none() {
            let client = AbortClient::connect(&self.host, self.abort_port, Duration::from_secs(5))
                .map_err(rpc_open_err)?;
            self.abort = Some(client);
        }
        let link_id = self.link_id;
        let error = self
            .abort
            .as_mut()
            .unwrap()
            .device_abort(link_id)
            .map_err(rpc_io_err)?;
        match error {
            // the call being aborted reports Abort on the core channel, the
            // abort call itself succeeds either way
            DeviceError::NoError | DeviceError::Abort => Ok(()),
            other => device_err(other),
        }
    }
}

impl Session for Vxi11Session {
    fn read(&mut self, count: usize) -> Result<(Vec<u8>, CompletionCode)> {
        let mut flags = self.op_flags();
        let term_char = match self.io.term_char() {
            Some(tc) => {
                flags |= OpFlags::TERMCHAR_SET;
                tc
            }
            None => 0,
        };

        let total_timeout = self.io.timeout;
        let start = Instant::now();
        let mut out: Vec<u8> = Vec::new();
        let mut chunk_len = count.min(self.max_recv_size);

        loop {
            let io_timeout_ms = match total_timeout {
                None => u32::MAX,
                Some(t) => t
                    .saturating_sub(start.elapsed())
                    .as_millis()
                    .min(u32::MAX as u128 - 1) as u32,
            };
            let (error, reason, data) = match self.core.device_read(
                self.link_id,
                chunk_len as u32,
                io_timeout_ms,
                LOCK_TIMEOUT_MS,
                flags,
                term_char,
            ) {
                Ok(reply) => reply,
                Err(e) => return Err(rpc_io_err(e)),
            };
            if error == DeviceError::IoTimeout {
                return Err(Error::timeout_with(out));
            }
            device_err(error)?;
            out.extend_from_slice(&data);

            if reason.contains(ReadReason::CHR) {
                return Ok((out, CompletionCode::SuccessTermChar));
            }
            if reason.contains(ReadReason::END) {
                return Ok((out, CompletionCode::Success));
            }
            if out.len() >= count {
                return Ok((out, CompletionCode::SuccessMaxCnt));
            }
            chunk_len = (count - out.len()).min(self.max_recv_size);
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let io_timeout_ms = self.io.timeout_ms();
        let mut offset = 0usize;
        loop {
            let end = (offset + self.max_recv_size).min(data.len());
            let last = end == data.len();
            let mut flags = self.op_flags();
            if last && self.io.send_end {
                flags |= OpFlags::END;
            }
            let (error, size) = self
                .core
                .device_write(
                    self.link_id,
                    io_timeout_ms,
                    LOCK_TIMEOUT_MS,
                    flags,
                    &data[offset..end],
                )
                .map_err(rpc_io_err)?;
            device_err(error)?;
            if size == 0 && end > offset {
                return Err(Error::from(ErrorCode::Io));
            }
            // the server may accept fewer bytes than the chunk; resend the
            // remainder rather than failing
            offset += size.min(end - offset);
            if offset >= data.len() {
                return Ok(offset);
            }
        }
    }

    fn clear(&mut self) -> Result<()> {
        let error = self
            .core
            .device_clear(
                self.link_id,
                self.op_flags(),
                LOCK_TIMEOUT_MS,
                self.io.timeout_ms(),
            )
            .map_err(rpc_io_err)?;
        device_err(error)
    }

    fn read_stb(&mut self) -> Result<u8> {
        let (error, stb) = self
            .core
            .device_readstb(
                self.link_id,
                self.op_flags(),
                LOCK_TIMEOUT_MS,
                self.io.timeout_ms(),
            )
            .map_err(rpc_io_err)?;
        device_err(error)?;
        Ok(stb)
    }

    fn assert_trigger(&mut self, protocol: TriggerProtocol) -> Result<()> {
        if protocol != TriggerProtocol::Default {
            return Err(Error::from(ErrorCode::NsupOper));
        }
        let error = self
            .core
            .device_trigger(
                self.link_id,
                self.op_flags(),
                LOCK_TIMEOUT_MS,
                self.io.timeout_ms(),
            )
            .map_err(rpc_io_err)?;
        device_err(error)
    }

    fn lock(
        &mut self,
        mode: AccessMode,
        timeout: Duration,
        _requested_key: Option<&str>,
    ) -> Result<Option<AccessKey>> {
        if mode.contains(AccessMode::SHARED_LOCK) {
            // the VXI-11 lock primitive is device-wide and exclusive
            return Err(Error::from(ErrorCode::InvLockType));
        }
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let flags = if timeout_ms > 0 {
            OpFlags::WAITLOCK
        } else {
            OpFlags::empty()
        };
        let error = self
            .core
            .device_lock(self.link_id, flags, timeout_ms)
            .map_err(rpc_io_err)?;
        match error {
            DeviceError::DeviceLockedByAnotherLink => Err(Error::from(ErrorCode::Tmo)),
            other => {
                device_err(other)?;
                self.locked = true;
                Ok(None)
            }
        }
    }

    fn unlock(&mut self) -> Result<()> {
        let error = self.core.device_unlock(self.link_id).map_err(rpc_io_err)?;
        device_err(error)?;
        self.locked = false;
        Ok(())
    }

    fn enable_srq(&mut self, enable: bool) -> Result<()> {
        let error = self
            .core
            .device_enable_srq(self.link_id, enable, b"")
            .map_err(rpc_io_err)?;
        device_err(error)
    }

    fn get_attr(&mut self, kind: AttrKind) -> Result<Attribute> {
        if let Some(attr) = self.io.get_attr(kind) {
            return Ok(attr);
        }
        match kind {
            AttrKind::TcpipKeepalive => {
                Ok(Attribute::TcpipKeepalive(get_keepalive(self.core.stream())?))
            }
            AttrKind::TcpipNodelay => Ok(Attribute::TcpipNodelay(
                self.core
                    .stream()
                    .nodelay()
                    .map_err(|e| io_to_visa_err(&e))?,
            )),
            AttrKind::RsrcLockState => Ok(Attribute::RsrcLockState(if self.locked {
                AccessMode::EXCLUSIVE_LOCK
            } else {
                AccessMode::NO_LOCK
            })),
            AttrKind::IoProt => Ok(Attribute::IoProt(IoProtocol::Normal)),
            _ => Err(Error::from(ErrorCode::NsupAttr)),
        }
    }

    fn set_attr(&mut self, attr: &Attribute) -> Result<()> {
        if self.io.set_attr(attr) {
            return Ok(());
        }
        match attr {
            Attribute::TcpipKeepalive(enable) => set_keepalive(self.core.stream(), *enable),
            Attribute::TcpipNodelay(enable) => set_nodelay(self.core.stream(), *enable),
            _ => Err(Error::from(ErrorCode::NsupAttr)),
        }
    }

    fn close(&mut self) -> Result<()> {
        // cancel anything still in flight on the core channel so
        // destroy_link is not queued behind a blocked call
        if self.abort_port != 0 {
            if let Err(e) = self.device_abort() {
                log::debug!("device_abort on close failed: {}", e);
            }
        }
        if self.locked {
            if let Err(e) = self.unlock() {
                log::debug!("releasing device lock on close failed: {}", e);
            }
        }
        match self.core.destroy_link(self.link_id) {
            Ok(error) => {
                if error != DeviceError::NoError {
                    log::debug!("destroy_link reported {:?}", error);
                }
            }
            Err(e) => log::debug!("destroy_link failed: {}", e),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HiSLIP

fn hislip_err(e: HislipError) -> Error {
    match e {
        HislipError::Timeout => Error::from(ErrorCode::Tmo),
        HislipError::ConnLost => Error::from(ErrorCode::ConnLost),
        // a FatalError invalidates the link
        HislipError::Fatal(..) => Error::from(ErrorCode::ConnLost),
        HislipError::Protocol(_) => Error::from(ErrorCode::Io),
        HislipError::Io(e) => io_to_visa_err(&e),
    }
}

/// A `TCPIP::host::hislipN::INSTR` session.
pub struct HislipSession {
    client: hislip::Client,
    io: IoSettings,
    pending: Vec<u8>,
    pending_end: bool,
}

impl HislipSession {
    pub fn open(host_spec: &str, lan_device_name: &str, open_timeout: Duration) -> Result<Self> {
        let (host, explicit_port) = split_host_port(host_spec);
        let (sub_address, sub_port) = split_host_port(lan_device_name);
        let port = sub_port.or(explicit_port).unwrap_or(hislip::PORT);

        let mut client = hislip::Client::connect(host, port, sub_address, *b"VP", open_timeout)
            .map_err(|e| match e {
                HislipError::Timeout | HislipError::ConnLost | HislipError::Io(_) => {
                    Error::from(ErrorCode::RsrcNfound)
                }
                other => hislip_err(other),
            })?;
        let io = IoSettings::default();
        client.set_timeout(io.timeout).map_err(hislip_err)?;
        Ok(Self {
            client,
            io,
            pending: Vec::new(),
            pending_end: false,
        })
    }

    /// Serves a read out of the buffered bytes if a stop condition is
    /// already satisfied.
    fn take_buffered(&mut self, count: usize) -> Option<(Vec<u8>, CompletionCode)> {
        if let Some(tc) = self.io.term_char() {
            if let Some(pos) = self.pending.iter().position(|&b| b == tc) {
                if pos + 1 > count {
                    let out: Vec<u8> = self.pending.drain(..count).collect();
                    return Some((out, CompletionCode::SuccessMaxCnt));
                }
                let out: Vec<u8> = self.pending.drain(..pos + 1).collect();
                return Some((out, CompletionCode::SuccessTermChar));
            }
        }
        if self.pending.len() >= count {
            let out: Vec<u8> = self.pending.drain(..count).collect();
            return Some((out, CompletionCode::SuccessMaxCnt));
        }
        if self.pending_end {
            if self.io.suppress_end {
                // END suppressed: the message boundary is invisible, keep
                // accumulating against term-char and count
                self.pending_end = false;
            } else {
                self.pending_end = false;
                let out = std::mem::take(&mut self.pending);
                return Some((out, CompletionCode::Success));
            }
        }
        None
    }
}

impl Session for HislipSession {
    fn read(&mut self, count: usize) -> Result<(Vec<u8>, CompletionCode)> {
        loop {
            if let Some(done) = self.take_buffered(count) {
                return Ok(done);
            }
            let want = count - self.pending.len();
            match self.client.receive(want) {
                Ok((data, end)) => {
                    self.pending.extend_from_slice(&data);
                    self.pending_end = end;
                }
                Err(HislipError::Timeout) => {
                    return Err(Error::timeout_with(std::mem::take(&mut self.pending)));
                }
                Err(e) => return Err(hislip_err(e)),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.client.send(data, self.io.send_end).map_err(hislip_err)
    }

    fn clear(&mut self) -> Result<()> {
        self.pending.clear();
        self.pending_end = false;
        self.client.device_clear().map_err(hislip_err)
    }

    fn read_stb(&mut self) -> Result<u8> {
        // a queued service request already carries the status byte
        if let Some(stb) = self.client.take_srq() {
            return Ok(stb);
        }
        self.client.status_query().map_err(hislip_err)
    }

    fn assert_trigger(&mut self, protocol: TriggerProtocol) -> Result<()> {
        if protocol != TriggerProtocol::Default {
            return Err(Error::from(ErrorCode::NsupOper));
        }
        self.client.trigger().map_err(hislip_err)
    }

    fn lock(
        &mut self,
        mode: AccessMode,
        timeout: Duration,
        requested_key: Option<&str>,
    ) -> Result<Option<AccessKey>> {
        let shared = mode.contains(AccessMode::SHARED_LOCK);
        let key = if shared {
            requested_key.unwrap_or("visa-pure-shared").to_string()
        } else {
            String::new()
        };
        let response = self
            .client
            .lock_request(timeout, &key)
            .map_err(hislip_err)?;
        match response {
            LockResponse::Success | LockResponse::SuccessShared => {
                Ok(shared.then_some(key))
            }
            LockResponse::Failure => Err(Error::from(ErrorCode::Tmo)),
            LockResponse::Error => Err(Error::from(ErrorCode::RsrcLocked)),
        }
    }

    fn unlock(&mut self) -> Result<()> {
        match self.client.lock_release().map_err(hislip_err)? {
            LockResponse::Success | LockResponse::SuccessShared => Ok(()),
            _ => Err(Error::from(ErrorCode::SesnNlocked)),
        }
    }

    fn enable_srq(&mut self, _enable: bool) -> Result<()> {
        // service requests always flow on the async channel; the queue is
        // drained by read_stb
        Ok(())
    }

    fn get_attr(&mut self, kind: AttrKind) -> Result<Attribute> {
        if let Some(attr) = self.io.get_attr(kind) {
            return Ok(attr);
        }
        match kind {
            AttrKind::TcpipKeepalive => Ok(Attribute::TcpipKeepalive(get_keepalive(
                self.client.sync_stream(),
            )?)),
            AttrKind::TcpipNodelay => Ok(Attribute::TcpipNodelay(
                self.client
                    .sync_stream()
                    .nodelay()
                    .map_err(|e| io_to_visa_err(&e))?,
            )),
            AttrKind::TcpipHislipVersion => {
                let version = self.client.protocol_version() as u32;
                Ok(Attribute::TcpipHislipVersion(
                    (version >> 8) << 20 | (version & 0xFF) << 8,
                ))
            }
            AttrKind::TcpipHislipOverlapEn => {
                Ok(Attribute::TcpipHislipOverlapEn(self.client.overlap_mode()))
            }
            AttrKind::TcpipHislipMaxMessageKb => Ok(Attribute::TcpipHislipMaxMessageKb(
                (self.client.max_msg_size() / 1024) as u32,
            )),
            AttrKind::IoProt => Ok(Attribute::IoProt(IoProtocol::Normal)),
            _ => Err(Error::from(ErrorCode::NsupAttr)),
        }
    }

    fn set_attr(&mut self, attr: &Attribute) -> Result<()> {
        if self.io.set_attr(attr) {
            if attr.kind() == AttrKind::TmoValue {
                self.client.set_timeout(self.io.timeout).map_err(hislip_err)?;
            }
            return Ok(());
        }
        match attr {
            Attribute::TcpipKeepalive(enable) => {
                set_keepalive(self.client.sync_stream(), *enable)?;
                set_keepalive(self.client.async_stream(), *enable)
            }
            Attribute::TcpipNodelay(enable) => {
                set_nodelay(self.client.sync_stream(), *enable)?;
                set_nodelay(self.client.async_stream(), *enable)
            }
            Attribute::TcpipHislipMaxMessageKb(kb) => {
                if *kb == 0 {
                    return Err(Error::from(ErrorCode::NsupAttrState));
                }
                self.client
                    .negotiate_max_msg_size(*kb as u64 * 1024)
                    .map_err(hislip_err)?;
                Ok(())
            }
            _ => Err(Error::from(ErrorCode::NsupAttr)),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.client.close();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Raw socket

/// A `TCPIP::host::port::SOCKET` session.
///
/// Plain sockets have no message framing, so `SUPPRESS_END_EN` defaults to
/// enabled the way NI-VISA configures these resources: a lull in incoming
/// data is not an END indicator unless the caller opts in.
pub struct SocketSession {
    stream: TcpStream,
    io: IoSettings,
    io_prot: IoProtocol,
    pending: Vec<u8>,
    max_recv_size: usize,
}

impl SocketSession {
    pub fn open(host: &str, port: u16, open_timeout: Duration) -> Result<Self> {
        let stream = connect_stream(host, port, open_timeout)?;
        Ok(Self {
            stream,
            io: IoSettings {
                suppress_end: true,
                ..IoSettings::default()
            },
            io_prot: IoProtocol::Normal,
            pending: Vec::new(),
            max_recv_size: 4096,
        })
    }

    fn drain_pending(&mut self, upto: usize) -> Vec<u8> {
        let take = upto.min(self.pending.len());
        self.pending.drain(..take).collect()
    }
}

impl Session for SocketSession {
    fn read(&mut self, count: usize) -> Result<(Vec<u8>, CompletionCode)> {
        let term_char = self.io.term_char();
        let deadline = self.io.timeout.map(|t| Instant::now() + t);
        let mut chunk = vec![0u8; self.max_recv_size];

        loop {
            if let Some(tc) = term_char {
                if let Some(pos) = self.pending.iter().position(|&b| b == tc) {
                    return if pos + 1 > count {
                        Ok((self.drain_pending(count), CompletionCode::SuccessMaxCnt))
                    } else {
                        Ok((self.drain_pending(pos + 1), CompletionCode::SuccessTermChar))
                    };
                }
            }
            if self.pending.len() >= count {
                return Ok((self.drain_pending(count), CompletionCode::SuccessMaxCnt));
            }

            let remaining = match deadline {
                None => None,
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(d) if !d.is_zero() => Some(d),
                    _ => return Err(Error::timeout_with(self.drain_pending(count))),
                },
            };
            self.stream
                .set_read_timeout(remaining)
                .map_err(|e| io_to_visa_err(&e))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    // orderly shutdown from the peer
                    return if !self.pending.is_empty() && !self.io.suppress_end {
                        Ok((self.drain_pending(count), CompletionCode::Success))
                    } else {
                        Err(Error::from(ErrorCode::ConnLost))
                    };
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(Error::timeout_with(self.drain_pending(count)));
                }
                Err(e) => return Err(io_to_visa_err(&e)),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.stream
            .set_write_timeout(self.io.timeout)
            .map_err(|e| io_to_visa_err(&e))?;
        self.stream
            .write_all(data)
            .map_err(|e| io_to_visa_err(&e))?;
        Ok(data.len())
    }

    fn clear(&mut self) -> Result<()> {
        self.pending.clear();
        // swallow anything the instrument already queued
        let _ = self.stream.set_read_timeout(Some(Duration::from_millis(100)));
        let mut sink = [0u8; 4096];
        while matches!(self.stream.read(&mut sink), Ok(n) if n > 0) {}
        Ok(())
    }

    fn flush(&mut self, mode: FlushMode) -> Result<()> {
        if mode.contains(FlushMode::READ_BUF) {
            self.clear()?;
        }
        if mode.intersects(FlushMode::READ_BUF_DISCARD | FlushMode::IO_IN_BUF | FlushMode::IO_IN_BUF_DISCARD) {
            self.pending.clear();
        }
        // writes are unbuffered; the write-side flags are accepted as no-ops
        Ok(())
    }

    fn assert_trigger(&mut self, protocol: TriggerProtocol) -> Result<()> {
        // per VISA, a socket resource triggers via "*TRG\n" when the session
        // is configured for 488.2 strings
        if protocol != TriggerProtocol::Default || self.io_prot != IoProtocol::Usb488 {
            return Err(Error::from(ErrorCode::NsupOper));
        }
        self.write(b"*TRG\n").map(|_| ())
    }

    fn get_attr(&mut self, kind: AttrKind) -> Result<Attribute> {
        if let Some(attr) = self.io.get_attr(kind) {
            return Ok(attr);
        }
        match kind {
            AttrKind::TcpipKeepalive => Ok(Attribute::TcpipKeepalive(get_keepalive(&self.stream)?)),
            AttrKind::TcpipNodelay => Ok(Attribute::TcpipNodelay(
                self.stream.nodelay().map_err(|e| io_to_visa_err(&e))?,
            )),
            AttrKind::IoProt => Ok(Attribute::IoProt(self.io_prot)),
            _ => Err(Error::from(ErrorCode::NsupAttr)),
        }
    }

    fn set_attr(&mut self, attr: &Attribute) -> Result<()> {
        if self.io.set_attr(attr) {
            return Ok(());
        }
        match attr {
            Attribute::TcpipKeepalive(enable) => set_keepalive(&self.stream, *enable),
            Attribute::TcpipNodelay(enable) => set_nodelay(&self.stream, *enable),
            Attribute::IoProt(prot) => {
                self.io_prot = *prot;
                Ok(())
            }
            _ => Err(Error::from(ErrorCode::NsupAttr)),
        }
    }

    fn close(&mut self) -> Result<()> {
        let _ = self.stream.shutdown(Shutdown::Both);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VICP

// VICP header operation bits
const VICP_OP_DATA: u8 = 0x80;
const VICP_OP_REMOTE: u8 = 0x40;
const VICP_OP_CLEAR: u8 = 0x10;
const VICP_OP_SRQ: u8 = 0x08;
const VICP_OP_EOI: u8 = 0x01;
const VICP_VERSION: u8 = 0x01;
const VICP_HEADER_SIZE: usize = 8;

/// A LeCroy VICP session: TCP with an 8-byte operation/length header per
/// block. The framing carries an EOI bit, which maps onto the VISA END
/// indicator; everything else rides on the socket session patterns.
pub struct VicpSession {
    stream: TcpStream,
    io: IoSettings,
    pending: Vec<u8>,
    pending_eoi: bool,
    seq: u8,
}

impl VicpSession {
    pub fn open(host_spec: &str, port: Option<u16>, open_timeout: Duration) -> Result<Self> {
        let (host, spec_port) = split_host_port(host_spec);
        let port = port.or(spec_port).unwrap_or(VICP_PORT);
        let stream = connect_stream(host, port, open_timeout)?;
        Ok(Self {
            stream,
            io: IoSettings::default(),
            pending: Vec::new(),
            pending_eoi: false,
            seq: 0,
        })
    }

    fn next_seq(&mut self) -> u8 {
        self.seq = match self.seq {
            255 => 1,
            n => n + 1,
        };
        self.seq
    }

    fn send_block(&mut self, operation: u8, payload: &[u8]) -> Result<()> {
        let mut header = [0u8; VICP_HEADER_SIZE];
        header[0] = operation;
        header[1] = VICP_VERSION;
        header[2] = self.next_seq();
        header[4..8].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        self.stream
            .set_write_timeout(self.io.timeout)
            .map_err(|e| io_to_visa_err(&e))?;
        self.stream
            .write_all(&header)
            .and_then(|()| self.stream.write_all(payload))
            .map_err(|e| io_to_visa_err(&e))
    }

    /// Reads one framed block into the pending buffer. Service-request
    /// blocks are not data; they are logged and skipped.
    fn recv_block(&mut self, remaining: Option<Duration>) -> Result<()> {
        self.stream
            .set_read_timeout(remaining)
            .map_err(|e| io_to_visa_err(&e))?;
        loop {
            let mut header = [0u8; VICP_HEADER_SIZE];
            self.stream
                .read_exact(&mut header)
                .map_err(|e| io_to_visa_err(&e))?;
            let operation = header[0];
            let length = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
            let mut payload = vec![0u8; length];
            self.stream
                .read_exact(&mut payload)
                .map_err(|e| io_to_visa_err(&e))?;
            if operation & VICP_OP_SRQ != 0 {
                log::debug!("VICP service request block ({} bytes) skipped", length);
                continue;
            }
            self.pending.extend_from_slice(&payload);
            self.pending_eoi = operation & VICP_OP_EOI != 0;
            return Ok(());
        }
    }

    fn drain_pending(&mut self, upto: usize) -> Vec<u8> {
        let take = upto.min(self.pending.len());
        self.pending.drain(..take).collect()
    }
}

impl Session for VicpSession {
    fn read(&mut self, count: usize) -> Result<(Vec<u8>, CompletionCode)> {
        let deadline = self.io.timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(tc) = self.io.term_char() {
                if let Some(pos) = self.pending.iter().position(|&b| b == tc) {
                    return if pos + 1 > count {
                        Ok((self.drain_pending(count), CompletionCode::SuccessMaxCnt))
                    } else {
                        Ok((self.drain_pending(pos + 1), CompletionCode::SuccessTermChar))
                    };
                }
            }
            if self.pending.len() >= count {
                return Ok((self.drain_pending(count), CompletionCode::SuccessMaxCnt));
            }
            if self.pending_eoi {
                self.pending_eoi = false;
                if !self.io.suppress_end {
                    return Ok((self.drain_pending(count), CompletionCode::Success));
                }
            }

            let remaining = match deadline {
                None => None,
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(d) if !d.is_zero() => Some(d),
                    _ => return Err(Error::timeout_with(self.drain_pending(count))),
                },
            };
            match self.recv_block(remaining) {
                Ok(()) => {}
                Err(e) if e.code() == ErrorCode::Tmo => {
                    return Err(Error::timeout_with(self.drain_pending(count)));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let operation = if self.io.send_end {
            VICP_OP_DATA | VICP_OP_REMOTE | VICP_OP_EOI
        } else {
            VICP_OP_DATA | VICP_OP_REMOTE
        };
        self.send_block(operation, data)?;
        Ok(data.len())
    }

    fn clear(&mut self) -> Result<()> {
        self.pending.clear();
        self.pending_eoi = false;
        self.send_block(VICP_OP_CLEAR | VICP_OP_REMOTE, &[])
    }

    fn flush(&mut self, mode: FlushMode) -> Result<()> {
        if mode.intersects(
            FlushMode::READ_BUF
                | FlushMode::READ_BUF_DISCARD
                | FlushMode::IO_IN_BUF
                | FlushMode::IO_IN_BUF_DISCARD,
        ) {
            self.pending.clear();
            self.pending_eoi = false;
        }
        Ok(())
    }

    fn assert_trigger(&mut self, protocol: TriggerProtocol) -> Result<()> {
        if protocol != TriggerProtocol::Default {
            return Err(Error::from(ErrorCode::NsupOper));
        }
        self.write(b"*TRG\n").map(|_| ())
    }

    fn get_attr(&mut self, kind: AttrKind) -> Result<Attribute> {
        if let Some(attr) = self.io.get_attr(kind) {
            return Ok(attr);
        }
        match kind {
            AttrKind::TcpipKeepalive => Ok(Attribute::TcpipKeepalive(get_keepalive(&self.stream)?)),
            AttrKind::TcpipNodelay => Ok(Attribute::TcpipNodelay(
                self.stream.nodelay().map_err(|e| io_to_visa_err(&e))?,
            )),
            AttrKind::TcpipIsHislip => Ok(Attribute::TcpipIsHislip(false)),
            _ => Err(Error::from(ErrorCode::NsupAttr)),
        }
    }

    fn set_attr(&mut self, attr: &Attribute) -> Result<()> {
        if self.io.set_attr(attr) {
            return Ok(());
        }
        match attr {
            Attribute::TcpipKeepalive(enable) => set_keepalive(&self.stream, *enable),
            Attribute::TcpipNodelay(enable) => set_nodelay(&self.stream, *enable),
            _ => Err(Error::from(ErrorCode::NsupAttr)),
        }
    }

    fn close(&mut self) -> Result<()> {
        let _ = self.stream.shutdown(Shutdown::Both);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_split() {
        assert_eq!(split_host_port("10.0.0.5"), ("10.0.0.5", None));
        assert_eq!(split_host_port("10.0.0.5,618"), ("10.0.0.5", Some(618)));
        assert_eq!(split_host_port("hislip0,5025"), ("hislip0", Some(5025)));
    }

    #[test]
    fn vicp_sequence_skips_zero() {
        // construct without a socket just to exercise the counter
        let mut seq = 254u8;
        let mut next = || {
            seq = match seq {
                255 => 1,
                n => n + 1,
            };
            seq
        };
        assert_eq!(next(), 255);
        assert_eq!(next(), 1);
    }
}
