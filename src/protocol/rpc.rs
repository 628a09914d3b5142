//! Minimal ONC/RPC (Sun RPC version 2, RFC 1057) client over TCP and UDP.
//!
//! Implements exactly what the VXI-11 engine and discovery need: record
//! marking, strict transaction-id matching with stale-reply discard, the
//! portmapper `GETPORT` procedure and its UDP-broadcast variant.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use bytes::BytesMut;

use super::xdr::{Packer, UnpackError, Unpacker};

/// Version of the protocol
pub const RPC_VERSION: u32 = 2;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;

const REPLY_ACCEPTED: u32 = 0;
const REPLY_DENIED: u32 = 1;

const ACCEPT_SUCCESS: u32 = 0;
const ACCEPT_PROG_UNAVAIL: u32 = 1;
const ACCEPT_PROG_MISMATCH: u32 = 2;
const ACCEPT_PROC_UNAVAIL: u32 = 3;
const ACCEPT_GARBAGE_ARGS: u32 = 4;

const REJECT_RPC_MISMATCH: u32 = 0;
const REJECT_AUTH_ERROR: u32 = 1;

const AUTH_NULL: u32 = 0;

const LAST_FRAGMENT: u32 = 0x8000_0000;

// Port mapper interface: program number, version, port and GETPORT procedure.
pub const PMAP_PROG: u32 = 100_000;
pub const PMAP_VERS: u32 = 2;
pub const PMAP_PORT: u16 = 111;
pub const PMAP_PROC_GETPORT: u32 = 3;

/// Transport protocol selector in a portmapper mapping.
pub const IPPROTO_TCP: u32 = 6;
pub const IPPROTO_UDP: u32 = 17;

/// Errors from the RPC layer, each surfaced distinctly so the session layer
/// can translate them to the proper VISA status.
#[derive(Debug)]
pub enum RpcError {
    /// No reply before the I/O deadline.
    Timeout,
    /// The TCP connection died underneath the client.
    ConnLost,
    /// The portmapper answered with port 0: program not registered.
    NotRegistered,
    /// Server rejected the call: RPC version mismatch.
    RpcMismatch,
    /// Server rejected the call: authentication error.
    AuthError,
    ProgUnavail,
    ProgMismatch,
    ProcUnavail,
    GarbageArgs,
    /// Reply did not decode as an RPC reply.
    BadRecord,
    Io(io::Error),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout => write!(f, "RPC reply timed out"),
            RpcError::ConnLost => write!(f, "RPC connection lost"),
            RpcError::NotRegistered => write!(f, "program not registered with portmapper"),
            RpcError::RpcMismatch => write!(f, "call denied: RPC version mismatch"),
            RpcError::AuthError => write!(f, "call denied: authentication error"),
            RpcError::ProgUnavail => write!(f, "call failed: program unavailable"),
            RpcError::ProgMismatch => write!(f, "call failed: program version mismatch"),
            RpcError::ProcUnavail => write!(f, "call failed: procedure unavailable"),
            RpcError::GarbageArgs => write!(f, "call failed: garbage arguments"),
            RpcError::BadRecord => write!(f, "malformed RPC record"),
            RpcError::Io(e) => write!(f, "RPC I/O error: {}", e),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => RpcError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => RpcError::ConnLost,
            _ => RpcError::Io(e),
        }
    }
}

impl From<UnpackError> for RpcError {
    fn from(_: UnpackError) -> Self {
        RpcError::BadRecord
    }
}

fn pack_call_header(p: &mut Packer, xid: u32, prog: u32, vers: u32, proc: u32) {
    p.pack_u32(xid);
    p.pack_u32(MSG_CALL);
    p.pack_u32(RPC_VERSION);
    p.pack_u32(prog);
    p.pack_u32(vers);
    p.pack_u32(proc);
    // null credentials and verifier
    p.pack_u32(AUTH_NULL);
    p.pack_opaque(b"");
    p.pack_u32(AUTH_NULL);
    p.pack_opaque(b"");
}

/// Parses a reply header, returning the xid and the offset of the
/// procedure-specific result within `record`.
fn unpack_reply_header(record: &[u8]) -> Result<(u32, usize), RpcError> {
    let mut u = Unpacker::new(record);
    let xid = u.unpack_u32()?;
    if u.unpack_u32()? != MSG_REPLY {
        return Err(RpcError::BadRecord);
    }
    match u.unpack_u32()? {
        REPLY_ACCEPTED => {}
        REPLY_DENIED => {
            return Err(match u.unpack_u32()? {
                REJECT_RPC_MISMATCH => RpcError::RpcMismatch,
                REJECT_AUTH_ERROR => RpcError::AuthError,
                _ => RpcError::BadRecord,
            });
        }
        _ => return Err(RpcError::BadRecord),
    }
    // verifier
    u.unpack_u32()?;
    u.unpack_opaque()?;
    match u.unpack_u32()? {
        ACCEPT_SUCCESS => {}
        ACCEPT_PROG_UNAVAIL => return Err(RpcError::ProgUnavail),
        ACCEPT_PROG_MISMATCH => return Err(RpcError::ProgMismatch),
        ACCEPT_PROC_UNAVAIL => return Err(RpcError::ProcUnavail),
        ACCEPT_GARBAGE_ARGS => return Err(RpcError::GarbageArgs),
        _ => return Err(RpcError::BadRecord),
    }
    Ok((xid, record.len() - u.remaining()))
}

/// Writes one record-marked RPC message.
fn send_record(stream: &mut TcpStream, record: &[u8]) -> Result<(), RpcError> {
    let header = (record.len() as u32 | LAST_FRAGMENT).to_be_bytes();
    stream.write_all(&header)?;
    stream.write_all(record)?;
    Ok(())
}

/// Reads one record, concatenating fragments until the last-fragment bit.
///
/// With `min_fragments > 0`, a timeout after that many complete fragments
/// returns the partial record instead of failing; some instruments never set
/// the last-fragment bit on portmapper replies.
fn recv_record(stream: &mut TcpStream, min_fragments: usize) -> Result<Vec<u8>, RpcError> {
    let mut record = BytesMut::new();
    let mut fragments = 0usize;
    loop {
        let mut header = [0u8; 4];
        match stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
                    && min_fragments > 0
                    && fragments >= min_fragments =>
            {
                log::debug!(
                    "record unterminated after {} fragment(s), accepting {} bytes",
                    fragments,
                    record.len()
                );
                return Ok(record.to_vec());
            }
            Err(e) => return Err(e.into()),
        }
        let word = u32::from_be_bytes(header);
        let last = word & LAST_FRAGMENT != 0;
        let len = (word & !LAST_FRAGMENT) as usize;
        let start = record.len();
        record.resize(start + len, 0);
        stream.read_exact(&mut record[start..])?;
        fragments += 1;
        if last {
            return Ok(record.to_vec());
        }
    }
}

fn connect_stream(host: &str, port: u16, open_timeout: Duration) -> Result<TcpStream, RpcError> {
    let mut last_err: Option<io::Error> = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, open_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .map(RpcError::from)
        .unwrap_or(RpcError::ConnLost))
}

/// An RPC client speaking record-marked calls over one TCP connection.
pub struct TcpRpcClient {
    stream: TcpStream,
    prog: u32,
    vers: u32,
    last_xid: u32,
    packer: Packer,
}

impl std::fmt::Debug for TcpRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpRpcClient")
            .field("prog", &self.prog)
            .field("vers", &self.vers)
            .field("last_xid", &self.last_xid)
            .finish()
    }
}

impl TcpRpcClient {
    /// Connects to an explicit `host:port`.
    pub fn connect(
        host: &str,
        port: u16,
        prog: u32,
        vers: u32,
        open_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let stream = connect_stream(host, port, open_timeout)?;
        Ok(Self {
            stream,
            prog,
            vers,
            last_xid: 0,
            packer: Packer::new(),
        })
    }

    /// Asks the portmapper on `host` where `prog` lives, then connects there.
    pub fn connect_via_portmap(
        host: &str,
        prog: u32,
        vers: u32,
        open_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let port = portmap_getport(host, prog, vers, IPPROTO_TCP, open_timeout)?;
        Self::connect(host, port, prog, vers, open_timeout)
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Socket-level read deadline for subsequent calls. `None` blocks forever.
    pub fn set_io_timeout(&mut self, timeout: Option<Duration>) -> Result<(), RpcError> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// One RPC call: packs the header and `args`, sends the record, then
    /// receives records until the reply with the current xid arrives.
    ///
    /// Replies with an older xid are stale data left on the socket by a
    /// previous timeout; they are discarded. A reply from the future is a
    /// protocol violation.
    pub fn call(
        &mut self,
        proc: u32,
        args: impl FnOnce(&mut Packer),
    ) -> Result<Vec<u8>, RpcError> {
        self.call_with(proc, args, 0)
    }

    fn call_with(
        &mut self,
        proc: u32,
        args: impl FnOnce(&mut Packer),
        min_fragments: usize,
    ) -> Result<Vec<u8>, RpcError> {
        self.last_xid = self.last_xid.wrapping_add(1);
        self.packer.reset();
        pack_call_header(&mut self.packer, self.last_xid, self.prog, self.vers, proc);
        args(&mut self.packer);
        let call = self.packer.take();
        send_record(&mut self.stream, &call)?;

        loop {
            let reply = recv_record(&mut self.stream, min_fragments)?;
            let (xid, body) = unpack_reply_header(&reply)?;
            if xid == self.last_xid {
                return Ok(reply[body..].to_vec());
            } else if xid < self.last_xid {
                log::debug!("discarding stale RPC reply with xid {}", xid);
                continue;
            } else {
                return Err(RpcError::BadRecord);
            }
        }
    }
}

/// `portmap_getport(program, version, protocol)` against the portmapper on
/// `host`. Returns the registered port.
pub fn portmap_getport(
    host: &str,
    prog: u32,
    vers: u32,
    protocol: u32,
    open_timeout: Duration,
) -> Result<u16, RpcError> {
    let mut pmap = TcpRpcClient::connect(host, PMAP_PORT, PMAP_PROG, PMAP_VERS, open_timeout)?;
    pmap.set_io_timeout(Some(open_timeout.max(Duration::from_millis(1))))?;
    let reply = pmap.call_with(
        PMAP_PROC_GETPORT,
        |p| {
            p.pack_u32(prog);
            p.pack_u32(vers);
            p.pack_u32(protocol);
            p.pack_u32(0);
        },
        1,
    )?;
    let port = Unpacker::new(&reply).unpack_u32()?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(RpcError::NotRegistered);
    }
    Ok(port as u16)
}

/// Portmapper `GETPORT` broadcast over UDP, used by discovery to enumerate
/// every responder on a subnet.
pub struct BroadcastPortmap {
    socket: UdpSocket,
    last_xid: u32,
}

impl BroadcastPortmap {
    pub fn new() -> Result<Self, RpcError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            last_xid: 0x4000,
        })
    }

    /// Broadcasts a `GETPORT` request for `(prog, vers, protocol)` to
    /// `broadcast_addr` and collects `(port, responder)` pairs until
    /// `wait` elapses.
    pub fn getport(
        &mut self,
        broadcast_addr: &str,
        prog: u32,
        vers: u32,
        protocol: u32,
        wait: Duration,
    ) -> Result<Vec<(u16, SocketAddr)>, RpcError> {
        self.last_xid = self.last_xid.wrapping_add(1);
        let mut packer = Packer::new();
        pack_call_header(&mut packer, self.last_xid, PMAP_PROG, PMAP_VERS, PMAP_PROC_GETPORT);
        packer.pack_u32(prog);
        packer.pack_u32(vers);
        packer.pack_u32(protocol);
        packer.pack_u32(0);
        let call = packer.take();
        self.socket.send_to(&call, (broadcast_addr, PMAP_PORT))?;

        let mut replies = Vec::new();
        let deadline = Instant::now() + wait;
        let mut buf = [0u8; 8192];
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => break,
            };
            self.socket.set_read_timeout(Some(remaining))?;
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            let reply = &buf[..n];
            let parsed = match unpack_reply_header(reply) {
                Ok((xid, body)) if xid == self.last_xid => {
                    Unpacker::new(&reply[body..]).unpack_u32().ok()
                }
                _ => None,
            };
            if let Some(port) = parsed {
                if port != 0 && port <= u16::MAX as u32 {
                    replies.push((port as u16, from));
                }
            }
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn reply_record(xid: u32, result: &[u8]) -> Vec<u8> {
        let mut p = Packer::new();
        p.pack_u32(xid);
        p.pack_u32(MSG_REPLY);
        p.pack_u32(REPLY_ACCEPTED);
        p.pack_u32(AUTH_NULL);
        p.pack_opaque(b"");
        p.pack_u32(ACCEPT_SUCCESS);
        let mut body = p.take();
        body.extend_from_slice(result);
        let mut framed = (body.len() as u32 | LAST_FRAGMENT).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        framed
    }

    #[test]
    fn reply_header_reports_denials() {
        let mut p = Packer::new();
        p.pack_u32(9);
        p.pack_u32(MSG_REPLY);
        p.pack_u32(REPLY_DENIED);
        p.pack_u32(REJECT_AUTH_ERROR);
        let reply = p.take();
        assert!(matches!(
            unpack_reply_header(&reply),
            Err(RpcError::AuthError)
        ));
    }

    #[test]
    fn fragmented_reply_is_reassembled() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            // consume the call record
            let mut header = [0u8; 4];
            sock.read_exact(&mut header).unwrap();
            let len = (u32::from_be_bytes(header) & !LAST_FRAGMENT) as usize;
            let mut call = vec![0u8; len];
            sock.read_exact(&mut call).unwrap();
            let xid = u32::from_be_bytes([call[0], call[1], call[2], call[3]]);

            let record = reply_record(xid, b"\x00\x00\x00\x2A");
            let body = &record[4..];
            // split the reply in two fragments
            let (a, b) = body.split_at(8);
            sock.write_all(&(a.len() as u32).to_be_bytes()).unwrap();
            sock.write_all(a).unwrap();
            sock.write_all(&(b.len() as u32 | LAST_FRAGMENT).to_be_bytes())
                .unwrap();
            sock.write_all(b).unwrap();
        });

        let mut client =
            TcpRpcClient::connect(&addr.ip().to_string(), addr.port(), 5, 1, Duration::from_secs(2))
                .unwrap();
        client.set_io_timeout(Some(Duration::from_secs(2))).unwrap();
        let result = client.call(7, |_| {}).unwrap();
        assert_eq!(result, b"\x00\x00\x00\x2A");
        server.join().unwrap();
    }
}
