//! HiSLIP client (IVI-6.1, revision 1.1).
//!
//! A HiSLIP link is a pair of TCP connections to the same port: the
//! synchronous channel carries instrument data, the asynchronous channel
//! carries control transactions and server-initiated service requests.
//! Every message starts with a fixed 16-byte header: the prologue `HS`,
//! a message type byte, a control code byte, a 4-byte message parameter and
//! an 8-byte big-endian payload length.
//!
//! The async channel is drained by a background reader thread. Control
//! replies are forwarded into a bounded response queue the calling thread
//! waits on; `AsyncServiceRequest` status bytes land in their own bounded
//! queue consumed by [`Client::take_srq`]. The message-id counters live with
//! the sync channel and are only touched by the owning session, so caller
//! serialization (`&mut self`) is the lock.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default HiSLIP port.
pub const PORT: u16 = 4880;

pub const HEADER_SIZE: usize = 16;
const PROLOGUE: [u8; 2] = *b"HS";

/// Default maximum message size before negotiation, per the VISA spec.
pub const DEFAULT_MAX_MSG_SIZE: u64 = 1 << 20;

/// Both ends start their message-id counters here and advance by 2.
pub const INITIAL_MESSAGE_ID: u32 = 0xFFFF_FF00;

/// Wildcard message id a server may echo on unsolicited data.
pub const MESSAGE_ID_ANY: u32 = 0xFFFF_FFFF;

consts_to_enum! {
    pub enum MessageType: u8 {
        Initialize 0
        InitializeResponse 1
        FatalError 2
        Error 3
        AsyncLock 4
        AsyncLockResponse 5
        Data 6
        DataEnd 7
        DeviceClearComplete 8
        DeviceClearAcknowledge 9
        AsyncRemoteLocalControl 10
        AsyncRemoteLocalResponse 11
        Trigger 12
        Interrupted 13
        AsyncInterrupted 14
        AsyncMaxMsgSize 15
        AsyncMaxMsgSizeResponse 16
        AsyncInitialize 17
        AsyncInitializeResponse 18
        AsyncDeviceClear 19
        AsyncServiceRequest 20
        AsyncStatusQuery 21
        AsyncStatusResponse 22
        AsyncDeviceClearAcknowledge 23
        AsyncLockInfo 24
        AsyncLockInfoResponse 25
        GetDescriptors 26
        GetDescriptorsResponse 27
        StartTLS 28
        AsyncStartTLS 29
        AsyncStartTLSResponse 30
        EndTLS 31
        AsyncEndTLS 32
        AsyncEndTLSResponse 33
        GetSaslMechanismList 34
        GetSaslMechanismListResponse 35
        AuthenticationStart 36
        AuthenticationExchange 37
        AuthenticationResult 38
    }
}

consts_to_enum! {
    /// Control codes of an `AsyncLockResponse`.
    pub enum LockResponse: u8 {
        Failure 0
        Success 1
        SuccessShared 2
        Error 3
    }
}

consts_to_enum! {
    /// Control codes of an `AsyncRemoteLocalControl` request.
    pub enum RemoteLocalControl: u8 {
        DisableRemote 0
        EnableRemote 1
        DisableAndGotoLocal 2
        EnableAndGotoRemote 3
        EnableAndLockoutLocal 4
        EnableAndGotoRemoteLockout 5
        JustGotoLocal 6
    }
}

fn fatal_error_message(code: u8) -> &'static str {
    match code {
        0 => "unidentified error",
        1 => "poorly formed message header",
        2 => "attempt to use connection without both channels established",
        3 => "invalid initialization sequence",
        4 => "server refused connection due to maximum number of clients exceeded",
        5 => "secure connection failed",
        _ => "device defined fatal error",
    }
}

fn error_message(code: u8) -> &'static str {
    match code {
        0 => "unidentified error",
        1 => "unrecognized message type",
        2 => "unrecognized control code",
        3 => "unrecognized vendor defined message",
        4 => "message too large",
        5 => "authentication failed",
        _ => "device defined error",
    }
}

/// Errors from the HiSLIP layer.
#[derive(Debug)]
pub enum HislipError {
    /// No data before the configured deadline; the link stays usable.
    Timeout,
    ConnLost,
    /// Server sent `FatalError`; the link must be torn down.
    Fatal(u8, String),
    /// Decoding failure or initialization-sequence violation.
    Protocol(String),
    Io(io::Error),
}

impl std::fmt::Display for HislipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HislipError::Timeout => write!(f, "HiSLIP operation timed out"),
            HislipError::ConnLost => write!(f, "HiSLIP connection lost"),
            HislipError::Fatal(code, msg) => {
                write!(f, "HiSLIP fatal error {} ({}): {}", code, fatal_error_message(*code), msg)
            }
            HislipError::Protocol(msg) => write!(f, "HiSLIP protocol error: {}", msg),
            HislipError::Io(e) => write!(f, "HiSLIP I/O error: {}", e),
        }
    }
}

impl std::error::Error for HislipError {}

impl From<io::Error> for HislipError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => HislipError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => HislipError::ConnLost,
            _ => HislipError::Io(e),
        }
    }
}

type Result<T> = std::result::Result<T, HislipError>;

/// Decoded 16-byte message header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub msg_type: MessageType,
    pub control_code: u8,
    pub message_parameter: u32,
    pub payload_length: u64,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..2].copy_from_slice(&PROLOGUE);
        buf[2] = self.msg_type.into();
        buf[3] = self.control_code;
        buf[4..8].copy_from_slice(&self.message_parameter.to_be_bytes());
        buf[8..16].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[..2] != PROLOGUE {
            return Err(HislipError::Protocol("bad prologue".into()));
        }
        let msg_type = MessageType::try_from(buf[2])
            .map_err(|_| HislipError::Protocol(format!("unrecognized message type {}", buf[2])))?;
        Ok(Header {
            msg_type,
            control_code: buf[3],
            message_parameter: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            payload_length: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

fn send_msg(
    stream: &mut TcpStream,
    msg_type: MessageType,
    control_code: u8,
    message_parameter: u32,
    payload: &[u8],
) -> Result<()> {
    let header = Header {
        msg_type,
        control_code,
        message_parameter,
        payload_length: payload.len() as u64,
    };
    stream.write_all(&header.encode())?;
    stream.write_all(payload)?;
    Ok(())
}

fn read_header(stream: &mut TcpStream) -> Result<Header> {
    let mut buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut buf)?;
    Header::decode(&buf)
}

fn read_payload(stream: &mut TcpStream, len: u64) -> Result<Vec<u8>> {
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Drains and discards `len` payload bytes after an out-of-sync header.
fn flush_payload(stream: &mut TcpStream, mut len: u64) -> Result<()> {
    let mut sink = [0u8; 4096];
    while len > 0 {
        let chunk = sink.len().min(len as usize);
        stream.read_exact(&mut sink[..chunk])?;
        len -= chunk as u64;
    }
    Ok(())
}

/// Control replies forwarded from the async-channel reader thread.
#[derive(Debug, Clone, Copy)]
enum AsyncReply {
    MaxMsgSize(u64),
    DeviceClearAck(u8),
    Status(u8),
    Lock(u8),
    LockInfo { exclusive: u8, holders: u32 },
    RemoteLocal,
}

fn async_reader(mut sock: TcpStream, replies: SyncSender<AsyncReply>, srq: SyncSender<u8>) {
    loop {
        let header = match read_header(&mut sock) {
            Ok(h) => h,
            Err(HislipError::Timeout) => continue,
            Err(e) => {
                log::debug!("async channel reader exiting: {}", e);
                return;
            }
        };
        let payload = match read_payload(&mut sock, header.payload_length) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("async channel reader exiting: {}", e);
                return;
            }
        };
        let reply = match header.msg_type {
            MessageType::AsyncServiceRequest => {
                if let Err(TrySendError::Full(_)) = srq.try_send(header.control_code) {
                    log::warn!("service request queue full, dropping status byte");
                }
                continue;
            }
            MessageType::AsyncMaxMsgSizeResponse => {
                if payload.len() < 8 {
                    log::warn!("short AsyncMaxMsgSizeResponse payload");
                    continue;
                }
                AsyncReply::MaxMsgSize(u64::from_be_bytes(payload[..8].try_into().unwrap()))
            }
            MessageType::AsyncDeviceClearAcknowledge => {
                AsyncReply::DeviceClearAck(header.control_code)
            }
            MessageType::AsyncStatusResponse => AsyncReply::Status(header.control_code),
            MessageType::AsyncLockResponse => AsyncReply::Lock(header.control_code),
            MessageType::AsyncLockInfoResponse => AsyncReply::LockInfo {
                exclusive: header.control_code,
                holders: header.message_parameter,
            },
            MessageType::AsyncRemoteLocalResponse => AsyncReply::RemoteLocal,
            MessageType::FatalError => {
                log::error!(
                    "HiSLIP fatal error on async channel: {} ({})",
                    fatal_error_message(header.control_code),
                    String::from_utf8_lossy(&payload)
                );
                return;
            }
            MessageType::Error => {
                log::warn!(
                    "HiSLIP non-fatal error on async channel: {} ({})",
                    error_message(header.control_code),
                    String::from_utf8_lossy(&payload)
                );
                continue;
            }
            MessageType::AsyncInterrupted => {
                log::debug!("async channel: interrupted, message id {}", header.message_parameter);
                continue;
            }
            other => {
                log::debug!("ignoring async channel message {:?}", other);
                continue;
            }
        };
        if replies.send(reply).is_err() {
            return;
        }
    }
}

fn connect_stream(host: &str, port: u16, open_timeout: Duration) -> Result<TcpStream> {
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
    Err(last_err.map(HislipError::from).unwrap_or(HislipError::ConnLost))
}

/// A connected HiSLIP instrument link.
pub struct Client {
    sync: TcpStream,
    async_sock: TcpStream,
    reader: Option<JoinHandle<()>>,
    replies: Receiver<AsyncReply>,
    srq: Receiver<u8>,
    session_id: u16,
    protocol_version: u16,
    overlap: bool,
    max_msg_size: u64,
    timeout: Option<Duration>,
    // sync-channel message-id tracking
    message_id: u32,
    last_message_id: Option<u32>,
    rmt: u8,
    expected_message_id: Option<u32>,
    pending_type: Option<MessageType>,
    payload_remaining: u64,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("hislip::Client")
            .field("session_id", &self.session_id)
            .field("message_id", &self.message_id)
            .field("max_msg_size", &self.max_msg_size)
            .finish()
    }
}

impl Client {
    /// Performs the full connection sequence: sync-channel `Initialize`,
    /// async-channel `AsyncInitialize`, then starts the async reader thread.
    /// `open_timeout` bounds the whole sequence.
    pub fn connect(
        host: &str,
        port: u16,
        sub_address: &str,
        vendor_id: [u8; 2],
        open_timeout: Duration,
    ) -> Result<Self> {
        let mut sync = connect_stream(host, port, open_timeout)?;
        sync.set_read_timeout(Some(open_timeout))?;

        let parameter = u32::from_be_bytes([1, 0, vendor_id[0], vendor_id[1]]);
        send_msg(
            &mut sync,
            MessageType::Initialize,
            0,
            parameter,
            sub_address.as_bytes(),
        )?;
        let init = Self::expect(&mut sync, MessageType::InitializeResponse)?;
        let protocol_version = (init.message_parameter >> 16) as u16;
        let session_id = init.message_parameter as u16;
        let overlap = init.control_code & 1 != 0;

        let mut async_sock = connect_stream(host, port, open_timeout)?;
        async_sock.set_read_timeout(Some(open_timeout))?;
        send_msg(
            &mut async_sock,
            MessageType::AsyncInitialize,
            0,
            session_id as u32,
            &[],
        )?;
        let async_init = Self::expect(&mut async_sock, MessageType::AsyncInitializeResponse)?;
        log::debug!(
            "HiSLIP session {} established, server vendor {:08X}, protocol {}.{}",
            session_id,
            async_init.message_parameter,
            protocol_version >> 8,
            protocol_version & 0xFF
        );

        async_sock.set_read_timeout(None)?;
        let reader_sock = async_sock.try_clone().map_err(HislipError::Io)?;
        let (reply_tx, reply_rx) = sync_channel(16);
        let (srq_tx, srq_rx) = sync_channel(32);
        let reader = std::thread::Builder::new()
            .name("hislip-async".into())
            .spawn(move || async_reader(reader_sock, reply_tx, srq_tx))
            .map_err(HislipError::Io)?;

        Ok(Self {
            sync,
            async_sock,
            reader: Some(reader),
            replies: reply_rx,
            srq: srq_rx,
            session_id,
            protocol_version,
            overlap,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            timeout: None,
            message_id: INITIAL_MESSAGE_ID,
            last_message_id: None,
            rmt: 0,
            expected_message_id: None,
            pending_type: None,
            payload_remaining: 0,
        })
    }

    /// Reads one message on `stream`, requiring the given type. Payload is
    /// consumed and returned headers only carry the fixed fields.
    fn expect(stream: &mut TcpStream, expected: MessageType) -> Result<Header> {
        let header = read_header(stream)?;
        let payload = read_payload(stream, header.payload_length)?;
        match header.msg_type {
            t if t == expected => Ok(header),
            MessageType::FatalError => Err(HislipError::Fatal(
                header.control_code,
                String::from_utf8_lossy(&payload).into_owned(),
            )),
            other => Err(HislipError::Protocol(format!(
                "expected {:?}, received {:?}",
                expected, other
            ))),
        }
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub fn overlap_mode(&self) -> bool {
        self.overlap
    }

    pub fn max_msg_size(&self) -> u64 {
        self.max_msg_size
    }

    pub fn sync_stream(&self) -> &TcpStream {
        &self.sync
    }

    pub fn async_stream(&self) -> &TcpStream {
        &self.async_sock
    }

    /// I/O deadline for sync-channel operations and async-channel waits.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.timeout = timeout;
        self.sync.set_read_timeout(timeout)?;
        self.sync.set_write_timeout(timeout)?;
        Ok(())
    }

    fn next_message_id(&mut self) -> u32 {
        let id = self.message_id;
        self.last_message_id = Some(id);
        self.message_id = self.message_id.wrapping_add(2);
        id
    }

    fn wait_reply(&self) -> Result<AsyncReply> {
        // bound async-channel waits even with an infinite session timeout so
        // a dead reader thread cannot hang the caller
        let deadline = self.timeout.unwrap_or(Duration::from_secs(30));
        match self.replies.recv_timeout(deadline) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(HislipError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(HislipError::ConnLost),
        }
    }

    /// Sends the payload on the sync channel, fragmented to the negotiated
    /// maximum. The final fragment is `DataEnd` when `end` is set.
    ///
    /// Writing while a previous read was cut short realigns reception: the
    /// response a stale id would identify is dead, so the fragment state is
    /// dropped and the next read expects this exchange's id. If the cut
    /// happened inside a fragment's payload the byte stream itself is
    /// ambiguous, and only a device clear restores a known state.
    pub fn send(&mut self, data: &[u8], end: bool) -> Result<usize> {
        if self.expected_message_id.is_some() {
            if self.payload_remaining > 0 {
                self.device_clear()?;
            } else {
                self.expected_message_id = None;
                self.pending_type = None;
            }
        }
        let max_payload = (self.max_msg_size as usize).saturating_sub(HEADER_SIZE).max(1);
        if data.is_empty() {
            let rmt = std::mem::take(&mut self.rmt);
            let id = self.next_message_id();
            let msg_type = if end { MessageType::DataEnd } else { MessageType::Data };
            send_msg(&mut self.sync, msg_type, rmt, id, &[])?;
            return Ok(0);
        }
        let mut chunks = data.chunks(max_payload).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let msg_type = if last && end { MessageType::DataEnd } else { MessageType::Data };
            let rmt = std::mem::take(&mut self.rmt);
            let id = self.next_message_id();
            send_msg(&mut self.sync, msg_type, rmt, id, chunk)?;
        }
        Ok(data.len())
    }

    /// Receives sync-channel data until `max_len` bytes have accumulated or a
    /// `DataEnd` message completes. Returns the data and whether the message
    /// is complete (END indicator).
    ///
    /// A timeout mid-message leaves the fragment state in place; the next
    /// call resynchronizes by discarding server messages whose id does not
    /// match the one expected, so the link recovers instead of desyncing
    /// permanently.
    pub fn receive(&mut self, max_len: usize) -> Result<(Vec<u8>, bool)> {
        if self.expected_message_id.is_none() {
            self.expected_message_id = self.last_message_id;
            self.pending_type = None;
            self.payload_remaining = 0;
        }

        let mut out = Vec::with_capacity(max_len.min(1 << 16));
        let mut end = false;
        while out.len() < max_len {
            if self.payload_remaining == 0 {
                if self.pending_type == Some(MessageType::DataEnd) {
                    end = true;
                    break;
                }
                let (msg_type, payload_length) = self.next_data_header()?;
                self.pending_type = Some(msg_type);
                self.payload_remaining = payload_length;
                continue;
            }
            let want = (max_len - out.len()).min(self.payload_remaining as usize);
            let start = out.len();
            out.resize(start + want, 0);
            self.sync.read_exact(&mut out[start..])?;
            self.payload_remaining -= want as u64;
        }

        if self.payload_remaining == 0 && self.pending_type == Some(MessageType::DataEnd) {
            // Response Message Terminator: the DataEnd message implies the
            // 488.2 END indicator.
            end = true;
            self.rmt = 1;
            self.expected_message_id = None;
            self.pending_type = None;
        }
        Ok((out, end))
    }

    /// Receives headers until the next in-sequence `Data`/`DataEnd` header.
    fn next_data_header(&mut self) -> Result<(MessageType, u64)> {
        loop {
            let header = read_header(&mut self.sync)?;
            match header.msg_type {
                MessageType::Data | MessageType::DataEnd => {
                    if header.message_parameter == MESSAGE_ID_ANY
                        || Some(header.message_parameter) == self.expected_message_id
                    {
                        return Ok((header.msg_type, header.payload_length));
                    }
                    log::debug!(
                        "discarding {:?} with stale message id {:#x}",
                        header.msg_type,
                        header.message_parameter
                    );
                    flush_payload(&mut self.sync, header.payload_length)?;
                }
                MessageType::FatalError => {
                    let payload = read_payload(&mut self.sync, header.payload_length)?;
                    return Err(HislipError::Fatal(
                        header.control_code,
                        String::from_utf8_lossy(&payload).into_owned(),
                    ));
                }
                MessageType::Error => {
                    let payload = read_payload(&mut self.sync, header.payload_length)?;
                    log::warn!(
                        "HiSLIP non-fatal error: {} ({})",
                        error_message(header.control_code),
                        String::from_utf8_lossy(&payload)
                    );
                }
                MessageType::Interrupted => {
                    log::debug!("sync channel: interrupted, message id {}", header.message_parameter);
                    flush_payload(&mut self.sync, header.payload_length)?;
                }
                other => {
                    log::debug!("ignoring sync channel message {:?}", other);
                    flush_payload(&mut self.sync, header.payload_length)?;
                }
            }
        }
    }

    /// Sends a `Trigger` message; consumes a message id like a data message.
    pub fn trigger(&mut self) -> Result<()> {
        let rmt = std::mem::take(&mut self.rmt);
        let id = self.next_message_id();
        send_msg(&mut self.sync, MessageType::Trigger, rmt, id, &[])
    }

    /// `AsyncMaxMsgSize` negotiation. Returns the server's accepted size and
    /// records it for subsequent sends.
    pub fn negotiate_max_msg_size(&mut self, size: u64) -> Result<u64> {
        send_msg(
            &mut self.async_sock,
            MessageType::AsyncMaxMsgSize,
            0,
            0,
            &size.to_be_bytes(),
        )?;
        loop {
            if let AsyncReply::MaxMsgSize(server) = self.wait_reply()? {
                self.max_msg_size = server;
                return Ok(server);
            }
        }
    }

    /// `AsyncStatusQuery` transaction on the async channel.
    pub fn status_query(&mut self) -> Result<u8> {
        let rmt = std::mem::take(&mut self.rmt);
        send_msg(
            &mut self.async_sock,
            MessageType::AsyncStatusQuery,
            rmt,
            self.message_id,
            &[],
        )?;
        loop {
            if let AsyncReply::Status(stb) = self.wait_reply()? {
                return Ok(stb);
            }
        }
    }

    /// Full device-clear transaction: `AsyncDeviceClear` on the async
    /// channel, `DeviceClearComplete` on the sync channel, then the
    /// message-id counter restarts and any buffered fragment state is gone.
    pub fn device_clear(&mut self) -> Result<()> {
        send_msg(&mut self.async_sock, MessageType::AsyncDeviceClear, 0, 0, &[])?;
        let feature = loop {
            if let AsyncReply::DeviceClearAck(feature) = self.wait_reply()? {
                break feature;
            }
        };
        // let in-flight sync messages settle before declaring the channel clean
        std::thread::sleep(Duration::from_millis(100));
        send_msg(
            &mut self.sync,
            MessageType::DeviceClearComplete,
            feature,
            0,
            &[],
        )?;
        loop {
            let header = read_header(&mut self.sync)?;
            flush_payload(&mut self.sync, header.payload_length)?;
            if header.msg_type == MessageType::DeviceClearAcknowledge {
                break;
            }
            log::debug!("discarding {:?} while clearing", header.msg_type);
        }
        self.message_id = INITIAL_MESSAGE_ID;
        self.last_message_id = None;
        self.expected_message_id = None;
        self.pending_type = None;
        self.payload_remaining = 0;
        self.rmt = 0;
        Ok(())
    }

    /// `AsyncLock` request transaction.
    pub fn lock_request(&mut self, timeout: Duration, lock_string: &str) -> Result<LockResponse> {
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        send_msg(
            &mut self.async_sock,
            MessageType::AsyncLock,
            1,
            timeout_ms,
            lock_string.as_bytes(),
        )?;
        loop {
            if let AsyncReply::Lock(code) = self.wait_reply()? {
                return Ok(LockResponse::try_from(code).unwrap_or(LockResponse::Error));
            }
        }
    }

    /// `AsyncLock` release transaction.
    pub fn lock_release(&mut self) -> Result<LockResponse> {
        send_msg(
            &mut self.async_sock,
            MessageType::AsyncLock,
            0,
            self.last_message_id.unwrap_or(0),
            &[],
        )?;
        loop {
            if let AsyncReply::Lock(code) = self.wait_reply()? {
                return Ok(LockResponse::try_from(code).unwrap_or(LockResponse::Error));
            }
        }
    }

    /// `AsyncRemoteLocalControl` transaction.
    pub fn remote_local(&mut self, control: RemoteLocalControl) -> Result<()> {
        send_msg(
            &mut self.async_sock,
            MessageType::AsyncRemoteLocalControl,
            control.into(),
            self.last_message_id.unwrap_or(0),
            &[],
        )?;
        loop {
            if let AsyncReply::RemoteLocal = self.wait_reply()? {
                return Ok(());
            }
        }
    }

    /// Pops one queued service-request status byte, if any arrived.
    pub fn take_srq(&self) -> Option<u8> {
        self.srq.try_recv().ok()
    }

    /// Shuts both channels down and joins the reader thread.
    pub fn close(&mut self) {
        let _ = self.sync.shutdown(Shutdown::Both);
        let _ = self.async_sock.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
