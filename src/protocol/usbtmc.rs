//! USBTMC / USB488 bulk-endpoint framed transport (USBTMC 1.0, USB488 1.0).
//!
//! Every bulk transfer in either direction starts with a 12-byte header:
//! `MsgID`, `bTag`, `bTagInverse` (bitwise NOT of `bTag`), one reserved byte,
//! a little-endian 32-bit `TransferSize`, `bmTransferAttributes`, the
//! termination character and two reserved bytes. Payloads are zero-padded to
//! a 4-byte boundary; the padding never reaches the caller.
//!
//! The engine is generic over [`TmcPipe`] so the framing, abort and status
//! sequences stay independent of the USB stack underneath.

use std::time::Duration;

use crate::quirks::UsbQuirks;

/// USB class/subclass/protocol triple of a USBTMC USB488 interface.
pub const CLASS_CODE: u8 = 0xFE;
pub const SUBCLASS_CODE: u8 = 0x03;
pub const PROTOCOL_USB488: u8 = 0x01;

pub const HEADER_SIZE: usize = 12;

consts_to_enum! {
    /// Bulk message identifiers (USBTMC table 2; `Trigger` from USB488).
    pub enum MsgId: u8 {
        DevDepMsgOut 1
        RequestDevDepMsgIn 2
        VendorSpecificOut 126
        RequestVendorSpecificIn 127
        Trigger 128
    }
}

consts_to_enum! {
    /// Class-specific control requests (USBTMC table 15, USB488 table 9).
    pub enum ControlRequest: u8 {
        InitiateAbortBulkOut 1
        CheckAbortBulkOutStatus 2
        InitiateAbortBulkIn 3
        CheckAbortBulkInStatus 4
        InitiateClear 5
        CheckClearStatus 6
        GetCapabilities 7
        IndicatorPulse 64
        ReadStatusByte 128
        RenControl 160
        GoToLocal 161
        LocalLockout 162
    }
}

consts_to_enum! {
    /// USBTMC_status values returned by control requests.
    pub enum TmcStatus: u8 {
        Success 1
        Pending 2
        Failed 0x80
        TransferNotInProgress 0x81
        SplitNotInProgress 0x82
        SplitInProgress 0x83
    }
}

/// Transfer identifier cycling through an inclusive range, never 0.
///
/// The host increments the bTag by 1 for each new Bulk-OUT header.
#[derive(Debug)]
pub struct BTag {
    first: u8,
    last: u8,
    current: Option<u8>,
}

impl BTag {
    pub fn new(first: u8, last: u8) -> Self {
        Self {
            first,
            last,
            current: None,
        }
    }

    pub fn next(&mut self) -> u8 {
        let next = match self.current {
            None => self.first,
            Some(tag) if tag >= self.last => self.first,
            Some(tag) => tag + 1,
        };
        self.current = Some(next);
        next
    }
}

fn header(msg_id: MsgId, btag: u8) -> [u8; 4] {
    [msg_id.into(), btag, !btag, 0]
}

/// `DEV_DEP_MSG_OUT` frame: header, payload, alignment padding.
pub fn build_dev_dep_msg_out(btag: u8, eom: bool, chunk: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + chunk.len() + 3);
    frame.extend_from_slice(&header(MsgId::DevDepMsgOut, btag));
    frame.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
    frame.extend_from_slice(&[eom as u8, 0, 0, 0]);
    frame.extend_from_slice(chunk);
    frame.resize(frame.len() + (4 - chunk.len() % 4) % 4, 0);
    frame
}

/// `REQUEST_DEV_DEP_MSG_IN` frame.
pub fn build_request_dev_dep_msg_in(
    btag: u8,
    transfer_size: u32,
    term_char: Option<u8>,
) -> [u8; HEADER_SIZE] {
    let mut frame = [0u8; HEADER_SIZE];
    frame[..4].copy_from_slice(&header(MsgId::RequestDevDepMsgIn, btag));
    frame[4..8].copy_from_slice(&transfer_size.to_le_bytes());
    if let Some(tc) = term_char {
        frame[8] = 2;
        frame[9] = tc;
    }
    frame
}

/// USB488 `TRIGGER` frame.
pub fn build_trigger(btag: u8) -> [u8; HEADER_SIZE] {
    let mut frame = [0u8; HEADER_SIZE];
    frame[..4].copy_from_slice(&header(MsgId::Trigger, btag));
    frame
}

/// Parsed first-transfer header of a `DEV_DEP_MSG_IN` response.
#[derive(Debug, Clone)]
pub struct BulkInMessage {
    pub transfer_size: usize,
    /// Bit 0: EOM. Bit 1: the requested termination character occurred.
    pub transfer_attributes: u8,
    /// Payload bytes carried by the same transfer, header stripped.
    pub data: Vec<u8>,
}

impl BulkInMessage {
    pub fn eom(&self) -> bool {
        self.transfer_attributes & 1 != 0
    }

    pub fn term_char_seen(&self) -> bool {
        self.transfer_attributes & 2 != 0
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, UsbTmcError> {
        if raw.len() < HEADER_SIZE {
            return Err(UsbTmcError::Protocol(format!(
                "bulk-IN transfer of {} bytes is shorter than the header",
                raw.len()
            )));
        }
        if raw[0] != u8::from(MsgId::RequestDevDepMsgIn) {
            return Err(UsbTmcError::Protocol(format!(
                "unexpected MsgID {} in bulk-IN header",
                raw[0]
            )));
        }
        let transfer_size = u32::from_le_bytes(raw[4..8].try_into().unwrap()) as usize;
        let transfer_attributes = raw[8];
        let data = raw[HEADER_SIZE..HEADER_SIZE + transfer_size.min(raw.len() - HEADER_SIZE)]
            .to_vec();
        Ok(Self {
            transfer_size,
            transfer_attributes,
            data,
        })
    }

    /// Recovery for firmware that answers without a conforming header.
    ///
    /// Mirrors the field experience behind `IGNORES_TRANSFER_SIZE_IN_HEADER`:
    /// strip the zero padding, and when the payload still looks framed (a
    /// `;`-separated SCPI answer after 12 bytes) drop the first 12 bytes.
    pub fn from_quirky(raw: &[u8]) -> Self {
        let trimmed: &[u8] = {
            let mut end = raw.len();
            while end > 0 && raw[end - 1] == 0 {
                end -= 1;
            }
            &raw[..end]
        };
        if trimmed.contains(&b';') && trimmed.len() >= HEADER_SIZE {
            let transfer_size =
                u32::from_le_bytes(trimmed[4..8].try_into().unwrap()) as usize;
            BulkInMessage {
                transfer_size,
                transfer_attributes: trimmed[8],
                data: trimmed[HEADER_SIZE..].to_vec(),
            }
        } else {
            BulkInMessage {
                transfer_size: trimmed.len(),
                transfer_attributes: 1,
                data: trimmed.to_vec(),
            }
        }
    }
}

/// USBTMC interface capabilities (`GET_CAPABILITIES`, 0x18-byte response).
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub indicator_pulse: bool,
    pub talk_only: bool,
    pub listen_only: bool,
    pub usb488: bool,
    pub ren_control: bool,
    pub trigger: bool,
}

impl Capabilities {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, UsbTmcError> {
        if raw.len() < 15 {
            return Err(UsbTmcError::Protocol(
                "short GET_CAPABILITIES response".into(),
            ));
        }
        Ok(Self {
            indicator_pulse: raw[4] & (1 << 2) != 0,
            talk_only: raw[4] & (1 << 1) != 0,
            listen_only: raw[4] & 1 != 0,
            usb488: raw[14] & (1 << 2) != 0,
            ren_control: raw[14] & (1 << 1) != 0,
            trigger: raw[14] & 1 != 0,
        })
    }
}

/// Errors from the USBTMC engine.
#[derive(Debug)]
pub enum UsbTmcError {
    /// The transfer deadline expired; the abort sequence has already been
    /// run, so the device is not left wedged.
    Timeout,
    /// The device disappeared from the bus.
    Disconnected,
    /// The interface does not implement the requested USB488 capability.
    Unsupported,
    Protocol(String),
    Pipe(String),
}

impl std::fmt::Display for UsbTmcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsbTmcError::Timeout => write!(f, "USBTMC transfer timed out"),
            UsbTmcError::Disconnected => write!(f, "USB device disconnected"),
            UsbTmcError::Unsupported => write!(f, "operation not supported by the interface"),
            UsbTmcError::Protocol(msg) => write!(f, "USBTMC protocol error: {}", msg),
            UsbTmcError::Pipe(msg) => write!(f, "USB transfer failed: {}", msg),
        }
    }
}

impl std::error::Error for UsbTmcError {}

/// The transport seam under the engine: one claimed USBTMC interface with
/// its bulk endpoint pair, optional interrupt-IN endpoint and the
/// class-specific control pipe.
pub trait TmcPipe {
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize, UsbTmcError>;
    fn read_bulk(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, UsbTmcError>;
    /// Class-specific IN control transfer addressed to the interface.
    fn control_in_interface(
        &mut self,
        request: ControlRequest,
        value: u16,
        len: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, UsbTmcError>;
    /// Class-specific IN control transfer addressed to a bulk endpoint.
    fn control_in_endpoint(
        &mut self,
        request: ControlRequest,
        value: u16,
        endpoint: u8,
        len: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, UsbTmcError>;
    /// Interrupt-IN read; `Err(Unsupported)` when the interface has none.
    fn read_interrupt(&mut self, max_len: usize, timeout: Duration)
        -> Result<Vec<u8>, UsbTmcError>;
    fn clear_bulk_in_halt(&mut self) -> Result<(), UsbTmcError>;
    fn clear_bulk_out_halt(&mut self) -> Result<(), UsbTmcError>;
    fn max_packet_size_in(&self) -> usize;
    fn max_packet_size_out(&self) -> usize;
    fn bulk_in_endpoint(&self) -> u8;
    fn bulk_out_endpoint(&self) -> u8;
}

const ABORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bulk-OUT chunking factor: frames carry at most this many max-size packets
/// worth of payload, capped at 1 MiB.
const OUT_PACKETS_PER_TRANSFER: usize = 64;
const MAX_OUT_TRANSFER: usize = 1 << 20;

/// How a bulk-IN exchange terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Neither indicator: the device simply delivered what was asked.
    None,
    /// The end-of-message bit accompanied the final byte.
    Eom,
    /// The device stopped at the requested termination character.
    TermChar,
}

/// The USBTMC engine: framed message exchange plus the USB488 status-byte
/// and trigger services, over any [`TmcPipe`].
#[derive(Debug)]
pub struct UsbTmc<P: TmcPipe> {
    pipe: P,
    btag: BTag,
    stb_btag: BTag,
    capabilities: Capabilities,
    quirks: UsbQuirks,
    timeout: Duration,
    pending: Vec<u8>,
    pending_end: EndReason,
}

impl<P: TmcPipe> UsbTmc<P> {
    /// Wraps a claimed interface: queries capabilities and, when the device
    /// implements REN_CONTROL, asserts remote enable.
    pub fn new(mut pipe: P, quirks: UsbQuirks, timeout: Duration) -> Result<Self, UsbTmcError> {
        let raw = pipe.control_in_interface(ControlRequest::GetCapabilities, 0, 0x18, timeout)?;
        let capabilities = Capabilities::from_bytes(&raw)?;
        log::debug!("USBTMC capabilities: {:?}", capabilities);
        let mut engine = Self {
            pipe,
            btag: BTag::new(1, 255),
            stb_btag: BTag::new(2, 127),
            capabilities,
            quirks,
            timeout,
            pending: Vec::new(),
            pending_end: EndReason::None,
        };
        if capabilities.ren_control {
            engine.ren_control(true)?;
        }
        Ok(engine)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pipe_mut(&mut self) -> &mut P {
        &mut self.pipe
    }

    fn out_chunk_size(&self) -> usize {
        (self.pipe.max_packet_size_out() * OUT_PACKETS_PER_TRANSFER)
            .clamp(1, MAX_OUT_TRANSFER)
    }

    /// Sends the payload as one or more `DEV_DEP_MSG_OUT` frames, each in a
    /// single bulk-OUT transfer. EOM is set on the final frame only when
    /// `send_end` is enabled. A timeout runs the abort-bulk-OUT sequence
    /// before surfacing.
    pub fn write(&mut self, data: &[u8], send_end: bool) -> Result<usize, UsbTmcError> {
        let chunk_size = self.out_chunk_size();
        let mut sent = 0usize;
        let total = data.len();
        loop {
            let end = (sent + chunk_size).min(total);
            let chunk = &data[sent..end];
            let last = end == total;
            let btag = self.btag.next();
            let frame = build_dev_dep_msg_out(btag, last && send_end, chunk);
            match self.pipe.write_bulk(&frame, self.timeout) {
                Ok(_) => {}
                Err(UsbTmcError::Timeout) => {
                    self.abort_bulk_out(btag);
                    return Err(UsbTmcError::Timeout);
                }
                Err(e) => return Err(e),
            }
            sent = end;
            if last {
                break;
            }
        }
        Ok(total)
    }

    /// Reads one logical message worth of data, up to `requested` bytes.
    ///
    /// Issues `REQUEST_DEV_DEP_MSG_IN` and keeps reading bulk-IN transfers
    /// until the device's advertised `TransferSize` bytes have arrived or a
    /// short packet closes the transfer; only the advertised bytes are kept
    /// (alignment padding discarded). Bytes past `requested` are buffered
    /// for the next call. Returns the data and how the message ended.
    pub fn read(
        &mut self,
        requested: usize,
        term_char: Option<u8>,
    ) -> Result<(Vec<u8>, EndReason), UsbTmcError> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let take = requested.min(self.pending.len());
            out.extend(self.pending.drain(..take));
            if self.pending.is_empty() && self.pending_end != EndReason::None {
                let reason = self.pending_end;
                self.pending_end = EndReason::None;
                return Ok((out, reason));
            }
            if out.len() >= requested {
                return Ok((out, EndReason::None));
            }
        }

        let mut end = EndReason::None;
        while out.len() < requested && end == EndReason::None {
            let want = requested - out.len();
            let (message, message_end) = self.read_message(want, term_char)?;
            if message.len() > want {
                self.pending.extend_from_slice(&message[want..]);
                self.pending_end = message_end;
                out.extend_from_slice(&message[..want]);
                return Ok((out, EndReason::None));
            }
            out.extend_from_slice(&message);
            end = message_end;
            if message.is_empty() && end == EndReason::None {
                break;
            }
        }
        Ok((out, end))
    }

    /// One request/response exchange on the bulk pipe.
    fn read_message(
        &mut self,
        requested: usize,
        term_char: Option<u8>,
    ) -> Result<(Vec<u8>, EndReason), UsbTmcError> {
        let max_packet = self.pipe.max_packet_size_in().max(1);
        let btag = self.btag.next();
        let request = build_request_dev_dep_msg_in(btag, requested as u32, term_char);
        if let Err(e) = self.pipe.write_bulk(&request, self.timeout) {
            if matches!(e, UsbTmcError::Timeout) {
                self.abort_bulk_out(btag);
            }
            return Err(e);
        }

        let result = self.read_message_body(requested, max_packet);
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                // leave the device in a defined state before surfacing
                self.abort_bulk_in(btag);
                Err(e)
            }
        }
    }

    fn read_message_body(
        &mut self,
        requested: usize,
        max_packet: usize,
    ) -> Result<(Vec<u8>, EndReason), UsbTmcError> {
        // request whole packets; one extra packet leaves room for the header
        // and lets a short packet terminate the transfer (USB 2.0 §5.8.3)
        let first_len = ((requested + HEADER_SIZE) / max_packet + 1) * max_packet;
        let first = self.pipe.read_bulk(first_len, self.timeout)?;

        let message = match BulkInMessage::from_bytes(&first) {
            Ok(msg) => msg,
            Err(UsbTmcError::Protocol(reason))
                if self.quirks.contains(UsbQuirks::IGNORES_TRANSFER_SIZE_IN_HEADER) =>
            {
                log::warn!("non-conforming bulk-IN header ({}), applying recovery", reason);
                BulkInMessage::from_quirky(&first)
            }
            Err(e) => return Err(e),
        };

        let term_char_seen = message.term_char_seen();
        let eom = message.eom();
        let mut payload = message.data;
        let mut raw_len = first.len();
        // Subsequent transfers carry payload only. Keep reading until the
        // device delivered its advertised TransferSize or closed the
        // exchange with a short packet.
        while payload.len() < message.transfer_size && raw_len % max_packet == 0 && raw_len > 0 {
            let want = ((message.transfer_size - payload.len()) / max_packet + 1) * max_packet;
            let chunk = self.pipe.read_bulk(want, self.timeout)?;
            raw_len = chunk.len();
            payload.extend_from_slice(&chunk);
        }
        payload.truncate(message.transfer_size);

        // the EOM bit is advisory until the advertised byte count is in
        let complete = payload.len() >= message.transfer_size;
        let end = if !complete {
            EndReason::None
        } else if term_char_seen {
            EndReason::TermChar
        } else if eom {
            EndReason::Eom
        } else {
            EndReason::None
        };
        Ok((payload, end))
    }

    /// USB488 `READ_STATUS_BYTE`. The status byte arrives on the
    /// interrupt-IN endpoint as a bTag/value pair; devices without one
    /// return it in the control response instead.
    pub fn read_stb(&mut self) -> Result<u8, UsbTmcError> {
        if !self.capabilities.usb488 {
            return Err(UsbTmcError::Unsupported);
        }
        let btag = self.stb_btag.next();
        let data = self.pipe.control_in_interface(
            ControlRequest::ReadStatusByte,
            btag as u16,
            3,
            self.timeout,
        )?;
        if data.len() < 3 || data[0] != u8::from(TmcStatus::Success) {
            return Err(UsbTmcError::Protocol("READ_STATUS_BYTE refused".into()));
        }
        if data[1] != btag {
            return Err(UsbTmcError::Protocol("READ_STATUS_BYTE bTag mismatch".into()));
        }
        match self.pipe.read_interrupt(2, self.timeout) {
            Err(UsbTmcError::Unsupported) => Ok(data[2]),
            Err(e) => Err(e),
            Ok(intr) => {
                if intr.len() < 2 || intr[0] & 0x80 == 0 || intr[0] & 0x7F != btag {
                    return Err(UsbTmcError::Protocol(
                        "interrupt-IN bNotify1 mismatch".into(),
                    ));
                }
                Ok(intr[1])
            }
        }
    }

    /// USB488 `TRIGGER` bulk-OUT message.
    pub fn assert_trigger(&mut self) -> Result<(), UsbTmcError> {
        if !self.capabilities.trigger {
            return Err(UsbTmcError::Unsupported);
        }
        let btag = self.btag.next();
        let frame = build_trigger(btag);
        self.pipe.write_bulk(&frame, self.timeout)?;
        Ok(())
    }

    /// `INITIATE_CLEAR` / `CHECK_CLEAR_STATUS` sequence, then reopens the
    /// bulk-OUT pipe.
    pub fn clear(&mut self) -> Result<(), UsbTmcError> {
        self.pending.clear();
        self.pending_end = EndReason::None;
        let data = self.pipe.control_in_interface(
            ControlRequest::InitiateClear,
            0,
            1,
            ABORT_TIMEOUT,
        )?;
        if data.first() != Some(&u8::from(TmcStatus::Success)) {
            return Err(UsbTmcError::Protocol("INITIATE_CLEAR refused".into()));
        }
        for _ in 0..100 {
            let status = self.pipe.control_in_interface(
                ControlRequest::CheckClearStatus,
                0,
                2,
                ABORT_TIMEOUT,
            )?;
            if status.first() != Some(&u8::from(TmcStatus::Pending)) {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        self.pipe.clear_bulk_out_halt()
    }

    /// USB488 `REN_CONTROL`.
    pub fn ren_control(&mut self, assert: bool) -> Result<(), UsbTmcError> {
        if !self.capabilities.ren_control {
            return Err(UsbTmcError::Unsupported);
        }
        self.pipe
            .control_in_interface(ControlRequest::RenControl, assert as u16, 1, self.timeout)?;
        Ok(())
    }

    /// USB488 `GO_TO_LOCAL`.
    pub fn go_to_local(&mut self) -> Result<(), UsbTmcError> {
        if !self.capabilities.ren_control {
            return Err(UsbTmcError::Unsupported);
        }
        self.pipe
            .control_in_interface(ControlRequest::GoToLocal, 0, 1, self.timeout)?;
        Ok(())
    }

    /// Abort sequence for a wedged bulk-IN transfer. Failures are logged and
    /// swallowed; this already runs on an error path.
    fn abort_bulk_in(&mut self, btag: u8) {
        let endpoint = self.pipe.bulk_in_endpoint();
        let initiated = self.pipe.control_in_endpoint(
            ControlRequest::InitiateAbortBulkIn,
            btag as u16,
            endpoint,
            2,
            ABORT_TIMEOUT,
        );
        match initiated {
            Ok(data) if data.first() == Some(&u8::from(TmcStatus::Success)) => {}
            Ok(_) => return,
            Err(e) => {
                log::debug!("INITIATE_ABORT_BULK_IN failed: {}", e);
                return;
            }
        }
        // drain whatever the device already queued
        let max_packet = self.pipe.max_packet_size_in().max(1);
        let _ = self.pipe.read_bulk(max_packet, ABORT_TIMEOUT);
        for _ in 0..100 {
            match self.pipe.control_in_endpoint(
                ControlRequest::CheckAbortBulkInStatus,
                0,
                endpoint,
                8,
                ABORT_TIMEOUT,
            ) {
                Ok(status) if status.first() == Some(&u8::from(TmcStatus::Pending)) => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => break,
            }
        }
        let _ = self.pipe.clear_bulk_in_halt();
    }

    /// Abort sequence for a wedged bulk-OUT transfer.
    fn abort_bulk_out(&mut self, btag: u8) {
        let endpoint = self.pipe.bulk_out_endpoint();
        let initiated = self.pipe.control_in_endpoint(
            ControlRequest::InitiateAbortBulkOut,
            btag as u16,
            endpoint,
            2,
            ABORT_TIMEOUT,
        );
        match initiated {
            Ok(data) if data.first() == Some(&u8::from(TmcStatus::Success)) => {}
            Ok(_) => return,
            Err(e) => {
                log::debug!("INITIATE_ABORT_BULK_OUT failed: {}", e);
                return;
            }
        }
        for _ in 0..100 {
            match self.pipe.control_in_endpoint(
                ControlRequest::CheckAbortBulkOutStatus,
                0,
                endpoint,
                8,
                ABORT_TIMEOUT,
            ) {
                Ok(status) if status.first() == Some(&u8::from(TmcStatus::Pending)) => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => break,
            }
        }
        let _ = self.pipe.clear_bulk_out_halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btag_cycles_and_skips_zero() {
        let mut btag = BTag::new(1, 3);
        assert_eq!(btag.next(), 1);
        assert_eq!(btag.next(), 2);
        assert_eq!(btag.next(), 3);
        assert_eq!(btag.next(), 1);
    }

    #[test]
    fn dev_dep_msg_out_layout() {
        let frame = build_dev_dep_msg_out(5, true, b"*IDN?");
        assert_eq!(frame.len(), HEADER_SIZE + 8);
        assert_eq!(frame[0], 1);
        assert_eq!(frame[1], 5);
        assert_eq!(frame[2], !5u8);
        assert_eq!(&frame[4..8], &5u32.to_le_bytes());
        assert_eq!(frame[8], 1);
        assert_eq!(&frame[12..17], b"*IDN?");
        assert_eq!(&frame[17..], &[0, 0, 0]);
    }

    #[test]
    fn request_msg_in_encodes_term_char() {
        let frame = build_request_dev_dep_msg_in(7, 1024, Some(b'\n'));
        assert_eq!(frame[0], 2);
        assert_eq!(&frame[4..8], &1024u32.to_le_bytes());
        assert_eq!(frame[8], 2);
        assert_eq!(frame[9], b'\n');
        let plain = build_request_dev_dep_msg_in(7, 64, None);
        assert_eq!(plain[8], 0);
        assert_eq!(plain[9], 0);
    }

    #[test]
    fn bulk_in_header_strips_padding() {
        let mut raw = vec![2u8, 9, !9, 0];
        raw.extend_from_slice(&5u32.to_le_bytes());
        raw.extend_from_slice(&[1, 0, 0, 0]);
        raw.extend_from_slice(b"hello\0\0\0");
        let msg = BulkInMessage::from_bytes(&raw).unwrap();
        assert_eq!(msg.transfer_size, 5);
        assert!(msg.eom());
        assert_eq!(msg.data, b"hello");
    }

    #[test]
    fn quirky_header_recovery() {
        let msg = BulkInMessage::from_quirky(b"FREQ 1000\0\0\0");
        assert_eq!(msg.data, b"FREQ 1000");
        assert!(msg.eom());
    }

    #[test]
    fn capabilities_bits() {
        let mut raw = vec![0u8; 0x18];
        raw[4] = 0b100;
        raw[14] = 0b111;
        let caps = Capabilities::from_bytes(&raw).unwrap();
        assert!(caps.indicator_pulse);
        assert!(!caps.talk_only);
        assert!(caps.usb488);
        assert!(caps.ren_control);
        assert!(caps.trigger);
    }
}
