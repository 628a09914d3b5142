//! USBTMC engine tests over a scripted transport pipe.

use std::collections::VecDeque;
use std::time::Duration;

use visa_pure::protocol::usbtmc::{
    BTag, ControlRequest, EndReason, TmcPipe, UsbTmc, UsbTmcError, HEADER_SIZE,
};
use visa_pure::quirks::UsbQuirks;

const MAX_PACKET: usize = 64;

/// Scripted USB interface: canned bulk-IN transfers and control responses,
/// everything the engine does recorded for assertions.
#[derive(Default)]
struct MockPipe {
    bulk_in: VecDeque<Result<Vec<u8>, UsbTmcError>>,
    interrupt_in: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    controls: Vec<(ControlRequest, u16)>,
    halts_cleared: Vec<&'static str>,
    max_packet_out: usize,
}

impl MockPipe {
    fn new() -> Self {
        Self {
            max_packet_out: MAX_PACKET,
            ..Self::default()
        }
    }

    /// Frames a device response: 12-byte header followed by the payload and
    /// alignment padding, split into `transfer_sizes` bulk transfers.
    fn queue_message(&mut self, payload: &[u8], eom: bool, transfer_sizes: &[usize]) {
        let mut raw = vec![2u8, 0, 0, 0];
        raw[1] = 0xAA; // btag; the engine does not check the echo
        raw[2] = !0xAAu8;
        raw.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        raw.extend_from_slice(&[eom as u8, 0, 0, 0]);
        raw.extend_from_slice(payload);
        raw.resize(raw.len() + (4 - payload.len() % 4) % 4, 0);

        let mut offset = 0;
        for &size in transfer_sizes {
            let end = (offset + size).min(raw.len());
            self.bulk_in.push_back(Ok(raw[offset..end].to_vec()));
            offset = end;
        }
        assert_eq!(offset, raw.len(), "script must cover the whole message");
    }
}

fn capabilities_response() -> Vec<u8> {
    let mut raw = vec![0u8; 0x18];
    raw[4] = 0b100; // indicator pulse
    raw[14] = 0b111; // usb488, ren_control, trigger
    raw
}

impl TmcPipe for MockPipe {
    fn write_bulk(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, UsbTmcError> {
        self.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn read_bulk(&mut self, _max_len: usize, _timeout: Duration) -> Result<Vec<u8>, UsbTmcError> {
        self.bulk_in
            .pop_front()
            .unwrap_or(Err(UsbTmcError::Timeout))
    }

    fn control_in_interface(
        &mut self,
        request: ControlRequest,
        value: u16,
        _len: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>, UsbTmcError> {
        self.controls.push((request, value));
        Ok(match request {
            ControlRequest::GetCapabilities => capabilities_response(),
            ControlRequest::ReadStatusByte => vec![1, value as u8, 0],
            _ => vec![1],
        })
    }

    fn control_in_endpoint(
        &mut self,
        request: ControlRequest,
        value: u16,
        _endpoint: u8,
        _len: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>, UsbTmcError> {
        self.controls.push((request, value));
        Ok(vec![1, 0, 0, 0, 0, 0, 0, 0])
    }

    fn read_interrupt(&mut self, _max_len: usize, _timeout: Duration) -> Result<Vec<u8>, UsbTmcError> {
        self.interrupt_in
            .pop_front()
            .ok_or(UsbTmcError::Unsupported)
    }

    fn clear_bulk_in_halt(&mut self) -> Result<(), UsbTmcError> {
        self.halts_cleared.push("in");
        Ok(())
    }

    fn clear_bulk_out_halt(&mut self) -> Result<(), UsbTmcError> {
        self.halts_cleared.push("out");
        Ok(())
    }

    fn max_packet_size_in(&self) -> usize {
        MAX_PACKET
    }

    fn max_packet_size_out(&self) -> usize {
        self.max_packet_out
    }

    fn bulk_in_endpoint(&self) -> u8 {
        0x81
    }

    fn bulk_out_endpoint(&self) -> u8 {
        0x02
    }
}

fn engine(pipe: MockPipe) -> UsbTmc<MockPipe> {
    UsbTmc::new(pipe, UsbQuirks::empty(), Duration::from_secs(2)).unwrap()
}

/// A 1024-byte device message arrives as one bulk transfer ending in a
/// short packet; the caller gets exactly the advertised payload, with the
/// header and alignment padding gone.
#[test]
fn large_read_strips_header_and_padding() {
    let payload: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
    let mut pipe = MockPipe::new();
    pipe.queue_message(&payload, true, &[HEADER_SIZE + 1024]);

    let mut tmc = engine(pipe);
    let (data, end) = tmc.read(1024, None).unwrap();
    assert_eq!(data, payload);
    assert_eq!(end, EndReason::Eom);
}

/// Only the first bulk-IN transfer carries a header; the remainder of the
/// advertised TransferSize arrives headerless and is accumulated until a
/// short packet.
#[test]
fn multi_transfer_read_accumulates_payload() {
    let payload: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();
    let mut pipe = MockPipe::new();
    // 512-byte first transfer (12-byte header + 500 payload), rest after
    pipe.queue_message(&payload, true, &[512, 524]);

    let mut tmc = engine(pipe);
    let (data, end) = tmc.read(1024, None).unwrap();
    assert_eq!(data, payload);
    assert_eq!(end, EndReason::Eom);
}

/// A read for fewer bytes than the device has queued returns exactly the
/// requested count; the rest comes with the next read.
#[test]
fn partial_read_leaves_remainder_for_next_call() {
    let mut pipe = MockPipe::new();
    pipe.queue_message(b"ABCD", false, &[HEADER_SIZE + 4]);
    pipe.queue_message(b"EFGHIJ", true, &[HEADER_SIZE + 8]);

    let mut tmc = engine(pipe);
    let (first, end) = tmc.read(4, None).unwrap();
    assert_eq!(first, b"ABCD");
    assert_eq!(end, EndReason::None);
    let (rest, end) = tmc.read(64, None).unwrap();
    assert_eq!(rest, b"EFGHIJ");
    assert_eq!(end, EndReason::Eom);
}

/// Writes are fragmented into framed transfers; EOM goes only on the final
/// frame, bTags increment and payloads are 4-byte aligned.
#[test]
fn write_fragments_with_eom_on_last() {
    let mut pipe = MockPipe::new();
    pipe.max_packet_out = 8; // chunk limit becomes 8 * 64 = 512 bytes
    let data: Vec<u8> = (0..1300u32).map(|i| i as u8).collect();

    let mut tmc = engine(pipe);
    assert_eq!(tmc.write(&data, true).unwrap(), 1300);

    let writes = &tmc.pipe_mut().writes;
    assert_eq!(writes.len(), 3);
    let mut sizes = Vec::new();
    for (index, frame) in writes.iter().enumerate() {
        assert_eq!(frame[0], 1, "DEV_DEP_MSG_OUT");
        assert_eq!(frame[1], index as u8 + 1, "bTag increments from 1");
        assert_eq!(frame[2], !(index as u8 + 1), "bTagInverse");
        let size = u32::from_le_bytes(frame[4..8].try_into().unwrap()) as usize;
        sizes.push(size);
        let eom = frame[8] & 1 != 0;
        assert_eq!(eom, index == writes.len() - 1, "EOM only on the last frame");
        assert_eq!(frame.len(), HEADER_SIZE + size + (4 - size % 4) % 4);
    }
    assert_eq!(sizes, vec![512, 512, 276]);
}

/// A bulk-IN timeout triggers the abort sequence: INITIATE_ABORT_BULK_IN
/// with the outstanding bTag, a drain read, status polling and a halt
/// clear, before the timeout is surfaced.
#[test]
fn read_timeout_runs_abort_sequence() {
    let mut pipe = MockPipe::new();
    pipe.bulk_in.push_back(Err(UsbTmcError::Timeout));
    pipe.bulk_in.push_back(Ok(Vec::new())); // drain read during abort

    let mut tmc = engine(pipe);
    let err = tmc.read(64, None).unwrap_err();
    assert!(matches!(err, UsbTmcError::Timeout));

    let controls = &tmc.pipe_mut().controls;
    assert!(controls.contains(&(ControlRequest::InitiateAbortBulkIn, 1)));
    assert!(controls
        .iter()
        .any(|(req, _)| *req == ControlRequest::CheckAbortBulkInStatus));
    assert_eq!(tmc.pipe_mut().halts_cleared, vec!["in"]);
}

/// READ_STATUS_BYTE: control request carries a bTag in 2..=127 and the
/// status byte arrives on the interrupt endpoint as a tag/value pair.
#[test]
fn read_status_byte_via_interrupt_endpoint() {
    let mut pipe = MockPipe::new();
    pipe.interrupt_in.push_back(vec![0x80 | 2, 0x77]);

    let mut tmc = engine(pipe);
    assert_eq!(tmc.read_stb().unwrap(), 0x77);
    assert!(tmc
        .pipe_mut()
        .controls
        .contains(&(ControlRequest::ReadStatusByte, 2)));
}

/// The USB488 trigger is a bulk-OUT frame of its own message id.
#[test]
fn trigger_is_a_framed_bulk_message() {
    let pipe = MockPipe::new();
    let mut tmc = engine(pipe);
    tmc.assert_trigger().unwrap();
    let writes = &tmc.pipe_mut().writes;
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0][0], 128);
    assert_eq!(writes[0].len(), HEADER_SIZE);
}

#[test]
fn btag_range_is_exercised() {
    let mut btag = BTag::new(1, 255);
    for expected in 1..=255u16 {
        assert_eq!(btag.next() as u16, expected);
    }
    assert_eq!(btag.next(), 1);
}
