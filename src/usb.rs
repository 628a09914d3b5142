//! USB sessions over `rusb`: USBTMC instruments and raw bulk devices.

use std::time::Duration;

use rusb::{Device, DeviceHandle, Direction, GlobalContext, Recipient, RequestType, TransferType};

use crate::enums::assert::TriggerProtocol;
use crate::enums::attribute::{AttrKind, Attribute};
use crate::enums::status::{CompletionCode, ErrorCode};
use crate::protocol::usbtmc::{
    self, Capabilities, ControlRequest, EndReason, TmcPipe, UsbTmc, UsbTmcError,
};
use crate::quirks::{self, UsbQuirks};
use crate::rname::ResourceName;
use crate::session::{IoSettings, Session};
use crate::{Error, Result};

/// Concrete timeout handed to libusb when the session timeout is infinite;
/// libusb treats zero as "no timeout".
const NO_TIMEOUT: Duration = Duration::ZERO;

fn usb_err(e: rusb::Error) -> UsbTmcError {
    match e {
        rusb::Error::Timeout => UsbTmcError::Timeout,
        rusb::Error::NoDevice => UsbTmcError::Disconnected,
        other => UsbTmcError::Pipe(other.to_string()),
    }
}

fn tmc_err(e: UsbTmcError) -> Error {
    match e {
        UsbTmcError::Timeout => Error::from(ErrorCode::Tmo),
        UsbTmcError::Disconnected => Error::from(ErrorCode::ConnLost),
        UsbTmcError::Unsupported => Error::from(ErrorCode::NsupOper),
        UsbTmcError::Protocol(msg) => {
            log::warn!("USBTMC protocol violation: {}", msg);
            Error::from(ErrorCode::Io)
        }
        UsbTmcError::Pipe(msg) => {
            log::debug!("USB transfer error: {}", msg);
            Error::from(ErrorCode::Io)
        }
    }
}

/// Endpoint layout of one claimed interface.
#[derive(Debug, Clone, Copy)]
struct EndpointLayout {
    interface: u8,
    bulk_in: u8,
    bulk_out: u8,
    interrupt_in: Option<u8>,
    max_packet_in: usize,
    max_packet_out: usize,
}

fn find_endpoints(device: &Device<GlobalContext>, interface: u8) -> Result<EndpointLayout> {
    let config = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
        .map_err(|_| Error::from(ErrorCode::RsrcNfound))?;
    for intf in config.interfaces() {
        for desc in intf.descriptors() {
            if desc.interface_number() != interface {
                continue;
            }
            let mut layout = EndpointLayout {
                interface,
                bulk_in: 0,
                bulk_out: 0,
                interrupt_in: None,
                max_packet_in: 64,
                max_packet_out: 64,
            };
            for ep in desc.endpoint_descriptors() {
                match (ep.transfer_type(), ep.direction()) {
                    (TransferType::Bulk, Direction::In) => {
                        layout.bulk_in = ep.address();
                        layout.max_packet_in = ep.max_packet_size() as usize;
                    }
                    (TransferType::Bulk, Direction::Out) => {
                        layout.bulk_out = ep.address();
                        layout.max_packet_out = ep.max_packet_size() as usize;
                    }
                    (TransferType::Interrupt, Direction::In) => {
                        layout.interrupt_in = Some(ep.address());
                    }
                    _ => {}
                }
            }
            if layout.bulk_in == 0 || layout.bulk_out == 0 {
                return Err(Error::from(ErrorCode::InvSetup));
            }
            return Ok(layout);
        }
    }
    Err(Error::from(ErrorCode::RsrcNfound))
}

/// The interface number of the USBTMC interface, if the device has one.
fn tmc_interface(device: &Device<GlobalContext>) -> Option<u8> {
    let config = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
        .ok()?;
    for intf in config.interfaces() {
        for desc in intf.descriptors() {
            if desc.class_code() == usbtmc::CLASS_CODE
                && desc.sub_class_code() == usbtmc::SUBCLASS_CODE
            {
                return Some(desc.interface_number());
            }
        }
    }
    None
}

fn serial_number(
    device: &Device<GlobalContext>,
    handle: &DeviceHandle<GlobalContext>,
) -> Option<String> {
    let desc = device.device_descriptor().ok()?;
    handle.read_serial_number_string_ascii(&desc).ok()
}

/// Enumerates connected USBTMC instruments.
pub fn list_resources() -> Vec<ResourceName> {
    let devices = match rusb::devices() {
        Ok(devices) => devices,
        Err(e) => {
            log::debug!("USB enumeration failed: {}", e);
            return Vec::new();
        }
    };
    let mut found = Vec::new();
    for device in devices.iter() {
        let Some(interface) = tmc_interface(&device) else {
            continue;
        };
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        // opening can fail for permission reasons; such devices are skipped
        let Ok(handle) = device.open() else {
            continue;
        };
        let serial = serial_number(&device, &handle).unwrap_or_default();
        found.push(ResourceName::UsbInstr {
            board: 0,
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            serial_number: serial,
            interface: interface as u16,
        });
    }
    found
}

/// Opens and prepares the device: kernel driver detach, configuration (once
/// for devices that cannot take repeats), optional reset, claim.
fn open_device(
    vendor_id: u16,
    product_id: u16,
    serial: &str,
    interface: u8,
) -> Result<(DeviceHandle<GlobalContext>, Device<GlobalContext>, UsbQuirks)> {
    let devices = rusb::devices().map_err(|_| Error::from(ErrorCode::Io))?;
    for device in devices.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if desc.vendor_id() != vendor_id || desc.product_id() != product_id {
            continue;
        }
        let Ok(mut handle) = device.open() else {
            continue;
        };
        if !serial.is_empty() {
            match serial_number(&device, &handle) {
                Some(sn) if sn == serial => {}
                _ => continue,
            }
        }

        let quirks = quirks::lookup(vendor_id, product_id);
        if handle.kernel_driver_active(interface).unwrap_or(false) {
            if let Err(e) = handle.detach_kernel_driver(interface) {
                log::debug!("detaching kernel driver failed: {}", e);
            }
        }
        if quirks.contains(UsbQuirks::NEEDS_RESET_ON_OPEN) {
            if let Err(e) = handle.reset() {
                log::debug!("device reset on open failed: {}", e);
            }
        }
        // devices carrying the configure-once quirk get their single
        // set_configuration here, paired with the reset above; repeating it
        // later re-detaches the kernel driver and loses communication.
        // everyone else is configured only when unconfigured.
        let needs_config = if quirks.contains(UsbQuirks::ONLY_ONE_SET_CONFIGURATION) {
            true
        } else {
            matches!(handle.active_configuration(), Err(_) | Ok(0))
        };
        if needs_config {
            let config = device
                .config_descriptor(0)
                .map(|c| c.number())
                .unwrap_or(1);
            handle
                .set_active_configuration(config)
                .map_err(|_| Error::from(ErrorCode::InvSetup))?;
        }
        handle
            .claim_interface(interface)
            .map_err(|_| Error::from(ErrorCode::RsrcBusy))?;
        return Ok((handle, device, quirks));
    }
    Err(Error::from(ErrorCode::RsrcNfound))
}

/// [`TmcPipe`] over one claimed `rusb` interface.
struct RusbPipe {
    handle: DeviceHandle<GlobalContext>,
    layout: EndpointLayout,
}

impl std::fmt::Debug for RusbPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusbPipe").field("layout", &self.layout).finish()
    }
}

impl TmcPipe for RusbPipe {
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> std::result::Result<usize, UsbTmcError> {
        self.handle
            .write_bulk(self.layout.bulk_out, data, timeout)
            .map_err(usb_err)
    }

    fn read_bulk(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, UsbTmcError> {
        let mut buf = vec![0u8; max_len];
        let n = self
            .handle
            .read_bulk(self.layout.bulk_in, &mut buf, timeout)
            .map_err(usb_err)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn control_in_interface(
        &mut self,
        request: ControlRequest,
        value: u16,
        len: u16,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, UsbTmcError> {
        let mut buf = vec![0u8; len as usize];
        let request_type = rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface);
        let n = self
            .handle
            .read_control(
                request_type,
                request.into(),
                value,
                self.layout.interface as u16,
                &mut buf,
                timeout,
            )
            .map_err(usb_err)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn control_in_endpoint(
        &mut self,
        request: ControlRequest,
        value: u16,
        endpoint: u8,
        len: u16,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, UsbTmcError> {
        let mut buf = vec![0u8; len as usize];
        let request_type = rusb::request_type(Direction::In, RequestType::Class, Recipient::Endpoint);
        let n = self
            .handle
            .read_control(
                request_type,
                request.into(),
                value,
                endpoint as u16,
                &mut buf,
                timeout,
            )
            .map_err(usb_err)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn read_interrupt(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, UsbTmcError> {
        let Some(endpoint) = self.layout.interrupt_in else {
            return Err(UsbTmcError::Unsupported);
        };
        let mut buf = vec![0u8; max_len];
        let n = self
            .handle
            .read_interrupt(endpoint, &mut buf, timeout)
            .map_err(usb_err)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn clear_bulk_in_halt(&mut self) -> std::result::Result<(), UsbTmcError> {
        self.handle.clear_halt(self.layout.bulk_in).map_err(usb_err)
    }

    fn clear_bulk_out_halt(&mut self) -> std::result::Result<(), UsbTmcError> {
        self.handle.clear_halt(self.layout.bulk_out).map_err(usb_err)
    }

    fn max_packet_size_in(&self) -> usize {
        self.layout.max_packet_in
    }

    fn max_packet_size_out(&self) -> usize {
        self.layout.max_packet_out
    }

    fn bulk_in_endpoint(&self) -> u8 {
        self.layout.bulk_in
    }

    fn bulk_out_endpoint(&self) -> u8 {
        self.layout.bulk_out
    }
}

fn engine_timeout(io: &IoSettings) -> Duration {
    io.timeout.unwrap_or(NO_TIMEOUT)
}

/// A `USB::vid::pid::serial::INSTR` session.
pub struct UsbTmcSession {
    engine: UsbTmc<RusbPipe>,
    io: IoSettings,
}

impl UsbTmcSession {
    pub fn open(
        vendor_id: u16,
        product_id: u16,
        serial: &str,
        interface: u16,
        _open_timeout: Duration,
    ) -> Result<Self> {
        let (handle, device, quirks) = open_device(vendor_id, product_id, serial, interface as u8)?;
        let layout = find_endpoints(&device, interface as u8)?;
        let pipe = RusbPipe { handle, layout };
        let io = IoSettings::default();
        let engine = UsbTmc::new(pipe, quirks, engine_timeout(&io)).map_err(tmc_err)?;
        Ok(Self { engine, io })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.engine.capabilities()
    }
}

impl Session for UsbTmcSession {
    fn read(&mut self, count: usize) -> Result<(Vec<u8>, CompletionCode)> {
        self.engine.set_timeout(engine_timeout(&self.io));
        let term_char = self.io.term_char();
        let mut out: Vec<u8> = Vec::new();
        loop {
            let want = count - out.len();
            let (data, reason) = match self.engine.read(want, term_char) {
                Ok(result) => result,
                Err(UsbTmcError::Timeout) => return Err(Error::timeout_with(out)),
                Err(e) => return Err(tmc_err(e)),
            };
            out.extend_from_slice(&data);
            match reason {
                EndReason::TermChar => return Ok((out, CompletionCode::SuccessTermChar)),
                EndReason::Eom if !self.io.suppress_end => {
                    return Ok((out, CompletionCode::Success));
                }
                _ => {}
            }
            if out.len() >= count {
                return Ok((out, CompletionCode::SuccessMaxCnt));
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.engine.set_timeout(engine_timeout(&self.io));
        self.engine.write(data, self.io.send_end).map_err(tmc_err)
    }

    fn clear(&mut self) -> Result<()> {
        self.engine.clear().map_err(tmc_err)
    }

    fn read_stb(&mut self) -> Result<u8> {
        self.engine.set_timeout(engine_timeout(&self.io));
        self.engine.read_stb().map_err(tmc_err)
    }

    fn assert_trigger(&mut self, protocol: TriggerProtocol) -> Result<()> {
        if protocol != TriggerProtocol::Default {
            return Err(Error::from(ErrorCode::NsupOper));
        }
        self.engine.assert_trigger().map_err(tmc_err)
    }

    fn get_attr(&mut self, kind: AttrKind) -> Result<Attribute> {
        self.io
            .get_attr(kind)
            .ok_or_else(|| Error::from(ErrorCode::NsupAttr))
    }

    fn set_attr(&mut self, attr: &Attribute) -> Result<()> {
        if self.io.set_attr(attr) {
            return Ok(());
        }
        Err(Error::from(ErrorCode::NsupAttr))
    }

    fn close(&mut self) -> Result<()> {
        // hand the front panel back to the operator where supported
        if let Err(e) = self.engine.go_to_local() {
            log::debug!("GO_TO_LOCAL on close: {}", e);
        }
        Ok(())
    }
}

/// A `USB::vid::pid::serial::RAW` session: unframed bulk transfers.
pub struct UsbRawSession {
    pipe: RusbPipe,
    io: IoSettings,
}

impl UsbRawSession {
    pub fn open(
        vendor_id: u16,
        product_id: u16,
        serial: &str,
        interface: u16,
        _open_timeout: Duration,
    ) -> Result<Self> {
        let (handle, device, _quirks) = open_device(vendor_id, product_id, serial, interface as u8)?;
        let layout = find_endpoints(&device, interface as u8)?;
        Ok(Self {
            pipe: RusbPipe { handle, layout },
            io: IoSettings::default(),
        })
    }
}

impl Session for UsbRawSession {
    fn read(&mut self, count: usize) -> Result<(Vec<u8>, CompletionCode)> {
        let timeout = engine_timeout(&self.io);
        let data = match self.pipe.read_bulk(count.max(1), timeout) {
            Ok(data) => data,
            Err(UsbTmcError::Timeout) => return Err(Error::timeout_with(Vec::new())),
            Err(e) => return Err(tmc_err(e)),
        };
        if let Some(tc) = self.io.term_char() {
            if let Some(pos) = data.iter().position(|&b| b == tc) {
                let mut out = data;
                out.truncate(pos + 1);
                return Ok((out, CompletionCode::SuccessTermChar));
            }
        }
        let status = if data.len() >= count {
            CompletionCode::SuccessMaxCnt
        } else {
            CompletionCode::Success
        };
        Ok((data, status))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let timeout = engine_timeout(&self.io);
        self.pipe.write_bulk(data, timeout).map_err(tmc_err)
    }

    fn clear(&mut self) -> Result<()> {
        self.pipe.clear_bulk_in_halt().map_err(tmc_err)?;
        self.pipe.clear_bulk_out_halt().map_err(tmc_err)
    }

    fn get_attr(&mut self, kind: AttrKind) -> Result<Attribute> {
        self.io
            .get_attr(kind)
            .ok_or_else(|| Error::from(ErrorCode::NsupAttr))
    }

    fn set_attr(&mut self, attr: &Attribute) -> Result<()> {
        if self.io.set_attr(attr) {
            return Ok(());
        }
        Err(Error::from(ErrorCode::NsupAttr))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
