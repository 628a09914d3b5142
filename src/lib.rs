//! Pure Rust backend for message-based VISA instrument I/O.
//!
//! Speaks the instrument protocols directly instead of binding a vendor
//! VISA library: VXI-11 over ONC/RPC, HiSLIP, USBTMC/USB488, GPIB through
//! the platform driver, raw TCP sockets, VICP and serial ports.
//!
//! ```no_run
//! use std::time::Duration;
//! use visa_pure::{flags::AccessMode, ResourceManager};
//!
//! # fn main() -> visa_pure::Result<()> {
//! let rm = ResourceManager::new()?;
//! let mut instr = rm.open(
//!     "TCPIP0::192.0.2.10::INSTR",
//!     AccessMode::NO_LOCK,
//!     Duration::from_secs(5),
//! )?;
//! instr.write(b"*IDN?\n")?;
//! let (idn, _status) = instr.read(256)?;
//! println!("{}", String::from_utf8_lossy(&idn));
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt::Display;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[macro_use]
pub mod enums;
pub mod flags;
pub mod rname;

pub mod protocol;
pub mod quirks;

mod session;

pub mod discovery;
#[cfg(feature = "gpib")]
pub mod gpib;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcpip;
#[cfg(feature = "usb")]
pub mod usb;

use enums::assert::TriggerProtocol;
use enums::attribute::{AttrKind, Attribute, InterfaceType};
use enums::status::{CompletionCode, ErrorCode};
use flags::{AccessMode, FlushMode};
use session::Session;

pub use rname::ResourceName;
pub use session::{TMO_IMMEDIATE, TMO_INFINITE};

pub const TIMEOUT_IMMEDIATE: Duration = Duration::ZERO;
pub const TIMEOUT_INFINITE: Duration = Duration::MAX;

/// Key identifying a shared lock, passed between cooperating sessions.
pub type AccessKey = String;
pub type KeyID = String;

/// A VISA error status, optionally carrying the bytes a read had already
/// accumulated when it timed out.
#[derive(Debug, Clone)]
pub struct Error {
    code: ErrorCode,
    partial: Option<Vec<u8>>,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Bytes received before a read timeout, when any.
    pub fn partial_data(&self) -> Option<&[u8]> {
        self.partial.as_deref()
    }

    pub(crate) fn timeout_with(partial: Vec<u8>) -> Self {
        Self {
            code: ErrorCode::Tmo,
            partial: (!partial.is_empty()).then_some(partial),
        }
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.code.fmt(f)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for Error {}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self {
            code,
            partial: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps transport-level I/O failures onto VISA statuses.
pub(crate) fn io_to_visa_err(e: &io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::from(ErrorCode::Tmo),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Error::from(ErrorCode::ConnLost),
        _ => Error::from(ErrorCode::Io),
    }
}

fn map_to_io_err(err: Error) -> io::Error {
    use std::io::ErrorKind::*;
    io::Error::new(
        match err.code() {
            ErrorCode::InvObject => AddrNotAvailable,
            ErrorCode::NsupOper => Unsupported,
            ErrorCode::RsrcLocked => ConnectionRefused,
            ErrorCode::Tmo => TimedOut,
            ErrorCode::InvSetup | ErrorCode::InvParameter => InvalidInput,
            ErrorCode::ConnLost => BrokenPipe,
            _ => Other,
        },
        err,
    )
}

type BusyRegistry = Arc<Mutex<HashSet<String>>>;

/// Owns the set of open resources and constructs sessions from resource
/// names. Dropping the manager does not close instruments already handed
/// out; they unregister themselves when dropped.
#[derive(Debug, Default, Clone)]
pub struct ResourceManager {
    open_resources: BusyRegistry,
}

impl ResourceManager {
    pub fn new() -> Result<Self> {
        Ok(Self::default())
    }

    /// Enumerates resources reachable right now whose canonical name matches
    /// the query (`?` one character, `*` any run): GPIB listeners, VXI-11
    /// broadcast responders, mDNS-announced HiSLIP/VICP hosts, connected
    /// USBTMC devices and serial ports.
    pub fn find_res(&self, expr: &str) -> Result<Vec<ResourceName>> {
        let mut found: Vec<ResourceName> = Vec::new();

        #[cfg(feature = "gpib")]
        found.extend(gpib::list_resources());
        found.extend(discovery::list_vxi11_resources(Duration::from_secs(1)));
        #[cfg(feature = "mdns")]
        {
            found.extend(discovery::list_hislip_resources(Duration::from_secs(1)));
            found.extend(discovery::list_vicp_resources(Duration::from_secs(1)));
        }
        #[cfg(feature = "usb")]
        found.extend(usb::list_resources());
        #[cfg(feature = "serial")]
        found.extend(serial::list_resources());

        found.retain(|r| rname::matches_query(expr, &r.to_string()));
        found.dedup();
        Ok(found)
    }

    /// Opens a session to the named resource.
    ///
    /// `open_timeout` bounds connection establishment and any protocol
    /// handshake (VXI-11 `create_link`, the HiSLIP initialize sequence).
    /// With [`AccessMode::EXCLUSIVE_LOCK`] the device lock is acquired
    /// before the instrument is returned.
    pub fn open(
        &self,
        resource_name: &str,
        access_mode: AccessMode,
        open_timeout: Duration,
    ) -> Result<Instrument> {
        let parsed: ResourceName = resource_name.parse()?;
        let canonical = parsed.to_string();
        {
            let mut open_set = self.open_resources.lock().unwrap();
            if !open_set.insert(canonical.clone()) {
                return Err(Error::from(ErrorCode::RsrcBusy));
            }
        }

        let session = match self.build_session(&parsed, open_timeout) {
            Ok(session) => session,
            Err(e) => {
                self.open_resources.lock().unwrap().remove(&canonical);
                return Err(e);
            }
        };

        let mut instrument = Instrument {
            session,
            name: parsed,
            registry: Arc::clone(&self.open_resources),
            dead: None,
        };
        if access_mode.contains(AccessMode::EXCLUSIVE_LOCK) {
            if let Err(e) = instrument.lock(AccessMode::EXCLUSIVE_LOCK, open_timeout, None) {
                return Err(e);
            }
        }
        Ok(instrument)
    }

    fn build_session(
        &self,
        parsed: &ResourceName,
        open_timeout: Duration,
    ) -> Result<Box<dyn Session>> {
        match parsed {
            ResourceName::TcpipInstr { host, lan_device_name, .. } => {
                if parsed.is_hislip() {
                    Ok(Box::new(tcpip::HislipSession::open(
                        host,
                        lan_device_name,
                        open_timeout,
                    )?))
                } else {
                    match tcpip::Vxi11Session::open(host, lan_device_name, open_timeout) {
                        Ok(session) => Ok(Box::new(session)),
                        // No portmapper answering: the host may be a VICP
                        // instrument addressed with a TCPIP resource name.
                        Err(e) if e.code() == ErrorCode::RsrcNfound => {
                            log::debug!(
                                "no VXI-11 core channel on {}, probing the VICP port",
                                host
                            );
                            match tcpip::VicpSession::open(host, None, open_timeout) {
                                Ok(session) => Ok(Box::new(session)),
                                Err(_) => Err(e),
                            }
                        }
                        Err(e) => Err(e),
                    }
                }
            }
            ResourceName::TcpipSocket { host, port, .. } => Ok(Box::new(
                tcpip::SocketSession::open(host, *port, open_timeout)?,
            )),
            ResourceName::VicpInstr { host, .. } => Ok(Box::new(tcpip::VicpSession::open(
                host,
                None,
                open_timeout,
            )?)),
            #[cfg(feature = "usb")]
            ResourceName::UsbInstr {
                vendor_id,
                product_id,
                serial_number,
                interface,
                ..
            } => Ok(Box::new(usb::UsbTmcSession::open(
                *vendor_id,
                *product_id,
                serial_number,
                *interface,
                open_timeout,
            )?)),
            #[cfg(feature = "usb")]
            ResourceName::UsbRaw {
                vendor_id,
                product_id,
                serial_number,
                interface,
                ..
            } => Ok(Box::new(usb::UsbRawSession::open(
                *vendor_id,
                *product_id,
                serial_number,
                *interface,
                open_timeout,
            )?)),
            #[cfg(feature = "gpib")]
            ResourceName::GpibInstr {
                board,
                primary,
                secondary,
            } => Ok(Box::new(gpib::GpibSession::open(
                *board, *primary, *secondary,
            )?)),
            #[cfg(feature = "serial")]
            ResourceName::AsrlInstr { board } => {
                Ok(Box::new(serial::SerialSession::open(board, open_timeout)?))
            }
            #[allow(unreachable_patterns)]
            _ => Err(Error::from(ErrorCode::LibraryNfound)),
        }
    }
}

/// Answers attributes derivable from the resource name alone.
fn attr_from_name(kind: AttrKind, name: &ResourceName) -> Option<Attribute> {
    match (kind, name) {
        (AttrKind::RsrcName, _) => Some(Attribute::RsrcName(name.to_string())),
        (AttrKind::RsrcClass, _) => Some(Attribute::RsrcClass(name.resource_class().to_string())),
        (AttrKind::IntfType, _) => Some(Attribute::IntfType(match name {
            ResourceName::GpibInstr { .. } => InterfaceType::Gpib,
            ResourceName::AsrlInstr { .. } => InterfaceType::Asrl,
            ResourceName::UsbInstr { .. } | ResourceName::UsbRaw { .. } => InterfaceType::Usb,
            _ => InterfaceType::Tcpip,
        })),
        (AttrKind::IntfNum, ResourceName::AsrlInstr { board }) => {
            Some(Attribute::IntfNum(board.parse().unwrap_or(0)))
        }
        (AttrKind::IntfNum, ResourceName::TcpipInstr { board, .. })
        | (AttrKind::IntfNum, ResourceName::TcpipSocket { board, .. })
        | (AttrKind::IntfNum, ResourceName::VicpInstr { board, .. })
        | (AttrKind::IntfNum, ResourceName::UsbInstr { board, .. })
        | (AttrKind::IntfNum, ResourceName::UsbRaw { board, .. })
        | (AttrKind::IntfNum, ResourceName::GpibInstr { board, .. }) => {
            Some(Attribute::IntfNum(*board))
        }
        (AttrKind::GpibPrimaryAddr, ResourceName::GpibInstr { primary, .. }) => {
            Some(Attribute::GpibPrimaryAddr(*primary as u16))
        }
        (AttrKind::GpibSecondaryAddr, ResourceName::GpibInstr { secondary, .. }) => {
            Some(Attribute::GpibSecondaryAddr(secondary.map(|s| s as u16)))
        }
        (AttrKind::ManfId, ResourceName::UsbInstr { vendor_id, .. })
        | (AttrKind::ManfId, ResourceName::UsbRaw { vendor_id, .. }) => {
            Some(Attribute::ManfId(*vendor_id))
        }
        (AttrKind::ModelCode, ResourceName::UsbInstr { product_id, .. })
        | (AttrKind::ModelCode, ResourceName::UsbRaw { product_id, .. }) => {
            Some(Attribute::ModelCode(*product_id))
        }
        (AttrKind::UsbSerialNum, ResourceName::UsbInstr { serial_number, .. })
        | (AttrKind::UsbSerialNum, ResourceName::UsbRaw { serial_number, .. }) => {
            Some(Attribute::UsbSerialNum(serial_number.clone()))
        }
        (AttrKind::UsbIntfcNum, ResourceName::UsbInstr { interface, .. })
        | (AttrKind::UsbIntfcNum, ResourceName::UsbRaw { interface, .. }) => {
            Some(Attribute::UsbIntfcNum(*interface))
        }
        (AttrKind::TcpipAddr, ResourceName::TcpipInstr { host, .. })
        | (AttrKind::TcpipAddr, ResourceName::TcpipSocket { host, .. })
        | (AttrKind::TcpipAddr, ResourceName::VicpInstr { host, .. }) => {
            Some(Attribute::TcpipAddr(host.clone()))
        }
        (AttrKind::TcpipHostname, ResourceName::TcpipInstr { host, .. })
        | (AttrKind::TcpipHostname, ResourceName::TcpipSocket { host, .. })
        | (AttrKind::TcpipHostname, ResourceName::VicpInstr { host, .. }) => {
            Some(Attribute::TcpipHostname(host.clone()))
        }
        (AttrKind::TcpipDeviceName, ResourceName::TcpipInstr { lan_device_name, .. }) => {
            Some(Attribute::TcpipDeviceName(lan_device_name.clone()))
        }
        (AttrKind::TcpipPort, ResourceName::TcpipSocket { port, .. }) => {
            Some(Attribute::TcpipPort(*port))
        }
        (AttrKind::TcpipIsHislip, ResourceName::TcpipInstr { .. }) => {
            Some(Attribute::TcpipIsHislip(name.is_hislip()))
        }
        _ => None,
    }
}

/// Session to a specified resource.
pub struct Instrument {
    session: Box<dyn Session>,
    name: ResourceName,
    registry: BusyRegistry,
    dead: Option<ErrorCode>,
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument").field("name", &self.name).finish()
    }
}

impl Instrument {
    pub fn resource_name(&self) -> &ResourceName {
        &self.name
    }

    /// Once a transport error surfaced, every further call fails fast with
    /// the same code until the session is closed.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if matches!(e.code(), ErrorCode::ConnLost | ErrorCode::Io) {
                self.dead = Some(e.code());
            }
        }
        result
    }

    fn check_alive(&self) -> Result<()> {
        match self.dead {
            Some(code) => Err(Error::from(code)),
            None => Ok(()),
        }
    }

    /// Reads up to `count` bytes from the device.
    ///
    /// The completion code records which stop condition fired:
    /// [`CompletionCode::Success`] for the transport END indicator,
    /// [`CompletionCode::SuccessTermChar`] for a termination-character match
    /// and [`CompletionCode::SuccessMaxCnt`] when the byte count was reached
    /// first. A timeout error carries the bytes received so far, and the
    /// link stays usable.
    pub fn read(&mut self, count: usize) -> Result<(Vec<u8>, CompletionCode)> {
        self.check_alive()?;
        let result = self.session.read(count);
        self.guard(result)
    }

    /// Writes the payload to the device, honoring the send-end attribute on
    /// the final transport chunk.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check_alive()?;
        let result = self.session.write(data);
        self.guard(result)
    }

    /// Reads the service-request status byte.
    pub fn read_stb(&mut self) -> Result<u8> {
        self.check_alive()?;
        let result = self.session.read_stb();
        self.guard(result)
    }

    /// Clears the device input and output buffers.
    pub fn clear(&mut self) -> Result<()> {
        self.check_alive()?;
        let result = self.session.clear();
        self.guard(result)
    }

    /// Asserts a software trigger. Only [`TriggerProtocol::Default`] is
    /// valid for message-based resources.
    pub fn assert_trigger(&mut self, protocol: TriggerProtocol) -> Result<()> {
        self.check_alive()?;
        let result = self.session.assert_trigger(protocol);
        self.guard(result)
    }

    /// Establishes an access mode to the resource. For a shared lock the
    /// returned key can be passed to other sessions; an exclusive lock
    /// returns `None`.
    pub fn lock(
        &mut self,
        mode: AccessMode,
        timeout: Duration,
        requested_key: Option<&str>,
    ) -> Result<Option<AccessKey>> {
        self.check_alive()?;
        let result = self.session.lock(mode, timeout, requested_key);
        self.guard(result)
    }

    /// Relinquishes a lock for this resource.
    pub fn unlock(&mut self) -> Result<()> {
        self.check_alive()?;
        let result = self.session.unlock();
        self.guard(result)
    }

    /// Enables or disables service-request delivery where the transport has
    /// a channel for it (VXI-11 `device_enable_srq`, always-on for HiSLIP).
    pub fn enable_srq(&mut self, enable: bool) -> Result<()> {
        self.check_alive()?;
        let result = self.session.enable_srq(enable);
        self.guard(result)
    }

    /// Manually flushes the specified buffers.
    pub fn visa_flush(&mut self, mode: FlushMode) -> Result<()> {
        self.check_alive()?;
        let result = self.session.flush(mode);
        self.guard(result)
    }

    pub fn get_attr(&mut self, kind: AttrKind) -> Result<Attribute> {
        if let Some(attr) = attr_from_name(kind, &self.name) {
            return Ok(attr);
        }
        self.session.get_attr(kind)
    }

    pub fn set_attr(&mut self, attr: Attribute) -> Result<()> {
        if attr_from_name(attr.kind(), &self.name).is_some() {
            return Err(Error::from(ErrorCode::AttrReadonly));
        }
        self.session.set_attr(&attr)
    }

    /// Closes the session, releasing any server-side lock and returning the
    /// transport to the OS. Errors during teardown are reported; dropping
    /// the instrument performs the same cleanup but swallows them.
    pub fn close(mut self) -> Result<()> {
        let result = self.session.close();
        self.unregister();
        self.dead = Some(ErrorCode::InvObject);
        result
    }

    fn unregister(&mut self) {
        let canonical = self.name.to_string();
        if let Ok(mut open_set) = self.registry.lock() {
            open_set.remove(&canonical);
        }
    }
}

impl Drop for Instrument {
    fn drop(&mut self) {
        if self.dead != Some(ErrorCode::InvObject) {
            let _ = self.session.close();
            self.unregister();
        }
    }
}

impl io::Read for Instrument {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (data, _status) = Instrument::read(self, buf.len()).map_err(map_to_io_err)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl io::Write for Instrument {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Instrument::write(self, buf).map_err(map_to_io_err)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.visa_flush(FlushMode::IO_OUT_BUF).map_err(map_to_io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_level_attributes() {
        let name: ResourceName = "USB0::0x1AB1::0x0588::SN42::INSTR".parse().unwrap();
        assert_eq!(
            attr_from_name(AttrKind::ManfId, &name),
            Some(Attribute::ManfId(0x1AB1))
        );
        assert_eq!(
            attr_from_name(AttrKind::IntfType, &name),
            Some(Attribute::IntfType(InterfaceType::Usb))
        );
        assert_eq!(attr_from_name(AttrKind::TcpipKeepalive, &name), None);
    }

    #[test]
    fn open_rejects_malformed_names() {
        let rm = ResourceManager::new().unwrap();
        let err = rm
            .open("NOPE::0::INSTR", AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvRsrcName);
    }
}
