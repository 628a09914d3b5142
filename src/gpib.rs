//! GPIB sessions over the platform GPIB driver.
//!
//! The driver (linux-gpib's `libgpib`) is loaded at runtime so the crate
//! builds and runs on machines without it; opening a `GPIB::` resource then
//! fails with `VI_ERROR_LIBRARY_NFOUND`. Everything above the raw `ib*`
//! calls is written against the [`GpibDriver`] trait, which is what the
//! discovery logic and the tests use.

use std::time::Duration;

use crate::enums::assert::TriggerProtocol;
use crate::enums::attribute::{AttrKind, Attribute};
use crate::enums::status::{CompletionCode, ErrorCode};
use crate::rname::ResourceName;
use crate::session::{read_until, IoSettings, Session};
use crate::{Error, Result};

// ibsta status bits
const IBSTA_ERR: i32 = 0x8000;
const IBSTA_TIMO: i32 = 0x4000;
const IBSTA_END: i32 = 0x2000;

// NI secondary addresses ride on the bus as 0x60..0x7E
const SAD_OFFSET: i32 = 0x60;
const NO_SAD: i32 = 0;

// IbaPAD
const ASK_PAD: i32 = 0x01;

/// The discrete timeout steps the driver knows, in seconds. Requested
/// timeouts round up to the next step; index 0 disables the timeout.
const TIMETABLE: [f64; 18] = [
    0.0, 10e-6, 30e-6, 100e-6, 300e-6, 1e-3, 3e-3, 10e-3, 30e-3, 100e-3, 300e-3, 1.0, 3.0, 10.0,
    30.0, 100.0, 300.0, 1000.0,
];

fn timeout_code(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => 0,
        Some(t) => {
            let secs = t.as_secs_f64();
            TIMETABLE
                .iter()
                .position(|&step| step >= secs * 0.999 && step > 0.0)
                .unwrap_or(TIMETABLE.len() - 1) as i32
        }
    }
}

/// The narrow capability the sessions need from a GPIB driver.
pub(crate) trait GpibDriver: Send {
    fn open_device(&self, board: u16, pad: u8, sad: Option<u8>) -> Result<i32>;
    fn close_device(&self, ud: i32) -> Result<()>;
    /// Reads up to `max_len` bytes; the flag reports whether the END line
    /// accompanied the last byte.
    fn read(&self, ud: i32, max_len: usize) -> Result<(Vec<u8>, bool)>;
    /// Writes the block, asserting EOI on the last byte when `send_eoi`.
    fn write(&self, ud: i32, data: &[u8], send_eoi: bool) -> Result<usize>;
    fn clear(&self, ud: i32) -> Result<()>;
    fn trigger(&self, ud: i32) -> Result<()>;
    fn serial_poll(&self, ud: i32) -> Result<u8>;
    /// Is a device listening at `(pad, sad)` on this board?
    fn listener(&self, board: u16, pad: u8, sad: Option<u8>) -> Result<bool>;
    fn send_ifc(&self, board: u16) -> Result<()>;
    fn set_timeout(&self, ud: i32, timeout: Option<Duration>) -> Result<()>;
    /// The bus address of the board itself.
    fn board_address(&self, board: u16) -> Result<u8>;
}

/// `libgpib` loaded with `dlopen`. Status is read through the `Thread*`
/// accessors rather than the global `ibsta`/`ibcnt`.
struct LibGpib {
    lib: libloading::Library,
}

type IbDev = unsafe extern "C" fn(i32, i32, i32, i32, i32, i32) -> i32;
type IbOnl = unsafe extern "C" fn(i32, i32) -> i32;
type IbRd = unsafe extern "C" fn(i32, *mut std::ffi::c_void, std::ffi::c_long) -> i32;
type IbWrt = unsafe extern "C" fn(i32, *const std::ffi::c_void, std::ffi::c_long) -> i32;
type IbSimple = unsafe extern "C" fn(i32) -> i32;
type IbRsp = unsafe extern "C" fn(i32, *mut std::ffi::c_char) -> i32;
type IbLn = unsafe extern "C" fn(i32, i32, i32, *mut std::ffi::c_short) -> i32;
type IbTwo = unsafe extern "C" fn(i32, i32) -> i32;
type IbAsk = unsafe extern "C" fn(i32, i32, *mut i32) -> i32;
type ThreadCnt = unsafe extern "C" fn() -> std::ffi::c_long;

impl LibGpib {
    fn load() -> Result<Self> {
        const CANDIDATES: &[&str] = &["libgpib.so.0", "libgpib.so", "gpib-32.dll"];
        for name in CANDIDATES {
            match unsafe { libloading::Library::new(name) } {
                Ok(lib) => return Ok(Self { lib }),
                Err(e) => log::debug!("loading {} failed: {}", name, e),
            }
        }
        Err(Error::from(ErrorCode::LibraryNfound))
    }

    fn sym<T>(&self, name: &[u8]) -> Result<libloading::Symbol<'_, T>> {
        unsafe { self.lib.get(name) }.map_err(|e| {
            log::warn!("GPIB driver is missing a symbol: {}", e);
            Error::from(ErrorCode::LibraryNfound)
        })
    }

    fn transferred(&self) -> usize {
        match self.sym::<ThreadCnt>(b"ThreadIbcnt\0") {
            Ok(thread_ibcnt) => unsafe { thread_ibcnt() }.max(0) as usize,
            Err(_) => 0,
        }
    }

    fn check(&self, ibsta: i32) -> Result<i32> {
        if ibsta & IBSTA_ERR != 0 {
            if ibsta & IBSTA_TIMO != 0 {
                return Err(Error::from(ErrorCode::Tmo));
            }
            return Err(Error::from(ErrorCode::Io));
        }
        Ok(ibsta)
    }
}

fn sad_arg(sad: Option<u8>) -> i32 {
    match sad {
        Some(sad) => SAD_OFFSET + sad as i32,
        None => NO_SAD,
    }
}

impl GpibDriver for LibGpib {
    fn open_device(&self, board: u16, pad: u8, sad: Option<u8>) -> Result<i32> {
        let ibdev = self.sym::<IbDev>(b"ibdev\0")?;
        let ud = unsafe {
            ibdev(
                board as i32,
                pad as i32,
                sad_arg(sad),
                timeout_code(Some(Duration::from_secs(10))),
                1, // assert EOI with the last byte
                0, // no driver-side end-of-string matching
            )
        };
        if ud < 0 {
            return Err(Error::from(ErrorCode::RsrcNfound));
        }
        Ok(ud)
    }

    fn close_device(&self, ud: i32) -> Result<()> {
        let ibonl = self.sym::<IbOnl>(b"ibonl\0")?;
        self.check(unsafe { ibonl(ud, 0) }).map(|_| ())
    }

    fn read(&self, ud: i32, max_len: usize) -> Result<(Vec<u8>, bool)> {
        let ibrd = self.sym::<IbRd>(b"ibrd\0")?;
        let mut buf = vec![0u8; max_len.max(1)];
        let ibsta = unsafe { ibrd(ud, buf.as_mut_ptr() as *mut _, buf.len() as _) };
        let end = ibsta & IBSTA_END != 0;
        self.check(ibsta)?;
        buf.truncate(self.transferred().min(max_len));
        Ok((buf, end))
    }

    fn write(&self, ud: i32, data: &[u8], send_eoi: bool) -> Result<usize> {
        let ibeot = self.sym::<IbTwo>(b"ibeot\0")?;
        self.check(unsafe { ibeot(ud, send_eoi as i32) })?;
        let ibwrt = self.sym::<IbWrt>(b"ibwrt\0")?;
        self.check(unsafe { ibwrt(ud, data.as_ptr() as *const _, data.len() as _) })?;
        Ok(self.transferred().min(data.len()))
    }

    fn clear(&self, ud: i32) -> Result<()> {
        let ibclr = self.sym::<IbSimple>(b"ibclr\0")?;
        self.check(unsafe { ibclr(ud) }).map(|_| ())
    }

    fn trigger(&self, ud: i32) -> Result<()> {
        let ibtrg = self.sym::<IbSimple>(b"ibtrg\0")?;
        self.check(unsafe { ibtrg(ud) }).map(|_| ())
    }

    fn serial_poll(&self, ud: i32) -> Result<u8> {
        let ibrsp = self.sym::<IbRsp>(b"ibrsp\0")?;
        let mut stb: std::ffi::c_char = 0;
        self.check(unsafe { ibrsp(ud, &mut stb) })?;
        Ok(stb as u8)
    }

    fn listener(&self, board: u16, pad: u8, sad: Option<u8>) -> Result<bool> {
        let ibln = self.sym::<IbLn>(b"ibln\0")?;
        let mut found: std::ffi::c_short = 0;
        self.check(unsafe { ibln(board as i32, pad as i32, sad_arg(sad), &mut found) })?;
        Ok(found != 0)
    }

    fn send_ifc(&self, board: u16) -> Result<()> {
        let ibsic = self.sym::<IbSimple>(b"ibsic\0")?;
        self.check(unsafe { ibsic(board as i32) }).map(|_| ())
    }

    fn set_timeout(&self, ud: i32, timeout: Option<Duration>) -> Result<()> {
        let ibtmo = self.sym::<IbTwo>(b"ibtmo\0")?;
        self.check(unsafe { ibtmo(ud, timeout_code(timeout)) })
            .map(|_| ())
    }

    fn board_address(&self, board: u16) -> Result<u8> {
        let ibask = self.sym::<IbAsk>(b"ibask\0")?;
        let mut pad: i32 = 0;
        self.check(unsafe { ibask(board as i32, ASK_PAD, &mut pad) })?;
        Ok(pad as u8)
    }
}

/// Walks one board for connected devices.
///
/// Primary addresses that already answer as listeners are reported bare and
/// their secondaries are left alone: most instruments ignore secondary
/// addressing and an unexpected secondary probe can upset them. Only a
/// silent primary gets its 31 secondary addresses probed, which is how VXI
/// modules behind a command module show up.
fn find_listeners(driver: &dyn GpibDriver, board: u16) -> Vec<ResourceName> {
    let mut found = Vec::new();
    let board_pad = match driver.board_address(board) {
        Ok(pad) => pad,
        Err(_) => return found,
    };
    for pad in 0..=30u8 {
        if pad == board_pad {
            continue;
        }
        match driver.listener(board, pad, None) {
            Ok(true) => {
                found.push(ResourceName::GpibInstr {
                    board,
                    primary: pad,
                    secondary: None,
                });
            }
            Ok(false) => {
                for sad in 0..=30u8 {
                    if let Ok(true) = driver.listener(board, pad, Some(sad)) {
                        found.push(ResourceName::GpibInstr {
                            board,
                            primary: pad,
                            secondary: Some(sad),
                        });
                    }
                }
            }
            Err(e) => {
                log::debug!("board {} listener probe at {} failed: {}", board, pad, e);
                break;
            }
        }
    }
    found
}

/// Enumerates listeners on every reachable board.
pub fn list_resources() -> Vec<ResourceName> {
    let driver = match LibGpib::load() {
        Ok(driver) => driver,
        Err(_) => return Vec::new(),
    };
    let mut found = Vec::new();
    for board in 0..16u16 {
        found.extend(find_listeners(&driver, board));
    }
    found
}

/// A `GPIB::primary[::secondary]::INSTR` session.
pub struct GpibSession {
    driver: Box<dyn GpibDriver>,
    ud: i32,
    board: u16,
    io: IoSettings,
}

impl GpibSession {
    pub fn open(board: u16, primary: u8, secondary: Option<u8>) -> Result<Self> {
        let driver = Box::new(LibGpib::load()?);
        Self::with_driver(driver, board, primary, secondary)
    }

    pub(crate) fn with_driver(
        driver: Box<dyn GpibDriver>,
        board: u16,
        primary: u8,
        secondary: Option<u8>,
    ) -> Result<Self> {
        let ud = driver.open_device(board, primary, secondary)?;
        let io = IoSettings::default();
        driver.set_timeout(ud, io.timeout)?;
        Ok(Self {
            driver,
            ud,
            board,
            io,
        })
    }

    /// Pulses the interface clear line for the whole bus.
    pub fn send_ifc(&mut self) -> Result<()> {
        self.driver.send_ifc(self.board)
    }
}

impl Session for GpibSession {
    fn read(&mut self, count: usize) -> Result<(Vec<u8>, CompletionCode)> {
        let driver = &self.driver;
        let ud = self.ud;
        read_until(|| driver.read(ud, count), count, &self.io)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.driver.write(self.ud, data, self.io.send_end)
    }

    fn clear(&mut self) -> Result<()> {
        self.driver.clear(self.ud)
    }

    fn read_stb(&mut self) -> Result<u8> {
        self.driver.serial_poll(self.ud)
    }

    fn assert_trigger(&mut self, protocol: TriggerProtocol) -> Result<()> {
        if protocol != TriggerProtocol::Default {
            return Err(Error::from(ErrorCode::NsupOper));
        }
        self.driver.trigger(self.ud)
    }

    fn get_attr(&mut self, kind: AttrKind) -> Result<Attribute> {
        self.io
            .get_attr(kind)
            .ok_or_else(|| Error::from(ErrorCode::NsupAttr))
    }

    fn set_attr(&mut self, attr: &Attribute) -> Result<()> {
        if self.io.set_attr(attr) {
            if attr.kind() == AttrKind::TmoValue {
                self.driver.set_timeout(self.ud, self.io.timeout)?;
            }
            return Ok(());
        }
        Err(Error::from(ErrorCode::NsupAttr))
    }

    fn close(&mut self) -> Result<()> {
        self.driver.close_device(self.ud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Scripted bus: a set of listening addresses and canned read data. The
    /// state is shared so a test keeps visibility after handing the driver
    /// to a session.
    #[derive(Clone, Default)]
    struct MockBus {
        inner: Arc<MockBusState>,
    }

    #[derive(Default)]
    struct MockBusState {
        listeners: HashSet<(u8, Option<u8>)>,
        probes: Mutex<Vec<(u8, Option<u8>)>>,
        read_data: Mutex<Vec<(Vec<u8>, bool)>>,
        written: Mutex<Vec<(Vec<u8>, bool)>>,
    }

    impl MockBus {
        fn new(listeners: &[(u8, Option<u8>)]) -> Self {
            Self {
                inner: Arc::new(MockBusState {
                    listeners: listeners.iter().copied().collect(),
                    ..MockBusState::default()
                }),
            }
        }
    }

    impl GpibDriver for MockBus {
        fn open_device(&self, _board: u16, _pad: u8, _sad: Option<u8>) -> Result<i32> {
            Ok(7)
        }
        fn close_device(&self, _ud: i32) -> Result<()> {
            Ok(())
        }
        fn read(&self, _ud: i32, _max_len: usize) -> Result<(Vec<u8>, bool)> {
            self.inner
                .read_data
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| Error::from(ErrorCode::Tmo))
        }
        fn write(&self, _ud: i32, data: &[u8], send_eoi: bool) -> Result<usize> {
            self.inner
                .written
                .lock()
                .unwrap()
                .push((data.to_vec(), send_eoi));
            Ok(data.len())
        }
        fn clear(&self, _ud: i32) -> Result<()> {
            Ok(())
        }
        fn trigger(&self, _ud: i32) -> Result<()> {
            Ok(())
        }
        fn serial_poll(&self, _ud: i32) -> Result<u8> {
            Ok(0x42)
        }
        fn listener(&self, _board: u16, pad: u8, sad: Option<u8>) -> Result<bool> {
            self.inner.probes.lock().unwrap().push((pad, sad));
            Ok(self.inner.listeners.contains(&(pad, sad)))
        }
        fn send_ifc(&self, _board: u16) -> Result<()> {
            Ok(())
        }
        fn set_timeout(&self, _ud: i32, _timeout: Option<Duration>) -> Result<()> {
            Ok(())
        }
        fn board_address(&self, _board: u16) -> Result<u8> {
            Ok(0)
        }
    }

    #[test]
    fn secondary_probing_only_behind_silent_primaries() {
        // command module at primary 9 exposes secondaries 1 and 2; a plain
        // instrument answers at primary 10
        let bus = MockBus::new(&[(9, Some(1)), (9, Some(2)), (10, None)]);
        let found = find_listeners(&bus, 0);
        let names: Vec<String> = found.iter().map(|r| r.to_string()).collect();
        assert!(names.contains(&"GPIB0::9::1::INSTR".to_string()));
        assert!(names.contains(&"GPIB0::9::2::INSTR".to_string()));
        assert!(names.contains(&"GPIB0::10::INSTR".to_string()));
        // no secondary entries under a listening primary
        assert!(!names.iter().any(|n| n.starts_with("GPIB0::10::") && n.matches("::").count() == 3));

        // the listening primary must not have had its secondaries probed
        let probes = bus.inner.probes.lock().unwrap();
        assert!(!probes.iter().any(|&(pad, sad)| pad == 10 && sad.is_some()));
        // the silent primary 9 got the full secondary sweep
        assert_eq!(probes.iter().filter(|&&(pad, sad)| pad == 9 && sad.is_some()).count(), 31);
    }

    #[test]
    fn board_own_address_is_skipped() {
        let bus = MockBus::new(&[(0, None)]);
        let found = find_listeners(&bus, 0);
        assert!(found.is_empty());
    }

    #[test]
    fn session_read_respects_term_char() {
        let bus = MockBus::new(&[]);
        bus.inner
            .read_data
            .lock()
            .unwrap()
            .push((b"1.25E-3\nrest".to_vec(), false));
        let mut session = GpibSession::with_driver(Box::new(bus), 0, 9, None).unwrap();
        session.set_attr(&Attribute::TermcharEn(true)).unwrap();
        let (data, status) = session.read(64).unwrap();
        assert_eq!(data, b"1.25E-3\n");
        assert_eq!(status, CompletionCode::SuccessTermChar);
    }

    #[test]
    fn session_write_asserts_eoi_per_send_end() {
        let bus = MockBus::new(&[]);
        let mut session =
            GpibSession::with_driver(Box::new(bus.clone()), 0, 9, None).unwrap();
        session.write(b"*RST\n").unwrap();
        session.set_attr(&Attribute::SendEndEn(false)).unwrap();
        session.write(b"*OPC?\n").unwrap();

        let written = bus.inner.written.lock().unwrap();
        assert_eq!(written[0], (b"*RST\n".to_vec(), true));
        assert_eq!(written[1], (b"*OPC?\n".to_vec(), false));
    }

    #[test]
    fn serial_poll_returns_status_byte() {
        let bus = MockBus::new(&[]);
        let mut session = GpibSession::with_driver(Box::new(bus), 0, 9, None).unwrap();
        assert_eq!(session.read_stb().unwrap(), 0x42);
    }

    #[test]
    fn timeout_codes_round_up() {
        assert_eq!(timeout_code(None), 0);
        assert_eq!(timeout_code(Some(Duration::from_millis(1))), 5);
        assert_eq!(timeout_code(Some(Duration::from_millis(2))), 6);
        assert_eq!(timeout_code(Some(Duration::from_secs(10))), 13);
        assert_eq!(timeout_code(Some(Duration::from_secs(5000))), 17);
    }
}
