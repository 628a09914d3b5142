//! Serial (`ASRL`) sessions over the `serialport` crate.
//!
//! Serial framing is thin: no END indicator exists on the wire, so reads
//! terminate on the termination character, the byte count or the timeout.
//! On writes the only transport-level concern is the data-bits mask.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, SerialPort};

use crate::enums::assert::TriggerProtocol;
use crate::enums::attribute::{AttrKind, Attribute, IoProtocol};
use crate::enums::status::{CompletionCode, ErrorCode};
use crate::flags::FlushMode;
use crate::rname::ResourceName;
use crate::session::{read_until, IoSettings, Session};
use crate::{io_to_visa_err, Error, Result};

/// Stand-in for an infinite timeout; the port layer needs a concrete value.
const NEVER: Duration = Duration::from_millis(u32::MAX as u64);

fn device_path(board: &str) -> String {
    if board.chars().all(|c| c.is_ascii_digit()) {
        if cfg!(windows) {
            format!("COM{}", board)
        } else {
            format!("/dev/ttyS{}", board)
        }
    } else {
        board.to_string()
    }
}

/// Clips payload bytes to the configured number of data bits the way the
/// wire will. With fewer than 8 data bits the highest bit is reserved for
/// the end marker: held at 0 on every byte, and raised on the final byte
/// when send-end is enabled.
fn mask_data_bits(data: &[u8], data_bits: u8, send_end: bool) -> Vec<u8> {
    if data_bits >= 8 {
        return data.to_vec();
    }
    let payload_mask = ((1u8 << data_bits) - 1) >> 1;
    let mut out: Vec<u8> = data.iter().map(|b| b & payload_mask).collect();
    if send_end {
        let end_bit = 1u8 << (data_bits - 1);
        if let Some(last) = out.last_mut() {
            *last |= end_bit;
        }
    }
    out
}

/// Enumerates the serial ports present on the system.
pub fn list_resources() -> Vec<ResourceName> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| ResourceName::AsrlInstr {
                board: info.port_name,
            })
            .collect(),
        Err(e) => {
            log::debug!("serial port enumeration failed: {}", e);
            Vec::new()
        }
    }
}

/// An `ASRL` session.
pub struct SerialSession {
    port: Box<dyn SerialPort>,
    io: IoSettings,
    io_prot: IoProtocol,
    data_bits: u8,
}

impl SerialSession {
    pub fn open(board: &str, _open_timeout: Duration) -> Result<Self> {
        let path = device_path(board);
        let io = IoSettings::default();
        let port = serialport::new(path.as_str(), 9600)
            .timeout(io.timeout.unwrap_or(NEVER))
            .open()
            .map_err(|e| {
                log::debug!("opening serial port {} failed: {}", path, e);
                Error::from(ErrorCode::RsrcNfound)
            })?;
        Ok(Self {
            port,
            io,
            io_prot: IoProtocol::Normal,
            data_bits: 8,
        })
    }
}

impl Session for SerialSession {
    fn read(&mut self, count: usize) -> Result<(Vec<u8>, CompletionCode)> {
        self.port
            .set_timeout(self.io.timeout.unwrap_or(NEVER))
            .map_err(|e| {
                log::debug!("setting serial timeout failed: {}", e);
                Error::from(ErrorCode::Io)
            })?;
        let port = &mut self.port;
        read_until(
            || {
                let mut chunk = vec![0u8; count.max(1).min(4096)];
                match port.read(&mut chunk) {
                    Ok(n) => {
                        chunk.truncate(n);
                        Ok((chunk, false))
                    }
                    Err(e) => Err(io_to_visa_err(&e)),
                }
            },
            count,
            &self.io,
        )
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let masked = mask_data_bits(data, self.data_bits, self.io.send_end);
        self.port
            .write_all(&masked)
            .map_err(|e| io_to_visa_err(&e))?;
        Ok(data.len())
    }

    fn clear(&mut self) -> Result<()> {
        self.port
            .clear(ClearBuffer::All)
            .map_err(|_| Error::from(ErrorCode::Io))
    }

    fn flush(&mut self, mode: FlushMode) -> Result<()> {
        if mode.intersects(
            FlushMode::READ_BUF
                | FlushMode::READ_BUF_DISCARD
                | FlushMode::IO_IN_BUF
                | FlushMode::IO_IN_BUF_DISCARD,
        ) {
            self.port
                .clear(ClearBuffer::Input)
                .map_err(|_| Error::from(ErrorCode::Io))?;
        }
        if mode.intersects(FlushMode::WRITE_BUF_DISCARD | FlushMode::IO_OUT_BUF_DISCARD) {
            self.port
                .clear(ClearBuffer::Output)
                .map_err(|_| Error::from(ErrorCode::Io))?;
        }
        if mode.intersects(FlushMode::WRITE_BUF | FlushMode::IO_OUT_BUF) {
            self.port.flush().map_err(|e| io_to_visa_err(&e))?;
        }
        Ok(())
    }

    fn assert_trigger(&mut self, protocol: TriggerProtocol) -> Result<()> {
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
            AttrKind::AsrlBaud => Ok(Attribute::AsrlBaud(
                self.port.baud_rate().map_err(|_| Error::from(ErrorCode::Io))?,
            )),
            AttrKind::AsrlDataBits => Ok(Attribute::AsrlDataBits(self.data_bits)),
            AttrKind::IoProt => Ok(Attribute::IoProt(self.io_prot)),
            _ => Err(Error::from(ErrorCode::NsupAttr)),
        }
    }

    fn set_attr(&mut self, attr: &Attribute) -> Result<()> {
        if self.io.set_attr(attr) {
            return Ok(());
        }
        match *attr {
            Attribute::AsrlBaud(baud) => self
                .port
                .set_baud_rate(baud)
                .map_err(|_| Error::from(ErrorCode::NsupAttrState)),
            Attribute::AsrlDataBits(bits) => {
                let setting = match bits {
                    5 => DataBits::Five,
                    6 => DataBits::Six,
                    7 => DataBits::Seven,
                    8 => DataBits::Eight,
                    _ => return Err(Error::from(ErrorCode::NsupAttrState)),
                };
                self.port
                    .set_data_bits(setting)
                    .map_err(|_| Error::from(ErrorCode::NsupAttrState))?;
                self.data_bits = bits;
                Ok(())
            }
            Attribute::IoProt(prot) => {
                self.io_prot = prot;
                Ok(())
            }
            _ => Err(Error::from(ErrorCode::NsupAttr)),
        }
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_boards_map_to_platform_devices() {
        if cfg!(windows) {
            assert_eq!(device_path("3"), "COM3");
        } else {
            assert_eq!(device_path("3"), "/dev/ttyS3");
        }
        assert_eq!(device_path("/dev/ttyUSB0"), "/dev/ttyUSB0");
    }

    #[test]
    fn eight_bit_data_passes_through() {
        assert_eq!(mask_data_bits(b"\xFFabc", 8, true), b"\xFFabc");
    }

    #[test]
    fn seven_bit_mask_reserves_the_top_bit() {
        let out = mask_data_bits(&[0xFF, 0xFF], 7, false);
        assert_eq!(out, vec![0x3F, 0x3F]);
        let ended = mask_data_bits(&[0xFF, 0xFF], 7, true);
        assert_eq!(ended, vec![0x3F, 0x3F | 0x40]);
    }
}
