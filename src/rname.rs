//! Resource name parsing and canonicalization.
//!
//! A VISA resource name selects an interface type, an address on that
//! interface and a resource class, e.g. `TCPIP0::192.0.2.10::inst0::INSTR`
//! or `USB0::0x1AB1::0x0588::DS1K00005888::0::INSTR`. Keywords are matched
//! case-insensitively; [`Display`] renders the canonical form, which parses
//! back to the same value.

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::enums::status::ErrorCode;
use crate::{Error, Result};

/// Default LAN device name for `TCPIP::host::INSTR` resources.
pub const DEFAULT_LAN_DEVICE_NAME: &str = "inst0";

/// A parsed VISA resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceName {
    /// `TCPIP[board]::host[::lan_device_name]::INSTR`
    ///
    /// Covers both VXI-11 and HiSLIP instruments; HiSLIP is selected when
    /// the LAN device name starts with `hislip`. The LAN device name may
    /// carry an explicit port as `name,port`.
    TcpipInstr {
        board: u16,
        host: String,
        lan_device_name: String,
    },
    /// `TCPIP[board]::host::port::SOCKET`
    TcpipSocket { board: u16, host: String, port: u16 },
    /// `VICP[board]::host::INSTR`
    VicpInstr { board: u16, host: String },
    /// `USB[board]::vendor_id::product_id::serial[::interface]::INSTR`
    UsbInstr {
        board: u16,
        vendor_id: u16,
        product_id: u16,
        serial_number: String,
        interface: u16,
    },
    /// `USB[board]::vendor_id::product_id::serial[::interface]::RAW`
    UsbRaw {
        board: u16,
        vendor_id: u16,
        product_id: u16,
        serial_number: String,
        interface: u16,
    },
    /// `GPIB[board]::primary[::secondary]::INSTR`, secondary in `0..=30`.
    GpibInstr {
        board: u16,
        primary: u8,
        secondary: Option<u8>,
    },
    /// `ASRL<board>::INSTR` where `board` names an OS serial port, either a
    /// plain index (`ASRL1`) or a device path (`ASRL/dev/ttyUSB0`).
    AsrlInstr { board: String },
}

impl ResourceName {
    /// True for `TCPIP::INSTR` resources whose LAN device name selects HiSLIP.
    pub fn is_hislip(&self) -> bool {
        matches!(self, ResourceName::TcpipInstr { lan_device_name, .. }
            if lan_device_name.to_ascii_lowercase().starts_with("hislip"))
    }

    /// The resource class suffix (`INSTR`, `SOCKET` or `RAW`).
    pub fn resource_class(&self) -> &'static str {
        match self {
            ResourceName::TcpipSocket { .. } => "SOCKET",
            ResourceName::UsbRaw { .. } => "RAW",
            _ => "INSTR",
        }
    }

    /// The canonical string form.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

fn invalid() -> Error {
    Error::from(ErrorCode::InvRsrcName)
}

/// Splits an interface header such as `TCPIP0` into keyword and board suffix.
fn split_header(head: &str) -> (String, &str) {
    let len = head.chars().take_while(|c| c.is_ascii_alphabetic()).count();
    (head[..len].to_ascii_uppercase(), &head[len..])
}

fn parse_board(suffix: &str) -> Result<u16> {
    if suffix.is_empty() {
        return Ok(0);
    }
    suffix.parse().map_err(|_| invalid())
}

fn parse_usb_id(field: &str) -> Result<u16> {
    let field = field.trim();
    let lower = field.to_ascii_lowercase();
    let parsed = if let Some(hex) = lower.strip_prefix("0x") {
        u16::from_str_radix(hex, 16)
    } else {
        field.parse()
    };
    parsed.map_err(|_| invalid())
}

impl FromStr for ResourceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split("::").collect();
        if parts.len() < 2 {
            return Err(invalid());
        }
        let (keyword, board_suffix) = split_header(parts[0]);
        let class = parts[parts.len() - 1].to_ascii_uppercase();
        let body = &parts[1..parts.len() - 1];

        match (keyword.as_str(), class.as_str()) {
            ("TCPIP", "INSTR") => {
                let board = parse_board(board_suffix)?;
                match body {
                    [host] => Ok(ResourceName::TcpipInstr {
                        board,
                        host: host.to_string(),
                        lan_device_name: DEFAULT_LAN_DEVICE_NAME.to_string(),
                    }),
                    [host, lan] => Ok(ResourceName::TcpipInstr {
                        board,
                        host: host.to_string(),
                        lan_device_name: lan.to_string(),
                    }),
                    _ => Err(invalid()),
                }
            }
            ("TCPIP", "SOCKET") => {
                let board = parse_board(board_suffix)?;
                match body {
                    [host, port] => Ok(ResourceName::TcpipSocket {
                        board,
                        host: host.to_string(),
                        port: port.parse().map_err(|_| invalid())?,
                    }),
                    _ => Err(invalid()),
                }
            }
            ("VICP", "INSTR") => {
                let board = parse_board(board_suffix)?;
                match body {
                    [host] => Ok(ResourceName::VicpInstr {
                        board,
                        host: host.to_string(),
                    }),
                    _ => Err(invalid()),
                }
            }
            ("USB", "INSTR") | ("USB", "RAW") => {
                let board = parse_board(board_suffix)?;
                let (vendor_id, product_id, serial_number, interface) = match body {
                    [vid, pid, serial] => {
                        (parse_usb_id(vid)?, parse_usb_id(pid)?, serial.to_string(), 0)
                    }
                    [vid, pid, serial, iface] => (
                        parse_usb_id(vid)?,
                        parse_usb_id(pid)?,
                        serial.to_string(),
                        iface.parse().map_err(|_| invalid())?,
                    ),
                    _ => return Err(invalid()),
                };
                if class == "RAW" {
                    Ok(ResourceName::UsbRaw {
                        board,
                        vendor_id,
                        product_id,
                        serial_number,
                        interface,
                    })
                } else {
                    Ok(ResourceName::UsbInstr {
                        board,
                        vendor_id,
                        product_id,
                        serial_number,
                        interface,
                    })
                }
            }
            ("GPIB", "INSTR") => {
                let board = parse_board(board_suffix)?;
                let parse_addr = |field: &str, max: u8| -> Result<u8> {
                    let addr: u8 = field.parse().map_err(|_| invalid())?;
                    if addr > max {
                        return Err(invalid());
                    }
                    Ok(addr)
                };
                match body {
                    [primary] => Ok(ResourceName::GpibInstr {
                        board,
                        primary: parse_addr(primary, 30)?,
                        secondary: None,
                    }),
                    [primary, secondary] => Ok(ResourceName::GpibInstr {
                        board,
                        primary: parse_addr(primary, 30)?,
                        secondary: Some(parse_addr(secondary, 30)?),
                    }),
                    _ => Err(invalid()),
                }
            }
            ("ASRL", "INSTR") => {
                if !body.is_empty() {
                    return Err(invalid());
                }
                if board_suffix.is_empty() {
                    return Err(invalid());
                }
                Ok(ResourceName::AsrlInstr {
                    board: board_suffix.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceName::TcpipInstr {
                board,
                host,
                lan_device_name,
            } => write!(f, "TCPIP{}::{}::{}::INSTR", board, host, lan_device_name),
            ResourceName::TcpipSocket { board, host, port } => {
                write!(f, "TCPIP{}::{}::{}::SOCKET", board, host, port)
            }
            ResourceName::VicpInstr { board, host } => {
                write!(f, "VICP{}::{}::INSTR", board, host)
            }
            ResourceName::UsbInstr {
                board,
                vendor_id,
                product_id,
                serial_number,
                interface,
            } => write!(
                f,
                "USB{}::0x{:04X}::0x{:04X}::{}::{}::INSTR",
                board, vendor_id, product_id, serial_number, interface
            ),
            ResourceName::UsbRaw {
                board,
                vendor_id,
                product_id,
                serial_number,
                interface,
            } => write!(
                f,
                "USB{}::0x{:04X}::0x{:04X}::{}::{}::RAW",
                board, vendor_id, product_id, serial_number, interface
            ),
            ResourceName::GpibInstr {
                board,
                primary,
                secondary,
            } => match secondary {
                Some(sad) => write!(f, "GPIB{}::{}::{}::INSTR", board, primary, sad),
                None => write!(f, "GPIB{}::{}::INSTR", board, primary),
            },
            ResourceName::AsrlInstr { board } => write!(f, "ASRL{}::INSTR", board),
        }
    }
}

/// Case-insensitive match of a VISA resource query against a candidate name.
///
/// `?` matches exactly one character and `*` any run of characters, per the
/// `viFindRsrc` expression subset actually used in the wild.
pub fn matches_query(pattern: &str, candidate: &str) -> bool {
    fn inner(p: &[u8], c: &[u8]) -> bool {
        match (p.first(), c.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], c) || (!c.is_empty() && inner(p, &c[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &c[1..]),
            (Some(a), Some(b)) => {
                a.eq_ignore_ascii_case(b) && inner(&p[1..], &c[1..])
            }
            _ => false,
        }
    }
    inner(pattern.as_bytes(), candidate.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(s: &str) -> ResourceName {
        let parsed: ResourceName = s.parse().unwrap();
        let canonical = parsed.to_string();
        let reparsed: ResourceName = canonical.parse().unwrap();
        assert_eq!(parsed, reparsed, "canonical form must reparse: {}", canonical);
        parsed
    }

    #[test]
    fn tcpip_instr_defaults() {
        let r = roundtrip("TCPIP::192.0.2.10::INSTR");
        assert_eq!(
            r,
            ResourceName::TcpipInstr {
                board: 0,
                host: "192.0.2.10".into(),
                lan_device_name: "inst0".into(),
            }
        );
        assert!(!r.is_hislip());
    }

    #[test]
    fn tcpip_instr_hislip() {
        let r = roundtrip("tcpip0::scope.local::hislip0::instr");
        assert!(r.is_hislip());
    }

    #[test]
    fn tcpip_instr_hislip_with_port() {
        let r = roundtrip("TCPIP::10.0.0.2::hislip0,5025::INSTR");
        assert!(r.is_hislip());
    }

    #[test]
    fn tcpip_socket() {
        let r = roundtrip("TCPIP0::192.0.2.7::5025::SOCKET");
        assert_eq!(
            r,
            ResourceName::TcpipSocket {
                board: 0,
                host: "192.0.2.7".into(),
                port: 5025,
            }
        );
    }

    #[test]
    fn vicp_instr() {
        roundtrip("VICP::192.0.2.9::INSTR");
    }

    #[test]
    fn usb_instr_hex_and_decimal_ids() {
        let r = roundtrip("USB0::0x1AB1::0x0588::DS1K00005888::INSTR");
        assert_eq!(
            r,
            ResourceName::UsbInstr {
                board: 0,
                vendor_id: 0x1AB1,
                product_id: 0x0588,
                serial_number: "DS1K00005888".into(),
                interface: 0,
            }
        );
        let d = roundtrip("USB::6833::1416::DS1K00005888::1::RAW");
        assert_eq!(
            d,
            ResourceName::UsbRaw {
                board: 0,
                vendor_id: 0x1AB1,
                product_id: 0x0588,
                serial_number: "DS1K00005888".into(),
                interface: 1,
            }
        );
    }

    #[test]
    fn gpib_with_and_without_secondary() {
        let r = roundtrip("GPIB0::9::INSTR");
        assert_eq!(
            r,
            ResourceName::GpibInstr {
                board: 0,
                primary: 9,
                secondary: None,
            }
        );
        let s = roundtrip("GPIB0::9::1::INSTR");
        assert_eq!(
            s,
            ResourceName::GpibInstr {
                board: 0,
                primary: 9,
                secondary: Some(1),
            }
        );
    }

    #[test]
    fn gpib_secondary_out_of_range() {
        assert!("GPIB0::9::31::INSTR".parse::<ResourceName>().is_err());
        assert!("GPIB0::31::INSTR".parse::<ResourceName>().is_err());
    }

    #[test]
    fn asrl_index_and_path() {
        roundtrip("ASRL1::INSTR");
        roundtrip("ASRL/dev/ttyUSB0::INSTR");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<ResourceName>().is_err());
        assert!("TCPIP0".parse::<ResourceName>().is_err());
        assert!("FOO0::1::INSTR".parse::<ResourceName>().is_err());
        assert!("TCPIP0::host::port::extra::SOCKET".parse::<ResourceName>().is_err());
    }

    #[test]
    fn query_matching() {
        assert!(matches_query("?*::INSTR", "GPIB0::9::INSTR"));
        assert!(matches_query("GPIB?*::INSTR", "gpib0::9::instr"));
        assert!(!matches_query("USB?*::INSTR", "GPIB0::9::INSTR"));
        assert!(matches_query("?*", "TCPIP0::a::inst0::INSTR"));
        assert!(matches_query("TCPIP?*SOCKET", "TCPIP0::h::5025::SOCKET"));
    }
}
