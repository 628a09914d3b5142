//! VISA attributes as a tagged enum.
//!
//! [`AttrKind`] enumerates the attribute identifiers this backend knows
//! about, carrying the numeric `VI_ATTR_*` values. [`Attribute`] pairs a
//! kind with its typed state; sessions accept and produce `Attribute`
//! values and answer [`ErrorCode::NsupAttr`](crate::enums::status::ErrorCode)
//! for kinds they do not implement.

use crate::flags::AccessMode;

consts_to_enum! {
    #[allow(clippy::upper_case_acronyms)]
    pub enum AttrKind: u32 {
        RsrcClass         0xBFFF0001
        RsrcName          0xBFFF0002
        RsrcLockState     0x3FFF0004
        SendEndEn         0x3FFF0016
        Termchar          0x3FFF0018
        TmoValue          0x3FFF001A
        IoProt            0x3FFF001C
        AsrlBaud          0x3FFF0021
        AsrlDataBits      0x3FFF0022
        SuppressEndEn     0x3FFF0036
        TermcharEn        0x3FFF0038
        ManfId            0x3FFF00D9
        ModelCode         0x3FFF00DF
        IntfType          0x3FFF0171
        GpibPrimaryAddr   0x3FFF0172
        GpibSecondaryAddr 0x3FFF0173
        IntfNum           0x3FFF0176
        TcpipAddr         0xBFFF0195
        TcpipHostname     0xBFFF0196
        TcpipPort         0x3FFF0197
        TcpipDeviceName   0xBFFF0199
        TcpipNodelay      0x3FFF019A
        TcpipKeepalive    0x3FFF019B
        UsbSerialNum      0xBFFF01A0
        UsbIntfcNum       0x3FFF01A1
        TcpipIsHislip     0x3FFF01A8
        TcpipHislipVersion 0x3FFF01A9
        TcpipHislipOverlapEn 0x3FFF01AA
        TcpipHislipMaxMessageKb 0x3FFF01AB
    }
}

consts_to_enum! {
    /// `VI_ATTR_INTF_TYPE` values.
    pub enum InterfaceType: u16 {
        Gpib  1
        Asrl  4
        Tcpip 6
        Usb   7
    }
}

consts_to_enum! {
    /// `VI_ATTR_IO_PROT` values. With [`IoProtocol::Usb488`] on a raw
    /// transport, triggers are emulated with `*TRG\n` per IEEE 488.2.
    pub enum IoProtocol: u16 {
        Normal 1
        Usb488 4
    }
}

/// An attribute identifier together with its typed state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Attribute {
    RsrcClass(String),
    RsrcName(String),
    RsrcLockState(AccessMode),
    SendEndEn(bool),
    Termchar(u8),
    /// Timeout in milliseconds; `VI_TMO_IMMEDIATE` (0) and
    /// `VI_TMO_INFINITE` (`0xFFFF_FFFF`) keep their VISA encodings.
    TmoValue(u32),
    IoProt(IoProtocol),
    AsrlBaud(u32),
    AsrlDataBits(u8),
    SuppressEndEn(bool),
    TermcharEn(bool),
    ManfId(u16),
    ModelCode(u16),
    IntfType(InterfaceType),
    GpibPrimaryAddr(u16),
    GpibSecondaryAddr(Option<u16>),
    IntfNum(u16),
    TcpipAddr(String),
    TcpipHostname(String),
    TcpipPort(u16),
    TcpipDeviceName(String),
    TcpipNodelay(bool),
    TcpipKeepalive(bool),
    UsbSerialNum(String),
    UsbIntfcNum(u16),
    TcpipIsHislip(bool),
    TcpipHislipVersion(u32),
    TcpipHislipOverlapEn(bool),
    TcpipHislipMaxMessageKb(u32),
}

impl Attribute {
    pub fn kind(&self) -> AttrKind {
        match self {
            Attribute::RsrcClass(_) => AttrKind::RsrcClass,
            Attribute::RsrcName(_) => AttrKind::RsrcName,
            Attribute::RsrcLockState(_) => AttrKind::RsrcLockState,
            Attribute::SendEndEn(_) => AttrKind::SendEndEn,
            Attribute::Termchar(_) => AttrKind::Termchar,
            Attribute::TmoValue(_) => AttrKind::TmoValue,
            Attribute::IoProt(_) => AttrKind::IoProt,
            Attribute::AsrlBaud(_) => AttrKind::AsrlBaud,
            Attribute::AsrlDataBits(_) => AttrKind::AsrlDataBits,
            Attribute::SuppressEndEn(_) => AttrKind::SuppressEndEn,
            Attribute::TermcharEn(_) => AttrKind::TermcharEn,
            Attribute::ManfId(_) => AttrKind::ManfId,
            Attribute::ModelCode(_) => AttrKind::ModelCode,
            Attribute::IntfType(_) => AttrKind::IntfType,
            Attribute::GpibPrimaryAddr(_) => AttrKind::GpibPrimaryAddr,
            Attribute::GpibSecondaryAddr(_) => AttrKind::GpibSecondaryAddr,
            Attribute::IntfNum(_) => AttrKind::IntfNum,
            Attribute::TcpipAddr(_) => AttrKind::TcpipAddr,
            Attribute::TcpipHostname(_) => AttrKind::TcpipHostname,
            Attribute::TcpipPort(_) => AttrKind::TcpipPort,
            Attribute::TcpipDeviceName(_) => AttrKind::TcpipDeviceName,
            Attribute::TcpipNodelay(_) => AttrKind::TcpipNodelay,
            Attribute::TcpipKeepalive(_) => AttrKind::TcpipKeepalive,
            Attribute::UsbSerialNum(_) => AttrKind::UsbSerialNum,
            Attribute::UsbIntfcNum(_) => AttrKind::UsbIntfcNum,
            Attribute::TcpipIsHislip(_) => AttrKind::TcpipIsHislip,
            Attribute::TcpipHislipVersion(_) => AttrKind::TcpipHislipVersion,
            Attribute::TcpipHislipOverlapEn(_) => AttrKind::TcpipHislipOverlapEn,
            Attribute::TcpipHislipMaxMessageKb(_) => AttrKind::TcpipHislipMaxMessageKb,
        }
    }
}
