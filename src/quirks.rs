//! Per-device USB quirk table.
//!
//! Some USBTMC firmware deviates from the class specification in ways that
//! need handling at open or transfer time. Rather than scattering vendor
//! checks through the USB code, every deviation is a flag looked up once per
//! `(vendor_id, product_id)` when the session opens.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsbQuirks: u8 {
        /// Issue a USB device reset while opening. Devices that need this
        /// come up with a wedged bulk state after an unclean close.
        const NEEDS_RESET_ON_OPEN = 1;
        /// Call `set_configuration` at most once. Reconfiguring an already
        /// configured device repeatedly detaches the kernel driver and loses
        /// communication.
        const ONLY_ONE_SET_CONFIGURATION = 2;
        /// The bulk-IN header's `TransferSize` field (or the whole header)
        /// cannot be trusted; apply the recovery parse.
        const IGNORES_TRANSFER_SIZE_IN_HEADER = 4;
    }
}

const RIGOL_VID: u16 = 0x1AB1;

/// Looks up the quirk set for a device. Unknown devices get an empty set.
pub fn lookup(vendor_id: u16, product_id: u16) -> UsbQuirks {
    match (vendor_id, product_id) {
        // DS1000-series scopes and their siblings
        (RIGOL_VID, _) => {
            UsbQuirks::NEEDS_RESET_ON_OPEN | UsbQuirks::ONLY_ONE_SET_CONFIGURATION
        }
        // early DG1022 firmware reports a bogus TransferSize
        (0x0400, 0x09C4) => UsbQuirks::IGNORES_TRANSFER_SIZE_IN_HEADER,
        _ => UsbQuirks::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rigol_devices_need_reset() {
        let quirks = lookup(0x1AB1, 0x0588);
        assert!(quirks.contains(UsbQuirks::NEEDS_RESET_ON_OPEN));
        assert!(quirks.contains(UsbQuirks::ONLY_ONE_SET_CONFIGURATION));
    }

    #[test]
    fn unknown_devices_are_clean() {
        assert!(lookup(0x0957, 0x1796).is_empty());
    }
}
