//!
//! Defines [`AccessMode`] and [`FlushMode`]
//!
//!

use bitflags::bitflags;

bitflags! {
    /// Used in [`ResourceManager::open`](crate::ResourceManager::open) and
    /// [`Instrument::lock`](crate::Instrument::lock), specifies the type of
    /// lock requested. The bit values match `VI_NO_LOCK`,
    /// `VI_EXCLUSIVE_LOCK`, `VI_SHARED_LOCK` and `VI_LOAD_CONFIG`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct AccessMode: u32 {
        const NO_LOCK = 0;
        const EXCLUSIVE_LOCK = 1;
        const SHARED_LOCK = 2;
        const LOAD_CONFIG = 4;
    }
}

impl Default for AccessMode {
    fn default() -> Self {
        Self::NO_LOCK
    }
}

bitflags! {
    /// Used in [`Instrument::visa_flush`](crate::Instrument::visa_flush),
    /// specifies the action to be taken with flushing the buffer.
    ///
    /// It is possible to combine any of these read flags and write flags for
    /// different buffers by ORing the flags. However, combining two flags for
    /// the same buffer in the same call is illegal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct FlushMode: u16 {
        /// Discard the read buffer contents. If data was present in the read
        /// buffer and no END-indicator was present, read from the device until
        /// encountering an END indicator (which causes the loss of data).
        const READ_BUF = 1;
        /// Discard the read buffer contents (does not perform any I/O to the device).
        const READ_BUF_DISCARD = 4;
        /// Flush the write buffer by writing all buffered data to the device.
        const WRITE_BUF = 2;
        /// Discard the write buffer contents (does not perform any I/O to the device).
        const WRITE_BUF_DISCARD = 8;
        /// Discard the low-level I/O receive buffer contents (same as IO_IN_BUF_DISCARD).
        const IO_IN_BUF = 16;
        /// Discard the low-level I/O receive buffer contents (does not perform any I/O to the device).
        const IO_IN_BUF_DISCARD = 64;
        /// Flush the low-level I/O transmit buffer by writing all buffered data to the device.
        const IO_OUT_BUF = 32;
        /// Discard the low-level I/O transmit buffer contents (does not perform any I/O to the device).
        const IO_OUT_BUF_DISCARD = 128;
    }
}
