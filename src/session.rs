//! The engine contract every transport session implements, plus the I/O
//! settings and byte-accumulation loop they share.

use std::time::{Duration, Instant};

use crate::enums::assert::TriggerProtocol;
use crate::enums::attribute::{AttrKind, Attribute};
use crate::enums::status::{CompletionCode, ErrorCode};
use crate::flags::{AccessMode, FlushMode};
use crate::{AccessKey, Error, Result};

/// VISA encoding of an immediate (non-blocking) timeout.
pub const TMO_IMMEDIATE: u32 = 0;
/// VISA encoding of an infinite timeout.
pub const TMO_INFINITE: u32 = 0xFFFF_FFFF;

pub(crate) fn duration_from_ms(ms: u32) -> Option<Duration> {
    match ms {
        TMO_INFINITE => None,
        ms => Some(Duration::from_millis(ms as u64)),
    }
}

pub(crate) fn ms_from_duration(timeout: Option<Duration>) -> u32 {
    match timeout {
        None => TMO_INFINITE,
        Some(t) => t.as_millis().min(TMO_INFINITE as u128 - 1) as u32,
    }
}

/// What a transport session must provide. One instance per open resource;
/// calls are serialized by the owning [`Instrument`](crate::Instrument).
pub(crate) trait Session: Send {
    /// Reads up to `count` bytes, reporting how the read completed.
    fn read(&mut self, count: usize) -> Result<(Vec<u8>, CompletionCode)>;

    /// Writes the whole payload, returning the number of bytes transferred.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Device clear.
    fn clear(&mut self) -> Result<()>;

    fn flush(&mut self, _mode: FlushMode) -> Result<()> {
        Ok(())
    }

    fn read_stb(&mut self) -> Result<u8> {
        Err(Error::from(ErrorCode::NsupOper))
    }

    fn assert_trigger(&mut self, _protocol: TriggerProtocol) -> Result<()> {
        Err(Error::from(ErrorCode::NsupOper))
    }

    fn lock(
        &mut self,
        _mode: AccessMode,
        _timeout: Duration,
        _requested_key: Option<&str>,
    ) -> Result<Option<AccessKey>> {
        Err(Error::from(ErrorCode::NsupOper))
    }

    fn unlock(&mut self) -> Result<()> {
        Err(Error::from(ErrorCode::NsupOper))
    }

    fn enable_srq(&mut self, _enable: bool) -> Result<()> {
        Err(Error::from(ErrorCode::NsupOper))
    }

    fn get_attr(&mut self, kind: AttrKind) -> Result<Attribute>;

    fn set_attr(&mut self, attr: &Attribute) -> Result<()>;

    /// Final cleanup: release server-side locks, tear down auxiliary
    /// channels, return the transport to the OS.
    fn close(&mut self) -> Result<()>;
}

/// The I/O attributes every message-based session carries.
#[derive(Debug, Clone)]
pub(crate) struct IoSettings {
    /// `None` blocks forever.
    pub timeout: Option<Duration>,
    pub term_char: u8,
    pub term_char_en: bool,
    pub send_end: bool,
    pub suppress_end: bool,
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_millis(2000)),
            term_char: b'\n',
            term_char_en: false,
            send_end: true,
            suppress_end: false,
        }
    }
}

impl IoSettings {
    pub fn timeout_ms(&self) -> u32 {
        ms_from_duration(self.timeout)
    }

    /// The termination character, when matching is enabled.
    pub fn term_char(&self) -> Option<u8> {
        self.term_char_en.then_some(self.term_char)
    }

    /// Answers the attribute kinds stored here; `None` means the kind
    /// belongs to the transport.
    pub fn get_attr(&self, kind: AttrKind) -> Option<Attribute> {
        match kind {
            AttrKind::TmoValue => Some(Attribute::TmoValue(self.timeout_ms())),
            AttrKind::Termchar => Some(Attribute::Termchar(self.term_char)),
            AttrKind::TermcharEn => Some(Attribute::TermcharEn(self.term_char_en)),
            AttrKind::SendEndEn => Some(Attribute::SendEndEn(self.send_end)),
            AttrKind::SuppressEndEn => Some(Attribute::SuppressEndEn(self.suppress_end)),
            _ => None,
        }
    }

    /// Applies the attribute if it is one of the stored kinds; returns
    /// whether it was handled.
    pub fn set_attr(&mut self, attr: &Attribute) -> bool {
        match *attr {
            Attribute::TmoValue(ms) => self.timeout = duration_from_ms(ms),
            Attribute::Termchar(c) => self.term_char = c,
            Attribute::TermcharEn(en) => self.term_char_en = en,
            Attribute::SendEndEn(en) => self.send_end = en,
            Attribute::SuppressEndEn(en) => self.suppress_end = en,
            _ => return false,
        }
        true
    }
}

/// Byte-accumulating read loop shared by transports whose reads arrive in
/// blocks (GPIB, serial).
///
/// `reader` returns one block plus whether the transport's END indicator
/// accompanied it. Accumulation stops at the first of: END observed (unless
/// suppress-end), termination character matched, `count` bytes reached. On
/// deadline expiry whatever has accumulated travels with the timeout error.
pub(crate) fn read_until<R>(
    mut reader: R,
    count: usize,
    settings: &IoSettings,
) -> Result<(Vec<u8>, CompletionCode)>
where
    R: FnMut() -> Result<(Vec<u8>, bool)>,
{
    let deadline = settings.timeout.map(|t| Instant::now() + t);
    let term_char = settings.term_char();
    let mut out: Vec<u8> = Vec::new();

    loop {
        let (current, end_seen) = match reader() {
            Ok(block) => block,
            Err(e) if e.code() == ErrorCode::Tmo => {
                return Err(Error::timeout_with(out));
            }
            Err(e) => return Err(e),
        };

        if !current.is_empty() {
            let start = out.len();
            out.extend_from_slice(&current);

            if end_seen && !settings.suppress_end {
                return Ok((out, CompletionCode::Success));
            }
            if let Some(tc) = term_char {
                if let Some(pos) = current.iter().position(|&b| b == tc) {
                    out.truncate(start + pos + 1);
                    return Ok((out, CompletionCode::SuccessTermChar));
                }
            }
            if out.len() >= count {
                out.truncate(count);
                return Ok((out, CompletionCode::SuccessMaxCnt));
            }
        }

        if let Some(deadline) = deadline {
            if Instant::now() > deadline {
                return Err(Error::timeout_with(out));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(term: Option<u8>, suppress_end: bool) -> IoSettings {
        IoSettings {
            term_char: term.unwrap_or(b'\n'),
            term_char_en: term.is_some(),
            suppress_end,
            ..IoSettings::default()
        }
    }

    #[test]
    fn stops_on_end_indicator() {
        let blocks = vec![(b"abc".to_vec(), false), (b"def".to_vec(), true)];
        let mut iter = blocks.into_iter();
        let (data, status) =
            read_until(|| Ok(iter.next().unwrap()), 64, &settings(None, false)).unwrap();
        assert_eq!(data, b"abcdef");
        assert_eq!(status, CompletionCode::Success);
    }

    #[test]
    fn term_char_truncates_block() {
        let blocks = vec![(b"ab\ncd".to_vec(), false)];
        let mut iter = blocks.into_iter();
        let (data, status) =
            read_until(|| Ok(iter.next().unwrap()), 64, &settings(Some(b'\n'), false)).unwrap();
        assert_eq!(data, b"ab\n");
        assert_eq!(status, CompletionCode::SuccessTermChar);
    }

    #[test]
    fn count_limits_read() {
        let blocks = vec![(b"abcdef".to_vec(), false)];
        let mut iter = blocks.into_iter();
        let (data, status) =
            read_until(|| Ok(iter.next().unwrap()), 4, &settings(None, false)).unwrap();
        assert_eq!(data, b"abcd");
        assert_eq!(status, CompletionCode::SuccessMaxCnt);
    }

    #[test]
    fn suppress_end_keeps_reading() {
        let blocks = vec![(b"ab".to_vec(), true), (b"cd".to_vec(), true)];
        let mut iter = blocks.into_iter();
        let (data, status) =
            read_until(|| Ok(iter.next().unwrap()), 4, &settings(None, true)).unwrap();
        assert_eq!(data, b"abcd");
        assert_eq!(status, CompletionCode::SuccessMaxCnt);
    }

    #[test]
    fn timeout_carries_partial_data() {
        let mut sent = false;
        let err = read_until(
            || {
                if sent {
                    Err(crate::Error::from(ErrorCode::Tmo))
                } else {
                    sent = true;
                    Ok((b"par".to_vec(), false))
                }
            },
            64,
            &settings(None, false),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Tmo);
        assert_eq!(err.partial_data(), Some(&b"par"[..]));
    }
}
