//! VISA completion and error codes.
//!
//! The numeric values are the ones the VISA specification assigns to
//! `VI_SUCCESS_*` and `VI_ERROR_*`, so they can be compared against what
//! other implementations report.

consts_to_enum! {
    doc
    /// Completion codes returned alongside successful operations.
    pub enum CompletionCode: u32 {
        Success            0x0000_0000 r#"Operation completed successfully."#
        SuccessTermChar    0x3FFF0005 r#"The specified termination character was read."#
        SuccessMaxCnt      0x3FFF0006 r#"The number of bytes read is equal to the requested input count."#
        SuccessDevNpresent 0x3FFF007C r#"Session opened successfully, but the device at the specified address is not responding."#
        SuccessNestedExclusive 0x3FFF001E r#"Specified access mode is successfully acquired, and this session has nested exclusive locks."#
        SuccessNestedShared    0x3FFF001F r#"Specified access mode is successfully acquired, and this session has nested shared locks."#
    }
}

consts_to_enum! {
    doc
    /// Error codes. The discriminants are the `ViStatus` values reinterpreted
    /// as unsigned 32-bit integers.
    pub enum ErrorCode: u32 {
        SystemError   0xBFFF0000 r#"Unknown system error."#
        InvObject     0xBFFF000E r#"The given session or object reference is invalid."#
        RsrcLocked    0xBFFF000F r#"Specified type of lock cannot be obtained, or specified operation cannot be performed, because the resource is locked."#
        InvExpr       0xBFFF0010 r#"Invalid expression specified for search."#
        RsrcNfound    0xBFFF0011 r#"Insufficient location information or the requested device or resource is not present in the system."#
        InvRsrcName   0xBFFF0012 r#"Invalid resource reference specified. Parsing error."#
        InvAccMode    0xBFFF0013 r#"Invalid access mode."#
        Tmo           0xBFFF0015 r#"Timeout expired before operation completed."#
        ClosingFailed 0xBFFF0016 r#"Unable to deallocate the previously allocated data structures corresponding to this session or object reference."#
        NsupAttr      0xBFFF001D r#"The specified attribute is not defined or supported by the referenced resource."#
        NsupAttrState 0xBFFF001E r#"The specified state of the attribute is not valid, or is not supported as defined by the resource."#
        AttrReadonly  0xBFFF001F r#"The specified attribute is read-only."#
        InvLockType   0xBFFF0020 r#"The specified type of lock is not supported by this resource."#
        InvAccessKey  0xBFFF0021 r#"The access key to the resource associated with this session is invalid."#
        Abort         0xBFFF0030 r#"User abort occurred during transfer."#
        InvSetup      0xBFFF003A r#"Unable to start operation because setup is invalid (due to attributes being set to an inconsistent state)."#
        Alloc         0xBFFF003C r#"Insufficient system resources to perform necessary memory allocation."#
        Io            0xBFFF003E r#"Could not perform operation because of I/O error."#
        InvFmt        0xBFFF003F r#"A format specifier in the format string is invalid."#
        LineInUse     0xBFFF0042 r#"The specified trigger line is currently in use."#
        Nlisteners    0xBFFF005F r#"No listeners condition is detected (both NRFD and NDAC are deasserted)."#
        NsupOper      0xBFFF0067 r#"The given session or object reference does not support this operation."#
        AsrlParity    0xBFFF006A r#"A parity error occurred during transfer."#
        AsrlFraming   0xBFFF006B r#"A framing error occurred during transfer."#
        AsrlOverrun   0xBFFF006C r#"An overrun error occurred during transfer. A character was not read from the hardware before the next character arrived."#
        RsrcBusy      0xBFFF0072 r#"The resource is valid, but VISA cannot currently access it."#
        InvParameter  0xBFFF0078 r#"The value of some parameter (which parameter is not known) is invalid."#
        SesnNlocked   0xBFFF009C r#"The current session did not have any lock on the resource."#
        LibraryNfound 0xBFFF009E r#"A code library required by VISA could not be located or loaded."#
        ConnLost      0xBFFF00A6 r#"The connection for the given session has been lost."#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_carry_visa_values() {
        assert_eq!(u32::from(CompletionCode::SuccessTermChar), 0x3FFF0005);
        assert_eq!(u32::from(ErrorCode::Tmo), 0xBFFF0015);
        assert_eq!(ErrorCode::try_from(0xBFFF00A6u32), Ok(ErrorCode::ConnLost));
    }

    #[test]
    fn display_is_human_readable() {
        assert!(ErrorCode::Tmo.to_string().contains("Timeout"));
    }
}
