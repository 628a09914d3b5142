consts_to_enum! {
    /// Trigger protocol to use during assertion.
    ///
    /// Message-based resources only accept [`TriggerProtocol::Default`]:
    /// a GPIB GET, a HiSLIP `Trigger` message, the USBTMC `TRIGGER` bulk
    /// message or the VXI-11 `device_trigger` call, depending on the
    /// transport. The remaining values exist for wire compatibility with
    /// register-based implementations and are rejected with
    /// `VI_ERROR_NSUP_OPER` here.
    ///
    /// See [`assert_trigger`](crate::Instrument::assert_trigger)
    pub enum TriggerProtocol: u16 {
        Default   0
        On        1
        Off       2
        Sync      5
        Reserve   6
        Unreserve 7
    }
}
