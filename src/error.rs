//! Error taxonomy and thread-local sense-code translation (component C9).
use snafu::Snafu;
use std::cell::Cell;

/// SCSI sense keys used by ZBC/ZAC devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenseKey(pub u8);

impl SenseKey {
    pub const NONE: SenseKey = SenseKey(0x0);
    pub const NOT_READY: SenseKey = SenseKey(0x2);
    pub const MEDIUM_ERROR: SenseKey = SenseKey(0x3);
    pub const ILLEGAL_REQUEST: SenseKey = SenseKey(0x5);
    pub const DATA_PROTECT: SenseKey = SenseKey(0x7);
    pub const ABORTED_COMMAND: SenseKey = SenseKey(0xB);

    pub fn as_str(self) -> &'static str {
        match self.0 {
            0x0 => "NO_SENSE",
            0x2 => "NOT_READY",
            0x3 => "MEDIUM_ERROR",
            0x5 => "ILLEGAL_REQUEST",
            0x7 => "DATA_PROTECT",
            0xB => "ABORTED_COMMAND",
            _ => "UNKNOWN_SENSE_KEY",
        }
    }
}

/// ASC/ASCQ codes used by ZBC/ZAC devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AscAscq(pub u16);

impl AscAscq {
    pub const NONE: AscAscq = AscAscq(0x0000);
    pub const INVALID_FIELD_IN_CDB: AscAscq = AscAscq(0x2400);
    pub const LBA_OUT_OF_RANGE: AscAscq = AscAscq(0x2100);
    pub const UNALIGNED_WRITE: AscAscq = AscAscq(0x2104);
    pub const WRITE_BOUNDARY_VIOLATION: AscAscq = AscAscq(0x2105);
    pub const READ_INVALID_DATA: AscAscq = AscAscq(0x2106);
    pub const READ_BOUNDARY_VIOLATION: AscAscq = AscAscq(0x2107);
    pub const ZONE_READ_ONLY: AscAscq = AscAscq(0x2708);
    pub const INSUFFICIENT_ZONE_RESOURCES: AscAscq = AscAscq(0x550E);
    pub const ZONE_RESET_WP_RECOMMENDED: AscAscq = AscAscq(0x2A07);
    pub const FORMAT_IN_PROGRESS: AscAscq = AscAscq(0x0404);
    pub const READ_ERROR: AscAscq = AscAscq(0x1100);
    pub const WRITE_ERROR: AscAscq = AscAscq(0x0C00);

    pub fn as_str(self) -> &'static str {
        match self.0 {
            0x0000 => "NO_ADDITIONAL_SENSE_INFO",
            0x2400 => "INVALID_FIELD_IN_CDB",
            0x2100 => "LBA_OUT_OF_RANGE",
            0x2104 => "UNALIGNED_WRITE_COMMAND",
            0x2105 => "WRITE_BOUNDARY_VIOLATION",
            0x2106 => "ATTEMPT_TO_READ_INVALID_DATA",
            0x2107 => "READ_BOUNDARY_VIOLATION",
            0x2708 => "ZONE_IS_READ_ONLY",
            0x550E => "INSUFFICIENT_ZONE_RESOURCES",
            0x2A07 => "ZONE_RESET_WP_RECOMMENDED",
            0x0404 => "FORMAT_IN_PROGRESS",
            0x1100 => "READ_ERROR",
            0x0C00 => "WRITE_ERROR",
            _ => "UNKNOWN_ASC_ASCQ",
        }
    }
}

/// Zone Activation Status Descriptor bits, valid only after an
/// activation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActivationStatus(pub u8);

/// Thread-local detailed error record.
///
/// Populated on every failing library call, cleared on the happy path
/// of every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastError {
    pub sense_key: SenseKey,
    pub asc_ascq: AscAscq,
    /// Zone Activation Status Descriptor bits (activation failures only).
    pub err_za: ActivationStatus,
    /// "Check Boundary First" sector (activation failures only).
    pub err_cbf: u64,
}

thread_local! {
    static LAST_ERROR: Cell<LastError> = Cell::new(LastError::default());
}

/// Returns the last error record set by a library call on this thread.
pub fn last_error() -> LastError {
    LAST_ERROR.with(|e| e.get())
}

/// Clears the thread-local error record. Called at the entry of every
/// library operation's happy path.
pub fn clear_last_error() {
    LAST_ERROR.with(|e| e.set(LastError::default()));
}

/// Sets the thread-local error record from a device sense/activation
/// failure. Called whenever a transport command does not complete ok.
pub fn set_last_error(err: LastError) {
    LAST_ERROR.with(|e| e.set(err));
}

/// `errno_ext`: copy out the last error record, truncated to whatever
/// length an older caller understands.
pub fn errno_ext(max_fields: usize) -> LastError {
    let mut e = last_error();
    if max_fields < 4 {
        e.err_cbf = 0;
    }
    if max_fields < 3 {
        e.err_za = ActivationStatus::default();
    }
    e
}

/// The error kinds a library call can fail with.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum ZbcError {
    #[snafu(display("invalid argument: {}", text))]
    InvalidArgument { text: String },

    #[snafu(display("operation not supported: {}", text))]
    NotSupported { text: String },

    #[snafu(display("transient transport error: {}", text))]
    TransientTransport { text: String },

    #[snafu(display(
        "device error: {} ({})",
        sense_key.as_str(),
        asc_ascq.as_str()
    ))]
    DeviceError {
        sense_key: SenseKey,
        asc_ascq: AscAscq,
    },

    #[snafu(display(
        "zone activation error: {} ({}), check-boundary-first sector {}",
        sense_key.as_str(),
        asc_ascq.as_str(),
        check_boundary_first
    ))]
    ActivationError {
        sense_key: SenseKey,
        asc_ascq: AscAscq,
        activation_status: ActivationStatus,
        check_boundary_first: u64,
    },

    #[snafu(display("command timed out after {:?}", timeout))]
    Timeout { timeout: std::time::Duration },

    #[snafu(display("I/O error: {}", source))]
    Io { source: std::io::Error },
}

impl From<std::io::Error> for ZbcError {
    fn from(source: std::io::Error) -> ZbcError {
        ZbcError::Io { source }
    }
}

pub type Result<T> = std::result::Result<T, ZbcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_is_per_thread_and_clears() {
        clear_last_error();
        assert_eq!(last_error().sense_key, SenseKey::NONE);

        set_last_error(LastError {
            sense_key: SenseKey::ILLEGAL_REQUEST,
            asc_ascq: AscAscq::UNALIGNED_WRITE,
            ..Default::default()
        });
        assert_eq!(last_error().sense_key, SenseKey::ILLEGAL_REQUEST);

        let handle = std::thread::spawn(|| {
            // a fresh thread must not observe the other thread's error
            last_error()
        });
        assert_eq!(handle.join().unwrap().sense_key, SenseKey::NONE);

        clear_last_error();
        assert_eq!(last_error().asc_ascq, AscAscq::NONE);
    }

    #[test]
    fn sense_strings_match_known_codes() {
        assert_eq!(SenseKey::ILLEGAL_REQUEST.as_str(), "ILLEGAL_REQUEST");
        assert_eq!(AscAscq::UNALIGNED_WRITE.as_str(), "UNALIGNED_WRITE_COMMAND");
        assert_eq!(SenseKey(0xFF).as_str(), "UNKNOWN_SENSE_KEY");
    }
}
