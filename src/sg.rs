//! Command transport: SCSI generic I/O submission and sense parsing
//! (component C1).
//!
//! The `SgIoHdr` structure mirrors the kernel's `sg_io_hdr_t` ABI
//! (`<scsi/sg.h>`): a fixed OS structure passed by pointer to an
//! ioctl, not a device reply buffer, so `#[repr(C)]` aliasing is
//! appropriate here.

use crate::error::{self, AscAscq, LastError, SenseKey, ZbcError};
use libc::{c_int, c_void};
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::time::Duration;

const SG_IO: libc::c_ulong = 0x2285;
const SG_DXFER_NONE: c_int = -1;
const SG_DXFER_TO_DEV: c_int = -2;
const SG_DXFER_FROM_DEV: c_int = -3;
const SG_FLAG_DIRECT_IO: u32 = 0x01;
const SG_FLAG_Q_AT_TAIL: u32 = 0x10;

pub const CHECK_CONDITION: u8 = 0x02;
const DID_OK: u16 = 0x00;
const DID_TIME_OUT: u16 = 0x03;
const DRIVER_SENSE: u8 = 0x08;
const DRIVER_STATUS_MASK: u8 = 0x0f;

pub const SENSE_MAX_LENGTH: usize = 64;
// 32 bytes covers the SCSI ZONE ACTIVATE/QUERY variable-length CDB form
//; every other command in this crate uses 16 bytes or
// fewer and sets `cdb_len` accordingly.
pub const CDB_MAX_LENGTH: usize = 32;

/// Mirrors Linux `struct sg_io_hdr` (`<scsi/sg.h>`).
#[repr(C)]
struct SgIoHdr {
    interface_id: c_int,
    dxfer_direction: c_int,
    cmd_len: u8,
    mx_sb_len: u8,
    iovec_count: u16,
    dxfer_len: u32,
    dxferp: *mut c_void,
    cmdp: *mut u8,
    sbp: *mut u8,
    timeout: u32,
    flags: u32,
    pack_id: i32,
    usr_ptr: *mut c_void,
    status: u8,
    masked_status: u8,
    msg_status: u8,
    sb_len_wr: u8,
    host_status: u16,
    driver_status: u16,
    resid: i32,
    duration: u32,
    info: u32,
}

/// Data direction for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    FromDevice,
    None,
}

/// Either a single contiguous buffer or a scatter/gather vector.
pub enum DataBuf<'a> {
    None,
    Single(&'a mut [u8]),
    Gather(&'a [IoSlice<'a>]),
    Scatter(&'a mut [IoSliceMut<'a>]),
}

/// Outcome of a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgOutcome {
    Ok,
    Timeout,
    TransportError,
    DeviceError,
}

pub struct SgResult {
    pub outcome: SgOutcome,
    pub status: u8,
    pub host_status: u16,
    pub driver_status: u16,
    pub residual: i32,
    pub sense: [u8; SENSE_MAX_LENGTH],
    pub sense_len: usize,
}

/// A command to submit over the generic SCSI interface.
pub struct SgCommand<'a> {
    pub cdb: [u8; CDB_MAX_LENGTH],
    pub cdb_len: usize,
    pub direction: Direction,
    pub data: DataBuf<'a>,
    pub timeout: Duration,
    pub direct_io: bool,
}

impl<'a> SgCommand<'a> {
    pub fn new(cdb_len: usize, direction: Direction, timeout: Duration) -> Self {
        SgCommand {
            cdb: [0u8; CDB_MAX_LENGTH],
            cdb_len,
            direction,
            data: DataBuf::None,
            timeout,
            direct_io: false,
        }
    }
}

/// Submit a command over `SG_IO` on `fd`.
pub fn submit(fd: RawFd, cmd: &mut SgCommand) -> Result<SgResult, ZbcError> {
    let direction = match cmd.direction {
        Direction::None => SG_DXFER_NONE,
        Direction::ToDevice => SG_DXFER_TO_DEV,
        Direction::FromDevice => SG_DXFER_FROM_DEV,
    };

    let mut flags = SG_FLAG_Q_AT_TAIL;
    let (dxferp, dxfer_len, iovec_count): (*mut c_void, u32, u16) = match &mut cmd.data {
        DataBuf::None => (std::ptr::null_mut(), 0, 0),
        DataBuf::Single(buf) => {
            if cmd.direct_io {
                flags |= SG_FLAG_DIRECT_IO;
            }
            (buf.as_mut_ptr() as *mut c_void, buf.len() as u32, 0)
        }
        DataBuf::Gather(iov) => {
            let len: usize = iov.iter().map(|s| s.len()).sum();
            (
                iov.as_ptr() as *mut c_void,
                len as u32,
                iov.len() as u16,
            )
        }
        DataBuf::Scatter(iov) => {
            let len: usize = iov.iter().map(|s| s.len()).sum();
            (
                iov.as_mut_ptr() as *mut c_void,
                len as u32,
                iov.len() as u16,
            )
        }
    };

    let mut sense = [0u8; SENSE_MAX_LENGTH];
    let mut hdr = SgIoHdr {
        interface_id: b'S' as c_int,
        dxfer_direction: direction,
        cmd_len: cmd.cdb_len as u8,
        mx_sb_len: SENSE_MAX_LENGTH as u8,
        iovec_count,
        dxfer_len,
        dxferp,
        cmdp: cmd.cdb.as_mut_ptr(),
        sbp: sense.as_mut_ptr(),
        timeout: cmd.timeout.as_millis() as u32,
        flags,
        pack_id: 0,
        usr_ptr: std::ptr::null_mut(),
        status: 0,
        masked_status: 0,
        msg_status: 0,
        sb_len_wr: 0,
        host_status: 0,
        driver_status: 0,
        resid: 0,
        duration: 0,
        info: 0,
    };

    log::debug!(
        "submitting CDB opcode 0x{:02x}, {} B transfer",
        cmd.cdb[0],
        dxfer_len
    );

    let rc = unsafe { libc::ioctl(fd, SG_IO as _, &mut hdr as *mut SgIoHdr) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        log::debug!("SG_IO ioctl failed: {}", err);
        return Err(ZbcError::Io { source: err });
    }

    let driver_status = hdr.driver_status & DRIVER_STATUS_MASK as u16;
    let ok = hdr.status == 0
        && hdr.host_status == DID_OK
        && (driver_status == 0 || driver_status == DRIVER_SENSE as u16);

    let sense_len = hdr.sb_len_wr as usize;
    let outcome = if ok {
        error::clear_last_error();
        SgOutcome::Ok
    } else if hdr.host_status == DID_TIME_OUT {
        SgOutcome::Timeout
    } else if hdr.status == CHECK_CONDITION as u8 {
        parse_sense(&sense[..sense_len]);
        SgOutcome::DeviceError
    } else {
        parse_sense(&sense[..sense_len]);
        SgOutcome::TransportError
    };

    Ok(SgResult {
        outcome,
        status: hdr.status,
        host_status: hdr.host_status,
        driver_status: hdr.driver_status,
        residual: hdr.resid,
        sense,
        sense_len,
    })
}

/// Parse fixed (70h/71h) and descriptor (72h/73h) sense formats into
/// the thread-local error record.
pub fn parse_sense(sense: &[u8]) {
    if sense.len() < 4 {
        error::clear_last_error();
        return;
    }

    let response_code = sense[0] & 0x7f;
    if response_code == 0x72 || response_code == 0x73 {
        error::set_last_error(LastError {
            sense_key: SenseKey(sense[1] & 0x0f),
            asc_ascq: AscAscq(((sense[2] as u16) << 8) | sense[3] as u16),
            ..Default::default()
        });
        return;
    }

    if sense.len() < 14 {
        error::clear_last_error();
        return;
    }

    if response_code == 0x70 || response_code == 0x71 {
        error::set_last_error(LastError {
            sense_key: SenseKey(sense[2] & 0x0f),
            asc_ascq: AscAscq(((sense[12] as u16) << 8) | sense[13] as u16),
            ..Default::default()
        });
    }
}

/// Returns true if `sense` is a descriptor-format buffer (72h/73h)
/// whose first descriptor is an ATA status-return descriptor (type
/// 0x09) with the ATA status error bit set.
pub fn is_ata_status_error_descriptor(sense: &[u8]) -> bool {
    if sense.len() < 10 {
        return false;
    }
    let response_code = sense[0] & 0x7f;
    if response_code != 0x72 && response_code != 0x73 {
        return false;
    }
    // Descriptor header begins at byte 8: descriptor type, additional length.
    sense[8] == 0x09 && (sense[11] & 0x01) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_descriptor_format_sense() {
        error::clear_last_error();
        let mut sense = [0u8; 8];
        sense[0] = 0x72;
        sense[1] = SenseKey::ILLEGAL_REQUEST.0;
        sense[2] = 0x21;
        sense[3] = 0x04;
        parse_sense(&sense);
        let e = error::last_error();
        assert_eq!(e.sense_key, SenseKey::ILLEGAL_REQUEST);
        assert_eq!(e.asc_ascq, AscAscq::UNALIGNED_WRITE);
    }

    #[test]
    fn parses_fixed_format_sense() {
        error::clear_last_error();
        let mut sense = [0u8; 18];
        sense[0] = 0x70;
        sense[2] = SenseKey::DATA_PROTECT.0;
        sense[12] = 0x27;
        sense[13] = 0x08;
        parse_sense(&sense);
        let e = error::last_error();
        assert_eq!(e.sense_key, SenseKey::DATA_PROTECT);
        assert_eq!(e.asc_ascq, AscAscq::ZONE_READ_ONLY);
    }

    #[test]
    fn short_sense_buffer_clears_error() {
        error::set_last_error(LastError {
            sense_key: SenseKey::ABORTED_COMMAND,
            ..Default::default()
        });
        parse_sense(&[0x70, 0x00]);
        assert_eq!(error::last_error().sense_key, SenseKey::NONE);
    }
}
