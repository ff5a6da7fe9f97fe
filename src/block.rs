//! Kernel zoned-block ioctl transport (component C4).
//!
//! Mirrors Linux `<linux/blkzoned.h>`: `BLKREPORTZONE`, `BLKRESETZONE`,
//! `BLKOPENZONE`, `BLKCLOSEZONE`, `BLKFINISHZONE`, `BLKGETZONESZ`,
//! `BLKGETNRZONES`. The ioctl numbers below are fixed by the kernel ABI,
//! the same way `sg::SG_IO` is fixed by `<scsi/sg.h>`.

use crate::error::ZbcError;
use crate::zone::{Sector, Zone, ZoneAttributes, ZoneCondition, ZoneType, WP_INVALID};
use libc::c_ulong;
use std::os::unix::io::RawFd;

const BLKREPORTZONE: c_ulong = 0xc0900089;
const BLKRESETZONE: c_ulong = 0x40100088;
const BLKGETZONESZ: c_ulong = 0x80040084;
const BLKGETNRZONES: c_ulong = 0x80040085;
const BLKOPENZONE: c_ulong = 0x40100086;
const BLKCLOSEZONE: c_ulong = 0x40100087;
const BLKFINISHZONE: c_ulong = 0x4010008b;

/// `BLKREPORTZONE` chunk size: the block transport never
/// asks the kernel for more than this many zones in a single ioctl.
pub const REPORT_CHUNK_ZONES: usize = 8192;

const BLK_ZONE_SIZE: usize = 64;
const BLK_ZONE_REPORT_HDR_SIZE: usize = 24;

/// Mirrors `struct blk_zone_report` plus its trailing `blk_zone[]` array,
/// built on the heap sized for the requested zone count.
fn build_report_buf(nr_zones: usize) -> Vec<u8> {
    vec![0u8; BLK_ZONE_REPORT_HDR_SIZE + nr_zones * BLK_ZONE_SIZE]
}

fn ioctl_err(fd: RawFd, what: &'static str) -> ZbcError {
    let err = std::io::Error::last_os_error();
    log::debug!("{} on fd {} failed: {}", what, fd, err);
    ZbcError::Io { source: err }
}

pub fn is_not_supported(err: &ZbcError) -> bool {
    matches!(
        err,
        ZbcError::Io { source } if source.raw_os_error() == Some(libc::EOPNOTSUPP)
            || source.raw_os_error() == Some(libc::ENOTTY)
    )
}

/// `BLKGETZONESZ`: zone size in 512-byte sectors reported by the kernel.
pub fn get_zone_size(fd: RawFd) -> Result<u32, ZbcError> {
    let mut sz: u32 = 0;
    let rc = unsafe { libc::ioctl(fd, BLKGETZONESZ as _, &mut sz as *mut u32) };
    if rc != 0 {
        return Err(ioctl_err(fd, "BLKGETZONESZ"));
    }
    Ok(sz)
}

/// `BLKGETNRZONES`: total number of zones reported by the kernel.
pub fn get_nr_zones(fd: RawFd) -> Result<u32, ZbcError> {
    let mut n: u32 = 0;
    let rc = unsafe { libc::ioctl(fd, BLKGETNRZONES as _, &mut n as *mut u32) };
    if rc != 0 {
        return Err(ioctl_err(fd, "BLKGETNRZONES"));
    }
    Ok(n)
}

fn parse_descriptor(d: &[u8]) -> Zone {
    let start = u64::from_ne_bytes(d[0..8].try_into().unwrap());
    let length = u64::from_ne_bytes(d[8..16].try_into().unwrap());
    let wp = u64::from_ne_bytes(d[16..24].try_into().unwrap());
    let zone_type = ZoneType::from_wire(d[24]);
    let condition = ZoneCondition::from_wire(d[25] << 4);
    let mut attributes = ZoneAttributes::empty();
    if d[26] != 0 {
        attributes |= ZoneAttributes::NON_SEQ;
    }
    let write_pointer = if zone_type.is_write_pointer() {
        wp
    } else {
        WP_INVALID
    };
    Zone {
        start,
        length,
        write_pointer,
        zone_type,
        condition,
        attributes,
    }
}

/// `BLKREPORTZONE`, chunked at `REPORT_CHUNK_ZONES` zones per call
///: loops until `zones` is filled or the device end is
/// reached. Positions/lengths are already 512-byte sector units on a
/// kernel zoned block device, so no lba<->sector conversion applies.
pub fn report_zones(
    fd: RawFd,
    start_sector: Sector,
    device_sectors: Sector,
    zones: &mut [Zone],
) -> Result<usize, ZbcError> {
    let mut filled = 0usize;
    let mut cursor = start_sector;

    while filled < zones.len() && cursor < device_sectors {
        let want = (zones.len() - filled).min(REPORT_CHUNK_ZONES);
        let mut buf = build_report_buf(want);
        buf[0..8].copy_from_slice(&cursor.to_ne_bytes());
        buf[8..12].copy_from_slice(&(want as u32).to_ne_bytes());

        let rc = unsafe { libc::ioctl(fd, BLKREPORTZONE as _, buf.as_mut_ptr()) };
        if rc != 0 {
            return Err(ioctl_err(fd, "BLKREPORTZONE"));
        }

        let nr_zones = u32::from_ne_bytes(buf[8..12].try_into().unwrap()) as usize;
        if nr_zones == 0 {
            break;
        }

        for i in 0..nr_zones.min(want) {
            let d = &buf[BLK_ZONE_REPORT_HDR_SIZE + i * BLK_ZONE_SIZE..];
            zones[filled] = parse_descriptor(d);
            cursor = zones[filled].end();
            filled += 1;
            if filled == zones.len() {
                break;
            }
        }
    }
    Ok(filled)
}

/// `BLKRESETZONE` over the whole device. A single call
/// covering `[0, device_sectors)`.
pub fn reset_all(fd: RawFd, device_sectors: Sector) -> Result<(), ZbcError> {
    let mut range = [0u8; 16];
    range[8..16].copy_from_slice(&device_sectors.to_ne_bytes());
    let rc = unsafe { libc::ioctl(fd, BLKRESETZONE as _, range.as_mut_ptr()) };
    if rc != 0 {
        return Err(ioctl_err(fd, "BLKRESETZONE"));
    }
    Ok(())
}

fn zone_range_ioctl(
    fd: RawFd,
    ioctl_nr: c_ulong,
    start: Sector,
    length: Sector,
    what: &'static str,
) -> Result<(), ZbcError> {
    let mut range = [0u8; 16];
    range[0..8].copy_from_slice(&start.to_ne_bytes());
    range[8..16].copy_from_slice(&length.to_ne_bytes());
    let rc = unsafe { libc::ioctl(fd, ioctl_nr as _, range.as_mut_ptr()) };
    if rc != 0 {
        return Err(ioctl_err(fd, what));
    }
    Ok(())
}

pub fn reset_one(fd: RawFd, start: Sector, length: Sector) -> Result<(), ZbcError> {
    zone_range_ioctl(fd, BLKRESETZONE, start, length, "BLKRESETZONE")
}

pub fn open_zone(fd: RawFd, start: Sector, length: Sector) -> Result<(), ZbcError> {
    zone_range_ioctl(fd, BLKOPENZONE, start, length, "BLKOPENZONE")
}

pub fn close_zone(fd: RawFd, start: Sector, length: Sector) -> Result<(), ZbcError> {
    zone_range_ioctl(fd, BLKCLOSEZONE, start, length, "BLKCLOSEZONE")
}

pub fn finish_zone(fd: RawFd, start: Sector, length: Sector) -> Result<(), ZbcError> {
    zone_range_ioctl(fd, BLKFINISHZONE, start, length, "BLKFINISHZONE")
}

/// Locate the holder (whole-disk) device and partition start offset for
/// a partition device path. Returns `None` when `path`
/// does not name a partition (no holder found).
pub fn partition_info(devname: &str) -> Option<(String, Sector)> {
    let holder = crate::sysfs::partition_holder(devname)?;
    let start = crate::sysfs::partition_start(&holder, devname).ok()?;
    Some((holder, start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_conventional_descriptor_as_non_write_pointer() {
        let mut d = [0u8; BLK_ZONE_SIZE];
        d[0..8].copy_from_slice(&0u64.to_ne_bytes());
        d[8..16].copy_from_slice(&1024u64.to_ne_bytes());
        d[16..24].copy_from_slice(&u64::MAX.to_ne_bytes());
        d[24] = ZoneType::Conventional.to_wire();
        let z = parse_descriptor(&d);
        assert_eq!(z.zone_type, ZoneType::Conventional);
        assert_eq!(z.write_pointer, WP_INVALID);
    }

    #[test]
    fn parses_sequential_descriptor_write_pointer() {
        let mut d = [0u8; BLK_ZONE_SIZE];
        d[0..8].copy_from_slice(&0u64.to_ne_bytes());
        d[8..16].copy_from_slice(&524288u64.to_ne_bytes());
        d[16..24].copy_from_slice(&8u64.to_ne_bytes());
        d[24] = ZoneType::SequentialWriteRequired.to_wire();
        let z = parse_descriptor(&d);
        assert_eq!(z.write_pointer, 8);
    }

    #[test]
    fn not_supported_detects_eopnotsupp() {
        let err = ZbcError::Io {
            source: std::io::Error::from_raw_os_error(libc::EOPNOTSUPP),
        };
        assert!(is_not_supported(&err));
        let err = ZbcError::Io {
            source: std::io::Error::from_raw_os_error(libc::EINVAL),
        };
        assert!(!is_not_supported(&err));
    }
}
