//! Transport-agnostic REPORT ZONES paging driver (component C6).
//! Operates over [`crate::device::Device`] regardless of which
//! concrete backend is active; each backend's `report_zones_once`
//! already speaks 512 B sectors so this module never touches LBAs.

use crate::device::{Device, ZoneOp};
use crate::error::ZbcError;
use crate::zone::{ReportingOptions, Sector, Zone};

/// Per-call chunk size: how many zone descriptors are requested from a
/// single underlying REPORT ZONES command before the driver checks
/// whether more are needed. Kept well under typical HBA
/// max-transfer limits; a 64-descriptor page is 4 KiB for SCSI/ATA's
/// fixed 64-byte records.
const CHUNK_ZONES: usize = 4096;

/// `report_zones(dev, start_sector, ro, zones)`: fills
/// `zones` starting at `start_sector`, paging the underlying command in
/// chunks of [`CHUNK_ZONES`] and always advancing the cursor to the end
/// of the last zone returned — even on a short reply — so repeated
/// calls make forward progress. Returns the number of zones written.
pub fn report_zones(
    dev: &Device,
    start_sector: Sector,
    ro: ReportingOptions,
    zones: &mut [Zone],
) -> Result<usize, ZbcError> {
    let mut filled = 0usize;
    let mut cursor = start_sector;
    let device_end = dev.info.sectors;

    while filled < zones.len() && cursor < device_end {
        let want = (zones.len() - filled).min(CHUNK_ZONES);
        let (n, _max_lba) =
            dev.backend()
                .report_zones_once(&dev.info, cursor, ro.with_partial().0, &mut zones[filled..filled + want])?;

        if n == 0 {
            break;
        }

        cursor = zones[filled + n - 1].end();
        filled += n;

        if n < want {
            // Short reply: the device had no more to report for this
            // request even though more buffer was offered.
            break;
        }
    }

    Ok(filled)
}

/// `list_zones(dev, start_sector, ro, max_zones)`:
/// convenience wrapper returning an owned `Vec<Zone>` rather than
/// filling a caller-supplied slice.
pub fn list_zones(
    dev: &Device,
    start_sector: Sector,
    ro: ReportingOptions,
    max_zones: usize,
) -> Result<Vec<Zone>, ZbcError> {
    let mut zones = vec![
        Zone {
            start: 0,
            length: 0,
            write_pointer: crate::zone::WP_INVALID,
            zone_type: crate::zone::ZoneType::Unknown,
            condition: crate::zone::ZoneCondition::NotWp,
            attributes: crate::zone::ZoneAttributes::empty(),
        };
        max_zones
    ];
    let n = report_zones(dev, start_sector, ro, &mut zones)?;
    zones.truncate(n);
    Ok(zones)
}

/// Page through every domain descriptor the device reports. Domain
/// lists are small (one per zone-type region) so this
/// issues a single oversized request rather than chunking.
pub fn report_domains(
    dev: &Device,
    start_sector: Sector,
    ro: ReportingOptions,
    max_domains: usize,
) -> Result<Vec<crate::domain::ZoneDomain>, ZbcError> {
    dev.backend()
        .report_domains(&dev.info, start_sector, ro.filter(), max_domains)
}

/// Page through every realm descriptor the device reports.
/// `known_domains` should be the result of a prior
/// [`report_domains`] call so realm spans can be enriched with zone
/// type and per-domain zone counts.
pub fn report_realms(
    dev: &Device,
    start_sector: Sector,
    ro: ReportingOptions,
    max_realms: usize,
    known_domains: &[crate::domain::ZoneDomain],
) -> Result<Vec<crate::domain::ZoneRealm>, ZbcError> {
    dev.backend()
        .report_realms(&dev.info, start_sector, ro.filter(), max_realms, known_domains)
}

/// `zone_op(dev, sector, op, all)`: issue RESET
/// WRITE POINTER / OPEN / CLOSE / FINISH ZONE against the zone
/// containing `sector`, or against every zone of the device when `all`
/// is set (in which case `sector` is ignored by the backend).
pub fn zone_op(dev: &Device, sector: Sector, op: ZoneOp, all: bool) -> Result<(), ZbcError> {
    dev.backend().zone_op(&dev.info, sector, op, all)
}

/// Reset the write pointer of the zone containing `sector`.
pub fn reset_zone(dev: &Device, sector: Sector) -> Result<(), ZbcError> {
    zone_op(dev, sector, ZoneOp::Reset, false)
}

/// Reset the write pointer of every zone on the device.
pub fn reset_all_zones(dev: &Device) -> Result<(), ZbcError> {
    zone_op(dev, 0, ZoneOp::Reset, true)
}

/// Open the zone containing `sector`.
pub fn open_zone(dev: &Device, sector: Sector) -> Result<(), ZbcError> {
    zone_op(dev, sector, ZoneOp::Open, false)
}

/// Close the zone containing `sector`.
pub fn close_zone(dev: &Device, sector: Sector) -> Result<(), ZbcError> {
    zone_op(dev, sector, ZoneOp::Close, false)
}

/// Finish (transition to FULL) the zone containing `sector`.
pub fn finish_zone(dev: &Device, sector: Sector) -> Result<(), ZbcError> {
    zone_op(dev, sector, ZoneOp::Finish, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    // report_zones's forward-progress guarantee and short-reply
    // termination are exercised end to end in the `device` module's
    // backend plumbing; here we just pin CHUNK_ZONES's relationship to
    // the fixed 64 B descriptor size used by both wire formats.
    #[test]
    fn chunk_size_is_a_whole_number_of_pages() {
        assert_eq!((CHUNK_ZONES * 64) % 4096, 0);
    }

    #[test]
    fn empty_zone_sentinel_has_invalid_write_pointer() {
        let z = Zone {
            start: 0,
            length: 0,
            write_pointer: crate::zone::WP_INVALID,
            zone_type: crate::zone::ZoneType::Unknown,
            condition: crate::zone::ZoneCondition::NotWp,
            attributes: crate::zone::ZoneAttributes::empty(),
        };
        assert!(!z.wp_is_valid());
    }
}
