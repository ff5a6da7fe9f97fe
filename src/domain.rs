//! Zone Domains, Zone Realms and Activation data structures
//! (component C8).

use crate::device::Device;
use crate::error::ZbcError;
use crate::zone::{Sector, ZoneCondition, ZoneType};
use bitflags::bitflags;

/// Reporting options for REPORT ZONE DOMAINS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainReportOptions(pub u8);

impl DomainReportOptions {
    pub const ALL: DomainReportOptions = DomainReportOptions(0x00);
}

/// A zone domain: a group of contiguous zones of one type.
#[derive(Debug, Clone)]
pub struct ZoneDomain {
    pub id: u8,
    pub zone_type: ZoneType,
    pub nr_zones: u64,
    pub start_sector: Sector,
    pub end_sector: Sector,
    pub flags: DomainFlags,
}

bitflags! {
    #[derive(Default)]
    pub struct DomainFlags: u32 {
        /// The domain's realm boundaries shift as realms are activated.
        const SHIFTING_BOUNDARIES = 0x0000_0001;
        const ACTIVE              = 0x0000_0002;
    }
}

/// Per-domain span within a realm descriptor.
#[derive(Debug, Clone, Copy)]
pub struct RealmDomainSpan {
    pub start_sector: Sector,
    pub end_sector: Sector,
    pub length_in_zones: u64,
    pub zone_type: ZoneType,
    pub domain_id: u8,
}

bitflags! {
    /// Bitmask of domains a realm can be activated into.
    #[derive(Default)]
    pub struct ActivationFlags: u16 {
        const CONVENTIONAL                 = 0x0001;
        const SEQUENTIAL_WRITE_REQUIRED     = 0x0002;
        const SEQUENTIAL_WRITE_PREFERRED    = 0x0004;
        const SEQUENTIAL_OR_BEFORE_REQUIRED = 0x0008;
    }
}

/// A zone realm: a region activatable into one of several zone types.
#[derive(Debug, Clone)]
pub struct ZoneRealm {
    pub number: u32,
    pub zone_type: ZoneType,
    pub domain_id: u8,
    pub activation_flags: ActivationFlags,
    pub restrictions: u16,
    pub domains: Vec<RealmDomainSpan>,
}

/// Activation record returned by ZONE QUERY / ZONE ACTIVATE.
#[derive(Debug, Clone, Copy)]
pub struct ActivationRecord {
    pub start_zone_sector: Sector,
    pub nr_zones: u64,
    pub zone_type: ZoneType,
    pub condition: ZoneCondition,
    pub domain_id: u8,
}

/// The `(FSNOZ, URSWRZ, max_activation)` control triple accepted by
/// `zone_activation_ctl`. Each field carries its own
/// "do not change" sentinel (the all-ones value of its width).
#[derive(Debug, Clone, Copy)]
pub struct ActivationControl {
    pub fsnoz: u32,
    pub urswrz: Option<bool>,
    pub max_activation: u32,
}

impl ActivationControl {
    pub const FSNOZ_NO_CHANGE: u32 = 0xFFFF_FFFF;
    pub const MAX_ACTIVATION_NO_CHANGE: u32 = 0xFFFF_FFFF;

    pub fn no_change() -> Self {
        ActivationControl {
            fsnoz: Self::FSNOZ_NO_CHANGE,
            urswrz: None,
            max_activation: Self::MAX_ACTIVATION_NO_CHANGE,
        }
    }
}

/// Parameters for ZONE ACTIVATE / ZONE QUERY. Built with
/// [`ZoneActivateRequestBuilder`] since most callers only care about
/// `start_sector`/`nr_zones`/`domain_id` and want sane defaults for the
/// rest.
#[derive(Default, Debug, Clone, Builder)]
pub struct ZoneActivateRequest {
    pub start_sector: Sector,
    pub nr_zones: u32,
    #[builder(default)]
    pub domain_id: u8,
    /// Query rather than activate: the device reports what would
    /// happen without changing any zone's type or condition.
    #[builder(default)]
    pub query: bool,
    /// Activate/query every realm of the device, ignoring `start_sector`
    /// and `nr_zones`.
    #[builder(default)]
    pub all: bool,
    /// Use the Zone Activation Results variant of the command (SCSI
    /// backend only).
    #[builder(default)]
    pub zsrc: bool,
    #[builder(default)]
    pub use_32b: bool,
    #[builder(default = "64")]
    pub max_records: usize,
}

/// `zone_activate(dev, req)`: activate the realm spanning
/// `req.start_sector`..`req.nr_zones`, or query what activating it would
/// do when `req.query` is set.
pub fn zone_activate(dev: &Device, req: &ZoneActivateRequest) -> Result<Vec<ActivationRecord>, ZbcError> {
    dev.backend().zone_activate_or_query(
        &dev.info,
        req.start_sector,
        req.nr_zones,
        req.domain_id,
        req.max_records,
        req.query,
        req.all,
        req.zsrc,
        req.use_32b,
    )
}

/// `zone_query(dev, req)`: convenience wrapper over
/// [`zone_activate`] that forces `query` on regardless of what the
/// caller set it to, so a `ZoneActivateRequest` built for activation can
/// be dry-run without rebuilding it.
pub fn zone_query(dev: &Device, req: &ZoneActivateRequest) -> Result<Vec<ActivationRecord>, ZbcError> {
    let mut req = req.clone();
    req.query = true;
    zone_activate(dev, &req)
}

/// `zone_activation_ctl(dev, ctl)`: set FSNOZ, URSWRZ
/// and/or the maximum number of simultaneously activated realms. Fields
/// left at [`ActivationControl::no_change`]'s sentinel are not touched.
pub fn zone_activation_ctl(dev: &Device, ctl: ActivationControl) -> Result<(), ZbcError> {
    dev.backend().zone_activation_ctl(ctl)
}

/// `get_stats(dev)`: ZBD
/// statistics are not implemented by any backend, so this always
/// returns `NotSupported`.
pub fn get_stats(dev: &Device) -> Result<(), ZbcError> {
    dev.backend().get_stats()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_change_sentinel_is_all_ones() {
        let c = ActivationControl::no_change();
        assert_eq!(c.fsnoz, 0xFFFF_FFFF);
        assert_eq!(c.max_activation, 0xFFFF_FFFF);
        assert!(c.urswrz.is_none());
    }

    #[test]
    fn activation_flags_bitmask_combines() {
        let f = ActivationFlags::CONVENTIONAL
            | ActivationFlags::SEQUENTIAL_WRITE_REQUIRED;
        assert!(f.contains(ActivationFlags::CONVENTIONAL));
        assert!(f.contains(ActivationFlags::SEQUENTIAL_WRITE_REQUIRED));
        assert!(!f.contains(ActivationFlags::SEQUENTIAL_WRITE_PREFERRED));
    }

    #[test]
    fn activate_request_builder_fills_in_defaults() {
        let req = ZoneActivateRequestBuilder::default()
            .start_sector(1024)
            .nr_zones(4)
            .build()
            .unwrap();
        assert_eq!(req.start_sector, 1024);
        assert_eq!(req.nr_zones, 4);
        assert_eq!(req.domain_id, 0);
        assert!(!req.query);
        assert!(!req.all);
        assert_eq!(req.max_records, 64);
    }
}
