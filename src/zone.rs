//! Zone model data structures (component C6).

use bitflags::bitflags;

/// A 512-byte sector count, the library's external unit of position
/// and length regardless of the device's native logical block size.
pub type Sector = u64;

/// Sentinel value for "not reported" / "no limit" fields.
pub const NOT_REPORTED: u32 = 0xFFFF_FFFF;
pub const NO_LIMIT: u32 = 0xFFFF_FFFF;

/// Sentinel write-pointer value for zones that have no meaningful one.
pub const WP_INVALID: Sector = Sector::MAX;

/// Zone type (wire byte 0 bits 3:0 of a REPORT ZONES descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneType {
    Unknown,
    Conventional,
    SequentialWriteRequired,
    SequentialWritePreferred,
    SequentialOrBeforeRequired,
    Gap,
}

impl ZoneType {
    pub fn from_wire(v: u8) -> ZoneType {
        match v & 0x0f {
            0x1 => ZoneType::Conventional,
            0x2 => ZoneType::SequentialWriteRequired,
            0x3 => ZoneType::SequentialWritePreferred,
            0x4 => ZoneType::SequentialOrBeforeRequired,
            0x5 => ZoneType::Gap,
            _ => ZoneType::Unknown,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            ZoneType::Unknown => 0x0,
            ZoneType::Conventional => 0x1,
            ZoneType::SequentialWriteRequired => 0x2,
            ZoneType::SequentialWritePreferred => 0x3,
            ZoneType::SequentialOrBeforeRequired => 0x4,
            ZoneType::Gap => 0x5,
        }
    }

    /// SOBR zones are treated as write-pointer zones whose random
    /// writes below the pointer are device-accepted.
    pub fn is_write_pointer(self) -> bool {
        matches!(
            self,
            ZoneType::SequentialWriteRequired
                | ZoneType::SequentialWritePreferred
                | ZoneType::SequentialOrBeforeRequired
        )
    }
}

/// Zone condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneCondition {
    NotWp,
    Empty,
    ImpOpen,
    ExpOpen,
    Closed,
    Inactive,
    ReadOnly,
    Full,
    Offline,
    Reserved(u8),
}

impl ZoneCondition {
    pub fn from_wire(v: u8) -> ZoneCondition {
        match (v >> 4) & 0x0f {
            0x0 => ZoneCondition::NotWp,
            0x1 => ZoneCondition::Empty,
            0x2 => ZoneCondition::ImpOpen,
            0x3 => ZoneCondition::ExpOpen,
            0x4 => ZoneCondition::Closed,
            0x5 => ZoneCondition::Inactive,
            0xd => ZoneCondition::ReadOnly,
            0xe => ZoneCondition::Full,
            0xf => ZoneCondition::Offline,
            other => ZoneCondition::Reserved(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        let nibble = match self {
            ZoneCondition::NotWp => 0x0,
            ZoneCondition::Empty => 0x1,
            ZoneCondition::ImpOpen => 0x2,
            ZoneCondition::ExpOpen => 0x3,
            ZoneCondition::Closed => 0x4,
            ZoneCondition::Inactive => 0x5,
            ZoneCondition::ReadOnly => 0xd,
            ZoneCondition::Full => 0xe,
            ZoneCondition::Offline => 0xf,
            ZoneCondition::Reserved(n) => n & 0x0f,
        };
        nibble << 4
    }
}

bitflags! {
    /// Zone attributes.
    #[derive(Default)]
    pub struct ZoneAttributes: u8 {
        const RWP_RECOMMENDED = 0x01;
        const NON_SEQ         = 0x02;
    }
}

/// A single zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    pub start: Sector,
    pub length: Sector,
    pub write_pointer: Sector,
    pub zone_type: ZoneType,
    pub condition: ZoneCondition,
    pub attributes: ZoneAttributes,
}

impl Zone {
    pub fn end(&self) -> Sector {
        self.start + self.length
    }

    pub fn is_write_pointer_zone(&self) -> bool {
        self.zone_type.is_write_pointer()
    }

    pub fn wp_is_valid(&self) -> bool {
        self.write_pointer != WP_INVALID
    }
}

/// Reporting options for REPORT ZONES. The low 6
/// bits select the filter; bit 7 is the "partial" flag and can be
/// or'ed onto any filter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportingOptions(pub u8);

impl ReportingOptions {
    pub const ALL: ReportingOptions = ReportingOptions(0x00);
    pub const EMPTY: ReportingOptions = ReportingOptions(0x01);
    pub const IMP_OPEN: ReportingOptions = ReportingOptions(0x02);
    pub const EXP_OPEN: ReportingOptions = ReportingOptions(0x03);
    pub const CLOSED: ReportingOptions = ReportingOptions(0x04);
    pub const FULL: ReportingOptions = ReportingOptions(0x05);
    pub const READ_ONLY: ReportingOptions = ReportingOptions(0x06);
    pub const OFFLINE: ReportingOptions = ReportingOptions(0x07);
    pub const INACTIVE: ReportingOptions = ReportingOptions(0x08);
    pub const RWP_RECOMMENDED: ReportingOptions = ReportingOptions(0x10);
    pub const NON_SEQ: ReportingOptions = ReportingOptions(0x11);
    pub const NOT_WP: ReportingOptions = ReportingOptions(0x3f);
    pub const PARTIAL: u8 = 0x80;

    /// Gap is reported via the same low-order option space as the
    /// other conditions; it has no dedicated standard code so the
    /// crate reserves 0x12, a vendor-defined value.
    pub const GAP: ReportingOptions = ReportingOptions(0x12);

    pub fn with_partial(self) -> ReportingOptions {
        ReportingOptions(self.0 | Self::PARTIAL)
    }

    pub fn is_partial(self) -> bool {
        self.0 & Self::PARTIAL != 0
    }

    pub fn filter(self) -> u8 {
        self.0 & 0x7f
    }
}

/// Device type: which backend is driving the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Unknown,
    Block,
    Scsi,
    Ata,
    Fake,
}

/// Device zone model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    Unknown,
    HostAware,
    HostManaged,
    DeviceManaged,
    Standard,
}

bitflags! {
    /// Device information flags.
    #[derive(Default)]
    pub struct DeviceFlags: u32 {
        const UNRESTRICTED_READ      = 0x0000_0001;
        const ZONE_DOMAINS_SUPPORT   = 0x0000_0002;
        const ZONE_REALMS_SUPPORT    = 0x0000_0004;
        const URSWRZ_SET_SUPPORT     = 0x0000_0008;
        const ZA_CONTROL_SUPPORT     = 0x0000_0010;
        const REPORT_REALMS_SUPPORT  = 0x0000_0020;
        const CONV_REALMS_SHIFTING   = 0x0000_0040;
        const SEQ_REQ_REALMS_SHIFTING = 0x0000_0080;
        const SEQ_PREF_REALMS_SHIFTING = 0x0000_0100;
        const SOBR_REALMS_SHIFTING   = 0x0000_0200;
    }
}

/// Device information.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_type: DeviceType,
    pub model: DeviceModel,
    pub vendor_id: String,
    pub flags: DeviceFlags,
    pub sectors: Sector,
    pub lblock_size: u32,
    pub lblocks: u64,
    pub pblock_size: u32,
    pub pblocks: u64,
    pub max_rw_sectors: u64,
    pub max_segments: u32,
    pub opt_nr_open_seq_pref: u32,
    pub opt_nr_non_seq_write_seq_pref: u32,
    pub max_nr_open_seq_req: u32,
    pub max_activation: u32,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            device_type: DeviceType::Unknown,
            model: DeviceModel::Unknown,
            vendor_id: String::new(),
            flags: DeviceFlags::default(),
            sectors: 0,
            lblock_size: 512,
            lblocks: 0,
            pblock_size: 512,
            pblocks: 0,
            max_rw_sectors: 0,
            max_segments: crate::sysfs::QueueLimits::default().max_segments,
            opt_nr_open_seq_pref: NOT_REPORTED,
            opt_nr_non_seq_write_seq_pref: NOT_REPORTED,
            max_nr_open_seq_req: NO_LIMIT,
            max_activation: NOT_REPORTED,
        }
    }
}

impl DeviceInfo {
    /// Convert a device-native LBA to a 512-byte sector count.
    pub fn lba_to_sect(&self, lba: u64) -> Sector {
        if lba == 0 {
            return 0;
        }
        (lba * self.lblock_size as u64) >> 9
    }

    /// Convert a 512-byte sector count to a device-native LBA.
    pub fn sect_to_lba(&self, sect: Sector) -> u64 {
        if sect == 0 {
            return 0;
        }
        (sect << 9) / self.lblock_size as u64
    }

    pub fn sect_laligned(&self, sect: Sector) -> bool {
        ((sect << 9) & (self.lblock_size as u64 - 1)) == 0
    }

    pub fn sect_paligned(&self, sect: Sector) -> bool {
        ((sect << 9) & (self.pblock_size as u64 - 1)) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lba_sector_roundtrip() {
        let mut info = DeviceInfo::default();
        info.lblock_size = 4096;
        for lba in [0u64, 1, 2, 1000, 1 << 20] {
            let sect = info.lba_to_sect(lba);
            assert_eq!(info.sect_to_lba(sect), lba);
        }
    }

    #[test]
    fn conventional_zone_has_no_write_pointer_semantics() {
        let z = Zone {
            start: 0,
            length: 1024,
            write_pointer: WP_INVALID,
            zone_type: ZoneType::Conventional,
            condition: ZoneCondition::NotWp,
            attributes: ZoneAttributes::empty(),
        };
        assert!(!z.is_write_pointer_zone());
        assert!(!z.wp_is_valid());
    }

    #[test]
    fn zone_type_wire_roundtrip() {
        for t in [
            ZoneType::Conventional,
            ZoneType::SequentialWriteRequired,
            ZoneType::SequentialWritePreferred,
            ZoneType::SequentialOrBeforeRequired,
            ZoneType::Gap,
        ] {
            assert_eq!(ZoneType::from_wire(t.to_wire()), t);
        }
    }

    #[test]
    fn sobr_is_treated_as_write_pointer_zone() {
        assert!(ZoneType::SequentialOrBeforeRequired.is_write_pointer());
    }

    #[test]
    fn reporting_option_partial_flag_is_independent_of_filter() {
        let ro = ReportingOptions::CLOSED.with_partial();
        assert!(ro.is_partial());
        assert_eq!(ro.filter(), ReportingOptions::CLOSED.0);
    }

    #[test]
    fn physical_alignment_is_stricter_than_logical_on_4k_over_512() {
        let mut info = DeviceInfo::default();
        info.lblock_size = 512;
        info.pblock_size = 4096;

        // sector 1 (byte offset 512) is logical-block aligned but not
        // physical-block aligned.
        assert!(info.sect_laligned(1));
        assert!(!info.sect_paligned(1));

        // sector 8 (byte offset 4096) is aligned to both.
        assert!(info.sect_laligned(8));
        assert!(info.sect_paligned(8));
    }
}
