//! ATA pass-through command set, 16-byte CDB wrapped in SCSI ATA16
//! (component C2). Device classification, the zoned
//! device information log page, and Zone Domains/Realms/Activation
//! management commands (ZAC MANAGEMENT IN/OUT).

use crate::domain::{ActivationControl, ActivationFlags, DomainFlags, RealmDomainSpan, ZoneDomain, ZoneRealm};
use crate::error::ZbcError;
use crate::sg::{self, DataBuf, Direction, SgCommand, SgOutcome};
use crate::zone::{DeviceFlags, DeviceInfo, DeviceModel, DeviceType, Sector, Zone, ZoneType};
use std::os::unix::io::RawFd;
use std::time::Duration;

const ATA16_OPCODE: u8 = 0x85;
const IDENTIFY: u8 = 0xec;
const EXEC_DEV_DIAGNOSTIC: u8 = 0x90;
const READ_LOG_DMA_EXT: u8 = 0x47;
const SET_FEATURES: u8 = 0xef;
const READ_DMA_EXT: u8 = 0x25;
const WRITE_DMA_EXT: u8 = 0x35;
const FLUSH_CACHE_EXT: u8 = 0xea;
const ZAC_MANAGEMENT_IN: u8 = 0x4a;
const ZAC_MANAGEMENT_OUT: u8 = 0x9f;

const REPORT_ZONES_EXT_AF: u8 = 0x00;
const REPORT_REALMS_AF: u8 = 0x06;
const REPORT_ZONE_DOMAINS_AF: u8 = 0x07;
const ZONE_ACTIVATE_AF: u8 = 0x08;
const ZONE_QUERY_AF: u8 = 0x09;

const CLOSE_ZONE_EXT_AF: u8 = 0x01;
const FINISH_ZONE_EXT_AF: u8 = 0x02;
const OPEN_ZONE_EXT_AF: u8 = 0x03;
const RESET_WRITE_POINTER_EXT_AF: u8 = 0x04;

const SUPPORTED_CAPABILITIES_PAGE: u8 = 0x03;
const ZONED_DEVICE_INFORMATION_PAGE: u8 = 0x09;
const IDENTIFY_DEVICE_DATA_LOG_ADDR: u8 = 0x30;

const ZONE_DESCRIPTOR_LENGTH: usize = 64;
const ZONE_DESCRIPTOR_OFFSET: usize = 64;
const RPT_DOMAINS_HEADER_SIZE: usize = 64;
const RPT_DOMAINS_RECORD_SIZE: usize = 96;
const RPT_REALMS_HEADER_SIZE: usize = 64;
const RPT_REALMS_RECORD_SIZE: usize = 128;
const RPT_REALMS_DESC_OFFSET: usize = 16;
const RPT_REALMS_SE_DESC_SIZE: usize = 16;

const ACTV_RES_HEADER_SIZE: usize = 64;
const ACTV_RES_RECORD_SIZE: usize = 32;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
// Zone activation can restripe a large range of media; the original
// implementation gives it a much longer timeout than other commands.
const ZONE_ACTIVATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Put a 48-bit ATA LBA into CDB bytes `[7, 9, 11, 8, 10, 12]` order
/// (the interleaved ATA16 layout).
fn put_lba(cdb: &mut [u8; 16], lba: u64) {
    cdb[7] = ((lba >> 24) & 0xff) as u8;
    cdb[8] = (lba & 0xff) as u8;
    cdb[9] = ((lba >> 32) & 0xff) as u8;
    cdb[10] = ((lba >> 8) & 0xff) as u8;
    cdb[11] = ((lba >> 40) & 0xff) as u8;
    cdb[12] = ((lba >> 16) & 0xff) as u8;
}

/// Put a 28-bit LBA for the SET FEATURES CDB layout.
fn put_feat_lba(cdb: &mut [u8; 16], lba: u64) {
    cdb[8] = (lba & 0xff) as u8;
    cdb[10] = ((lba >> 8) & 0xff) as u8;
    cdb[12] = ((lba >> 16) & 0xff) as u8;
    cdb[13] = (((lba >> 24) & 0x0f) as u8) | (1 << 6);
}

fn exec(fd: RawFd, mut cmd: SgCommand) -> Result<sg::SgResult, ZbcError> {
    let r = sg::submit(fd, &mut cmd)?;
    match r.outcome {
        SgOutcome::Ok => Ok(r),
        SgOutcome::Timeout => Err(ZbcError::Timeout {
            timeout: cmd.timeout,
        }),
        SgOutcome::DeviceError => {
            if sg::is_ata_status_error_descriptor(&r.sense[..r.sense_len]) {
                let e = crate::error::last_error();
                if e.sense_key.0 == 0 {
                    return request_sense_data_ext(fd).map(|_| r);
                }
            }
            let e = crate::error::last_error();
            Err(ZbcError::DeviceError {
                sense_key: e.sense_key,
                asc_ascq: e.asc_ascq,
            })
        }
        SgOutcome::TransportError => Err(ZbcError::TransientTransport {
            text: format!(
                "status 0x{:02x} host_status 0x{:04x} driver_status 0x{:04x}",
                r.status, r.host_status, r.driver_status
            ),
        }),
    }
}

/// REQUEST SENSE DATA EXT (0x0B): recover sense after a check
/// condition whose HBA did not already surface one.
fn request_sense_data_ext(fd: RawFd) -> Result<(), ZbcError> {
    let mut cmd = SgCommand::new(16, Direction::None, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = (0x3 << 1) | 0x01;
    cmd.cdb[2] = 0x1 << 5;
    cmd.cdb[14] = 0x0b;
    let r = sg::submit(fd, &mut cmd)?;
    if r.sense_len > 8 {
        let sk = r.sense[19] & 0x0f;
        let asc = r.sense[17];
        let ascq = r.sense[15];
        crate::error::set_last_error(crate::error::LastError {
            sense_key: crate::error::SenseKey(sk),
            asc_ascq: crate::error::AscAscq(((asc as u16) << 8) | ascq as u16),
            ..Default::default()
        });
    }
    Ok(())
}

/// IDENTIFY DEVICE.
pub fn identify(fd: RawFd) -> Result<[u8; 512], ZbcError> {
    let mut buf = [0u8; 512];
    let mut cmd = SgCommand::new(16, Direction::FromDevice, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = 0x08;
    cmd.cdb[2] = 0x0e;
    cmd.cdb[14] = IDENTIFY;
    cmd.data = DataBuf::Single(&mut buf);
    exec(fd, cmd)?;
    Ok(buf)
}

fn read_log(fd: RawFd, log: u8, page: u16, buf: &mut [u8]) -> Result<(), ZbcError> {
    let lba_count = (buf.len() / 512) as u16;
    let mut cmd = SgCommand::new(16, Direction::FromDevice, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = (0x6 << 1) | 0x01;
    cmd.cdb[2] = 0x0e;
    cmd.cdb[5] = (lba_count >> 8) as u8;
    cmd.cdb[6] = lba_count as u8;
    cmd.cdb[8] = log;
    cmd.cdb[9] = (page >> 8) as u8;
    cmd.cdb[10] = page as u8;
    cmd.cdb[14] = READ_LOG_DMA_EXT;
    cmd.data = DataBuf::Single(buf);
    exec(fd, cmd)?;
    Ok(())
}

/// EXEC DEV DIAGNOSTIC with `ck_cond=1`: the SAT layer
/// returns the ATA device signature as a descriptor-format check
/// condition rather than as command data, so this does not go through
/// [`exec`] — a `CHECK CONDITION` here is the expected, successful
/// outcome. Returns `(LBA(15:8), LBA(47:40))`, the two bytes the source
/// library combines into the 16-bit signature.
fn exec_dev_diagnostic_signature(fd: RawFd) -> Result<(u8, u8), ZbcError> {
    let mut cmd = SgCommand::new(16, Direction::None, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = (0x3 << 1) | 0x1;
    cmd.cdb[2] = 0x1 << 5;
    cmd.cdb[14] = EXEC_DEV_DIAGNOSTIC;
    let r = sg::submit(fd, &mut cmd)?;
    if r.sense_len < 12 {
        return Err(ZbcError::TransientTransport {
            text: "EXEC DEV DIAGNOSTIC returned no ATA Return descriptor".into(),
        });
    }
    let desc = &r.sense[8..r.sense_len];
    Ok((desc[9], desc[11]))
}

/// Read the ZONED field (bits 1:0) of the Supported Capabilities log
/// page (30h/03h), qword at byte offset 104; valid only when bit 63 of
/// that qword is set.
fn supported_capabilities_zoned_field(fd: RawFd) -> Result<u8, ZbcError> {
    let mut buf = [0u8; 512];
    read_log(
        fd,
        IDENTIFY_DEVICE_DATA_LOG_ADDR,
        SUPPORTED_CAPABILITIES_PAGE as u16,
        &mut buf,
    )?;
    let qwd = u64::from_le_bytes(buf[104..112].try_into().unwrap());
    if qwd & (1 << 63) == 0 {
        return Ok(0);
    }
    Ok((qwd & 0x03) as u8)
}

/// Classify an ATA device by signature (EXEC DEV DIAGNOSTIC) and the
/// Supported Capabilities / Zoned Device Information log pages.
/// Device-managed and plain standard ATA disks are reported as
/// `NotSupported`, matching the treatment `scsi::classify` gives their
/// SCSI equivalents: this library only drives devices
/// that expose ZBC/ZAC zone commands.
pub fn classify(fd: RawFd) -> Result<(DeviceType, DeviceModel, DeviceFlags, String), ZbcError> {
    let id = identify(fd)?;
    let word = |n: usize| u16::from_le_bytes([id[2 * n], id[2 * n + 1]]);

    let model_words: Vec<u16> = (27..47).map(word).collect();
    let mut model_bytes = Vec::with_capacity(40);
    for w in &model_words {
        model_bytes.push((w >> 8) as u8);
        model_bytes.push((*w & 0xff) as u8);
    }
    let vendor_id = String::from_utf8_lossy(&model_bytes).trim().to_string();

    let (lba_low, lba_high) = exec_dev_diagnostic_signature(fd)?;
    let signature = ((lba_high as u16) << 8) | lba_low as u16;

    let mut model = match signature {
        0xABCD => DeviceModel::HostManaged,
        0x0000 => DeviceModel::Unknown,
        other => {
            return Err(ZbcError::NotSupported {
                text: format!("unsupported ATA device signature 0x{:04x}", other),
            });
        }
    };

    if matches!(model, DeviceModel::Unknown) {
        let zoned = supported_capabilities_zoned_field(fd)?;
        model = match zoned {
            0x00 => DeviceModel::Standard,
            0x01 => DeviceModel::HostAware,
            0x02 => {
                return Err(ZbcError::NotSupported {
                    text: "device-managed ATA device".into(),
                })
            }
            other => {
                return Err(ZbcError::NotSupported {
                    text: format!("unknown ATA ZONED field 0x{:02x}", other),
                })
            }
        };
    } else if let Ok(zoned) = supported_capabilities_zoned_field(fd) {
        if zoned != 0 {
            log::warn!(
                "host-managed ATA device reports non-zero ZONED field 0x{:02x}",
                zoned
            );
        }
    }

    // Zoned Device Information page (30h/09h): a Zone
    // Domains/Realms-capable device reports it here even when its
    // signature/ZONED field otherwise looked like a standard drive,
    // which promotes it to host-managed.
    let mut buf = [0u8; 512];
    let zdi = read_log(
        fd,
        IDENTIFY_DEVICE_DATA_LOG_ADDR,
        ZONED_DEVICE_INFORMATION_PAGE as u16,
        &mut buf,
    );

    let mut flags = DeviceFlags::default();
    if zdi.is_ok() {
        let qwd = |n: usize| u64::from_le_bytes(buf[8 * n..8 * n + 8].try_into().unwrap());
        let qwd7 = qwd(7);
        if qwd7 & 0x01 != 0 {
            flags |= DeviceFlags::ZONE_DOMAINS_SUPPORT;
        }
        if qwd7 & 0x02 != 0 {
            flags |= DeviceFlags::ZONE_REALMS_SUPPORT;
        }
        if flags.intersects(DeviceFlags::ZONE_DOMAINS_SUPPORT | DeviceFlags::ZONE_REALMS_SUPPORT) {
            model = DeviceModel::HostManaged;
            if qwd7 & 0x04 != 0 {
                flags |= DeviceFlags::URSWRZ_SET_SUPPORT;
            }
            if qwd7 & 0x08 != 0 {
                flags |= DeviceFlags::ZA_CONTROL_SUPPORT;
            }
            if qwd7 & 0x20 != 0 {
                flags |= DeviceFlags::REPORT_REALMS_SUPPORT;
            }
        }

        if qwd(1) & 0x01 != 0 {
            flags |= DeviceFlags::UNRESTRICTED_READ;
        }
    } else if matches!(model, DeviceModel::Standard) {
        return Err(ZbcError::NotSupported {
            text: "standard (non-zoned) ATA block device".into(),
        });
    }

    Ok((DeviceType::Ata, model, flags, vendor_id))
}

/// SET FEATURES(sub-command), used for ZONE ACTIVATION CONTROL
/// adjacent features.
pub fn set_features(fd: RawFd, feature: u8, lba: u64, count: u8) -> Result<(), ZbcError> {
    let mut cmd = SgCommand::new(16, Direction::None, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = 0x3 << 1;
    cmd.cdb[4] = feature;
    cmd.cdb[6] = count;
    put_feat_lba(&mut cmd.cdb, lba);
    cmd.cdb[14] = SET_FEATURES;
    exec(fd, cmd)?;
    Ok(())
}

/// REPORT ZONES EXT via ZAC MANAGEMENT IN.
pub fn report_zones(
    fd: RawFd,
    info: &DeviceInfo,
    start_sector: Sector,
    ro: u8,
    zones: &mut [Zone],
    raw_buf: &mut [u8],
) -> Result<(usize, u64), ZbcError> {
    let lba = info.sect_to_lba(start_sector);
    let count = (raw_buf.len() / 512) as u16;

    let mut cmd = SgCommand::new(16, Direction::FromDevice, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = (0x6 << 1) | 0x01;
    cmd.cdb[2] = 0x0e;
    cmd.cdb[3] = ro & 0xbf;
    cmd.cdb[4] = REPORT_ZONES_EXT_AF;
    cmd.cdb[5] = (count >> 8) as u8;
    cmd.cdb[6] = count as u8;
    put_lba(&mut cmd.cdb, lba);
    cmd.cdb[13] = 1 << 6;
    cmd.cdb[14] = ZAC_MANAGEMENT_IN;
    cmd.data = DataBuf::Single(raw_buf);
    exec(fd, cmd)?;

    if raw_buf.len() < ZONE_DESCRIPTOR_OFFSET {
        return Err(ZbcError::TransientTransport {
            text: "report zones reply shorter than header".into(),
        });
    }

    let list_len = u32::from_le_bytes(raw_buf[0..4].try_into().unwrap()) as usize;
    let max_lba = u64::from_le_bytes(raw_buf[8..16].try_into().unwrap());
    let mut nz = list_len / ZONE_DESCRIPTOR_LENGTH;
    if nz > zones.len() {
        nz = zones.len();
    }
    let buf_nz = (raw_buf.len() - ZONE_DESCRIPTOR_OFFSET) / ZONE_DESCRIPTOR_LENGTH;
    if nz > buf_nz {
        nz = buf_nz;
    }

    for i in 0..nz {
        let d = &raw_buf[ZONE_DESCRIPTOR_OFFSET + i * ZONE_DESCRIPTOR_LENGTH..];
        let zone_type = ZoneType::from_wire(d[0]);
        let length = info.lba_to_sect(u64::from_le_bytes(d[8..16].try_into().unwrap()));
        let start = info.lba_to_sect(u64::from_le_bytes(d[16..24].try_into().unwrap()));
        let write_pointer = if zone_type.is_write_pointer() {
            info.lba_to_sect(u64::from_le_bytes(d[24..32].try_into().unwrap()))
        } else {
            crate::zone::WP_INVALID
        };
        zones[i] = Zone {
            start,
            length,
            write_pointer,
            zone_type,
            condition: crate::zone::ZoneCondition::from_wire(d[1]),
            attributes: crate::zone::ZoneAttributes::from_bits_truncate(d[1] & 0x03),
        };
    }

    Ok((nz, max_lba))
}

/// Zone command action codes for ZAC MANAGEMENT OUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneOp {
    Reset,
    Open,
    Close,
    Finish,
}

pub fn zone_op(
    fd: RawFd,
    info: &DeviceInfo,
    sector: Sector,
    op: ZoneOp,
    all: bool,
) -> Result<(), ZbcError> {
    let af = match op {
        ZoneOp::Reset => RESET_WRITE_POINTER_EXT_AF,
        ZoneOp::Open => OPEN_ZONE_EXT_AF,
        ZoneOp::Close => CLOSE_ZONE_EXT_AF,
        ZoneOp::Finish => FINISH_ZONE_EXT_AF,
    };

    let mut cmd = SgCommand::new(16, Direction::None, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = 0x3 << 1;
    cmd.cdb[4] = af;
    if all {
        cmd.cdb[3] = 0x01;
    } else {
        put_lba(&mut cmd.cdb, info.sect_to_lba(sector));
    }
    cmd.cdb[13] = 1 << 6;
    cmd.cdb[14] = ZAC_MANAGEMENT_OUT;
    exec(fd, cmd)?;
    Ok(())
}

pub fn read_dma_ext(
    fd: RawFd,
    info: &DeviceInfo,
    offset: Sector,
    buf: &mut [u8],
) -> Result<usize, ZbcError> {
    let lba = info.sect_to_lba(offset);
    let count = (buf.len() / info.lblock_size as usize) as u16;
    let mut cmd = SgCommand::new(16, Direction::FromDevice, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = (0x6 << 1) | 0x01;
    cmd.cdb[2] = 0x0e;
    cmd.cdb[5] = (count >> 8) as u8;
    cmd.cdb[6] = count as u8;
    put_lba(&mut cmd.cdb, lba);
    cmd.cdb[13] = 1 << 6;
    cmd.cdb[14] = READ_DMA_EXT;
    let len = buf.len();
    cmd.data = DataBuf::Single(buf);
    let r = exec(fd, cmd)?;
    Ok((len as i64 - r.residual as i64) as usize >> 9)
}

pub fn write_dma_ext(
    fd: RawFd,
    info: &DeviceInfo,
    offset: Sector,
    buf: &mut [u8],
) -> Result<usize, ZbcError> {
    let lba = info.sect_to_lba(offset);
    let count = (buf.len() / info.lblock_size as usize) as u16;
    let mut cmd = SgCommand::new(16, Direction::ToDevice, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = (0x6 << 1) | 0x01;
    cmd.cdb[2] = 0x06;
    cmd.cdb[5] = (count >> 8) as u8;
    cmd.cdb[6] = count as u8;
    put_lba(&mut cmd.cdb, lba);
    cmd.cdb[13] = 1 << 6;
    cmd.cdb[14] = WRITE_DMA_EXT;
    let len = buf.len();
    cmd.data = DataBuf::Single(buf);
    let r = exec(fd, cmd)?;
    Ok((len as i64 - r.residual as i64) as usize >> 9)
}

/// Vectored form of [`read_dma_ext`]: one READ DMA EXT spanning a
/// caller-supplied scatter list.
pub fn read_dma_ext_v(
    fd: RawFd,
    info: &DeviceInfo,
    offset: Sector,
    iov: &mut [std::io::IoSliceMut],
) -> Result<usize, ZbcError> {
    let len: usize = iov.iter().map(|s| s.len()).sum();
    let lba = info.sect_to_lba(offset);
    let count = (len / info.lblock_size as usize) as u16;
    let mut cmd = SgCommand::new(16, Direction::FromDevice, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = (0x6 << 1) | 0x01;
    cmd.cdb[2] = 0x0e;
    cmd.cdb[5] = (count >> 8) as u8;
    cmd.cdb[6] = count as u8;
    put_lba(&mut cmd.cdb, lba);
    cmd.cdb[13] = 1 << 6;
    cmd.cdb[14] = READ_DMA_EXT;
    cmd.data = DataBuf::Scatter(iov);
    let r = exec(fd, cmd)?;
    Ok((len as i64 - r.residual as i64) as usize >> 9)
}

/// Vectored form of [`write_dma_ext`].
pub fn write_dma_ext_v(
    fd: RawFd,
    info: &DeviceInfo,
    offset: Sector,
    iov: &[std::io::IoSlice],
) -> Result<usize, ZbcError> {
    let len: usize = iov.iter().map(|s| s.len()).sum();
    let lba = info.sect_to_lba(offset);
    let count = (len / info.lblock_size as usize) as u16;
    let mut cmd = SgCommand::new(16, Direction::ToDevice, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = (0x6 << 1) | 0x01;
    cmd.cdb[2] = 0x06;
    cmd.cdb[5] = (count >> 8) as u8;
    cmd.cdb[6] = count as u8;
    put_lba(&mut cmd.cdb, lba);
    cmd.cdb[13] = 1 << 6;
    cmd.cdb[14] = WRITE_DMA_EXT;
    cmd.data = DataBuf::Gather(iov);
    let r = exec(fd, cmd)?;
    Ok((len as i64 - r.residual as i64) as usize >> 9)
}

pub fn flush_cache_ext(fd: RawFd) -> Result<(), ZbcError> {
    let mut cmd = SgCommand::new(16, Direction::None, Duration::from_secs(60));
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = 0x3 << 1;
    cmd.cdb[13] = 1 << 6;
    cmd.cdb[14] = FLUSH_CACHE_EXT;
    exec(fd, cmd)?;
    Ok(())
}

/// REPORT ZONE DOMAINS. Returns parsed domains.
pub fn report_domains(
    fd: RawFd,
    info: &DeviceInfo,
    start_sector: Sector,
    ro: u8,
    nr_domains: usize,
) -> Result<Vec<ZoneDomain>, ZbcError> {
    let lba = info.sect_to_lba(start_sector);
    let bufsz = RPT_DOMAINS_HEADER_SIZE + nr_domains * RPT_DOMAINS_RECORD_SIZE;
    let mut buf = vec![0u8; bufsz];
    let count = (bufsz / 512).max(1) as u16;

    let mut cmd = SgCommand::new(16, Direction::FromDevice, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = (0x6 << 1) | 0x01;
    cmd.cdb[2] = 0x0e;
    cmd.cdb[3] = ro & 0x3f;
    cmd.cdb[4] = REPORT_ZONE_DOMAINS_AF;
    cmd.cdb[5] = (count >> 8) as u8;
    cmd.cdb[6] = count as u8;
    put_lba(&mut cmd.cdb, lba);
    cmd.cdb[13] = 1 << 6;
    cmd.cdb[14] = ZAC_MANAGEMENT_IN;
    cmd.data = DataBuf::Single(&mut buf);
    exec(fd, cmd)?;

    let list_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
    let mut nd = list_len / RPT_DOMAINS_RECORD_SIZE;
    let buf_nd = (buf.len().saturating_sub(RPT_DOMAINS_HEADER_SIZE)) / RPT_DOMAINS_RECORD_SIZE;
    if nd > buf_nd {
        nd = buf_nd;
    }

    let mut out = Vec::with_capacity(nd);
    for i in 0..nd {
        // Wire layout: id byte 0, nr_zones bytes 16..23,
        // start/end LBAs bytes 24..31 / 32..39, type byte 40, flags
        // bytes 42..45.
        let d = &buf[RPT_DOMAINS_HEADER_SIZE + i * RPT_DOMAINS_RECORD_SIZE..];
        let id = d[0];
        let nr_zones = u64::from_le_bytes(d[16..24].try_into().unwrap());
        let start_sector = info.lba_to_sect(u64::from_le_bytes(d[24..32].try_into().unwrap()));
        let end_sector = info.lba_to_sect(u64::from_le_bytes(d[32..40].try_into().unwrap()));
        let zone_type = ZoneType::from_wire(d[40]);
        let flags_raw = u32::from_le_bytes(d[42..46].try_into().unwrap());
        let mut flags = DomainFlags::default();
        if flags_raw & 0x01 != 0 {
            flags |= DomainFlags::SHIFTING_BOUNDARIES;
        }
        if flags_raw & 0x02 != 0 {
            flags |= DomainFlags::ACTIVE;
        }
        out.push(ZoneDomain {
            id,
            zone_type,
            nr_zones,
            start_sector,
            end_sector,
            flags,
        });
    }
    Ok(out)
}

/// REPORT REALMS. `known_domains` is the device's
/// previously reported domain list; it enriches each realm's per-domain
/// span with the domain's zone type and zone-count-based length (the
/// wire record itself carries only start/end LBA pairs).
pub fn report_realms(
    fd: RawFd,
    info: &DeviceInfo,
    start_sector: Sector,
    ro: u8,
    nr_realms: usize,
    known_domains: &[ZoneDomain],
) -> Result<Vec<ZoneRealm>, ZbcError> {
    let lba = info.sect_to_lba(start_sector);
    let bufsz = RPT_REALMS_HEADER_SIZE + nr_realms * RPT_REALMS_RECORD_SIZE;
    let mut buf = vec![0u8; bufsz];
    let count = (bufsz / 512).max(1) as u16;

    let mut cmd = SgCommand::new(16, Direction::FromDevice, DEFAULT_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = (0x6 << 1) | 0x01;
    cmd.cdb[2] = 0x0e;
    cmd.cdb[3] = ro & 0x3f;
    cmd.cdb[4] = REPORT_REALMS_AF;
    cmd.cdb[5] = (count >> 8) as u8;
    cmd.cdb[6] = count as u8;
    put_lba(&mut cmd.cdb, lba);
    cmd.cdb[13] = 1 << 6;
    cmd.cdb[14] = ZAC_MANAGEMENT_IN;
    cmd.data = DataBuf::Single(&mut buf);
    exec(fd, cmd)?;

    // Header: realm count bytes 0..3, descriptor length
    // bytes 4..7.
    let hdr_count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let buf_nr = (buf.len().saturating_sub(RPT_REALMS_HEADER_SIZE)) / RPT_REALMS_RECORD_SIZE;
    let nr = hdr_count.min(buf_nr);

    let mut out = Vec::with_capacity(nr);
    for i in 0..nr {
        // Descriptor: realm number bytes 0..3, restrictions
        // bytes 4..5, domain id byte 7, then per-domain start/end LBA
        // pairs from offset 16, 16 bytes each.
        let d = &buf[RPT_REALMS_HEADER_SIZE + i * RPT_REALMS_RECORD_SIZE..];
        let number = u32::from_le_bytes(d[0..4].try_into().unwrap());
        let restrictions = u16::from_le_bytes(d[4..6].try_into().unwrap());
        let domain_id = d[7];

        let n_spans = (RPT_REALMS_RECORD_SIZE - RPT_REALMS_DESC_OFFSET) / RPT_REALMS_SE_DESC_SIZE;
        let mut domains = Vec::with_capacity(n_spans);
        let mut activation_flags = ActivationFlags::empty();
        for j in 0..n_spans {
            let sd = &d[RPT_REALMS_DESC_OFFSET + j * RPT_REALMS_SE_DESC_SIZE..];
            let start_sector = info.lba_to_sect(u64::from_le_bytes(sd[0..8].try_into().unwrap()));
            let end_sector = info.lba_to_sect(u64::from_le_bytes(sd[8..16].try_into().unwrap()));
            if end_sector == 0 {
                continue;
            }
            activation_flags |= ActivationFlags::from_bits_truncate(1u16 << j);
            let dom = known_domains.iter().find(|dm| dm.id as usize == j);
            let zone_type = dom.map(|dm| dm.zone_type).unwrap_or(ZoneType::Unknown);
            let length_in_zones = dom
                .filter(|dm| dm.nr_zones > 0 && dm.end_sector > dm.start_sector)
                .map(|dm| {
                    let zone_size = (dm.end_sector - dm.start_sector) / dm.nr_zones;
                    if zone_size == 0 {
                        0
                    } else {
                        (end_sector - start_sector) / zone_size
                    }
                })
                .unwrap_or(0);
            domains.push(RealmDomainSpan {
                start_sector,
                end_sector,
                length_in_zones,
                zone_type,
                domain_id: j as u8,
            });
        }

        let zone_type = known_domains
            .iter()
            .find(|dm| dm.id == domain_id)
            .map(|dm| dm.zone_type)
            .unwrap_or(ZoneType::Unknown);

        out.push(ZoneRealm {
            number,
            zone_type,
            domain_id,
            activation_flags,
            restrictions,
            domains,
        });
    }
    Ok(out)
}

/// ZONE ACTIVATE / ZONE QUERY. `zsrc = true` selects the
/// 32-byte zone-start/range-count form, which has no ATA CDB encoding;
/// per the Open Question decision recorded for this backend it is
/// unconditionally rejected here, `all` forces `zsrc` off first the way
/// the native command set does.
pub fn zone_activate_or_query(
    fd: RawFd,
    info: &DeviceInfo,
    start_sector: Sector,
    domain_id: u8,
    max_records: usize,
    query: bool,
    all: bool,
    zsrc: bool,
) -> Result<Vec<crate::domain::ActivationRecord>, ZbcError> {
    let zsrc = zsrc && !all;
    if zsrc {
        return Err(ZbcError::NotSupported {
            text: "32-byte zone-start/range-count ZONE ACTIVATE/QUERY form is not supported \
                   over the ATA pass-through backend"
                .into(),
        });
    }

    let lba = info.sect_to_lba(start_sector);
    let bufsz = ACTV_RES_HEADER_SIZE + max_records * ACTV_RES_RECORD_SIZE;
    let mut buf = vec![0u8; bufsz];
    let count = (bufsz / 512).max(1) as u16;

    let mut cmd = SgCommand::new(16, Direction::FromDevice, ZONE_ACTIVATE_TIMEOUT);
    cmd.cdb[0] = ATA16_OPCODE;
    cmd.cdb[1] = (0x6 << 1) | 0x01;
    cmd.cdb[2] = 0x0e;
    cmd.cdb[3] = domain_id;
    cmd.cdb[4] = if query { ZONE_QUERY_AF } else { ZONE_ACTIVATE_AF };
    if all {
        cmd.cdb[4] |= 0x80;
    }
    cmd.cdb[5] = (count >> 8) as u8;
    cmd.cdb[6] = count as u8;
    put_lba(&mut cmd.cdb, lba);
    cmd.cdb[13] = 1 << 6;
    cmd.cdb[14] = ZAC_MANAGEMENT_IN;
    cmd.data = DataBuf::Single(&mut buf);
    exec(fd, cmd)?;

    // Status: byte 8 bit 0 is ACTIVATED, bit 6 marks a
    // valid Zone ID With Unmet Prerequisites at bytes 24..32; byte 9
    // carries the low status byte.
    let activated = buf[8] & 0x01 != 0;
    let ziwup_valid = buf[8] & 0x40 != 0;
    if (!activated && !query) || ziwup_valid {
        let cbf = info.lba_to_sect(u64::from_le_bytes(buf[24..32].try_into().unwrap()));
        return Err(ZbcError::ActivationError {
            sense_key: crate::error::SenseKey::NONE,
            asc_ascq: crate::error::AscAscq::NONE,
            activation_status: crate::error::ActivationStatus(buf[9]),
            check_boundary_first: cbf,
        });
    }

    let list_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
    let mut nr = list_len / ACTV_RES_RECORD_SIZE;
    let buf_nr = (buf.len().saturating_sub(ACTV_RES_HEADER_SIZE)) / ACTV_RES_RECORD_SIZE;
    if nr > buf_nr {
        nr = buf_nr;
    }

    let mut out = Vec::with_capacity(nr);
    for i in 0..nr {
        let d = &buf[ACTV_RES_HEADER_SIZE + i * ACTV_RES_RECORD_SIZE..];
        let zone_type = ZoneType::from_wire(d[0]);
        let condition = crate::zone::ZoneCondition::from_wire(d[1]);
        let record_domain_id = d[2];
        let nr_zones = u64::from_le_bytes(d[8..16].try_into().unwrap());
        let start_zone_sector =
            info.lba_to_sect(u64::from_le_bytes(d[16..24].try_into().unwrap()));
        out.push(crate::domain::ActivationRecord {
            start_zone_sector,
            nr_zones,
            zone_type,
            condition,
            domain_id: record_domain_id,
        });
    }
    Ok(out)
}

/// ZONE ACTIVATION CONTROL, via SET FEATURES sub-features.
pub fn zone_activation_ctl(fd: RawFd, ctl: ActivationControl) -> Result<(), ZbcError> {
    if ctl.fsnoz != ActivationControl::FSNOZ_NO_CHANGE {
        set_features(fd, 0x46, ctl.fsnoz as u64, 0)?;
    }
    if let Some(urswrz) = ctl.urswrz {
        set_features(fd, 0x47, urswrz as u64, 0)?;
    }
    if ctl.max_activation != ActivationControl::MAX_ACTIVATION_NO_CHANGE {
        set_features(fd, 0x48, ctl.max_activation as u64, 0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lba_interleaving_matches_ata16_layout() {
        let mut cdb = [0u8; 16];
        put_lba(&mut cdb, 0x0001_0203_0405);
        assert_eq!(cdb[7], 0x02);
        assert_eq!(cdb[8], 0x05);
        assert_eq!(cdb[9], 0x01);
        assert_eq!(cdb[10], 0x04);
        assert_eq!(cdb[11], 0x00);
        assert_eq!(cdb[12], 0x03);
    }
}
