//! Backend dispatcher / device open (component C5).
//!
//! `Device` holds a `Box<dyn Backend>`: a trait object is chosen here
//! because the transport surface is small and fixed, and each backend's
//! construction logic (symlink resolution, partition handling,
//! classification) differs enough to read better as independent
//! `impl Backend` blocks than as match arms.

use crate::ata;
use crate::block;
use crate::domain::{ActivationControl, ActivationRecord, ZoneDomain, ZoneRealm};
use crate::error::ZbcError;
use crate::scsi;
use crate::zone::{DeviceFlags, DeviceInfo, DeviceModel, DeviceType, Sector, Zone, ZoneType};
use bitflags::bitflags;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

bitflags! {
    /// Backend selection flags for `Device::open`.
    pub struct OpenFlags: u32 {
        const BLOCK   = 0x01;
        const SCSI    = 0x02;
        const ATA     = 0x04;
        /// Request O_DIRECT-eligible submission for single-buffer I/O.
        const DIRECT  = 0x08;
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags::BLOCK | OpenFlags::SCSI | OpenFlags::ATA
    }
}

/// Which data-I/O path an ATA-classified device was found to prefer
/// after the post-bring-up SCSI READ(16) probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataIoPath {
    Scsi,
    Ata,
}

/// Small, fixed transport surface every backend implements.
pub(crate) trait Backend {
    fn raw_fd(&self) -> RawFd;
    fn direct_io(&self) -> bool;

    fn report_zones_once(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        ro: u8,
        zones: &mut [Zone],
    ) -> Result<(usize, u64), ZbcError>;

    fn zone_op(
        &self,
        info: &DeviceInfo,
        sector: Sector,
        op: ZoneOp,
        all: bool,
    ) -> Result<(), ZbcError>;

    fn pread(&self, info: &DeviceInfo, buf: &mut [u8], offset: Sector) -> Result<usize, ZbcError>;
    fn pwrite(&self, info: &DeviceInfo, buf: &mut [u8], offset: Sector) -> Result<usize, ZbcError>;
    fn preadv(
        &self,
        info: &DeviceInfo,
        iov: &mut [IoSliceMut],
        offset: Sector,
    ) -> Result<usize, ZbcError>;
    fn pwritev(
        &self,
        info: &DeviceInfo,
        iov: &[IoSlice],
        offset: Sector,
    ) -> Result<usize, ZbcError>;
    fn flush(&self) -> Result<(), ZbcError>;

    fn report_domains(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        ro: u8,
        nr: usize,
    ) -> Result<Vec<ZoneDomain>, ZbcError>;
    fn report_realms(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        ro: u8,
        nr: usize,
        known_domains: &[ZoneDomain],
    ) -> Result<Vec<ZoneRealm>, ZbcError>;
    fn zone_activate_or_query(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        nr_zones: u32,
        domain_id: u8,
        max_records: usize,
        query: bool,
        all: bool,
        zsrc: bool,
        use_32b: bool,
    ) -> Result<Vec<ActivationRecord>, ZbcError>;
    fn zone_activation_ctl(&self, ctl: ActivationControl) -> Result<(), ZbcError>;

    /// ZBD statistics: `not_supported` on every backend, pending a real
    /// counters source.
    fn get_stats(&self) -> Result<(), ZbcError> {
        Err(ZbcError::NotSupported {
            text: "ZBD statistics are not implemented by this backend".into(),
        })
    }
}

/// Zone operation selector shared across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneOp {
    Reset,
    Open,
    Close,
    Finish,
}

/// A live device handle.
pub struct Device {
    backend: Box<dyn Backend>,
    pub info: DeviceInfo,
}

fn open_rdwr(path: &Path) -> Result<RawFd, ZbcError> {
    use std::os::unix::io::IntoRawFd;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)?;
    Ok(file.into_raw_fd())
}

fn open_rdonly(path: &Path) -> Result<RawFd, ZbcError> {
    use std::os::unix::io::IntoRawFd;
    let file = std::fs::OpenOptions::new().read(true).open(path)?;
    Ok(file.into_raw_fd())
}

struct ScsiBackend {
    fd: RawFd,
    holder_fd: Option<RawFd>,
    lba_offset: Sector,
    direct: bool,
}

impl ScsiBackend {
    fn cmd_fd(&self) -> RawFd {
        self.holder_fd.unwrap_or(self.fd)
    }
}

impl Drop for ScsiBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
            if let Some(h) = self.holder_fd {
                libc::close(h);
            }
        }
    }
}

impl Backend for ScsiBackend {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn direct_io(&self) -> bool {
        self.direct
    }

    fn report_zones_once(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        ro: u8,
        zones: &mut [Zone],
    ) -> Result<(usize, u64), ZbcError> {
        let raw_len = scsi::ZONE_DESCRIPTOR_OFFSET + zones.len() * scsi::ZONE_DESCRIPTOR_LENGTH;
        let mut raw_buf = vec![0u8; raw_len];
        scsi::report_zones(
            self.cmd_fd(),
            info,
            start_sector + self.lba_offset,
            ro,
            zones,
            &mut raw_buf,
        )
    }

    fn zone_op(
        &self,
        info: &DeviceInfo,
        sector: Sector,
        op: ZoneOp,
        all: bool,
    ) -> Result<(), ZbcError> {
        let op = match op {
            ZoneOp::Reset => scsi::ZoneOp::Reset,
            ZoneOp::Open => scsi::ZoneOp::Open,
            ZoneOp::Close => scsi::ZoneOp::Close,
            ZoneOp::Finish => scsi::ZoneOp::Finish,
        };
        scsi::zone_op(self.cmd_fd(), info, sector + self.lba_offset, op, all)
    }

    fn pread(&self, info: &DeviceInfo, buf: &mut [u8], offset: Sector) -> Result<usize, ZbcError> {
        scsi::read_16(self.fd, info, offset + self.lba_offset, buf)
    }

    fn pwrite(&self, info: &DeviceInfo, buf: &mut [u8], offset: Sector) -> Result<usize, ZbcError> {
        scsi::write_16(self.fd, info, offset + self.lba_offset, buf)
    }

    fn preadv(
        &self,
        info: &DeviceInfo,
        iov: &mut [IoSliceMut],
        offset: Sector,
    ) -> Result<usize, ZbcError> {
        scsi::read_16v(self.fd, info, offset + self.lba_offset, iov)
    }

    fn pwritev(
        &self,
        info: &DeviceInfo,
        iov: &[IoSlice],
        offset: Sector,
    ) -> Result<usize, ZbcError> {
        scsi::write_16v(self.fd, info, offset + self.lba_offset, iov)
    }

    fn flush(&self) -> Result<(), ZbcError> {
        scsi::flush(self.fd)
    }

    fn report_domains(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        ro: u8,
        nr: usize,
    ) -> Result<Vec<ZoneDomain>, ZbcError> {
        scsi::report_domains(self.cmd_fd(), info, start_sector + self.lba_offset, ro, nr)
    }

    fn report_realms(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        ro: u8,
        nr: usize,
        known_domains: &[ZoneDomain],
    ) -> Result<Vec<ZoneRealm>, ZbcError> {
        scsi::report_realms(
            self.cmd_fd(),
            info,
            start_sector + self.lba_offset,
            ro,
            nr,
            known_domains,
        )
    }

    fn zone_activate_or_query(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        nr_zones: u32,
        domain_id: u8,
        max_records: usize,
        query: bool,
        all: bool,
        zsrc: bool,
        _use_32b: bool,
    ) -> Result<Vec<ActivationRecord>, ZbcError> {
        scsi::zone_activate_or_query(
            self.cmd_fd(),
            info,
            start_sector + self.lba_offset,
            nr_zones,
            domain_id,
            max_records,
            query,
            all,
            zsrc,
        )
    }

    fn zone_activation_ctl(&self, _ctl: ActivationControl) -> Result<(), ZbcError> {
        // FSNOZ/URSWRZ/MAX_ACTIVATION control goes through ATA SET
        // FEATURES; the SCSI equivalent mode page layout isn't pinned
        // down precisely enough here to encode it safely.
        Err(ZbcError::NotSupported {
            text: "zone activation control is not implemented over the native SCSI backend"
                .into(),
        })
    }
}

struct AtaBackend {
    fd: RawFd,
    holder_fd: Option<RawFd>,
    lba_offset: Sector,
    direct: bool,
    data_io: DataIoPath,
}

impl AtaBackend {
    fn cmd_fd(&self) -> RawFd {
        self.holder_fd.unwrap_or(self.fd)
    }
}

impl Drop for AtaBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
            if let Some(h) = self.holder_fd {
                libc::close(h);
            }
        }
    }
}

impl Backend for AtaBackend {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn direct_io(&self) -> bool {
        self.direct
    }

    fn report_zones_once(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        ro: u8,
        zones: &mut [Zone],
    ) -> Result<(usize, u64), ZbcError> {
        let raw_len = 64 + zones.len() * 64;
        let mut raw_buf = vec![0u8; raw_len];
        ata::report_zones(
            self.cmd_fd(),
            info,
            start_sector + self.lba_offset,
            ro,
            zones,
            &mut raw_buf,
        )
    }

    fn zone_op(
        &self,
        info: &DeviceInfo,
        sector: Sector,
        op: ZoneOp,
        all: bool,
    ) -> Result<(), ZbcError> {
        let op = match op {
            ZoneOp::Reset => ata::ZoneOp::Reset,
            ZoneOp::Open => ata::ZoneOp::Open,
            ZoneOp::Close => ata::ZoneOp::Close,
            ZoneOp::Finish => ata::ZoneOp::Finish,
        };
        ata::zone_op(self.cmd_fd(), info, sector + self.lba_offset, op, all)
    }

    fn pread(&self, info: &DeviceInfo, buf: &mut [u8], offset: Sector) -> Result<usize, ZbcError> {
        match self.data_io {
            DataIoPath::Scsi => scsi::read_16(self.fd, info, offset + self.lba_offset, buf),
            DataIoPath::Ata => ata::read_dma_ext(self.fd, info, offset + self.lba_offset, buf),
        }
    }

    fn pwrite(&self, info: &DeviceInfo, buf: &mut [u8], offset: Sector) -> Result<usize, ZbcError> {
        match self.data_io {
            DataIoPath::Scsi => scsi::write_16(self.fd, info, offset + self.lba_offset, buf),
            DataIoPath::Ata => ata::write_dma_ext(self.fd, info, offset + self.lba_offset, buf),
        }
    }

    fn preadv(
        &self,
        info: &DeviceInfo,
        iov: &mut [IoSliceMut],
        offset: Sector,
    ) -> Result<usize, ZbcError> {
        match self.data_io {
            DataIoPath::Scsi => scsi::read_16v(self.fd, info, offset + self.lba_offset, iov),
            DataIoPath::Ata => ata::read_dma_ext_v(self.fd, info, offset + self.lba_offset, iov),
        }
    }

    fn pwritev(
        &self,
        info: &DeviceInfo,
        iov: &[IoSlice],
        offset: Sector,
    ) -> Result<usize, ZbcError> {
        match self.data_io {
            DataIoPath::Scsi => scsi::write_16v(self.fd, info, offset + self.lba_offset, iov),
            DataIoPath::Ata => ata::write_dma_ext_v(self.fd, info, offset + self.lba_offset, iov),
        }
    }

    fn flush(&self) -> Result<(), ZbcError> {
        ata::flush_cache_ext(self.fd)
    }

    fn report_domains(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        ro: u8,
        nr: usize,
    ) -> Result<Vec<ZoneDomain>, ZbcError> {
        ata::report_domains(self.cmd_fd(), info, start_sector + self.lba_offset, ro, nr)
    }

    fn report_realms(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        ro: u8,
        nr: usize,
        known_domains: &[ZoneDomain],
    ) -> Result<Vec<ZoneRealm>, ZbcError> {
        ata::report_realms(
            self.cmd_fd(),
            info,
            start_sector + self.lba_offset,
            ro,
            nr,
            known_domains,
        )
    }

    fn zone_activate_or_query(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        _nr_zones: u32,
        domain_id: u8,
        max_records: usize,
        query: bool,
        all: bool,
        zsrc: bool,
        _use_32b: bool,
    ) -> Result<Vec<ActivationRecord>, ZbcError> {
        ata::zone_activate_or_query(
            self.cmd_fd(),
            info,
            start_sector + self.lba_offset,
            domain_id,
            max_records,
            query,
            all,
            zsrc,
        )
    }

    fn zone_activation_ctl(&self, ctl: ActivationControl) -> Result<(), ZbcError> {
        ata::zone_activation_ctl(self.cmd_fd(), ctl)
    }
}

/// A block device driven primarily through the kernel zoned-block
/// ioctls, falling back to a SCSI pass-through fd for ops the kernel
/// does not expose.
struct BlockBackend {
    fd: RawFd,
    scsi_fallback: Option<ScsiBackend>,
}

impl Drop for BlockBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl Backend for BlockBackend {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn direct_io(&self) -> bool {
        false
    }

    fn report_zones_once(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        _ro: u8,
        zones: &mut [Zone],
    ) -> Result<(usize, u64), ZbcError> {
        let n = block::report_zones(self.fd, start_sector, info.sectors, zones)?;
        Ok((n, info.sectors.saturating_sub(1)))
    }

    fn zone_op(
        &self,
        info: &DeviceInfo,
        sector: Sector,
        op: ZoneOp,
        all: bool,
    ) -> Result<(), ZbcError> {
        let r = match op {
            ZoneOp::Reset if all => block::reset_all(self.fd, info.sectors),
            ZoneOp::Reset => block::reset_one(self.fd, sector, length_of(info, sector)),
            ZoneOp::Open => block::open_zone(self.fd, sector, length_of(info, sector)),
            ZoneOp::Close => block::close_zone(self.fd, sector, length_of(info, sector)),
            ZoneOp::Finish => block::finish_zone(self.fd, sector, length_of(info, sector)),
        };
        match r {
            Ok(()) => Ok(()),
            Err(e) if block::is_not_supported(&e) => {
                if let Some(scsi) = &self.scsi_fallback {
                    scsi.zone_op(info, sector, op, all)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn pread(&self, _info: &DeviceInfo, buf: &mut [u8], offset: Sector) -> Result<usize, ZbcError> {
        pread_raw(self.fd, buf, offset)
    }

    fn pwrite(&self, _info: &DeviceInfo, buf: &mut [u8], offset: Sector) -> Result<usize, ZbcError> {
        pwrite_raw(self.fd, buf, offset)
    }

    fn preadv(
        &self,
        _info: &DeviceInfo,
        iov: &mut [IoSliceMut],
        offset: Sector,
    ) -> Result<usize, ZbcError> {
        preadv_raw(self.fd, iov, offset)
    }

    fn pwritev(
        &self,
        _info: &DeviceInfo,
        iov: &[IoSlice],
        offset: Sector,
    ) -> Result<usize, ZbcError> {
        pwritev_raw(self.fd, iov, offset)
    }

    fn flush(&self) -> Result<(), ZbcError> {
        let rc = unsafe { libc::fsync(self.fd) };
        if rc != 0 {
            return Err(ZbcError::Io {
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn report_domains(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        ro: u8,
        nr: usize,
    ) -> Result<Vec<ZoneDomain>, ZbcError> {
        self.scsi_fallback
            .as_ref()
            .ok_or_else(not_supported_no_pass_through)?
            .report_domains(info, start_sector, ro, nr)
    }

    fn report_realms(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        ro: u8,
        nr: usize,
        known_domains: &[ZoneDomain],
    ) -> Result<Vec<ZoneRealm>, ZbcError> {
        self.scsi_fallback
            .as_ref()
            .ok_or_else(not_supported_no_pass_through)?
            .report_realms(info, start_sector, ro, nr, known_domains)
    }

    fn zone_activate_or_query(
        &self,
        info: &DeviceInfo,
        start_sector: Sector,
        nr_zones: u32,
        domain_id: u8,
        max_records: usize,
        query: bool,
        all: bool,
        zsrc: bool,
        use_32b: bool,
    ) -> Result<Vec<ActivationRecord>, ZbcError> {
        self.scsi_fallback
            .as_ref()
            .ok_or_else(not_supported_no_pass_through)?
            .zone_activate_or_query(
                info,
                start_sector,
                nr_zones,
                domain_id,
                max_records,
                query,
                all,
                zsrc,
                use_32b,
            )
    }

    fn zone_activation_ctl(&self, ctl: ActivationControl) -> Result<(), ZbcError> {
        self.scsi_fallback
            .as_ref()
            .ok_or_else(not_supported_no_pass_through)?
            .zone_activation_ctl(ctl)
    }
}

fn not_supported_no_pass_through() -> ZbcError {
    ZbcError::NotSupported {
        text: "kernel zoned-block ioctls do not expose this operation and no SCSI \
               pass-through fallback is available"
            .into(),
    }
}

fn length_of(info: &DeviceInfo, sector: Sector) -> Sector {
    // BLKRESETZONE/BLKOPENZONE/etc accept any range; the zone's own
    // length is not known without a report, so the block transport
    // passes the device's nominal zone granularity upper bound and lets
    // the kernel clamp it to the actual zone boundary.
    info.sectors.saturating_sub(sector)
}

fn pread_raw(fd: RawFd, buf: &mut [u8], offset: Sector) -> Result<usize, ZbcError> {
    let off = (offset << 9) as libc::off_t;
    let n = unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), off) };
    if n < 0 {
        return Err(ZbcError::Io {
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(n as usize >> 9)
}

fn pwrite_raw(fd: RawFd, buf: &mut [u8], offset: Sector) -> Result<usize, ZbcError> {
    let off = (offset << 9) as libc::off_t;
    let n = unsafe { libc::pwrite(fd, buf.as_ptr() as *const libc::c_void, buf.len(), off) };
    if n < 0 {
        return Err(ZbcError::Io {
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(n as usize >> 9)
}

fn preadv_raw(fd: RawFd, iov: &mut [IoSliceMut], offset: Sector) -> Result<usize, ZbcError> {
    let off = (offset << 9) as libc::off_t;
    let n = unsafe {
        libc::preadv(
            fd,
            iov.as_ptr() as *const libc::iovec,
            iov.len() as libc::c_int,
            off,
        )
    };
    if n < 0 {
        return Err(ZbcError::Io {
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(n as usize >> 9)
}

fn pwritev_raw(fd: RawFd, iov: &[IoSlice], offset: Sector) -> Result<usize, ZbcError> {
    let off = (offset << 9) as libc::off_t;
    let n = unsafe {
        libc::pwritev(
            fd,
            iov.as_ptr() as *const libc::iovec,
            iov.len() as libc::c_int,
            off,
        )
    };
    if n < 0 {
        return Err(ZbcError::Io {
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(n as usize >> 9)
}

/// `Device::open`: resolve symlinks once, then try
/// backends in the fixed order block → scsi → ata, constrained by
/// `flags`.
pub fn open(path: &Path, flags: OpenFlags) -> Result<Device, ZbcError> {
    let resolved = std::fs::canonicalize(path)?;

    if flags.contains(OpenFlags::BLOCK) {
        if let Some(dev) = try_open_block(&resolved, flags)? {
            return Ok(dev);
        }
    }
    if flags.contains(OpenFlags::SCSI) {
        if let Some(dev) = try_open_scsi(&resolved, flags)? {
            return Ok(dev);
        }
    }
    if flags.contains(OpenFlags::ATA) {
        if let Some(dev) = try_open_ata(&resolved, flags)? {
            return Ok(dev);
        }
    }

    Err(ZbcError::NotSupported {
        text: format!("{} does not match any requested backend", path.display()),
    })
}

fn devname(path: &Path) -> Option<String> {
    path.file_name()?.to_str().map(|s| s.to_string())
}

fn finish_open(
    backend: Box<dyn Backend>,
    devname: Option<&str>,
    sectors: Sector,
    lblock_size: u32,
    pblock_size: u32,
    device_type: DeviceType,
    model: DeviceModel,
    vendor_id: String,
    mut flags: DeviceFlags,
) -> Result<Device, ZbcError> {
    let mut info = DeviceInfo {
        device_type,
        model,
        vendor_id,
        flags: DeviceFlags::default(),
        sectors,
        lblock_size,
        lblocks: (sectors << 9) / lblock_size as u64,
        pblock_size,
        pblocks: (sectors << 9) / pblock_size as u64,
        ..DeviceInfo::default()
    };

    // Per-command byte limit: the queue's
    // max_sectors_kb, converted to 512 B sectors. Falls back to the
    // sysfs module's fixed default when the attribute can't be read
    // (e.g. the backend's fd is not a partition/whole-disk pair with a
    // `/sys/block` entry).
    let limits = devname
        .and_then(crate::sysfs::queue_limits)
        .unwrap_or_default();
    info.max_rw_sectors = (limits.max_sectors_kb as u64 * 1024) >> 9;
    info.max_segments = limits.max_segments;

    if flags.contains(DeviceFlags::ZONE_REALMS_SUPPORT) {
        if let Ok(domains) = backend.report_domains(&info, 0, 0, 6) {
            for d in &domains {
                if d.flags.contains(crate::domain::DomainFlags::SHIFTING_BOUNDARIES) {
                    flags |= shifting_flag_for(d.zone_type);
                }
            }
        }
    }
    info.flags = flags;

    Ok(Device { backend, info })
}

fn shifting_flag_for(zone_type: ZoneType) -> DeviceFlags {
    match zone_type {
        ZoneType::Conventional => DeviceFlags::CONV_REALMS_SHIFTING,
        ZoneType::SequentialWriteRequired => DeviceFlags::SEQ_REQ_REALMS_SHIFTING,
        ZoneType::SequentialWritePreferred => DeviceFlags::SEQ_PREF_REALMS_SHIFTING,
        ZoneType::SequentialOrBeforeRequired => DeviceFlags::SOBR_REALMS_SHIFTING,
        _ => DeviceFlags::empty(),
    }
}

fn try_open_block(path: &Path, flags: OpenFlags) -> Result<Option<Device>, ZbcError> {
    let fd = match open_rdwr(path) {
        Ok(fd) => fd,
        Err(_) => return Ok(None),
    };

    let zone_size = match block::get_zone_size(fd) {
        Ok(sz) if sz > 0 => sz,
        _ => {
            unsafe { libc::close(fd) };
            return Ok(None);
        }
    };
    let _ = zone_size;

    let (sectors, lblock_size, pblock_size) = match read_capacity_for_block(fd) {
        Ok(v) => v,
        Err(_) => {
            unsafe { libc::close(fd) };
            return Ok(None);
        }
    };

    let scsi_fallback = build_scsi_fallback(path, flags).ok().flatten();

    let queue_devname = devname(path).and_then(|n| {
        block::partition_info(&n).map(|(holder, _)| holder).or(Some(n))
    });

    let backend = BlockBackend { fd, scsi_fallback };
    finish_open(
        Box::new(backend),
        queue_devname.as_deref(),
        sectors,
        lblock_size,
        pblock_size,
        DeviceType::Block,
        DeviceModel::HostManaged,
        String::new(),
        DeviceFlags::empty(),
    )
    .map(Some)
}

fn read_capacity_for_block(fd: RawFd) -> Result<(Sector, u32, u32), ZbcError> {
    let mut size: u64 = 0;
    let rc = unsafe { libc::ioctl(fd, 0x80081272u64 as _, &mut size as *mut u64) }; // BLKGETSIZE64
    if rc != 0 {
        return Err(ZbcError::Io {
            source: std::io::Error::last_os_error(),
        });
    }
    let mut lbs: libc::c_int = 512;
    unsafe { libc::ioctl(fd, 0x1268u64 as _, &mut lbs as *mut libc::c_int) }; // BLKSSZGET, best effort
    let lblock_size = if lbs > 0 { lbs as u32 } else { 512 };

    let mut pbs: libc::c_int = 0;
    unsafe { libc::ioctl(fd, 0x127bu64 as _, &mut pbs as *mut libc::c_int) }; // BLKPBSZGET, best effort
    let pblock_size = if pbs > 0 { pbs as u32 } else { lblock_size };

    Ok((size >> 9, lblock_size, pblock_size))
}

fn build_scsi_fallback(path: &Path, flags: OpenFlags) -> Result<Option<ScsiBackend>, ZbcError> {
    let name = match devname(path) {
        Some(n) => n,
        None => return Ok(None),
    };

    let (cmd_path, lba_offset) = if let Some((holder, start)) = block::partition_info(&name) {
        (PathBuf::from("/dev").join(holder), start)
    } else {
        (path.to_path_buf(), 0)
    };

    let fd = match open_rdonly(&cmd_path) {
        Ok(fd) => fd,
        Err(_) => return Ok(None),
    };
    Ok(Some(ScsiBackend {
        fd,
        holder_fd: None,
        lba_offset,
        direct: flags.contains(OpenFlags::DIRECT),
    }))
}

fn try_open_scsi(path: &Path, flags: OpenFlags) -> Result<Option<Device>, ZbcError> {
    let name = devname(path);
    let (cmd_path, lba_offset) = match name.as_deref().and_then(block::partition_info) {
        Some((holder, start)) => (PathBuf::from("/dev").join(holder), start),
        None => (path.to_path_buf(), 0),
    };

    let data_fd = match open_rdwr(path) {
        Ok(fd) => fd,
        Err(_) => return Ok(None),
    };
    let cmd_fd = if cmd_path == path {
        None
    } else {
        match open_rdonly(&cmd_path) {
            Ok(fd) => Some(fd),
            Err(_) => None,
        }
    };

    let probe_fd = cmd_fd.unwrap_or(data_fd);
    let (device_type, model, vendor_id) = match scsi::classify(probe_fd) {
        Ok(v) => v,
        Err(_) => {
            unsafe {
                libc::close(data_fd);
                if let Some(fd) = cmd_fd {
                    libc::close(fd);
                }
            }
            return Ok(None);
        }
    };

    let (lba_count, lblock_size, logical_per_physical) = scsi::read_capacity_16(probe_fd)?;
    let sectors = (lba_count * lblock_size as u64) >> 9;
    let pblock_size = lblock_size * logical_per_physical;

    let mut flags_out = DeviceFlags::empty();
    let mut vpd_b6 = None;
    if let Ok(b6) = read_vpd_b6(probe_fd, model) {
        flags_out |= b6.flags;
        vpd_b6 = Some(b6);
    }

    let backend = ScsiBackend {
        fd: data_fd,
        holder_fd: cmd_fd,
        lba_offset,
        direct: flags.contains(OpenFlags::DIRECT),
    };
    let mut dev = finish_open(
        Box::new(backend),
        devname(&cmd_path).as_deref(),
        sectors,
        lblock_size,
        pblock_size,
        device_type,
        model,
        vendor_id,
        flags_out,
    )?;
    if let Some(b6) = vpd_b6 {
        dev.info.opt_nr_open_seq_pref = b6.opt_nr_open_seq_pref;
        dev.info.opt_nr_non_seq_write_seq_pref = b6.opt_nr_non_seq_write_seq_pref;
        dev.info.max_nr_open_seq_req = b6.max_nr_open_seq_req;
    }
    Ok(Some(dev))
}

/// Parsed content of VPD page 0xB6 (zoned block device characteristics)
/// beyond the flag byte: the open-zone resource counts, which live at
/// different offsets depending on whether the device is host-aware or
/// host-managed.
struct VpdB6 {
    flags: DeviceFlags,
    opt_nr_open_seq_pref: u32,
    opt_nr_non_seq_write_seq_pref: u32,
    max_nr_open_seq_req: u32,
}

fn read_vpd_b6(fd: RawFd, model: DeviceModel) -> Result<VpdB6, ZbcError> {
    let mut buf = [0u8; 64];
    scsi::vpd_inquiry(fd, 0xb6, &mut buf)?;
    Ok(parse_vpd_b6(&buf, model))
}

fn parse_vpd_b6(buf: &[u8], model: DeviceModel) -> VpdB6 {
    let mut flags = DeviceFlags::empty();
    if buf[4] & 0x01 != 0 {
        flags |= DeviceFlags::UNRESTRICTED_READ;
    }
    if buf[4] & 0x02 != 0 {
        flags |= DeviceFlags::ZONE_DOMAINS_SUPPORT;
    }
    if buf[4] & 0x04 != 0 {
        flags |= DeviceFlags::ZONE_REALMS_SUPPORT | DeviceFlags::REPORT_REALMS_SUPPORT;
    }

    let be32_at = |off: usize| u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());

    let (opt_nr_open_seq_pref, opt_nr_non_seq_write_seq_pref, max_nr_open_seq_req) = match model {
        DeviceModel::HostAware => (be32_at(8), be32_at(12), crate::zone::NO_LIMIT),
        DeviceModel::HostManaged => {
            (crate::zone::NOT_REPORTED, crate::zone::NOT_REPORTED, be32_at(16))
        }
        _ => (
            crate::zone::NOT_REPORTED,
            crate::zone::NOT_REPORTED,
            crate::zone::NO_LIMIT,
        ),
    };

    VpdB6 {
        flags,
        opt_nr_open_seq_pref,
        opt_nr_non_seq_write_seq_pref,
        max_nr_open_seq_req,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_aware_open_zone_counts() {
        let mut buf = [0u8; 64];
        buf[8..12].copy_from_slice(&128u32.to_be_bytes());
        buf[12..16].copy_from_slice(&64u32.to_be_bytes());
        let b6 = parse_vpd_b6(&buf, DeviceModel::HostAware);
        assert_eq!(b6.opt_nr_open_seq_pref, 128);
        assert_eq!(b6.opt_nr_non_seq_write_seq_pref, 64);
        assert_eq!(b6.max_nr_open_seq_req, crate::zone::NO_LIMIT);
    }

    #[test]
    fn parses_host_managed_max_open_seq_req() {
        let mut buf = [0u8; 64];
        buf[16..20].copy_from_slice(&32u32.to_be_bytes());
        let b6 = parse_vpd_b6(&buf, DeviceModel::HostManaged);
        assert_eq!(b6.opt_nr_open_seq_pref, crate::zone::NOT_REPORTED);
        assert_eq!(b6.opt_nr_non_seq_write_seq_pref, crate::zone::NOT_REPORTED);
        assert_eq!(b6.max_nr_open_seq_req, 32);
    }
}

fn try_open_ata(path: &Path, flags: OpenFlags) -> Result<Option<Device>, ZbcError> {
    let name = devname(path);
    let (cmd_path, lba_offset) = match name.as_deref().and_then(block::partition_info) {
        Some((holder, start)) => (PathBuf::from("/dev").join(holder), start),
        None => (path.to_path_buf(), 0),
    };

    let data_fd = match open_rdwr(path) {
        Ok(fd) => fd,
        Err(_) => return Ok(None),
    };
    let cmd_fd = if cmd_path == path {
        None
    } else {
        open_rdonly(&cmd_path).ok()
    };
    let probe_fd = cmd_fd.unwrap_or(data_fd);

    let (device_type, model, dflags, vendor_id) = match ata::classify(probe_fd) {
        Ok(v) => v,
        Err(_) => {
            unsafe {
                libc::close(data_fd);
                if let Some(fd) = cmd_fd {
                    libc::close(fd);
                }
            }
            return Ok(None);
        }
    };

    let (lba_count, lblock_size, logical_per_physical) =
        scsi::read_capacity_16(probe_fd).unwrap_or((0, 512, 1));
    let sectors = (lba_count * lblock_size as u64) >> 9;
    let pblock_size = lblock_size * logical_per_physical;

    // Post-bring-up probe: a no-op READ(16) of sector 0
    // decides whether native SCSI read/write (SAT) or native ATA
    // read/write drives data I/O.
    let data_io = {
        let mut probe_info = DeviceInfo {
            lblock_size,
            ..DeviceInfo::default()
        };
        probe_info.sectors = sectors;
        let mut tiny = vec![0u8; lblock_size.max(512) as usize];
        match scsi::read_16(probe_fd, &probe_info, 0, &mut tiny) {
            Ok(_) => DataIoPath::Scsi,
            Err(_) => DataIoPath::Ata,
        }
    };

    let backend = AtaBackend {
        fd: data_fd,
        holder_fd: cmd_fd,
        lba_offset,
        direct: flags.contains(OpenFlags::DIRECT),
        data_io,
    };
    finish_open(
        Box::new(backend),
        devname(&cmd_path).as_deref(),
        sectors,
        lblock_size,
        pblock_size,
        device_type,
        model,
        vendor_id,
        dflags,
    )
    .map(Some)
}

impl Device {
    /// `is_zoned(path, allow_fake)`: a lightweight open
    /// that reports whether the path is a zoned device, without keeping
    /// a handle. `allow_fake` is accepted for interface compatibility;
    /// a fake backend is out of scope for this crate.
    pub fn is_zoned<P: AsRef<Path>>(path: P, _allow_fake: bool) -> Result<Option<DeviceInfo>, ZbcError> {
        match open(path.as_ref(), OpenFlags::default()) {
            Ok(dev) => Ok(Some(dev.info)),
            Err(ZbcError::NotSupported { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> Result<Device, ZbcError> {
        open(path.as_ref(), flags)
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.backend.raw_fd()
    }
}

// `close(handle)` is simply `Drop`: the backend closes
// its own fd(s) and releases internal buffers; caller-owned arrays are
// never touched.
