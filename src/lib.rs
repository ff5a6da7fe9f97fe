//! zbc: a transport-independent library for Zoned Block Commands (ZBC)
//! and Zoned-device ATA Commands (ZAC) devices.
//!
//! A [`device::Device`] is opened against a `/dev/sd*`, `/dev/nvme*` or
//! plain block special file; the library classifies the device, probes
//! its zone model over whichever of SCSI, ATA or the Linux generic
//! zoned-block ioctls actually works, and hands back a uniform
//! [`zone::DeviceInfo`] plus [`zone::Zone`] list regardless of
//! transport.
//!
//! # Opening a device and listing its zones
//!
//! ```no_run
//! use zbc::device::{Device, OpenFlags};
//! use zbc::zone::ReportingOptions;
//!
//! let dev = Device::open("/dev/sda", OpenFlags::default()).unwrap();
//! let zones = zbc::report::list_zones(&dev, 0, ReportingOptions::ALL, 256).unwrap();
//! for z in &zones {
//!     println!("{:?} at sector {} len {}", z.zone_type, z.start, z.length);
//! }
//! ```

#[macro_use]
extern crate derive_builder;

pub mod ata;
pub mod block;
pub mod device;
pub mod domain;
pub mod error;
pub mod io;
pub mod report;
pub mod scsi;
pub mod sg;
pub mod sysfs;
pub mod zone;
