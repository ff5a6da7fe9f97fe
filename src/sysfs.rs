//! Utility functions for reading sysfs attributes and a handful of
//! fixed, typed properties the core depends on (queue limits,
//! partition holder/offset). Grounded on the sibling `sysfs` crate's
//! `parse_value`/`parse_dict`/`write_value` helpers.

use std::{
    collections::HashMap,
    fs,
    io::{BufRead, BufReader, Error, ErrorKind, Result},
    path::Path,
    str::FromStr,
    string,
};

/// Read and parse a value from a sysfs file.
pub fn parse_value<T>(dir: &Path, file: &str) -> Result<T>
where
    T: FromStr,
{
    let path = dir.join(file);
    let s = fs::read_to_string(&path)?;
    let s = s.trim();
    match s.parse() {
        Ok(v) => Ok(v),
        Err(_) => Err(Error::new(
            ErrorKind::InvalidData,
            format!("failed to parse {}: {}", path.display(), s),
        )),
    }
}

/// Write a string value to a sysfs file.
pub fn write_value<T>(dir: &Path, file: &str, content: T) -> Result<()>
where
    T: string::ToString,
{
    let path = dir.join(file);
    fs::write(path, content.to_string())
}

/// Read a `KEY=value` dictionary file.
pub fn parse_dict(dir: &Path, file: &str) -> Result<HashMap<String, String>> {
    let path = dir.join(file);
    let mut dict = HashMap::new();
    let f = fs::File::open(&path)?;
    let file = BufReader::new(&f);

    for line in file.lines() {
        let line = line?;
        let mut parts = line.splitn(2, '=');
        if let (Some(k), Some(v)) = (parts.next(), parts.next()) {
            dict.insert(k.to_string(), v.to_string());
        }
    }
    Ok(dict)
}

/// Queue limits backing the effective per-command byte/segment cap
/// (component C1).
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub max_segments: u32,
    pub max_sectors_kb: u32,
}

impl Default for QueueLimits {
    fn default() -> Self {
        // Fixed default: 256 segments x 4 KiB.
        QueueLimits {
            max_segments: 256,
            max_sectors_kb: 4,
        }
    }
}

/// Read `queue/max_segments` and `queue/max_sectors_kb` for a block
/// device named e.g. `sda` or `nvme0n1`.
pub fn queue_limits(devname: &str) -> Option<QueueLimits> {
    let dir = Path::new("/sys/block").join(devname).join("queue");
    let max_segments = parse_value::<u32>(&dir, "max_segments").ok()?;
    let max_sectors_kb = parse_value::<u32>(&dir, "max_sectors_kb").ok()?;
    Some(QueueLimits {
        max_segments,
        max_sectors_kb,
    })
}

/// Locate the holder (whole-disk) device name for a partition device
/// name, by scanning `/sys/block/*/<partname>` (component C4).
pub fn partition_holder(partname: &str) -> Option<String> {
    let entries = glob::glob(&format!("/sys/block/*/{}", partname)).ok()?;
    for entry in entries.flatten() {
        if let Some(holder) = entry
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
        {
            return Some(holder.to_string());
        }
    }
    None
}

/// Read the partition's starting sector offset (LBA units) from
/// `/sys/block/<holder>/<part>/start`.
pub fn partition_start(holder: &str, partname: &str) -> Result<u64> {
    let dir = Path::new("/sys/block").join(holder).join(partname);
    parse_value::<u64>(&dir, "start")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_value_trims_and_parses() {
        let dir = std::env::temp_dir().join("zbc_sysfs_test_value");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("size"), "12345\n").unwrap();
        let v: u64 = parse_value(&dir, "size").unwrap();
        assert_eq!(v, 12345);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn parse_dict_reads_key_value_pairs() {
        let dir = std::env::temp_dir().join("zbc_sysfs_test_dict");
        fs::create_dir_all(&dir).unwrap();
        let mut f = fs::File::create(dir.join("uevent")).unwrap();
        writeln!(f, "DEVTYPE=disk").unwrap();
        writeln!(f, "DEVNAME=sda").unwrap();
        let dict = parse_dict(&dir, "uevent").unwrap();
        assert_eq!(dict.get("DEVTYPE").map(String::as_str), Some("disk"));
        assert_eq!(dict.get("DEVNAME").map(String::as_str), Some("sda"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn default_queue_limits_use_documented_fallback() {
        let l = QueueLimits::default();
        assert_eq!(l.max_segments, 256);
        assert_eq!(l.max_sectors_kb, 4);
    }
}
