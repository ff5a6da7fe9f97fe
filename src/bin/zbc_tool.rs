//! `zbc-tool`: a thin command line front end over the `zbc` library,
//! one binary with a subcommand per operation. Each subcommand parses
//! its arguments, calls straight into the library, and reports failure
//! the same way: `[ERROR] <op> failed: <display of ZbcError>` on
//! stderr, exit code 1.

use clap::{App, Arg, SubCommand};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::process::exit;

use zbc::device::{Device, OpenFlags};
use zbc::domain::{self, ZoneActivateRequestBuilder};
use zbc::error::ZbcError;
use zbc::io as zio;
use zbc::report;
use zbc::zone::ReportingOptions;

fn fail(op: &str, e: ZbcError) -> ! {
    eprintln!("[ERROR] {} failed: {}", op, e);
    exit(1);
}

fn open(path: &str) -> Device {
    match Device::open(Path::new(path), OpenFlags::default()) {
        Ok(dev) => dev,
        Err(e) => fail("open", e),
    }
}

fn parse_u64(m: &clap::ArgMatches, name: &str, default: u64) -> u64 {
    m.value_of(name)
        .map(|v| v.parse::<u64>().unwrap_or_else(|_| {
            eprintln!("[ERROR] {} is not a valid number: {}", name, v);
            exit(1);
        }))
        .unwrap_or(default)
}

fn device_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("DEVICE")
        .help("block special file to open, e.g. /dev/sda")
        .required(true)
        .index(1)
}

fn sector_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("sector")
        .short("z")
        .long("sector")
        .value_name("sector")
        .help("512 B sector number identifying the target zone")
        .takes_value(true)
        .default_value("0")
}

fn main() {
    env_logger::init();
    let matches = App::new("zbc-tool")
        .version("0.1.0")
        .about("Inspect and manage ZBC/ZAC zoned block devices")
        .subcommand(
            SubCommand::with_name("info")
                .about("print device classification and capability flags")
                .arg(device_arg()),
        )
        .subcommand(
            SubCommand::with_name("report-zones")
                .about("list zone descriptors")
                .arg(device_arg())
                .arg(sector_arg())
                .arg(
                    Arg::with_name("max")
                        .short("n")
                        .long("max")
                        .value_name("count")
                        .help("maximum number of zones to report")
                        .takes_value(true)
                        .default_value("256"),
                ),
        )
        .subcommand(
            SubCommand::with_name("reset-wp")
                .about("reset the write pointer of one zone, or every zone with --all")
                .arg(device_arg())
                .arg(sector_arg())
                .arg(Arg::with_name("all").long("all").help("apply to every zone")),
        )
        .subcommand(
            SubCommand::with_name("open-zone")
                .about("explicitly open one zone")
                .arg(device_arg())
                .arg(sector_arg()),
        )
        .subcommand(
            SubCommand::with_name("close-zone")
                .about("close one zone")
                .arg(device_arg())
                .arg(sector_arg()),
        )
        .subcommand(
            SubCommand::with_name("finish-zone")
                .about("finish one zone")
                .arg(device_arg())
                .arg(sector_arg()),
        )
        .subcommand(
            SubCommand::with_name("read-zone")
                .about("read sectors and write them to stdout or a file")
                .arg(device_arg())
                .arg(sector_arg())
                .arg(
                    Arg::with_name("count")
                        .short("c")
                        .long("count")
                        .value_name("sectors")
                        .help("number of 512 B sectors to read")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("out")
                        .short("o")
                        .long("out")
                        .value_name("path")
                        .help("file to write the data to; defaults to stdout")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("write-zone")
                .about("write sectors read from a file at the zone's write pointer")
                .arg(device_arg())
                .arg(sector_arg())
                .arg(
                    Arg::with_name("in")
                        .short("i")
                        .long("in")
                        .value_name("path")
                        .help("file to read the data from")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("zone-activate")
                .about("activate (or, with --query, dry-run) a realm into a zone domain")
                .arg(device_arg())
                .arg(sector_arg())
                .arg(
                    Arg::with_name("nr-zones")
                        .short("n")
                        .long("nr-zones")
                        .value_name("count")
                        .help("number of zones the realm spans")
                        .takes_value(true)
                        .default_value("1"),
                )
                .arg(
                    Arg::with_name("domain")
                        .short("d")
                        .long("domain")
                        .value_name("id")
                        .help("target zone domain id")
                        .takes_value(true)
                        .default_value("0"),
                )
                .arg(Arg::with_name("query").long("query").help("query rather than activate"))
                .arg(Arg::with_name("all").long("all").help("activate/query every realm")),
        )
        .subcommand(
            SubCommand::with_name("report-domains")
                .about("list zone domain descriptors")
                .arg(device_arg()),
        )
        .subcommand(
            SubCommand::with_name("report-realms")
                .about("list zone realm descriptors")
                .arg(device_arg()),
        )
        .get_matches();

    match matches.subcommand() {
        ("info", Some(m)) => cmd_info(m),
        ("report-zones", Some(m)) => cmd_report_zones(m),
        ("reset-wp", Some(m)) => cmd_zone_op(m, "reset-wp", zbc::device::ZoneOp::Reset),
        ("open-zone", Some(m)) => cmd_zone_op(m, "open-zone", zbc::device::ZoneOp::Open),
        ("close-zone", Some(m)) => cmd_zone_op(m, "close-zone", zbc::device::ZoneOp::Close),
        ("finish-zone", Some(m)) => cmd_zone_op(m, "finish-zone", zbc::device::ZoneOp::Finish),
        ("read-zone", Some(m)) => cmd_read_zone(m),
        ("write-zone", Some(m)) => cmd_write_zone(m),
        ("zone-activate", Some(m)) => cmd_zone_activate(m),
        ("report-domains", Some(m)) => cmd_report_domains(m),
        ("report-realms", Some(m)) => cmd_report_realms(m),
        _ => {
            eprintln!("{}", matches.usage());
            exit(1);
        }
    }
}

fn cmd_info(m: &clap::ArgMatches) {
    let dev = open(m.value_of("DEVICE").unwrap());
    let info = &dev.info;
    println!("device type:      {:?}", info.device_type);
    println!("zone model:       {:?}", info.model);
    println!("vendor id:        {}", info.vendor_id);
    println!("capacity:         {} sectors", info.sectors);
    println!("logical block:    {} B", info.lblock_size);
    println!("physical block:   {} B", info.pblock_size);
    println!("max rw sectors:   {}", info.max_rw_sectors);
    println!("max segments:     {}", info.max_segments);
    println!("flags:            {:?}", info.flags);
}

fn cmd_report_zones(m: &clap::ArgMatches) {
    let dev = open(m.value_of("DEVICE").unwrap());
    let start = parse_u64(m, "sector", 0);
    let max = parse_u64(m, "max", 256) as usize;
    let zones = match report::list_zones(&dev, start, ReportingOptions::ALL, max) {
        Ok(z) => z,
        Err(e) => fail("report-zones", e),
    };
    for z in &zones {
        println!(
            "start={} len={} type={:?} cond={:?} wp={}",
            z.start,
            z.length,
            z.zone_type,
            z.condition,
            if z.wp_is_valid() {
                z.write_pointer.to_string()
            } else {
                "n/a".to_string()
            }
        );
    }
}

fn cmd_zone_op(m: &clap::ArgMatches, op_name: &str, op: zbc::device::ZoneOp) {
    let dev = open(m.value_of("DEVICE").unwrap());
    let sector = parse_u64(m, "sector", 0);
    let all = m.is_present("all");
    if let Err(e) = report::zone_op(&dev, sector, op, all) {
        fail(op_name, e);
    }
}

fn cmd_read_zone(m: &clap::ArgMatches) {
    let dev = open(m.value_of("DEVICE").unwrap());
    let sector = parse_u64(m, "sector", 0);
    let count = parse_u64(m, "count", 0);
    let mut buf = vec![0u8; (count << 9) as usize];
    let n = match zio::pread(&dev, &mut buf, sector) {
        Ok(n) => n,
        Err(e) => fail("read-zone", e),
    };
    buf.truncate((n as u64) << 9);

    match m.value_of("out") {
        Some(path) => {
            if let Err(e) = File::create(path).and_then(|mut f| f.write_all(&buf)) {
                eprintln!("[ERROR] read-zone failed: {}", ZbcError::from(e));
                exit(1);
            }
        }
        None => {
            if let Err(e) = std::io::stdout().write_all(&buf) {
                eprintln!("[ERROR] read-zone failed: {}", ZbcError::from(e));
                exit(1);
            }
        }
    }
}

fn cmd_write_zone(m: &clap::ArgMatches) {
    let dev = open(m.value_of("DEVICE").unwrap());
    let sector = parse_u64(m, "sector", 0);
    let path = m.value_of("in").unwrap();
    let mut buf = Vec::new();
    if let Err(e) = File::open(path).and_then(|mut f| f.read_to_end(&mut buf)) {
        eprintln!("[ERROR] write-zone failed: {}", ZbcError::from(e));
        exit(1);
    }
    if let Err(e) = zio::pwrite(&dev, &mut buf, sector) {
        fail("write-zone", e);
    }
}

fn cmd_zone_activate(m: &clap::ArgMatches) {
    let dev = open(m.value_of("DEVICE").unwrap());
    let start_sector = parse_u64(m, "sector", 0);
    let nr_zones = parse_u64(m, "nr-zones", 1) as u32;
    let domain_id = parse_u64(m, "domain", 0) as u8;
    let query = m.is_present("query");
    let all = m.is_present("all");

    let req = ZoneActivateRequestBuilder::default()
        .start_sector(start_sector)
        .nr_zones(nr_zones)
        .domain_id(domain_id)
        .query(query)
        .all(all)
        .build()
        .expect("every field of ZoneActivateRequestBuilder has a default");

    let records = match domain::zone_activate(&dev, &req) {
        Ok(r) => r,
        Err(e) => fail("zone-activate", e),
    };
    for r in &records {
        println!(
            "start={} nr_zones={} type={:?} cond={:?} domain={}",
            r.start_zone_sector, r.nr_zones, r.zone_type, r.condition, r.domain_id
        );
    }
}

fn cmd_report_domains(m: &clap::ArgMatches) {
    let dev = open(m.value_of("DEVICE").unwrap());
    let domains = match report::report_domains(&dev, 0, ReportingOptions::ALL, 64) {
        Ok(d) => d,
        Err(e) => fail("report-domains", e),
    };
    for d in &domains {
        println!(
            "id={} type={:?} nr_zones={} start={} end={} flags={:?}",
            d.id, d.zone_type, d.nr_zones, d.start_sector, d.end_sector, d.flags
        );
    }
}

fn cmd_report_realms(m: &clap::ArgMatches) {
    let dev = open(m.value_of("DEVICE").unwrap());
    let domains = match report::report_domains(&dev, 0, ReportingOptions::ALL, 64) {
        Ok(d) => d,
        Err(e) => fail("report-realms", e),
    };
    let realms = match report::report_realms(&dev, 0, ReportingOptions::ALL, 64, &domains) {
        Ok(r) => r,
        Err(e) => fail("report-realms", e),
    };
    for r in &realms {
        println!(
            "number={} type={:?} domain={} restrictions=0x{:04x} spans={}",
            r.number,
            r.zone_type,
            r.domain_id,
            r.restrictions,
            r.domains.len()
        );
    }
}

