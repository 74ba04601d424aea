use std::io::{self, Write as _};

use clap::{Parser, Subcommand};
use ntfsx::{AttributePayload, UsnJournal, Volume};
use ntfsx_core::{BlockDevice, FileBlockDevice};

#[derive(Parser)]
#[command(name = "ntfsx")]
#[command(about = "Read-only NTFS forensic inspection tool", long_about = None)]
struct Cli {
    /// Enable debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the volume's sector size, for images with no usable boot sector
    #[arg(long, global = true)]
    sector_size: Option<u32>,

    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print volume geometry, MFT record size/count, and volume label
    Info {
        /// Path to a volume device node or disk image
        volume: String,
    },
    /// List a directory's entries
    Ls { volume: String, path: String },
    /// Stream a file's unnamed $DATA to stdout
    Cat { volume: String, path: String },
    /// Print change-journal entries
    Usn {
        volume: String,
        /// Number of most recent entries to print
        #[arg(long, default_value_t = 20)]
        last: u64,
    },
    /// Write raw bytes to a sector (guarded, destructive)
    WriteSector {
        volume: String,
        sector: u64,
        /// Hex-encoded bytes to write
        hex_bytes: String,
    },
    /// List block devices and their partitions
    ListVolumes,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
    let sector_size = cli.sector_size.unwrap_or(512);

    match cli.command {
        Commands::Info { volume } => cmd_info(&volume, sector_size, cli.json),
        Commands::Ls { volume, path } => cmd_ls(&volume, &path, sector_size, cli.json),
        Commands::Cat { volume, path } => cmd_cat(&volume, &path, sector_size),
        Commands::Usn { volume, last } => cmd_usn(&volume, last, sector_size, cli.json),
        Commands::WriteSector {
            volume,
            sector,
            hex_bytes,
        } => cmd_write_sector(&volume, sector, &hex_bytes, sector_size),
        Commands::ListVolumes => cmd_list_volumes(cli.json),
    }
}

fn unsupported_subnode(_vcn: u64) -> Result<ntfsx::IndexRecord, ntfsx_core::NtfsError> {
    Err(ntfsx_core::NtfsError::Unsupported(
        "multi-record directory indexes are not supported yet".into(),
    ))
}

fn cmd_info(path: &str, sector_size: u32, json: bool) -> anyhow::Result<()> {
    let vol = Volume::open_path_with_sector_size(path, sector_size)?;
    let boot = vol.boot_sector();
    if json {
        let out = serde_json::json!({
            "bytes_per_sector": boot.bytes_per_sector,
            "sectors_per_cluster": boot.sectors_per_cluster,
            "cluster_size": boot.cluster_size(),
            "total_sectors": boot.total_sectors,
            "volume_serial": format!("{:016x}", boot.volume_serial),
            "file_record_size": vol.file_record_size(),
            "file_record_count": vol.file_record_count(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    println!("bytes per sector:      {}", boot.bytes_per_sector);
    println!("sectors per cluster:   {}", boot.sectors_per_cluster);
    println!("cluster size:          {}", boot.cluster_size());
    println!("total sectors:         {}", boot.total_sectors);
    println!("volume serial:         {:016x}", boot.volume_serial);
    println!("MFT record size:       {}", vol.file_record_size());
    println!("MFT record count:      {}", vol.file_record_count());
    Ok(())
}

fn cmd_ls(volume_path: &str, path: &str, sector_size: u32, json: bool) -> anyhow::Result<()> {
    let mut vol = Volume::open_path_with_sector_size(volume_path, sector_size)?;
    let frn = resolve_path(&mut vol, path)?;
    let record = vol.read_record(frn)?;

    let index_root = record
        .find_attr(ntfsx::structures::ATTR_INDEX_ROOT)
        .ok_or_else(|| anyhow::anyhow!("{} is not a directory", path))?;
    let root_info = match &index_root.payload {
        AttributePayload::IndexRoot(info) => info.clone(),
        _ => anyhow::bail!("malformed $INDEX_ROOT"),
    };
    let node = ntfsx::IndexNode::decode(&root_info.node_block)?;

    if json {
        let mut entries = Vec::new();
        ntfsx::index::for_each(&node, unsupported_subnode, |file_name, frn| {
            entries.push(serde_json::json!({ "name": file_name.name, "file_reference": frn }));
        })?;
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    ntfsx::index::for_each(&node, unsupported_subnode, |file_name, frn| {
        println!("{:>10}  {}", frn, file_name.name);
    })?;
    Ok(())
}

fn cmd_cat(volume_path: &str, path: &str, sector_size: u32) -> anyhow::Result<()> {
    let mut vol = Volume::open_path_with_sector_size(volume_path, sector_size)?;
    let frn = resolve_path(&mut vol, path)?;
    let record = vol.read_record(frn)?;

    let data_attr = record
        .find_attr(ntfsx::structures::ATTR_DATA)
        .ok_or_else(|| anyhow::anyhow!("{} has no unnamed $DATA stream", path))?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    match &data_attr.payload {
        AttributePayload::ResidentData(block) => {
            handle.write_all(block.as_slice())?;
        }
        AttributePayload::NonResidentData(nr) => {
            let sectors_per_cluster = vol.boot_sector().sectors_per_cluster as u64;
            let extents = nr.sector_extents(sectors_per_cluster)?;
            let real_size = nr.real_size;
            let bytes = vol.read_attribute_range(&extents, 0, real_size)?;
            handle.write_all(&bytes)?;
        }
        _ => anyhow::bail!("$DATA has an unexpected payload shape"),
    }
    Ok(())
}

fn cmd_usn(volume_path: &str, last: u64, sector_size: u32, json: bool) -> anyhow::Result<()> {
    let mut vol = Volume::open_path_with_sector_size(volume_path, sector_size)?;
    let mut journal = UsnJournal::open(&mut vol)?;
    let entries = journal.last_n(last)?;

    if json {
        let out: Vec<_> = entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "usn": entry.usn,
                    "file_reference": entry.file_reference,
                    "parent_file_reference": entry.parent_file_reference,
                    "reason": entry.reason,
                    "filename": entry.filename,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for entry in entries {
        println!(
            "usn={:<12} frn={:<10} reason=0x{:08x} {}",
            entry.usn, entry.file_reference, entry.reason, entry.filename
        );
    }
    Ok(())
}

fn cmd_write_sector(volume_path: &str, sector: u64, hex_bytes: &str, sector_size: u32) -> anyhow::Result<()> {
    let bytes = decode_hex(hex_bytes)?;

    println!(
        "WARNING: this will overwrite sector {} on {}.",
        sector, volume_path
    );
    print!("Type 'yes' to continue: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    if line.trim() != "yes" {
        println!("Write cancelled.");
        return Ok(());
    }

    let mut device = FileBlockDevice::open(volume_path, sector_size)?;
    let written = device.write_sector(sector, &bytes)?;
    println!("wrote {} bytes to sector {}", written, sector);
    Ok(())
}

fn decode_hex(hex: &str) -> anyhow::Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        anyhow::bail!("hex byte string must have an even length");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| anyhow::anyhow!(e)))
        .collect()
}

/// Resolves a `/`-separated path by walking the directory index tree from
/// the root directory (FRN 5).
fn resolve_path(vol: &mut Volume<FileBlockDevice>, path: &str) -> anyhow::Result<u64> {
    let mut frn = ntfsx::structures::FRN_ROOT;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        let record = vol.read_record(frn)?;
        let index_root = record
            .find_attr(ntfsx::structures::ATTR_INDEX_ROOT)
            .ok_or_else(|| anyhow::anyhow!("{} is not a directory", component))?;
        let root_info = match &index_root.payload {
            AttributePayload::IndexRoot(info) => info.clone(),
            _ => anyhow::bail!("malformed $INDEX_ROOT"),
        };
        let node = ntfsx::IndexNode::decode(&root_info.node_block)?;
        let found = ntfsx::index::find(&node, component, root_info.collation_rule, unsupported_subnode)?;
        frn = found.ok_or_else(|| anyhow::anyhow!("{} not found", component))? & 0x0000_FFFF_FFFF_FFFF;
    }
    Ok(frn)
}

/// One line of `/proc/partitions`: major, minor, block count, device name.
struct PartitionInfo {
    name: String,
    blocks: u64,
}

#[cfg(target_os = "linux")]
fn list_volumes() -> Vec<PartitionInfo> {
    let contents = match std::fs::read_to_string("/proc/partitions") {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    contents
        .lines()
        .skip(2) // header line, then blank separator
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            Some(PartitionInfo {
                name: fields[3].to_string(),
                blocks: fields[2].parse().unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn list_volumes() -> Vec<PartitionInfo> {
    Vec::new()
}

fn cmd_list_volumes(json: bool) -> anyhow::Result<()> {
    let volumes = list_volumes();
    if json {
        let out: Vec<_> = volumes
            .iter()
            .map(|v| serde_json::json!({ "name": v.name, "blocks_1k": v.blocks }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    for v in &volumes {
        println!("/dev/{:<12} {} KiB", v.name, v.blocks);
    }
    Ok(())
}
