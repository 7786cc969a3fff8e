//! objcache Inspect - Volume maintenance CLI
//!
//! Formats volume files and reports the state of both metadata slots.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use objcache_common::{VolumeConfig, VolumeGeometry};
use objcache_storage::{FileSlots, SlotReader, SlotState, VolumeMetadata, check_slot, select_slot};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "objcache-inspect")]
#[command(about = "objcache volume inspection tool")]
#[command(version)]
struct Args {
    /// Volume configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a volume file and write fresh metadata
    Format {
        /// Volume file or block device
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Report both metadata slots and the state recovery would load
    Show {
        /// Volume file or block device
        path: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct SlotReport {
    slot: usize,
    offset: u64,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sync_serial: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entries: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LoadedReport {
    slot: Option<usize>,
    volume: String,
    version: String,
    create_time: u64,
    sync_serial: u32,
    write_pos: u64,
    write_lap: u32,
    entries: usize,
    live_entries: usize,
    keys: usize,
    size_on_disk: u64,
    max_size_on_disk: u64,
}

#[derive(Debug, Serialize)]
struct VolumeReport {
    path: String,
    capacity: u64,
    slot_size: u64,
    data_start: u64,
    slots: Vec<SlotReport>,
    freshest_valid_slot: Option<usize>,
    loaded: Option<LoadedReport>,
}

fn load_config(path: Option<&Path>) -> Result<VolumeConfig> {
    match path {
        Some(path) => VolumeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(VolumeConfig::default()),
    }
}

fn format_volume(config: &VolumeConfig, geometry: VolumeGeometry, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let mut slots = FileSlots::create(path, geometry, config.direct_io)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut meta = VolumeMetadata::new(config.max_entries);
    meta.clean_init(geometry.data_start());
    meta.flush(&mut slots).context("failed to write metadata")?;

    info!(path = %path.display(), volume = %meta.volume_id(), "volume formatted");
    println!("Formatted {}", path.display());
    println!("  Volume:     {}", meta.volume_id());
    println!("  Capacity:   {} bytes", geometry.capacity());
    println!("  Slot size:  {} bytes", geometry.slot_size());
    println!("  Data start: {}", geometry.data_start());
    Ok(())
}

fn inspect_volume(config: &VolumeConfig, geometry: VolumeGeometry, path: &Path) -> Result<VolumeReport> {
    let slots = FileSlots::open(path, geometry, config.direct_io)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut states = Vec::with_capacity(2);
    let mut reports = Vec::with_capacity(2);
    for slot in 0..2 {
        let image = slots
            .read_slot(slot)
            .with_context(|| format!("failed to read slot {slot}"))?;
        let state = check_slot(&image);
        reports.push(match state {
            SlotState::Valid { header, entries, .. } => SlotReport {
                slot,
                offset: geometry.slot_offset(slot),
                valid: true,
                reason: None,
                sync_serial: Some(header.sync_serial),
                entries: Some(entries),
            },
            SlotState::Invalid(reason) => SlotReport {
                slot,
                offset: geometry.slot_offset(slot),
                valid: false,
                reason: Some(reason.to_string()),
                sync_serial: None,
                entries: None,
            },
        });
        states.push(state);
    }

    let mut meta = VolumeMetadata::new(config.max_entries);
    let loaded = meta
        .load(&slots)
        .context("failed to load metadata")?
        .then(|| LoadedReport {
            slot: meta.current_slot(),
            volume: meta.volume_id().to_string(),
            version: meta.header().version.to_string(),
            create_time: meta.header().create_time,
            sync_serial: meta.sync_serial(),
            write_pos: meta.cursor().write_pos,
            write_lap: meta.cursor().write_lap,
            entries: meta.table().len(),
            live_entries: meta.live_entries().count(),
            keys: meta.table().key_count(),
            size_on_disk: meta.size_on_disk(),
            max_size_on_disk: meta.max_size_on_disk(),
        });

    Ok(VolumeReport {
        path: path.display().to_string(),
        capacity: geometry.capacity(),
        slot_size: geometry.slot_size(),
        data_start: geometry.data_start(),
        slots: reports,
        freshest_valid_slot: select_slot(&states),
        loaded,
    })
}

fn print_report(report: &VolumeReport) {
    println!("Volume: {}", report.path);
    println!("=======");
    println!("Capacity:   {} bytes", report.capacity);
    println!("Slot size:  {} bytes", report.slot_size);
    println!("Data start: {}", report.data_start);
    println!();

    for slot in &report.slots {
        let name = if slot.slot == 0 { "A" } else { "B" };
        match (slot.valid, slot.sync_serial, slot.entries) {
            (true, Some(serial), Some(entries)) => {
                println!("Slot {name} @ {}: valid, serial {serial}, {entries} entries", slot.offset);
            }
            _ => println!(
                "Slot {name} @ {}: invalid ({})",
                slot.offset,
                slot.reason.as_deref().unwrap_or("unknown")
            ),
        }
    }
    println!();

    match &report.loaded {
        Some(loaded) => {
            let slot = match loaded.slot {
                Some(0) => "A",
                Some(_) => "B",
                None => "-",
            };
            println!("Loaded from slot {slot}");
            println!("  Volume:       {}", loaded.volume);
            println!("  Version:      {}", loaded.version);
            println!("  Created:      {}", loaded.create_time);
            println!("  Sync serial:  {}", loaded.sync_serial);
            println!("  Write cursor: {} (lap {})", loaded.write_pos, loaded.write_lap);
            println!(
                "  Entries:      {} ({} live, {} keys)",
                loaded.entries, loaded.live_entries, loaded.keys
            );
            println!(
                "  Metadata:     {} of {} bytes",
                loaded.size_on_disk, loaded.max_size_on_disk
            );
        }
        None => println!("No loadable metadata: the volume would be reformatted on open"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(args.config.as_deref())?;
    let geometry = VolumeMetadata::geometry(&config).context("invalid volume geometry")?;

    match args.command {
        Commands::Format { path, force } => format_volume(&config, geometry, &path, force)?,
        Commands::Show { path, json } => {
            let report = inspect_volume(&config, geometry, &path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
    }

    Ok(())
}
