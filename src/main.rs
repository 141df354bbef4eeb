use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::thread;

use anyhow::{bail, ensure, Context};
use clap::Parser;
use log::{info, LevelFilter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tilecoh::memory::{Address, LockSignal, MemComponent, MemOp, MemoryManager};
use tilecoh::sim::config::{Config, DirectoryType, MemoryConfig, SimConfig, Workload};
use tilecoh::sim::top::System;
use toml::Table;

#[derive(Parser)]
#[command(version, about)]
struct TilecohArgs {
    #[arg(help = "Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help = "Override number of tiles")]
    num_tiles: Option<usize>,
    #[arg(long, help = "Override workload seed")]
    seed: Option<u64>,
    #[arg(long, help = "Override directory type (full_map, limited_no_broadcast, limited_broadcast, limitless)")]
    directory_type: Option<DirectoryType>,
    #[arg(long, help = "Enable log at level (0:warn, 1:info, 2:debug)")]
    log: Option<u64>,
}

fn init_logger(level: u64) {
    let filter = match level {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(filter)
        .parse_default_env()
        .init();
}

#[derive(Debug, Default, Clone, Copy)]
struct TileRun {
    accesses: u64,
    misses: u64,
    cycles: u64,
}

fn run_random(mm: &MemoryManager, config: &SimConfig, block_size: usize) -> TileRun {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(mm.tile_id() as u64));
    let words_per_line = (block_size / 8) as Address;
    let mut run = TileRun::default();
    for _ in 0..config.ops_per_tile {
        let line = rng.gen_range(0..config.footprint_lines) as Address;
        let address = line * block_size as Address + rng.gen_range(0..words_per_line) * 8;
        let mut buf = [0u8; 8];
        let (op, component) = if rng.gen_bool(config.write_ratio) {
            buf = rng.gen::<u64>().to_le_bytes();
            (MemOp::Write, MemComponent::L1DCache)
        } else if rng.gen_bool(0.1) {
            (MemOp::Read, MemComponent::L1ICache)
        } else {
            (MemOp::Read, MemComponent::L1DCache)
        };
        let summary = mm.core_initiate_memory_access(component, LockSignal::None, op, address, &mut buf);
        run.accesses += 1;
        run.misses += summary.misses as u64;
        run.cycles += summary.latency;
    }
    run
}

const COUNTER_ADDRESS: Address = 0;

fn run_counter(mm: &MemoryManager, config: &SimConfig) -> TileRun {
    let mut run = TileRun::default();
    for _ in 0..config.ops_per_tile {
        let mut buf = [0u8; 8];
        let read = mm.core_initiate_memory_access(
            MemComponent::L1DCache,
            LockSignal::Lock,
            MemOp::ReadEx,
            COUNTER_ADDRESS,
            &mut buf,
        );
        let mut next = (u64::from_le_bytes(buf) + 1).to_le_bytes();
        let write = mm.core_initiate_memory_access(
            MemComponent::L1DCache,
            LockSignal::Unlock,
            MemOp::Write,
            COUNTER_ADDRESS,
            &mut next,
        );
        run.accesses += 2;
        run.misses += (read.misses + write.misses) as u64;
        run.cycles += read.latency + write.latency;
    }
    run
}

fn simulate(system: &System) -> anyhow::Result<()> {
    let config = system.config();
    let block_size = system.mem_config().block_size;
    let joined: Vec<thread::Result<TileRun>> = thread::scope(|s| {
        let handles: Vec<_> = (0..config.active_tiles())
            .map(|tile| {
                s.spawn(move || {
                    let mm = system.tile(tile);
                    match config.workload {
                        Workload::Random => run_random(mm, config, block_size),
                        Workload::Counter => run_counter(mm, config),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });
    if let Some(reason) = system.halt_reason() {
        bail!("simulation halted: {}", reason);
    }
    let runs: Vec<TileRun> = joined
        .into_iter()
        .map(|run| run.unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
        .collect();
    system.quiesce();

    for (tile, run) in runs.iter().enumerate() {
        info!(
            "tile {}: {} accesses, {} misses, {} cycles",
            tile, run.accesses, run.misses, run.cycles
        );
    }

    match config.workload {
        Workload::Random => {
            for line in 0..config.footprint_lines {
                system.check_coherence((line * block_size) as Address)?;
            }
        }
        Workload::Counter => {
            system.check_coherence(COUNTER_ADDRESS)?;
            let mut buf = [0u8; 8];
            system.tile(0).core_initiate_memory_access(
                MemComponent::L1DCache,
                LockSignal::None,
                MemOp::Read,
                COUNTER_ADDRESS,
                &mut buf,
            );
            let expected = (config.active_tiles() * config.ops_per_tile) as u64;
            let total = u64::from_le_bytes(buf);
            ensure!(total == expected, "counter ended at {}, expected {}", total, expected);
            info!("counter reached {}", total);
            system.quiesce();
        }
    }
    Ok(())
}

pub fn main() -> anyhow::Result<()> {
    let argv = TilecohArgs::parse();
    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;
    let config_table: Table = toml::from_str(&config).context("cannot parse config toml")?;
    let mut sim_config = SimConfig::from_section(config_table.get("sim"));
    let mut mem_config = MemoryConfig::from_section(config_table.get("mem"));

    // override toml configs with argv
    sim_config.log_level = argv.log.unwrap_or(sim_config.log_level);
    sim_config.num_tiles = argv.num_tiles.unwrap_or(sim_config.num_tiles);
    sim_config.seed = argv.seed.unwrap_or(sim_config.seed);
    mem_config.dram_directory.directory_type = argv
        .directory_type
        .unwrap_or(mem_config.dram_directory.directory_type);
    init_logger(sim_config.log_level);

    let summary_json = sim_config.summary_json.clone();
    let system = System::new(sim_config, mem_config)?;
    simulate(&system)?;

    system.output_summary(&mut io::stdout().lock())?;
    if let Some(path) = summary_json {
        let file = File::create(&path).with_context(|| format!("cannot create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &system.summary())?;
        info!("summary written to {}", path.display());
    }
    Ok(())
}
