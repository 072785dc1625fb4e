use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use qpair_harness::driver::regs;
use qpair_harness::{
    ArbitrationFeature, ArbitrationScenario, Command, DmaBuffer, Harness, HarnessConfig, Priority,
    QueuePairDriver, ScenarioReport, Status, VerifyMode,
};
use qpair_sim::{ArbiterMode, SimConfig, SimDevice};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(
    name = "qpair",
    about = "Validate NVMe queue pairs and WRRU arbitration on dnvme or an emulated controller."
)]
struct Cli {
    /// Harness configuration (JSON)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print results as JSON on stdout
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct Target {
    /// dnvme character device, e.g. /dev/nvme0
    #[arg(long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Use the emulated controller
    #[arg(long, action = clap::ArgAction::SetTrue)]
    sim: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SimFault {
    /// Ignore CC.AMS and serve queues round robin
    RoundRobin,
    /// Serve the weighted classes lowest first
    ReverseOrder,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Program WRRU, load one queue pair per priority class and verify completion order
    Arbitration {
        #[command(flatten)]
        target: Target,

        #[arg(long, default_value_t = 3)]
        high_weight: u32,
        #[arg(long, default_value_t = 2)]
        medium_weight: u32,
        #[arg(long, default_value_t = 1)]
        low_weight: u32,

        /// Arbitration burst exponent (7 = unlimited)
        #[arg(long, default_value_t = 7)]
        burst: u8,

        /// Commands per class: urgent,high,medium,low
        #[arg(long, value_delimiter = ',', default_value = "2,6,4,2")]
        commands: Vec<u32>,

        /// Only check urgent-first and per-class counts
        #[arg(long, action = clap::ArgAction::SetTrue)]
        coarse: bool,

        /// Misbehaviour for the emulated controller
        #[arg(long, value_enum, requires = "sim")]
        sim_fault: Option<SimFault>,
    },
    /// Write, read back and compare a block on one queue pair
    Smoke {
        #[command(flatten)]
        target: Target,

        #[arg(long, default_value_t = 0)]
        slba: u64,

        #[arg(long, default_value_t = 8)]
        blocks: u32,

        #[arg(long, default_value_t = 512)]
        block_size: usize,
    },
    /// Dump the controller registers the harness uses
    Registers {
        #[command(flatten)]
        target: Target,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Cmd::Arbitration {
            target,
            high_weight,
            medium_weight,
            low_weight,
            burst,
            commands,
            coarse,
            sim_fault,
        } => {
            let commands: [u32; 4] = commands.try_into().map_err(|v: Vec<u32>| {
                anyhow::anyhow!("--commands takes 4 values, got {}", v.len())
            })?;
            let feature = ArbitrationFeature::new(burst, high_weight, medium_weight, low_weight)?;
            let mode = if coarse {
                VerifyMode::Coarse
            } else {
                VerifyMode::Windowed
            };
            let mut scenario = ArbitrationScenario::standard(feature, commands, mode);
            scenario.queue_depth = config.io_queue_depth;

            let report = match target_kind(&target) {
                TargetKind::Sim => {
                    let device = sim_device(&config, SimConfig::default());
                    if let Some(fault) = sim_fault {
                        device.update_faults(|f| f.arbiter = fault.arbiter_mode());
                    }
                    scenario.run(&mut device.harness(&config))?
                }
                TargetKind::Device(path) => {
                    let mut harness = open_device(path, &config)?;
                    scenario.run(&mut harness)?
                }
            };
            print_arbitration(&report, cli.json)?;
            if !report.passed() {
                bail!("arbitration check failed");
            }
        }
        Cmd::Smoke {
            target,
            slba,
            blocks,
            block_size,
        } => {
            let summary = match target_kind(&target) {
                TargetKind::Sim => {
                    let device = sim_device(
                        &config,
                        SimConfig {
                            block_size,
                            ..SimConfig::default()
                        },
                    );
                    smoke(&mut device.harness(&config), slba, blocks, block_size)?
                }
                TargetKind::Device(path) => {
                    smoke(&mut open_device(path, &config)?, slba, blocks, block_size)?
                }
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("smoke test passed: {blocks} blocks at lba {slba}");
            }
        }
        Cmd::Registers { target } => {
            let values = match target_kind(&target) {
                TargetKind::Sim => {
                    registers(&mut sim_device(&config, SimConfig::default()).harness(&config))?
                }
                TargetKind::Device(path) => registers(&mut open_device(path, &config)?)?,
            };
            if cli.json {
                let map: serde_json::Map<String, serde_json::Value> = values
                    .iter()
                    .map(|(name, value)| (name.to_string(), json!(value)))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (name, value) in values {
                    println!("{name:<6} {value:#010x}");
                }
            }
        }
    }
    Ok(())
}

impl SimFault {
    fn arbiter_mode(self) -> ArbiterMode {
        match self {
            SimFault::RoundRobin => ArbiterMode::RoundRobin,
            SimFault::ReverseOrder => {
                ArbiterMode::ForcedOrder([Priority::Low, Priority::Medium, Priority::High])
            }
        }
    }
}

enum TargetKind<'a> {
    Sim,
    Device(&'a Path),
}

fn target_kind(target: &Target) -> TargetKind<'_> {
    match &target.device {
        Some(path) => TargetKind::Device(path),
        None => TargetKind::Sim,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<HarnessConfig> {
    let config = match path {
        Some(path) => HarnessConfig::from_json_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => HarnessConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Emulated controller sized to accept the queues `config` asks for.
fn sim_device(config: &HarnessConfig, base: SimConfig) -> SimDevice {
    SimDevice::new(SimConfig {
        admin_queue_depth: u16::try_from(config.admin_queue_depth).unwrap_or(u16::MAX),
        max_queue_entries: base.max_queue_entries.max(config.io_queue_depth),
        nsid: config.nsid,
        ..base
    })
}

#[cfg(target_os = "linux")]
fn open_device(
    path: &Path,
    config: &HarnessConfig,
) -> anyhow::Result<Harness<qpair_dnvme::DnvmeDevice>> {
    let device = qpair_dnvme::DnvmeDevice::open(path)
        .with_context(|| format!("open dnvme device {}", path.display()))?;
    Ok(Harness::new(device, config))
}

#[cfg(not(target_os = "linux"))]
fn open_device(path: &Path, _config: &HarnessConfig) -> anyhow::Result<Harness<SimDevice>> {
    bail!("{}: the dnvme driver is only available on Linux", path.display())
}

fn print_arbitration(report: &ScenarioReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let arb = &report.arbitration;
    println!(
        "wrru selected: {}, weights h/m/l {}/{}/{}, burst {}",
        report.wrru_selected,
        report.feature.weight(Priority::High),
        report.feature.weight(Priority::Medium),
        report.feature.weight(Priority::Low),
        report.feature.burst
    );
    println!(
        "reaped {}/{}, loops {}/{}, state {:?}",
        report.reaped, report.submitted, arb.loops, arb.cycle_target, arb.state
    );
    for class in [Priority::Urgent, Priority::High, Priority::Medium, Priority::Low] {
        println!(
            "  {class:<7} observed {:>4}  errors {:>4}",
            arb.observed(class),
            arb.errors(class)
        );
    }
    for m in &arb.mismatches {
        println!(
            "  mismatch at {}: sq {} cid {} expected {:?} got {:?}",
            m.position, m.sq_id, m.cid, m.expected, m.actual
        );
    }
    for e in &report.status_errors {
        println!("  status error: sq {} cid {} {}", e.sq_id, e.cid, e.status);
    }
    if let Some(shortfall) = arb.reap_timeout {
        println!(
            "  timed out on cq {} with {}/{} completions",
            shortfall.cq_id, shortfall.reaped, shortfall.expected
        );
    }
    println!("{}", if report.passed() { "PASS" } else { "FAIL" });
    Ok(())
}

const SMOKE_QID: u16 = 1;

fn smoke<D: QueuePairDriver>(
    harness: &mut Harness<D>,
    slba: u64,
    blocks: u32,
    block_size: usize,
) -> anyhow::Result<serde_json::Value> {
    ensure!(blocks > 0, "--blocks must be nonzero");
    let nsid = harness.nsid();
    let bytes = blocks as usize * block_size;
    let pattern: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();

    harness.create_io_pair(SMOKE_QID, 16, Priority::Medium)?;
    let readback = DmaBuffer::zeroed(bytes);
    let steps = [
        (Command::write(nsid, slba, blocks), DmaBuffer::from_vec(pattern.clone())),
        (Command::read(nsid, slba, blocks), readback.clone()),
        (Command::compare(nsid, slba, blocks), DmaBuffer::from_vec(pattern.clone())),
    ];
    let mut statuses = Vec::new();
    for (cmd, buffer) in steps {
        harness.submit(SMOKE_QID, &cmd, Some(buffer))?;
        harness.ring_doorbell(SMOKE_QID)?;
        let outcome = harness.reap(SMOKE_QID, 1)?;
        harness.retire(&outcome.entries);
        let status = outcome
            .entries
            .first()
            .map(|e| e.status())
            .context("no completion reaped")?;
        statuses.push((cmd.kind.opcode(), status));
    }
    harness.delete_all_io_queues()?;

    for (opcode, status) in &statuses {
        ensure!(
            *status == Status::SUCCESS,
            "opcode {opcode:#04x} completed with {status}"
        );
    }
    ensure!(readback.to_vec() == pattern, "read back data differs from what was written");
    Ok(json!({
        "slba": slba,
        "blocks": blocks,
        "bytes": bytes,
        "statuses": statuses
            .iter()
            .map(|(opcode, status)| json!({ "opcode": opcode, "status": status }))
            .collect::<Vec<_>>(),
    }))
}

fn registers<D: QueuePairDriver>(
    harness: &mut Harness<D>,
) -> anyhow::Result<Vec<(&'static str, u32)>> {
    [
        ("CAP", regs::CAP),
        ("CAP_HI", regs::CAP_HI),
        ("VS", regs::VS),
        ("CC", regs::CC),
        ("CSTS", regs::CSTS),
    ]
    .into_iter()
    .map(|(name, offset)| Ok((name, harness.read_register(offset)?)))
    .collect()
}
