use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};

use z8_sim::image::srec;
use z8_sim::sim::cache::{CacheConfig, Placement, WritePolicy};
use z8_sim::sim::device::{SerialPort, TimerDevice};
use z8_sim::sim::mem::{MachineInitStrategy, PORT0, SIO};
use z8_sim::sim::{RunOutcome, SimFlags, Simulator};

#[derive(Parser, Debug)]
#[command(name = "z8-sim")]
#[command(about = "Runs an S-record image on a Z8-style microcontroller", long_about = None)]
struct Args {
    /// Path to the S-record image
    image: PathBuf,

    /// Number of cache lines
    #[arg(long, default_value_t = 32)]
    cache_lines: usize,

    /// Cache placement policy
    #[arg(long, value_enum, default_value_t = PlacementArg::Associative)]
    placement: PlacementArg,

    /// Cache write policy
    #[arg(long, value_enum, default_value_t = WritePolicyArg::Back)]
    write_policy: WritePolicyArg,

    /// Maximum number of instruction cycles before giving up
    #[arg(long, default_value_t = 1_000_000)]
    limit: u64,

    /// Fill memory pseudo-randomly from this seed (instead of zeroes)
    #[arg(long)]
    seed: Option<u64>,

    /// Attach a timer to PORT0 (slot 00h)
    #[arg(long, action = ArgAction::SetTrue)]
    timer: bool,

    /// Attach a serial port to SIO (slot F0h) and print what the program transmits
    #[arg(long, action = ArgAction::SetTrue)]
    serial: bool,

    /// Print register memory and cache statistics after the run
    #[arg(long, action = ArgAction::SetTrue)]
    dump: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PlacementArg {
    Direct,
    Associative,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WritePolicyArg {
    Back,
    Through,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let src = std::fs::read_to_string(&args.image)
        .with_context(|| format!("could not read {}", args.image.display()))?;
    let image = srec::parse(&src)
        .with_context(|| format!("could not load {}", args.image.display()))?;
    if let Some(name) = &image.name {
        println!("{name}");
    }

    let cache = CacheConfig {
        lines: args.cache_lines,
        placement: match args.placement {
            PlacementArg::Direct => Placement::Direct,
            PlacementArg::Associative => Placement::Associative,
        },
        write_policy: match args.write_policy {
            WritePolicyArg::Back => WritePolicy::WriteBack,
            WritePolicyArg::Through => WritePolicy::WriteThrough,
        },
    };
    let machine_init = match args.seed {
        Some(seed) => MachineInitStrategy::Seeded { seed },
        None => MachineInitStrategy::default(),
    };
    let mut sim = Simulator::new(SimFlags { cache, instruction_limit: args.limit, machine_init });

    if args.timer {
        sim.add_device(PORT0, TimerDevice::new(), 0)?;
    }
    let host = match args.serial {
        true => {
            let (port, host) = SerialPort::pair();
            sim.add_device(SIO, port, 0)?;
            Some(host)
        },
        false => None,
    };

    sim.load_image(&image);
    let outcome = sim.run();

    if let Some(host) = host {
        let sent: Vec<u8> = host.rx.try_iter().collect();
        println!("serial: {}", String::from_utf8_lossy(&sent));
    }
    println!(
        "{outcome:?} at {:04X}h: {} instructions, {} cycles, {} instruction cycles",
        sim.pc, sim.instructions_run, sim.cycles, sim.sys_clock
    );
    if args.dump {
        dump(&sim);
    }

    Ok(match outcome {
        RunOutcome::Halted => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn dump(sim: &Simulator) {
    println!("registers:");
    for (i, row) in sim.regs.as_slice().chunks(16).enumerate() {
        let bytes: Vec<_> = row.iter().map(|b| format!("{b:02X}")).collect();
        println!("  {:02X}: {}", i * 16, bytes.join(" "));
    }

    let stats = sim.cache.stats;
    println!(
        "cache: {} hits, {} misses, {} write-backs",
        stats.hits, stats.misses, stats.write_backs
    );
    for (i, line) in sim.cache.lines().iter().enumerate() {
        if let Some(tag) = line.tag {
            let dirty = if line.dirty { " (dirty)" } else { "" };
            println!("  line {i:2}: {tag:04X}h = {:02X}, rank {}{dirty}", line.data, line.rank);
        }
    }
}
