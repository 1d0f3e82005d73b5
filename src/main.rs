use smfuzz::{
    access::{GuestMemory, RegisterFile},
    harness::HarnessKind,
    input::FuzzInput,
    utils::fatal,
    Config,
};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "smfuzz",
    about = "Snapshot fork-server fuzzing of rehosted secure monitor firmware."
)]
struct Settings {
    /// Injection strategy: generic, synthesis, partemu, probing, efuse, rpmb or dispatch.
    #[structopt(short = "H", long)]
    harness: Option<HarnessKind>,
    /// Harness descriptor produced by the type recovery tool, default is '/in/harnessdata.csv'.
    #[structopt(short, long)]
    descriptor: Option<PathBuf>,
    /// Dump each testcase as csv through the guest log.
    #[structopt(long)]
    print_testcases: bool,
    /// Verbose logging, -vv for trace.
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, StructOpt)]
enum Cmd {
    /// Validate the configuration and print the decoded descriptor.
    Check,
    /// Apply the harness to an input against an in-memory guest.
    Replay {
        /// Input file, e.g. a crash found by the engine.
        input: PathBuf,
    },
}

pub fn main() {
    let settings = Settings::from_args();
    let level = match settings.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    simplelog::CombinedLogger::init(vec![simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )])
    .unwrap();

    let mut conf = Config::from_env().unwrap_or_else(|e| fatal("bad environment", e));
    if let Some(h) = settings.harness {
        conf.harness = h;
    }
    if let Some(d) = settings.descriptor {
        conf.descriptor = d;
    }
    conf.print_testcases |= settings.print_testcases;
    if let Err(e) = conf.check() {
        fatal("invalid configuration", e);
    }

    match settings.cmd {
        Cmd::Check => check(&conf),
        Cmd::Replay { input } => replay(&conf, input),
    }
}

fn check(conf: &Config) {
    println!("harness:     {}", conf.harness);
    println!("scheduler:   {}", conf.sched_mode);
    println!(
        "scratch:     {:#x} + n * {:#x}",
        conf.layout.base, conf.layout.slot_size
    );
    println!(
        "mutation:    id {}/16, size {}/16",
        16 - conf.mutation.id_threshold,
        16 - conf.mutation.size_threshold
    );
    match conf.entry {
        Some(e) => println!("entry:       {:#x}", e),
        None => println!("entry:       none, the machine never forks"),
    }
    match conf.load_descriptor() {
        Ok(Some(desc)) => {
            println!("descriptor:  {}", conf.descriptor.display());
            print!("{}", desc);
        }
        Ok(None) => println!("descriptor:  unused by '{}'", conf.harness),
        Err(e) => fatal("bad descriptor", e),
    }
}

fn replay(conf: &Config, input: PathBuf) {
    let data = std::fs::read(&input)
        .unwrap_or_else(|e| fatal(&format!("failed to read {}", input.display()), e));
    let harness = conf
        .build_harness()
        .unwrap_or_else(|e| fatal("failed to set up harness", e));

    let mem = GuestMemory::new();
    let mut regs = RegisterFile::new();
    let mut fuzz_input = FuzzInput::new(&data);
    harness.apply(&mut regs, &mut fuzz_input, &mem.surface());

    println!(
        "{}: {} of {} bytes used",
        harness.name(),
        fuzz_input.cursor(),
        data.len()
    );
    for (i, v) in regs.as_slice().iter().enumerate() {
        println!("x{}: {:#018x}", i, v);
    }
    for (addr, bytes) in mem.writes() {
        println!("{:#x}: {:02x?}", addr, bytes);
    }
    for line in mem.log_lines() {
        print!("{}", line);
    }
}
