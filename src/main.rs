use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use tailtrace::attach::parse_code;
use tailtrace::cmds;
use tailtrace::config::{Config, DispatchPlan};
use tailtrace::AttachPoint;

#[derive(Debug, Parser)]
#[command(name = "tailtrace")]
#[command(about = "Syscall dispatch through BPF tail calls")]
#[command(version)]
struct Command {
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Compiled BPF object to load instead of the embedded one
    #[arg(long, global = true)]
    object: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print a trace line every time a program is executed
    Hello {
        /// Event sources to attach to instead of syscall:execve
        #[arg(long)]
        attach: Vec<AttachPoint>,
        /// Number each line from a BPF global variable
        #[arg(long)]
        counter: bool,
    },
    /// Stream a record for every executed program
    Buffer {
        #[arg(long)]
        attach: Vec<AttachPoint>,
    },
    /// Count execve, openat and write calls per uid
    Count {
        #[arg(long)]
        attach: Vec<AttachPoint>,
        /// Seconds between counter snapshots
        #[arg(short, long, default_value = "2")]
        interval: u64,
    },
    /// Print every syscall number from one program, without tail calls
    Func {
        /// Raw tracepoints to attach to instead of raw_tp:sys_enter
        #[arg(long)]
        attach: Vec<AttachPoint>,
    },
    /// Route every syscall through the dispatch table
    Dispatch {
        /// JSON dispatch plan, the built in plan is used if not given
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the dispatch plan in process for the given syscalls
    Simulate {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Records held before further ones are dropped
        #[arg(long, default_value = "4096")]
        capacity: usize,
        /// Syscall numbers or names
        #[arg(required = true, allow_negative_numbers = true)]
        codes: Vec<String>,
    },
}

fn load_plan(path: Option<PathBuf>) -> Result<DispatchPlan> {
    match path {
        Some(path) => DispatchPlan::load(&path),
        None => Ok(DispatchPlan::default()),
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();

    let level = if opts.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = Config {
        verbose: opts.verbose,
        object: opts.object,
        ..Default::default()
    };

    match opts.command {
        Commands::Hello { attach, counter } => {
            config.attach = attach;
            cmds::hello::run(&config, counter)
        }
        Commands::Buffer { attach } => {
            config.attach = attach;
            cmds::buffer::run(&config)
        }
        Commands::Count { attach, interval } => {
            config.attach = attach;
            config.interval = std::time::Duration::from_secs(interval);
            cmds::count::run(&config)
        }
        Commands::Func { attach } => {
            config.attach = attach;
            cmds::func::run(&config)
        }
        Commands::Dispatch { config: plan } => {
            config.plan = load_plan(plan)?;
            cmds::dispatch::run(&config)
        }
        Commands::Simulate {
            config: plan,
            capacity,
            codes,
        } => {
            config.plan = load_plan(plan)?;
            config.channel_capacity = capacity;
            let codes = codes
                .iter()
                .map(|c| parse_code(c))
                .collect::<Result<Vec<_>>>()?;
            cmds::simulate::run(&config, &codes, &mut io::stdout().lock())?;
            Ok(())
        }
    }
}
