use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use nix::sys::signal::{raise, Signal};
use nix::unistd::{fork, ForkResult};

use clap::Parser;

use viewtrace::{
    default_catalog, run_session, SessionConfig, SessionOptions, SessionOptionsBuilder,
    StatsOutput,
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct CliArgs {
    /// YAML file with session settings. Flags take precedence.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name of the outermost view.
    #[arg(short = 'n', long)]
    view_name: Option<String>,

    /// Directory for copies of service-owned executables.
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Longest wait in milliseconds for a service wakeup before polling the
    /// traced processes again.
    #[arg(long, value_parser = parse_duration)]
    poll_interval: Option<Duration>,

    /// Maximum number of traced processes.
    #[arg(long)]
    max_processes: Option<usize>,

    /// Show an in-memory filesystem at the given directory. May be repeated.
    #[arg(long)]
    memfs: Vec<PathBuf>,

    /// Forbid loading and unloading services from inside the view.
    #[arg(long)]
    lock: bool,

    /// Dump statistics.
    #[arg(long)]
    dump_stats: bool,

    /// File to dump stats to.
    #[arg(long)]
    stats_output: Option<PathBuf>,

    /// File to write logs to.
    #[arg(long)]
    log_output: Option<PathBuf>,

    command: String,
    args: Vec<String>,
}

fn parse_duration(arg: &str) -> Result<std::time::Duration, std::num::ParseIntError> {
    Ok(std::time::Duration::from_millis(arg.parse()?))
}

fn run(cmd: &mut Command, options: SessionOptions) -> i32 {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => run_session(child, options).exit_code(),
        Ok(ForkResult::Child) => {
            let err = unsafe {
                cmd.pre_exec(move || {
                    raise(Signal::SIGSTOP).unwrap();
                    Ok(())
                })
                .exec()
            };
            panic!("failed to spawn subcommand: {:?}", err)
        }
        Err(err) => panic!("Fork failed: {}", err),
    }
}

fn options(cli: &CliArgs) -> viewtrace::error::Result<SessionOptions> {
    let mut builder = SessionOptionsBuilder::default()
        .catalog(default_catalog())
        .lock_services(cli.lock);

    if let Some(name) = &cli.view_name {
        builder = builder.view_name(name);
    }
    if let Some(dir) = &cli.tmp_dir {
        builder = builder.tmp_dir(dir);
    }
    if let Some(interval) = cli.poll_interval {
        builder = builder.poll_interval(interval);
    }
    if let Some(max) = cli.max_processes {
        builder = builder.max_processes(max);
    }

    let mut services = Vec::new();
    for root in &cli.memfs {
        let fs = viewtrace::services::memfs::MemFs::new([root]);
        services.push(viewtrace::services::memfs::MemFs::descriptor(
            std::sync::Arc::new(fs),
        )?);
    }
    builder = builder.services(services);

    if cli.dump_stats {
        builder = builder.dump_stats(Some(match &cli.stats_output {
            Some(path) => StatsOutput::File(path.clone()),
            None => StatsOutput::StdOut,
        }));
    }

    if let Some(path) = &cli.config {
        builder = SessionConfig::load(path)?.apply(builder)?;
    }

    Ok(builder.build()?)
}

fn main() {
    let cli = CliArgs::parse();

    let mut env_logger_builder = pretty_env_logger::formatted_timed_builder();

    env_logger_builder.parse_default_env();

    if let Some(log_output) = &cli.log_output {
        let log_file = Box::new(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_output)
                .expect("Can't create file"),
        );

        env_logger_builder.target(pretty_env_logger::env_logger::Target::Pipe(log_file));

        log_panics::init();
    }

    env_logger_builder.init();

    let options = match options(&cli) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Invalid session settings: {e}");
            std::process::exit(2);
        }
    };

    let exit_status = run(Command::new(&cli.command).args(&cli.args), options);

    std::process::exit(exit_status as _);
}
