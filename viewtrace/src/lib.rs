pub mod canonicalize;
pub mod dispatcher;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod events;
pub mod pcb;
pub mod scheduler;
pub mod services;
pub mod statistics;
pub mod tracer;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use derivative::Derivative;
use derive_builder::Builder;
use log::{error, info};
use nix::{
    sys::{
        signal::Signal,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{getpid, Pid},
};
use serde::Deserialize;

use crate::{
    dispatcher::{Dispatcher, Module},
    engine::{sctab::SyscallTable, Engine, EngineConfig},
    error::{Error, Result},
    services::{memfs::MemFs, ServiceDescriptor},
    statistics::{counter::CounterCollector, StatisticsProvider},
    tracer::ptrace::PtraceTracer,
    types::exit_reason::ExitReason,
};

pub use crate::engine::{ModuleCatalog, ModuleFactory};

#[derive(Debug, Clone)]
pub enum StatsOutput {
    File(PathBuf),
    StdOut,
}

#[derive(Default, Builder, Derivative)]
#[derivative(Debug)]
#[builder(default, pattern = "owned")]
pub struct SessionOptions {
    /// Dump statistics
    pub dump_stats: Option<StatsOutput>,

    /// Name of the outermost view
    #[builder(setter(into, strip_option))]
    pub view_name: Option<String>,

    /// Directory for copies of service-owned executables
    #[builder(setter(into, strip_option))]
    pub tmp_dir: Option<PathBuf>,

    /// Longest wait for a service wakeup between two tracer polls
    #[builder(default = "Duration::from_millis(100)")]
    pub poll_interval: Duration,

    /// Most processes traced at once (unlimited if `None`)
    #[builder(setter(strip_option))]
    pub max_processes: Option<usize>,

    /// Modules loadable by name from inside the view
    #[derivative(Debug = "ignore")]
    pub catalog: ModuleCatalog,

    /// Services registered before the root process runs, in priority order
    pub services: Vec<ServiceDescriptor>,

    /// Forbid changes of the service table
    pub lock_services: bool,

    // extra modules
    #[derivative(Debug = "ignore")]
    pub extra_modules: Vec<Box<dyn Module + Sync>>,
}

impl SessionOptionsBuilder {
    pub fn test_default() -> Self {
        Self::default()
            .catalog(default_catalog())
            .poll_interval(Duration::from_millis(10))
    }
}

/// Modules shipped with the crate.
pub fn default_catalog() -> ModuleCatalog {
    let mut catalog = ModuleCatalog::new();
    let memfs: ModuleFactory =
        Arc::new(|| MemFs::descriptor(Arc::new(MemFs::new(Vec::<PathBuf>::new()))));
    catalog.insert(services::memfs::FSTYPE.to_owned(), memfs);
    catalog
}

/// An in-memory filesystem to show at `mount` from the start.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemFsConfig {
    pub mount: PathBuf,

    /// File path (relative to the mount) to contents
    #[serde(default)]
    pub files: BTreeMap<PathBuf, String>,
}

/// Session settings read from a YAML file. Command line flags take
/// precedence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub view_name: Option<String>,
    pub tmp_dir: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
    pub max_processes: Option<usize>,
    pub lock_services: bool,
    pub memfs: Vec<MemFsConfig>,
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Fills the options the builder leaves unset.
    pub fn apply(self, mut options: SessionOptionsBuilder) -> Result<SessionOptionsBuilder> {
        if options.view_name.is_none() {
            if let Some(name) = self.view_name {
                options = options.view_name(name);
            }
        }
        if options.tmp_dir.is_none() {
            if let Some(dir) = self.tmp_dir {
                options = options.tmp_dir(dir);
            }
        }
        if options.poll_interval.is_none() {
            if let Some(ms) = self.poll_interval_ms {
                options = options.poll_interval(Duration::from_millis(ms));
            }
        }
        if options.max_processes.is_none() {
            if let Some(max) = self.max_processes {
                options = options.max_processes(max);
            }
        }
        if self.lock_services {
            options = options.lock_services(true);
        }

        let mut services = options.services.take().unwrap_or_default();
        for fs in self.memfs {
            let memfs = fs
                .files
                .into_iter()
                .fold(MemFs::new([fs.mount]), |memfs, (path, contents)| {
                    memfs.with_file(path, contents)
                });
            services.push(MemFs::descriptor(Arc::new(memfs))?);
        }

        Ok(options.services(services))
    }
}

fn run_engine<'d, 'm>(
    child_pid: Pid,
    options: SessionOptions,
    disp: &'d Dispatcher<'d, 'm>,
) -> Result<ExitReason> {
    let status = waitpid(child_pid, Some(WaitPidFlag::WSTOPPED))?;
    if status != WaitStatus::Stopped(child_pid, Signal::SIGSTOP) {
        error!("Unexpected initial state of {child_pid}: {status:?}");
        return Err(Error::InvalidState);
    }

    let tracer = PtraceTracer::seize(child_pid)?;

    let config = EngineConfig {
        tmp_dir: options.tmp_dir.unwrap_or_else(std::env::temp_dir),
        poll_interval: options.poll_interval,
        catalog: options.catalog,
        server_pid: getpid(),
        max_processes: options.max_processes,
    };

    let mut engine = Engine::new(tracer, SyscallTable::linux_default(), config, disp);

    if let Some(name) = options.view_name {
        let root = engine.epochs().root();
        engine.set_view_name(root, name);
    }

    for service in options.services {
        engine.register_service(service, None, None)?;
    }

    if options.lock_services {
        engine.lock_services();
    }

    engine.run()
}

/// Traces `child_pid`, which must have stopped itself with `SIGSTOP`, and
/// the processes it creates, until all of them are gone.
pub fn run_session(child_pid: Pid, mut options: SessionOptions) -> ExitReason {
    info!(
        "Starting with args {:?}",
        std::env::args_os().collect::<Vec<OsString>>()
    );

    let disp = Dispatcher::new();

    // Extras
    for module in options.extra_modules.drain(..) {
        disp.register_module_boxed(module);
    }

    // Statistics
    disp.register_module(CounterCollector::new());

    let dump_stats = options.dump_stats.take();

    info!("Server PID = {}", getpid());

    let exit_reason = match run_engine(child_pid, options, &disp) {
        Ok(reason) => reason,
        Err(e) => {
            error!("Session failed: {e}");
            ExitReason::Crashed(e)
        }
    };

    if let Some(output) = dump_stats {
        let s = format!("{}\n", statistics::as_text(disp.statistics()));

        match output {
            StatsOutput::File(path) => {
                if let Err(e) = fs::write(&path, s) {
                    error!("Cannot write statistics to {path:?}: {e}");
                }
            }
            StatsOutput::StdOut => print!("{}", s),
        }
    }

    info!("Session ended: {exit_reason:?}");

    exit_reason
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_fills_unset_options() {
        let config = SessionConfig::parse(
            r#"
view_name: outer
poll_interval_ms: 5
memfs:
  - mount: /virtual-view
    files:
      hello.txt: "hi\n"
"#,
        )
        .unwrap();

        let options = config
            .apply(SessionOptionsBuilder::default().view_name("cli"))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(options.view_name.as_deref(), Some("cli"));
        assert_eq!(options.poll_interval, Duration::from_millis(5));
        assert_eq!(options.services.len(), 1);
        assert_eq!(options.services[0].name, services::memfs::FSTYPE);
    }

    #[test]
    fn test_config_rejects_unknown_keys() {
        assert!(matches!(
            SessionConfig::parse("no_such_key: 1"),
            Err(Error::Yaml(_))
        ));
    }

    #[test]
    fn test_default_catalog() {
        let catalog = default_catalog();
        let desc = catalog[services::memfs::FSTYPE]().unwrap();
        assert_eq!(desc.name, "memfs");
    }
}
