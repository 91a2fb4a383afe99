use std::sync::{Arc, Once};

use nix::{
    sys::signal::{raise, Signal},
    unistd::{fork, ForkResult},
};
use viewtrace::{
    run_session, services::memfs::MemFs, types::exit_reason::ExitReason, SessionOptions,
    SessionOptionsBuilder,
};

static INIT: Once = Once::new();

pub const VIEW_ROOT: &str = "/virtual-view";

pub fn setup() {
    INIT.call_once(|| {
        let _ = pretty_env_logger::formatted_builder()
            .parse_default_env()
            .is_test(true)
            .try_init();
    });
}

pub fn trace_with_options(f: impl FnOnce() -> i32, options: SessionOptions) -> ExitReason {
    setup();

    match unsafe { fork().unwrap() } {
        ForkResult::Parent { child } => run_session(child, options),
        ForkResult::Child => {
            raise(Signal::SIGSTOP).unwrap();
            let code = f();
            std::process::exit(code);
        }
    }
}

pub fn trace(f: impl FnOnce() -> i32) -> ExitReason {
    trace_with_options(f, SessionOptionsBuilder::test_default().build().unwrap())
}

/// Options showing a memfs with `hello.txt` at [`VIEW_ROOT`].
pub fn memfs_options() -> SessionOptionsBuilder {
    let fs = MemFs::new([VIEW_ROOT]).with_file("hello.txt", "hello, world\n");

    SessionOptionsBuilder::test_default()
        .services(vec![MemFs::descriptor(Arc::new(fs)).unwrap()])
}
