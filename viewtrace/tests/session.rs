mod common;

use nix::{
    errno::Errno,
    fcntl::{open, OFlag},
    libc,
    sys::{
        signal::{raise, Signal},
        stat::Mode,
        wait::{waitpid, WaitStatus},
    },
    unistd::{close, fork, read, ForkResult},
};
use serial_test::serial;
use viewtrace::{
    engine::virsc::{ViewInfo, VirscOp, NAME_MAX, VIRSC_MGMT},
    SessionConfig, SessionOptionsBuilder,
};

use crate::common::{memfs_options, trace, trace_with_options, VIEW_ROOT};

fn read_view_file(name: &str) -> Result<Vec<u8>, Errno> {
    let fd = open(
        format!("{VIEW_ROOT}/{name}").as_str(),
        OFlag::O_RDONLY,
        Mode::empty(),
    )?;

    let mut buf = [0u8; 64];
    let n = read(fd, &mut buf)?;
    close(fd)?;

    Ok(buf[..n].to_vec())
}

#[test]
#[serial]
fn exit_code_is_reported() {
    trace(|| 7).expect_exit_code(7);
}

#[test]
#[serial]
fn termination_signal_is_reported() {
    trace(|| {
        raise(Signal::SIGTERM).unwrap();
        0
    })
    .expect_signal(Signal::SIGTERM);
}

#[test]
#[serial]
fn host_files_stay_visible() {
    trace(|| match std::fs::metadata("/") {
        Ok(m) if m.is_dir() => 0,
        _ => 1,
    })
    .expect();
}

#[test]
#[serial]
fn memfs_file_is_readable() {
    trace_with_options(
        || match read_view_file("hello.txt") {
            Ok(data) if data == b"hello, world\n" => 0,
            _ => 1,
        },
        memfs_options().build().unwrap(),
    )
    .expect();
}

#[test]
#[serial]
fn missing_memfs_file() {
    trace_with_options(
        || match read_view_file("missing.txt") {
            Err(Errno::ENOENT) => 0,
            _ => 1,
        },
        memfs_options().build().unwrap(),
    )
    .expect();
}

#[test]
#[serial]
fn memfs_is_invisible_without_the_service() {
    trace(|| match read_view_file("hello.txt") {
        Err(Errno::ENOENT) => 0,
        _ => 1,
    })
    .expect();
}

#[test]
#[serial]
fn forked_child_reads_memfs() {
    trace_with_options(
        || match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = match read_view_file("hello.txt") {
                    Ok(data) if data == b"hello, world\n" => 0,
                    _ => 1,
                };
                std::process::exit(code)
            }
            Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, 0)) => 0,
                _ => 1,
            },
            Err(_) => 1,
        },
        memfs_options().build().unwrap(),
    )
    .expect();
}

#[test]
#[serial]
fn view_info_reports_view_name() {
    trace_with_options(
        || {
            let mut info = ViewInfo {
                server_pid: 0,
                view_id: 0,
                view_name: [0; NAME_MAX + 1],
            };

            let ret = unsafe {
                libc::syscall(
                    VIRSC_MGMT as _,
                    VirscOp::GetViewInfo as usize,
                    &mut info as *mut ViewInfo,
                )
            };

            let name_ok = info.view_name.starts_with(b"outer\0");
            let server_ok = info.server_pid == nix::unistd::getppid().as_raw();

            if ret == 0 && name_ok && server_ok {
                0
            } else {
                1
            }
        },
        memfs_options().view_name("outer").build().unwrap(),
    )
    .expect();
}

#[test]
#[serial]
fn unknown_virtual_call_fails() {
    trace(|| {
        let ret = unsafe { libc::syscall(VIRSC_MGMT as _, 99usize) };
        if ret == -1 && Errno::last() == Errno::ENOSYS {
            0
        } else {
            1
        }
    })
    .expect();
}

#[test]
#[serial]
fn config_file_adds_memfs() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(
        &mut file,
        format!("memfs:\n  - mount: {VIEW_ROOT}\n    files:\n      notes/a.txt: \"from config\"\n")
            .as_bytes(),
    )
    .unwrap();

    let options = SessionConfig::load(file.path())
        .unwrap()
        .apply(SessionOptionsBuilder::test_default())
        .unwrap()
        .build()
        .unwrap();

    trace_with_options(
        || match read_view_file("notes/a.txt") {
            Ok(data) if data == b"from config" => 0,
            _ => 1,
        },
        options,
    )
    .expect();
}
