use nix::errno::Errno;
use procfs::ProcError;

use crate::{services::descriptor::ServiceDescriptorBuilderError, types::service_code::ServiceCode};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("std::io error: `{0}`")]
    StdIO(#[from] std::io::Error),
    #[error("nix error: `{0}`")]
    Nix(#[from] Errno),
    #[error("Proc error: `{0}`")]
    Proc(#[from] ProcError),
    #[error("YAML error: `{0}`")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unknown tracer handle")]
    UnknownHandle,
    #[error("Invalid state")]
    InvalidState,
    #[error("Process control block table exhausted")]
    PcbTableExhausted,

    #[error("Service code {0} is already in use")]
    ServiceCodeInUse(ServiceCode),
    #[error("No such service")]
    NoSuchService,
    #[error("Service table is locked")]
    ServicesLocked,
    #[error("No free service code left")]
    ServiceCodesExhausted,
    #[error("Unknown module `{0}`")]
    UnknownModule(String),
    #[error("Invalid service descriptor: `{0}`")]
    Descriptor(#[from] ServiceDescriptorBuilderError),
    #[error("Invalid session options: `{0}`")]
    Options(#[from] crate::SessionOptionsBuilderError),

    #[error("Not supported: `{0}`")]
    NotSupported(String),

    #[error("Other error")]
    Other,
}

impl Error {
    /// Errors that make it impossible to keep tracking the process tree.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::PcbTableExhausted | Error::UnknownHandle | Error::InvalidState
        )
    }

    /// Kernel-style error code reported to a traced process that asked for
    /// an operation failing with this error.
    pub fn errno(&self) -> Errno {
        match self {
            Error::Nix(errno) => *errno,
            Error::StdIO(e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
            Error::ServiceCodeInUse(_) => Errno::EEXIST,
            Error::NoSuchService | Error::UnknownModule(_) => Errno::ENOENT,
            Error::ServicesLocked => Errno::EPERM,
            Error::ServiceCodesExhausted | Error::PcbTableExhausted => Errno::ENOMEM,
            Error::NotSupported(_) => Errno::ENOSYS,
            _ => Errno::EINVAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Result of an operation performed on behalf of a traced process. The error
/// side is reflected to the process as `-errno`.
pub type SysResult = std::result::Result<i64, Errno>;

pub trait SysResultExt {
    fn into_raw(self) -> i64;
}

impl SysResultExt for SysResult {
    fn into_raw(self) -> i64 {
        match self {
            Ok(v) => v,
            Err(e) => -(e as i64),
        }
    }
}
