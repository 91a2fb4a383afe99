pub mod process_lifetime;
pub mod syscall;
