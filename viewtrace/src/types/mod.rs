pub mod behavior;
pub mod exit_reason;
pub mod file_stat;
pub mod pcb_id;
pub mod service_code;
