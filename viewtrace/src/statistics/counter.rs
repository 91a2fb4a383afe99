use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    dispatcher::{Module, Subscribers},
    error::Result,
    events::{
        process_lifetime::{ProcessInfo, ProcessLifetimeHook},
        syscall::{SyscallDecision, SyscallEventHook},
    },
    statistics_list,
    types::{behavior::Behavior, exit_reason::ExitReason, pcb_id::PcbId},
};

use super::{StatisticsList, StatisticsProvider};

/// Counts syscall stops, dispatch outcomes and process lifetimes.
#[derive(Default)]
pub struct CounterCollector {
    entries: AtomicU64,
    exits: AtomicU64,
    resumed: AtomicU64,
    std: AtomicU64,
    fake: AtomicU64,
    call_on_exit: AtomicU64,
    modified_args: AtomicU64,
    suspended: AtomicU64,
    path_errors: AtomicU64,
    served: AtomicU64,
    processes_added: AtomicU64,
    processes_removed: AtomicU64,
}

impl CounterCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    pub fn processes_added(&self) -> u64 {
        self.processes_added.load(Ordering::SeqCst)
    }
}

impl StatisticsProvider for CounterCollector {
    fn class_name(&self) -> &'static str {
        "counter"
    }

    fn statistics(&self) -> StatisticsList {
        let load = |c: &AtomicU64| c.load(Ordering::SeqCst);

        statistics_list!(
            syscall_entries = load(&self.entries),
            syscall_exits = load(&self.exits),
            syscalls_resumed = load(&self.resumed),
            std = load(&self.std),
            fake = load(&self.fake),
            call_on_exit = load(&self.call_on_exit),
            modified_args = load(&self.modified_args),
            suspended = load(&self.suspended),
            path_errors = load(&self.path_errors),
            served = load(&self.served),
            processes_added = load(&self.processes_added),
            processes_removed = load(&self.processes_removed)
        )
    }
}

impl SyscallEventHook for CounterCollector {
    fn handle_syscall_entry(&self, decision: &SyscallDecision) -> Result<()> {
        self.entries.fetch_add(1, Ordering::SeqCst);

        let counter = match decision.behavior {
            Behavior::Std => &self.std,
            Behavior::Fake => &self.fake,
            Behavior::CallOnExit => &self.call_on_exit,
            Behavior::ModifiedArgs => &self.modified_args,
            Behavior::Suspended(_) => &self.suspended,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        if decision.path_error.is_some() {
            self.path_errors.fetch_add(1, Ordering::SeqCst);
        }
        if decision.service.is_some() {
            self.served.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    fn handle_syscall_exit(&self, _id: PcbId, _sysno: usize, _ret: i64) -> Result<()> {
        self.exits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handle_syscall_resumed(&self, _id: PcbId, _sysno: usize) -> Result<()> {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ProcessLifetimeHook for CounterCollector {
    fn handle_process_added(&self, _process: &ProcessInfo) -> Result<()> {
        self.processes_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handle_process_removed(
        &self,
        _process: &ProcessInfo,
        _exit: Option<&ExitReason>,
    ) -> Result<()> {
        self.processes_removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Module for CounterCollector {
    fn subscribe_all<'s, 'd>(&'s self, subs: &mut Subscribers<'d>)
    where
        's: 'd,
    {
        subs.install_syscall_event_hook(self);
        subs.install_process_lifetime_hook(self);
        subs.install_stats_providers(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{statistics::as_text, types::service_code::ServiceCode};

    #[test]
    fn test_counts_outcomes() {
        let counter = CounterCollector::new();
        let mut decision = SyscallDecision {
            id: PcbId::new(0, 0),
            sysno: 2,
            class: None,
            service: Some(ServiceCode(1)),
            behavior: Behavior::Fake,
            path_error: None,
        };

        counter.handle_syscall_entry(&decision).unwrap();
        decision.service = None;
        decision.behavior = Behavior::Std;
        counter.handle_syscall_entry(&decision).unwrap();

        assert_eq!(counter.entries(), 2);
        assert_eq!(counter.served(), 1);

        let text = as_text(counter.statistics());
        assert!(text.contains("fake=1"));
        assert!(text.contains("std=1"));
        assert!(text.contains("suspended=0"));
    }
}
