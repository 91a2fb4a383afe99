use parking_lot::RwLock;
use typed_arena::Arena;

use crate::{
    error::Result,
    events::{
        process_lifetime::{ProcessInfo, ProcessLifetimeHook},
        syscall::{SyscallDecision, SyscallEventHook},
    },
    statistics::{StatisticsList, StatisticsProvider},
    types::{exit_reason::ExitReason, pcb_id::PcbId},
};

pub struct Subscribers<'a> {
    process_lifetime_hooks: Vec<&'a dyn ProcessLifetimeHook>,
    syscall_event_hooks: Vec<&'a dyn SyscallEventHook>,
    stats_providers: Vec<&'a dyn StatisticsProvider>,
}

impl<'a> Default for Subscribers<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Subscribers<'a> {
    pub fn new() -> Self {
        Self {
            process_lifetime_hooks: Vec::new(),
            syscall_event_hooks: Vec::new(),
            stats_providers: Vec::new(),
        }
    }

    pub fn install_process_lifetime_hook(&mut self, hook: &'a dyn ProcessLifetimeHook) {
        self.process_lifetime_hooks.push(hook)
    }

    pub fn install_syscall_event_hook(&mut self, hook: &'a dyn SyscallEventHook) {
        self.syscall_event_hooks.push(hook)
    }

    pub fn install_stats_providers(&mut self, provider: &'a dyn StatisticsProvider) {
        self.stats_providers.push(provider)
    }
}

/// Owns the observer modules of a session and fans engine events out to
/// them.
pub struct Dispatcher<'a, 'm> {
    modules: Arena<Box<dyn Module + 'm>>,
    subscribers: RwLock<Subscribers<'a>>,
}

impl<'a, 'm> Default for Dispatcher<'a, 'm> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, 'm> Dispatcher<'a, 'm> {
    pub fn new() -> Self {
        Self {
            modules: Arena::new(),
            subscribers: RwLock::new(Subscribers::new()),
        }
    }

    pub fn register_module<'s, T>(&'s self, module: T) -> &'s T
    where
        T: Module + 'm,
        's: 'a,
    {
        let m = self.modules.alloc(Box::new(module));
        let mut subscribers = self.subscribers.write();

        m.subscribe_all(&mut subscribers);

        unsafe { &*(m.as_ref() as *const _ as *const T) }
    }

    pub fn register_module_boxed<'s>(&'s self, module: Box<dyn Module + 'm>)
    where
        's: 'a,
    {
        let mut subscribers = self.subscribers.write();
        let m = self.modules.alloc(module);

        m.subscribe_all(&mut subscribers);
    }
}

impl ProcessLifetimeHook for Dispatcher<'_, '_> {
    fn handle_process_added(&self, process: &ProcessInfo) -> Result<()> {
        self.subscribers
            .read()
            .process_lifetime_hooks
            .iter()
            .try_for_each(|h| h.handle_process_added(process))
    }

    fn handle_process_removed(
        &self,
        process: &ProcessInfo,
        exit: Option<&ExitReason>,
    ) -> Result<()> {
        self.subscribers
            .read()
            .process_lifetime_hooks
            .iter()
            .try_for_each(|h| h.handle_process_removed(process, exit))
    }

    fn handle_all_fini(&self) -> Result<()> {
        self.subscribers
            .read()
            .process_lifetime_hooks
            .iter()
            .try_for_each(|h| h.handle_all_fini())
    }
}

impl SyscallEventHook for Dispatcher<'_, '_> {
    fn handle_syscall_entry(&self, decision: &SyscallDecision) -> Result<()> {
        self.subscribers
            .read()
            .syscall_event_hooks
            .iter()
            .try_for_each(|h| h.handle_syscall_entry(decision))
    }

    fn handle_syscall_exit(&self, id: PcbId, sysno: usize, ret: i64) -> Result<()> {
        self.subscribers
            .read()
            .syscall_event_hooks
            .iter()
            .try_for_each(|h| h.handle_syscall_exit(id, sysno, ret))
    }

    fn handle_syscall_resumed(&self, id: PcbId, sysno: usize) -> Result<()> {
        self.subscribers
            .read()
            .syscall_event_hooks
            .iter()
            .try_for_each(|h| h.handle_syscall_resumed(id, sysno))
    }
}

impl StatisticsProvider for Dispatcher<'_, '_> {
    fn class_name(&self) -> &'static str {
        "combined"
    }

    fn statistics(&self) -> StatisticsList {
        self.subscribers
            .read()
            .stats_providers
            .iter()
            .flat_map(|ss| {
                ss.statistics()
                    .into_vec()
                    .into_iter()
                    .map(|(stat_name, value)| (format!("{}.{}", ss.class_name(), stat_name), value))
            })
            .collect()
    }
}

pub trait Module: Sync {
    fn subscribe_all<'s, 'd>(&'s self, subs: &mut Subscribers<'d>)
    where
        's: 'd;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nix::unistd::Pid;

    use super::*;
    use crate::epoch::EpochTracker;

    #[derive(Default)]
    struct Counting {
        added: AtomicUsize,
    }

    impl ProcessLifetimeHook for Counting {
        fn handle_process_added(&self, _process: &ProcessInfo) -> Result<()> {
            self.added.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Module for Counting {
        fn subscribe_all<'s, 'd>(&'s self, subs: &mut Subscribers<'d>)
        where
            's: 'd,
        {
            subs.install_process_lifetime_hook(self);
        }
    }

    #[test]
    fn test_events_reach_every_module() {
        let disp = Dispatcher::new();
        let a = disp.register_module(Counting::default());
        let b = disp.register_module(Counting::default());

        let info = ProcessInfo {
            id: PcbId::new(0, 0),
            pid: Pid::from_raw(1),
            parent: None,
            treepoch: EpochTracker::new().root(),
        };
        disp.handle_process_added(&info).unwrap();
        disp.handle_process_added(&info).unwrap();

        assert_eq!(a.added.load(Ordering::SeqCst), 2);
        assert_eq!(b.added.load(Ordering::SeqCst), 2);
    }
}
