//! The syscall dispatch core.
//!
//! [`Engine`] consumes tracer events. At each syscall entry it resolves the
//! arguments the service choice depends on, selects the service as of the
//! syscall's timestamp and runs the wrap-in function of the syscall table
//! entry; at the exit it runs wrap-out if asked to. Calls waiting for a
//! service descriptor to become ready are parked and re-dispatched when the
//! scheduler reports their wakeup.

pub mod choice;
pub mod dispatch;
pub mod sctab;
pub mod virsc;
pub mod wrap;

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use log::{debug, error, info, trace, warn};
use nix::{sched::CloneFlags, unistd::Pid};

use crate::{
    dispatcher::Dispatcher,
    epoch::{EpochTracker, TreepochId},
    error::{Error, Result, SysResultExt},
    events::{
        process_lifetime::{ProcessInfo, ProcessLifetimeHook},
        syscall::{SyscallDecision, SyscallEventHook},
    },
    pcb::{FsState, Pending, PcbStore, SyscallState},
    scheduler::{Scheduler, WakeupId},
    services::{CtlEvent, ServiceDescriptor, ServiceRegistry},
    tracer::{EventPoll, Handle, ResumeAction, TerminationStatus, Tracer, TracerEvent, WaitMode},
    types::{
        behavior::{Behavior, Phase},
        exit_reason::ExitReason,
        pcb_id::PcbId,
        service_code::ServiceCode,
    },
};

use self::{
    sctab::{ScEntry, SyscallTable},
    wrap::{fd::close_service_fd, fd::release_entry, WrapContext},
};

/// Builds the descriptor of a loadable service module.
pub type ModuleFactory = Arc<dyn Fn() -> Result<ServiceDescriptor> + Send + Sync>;

/// Service modules that can be loaded by name at run time.
pub type ModuleCatalog = HashMap<String, ModuleFactory>;

#[derive(Clone)]
pub struct EngineConfig {
    /// Directory for copies of service-owned executables.
    pub tmp_dir: PathBuf,

    /// Longest time the engine blocks on wakeups before polling the tracer
    /// again while processes are parked.
    pub poll_interval: Duration,
    pub catalog: ModuleCatalog,

    /// Reported to processes asking for view information.
    pub server_pid: Pid,
    pub max_processes: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tmp_dir: std::env::temp_dir(),
            poll_interval: Duration::from_millis(100),
            catalog: ModuleCatalog::new(),
            server_pid: nix::unistd::getpid(),
            max_processes: None,
        }
    }
}

pub struct Engine<'d, 'm, T: Tracer> {
    tracer: T,
    pcbs: PcbStore,
    epochs: EpochTracker,
    registry: ServiceRegistry,
    scheduler: Scheduler,
    table: Arc<SyscallTable>,
    config: EngineConfig,
    dispatcher: &'d Dispatcher<'d, 'm>,
    root: Option<Handle>,
    root_exit: Option<ExitReason>,
}

impl<'d, 'm, T: Tracer> Engine<'d, 'm, T> {
    pub fn new(
        tracer: T,
        table: SyscallTable,
        config: EngineConfig,
        dispatcher: &'d Dispatcher<'d, 'm>,
    ) -> Self {
        let registry = ServiceRegistry::new(table.handler_index());

        Self {
            tracer,
            pcbs: PcbStore::new(config.max_processes),
            epochs: EpochTracker::new(),
            registry,
            scheduler: Scheduler::new(),
            table: Arc::new(table),
            config,
            dispatcher,
            root: None,
            root_exit: None,
        }
    }

    pub fn tracer(&mut self) -> &mut T {
        &mut self.tracer
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn epochs(&self) -> &EpochTracker {
        &self.epochs
    }

    pub fn pcbs(&self) -> &PcbStore {
        &self.pcbs
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn set_view_name(&mut self, treepoch: TreepochId, name: impl Into<String>) -> bool {
        self.epochs.set_view_name(treepoch, name)
    }

    /// Forbids further changes of the service table.
    pub fn lock_services(&mut self) {
        self.registry.lock();
    }

    /// Registers a service visible from now on in `treepoch` (the root
    /// treepoch if `None`) and its descendants, and tells it about every
    /// live process.
    pub fn register_service(
        &mut self,
        desc: ServiceDescriptor,
        position: Option<usize>,
        treepoch: Option<TreepochId>,
    ) -> Result<ServiceCode> {
        let treepoch = treepoch.unwrap_or_else(|| self.epochs.root());
        let stamp = self.epochs.stamp(treepoch);
        let code = self.registry.register(desc, position, stamp)?;

        for (id, pcb) in self.pcbs.iter() {
            self.registry.notify(
                code,
                &CtlEvent::ProcessAdded {
                    id,
                    pid: pcb.pid,
                    parent: pcb.parent,
                },
            );
        }

        Ok(code)
    }

    /// Removes a service. Processes parked on one of its descriptors are
    /// re-dispatched and see their descriptor as gone.
    pub fn deregister_service(&mut self, code: ServiceCode) -> Result<()> {
        let source = self.registry.event_source(code);
        self.registry.deregister(code)?;

        let parked: Vec<(PcbId, WakeupId, Phase)> = self
            .pcbs
            .iter()
            .filter_map(|(id, p)| {
                p.parked
                    .filter(|parked| parked.service == code)
                    .map(|parked| (id, parked.wakeup, parked.phase))
            })
            .collect();

        for (id, wakeup, phase) in parked {
            self.scheduler.revoke(wakeup, source.as_deref());
            if let Some(pcb) = self.pcbs.get_mut(id) {
                pcb.parked = None;
            }
            self.redispatch(id, phase)?;
        }

        Ok(())
    }

    fn context(&mut self, id: PcbId, entry: ScEntry) -> Result<WrapContext<'_>> {
        let pcb = self.pcbs.get_mut(id).ok_or(Error::InvalidState)?;

        Ok(WrapContext {
            id,
            pcb,
            entry,
            tracer: &mut self.tracer,
            epochs: &mut self.epochs,
            registry: &self.registry,
            scheduler: &mut self.scheduler,
            config: &self.config,
        })
    }

    fn process_info(&self, id: PcbId) -> Option<ProcessInfo> {
        self.pcbs.get(id).map(|pcb| ProcessInfo {
            id,
            pid: pcb.pid,
            parent: pcb.parent,
            treepoch: pcb.treepoch(),
        })
    }

    fn pcb_of(&self, handle: Handle) -> Result<PcbId> {
        self.pcbs.find_by_handle(handle).ok_or(Error::UnknownHandle)
    }

    fn handle_new_process(
        &mut self,
        handle: Handle,
        pid: Pid,
        parent: Option<Handle>,
        clone_flags: CloneFlags,
    ) -> Result<()> {
        let creator = parent.and_then(|h| self.pcbs.find_by_handle(h));
        let id = self.pcbs.allocate(
            handle,
            pid,
            creator,
            clone_flags,
            || FsState::of_process_or_current(pid),
            &mut self.epochs,
        )?;

        if parent.is_none() && self.root.is_none() {
            info!("Session root is {pid}");
            self.root = Some(handle);
        }

        let info = self.process_info(id).ok_or(Error::InvalidState)?;
        self.registry.broadcast(
            &CtlEvent::ProcessAdded {
                id,
                pid,
                parent: info.parent,
            },
            None,
        );
        self.dispatcher.handle_process_added(&info)?;

        self.tracer.resume(handle, ResumeAction::Continue)
    }

    /// Drops the control block of a process that is gone.
    fn release_process(&mut self, id: PcbId, exit: Option<&ExitReason>) -> Result<()> {
        if let Some(info) = self.process_info(id) {
            self.dispatcher.handle_process_removed(&info, exit)?;
        }

        let Some(mut pcb) = self.pcbs.release(id) else {
            return Ok(());
        };

        if let Some(parked) = pcb.parked.take() {
            let source = self.registry.event_source(parked.service);
            self.scheduler.revoke(parked.wakeup, source.as_deref());
        }

        self.registry.broadcast(
            &CtlEvent::ProcessRemoved { id, pid: pcb.pid },
            None,
        );

        if let Some(tmp) = pcb.tmpfile_to_unlink.take() {
            if let Err(e) = std::fs::remove_file(&tmp) {
                warn!("{pcb} cannot remove {tmp:?}: {e}");
            }
        }

        let at = pcb.lookup_timestamp();

        // a service descriptor whose placeholder was never recorded
        if let Pending::Open {
            service,
            sfd,
            path,
            ..
        } = std::mem::take(&mut pcb.syscall.pending)
        {
            let file = crate::pcb::fd_table::VirtualFile { service, sfd, path };
            close_service_fd(&self.registry, &mut self.epochs, at, id, pcb.pid, &file);
        }

        if Arc::strong_count(&pcb.fds) == 1 {
            let entries = pcb.fds.write().take_all();
            for entry in entries {
                release_entry(&self.registry, &mut self.epochs, at, id, pcb.pid, entry);
            }
        }

        self.epochs.del_proc(pcb.treepoch());

        Ok(())
    }

    fn handle_terminated(&mut self, handle: Handle, status: TerminationStatus) -> Result<()> {
        let reason = ExitReason::from(status);

        if let Some(id) = self.pcbs.find_by_handle(handle) {
            debug!("{id} terminated: {reason:?}");
            self.release_process(id, Some(&reason))?;
        }

        if self.root == Some(handle) {
            self.root_exit = Some(reason);
        }

        Ok(())
    }

    fn handle_syscall_entry(&mut self, handle: Handle, sysno: usize) -> Result<()> {
        let id = self.pcb_of(handle)?;
        let regs = self.tracer.read_registers(handle)?;
        let now = self.epochs.now();

        let pcb = self.pcbs.get_mut(id).ok_or(Error::InvalidState)?;

        if let Some(tmp) = pcb.tmpfile_to_unlink.take() {
            debug!("{pcb} removing exec copy {tmp:?}");
            if let Err(e) = std::fs::remove_file(&tmp) {
                warn!("{pcb} cannot remove {tmp:?}: {e}");
            }
        }

        pcb.in_syscall = Some(Phase::Entry);
        pcb.timestamp.epoch = now;
        pcb.nest_epoch = now;
        pcb.syscall = SyscallState {
            sysno,
            args: regs.args,
            ..Default::default()
        };

        trace!("{pcb} entry {sysno} {:?}", regs.args);

        if virsc::is_virtual(sysno) {
            let result = self.virtual_call(id, sysno)?;
            let pcb = self.pcbs.get_mut(id).ok_or(Error::InvalidState)?;
            pcb.syscall.behavior = Behavior::Fake;
            pcb.syscall.result = result;

            self.dispatcher.handle_syscall_entry(&SyscallDecision {
                id,
                sysno,
                class: None,
                service: None,
                behavior: Behavior::Fake,
                path_error: None,
            })?;

            return self.tracer.resume(handle, ResumeAction::SkipSyscall);
        }

        let Some(entry) = self.table.get(sysno).copied() else {
            return self.tracer.resume(handle, ResumeAction::Continue);
        };

        let mut ctx = self.context(id, entry)?;
        ctx.resolve_arguments()?;
        let action = ctx.enter()?;

        let syscall = &ctx.pcb.syscall;
        let decision = SyscallDecision {
            id,
            sysno,
            class: Some(entry.class),
            service: syscall.service,
            behavior: syscall.behavior,
            path_error: syscall.path.error(),
        };

        self.dispatcher.handle_syscall_entry(&decision)?;

        match action {
            Some(action) => self.tracer.resume(handle, action),
            None => {
                debug!("{id} parked at entry of {}", entry.sysno);
                Ok(())
            }
        }
    }

    fn handle_syscall_exit(&mut self, handle: Handle) -> Result<()> {
        let id = self.pcb_of(handle)?;
        let regs = self.tracer.read_registers(handle)?;

        let pcb = self.pcbs.get_mut(id).ok_or(Error::InvalidState)?;
        pcb.in_syscall = Some(Phase::Exit);
        let sysno = pcb.syscall.sysno;

        let action = match self.table.get(sysno).copied() {
            Some(entry) => self.context(id, entry)?.exit(Some(regs.ret))?,
            None => match pcb.syscall.behavior {
                Behavior::Fake => Some(ResumeAction::SetReturn(pcb.syscall.result.into_raw())),
                _ => Some(ResumeAction::Continue),
            },
        };

        self.finish_exit(id, handle, sysno, action, regs.ret)
    }

    fn finish_exit(
        &mut self,
        id: PcbId,
        handle: Handle,
        sysno: usize,
        action: Option<ResumeAction>,
        kernel_ret: i64,
    ) -> Result<()> {
        let Some(action) = action else {
            debug!("{id} parked at exit of {sysno}");
            return Ok(());
        };

        if let Some(pcb) = self.pcbs.get_mut(id) {
            pcb.in_syscall = None;
        }

        let ret = match action {
            ResumeAction::SetReturn(ret) => ret,
            _ => kernel_ret,
        };
        trace!("{id} exit {sysno} = {ret}");

        self.dispatcher.handle_syscall_exit(id, sysno, ret)?;
        self.tracer.resume(handle, action)
    }

    /// Runs the phase a process was parked in again.
    fn redispatch(&mut self, id: PcbId, phase: Phase) -> Result<()> {
        let pcb = self.pcbs.get(id).ok_or(Error::InvalidState)?;
        let (handle, sysno) = (pcb.handle, pcb.syscall.sysno);
        let entry = self.table.get(sysno).copied().ok_or(Error::InvalidState)?;

        self.dispatcher.handle_syscall_resumed(id, sysno)?;

        match phase {
            Phase::Entry => {
                let action = self.context(id, entry)?.enter()?;
                match action {
                    Some(action) => self.tracer.resume(handle, action),
                    None => Ok(()),
                }
            }
            Phase::Exit => {
                let kernel_ret = self.pcbs.get(id).map_or(0, |p| p.syscall.kernel_ret);
                let action = self.context(id, entry)?.exit(None)?;
                self.finish_exit(id, handle, sysno, action, kernel_ret)
            }
        }
    }

    /// Re-dispatches the processes whose wakeup fired.
    fn resume_ready(&mut self) -> Result<()> {
        for (wakeup, id) in self.scheduler.take_ready() {
            let Some(pcb) = self.pcbs.get_mut(id) else {
                continue;
            };

            let phase = match pcb.parked {
                Some(parked) if parked.wakeup == wakeup => parked.phase,
                _ => {
                    debug!("{id} stale wakeup {wakeup}");
                    continue;
                }
            };
            pcb.parked = None;

            debug!("{id} woken up by {wakeup}");
            self.redispatch(id, phase)?;
        }

        Ok(())
    }

    fn handle_event(&mut self, event: TracerEvent) -> Result<()> {
        match event {
            TracerEvent::NewProcess {
                handle,
                pid,
                parent,
                clone_flags,
            } => self.handle_new_process(handle, pid, parent, clone_flags),
            TracerEvent::Terminated { handle, status } => self.handle_terminated(handle, status),
            TracerEvent::SyscallEntry { handle, sysno } => self.handle_syscall_entry(handle, sysno),
            TracerEvent::SyscallExit { handle } => self.handle_syscall_exit(handle),
        }
    }

    /// Drives the session until no traced process is left. Returns how the
    /// root process ended.
    pub fn run(&mut self) -> Result<ExitReason> {
        loop {
            self.resume_ready()?;

            let mode = if self.scheduler.nr_pending() > 0 {
                WaitMode::Poll
            } else {
                WaitMode::Block
            };

            match self.tracer.next_event(mode)? {
                EventPoll::Event(event) => {
                    let handle = event.handle();

                    if let Err(e) = self.handle_event(event) {
                        if e.is_fatal() {
                            error!("Fatal error on {handle}: {e}");
                            return Err(e);
                        }

                        warn!("Error on {handle}: {e}, letting it go");
                        let parked = self
                            .pcbs
                            .find_by_handle(handle)
                            .and_then(|id| self.pcbs.get(id))
                            .is_some_and(|p| p.is_parked());
                        if !parked {
                            let _ = self.tracer.resume(handle, ResumeAction::Continue);
                        }
                    }
                }
                EventPoll::Idle => {
                    self.scheduler.wait(self.config.poll_interval);
                }
                EventPoll::Exhausted => break,
            }
        }

        for id in self.pcbs.ids() {
            self.release_process(id, None)?;
        }
        self.dispatcher.handle_all_fini()?;

        Ok(self.root_exit.take().unwrap_or(ExitReason::UnexpectedlyDies))
    }
}
