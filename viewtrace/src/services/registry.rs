use std::{collections::HashMap, sync::Arc};

use itertools::Itertools;
use log::{debug, info, warn};
use nix::errno::Errno;
use strum::EnumCount;
use syscalls::Sysno;

use crate::{
    epoch::{Epoch, EpochTracker, Timestamp},
    error::{Error, Result},
    types::service_code::ServiceCode,
};

use super::{
    ChoiceContext, ChoiceFn, ChoiceQuery, Claim, CtlClasses, CtlEvent, CtlFn, EventSource,
    IoctlShape, IoctlShapeFn, ServiceDescriptor, SocketCall, SysHandler,
};

/// Size of the per-service virtual call table.
pub const NR_VIRTUAL_CALLS: usize = 64;

/// Maps the canonical handler syscalls of the dispatch table onto dense
/// handler-table indices.
#[derive(Debug, Clone, Default)]
pub struct HandlerIndex {
    by_sysno: HashMap<Sysno, usize>,
}

impl HandlerIndex {
    pub fn new(handlers: impl IntoIterator<Item = Sysno>) -> Self {
        let mut by_sysno = HashMap::new();

        for sysno in handlers {
            let next = by_sysno.len();
            by_sysno.entry(sysno).or_insert(next);
        }

        Self { by_sysno }
    }

    pub fn get(&self, sysno: Sysno) -> Option<usize> {
        self.by_sysno.get(&sysno).copied()
    }

    pub fn len(&self) -> usize {
        self.by_sysno.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sysno.is_empty()
    }
}

/// Result of a service selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    None,
    Service { code: ServiceCode, epoch: Epoch },

    /// Cross-layer misuse, reported as `EBADF`.
    Reserved,
}

impl Choice {
    pub fn service(&self) -> Option<ServiceCode> {
        match self {
            Choice::Service { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub fn not_implemented() -> SysHandler {
    Arc::new(|_| Err(Errno::ENOSYS))
}

pub struct RegisteredService {
    pub code: ServiceCode,
    pub name: String,
    pub stamp: Timestamp,
    syscalls: Box<[SysHandler]>,
    socketcalls: Box<[SysHandler]>,
    virtual_calls: Box<[SysHandler]>,
    choice: ChoiceFn,
    event_source: Option<Arc<dyn EventSource>>,
    ctl_classes: CtlClasses,
    ctl: Option<CtlFn>,
    ioctl_shape: Option<IoctlShapeFn>,
}

impl RegisteredService {
    fn notify(&self, event: &CtlEvent) {
        if let Some(ctl) = &self.ctl {
            if self.ctl_classes.intersects(event.class()) {
                ctl(event);
            }
        }
    }
}

impl std::fmt::Debug for RegisteredService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredService")
            .field("code", &self.code)
            .field("name", &self.name)
            .field("stamp", &self.stamp)
            .finish()
    }
}

fn densify<K: std::hash::Hash + Eq>(
    sparse: HashMap<K, SysHandler>,
    len: usize,
    index: impl Fn(&K) -> Option<usize>,
    fallback: &SysHandler,
    name: &str,
) -> Box<[SysHandler]> {
    let mut table = vec![fallback.clone(); len];

    for (key, handler) in sparse {
        match index(&key).filter(|i| *i < len) {
            Some(i) => table[i] = handler,
            None => warn!("Service {name} provides a handler the dispatch table has no slot for"),
        }
    }

    table.into_boxed_slice()
}

/// Registered services in priority order.
pub struct ServiceRegistry {
    services: Vec<RegisteredService>,
    handler_index: HandlerIndex,
    not_implemented: SysHandler,
    locked: bool,
}

impl ServiceRegistry {
    pub fn new(handler_index: HandlerIndex) -> Self {
        Self {
            services: Vec::new(),
            handler_index,
            not_implemented: not_implemented(),
            locked: false,
        }
    }

    pub fn handler_index(&self) -> &HandlerIndex {
        &self.handler_index
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Refuses further add/remove/move operations.
    pub fn lock(&mut self) {
        info!("Service table locked");
        self.locked = true;
    }

    fn position_of(&self, code: ServiceCode) -> Option<usize> {
        self.services.iter().position(|s| s.code == code)
    }

    fn get(&self, code: ServiceCode) -> Option<&RegisteredService> {
        self.services.iter().find(|s| s.code == code)
    }

    pub fn contains(&self, code: ServiceCode) -> bool {
        self.get(code).is_some()
    }

    fn free_code(&self) -> Result<ServiceCode> {
        (ServiceCode::MIN.0..=ServiceCode::MAX.0)
            .map(ServiceCode)
            .find(|c| !self.contains(*c))
            .ok_or(Error::ServiceCodesExhausted)
    }

    /// Adds a service at `position` (appended if `None` or past the end),
    /// visible from `stamp` on. Services subscribed to module events are told
    /// about it; telling it about live processes is up to the caller.
    pub fn register(
        &mut self,
        desc: ServiceDescriptor,
        position: Option<usize>,
        stamp: Timestamp,
    ) -> Result<ServiceCode> {
        if self.locked {
            return Err(Error::ServicesLocked);
        }

        let code = match desc.code {
            Some(code) if !code.is_assignable() => {
                return Err(Error::NotSupported(format!("service code {code}")))
            }
            Some(code) if self.contains(code) => return Err(Error::ServiceCodeInUse(code)),
            Some(code) => code,
            None => self.free_code()?,
        };

        let index = &self.handler_index;
        let syscalls = densify(
            desc.syscalls,
            index.len(),
            |s| index.get(*s),
            &self.not_implemented,
            &desc.name,
        );
        let socketcalls = densify(
            desc.socketcalls,
            SocketCall::COUNT,
            |c| Some(c.index()),
            &self.not_implemented,
            &desc.name,
        );
        let virtual_calls = densify(
            desc.virtual_calls,
            NR_VIRTUAL_CALLS,
            |n| Some(*n),
            &self.not_implemented,
            &desc.name,
        );

        let service = RegisteredService {
            code,
            name: desc.name,
            stamp,
            syscalls,
            socketcalls,
            virtual_calls,
            choice: desc.choice,
            event_source: desc.event_source,
            ctl_classes: desc.ctl_classes,
            ctl: desc.ctl,
            ioctl_shape: desc.ioctl_shape,
        };

        let position = position
            .unwrap_or(self.services.len())
            .min(self.services.len());

        info!("Service {} registered as {code} at {stamp}", service.name);

        self.services.insert(position, service);
        self.broadcast(&CtlEvent::ModuleAdded(code), Some(code));

        Ok(code)
    }

    /// Removes a service after telling subscribers.
    pub fn deregister(&mut self, code: ServiceCode) -> Result<RegisteredService> {
        if self.locked {
            return Err(Error::ServicesLocked);
        }

        let pos = self.position_of(code).ok_or(Error::NoSuchService)?;

        self.broadcast(&CtlEvent::ModuleRemoved(code), Some(code));
        let service = self.services.remove(pos);

        info!("Service {} ({code}) deregistered", service.name);

        Ok(service)
    }

    /// Changes the priority position of a service.
    pub fn move_to(&mut self, code: ServiceCode, position: usize) -> Result<()> {
        if self.locked {
            return Err(Error::ServicesLocked);
        }

        let pos = self.position_of(code).ok_or(Error::NoSuchService)?;
        let service = self.services.remove(pos);
        let position = position.min(self.services.len());
        self.services.insert(position, service);

        debug!("Service {code} moved to position {position}");

        Ok(())
    }

    /// Codes in priority order.
    pub fn list(&self) -> Vec<ServiceCode> {
        self.services.iter().map(|s| s.code).collect()
    }

    pub fn name(&self, code: ServiceCode) -> Option<&str> {
        self.get(code).map(|s| s.name.as_str())
    }

    pub fn stamp(&self, code: ServiceCode) -> Option<Timestamp> {
        self.get(code).map(|s| s.stamp)
    }

    pub fn describe(&self) -> String {
        self.services
            .iter()
            .map(|s| format!("{}:{}", s.code, s.name))
            .join(", ")
    }

    /// Asks services in priority order to claim `query` as of `at`. The first
    /// claim wins. Services registered after `at`, or in a branch `at` cannot
    /// see, are skipped.
    pub fn select(&self, query: &ChoiceQuery, at: Timestamp, epochs: &EpochTracker) -> Choice {
        for service in &self.services {
            if epochs.matching_epoch(service.stamp, at).is_none() {
                continue;
            }

            let ctx = ChoiceContext::new(epochs, at, service.stamp);

            match (service.choice)(query, &ctx) {
                Claim::Decline => (),
                Claim::Own(epoch) if epoch.is_none() => (),
                Claim::Own(epoch) => {
                    return Choice::Service {
                        code: service.code,
                        epoch,
                    }
                }
                Claim::Foreign => return Choice::Reserved,
            }
        }

        Choice::None
    }

    /// Handler of the canonical syscall `sysno`. Never missing for a
    /// registered service: unset entries hold the `ENOSYS` stub.
    pub fn syscall_handler(&self, code: ServiceCode, sysno: Sysno) -> Option<SysHandler> {
        let service = self.get(code)?;
        let handler = self
            .handler_index
            .get(sysno)
            .and_then(|i| service.syscalls.get(i))
            .unwrap_or(&self.not_implemented);

        Some(handler.clone())
    }

    pub fn socket_handler(&self, code: ServiceCode, call: SocketCall) -> Option<SysHandler> {
        self.get(code)
            .and_then(|s| s.socketcalls.get(call.index()))
            .cloned()
    }

    pub fn virtual_handler(&self, code: ServiceCode, nr: usize) -> Option<SysHandler> {
        let service = self.get(code)?;
        Some(
            service
                .virtual_calls
                .get(nr)
                .unwrap_or(&self.not_implemented)
                .clone(),
        )
    }

    pub fn event_source(&self, code: ServiceCode) -> Option<Arc<dyn EventSource>> {
        self.get(code).and_then(|s| s.event_source.clone())
    }

    pub fn ioctl_shape(&self, code: ServiceCode, request: u64) -> Option<IoctlShape> {
        self.get(code)
            .and_then(|s| s.ioctl_shape.as_ref())
            .and_then(|f| f(request))
    }

    /// Delivers `event` to one service if it subscribed to its class.
    pub fn notify(&self, code: ServiceCode, event: &CtlEvent) {
        if let Some(service) = self.get(code) {
            service.notify(event);
        }
    }

    /// Delivers `event` to every subscribed service but `except`.
    pub fn broadcast(&self, event: &CtlEvent, except: Option<ServiceCode>) {
        self.services
            .iter()
            .filter(|s| Some(s.code) != except)
            .for_each(|s| s.notify(event));
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use parking_lot::Mutex;

    use super::*;
    use crate::services::ServiceDescriptorBuilder;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(HandlerIndex::new([Sysno::open, Sysno::lstat, Sysno::close]))
    }

    fn prefix(name: &str, prefix: &'static str) -> ServiceDescriptorBuilder {
        ServiceDescriptor::builder(name).choose(move |q, ctx| match q {
            ChoiceQuery::Path(p) if p.starts_with(prefix) => ctx.own(),
            _ => Claim::Decline,
        })
    }

    #[test]
    fn test_first_registered_wins() {
        let mut epochs = EpochTracker::new();
        let root = epochs.root();
        let mut reg = registry();

        let a = reg
            .register(prefix("a", "/data").build().unwrap(), None, epochs.stamp(root))
            .unwrap();
        let b = reg
            .register(prefix("b", "/").build().unwrap(), None, epochs.stamp(root))
            .unwrap();

        let at = epochs.now_at(root);
        let q = ChoiceQuery::Path(Path::new("/data/f.txt"));
        assert_eq!(reg.select(&q, at, &epochs).service(), Some(a));

        let q = ChoiceQuery::Path(Path::new("/etc/hosts"));
        assert_eq!(reg.select(&q, at, &epochs).service(), Some(b));

        // an explicit move changes the priority
        reg.move_to(b, 0).unwrap();
        let q = ChoiceQuery::Path(Path::new("/data/f.txt"));
        assert_eq!(reg.select(&q, at, &epochs).service(), Some(b));
        assert_eq!(reg.list(), vec![b, a]);
    }

    #[test]
    fn test_no_match_is_none() {
        let mut epochs = EpochTracker::new();
        let root = epochs.root();
        let mut reg = registry();

        reg.register(prefix("a", "/data").build().unwrap(), None, epochs.stamp(root))
            .unwrap();

        let q = ChoiceQuery::Path(Path::new("/etc/hosts"));
        assert_eq!(reg.select(&q, epochs.now_at(root), &epochs), Choice::None);
    }

    #[test]
    fn test_selection_respects_epoch() {
        let mut epochs = EpochTracker::new();
        let root = epochs.root();
        let mut reg = registry();

        let before = epochs.now_at(root);
        reg.register(prefix("a", "/").build().unwrap(), None, epochs.stamp(root))
            .unwrap();

        let q = ChoiceQuery::Path(Path::new("/x"));
        assert_eq!(reg.select(&q, before, &epochs), Choice::None);
        assert!(reg.select(&q, epochs.now_at(root), &epochs).service().is_some());
    }

    #[test]
    fn test_nested_registration_is_invisible_outside() {
        let mut epochs = EpochTracker::new();
        let root = epochs.root();
        let mut reg = registry();

        let outer = reg
            .register(prefix("outer", "/o").build().unwrap(), None, epochs.stamp(root))
            .unwrap();

        let nested = epochs.new_fork(Some(root));
        epochs.new_proc(nested);
        let inner = reg
            .register(prefix("inner", "/i").build().unwrap(), None, epochs.stamp(nested))
            .unwrap();

        let q_inner = ChoiceQuery::Path(Path::new("/i/f"));
        let q_outer = ChoiceQuery::Path(Path::new("/o/f"));

        let outside = epochs.now_at(root);
        let inside = epochs.now_at(nested);

        assert_eq!(reg.select(&q_inner, outside, &epochs), Choice::None);
        assert_eq!(reg.select(&q_inner, inside, &epochs).service(), Some(inner));
        assert_eq!(reg.select(&q_outer, inside, &epochs).service(), Some(outer));
    }

    #[test]
    fn test_foreign_claim_is_reserved() {
        let mut epochs = EpochTracker::new();
        let root = epochs.root();
        let mut reg = registry();

        let desc = ServiceDescriptor::builder("layer")
            .choose(|_, _| Claim::Foreign)
            .build()
            .unwrap();
        reg.register(desc, None, epochs.stamp(root)).unwrap();

        let q = ChoiceQuery::Path(Path::new("/x"));
        assert_eq!(reg.select(&q, epochs.now_at(root), &epochs), Choice::Reserved);
    }

    #[test]
    fn test_tables_are_filled() {
        let mut epochs = EpochTracker::new();
        let root = epochs.root();
        let mut reg = registry();

        let desc = ServiceDescriptor::builder("partial")
            .syscall(Sysno::open, |_| Ok(42))
            .build()
            .unwrap();
        let code = reg.register(desc, None, epochs.stamp(root)).unwrap();

        let mut memory = crate::tracer::memory::tests::FlatMemory {
            base: 0,
            data: Vec::new(),
        };
        let mut call = crate::services::ServiceCall::for_test(&mut memory, &mut epochs);

        let open = reg.syscall_handler(code, Sysno::open).unwrap();
        assert_eq!(open(&mut call), Ok(42));

        let close = reg.syscall_handler(code, Sysno::close).unwrap();
        assert_eq!(close(&mut call), Err(Errno::ENOSYS));

        let unknown = reg.syscall_handler(code, Sysno::mkdir).unwrap();
        assert_eq!(unknown(&mut call), Err(Errno::ENOSYS));

        let sock = reg.socket_handler(code, SocketCall::Connect).unwrap();
        assert_eq!(sock(&mut call), Err(Errno::ENOSYS));

        let virt = reg.virtual_handler(code, NR_VIRTUAL_CALLS + 5).unwrap();
        assert_eq!(virt(&mut call), Err(Errno::ENOSYS));

        assert!(reg.syscall_handler(ServiceCode(0x99), Sysno::open).is_none());
    }

    #[test]
    fn test_codes_and_lock() {
        let mut epochs = EpochTracker::new();
        let root = epochs.root();
        let mut reg = registry();

        let a = reg
            .register(prefix("a", "/a").build().unwrap(), None, epochs.stamp(root))
            .unwrap();
        assert_eq!(a, ServiceCode::MIN);

        let err = reg
            .register(
                prefix("dup", "/b").code(a).build().unwrap(),
                None,
                epochs.stamp(root),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ServiceCodeInUse(c) if c == a));

        let b = reg
            .register(
                prefix("b", "/b").code(ServiceCode(0x40)).build().unwrap(),
                Some(0),
                epochs.stamp(root),
            )
            .unwrap();
        assert_eq!(reg.list(), vec![b, a]);
        assert_eq!(reg.name(b), Some("b"));

        reg.lock();
        assert!(matches!(reg.deregister(a), Err(Error::ServicesLocked)));
        assert!(matches!(reg.move_to(a, 0), Err(Error::ServicesLocked)));
    }

    #[test]
    fn test_module_events_are_broadcast() {
        let mut epochs = EpochTracker::new();
        let root = epochs.root();
        let mut reg = registry();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let watcher = ServiceDescriptor::builder("watcher")
            .on_ctl(CtlClasses::MODULE, move |e| s.lock().push(e.clone()))
            .build()
            .unwrap();
        reg.register(watcher, None, epochs.stamp(root)).unwrap();

        let other = reg
            .register(prefix("other", "/").build().unwrap(), None, epochs.stamp(root))
            .unwrap();
        reg.deregister(other).unwrap();

        assert_eq!(
            seen.lock().as_slice(),
            &[CtlEvent::ModuleAdded(other), CtlEvent::ModuleRemoved(other)]
        );

        // process events are filtered out by class
        reg.broadcast(
            &CtlEvent::ProcessRemoved {
                id: crate::types::pcb_id::PcbId::new(0, 0),
                pid: nix::unistd::Pid::from_raw(1),
            },
            None,
        );
        assert_eq!(seen.lock().len(), 2);
    }
}
