//! Suspension of would-be-blocking calls on virtual descriptors.
//!
//! Before a blocking-capable call reaches its service, the owning service is
//! asked whether the descriptor is ready. If it is not, a one-shot wakeup is
//! registered and the process stays stopped at its syscall stop. Services
//! fire wakeups from any thread; the engine drains them between tracer
//! events and re-enters dispatch for the parked process, so all mutation
//! stays on the dispatch thread.

use std::{
    collections::VecDeque,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bitflags::bitflags;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::{
    services::EventSource,
    types::{pcb_id::PcbId, service_code::ServiceCode},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXCEPT = 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakeupId {
    slot: u32,
    generation: u32,
}

impl Display for WakeupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}.{}", self.slot, self.generation)
    }
}

#[derive(Default)]
struct WakeQueue {
    ready: Mutex<VecDeque<WakeupId>>,
    cond: Condvar,
}

/// One-shot handle a service keeps to signal readiness. Firing a waker whose
/// registration was revoked does nothing.
#[derive(Clone)]
pub struct Waker {
    id: WakeupId,
    queue: Arc<WakeQueue>,
    revoked: Arc<AtomicBool>,
}

impl Waker {
    pub fn id(&self) -> WakeupId {
        self.id
    }

    pub fn wake(&self) {
        if self.revoked.load(Ordering::SeqCst) {
            trace!("Dropping wakeup {} of a revoked registration", self.id);
            return;
        }

        self.queue.ready.lock().push_back(self.id);
        self.queue.cond.notify_all();
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Waker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waker")
            .field("id", &self.id)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

struct Registration {
    pcb: PcbId,
    service: ServiceCode,
    sfd: i64,
    revoked: Arc<AtomicBool>,
}

#[derive(Default)]
struct WakeupSlot {
    generation: u32,
    registration: Option<Registration>,
}

/// Outcome of a readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Parked(WakeupId),
}

#[derive(Default)]
pub struct Scheduler {
    queue: Arc<WakeQueue>,
    slots: Vec<WakeupSlot>,
    free: Vec<u32>,
    nr_pending: usize,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registrations still waiting for their wakeup.
    pub fn nr_pending(&self) -> usize {
        self.nr_pending
    }

    fn register(&mut self, pcb: PcbId, service: ServiceCode, sfd: i64) -> Waker {
        let revoked = Arc::new(AtomicBool::new(false));
        let registration = Registration {
            pcb,
            service,
            sfd,
            revoked: revoked.clone(),
        };

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(WakeupSlot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let entry = &mut self.slots[slot as usize];
        entry.registration = Some(registration);
        self.nr_pending += 1;

        Waker {
            id: WakeupId {
                slot,
                generation: entry.generation,
            },
            queue: self.queue.clone(),
            revoked,
        }
    }

    fn unregister(&mut self, id: WakeupId) -> Option<Registration> {
        let entry = self
            .slots
            .get_mut(id.slot as usize)
            .filter(|e| e.generation == id.generation)?;

        let registration = entry.registration.take()?;
        registration.revoked.store(true, Ordering::SeqCst);
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.slot);
        self.nr_pending -= 1;

        Some(registration)
    }

    /// Checks readiness of `sfd` for `interest`. When not ready, subscribes a
    /// one-shot wakeup with the service and returns its id.
    pub fn check_suspend_on(
        &mut self,
        pcb: PcbId,
        service: ServiceCode,
        source: &dyn EventSource,
        sfd: i64,
        interest: Interest,
    ) -> Readiness {
        if source.poll(sfd, interest).intersects(interest) {
            return Readiness::Ready;
        }

        let waker = self.register(pcb, service, sfd);
        let id = waker.id();
        source.subscribe(sfd, interest, waker);

        // Readiness may have changed between the check and the subscription.
        if source.poll(sfd, interest).intersects(interest) {
            self.revoke(id, Some(source));
            return Readiness::Ready;
        }

        debug!("{pcb} parked on service {service} sfd {sfd} ({interest:?}) as {id}");

        Readiness::Parked(id)
    }

    /// Invalidates a registration. Its waker becomes a no-op and the service
    /// is told to drop the subscription.
    pub fn revoke(&mut self, id: WakeupId, source: Option<&dyn EventSource>) -> bool {
        match self.unregister(id) {
            Some(registration) => {
                if let Some(source) = source {
                    source.unsubscribe(registration.sfd, id);
                }
                debug!(
                    "Wakeup {id} of {} on service {} revoked",
                    registration.pcb, registration.service
                );
                true
            }
            None => false,
        }
    }

    /// Drains fired wakeups, returning the processes to resume. Wakeups of
    /// registrations that no longer exist are discarded.
    pub fn take_ready(&mut self) -> Vec<(WakeupId, PcbId)> {
        let fired: Vec<WakeupId> = self.queue.ready.lock().drain(..).collect();

        fired
            .into_iter()
            .filter_map(|id| self.unregister(id).map(|r| (id, r.pcb)))
            .collect()
    }

    /// Blocks until a wakeup is queued or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut ready = self.queue.ready.lock();

        if ready.is_empty() {
            self.queue.cond.wait_for(&mut ready, timeout);
        }

        !ready.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct Source {
        ready: Mutex<bool>,
        wakers: Mutex<HashMap<i64, Waker>>,
        cancelled: Mutex<Vec<WakeupId>>,
    }

    impl EventSource for Source {
        fn poll(&self, _sfd: i64, interest: Interest) -> Interest {
            if *self.ready.lock() {
                interest
            } else {
                Interest::empty()
            }
        }

        fn subscribe(&self, sfd: i64, _interest: Interest, waker: Waker) {
            self.wakers.lock().insert(sfd, waker);
        }

        fn unsubscribe(&self, sfd: i64, id: WakeupId) {
            self.wakers.lock().remove(&sfd);
            self.cancelled.lock().push(id);
        }
    }

    impl Source {
        fn fire(&self, sfd: i64) {
            *self.ready.lock() = true;
            if let Some(waker) = self.wakers.lock().remove(&sfd) {
                waker.wake();
            }
        }
    }

    fn pcb(n: u32) -> PcbId {
        PcbId::new(n, 0)
    }

    #[test]
    fn test_ready_does_not_park() {
        let mut sched = Scheduler::new();
        let source = Source::default();
        *source.ready.lock() = true;

        assert_eq!(
            sched.check_suspend_on(pcb(0), ServiceCode(1), &source, 3, Interest::READ),
            Readiness::Ready
        );
        assert_eq!(sched.nr_pending(), 0);
    }

    #[test]
    fn test_wakeup_round_trip() {
        let mut sched = Scheduler::new();
        let source = Source::default();

        let Readiness::Parked(id) =
            sched.check_suspend_on(pcb(2), ServiceCode(1), &source, 3, Interest::READ)
        else {
            panic!("expected to park");
        };
        assert_eq!(sched.nr_pending(), 1);
        assert!(sched.take_ready().is_empty());

        source.fire(3);
        assert!(sched.wait(Duration::from_millis(10)));
        assert_eq!(sched.take_ready(), vec![(id, pcb(2))]);
        assert_eq!(sched.nr_pending(), 0);
    }

    #[test]
    fn test_wakeup_from_another_thread() {
        let mut sched = Scheduler::new();
        let source = Arc::new(Source::default());

        let Readiness::Parked(id) =
            sched.check_suspend_on(pcb(0), ServiceCode(1), source.as_ref(), 9, Interest::WRITE)
        else {
            panic!("expected to park");
        };

        let s = source.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            s.fire(9);
        });

        let mut woken = Vec::new();
        while woken.is_empty() {
            sched.wait(Duration::from_millis(100));
            woken = sched.take_ready();
        }
        handle.join().unwrap();

        assert_eq!(woken, vec![(id, pcb(0))]);
    }

    #[test]
    fn test_revoked_wakeup_is_dropped() {
        let mut sched = Scheduler::new();
        let source = Source::default();

        let Readiness::Parked(id) =
            sched.check_suspend_on(pcb(1), ServiceCode(1), &source, 4, Interest::READ)
        else {
            panic!("expected to park");
        };

        let waker = source.wakers.lock().get(&4).cloned().unwrap();
        assert!(sched.revoke(id, Some(&source)));
        assert!(waker.is_revoked());
        assert_eq!(source.cancelled.lock().as_slice(), &[id]);

        waker.wake();
        assert!(sched.take_ready().is_empty());
        assert!(!sched.revoke(id, Some(&source)));
    }

    #[test]
    fn test_stale_id_after_reuse() {
        let mut sched = Scheduler::new();
        let source = Source::default();

        let Readiness::Parked(first) =
            sched.check_suspend_on(pcb(1), ServiceCode(1), &source, 4, Interest::READ)
        else {
            panic!("expected to park");
        };
        sched.revoke(first, None);

        let Readiness::Parked(second) =
            sched.check_suspend_on(pcb(2), ServiceCode(1), &source, 5, Interest::READ)
        else {
            panic!("expected to park");
        };

        assert_ne!(first, second);
        assert!(!sched.revoke(first, None));
        assert_eq!(sched.nr_pending(), 1);
    }
}
