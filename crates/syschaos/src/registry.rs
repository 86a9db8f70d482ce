//! Thread membership registry.
//!
//! The authoritative set of threads subject to injection.  Every mutation
//! happens under one lock and arms or disarms the thread inside the
//! critical section, so membership and what the substrate intercepts never
//! disagree from the outside.

use crate::error::SessionError;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use syschaos_dispatch::{Substrate, SubstrateError};
use syschaos_fault::engine::Tid;
use syschaos_fault::plan::ThreadFilter;

/// How a thread became a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Explicit,
    Discovered,
}

/// Membership state for one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRecord {
    pub tid: Tid,
    pub joined_at: Instant,
    pub origin: Origin,
}

#[derive(Debug, Default)]
struct Members {
    records: HashMap<Tid, ThreadRecord>,
    /// Explicitly removed; discovery skips them.
    excluded: HashSet<Tid>,
    closed: bool,
}

pub struct ThreadRegistry {
    substrate: Arc<dyn Substrate>,
    selector: Option<ThreadFilter>,
    members: Mutex<Members>,
}

impl ThreadRegistry {
    pub fn new(substrate: Arc<dyn Substrate>, selector: Option<ThreadFilter>) -> Self {
        Self {
            substrate,
            selector,
            members: Mutex::new(Members::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admits(&self, tid: Tid) -> bool {
        self.selector.as_ref().map_or(true, |s| s.admits(tid))
    }

    /// Add `tid`.  Returns whether it became a member.
    ///
    /// Adding a member, or a thread the selector rejects, is a no-op.  An
    /// explicit add clears an earlier exclusion; a discovered thread that
    /// is excluded is skipped.
    pub fn add(&self, tid: Tid, origin: Origin) -> Result<bool, SessionError> {
        let mut members = self.lock();
        if members.closed {
            return Err(SessionError::Stopped);
        }
        if !self.admits(tid) {
            debug!("thread {} rejected by selector", tid);
            return Ok(false);
        }
        match origin {
            Origin::Explicit => {
                members.excluded.remove(&tid);
            }
            Origin::Discovered if members.excluded.contains(&tid) => return Ok(false),
            Origin::Discovered => {}
        }
        if members.records.contains_key(&tid) {
            return Ok(false);
        }

        self.substrate.arm(tid).map_err(|e| match e {
            SubstrateError::NoSuchThread(tid) => SessionError::NoSuchThread(tid),
            other => SessionError::Substrate(other),
        })?;
        members.records.insert(
            tid,
            ThreadRecord {
                tid,
                joined_at: Instant::now(),
                origin,
            },
        );
        debug!("thread {} joined ({:?})", tid, origin);
        Ok(true)
    }

    /// Explicitly remove `tid` and exclude it from discovery.  Returns
    /// whether it was a member.  A no-op once the registry is closed.
    pub fn remove(&self, tid: Tid) -> Result<bool, SessionError> {
        let mut members = self.lock();
        if members.closed {
            return Ok(false);
        }
        members.excluded.insert(tid);
        if !members.records.contains_key(&tid) {
            return Ok(false);
        }
        self.substrate.disarm(tid)?;
        members.records.remove(&tid);
        debug!("thread {} left", tid);
        Ok(true)
    }

    /// Drop members that no longer exist.  Returns how many were dropped.
    pub fn forget_dead(&self, alive: &HashSet<Tid>) -> usize {
        let mut members = self.lock();
        let before = members.records.len();
        members.records.retain(|tid, _| alive.contains(tid));
        members.excluded.retain(|tid| alive.contains(tid));
        let gone = before - members.records.len();
        if gone > 0 {
            debug!("forgot {} exited thread(s)", gone);
        }
        gone
    }

    /// Re-arm members whose interception lapsed.
    pub fn rearm(&self, lapsed: &[Tid]) {
        let mut members = self.lock();
        if members.closed {
            return;
        }
        for &tid in lapsed {
            if !members.records.contains_key(&tid) {
                continue;
            }
            match self.substrate.arm(tid) {
                Ok(()) => debug!("re-armed lapsed thread {}", tid),
                Err(SubstrateError::NoSuchThread(_)) => {
                    members.records.remove(&tid);
                }
                Err(e) => warn!("failed to re-arm thread {}: {}", tid, e),
            }
        }
    }

    /// Close the registry and disarm every member.  Later adds fail with
    /// [`SessionError::Stopped`].
    ///
    /// Every member is disarmed even if some fail; the first failure is
    /// returned.  Otherwise returns the number of threads disarmed.
    pub fn close(&self) -> Result<usize, SessionError> {
        let mut members = self.lock();
        members.closed = true;
        members.excluded.clear();
        let tids: Vec<_> = members.records.drain().map(|(tid, _)| tid).collect();
        let mut first_error = None;
        for &tid in &tids {
            if let Err(e) = self.substrate.disarm(tid) {
                warn!("failed to disarm thread {}: {}", tid, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(tids.len()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_member(&self, tid: Tid) -> bool {
        self.lock().records.contains_key(&tid)
    }

    pub fn is_excluded(&self, tid: Tid) -> bool {
        self.lock().excluded.contains(&tid)
    }

    /// Member tids, ascending.
    pub fn members(&self) -> Vec<Tid> {
        let mut tids: Vec<_> = self.lock().records.keys().copied().collect();
        tids.sort_unstable();
        tids
    }

    pub fn record(&self, tid: Tid) -> Option<ThreadRecord> {
        self.lock().records.get(&tid).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("substrate", &self.substrate.name())
            .field("members", &self.members())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use syschaos_dispatch::{current_tid, LoopbackSubstrate};

    fn registry() -> (Arc<LoopbackSubstrate>, ThreadRegistry) {
        let lb = Arc::new(LoopbackSubstrate::new());
        let reg = ThreadRegistry::new(lb.clone(), None);
        (lb, reg)
    }

    #[test]
    fn add_arms_and_remove_disarms() {
        let (lb, reg) = registry();
        let me = current_tid();
        assert!(reg.add(me, Origin::Explicit).unwrap());
        assert!(lb.is_armed(me));
        assert!(reg.is_member(me));
        assert_eq!(reg.record(me).unwrap().origin, Origin::Explicit);

        assert!(reg.remove(me).unwrap());
        assert!(!lb.is_armed(me));
        assert!(reg.is_empty());
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let (_lb, reg) = registry();
        let me = current_tid();
        assert!(reg.add(me, Origin::Explicit).unwrap());
        assert!(!reg.add(me, Origin::Explicit).unwrap());
        assert_eq!(reg.len(), 1);
        assert!(reg.remove(me).unwrap());
        assert!(!reg.remove(me).unwrap());
    }

    #[test]
    fn explicit_remove_excludes_from_discovery() {
        let (_lb, reg) = registry();
        let me = current_tid();
        reg.add(me, Origin::Explicit).unwrap();
        reg.remove(me).unwrap();
        assert!(reg.is_excluded(me));
        assert!(!reg.add(me, Origin::Discovered).unwrap());

        // An explicit add lifts the exclusion.
        assert!(reg.add(me, Origin::Explicit).unwrap());
        assert!(!reg.is_excluded(me));
    }

    #[test]
    fn selector_rejection_is_a_no_op() {
        let lb = Arc::new(LoopbackSubstrate::new());
        let reg = ThreadRegistry::new(lb.clone(), Some(ThreadFilter::new(|_tid: i32| false)));
        assert!(!reg.add(current_tid(), Origin::Explicit).unwrap());
        assert!(lb.armed_threads().is_empty());
    }

    #[test]
    fn adding_dead_thread_fails() {
        let (_lb, reg) = registry();
        let err = reg.add(i32::MAX, Origin::Explicit).unwrap_err();
        assert!(matches!(err, SessionError::NoSuchThread(t) if t == i32::MAX));
        assert!(reg.is_empty());
    }

    #[test]
    fn forget_dead_keeps_live_members() {
        let (_lb, reg) = registry();
        let me = current_tid();
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let worker = thread::spawn(move || {
            tx.send(current_tid()).unwrap();
            done_rx.recv().unwrap();
        });
        let other = rx.recv().unwrap();

        reg.add(me, Origin::Explicit).unwrap();
        reg.add(other, Origin::Discovered).unwrap();
        done_tx.send(()).unwrap();
        worker.join().unwrap();

        let alive: HashSet<Tid> = [me].into_iter().collect();
        assert_eq!(reg.forget_dead(&alive), 1);
        assert_eq!(reg.members(), vec![me]);
    }

    #[test]
    fn closed_registry_rejects_adds_and_ignores_removes() {
        let (lb, reg) = registry();
        let me = current_tid();
        reg.add(me, Origin::Explicit).unwrap();
        assert_eq!(reg.close().unwrap(), 1);
        assert!(reg.is_closed());
        assert!(!lb.is_armed(me));
        assert!(matches!(
            reg.add(me, Origin::Explicit),
            Err(SessionError::Stopped)
        ));
        assert!(!reg.remove(me).unwrap());
    }

    #[test]
    fn rearm_skips_non_members() {
        let (lb, reg) = registry();
        let me = current_tid();
        reg.rearm(&[me]);
        assert!(!lb.is_armed(me));
        reg.add(me, Origin::Explicit).unwrap();
        lb.disarm(me).unwrap();
        reg.rearm(&[me]);
        assert!(lb.is_armed(me));
    }
}
