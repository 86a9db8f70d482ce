//! In-process substrate for portable tests.
//!
//! Nothing is intercepted behind the program's back.  Code under test
//! routes a call explicitly through [`LoopbackSubstrate::invoke`], which
//! applies the engine's directive with the same before/after rules and
//! the same drain barrier as the kernel-backed substrate.  Because the
//! decision runs in ordinary thread context, custom eligibility
//! predicates are supported.

use crate::substrate::{current_tid, thread_exists, Capabilities, Substrate, SubstrateError};
use log::trace;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use syschaos_fault::engine::{DecisionEngine, Phase, Tid, Timing};
use syschaos_fault::outcome::{CallContext, SYSCALL_ARGS};

/// A substrate driven by explicit [`invoke`](LoopbackSubstrate::invoke)
/// calls.
#[derive(Debug, Default)]
pub struct LoopbackSubstrate {
    hooked: Mutex<HashSet<i64>>,
    armed: Mutex<HashSet<Tid>>,
    refused: HashSet<i64>,
    routing: RwLock<Option<Arc<DecisionEngine>>>,
    releases: AtomicUsize,
}

impl LoopbackSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make [`hook`](Substrate::hook) fail for `syscall`.
    pub fn refusing(mut self, syscall: i64) -> Self {
        self.refused.insert(syscall);
        self
    }

    pub fn is_hooked(&self, syscall: i64) -> bool {
        lock(&self.hooked).contains(&syscall)
    }

    pub fn is_armed(&self, tid: Tid) -> bool {
        lock(&self.armed).contains(&tid)
    }

    pub fn armed_threads(&self) -> Vec<Tid> {
        let mut tids: Vec<_> = lock(&self.armed).iter().copied().collect();
        tids.sort_unstable();
        tids
    }

    /// How many times a session has released this substrate.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.routing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Route one call made by the calling thread.
    ///
    /// `real` performs the actual operation and returns a kernel-style
    /// result (negative errno on failure).  It is not run when the
    /// directive fails the call up front.
    pub fn invoke(&self, syscall: i64, args: [u64; SYSCALL_ARGS], real: impl FnOnce() -> i64) -> i64 {
        let tid = current_tid();
        if !self.is_hooked(syscall) || !self.is_armed(tid) {
            return real();
        }
        let call = CallContext::new(syscall, args);

        let (directive, engine_id) = {
            let routing = self.routing.read().unwrap_or_else(PoisonError::into_inner);
            let Some(engine) = routing.as_ref() else {
                return real();
            };
            let directive = engine.decide(syscall, tid, Phase::Entry, &call);
            trace!("loopback: syscall {} on {} -> {:?}", syscall, tid, directive);

            if let Some(delay) = directive.delay_at(Timing::Before) {
                thread::sleep(delay);
            }
            if let Some(errno) = directive.failure_at(Timing::Before) {
                if let Some(delay) = directive.delay_at(Timing::After) {
                    thread::sleep(delay);
                }
                return -(errno as i64);
            }
            (directive, engine.id())
        };

        let ret = real();
        if !directive.has_after_effects() {
            return ret;
        }

        let routing = self.routing.read().unwrap_or_else(PoisonError::into_inner);
        match routing.as_ref() {
            Some(engine) if engine.id() == engine_id => {
                if let Some(delay) = directive.delay_at(Timing::After) {
                    thread::sleep(delay);
                }
                directive
                    .failure_at(Timing::After)
                    .map_or(ret, |errno| -(errno as i64))
            }
            // Stopped while the real call ran.
            _ => ret,
        }
    }
}

impl Substrate for LoopbackSubstrate {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            custom_eligibility: true,
        }
    }

    fn hook(&self, syscall: i64) -> Result<(), SubstrateError> {
        if self.refused.contains(&syscall) {
            return Err(SubstrateError::Unsupported(format!(
                "syscall {} cannot be hooked",
                syscall
            )));
        }
        lock(&self.hooked).insert(syscall);
        Ok(())
    }

    fn unhook(&self, syscall: i64) {
        lock(&self.hooked).remove(&syscall);
    }

    fn activate(&self, engine: Arc<DecisionEngine>) -> Result<(), SubstrateError> {
        let mut routing = self.routing.write().unwrap_or_else(PoisonError::into_inner);
        if routing.is_some() {
            return Err(SubstrateError::Busy);
        }
        *routing = Some(engine);
        Ok(())
    }

    fn deactivate(&self) {
        // The write lock waits for every reader, i.e. every in-flight
        // decision.
        self.routing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn arm(&self, tid: Tid) -> Result<(), SubstrateError> {
        if !thread_exists(tid) {
            return Err(SubstrateError::NoSuchThread(tid));
        }
        lock(&self.armed).insert(tid);
        Ok(())
    }

    fn disarm(&self, tid: Tid) -> Result<(), SubstrateError> {
        lock(&self.armed).remove(&tid);
        Ok(())
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
