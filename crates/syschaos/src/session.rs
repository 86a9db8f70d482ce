//! Session lifecycle.
//!
//! A [`Session`] owns a plan, the compiled engine, the membership registry
//! and the substrate hooks for the plan's syscalls.
//!
//! ```text
//! Starting ──start ok──→ Running ──stop()/drop──→ Stopped
//!     └──────start error (rolled back)───────────────┘
//! ```
//!
//! Once [`Session::stop`] returns, no directive is produced for the
//! session: routing is withdrawn and drained before members are disarmed
//! and hooks removed.  The substrate's claim is released at the same
//! point, so the next session can start while this one is still alive.

use crate::discovery::{self, Poller};
use crate::error::{SessionError, StartError};
use crate::registry::{Origin, ThreadRecord, ThreadRegistry};
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use syschaos_dispatch::{current_tid, ControlGuard, DispatchSubstrate, Substrate};
use syschaos_fault::engine::{DecisionEngine, Tid};
use syschaos_fault::{Plan, Stats};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A running (or stopped) injection instance.
///
/// # Example
///
/// ```no_run
/// use syschaos::{Outcome, PlanBuilder, Session};
///
/// let plan = PlanBuilder::new()
///     .outcome(libc::SYS_write, Outcome::failing(0.5, libc::EIO))
///     .build()
///     .unwrap();
/// let session = Session::start(plan).unwrap();
/// session.add_this_thread().unwrap();
/// // ... exercise the code under test ...
/// session.stop().unwrap();
/// println!("{}", session.stats());
/// ```
pub struct Session {
    plan: Arc<Plan>,
    engine: Arc<DecisionEngine>,
    substrate: Arc<dyn Substrate>,
    registry: Arc<ThreadRegistry>,
    state: Mutex<SessionState>,
    activated: AtomicBool,
    hooked: Mutex<Vec<i64>>,
    poller: Mutex<Option<Poller>>,
}

impl Session {
    /// Start a session on the process-wide dispatch substrate.
    pub fn start(plan: Plan) -> Result<Self, StartError> {
        plan.validate()?;
        let substrate = DispatchSubstrate::acquire()?;
        Self::start_with(plan, Arc::new(substrate))
    }

    /// Start a session on `substrate`.
    ///
    /// On error every hook installed so far is removed and routing is
    /// withdrawn; nothing of the session remains.
    pub fn start_with(plan: Plan, substrate: Arc<dyn Substrate>) -> Result<Self, StartError> {
        plan.validate()?;
        if plan.uses_custom_eligibility() && !substrate.capabilities().custom_eligibility {
            return Err(StartError::Unsupported(format!(
                "the {} substrate cannot evaluate custom eligibility predicates",
                substrate.name()
            )));
        }
        let engine = Arc::new(DecisionEngine::compile(&plan)?);

        let registry = Arc::new(ThreadRegistry::new(
            Arc::clone(&substrate),
            plan.selector().cloned(),
        ));
        let session = Session {
            plan: Arc::new(plan),
            engine,
            substrate,
            registry,
            state: Mutex::new(SessionState::Starting),
            activated: AtomicBool::new(false),
            hooked: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
        };

        if let Err(e) = session.launch() {
            warn!("session start failed: {}", e);
            if let Err(teardown) = session.shutdown() {
                warn!("rollback after failed start: {}", teardown);
            }
            return Err(e);
        }
        *lock(&session.state) = SessionState::Running;
        info!(
            "session started: {} on {} substrate (seed {})",
            session.plan,
            session.substrate.name(),
            session.engine.seed()
        );
        Ok(session)
    }

    fn launch(&self) -> Result<(), StartError> {
        let _control = ControlGuard::new(self.substrate.as_ref());

        for nr in self.plan.syscalls() {
            self.substrate.hook(nr)?;
            lock(&self.hooked).push(nr);
        }
        debug!("hooked {} syscall(s)", lock(&self.hooked).len());

        self.substrate.activate(Arc::clone(&self.engine))?;
        self.activated.store(true, Ordering::SeqCst);

        if let Some(interval) = self.plan.discovery().interval() {
            let poller = Poller::spawn(
                interval,
                Arc::clone(&self.registry),
                Arc::clone(&self.substrate),
            )
            .map_err(|e| StartError::StartFailed(format!("spawning discovery thread: {}", e)))?;
            let poller_tid = poller.tid();
            *lock(&self.poller) = Some(poller);

            let added = discovery::scan(&self.registry, self.substrate.as_ref(), Some(poller_tid))
                .map_err(|e| StartError::StartFailed(format!("initial thread discovery: {}", e)))?;
            debug!("initial discovery added {} thread(s)", added);
        }
        Ok(())
    }

    /// Stop the session.  Idempotent.
    ///
    /// Every step runs even if an earlier one failed; the first failure
    /// is returned.
    pub fn stop(&self) -> Result<(), SessionError> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<(), SessionError> {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Stopped {
                return Ok(());
            }
            *state = SessionState::Stopped;
        }
        let _control = ControlGuard::new(self.substrate.as_ref());

        if let Some(mut poller) = lock(&self.poller).take() {
            poller.stop();
        }
        let activated = self.activated.swap(false, Ordering::SeqCst);
        if activated {
            self.substrate.deactivate();
        }
        let disarmed = self.registry.close();
        for nr in lock(&self.hooked).drain(..) {
            self.substrate.unhook(nr);
        }
        // A session that never activated may share the substrate with the
        // one that did.
        if activated {
            self.substrate.release();
        }

        let count = disarmed?;
        info!(
            "session stopped ({} thread(s) disarmed): {}",
            count,
            self.engine.stats().snapshot()
        );
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        match *lock(&self.state) {
            SessionState::Running => Ok(()),
            _ => Err(SessionError::Stopped),
        }
    }

    fn is_stopped(&self) -> bool {
        *lock(&self.state) == SessionState::Stopped
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Membership
    // ═══════════════════════════════════════════════════════════════════

    /// Subject the calling thread to injection.  Returns whether it
    /// joined (false if already a member or rejected by the selector).
    pub fn add_this_thread(&self) -> Result<bool, SessionError> {
        self.add_thread(current_tid())
    }

    /// Stop injecting into the calling thread.
    pub fn remove_this_thread(&self) -> Result<bool, SessionError> {
        self.remove_thread(current_tid())
    }

    /// Subject `tid` to injection and clear any exclusion from an earlier
    /// removal.
    pub fn add_thread(&self, tid: Tid) -> Result<bool, SessionError> {
        self.ensure_running()?;
        let _control = ControlGuard::new(self.substrate.as_ref());
        self.registry.add(tid, Origin::Explicit)
    }

    /// Stop injecting into `tid` and keep discovery from re-adding it.
    /// A no-op on a stopped session.
    pub fn remove_thread(&self, tid: Tid) -> Result<bool, SessionError> {
        if self.is_stopped() {
            return Ok(false);
        }
        let _control = ControlGuard::new(self.substrate.as_ref());
        self.registry.remove(tid)
    }

    /// One-shot discovery scan.  Returns the number of threads added.
    pub fn discover_threads(&self) -> Result<usize, SessionError> {
        self.ensure_running()?;
        let _control = ControlGuard::new(self.substrate.as_ref());
        let poller = lock(&self.poller).as_ref().map(Poller::tid);
        discovery::scan(&self.registry, self.substrate.as_ref(), poller)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Accessors
    // ═══════════════════════════════════════════════════════════════════

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Seed the engine draws from (the plan's, or one picked at start).
    pub fn seed(&self) -> u64 {
        self.engine.seed()
    }

    pub fn stats(&self) -> Stats {
        self.engine.stats().snapshot()
    }

    /// Member tids, ascending.
    pub fn members(&self) -> Vec<Tid> {
        self.registry.members()
    }

    pub fn is_member(&self, tid: Tid) -> bool {
        self.registry.is_member(tid)
    }

    pub fn member_record(&self, tid: Tid) -> Option<ThreadRecord> {
        self.registry.record(tid)
    }

    /// Tid of the discovery poller, when polling.
    pub fn poller_tid(&self) -> Option<Tid> {
        lock(&self.poller).as_ref().map(Poller::tid)
    }

    pub fn substrate_name(&self) -> &'static str {
        self.substrate.name()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("failed to stop session cleanly: {}", e);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("substrate", &self.substrate.name())
            .field("plan", &self.plan.to_string())
            .field("members", &self.members())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use syschaos_dispatch::LoopbackSubstrate;
    use syschaos_fault::{Outcome, PlanBuilder};

    const WRITE: i64 = 1;

    fn plan() -> Plan {
        PlanBuilder::new()
            .seed(1)
            .outcome(WRITE, Outcome::failing(1.0, 5))
            .build()
            .unwrap()
    }

    #[test]
    fn start_runs_and_stop_is_idempotent() {
        let lb = Arc::new(LoopbackSubstrate::new());
        let session = Session::start_with(plan(), lb.clone()).unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert!(lb.is_hooked(WRITE));
        assert!(lb.is_active());

        session.stop().unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!lb.is_hooked(WRITE));
        assert!(!lb.is_active());
    }

    #[test]
    fn stop_releases_the_substrate_before_drop() {
        let lb = Arc::new(LoopbackSubstrate::new());
        let session = Session::start_with(plan(), lb.clone()).unwrap();
        assert_eq!(lb.releases(), 0);
        session.stop().unwrap();
        assert_eq!(lb.releases(), 1);

        let next = Session::start_with(plan(), lb.clone()).unwrap();
        assert_eq!(next.state(), SessionState::Running);
        drop(session);
        assert_eq!(lb.releases(), 1);
        assert!(lb.is_active());
    }

    #[test]
    fn failed_start_on_a_shared_substrate_keeps_the_claim() {
        let lb = Arc::new(LoopbackSubstrate::new());
        let first = Session::start_with(plan(), lb.clone()).unwrap();
        assert!(Session::start_with(plan(), lb.clone()).is_err());
        assert_eq!(lb.releases(), 0);
        assert_eq!(first.state(), SessionState::Running);
    }

    #[test]
    fn membership_ops_after_stop() {
        let lb = Arc::new(LoopbackSubstrate::new());
        let session = Session::start_with(plan(), lb).unwrap();
        session.stop().unwrap();
        assert!(matches!(session.add_this_thread(), Err(SessionError::Stopped)));
        assert!(matches!(session.discover_threads(), Err(SessionError::Stopped)));
        assert!(!session.remove_this_thread().unwrap());
    }

    #[test]
    fn drop_stops_the_session() {
        let lb = Arc::new(LoopbackSubstrate::new());
        {
            let session = Session::start_with(plan(), lb.clone()).unwrap();
            session.add_this_thread().unwrap();
            assert!(lb.is_armed(current_tid()));
        }
        assert!(!lb.is_active());
        assert!(!lb.is_armed(current_tid()));
    }

    #[test]
    fn state_displays_lowercase() {
        assert_eq!(SessionState::Running.to_string(), "running");
        assert_eq!(SessionState::Stopped.to_string(), "stopped");
    }
}
