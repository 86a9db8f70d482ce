//! Thread discovery.
//!
//! A scan lists `/proc/self/task`, forgets members that have exited,
//! re-arms members whose interception lapsed and adds every remaining
//! live thread the registry will take.  The poller repeats the scan on a
//! background thread until stopped.

use crate::error::SessionError;
use crate::registry::{Origin, ThreadRegistry};
use log::{debug, trace, warn};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use syschaos_dispatch::{current_tid, Substrate};
use syschaos_fault::engine::Tid;

const TASK_DIR: &str = "/proc/self/task";

/// Name of the background discovery thread.
pub const POLLER_NAME: &str = "syschaos-discovery";

/// Tids of every live thread in this process.
pub fn live_threads() -> io::Result<HashSet<Tid>> {
    let mut tids = HashSet::new();
    for entry in fs::read_dir(TASK_DIR)? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.insert(tid);
        }
    }
    Ok(tids)
}

/// One discovery pass.  `poller` is never added.  Returns the number of
/// threads that joined.
pub fn scan(
    registry: &ThreadRegistry,
    substrate: &dyn Substrate,
    poller: Option<Tid>,
) -> Result<usize, SessionError> {
    let alive = live_threads().map_err(SessionError::Discovery)?;
    registry.forget_dead(&alive);
    registry.rearm(&substrate.take_lapsed());

    let mut tids: Vec<_> = alive.into_iter().filter(|&tid| Some(tid) != poller).collect();
    tids.sort_unstable();

    let mut added = 0;
    for tid in tids {
        match registry.add(tid, Origin::Discovered) {
            Ok(true) => added += 1,
            Ok(false) => {}
            // Exited since the listing.
            Err(SessionError::NoSuchThread(_)) => {}
            Err(e) => return Err(e),
        }
    }
    trace!("discovery scan added {} thread(s)", added);
    Ok(added)
}

/// Stop flag shared with the poller thread.
type StopSignal = Arc<(Mutex<bool>, Condvar)>;

/// Background discovery thread.
#[derive(Debug)]
pub struct Poller {
    tid: Tid,
    stop: StopSignal,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Spawn the poller.  Returns once the thread has reported its tid,
    /// so callers can exclude it from scans.  The first scan happens one
    /// `interval` after spawning.
    pub fn spawn(
        interval: Duration,
        registry: Arc<ThreadRegistry>,
        substrate: Arc<dyn Substrate>,
    ) -> io::Result<Self> {
        let stop: StopSignal = Arc::new((Mutex::new(false), Condvar::new()));
        let (tid_tx, tid_rx) = mpsc::channel();

        let handle = thread::Builder::new().name(POLLER_NAME.to_string()).spawn({
            let stop = Arc::clone(&stop);
            move || {
                let me = current_tid();
                if tid_tx.send(me).is_err() {
                    return;
                }
                poll_loop(me, interval, &registry, substrate.as_ref(), &stop);
            }
        })?;

        let tid = tid_rx.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::Other, "discovery thread exited before starting")
        })?;
        debug!("discovery poller {} running every {:?}", tid, interval);
        Ok(Self {
            tid,
            stop,
            handle: Some(handle),
        })
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Signal the poller and wait for it to exit.  Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let (lock, cvar) = &*self.stop;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
        if handle.join().is_err() {
            warn!("discovery poller {} panicked", self.tid);
        }
        debug!("discovery poller {} stopped", self.tid);
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    me: Tid,
    interval: Duration,
    registry: &ThreadRegistry,
    substrate: &dyn Substrate,
    stop: &StopSignal,
) {
    let (lock, cvar) = &**stop;
    loop {
        {
            let stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let (stopped, _) = cvar
                .wait_timeout_while(stopped, interval, |stopped| !*stopped)
                .unwrap_or_else(PoisonError::into_inner);
            if *stopped {
                return;
            }
        }
        match scan(registry, substrate, Some(me)) {
            Ok(0) => {}
            Ok(n) => debug!("discovered {} new thread(s)", n),
            Err(SessionError::Stopped) => return,
            Err(e) => warn!("thread discovery failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use syschaos_dispatch::LoopbackSubstrate;

    fn setup() -> (Arc<LoopbackSubstrate>, Arc<ThreadRegistry>) {
        let lb = Arc::new(LoopbackSubstrate::new());
        let reg = Arc::new(ThreadRegistry::new(lb.clone(), None));
        (lb, reg)
    }

    /// Spawn a thread that parks until the returned sender is dropped.
    fn parked_thread() -> (Tid, mpsc::Sender<()>, JoinHandle<()>) {
        let (tid_tx, tid_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            tid_tx.send(current_tid()).unwrap();
            let _ = done_rx.recv();
        });
        (tid_rx.recv().unwrap(), done_tx, handle)
    }

    #[test]
    fn live_threads_include_the_caller() {
        let tids = live_threads().unwrap();
        assert!(tids.contains(&current_tid()));
    }

    #[test]
    fn scan_adds_live_threads_and_skips_the_poller() {
        let (lb, reg) = setup();
        let me = current_tid();
        let (other, done, handle) = parked_thread();

        let added = scan(&reg, lb.as_ref(), Some(other)).unwrap();
        assert!(added >= 1);
        assert!(reg.is_member(me));
        assert!(!reg.is_member(other));

        // Members are not added twice.
        scan(&reg, lb.as_ref(), Some(other)).unwrap();
        assert_eq!(reg.members().iter().filter(|&&t| t == me).count(), 1);

        drop(done);
        handle.join().unwrap();
    }

    #[test]
    fn scan_skips_excluded_threads() {
        let (lb, reg) = setup();
        let (other, done, handle) = parked_thread();
        reg.add(other, Origin::Explicit).unwrap();
        reg.remove(other).unwrap();

        scan(&reg, lb.as_ref(), None).unwrap();
        assert!(!reg.is_member(other));

        drop(done);
        handle.join().unwrap();
    }

    #[test]
    fn scan_forgets_exited_members() {
        let (lb, reg) = setup();
        let (other, done, handle) = parked_thread();
        reg.add(other, Origin::Explicit).unwrap();
        drop(done);
        handle.join().unwrap();

        scan(&reg, lb.as_ref(), None).unwrap();
        assert!(!reg.is_member(other));
    }

    #[test]
    fn poller_discovers_new_threads() {
        let (lb, reg) = setup();
        let interval = Duration::from_millis(5);
        let mut poller = Poller::spawn(interval, reg.clone(), lb.clone()).unwrap();
        assert_ne!(poller.tid(), current_tid());

        let (other, done, handle) = parked_thread();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !reg.is_member(other) && Instant::now() < deadline {
            thread::sleep(interval);
        }
        assert!(reg.is_member(other));
        assert!(!reg.is_member(poller.tid()));

        poller.stop();
        poller.stop();
        drop(done);
        handle.join().unwrap();
    }
}
