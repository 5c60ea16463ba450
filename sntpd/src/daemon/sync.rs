use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sntp_proto::{NtpClock, NtpPacket};
use tracing::{debug, warn};

use super::config::ClientConfig;
use super::exchange::{ClientExchange, ExchangeError};

/// How often `start_sync_and_wait` re-checks for completion.
const COMPLETION_POLL: Duration = Duration::from_millis(50);

/// Repeatedly and safely re-synchronizes against one server.
///
/// Every attempt gets a private exchange and two private token flags, one
/// deciding whether the worker may commit its result and one authorizing the
/// watchdog to abandon the attempt. An abandoned worker is never terminated;
/// its exchange is unblocked by closing the socket and the worker then
/// discards its own result because its token says so. The tokens, not thread
/// identity, decide validity, so a late-returning abandoned worker can never
/// overwrite state committed by a newer attempt.
#[derive(Clone)]
pub struct ClientSynchronizer<C: NtpClock> {
    inner: Arc<SyncInner<C>>,
}

struct SyncInner<C> {
    config: ClientConfig,
    clock: C,
    /// The one mutual-exclusion domain: every admission, abandonment,
    /// result-commit and retry transition happens while holding this lock,
    /// so they are totally ordered.
    state: Mutex<SyncState>,
    /// Fast-path admission flags. Concurrent `start_sync` (or `stop_sync`)
    /// callers race on these; exactly one continues, the others return
    /// without queueing on the state lock.
    start_guard: AtomicBool,
    stop_guard: AtomicBool,
    // Observable state, written only inside the critical section but read
    // without synchronization by external callers, which tolerate brief
    // staleness.
    sync_running: AtomicBool,
    sync_ok: AtomicBool,
    clock_updated: AtomicBool,
}

struct SyncState {
    attempt: Option<Attempt>,
    retries_performed: u32,
    last_packet: Option<NtpPacket>,
}

/// The per-attempt shared objects. They are created fresh for every attempt
/// and never reused.
struct Attempt {
    exchange: Arc<ClientExchange>,
    save_result: Arc<AtomicBool>,
    watchdog_armed: Arc<AtomicBool>,
}

impl<C: NtpClock> ClientSynchronizer<C> {
    pub fn new(config: ClientConfig, clock: C) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                config,
                clock,
                state: Mutex::new(SyncState {
                    attempt: None,
                    retries_performed: 0,
                    last_packet: None,
                }),
                start_guard: AtomicBool::new(false),
                stop_guard: AtomicBool::new(false),
                sync_running: AtomicBool::new(false),
                sync_ok: AtomicBool::new(false),
                clock_updated: AtomicBool::new(false),
            }),
        }
    }

    /// True while an attempt (including its retries) is underway.
    pub fn is_syncing(&self) -> bool {
        self.inner.sync_running.load(Ordering::Acquire)
    }

    /// True if the last attempt completed successfully; false after a
    /// failure, a stop, or when no attempt ran yet.
    pub fn last_sync_succeeded(&self) -> bool {
        self.inner.sync_ok.load(Ordering::Acquire)
    }

    /// True if the last successful attempt also stepped the OS clock.
    pub fn last_clock_update_succeeded(&self) -> bool {
        self.inner.clock_updated.load(Ordering::Acquire)
    }

    /// A copy of the reply of the last successful synchronization, until it
    /// is superseded by the next one.
    pub fn last_synced_packet(&self) -> Option<NtpPacket> {
        self.inner.state.lock().unwrap().last_packet
    }

    /// Begins a synchronization attempt in the background. A no-op when one
    /// is already running; safe to call from any number of threads at once,
    /// exactly one of which is admitted.
    pub fn start_sync(&self) {
        if self.inner.sync_running.load(Ordering::Acquire) {
            return;
        }

        if self
            .inner
            .start_guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // someone else is already starting; no need to contend further
            return;
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            // double-check now that the lock is held: the running flag only
            // changes inside the critical section
            if !self.inner.sync_running.load(Ordering::Acquire) {
                SyncInner::begin_attempt(&self.inner, &mut state);
            }
        }

        self.inner.start_guard.store(false, Ordering::Release);
    }

    /// Like `start_sync`, but blocks the caller until the attempt, including
    /// any retries, settles.
    pub fn start_sync_and_wait(&self) {
        self.start_sync();

        loop {
            // reading under the state lock keeps retry transitions invisible:
            // the retrier holds the lock while it re-arms the next attempt,
            // so the running flag is never observed in the gap
            let running = {
                let _state = self.inner.state.lock().unwrap();
                self.inner.sync_running.load(Ordering::Acquire)
            };
            if !running {
                break;
            }
            thread::sleep(COMPLETION_POLL);
        }
    }

    /// Cancels the in-flight attempt, if any. The abandoned worker unblocks
    /// on its own and discards its result; `last_sync_succeeded` reports
    /// false. Idempotent when nothing is running.
    pub fn stop_sync(&self) {
        if !self.inner.sync_running.load(Ordering::Acquire) {
            return;
        }

        if self
            .inner
            .stop_guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            SyncInner::abandon_attempt(&self.inner, &mut state);
        }

        self.inner.stop_guard.store(false, Ordering::Release);
    }
}

impl<C: NtpClock> SyncInner<C> {
    /// Arms a fresh attempt and spawns its worker and watchdog. The state
    /// lock must be held.
    fn begin_attempt(inner: &Arc<Self>, state: &mut SyncState) {
        inner.sync_running.store(true, Ordering::Release);
        // invalidate previous results, a new attempt is underway
        inner.sync_ok.store(false, Ordering::Release);
        inner.clock_updated.store(false, Ordering::Release);

        let exchange = Arc::new(ClientExchange::new(
            inner.config.server.clone(),
            inner.config.port,
            inner.config.receive_timeout(),
        ));
        let save_result = Arc::new(AtomicBool::new(true));
        let watchdog_armed = Arc::new(AtomicBool::new(true));

        state.attempt = Some(Attempt {
            exchange: Arc::clone(&exchange),
            save_result: Arc::clone(&save_result),
            watchdog_armed: Arc::clone(&watchdog_armed),
        });

        let worker_inner = Arc::clone(inner);
        let worker_watchdog = Arc::clone(&watchdog_armed);
        thread::spawn(move || {
            // runs the exchange to completion, however long that blocks
            let result = exchange.ask_server(&worker_inner.clock);
            Self::finish_attempt(&worker_inner, &save_result, &worker_watchdog, result);
        });

        let watchdog_inner = Arc::clone(inner);
        let timeout = inner.config.receive_timeout();
        thread::spawn(move || {
            // sleep until the attempt would have to be abandoned, and only
            // then find out whether that is still this watchdog's job
            thread::sleep(timeout);
            Self::fire_watchdog(&watchdog_inner, &watchdog_armed);
        });
    }

    /// Worker epilogue: commit or discard the outcome of the exchange.
    fn finish_attempt(
        inner: &Arc<Self>,
        save_result: &AtomicBool,
        watchdog_armed: &AtomicBool,
        result: Result<NtpPacket, ExchangeError>,
    ) {
        let mut state = inner.state.lock().unwrap();

        if !save_result.load(Ordering::Acquire) {
            // abandoned: the shared state belongs to a newer attempt (or to
            // nobody); leave without touching any of it
            return;
        }

        // this attempt settles here, its watchdog has nothing left to do
        watchdog_armed.store(false, Ordering::Release);
        state.attempt = None;

        match result {
            Ok(packet) => {
                state.last_packet = Some(packet);
                if inner.config.update_os_clock {
                    let updated = match inner.clock.step_clock(packet.clock_offset()) {
                        Ok(()) => true,
                        Err(error) => {
                            warn!(%error, "could not step the system clock");
                            false
                        }
                    };
                    inner.clock_updated.store(updated, Ordering::Release);
                }
                state.retries_performed = 0;
                inner.sync_ok.store(true, Ordering::Release);
                inner.sync_running.store(false, Ordering::Release);
                debug!("synchronized");
            }
            Err(error) => {
                debug!(%error, "synchronization attempt failed");
                inner.sync_ok.store(false, Ordering::Release);
                inner.clock_updated.store(false, Ordering::Release);
                inner.sync_running.store(false, Ordering::Release);
                Self::retry(inner, &mut state);
            }
        }
    }

    /// Watchdog epilogue: if this watchdog is still authorized, abandon the
    /// stuck attempt and schedule the retry inside the same critical
    /// section, so no start_sync can interleave between the two.
    fn fire_watchdog(inner: &Arc<Self>, watchdog_armed: &AtomicBool) {
        let mut state = inner.state.lock().unwrap();

        if !watchdog_armed.load(Ordering::Acquire) {
            // the attempt settled before the timeout; whatever runs now is
            // someone else's to watch
            return;
        }

        debug!("synchronization attempt timed out, abandoning it");
        Self::abandon_attempt(inner, &mut state);
        Self::retry(inner, &mut state);
    }

    /// Marks the in-flight attempt as not-to-be-saved, revokes its watchdog,
    /// and unblocks its exchange. The state lock must be held. Does nothing
    /// when no attempt is in flight.
    fn abandon_attempt(inner: &Arc<Self>, state: &mut SyncState) {
        if let Some(attempt) = state.attempt.take() {
            attempt.save_result.store(false, Ordering::Release);
            attempt.watchdog_armed.store(false, Ordering::Release);
            // the abandoned worker unblocks with an error and then reads its
            // token; it is never forcibly terminated
            attempt.exchange.abort();

            inner.sync_ok.store(false, Ordering::Release);
            inner.clock_updated.store(false, Ordering::Release);
            inner.sync_running.store(false, Ordering::Release);
        }
    }

    /// Failure epilogue. The state lock must be held; it stays held across
    /// the retry delay so nothing can interleave between the failed attempt
    /// and the next one.
    fn retry(inner: &Arc<Self>, state: &mut SyncState) {
        if state.retries_performed < inner.config.max_retries {
            thread::sleep(inner.config.retry_delay());
            state.retries_performed += 1;
            debug!(retry = state.retries_performed, "retrying synchronization");
            Self::begin_attempt(inner, state);
        } else {
            // retries exhausted: reset the counter and settle into failure
            state.retries_performed = 0;
            debug!("synchronization failed");
        }
    }
}
