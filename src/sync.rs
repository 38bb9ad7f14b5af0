//! Background synchronizer: a single thread that periodically flushes buffered writes and
//! sweeps expired keys across every registered store, so callers don't
//! need their own timers.
//!
//! Stores register themselves as `Weak` so the synchronizer never keeps
//! one alive past its last strong reference, and a failure against one
//! store never stops the sweep over the others.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::StoreResult;
use crate::events::{default_sink, Event, EventSink, Level};

/// The subset of [`crate::store::Store`] the synchronizer needs to
/// drive; kept as a trait so this module has no dependency on the
/// concrete store type.
pub trait Syncable: Send + Sync {
    fn flush_buffer(&self) -> StoreResult<()>;
    fn sweep_expired(&self) -> StoreResult<usize>;
}

struct Registration {
    target: Weak<dyn Syncable>,
}

/// Drives periodic maintenance across every registered store.
pub struct BackgroundSynchronizer {
    registrations: Mutex<Vec<Registration>>,
    interval: Duration,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    kick_tx: Mutex<Option<Sender<()>>>,
    sink: Arc<dyn EventSink>,
}

impl BackgroundSynchronizer {
    pub fn new(interval: Duration) -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            interval,
            handle: Mutex::new(None),
            stop_tx: Mutex::new(None),
            kick_tx: Mutex::new(None),
            sink: default_sink(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn register(&self, target: Weak<dyn Syncable>) {
        self.registrations.lock().unwrap().push(Registration { target });
    }

    /// Ask the background thread to run a maintenance pass as soon as
    /// it can, without blocking the caller or running the pass inline.
    /// Coalesces with any already-pending kick; a no-op before `start`.
    pub fn trigger(&self) {
        if let Some(tx) = self.kick_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Run one maintenance pass synchronously over every live
    /// registration, pruning ones that have been dropped.
    pub fn run_once(&self) {
        let mut registrations = self.registrations.lock().unwrap();
        registrations.retain_mut(|reg| {
            let Some(target) = reg.target.upgrade() else {
                return false;
            };
            if let Err(e) = target.flush_buffer() {
                self.sink.emit(
                    Event::new(Level::Warn, "sync", "flush_buffer")
                        .failed()
                        .attr("error", e.to_string()),
                );
            }
            match target.sweep_expired() {
                Ok(count) => {
                    if count > 0 {
                        self.sink.emit(
                            Event::new(Level::Debug, "sync", "sweep_expired").attr("expired", count),
                        );
                    }
                }
                Err(e) => {
                    self.sink.emit(
                        Event::new(Level::Warn, "sync", "sweep_expired")
                            .failed()
                            .attr("error", e.to_string()),
                    );
                }
            }
            true
        });
    }

    /// Idempotent: calling `start` while already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(1);
        let (kick_tx, kick_rx): (Sender<()>, Receiver<()>) = bounded(1);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);
        *self.kick_tx.lock().unwrap() = Some(kick_tx);
        let this = Arc::clone(self);
        *handle = Some(std::thread::spawn(move || loop {
            crossbeam_channel::select! {
                recv(stop_rx) -> _ => break,
                recv(kick_rx) -> _ => this.run_once(),
                default(this.interval) => this.run_once(),
            }
        }));
    }

    /// Stop the background thread, running one final maintenance pass
    /// first so nothing accumulated buffers forever. Idempotent.
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.kick_tx.lock().unwrap().take();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.run_once();
    }
}

impl Drop for BackgroundSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTarget {
        flushes: AtomicUsize,
        sweeps: AtomicUsize,
    }

    impl Syncable for CountingTarget {
        fn flush_buffer(&self) -> StoreResult<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn sweep_expired(&self) -> StoreResult<usize> {
            Ok(self.sweeps.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[test]
    fn run_once_drives_every_live_registration() {
        let sync = BackgroundSynchronizer::new(Duration::from_secs(60));
        let target = Arc::new(CountingTarget {
            flushes: AtomicUsize::new(0),
            sweeps: AtomicUsize::new(0),
        });
        sync.register(Arc::downgrade(&target) as Weak<dyn Syncable>);
        sync.run_once();
        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_targets_are_pruned_on_next_pass() {
        let sync = BackgroundSynchronizer::new(Duration::from_secs(60));
        {
            let target = Arc::new(CountingTarget {
                flushes: AtomicUsize::new(0),
                sweeps: AtomicUsize::new(0),
            });
            sync.register(Arc::downgrade(&target) as Weak<dyn Syncable>);
        }
        sync.run_once();
        assert_eq!(sync.registrations.lock().unwrap().len(), 0);
    }

    #[test]
    fn start_stop_is_idempotent_and_runs_final_pass() {
        let sync = Arc::new(BackgroundSynchronizer::new(Duration::from_millis(20)));
        let target = Arc::new(CountingTarget {
            flushes: AtomicUsize::new(0),
            sweeps: AtomicUsize::new(0),
        });
        sync.register(Arc::downgrade(&target) as Weak<dyn Syncable>);
        sync.start();
        sync.start();
        std::thread::sleep(Duration::from_millis(60));
        sync.stop();
        sync.stop();
        assert!(target.flushes.load(Ordering::SeqCst) >= 1);
    }
}
