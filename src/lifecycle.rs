//! One-shot teardown and process-exit cleanup.
//!
//! Every [`Network`](crate::Network) owns a [`CleanupGate`]. Explicit cleanup,
//! the drop finalizer and the signal handler all go through the gate, so the
//! enclave is destroyed at most once. Networks that want to be torn down on
//! SIGINT/SIGTERM register their gate with a [`CleanupRegistry`]; a registry
//! installs at most one signal handler no matter how many networks it holds.

use crate::{Error, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tokio::sync::OnceCell;

/// Deferred teardown of an enclave
pub type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Exit status used after cleaning up on a signal (128 + SIGINT)
const SIGNAL_EXIT_CODE: i32 = 130;

/// Runs a teardown callback at most once
///
/// Concurrent callers wait for the single run; every caller observes the same
/// outcome.
pub struct CleanupGate {
    teardown: Mutex<Option<Teardown>>,
    outcome: OnceCell<Option<String>>,
}

impl CleanupGate {
    pub fn new(teardown: Teardown) -> Self {
        Self {
            teardown: Mutex::new(Some(teardown)),
            outcome: OnceCell::new(),
        }
    }

    /// A gate with nothing to tear down
    pub fn noop() -> Self {
        Self {
            teardown: Mutex::new(None),
            outcome: OnceCell::new(),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let outcome = self
            .outcome
            .get_or_init(|| async {
                let teardown = self.take_teardown();
                match teardown {
                    Some(teardown) => teardown().await.err().map(|e| e.to_string()),
                    None => None,
                }
            })
            .await;

        match outcome {
            None => Ok(()),
            Some(message) => Err(Error::Cleanup(message.clone())),
        }
    }

    /// Whether teardown has completed
    pub fn is_done(&self) -> bool {
        self.outcome.initialized()
    }

    fn take_teardown(&self) -> Option<Teardown> {
        self.teardown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl std::fmt::Debug for CleanupGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupGate")
            .field("done", &self.is_done())
            .finish()
    }
}

/// Gates to clean up when the process is interrupted
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    gates: Mutex<HashMap<u64, Weak<CleanupGate>>>,
    next_id: AtomicU64,
    signal_handler_installed: AtomicBool,
}

impl CleanupRegistry {
    /// A private registry, mostly useful in tests
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every network in this process
    pub fn global() -> &'static CleanupRegistry {
        static GLOBAL: OnceLock<CleanupRegistry> = OnceLock::new();
        GLOBAL.get_or_init(CleanupRegistry::new)
    }

    /// Track `gate`; the registry only holds a weak reference
    pub fn register(&self, gate: &Arc<CleanupGate>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, Arc::downgrade(gate));
        id
    }

    pub fn unregister(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Forget every gate without running it; returns how many were tracked
    pub fn unregister_all(&self) -> usize {
        let mut gates = self.lock();
        let count = gates.len();
        gates.clear();
        count
    }

    /// Number of tracked gates whose network is still alive
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|gate| gate.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every live gate concurrently and unregister them all.
    ///
    /// Failures are logged, not returned. Returns the number of gates run.
    pub async fn cleanup_all(&self) -> usize {
        let gates: Vec<Arc<CleanupGate>> = {
            let mut tracked = self.lock();
            let live = tracked.values().filter_map(Weak::upgrade).collect();
            tracked.clear();
            live
        };

        let count = gates.len();
        let results = futures::future::join_all(gates.iter().map(|gate| gate.run())).await;
        for result in results {
            if let Err(e) = result {
                tracing::warn!("Cleanup on shutdown failed: {}", e);
            }
        }
        count
    }

    /// Install the SIGINT/SIGTERM handler for this registry if not already done.
    ///
    /// The handler runs on its own thread and runtime so it outlives the
    /// runtime that created the first network. Returns whether this call
    /// installed it.
    pub fn install_signal_handler_once(&'static self) -> bool {
        if self
            .signal_handler_installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let spawned = std::thread::Builder::new()
            .name("devnet-signal-handler".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::warn!("Failed to start signal handler runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(async move {
                    if let Err(e) = wait_for_shutdown_signal().await {
                        tracing::warn!("Signal handler failed: {}", e);
                        return;
                    }
                    tracing::warn!("Shutdown signal received, destroying running devnets");
                    let count = self.cleanup_all().await;
                    tracing::info!("Cleaned up {} devnet(s)", count);
                    std::process::exit(SIGNAL_EXIT_CODE);
                });
            });

        if let Err(e) = spawned {
            tracing::warn!("Failed to spawn signal handler thread: {}", e);
            self.signal_handler_installed.store(false, Ordering::Release);
            return false;
        }
        true
    }

    pub fn is_signal_handler_installed(&self) -> bool {
        self.signal_handler_installed.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Weak<CleanupGate>>> {
        self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
