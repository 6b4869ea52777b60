use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// A registry of named helper threads.
///
/// The pool keeps two of these: one for work that may be abandoned at a
/// safe point (spawn loops, out-of-band probes) and one for work that
/// must run to completion (restart finalization).  Interruption is
/// cooperative: long-running work checks [`ThreadGroup::interrupted`]
/// between blocking steps.
pub(crate) struct ThreadGroup {
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    interrupt: Arc<AtomicBool>,
}

impl ThreadGroup {
    pub fn new() -> ThreadGroup {
        ThreadGroup {
            threads: Mutex::new(Vec::new()),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns a named thread and tracks its join handle.
    pub fn spawn<F>(&self, name: String, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name).spawn(f)?;
        let mut threads = self.threads.lock().unwrap();
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
        Ok(())
    }

    /// Asks all current and future threads of this group to stop.
    pub fn interrupt_all(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Waits for every tracked thread to finish.
    pub fn join_all(&self) {
        let handles: Vec<_> = {
            let mut threads = self.threads.lock().unwrap();
            threads.drain(..).collect()
        };
        for handle in handles {
            let name = handle
                .thread()
                .name()
                .unwrap_or("<unnamed>")
                .to_string();
            if handle.join().is_err() {
                log::error!("helper thread '{}' panicked", name);
            }
        }
    }
}
