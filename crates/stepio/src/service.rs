//! Completion multiplexer.
//!
//! A `Service` owns one backend and the post queue. Sockets hold a clone of
//! it (cheap, `Rc`), so it stays alive as long as anything can still issue
//! I/O on it. Dispatch is single-threaded; `Remote` is the only way in from
//! other threads.
//!
//! ```text
//!   run_one / run_batch
//!     │
//!     ├─ backend.wait(buf, block)      ← borrow released before dispatch
//!     ├─ drop WAKE entries, append posted events
//!     └─ for each event:
//!          SHUTDOWN → remember, never dispatched
//!          else     → Descriptor::deliver → Next::Complete(hook).run()
//! ```

use crate::backend;
use crate::config::ServiceConfig;
use crate::waker::{PostQueue, Remote};

use stepio_core::backend::Backend;
use stepio_core::descriptor::{Descriptor, Next};
use stepio_core::entry::{Event, Key, Op};
use stepio_core::error::Result;
use stepio_core::{kdebug, ktrace};

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

/// Most events drained by one `run_batch()`.
pub const BATCH_SIZE: usize = 16;

struct ServiceShared {
    backend: RefCell<Box<dyn Backend>>,
    posted: Arc<PostQueue>,
    name: &'static str,
}

/// Handle onto a completion service. Clones share the same service.
#[derive(Clone)]
pub struct Service {
    shared: Rc<ServiceShared>,
}

impl Service {
    /// Service configured from the environment (`STEPIO_*`).
    pub fn new() -> Result<Self> {
        Self::with_config(&ServiceConfig::from_env())
    }

    pub fn with_config(config: &ServiceConfig) -> Result<Self> {
        Self::with_backend(|wake_fd| backend::create(config, wake_fd))
    }

    /// Service around a caller-built backend. `make` receives the wake fd
    /// the backend must watch.
    pub fn with_backend<F>(make: F) -> Result<Self>
    where
        F: FnOnce(RawFd) -> Result<Box<dyn Backend>>,
    {
        let posted = Arc::new(PostQueue::new()?);
        let backend = make(posted.fd())?;
        let name = backend.name();
        Ok(Self {
            shared: Rc::new(ServiceShared {
                backend: RefCell::new(backend),
                posted,
                name,
            }),
        })
    }

    /// Wait for one completion and dispatch it.
    ///
    /// `Ok(false)` only when the event was a shutdown.
    pub fn run_one(&self) -> Result<bool> {
        let mut events = [Event::EMPTY; 1];
        let n = self.fill(&mut events)?;
        Ok(self.dispatch(&events[..n]))
    }

    /// Wait once, then dispatch up to [`BATCH_SIZE`] completions in queue
    /// order. Shutdown entries are skipped; real completions in the same
    /// batch are still dispatched.
    ///
    /// `Ok(false)` if any shutdown was seen.
    pub fn run_batch(&self) -> Result<bool> {
        let mut events = [Event::EMPTY; BATCH_SIZE];
        let n = self.fill(&mut events)?;
        Ok(self.dispatch(&events[..n]))
    }

    /// Post a shutdown event. The drain loop observes it exactly once.
    pub fn shutdown(&self) -> Result<()> {
        kdebug!("service: shutdown posted");
        self.shared.posted.post(Event::shutdown())
    }

    /// A `Send + Sync` handle for posting from other threads.
    pub fn remote(&self) -> Remote {
        Remote::new(self.shared.posted.clone())
    }

    /// Associate a socket with the backend.
    pub fn register(&self, fd: RawFd) -> Result<()> {
        self.shared.backend.borrow_mut().register(fd)
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.name
    }

    /// Operations handed to the backend and not yet reported.
    pub fn inflight(&self) -> usize {
        self.shared.backend.borrow().inflight()
    }

    pub(crate) fn submit(&self, key: Key, op: Op) -> Result<()> {
        self.shared.backend.borrow_mut().submit(key, op)
    }

    /// Fill `events` with at least one real or posted event.
    fn fill(&self, events: &mut [Event]) -> Result<usize> {
        loop {
            // Something already posted: harvest without blocking so it is
            // not held up behind the backend.
            let block = self.shared.posted.is_empty();
            let got = self.shared.backend.borrow_mut().wait(events, block)?;

            let mut n = 0;
            for i in 0..got {
                if events[i].key != Key::WAKE {
                    events[n] = events[i];
                    n += 1;
                }
            }
            while n < events.len() {
                match self.shared.posted.pop() {
                    Some(ev) => {
                        events[n] = ev;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n > 0 {
                return Ok(n);
            }
        }
    }

    fn dispatch(&self, events: &[Event]) -> bool {
        let mut running = true;
        for ev in events {
            if ev.is_shutdown() {
                kdebug!("service: shutdown observed");
                running = false;
                continue;
            }
            ktrace!("service: completion key={:#x} result={}", ev.key.0, ev.result);
            // Keys come from descriptors armed by this service's primitives,
            // which stay alive until their completion is delivered.
            unsafe {
                if let Some(hook) = Descriptor::deliver(ev.key, ev.result, ev.flags) {
                    Next::Complete(hook).run();
                }
            }
        }
        running
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").field("backend", &self.shared.name).finish()
    }
}
