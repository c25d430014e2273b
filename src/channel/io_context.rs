//! Dedicated I/O thread shared by channels
//!
//! One thread waits on a [`Poller`] for readiness of every registered
//! transport and runs tasks posted from other threads. All delegate callbacks
//! of the channels registered here run on this thread.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use polling::{Event, Events, Poller};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::sync::lock;

type Task = Box<dyn FnOnce(&mut IoLoop) + Send>;

struct TaskQueue {
    queue: VecDeque<Task>,
    closed: bool,
}

/// State shared between the I/O thread and the threads posting to it
pub(crate) struct IoShared {
    poller: Poller,
    tasks: Mutex<TaskQueue>,
    thread_id: OnceLock<ThreadId>,
    next_key: AtomicUsize,
}

impl IoShared {
    pub(crate) fn poller(&self) -> &Poller {
        &self.poller
    }

    pub(crate) fn is_current(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    /// Allocate a poller key for a new source
    pub(crate) fn next_key(&self) -> usize {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a task for the I/O thread
    ///
    /// A task accepted here always runs, even if the context is shutting
    /// down. Fails once the context has stopped accepting work.
    pub(crate) fn post(&self, task: impl FnOnce(&mut IoLoop) + Send + 'static) -> Result<()> {
        {
            let mut tasks = lock(&self.tasks);
            if tasks.closed {
                return Err(Error::IoContextStopped);
            }
            tasks.queue.push_back(Box::new(task));
        }
        if let Err(e) = self.poller.notify() {
            tracing::warn!(error = %e, "io: failed to wake I/O thread");
        }
        Ok(())
    }
}

/// Loop-local state, only ever touched on the I/O thread
pub(crate) struct IoLoop {
    shared: Arc<IoShared>,
    sources: HashMap<usize, Weak<Channel>>,
}

impl IoLoop {
    /// Start watching `channel`'s transport for readability
    pub(crate) fn register(&mut self, key: usize, channel: &Arc<Channel>) -> io::Result<()> {
        self.sources.insert(key, Arc::downgrade(channel));
        let result = channel.with_transport(|fd| {
            // SAFETY: the descriptor stays registered only while the channel
            // owns it; teardown deletes it from the poller before closing.
            unsafe { self.shared.poller.add(&fd, Event::readable(key)) }
        });
        match result {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                self.sources.remove(&key);
                Err(e)
            }
            None => {
                self.sources.remove(&key);
                Ok(())
            }
        }
    }

    /// Drop the loop's reference to a source
    pub(crate) fn forget(&mut self, key: usize) {
        self.sources.remove(&key);
    }

    fn dispatch(&mut self, event: Event) {
        let Some(channel) = self.sources.get(&event.key).and_then(Weak::upgrade) else {
            self.sources.remove(&event.key);
            return;
        };
        channel.on_ready(event.readable, event.writable);
        if channel.is_shut_down() {
            self.sources.remove(&event.key);
        }
    }

    /// Take the queued tasks; reports whether the context is closing
    fn take_tasks(&self) -> (VecDeque<Task>, bool) {
        let mut tasks = lock(&self.shared.tasks);
        (std::mem::take(&mut tasks.queue), tasks.closed)
    }

    fn run(mut self) {
        let mut events = Events::new();
        loop {
            events.clear();
            if let Err(e) = self.shared.poller.wait(&mut events, None) {
                if e.kind() != io::ErrorKind::Interrupted {
                    tracing::error!(error = %e, "io: poller wait failed, stopping I/O thread");
                    lock(&self.shared.tasks).closed = true;
                }
            }

            let ready: Vec<Event> = events.iter().collect();
            for event in ready {
                self.dispatch(event);
            }

            let (tasks, closed) = self.take_tasks();
            for task in tasks {
                task(&mut self);
            }
            if closed {
                break;
            }
        }

        // Nothing can be queued once closed; run whatever got in first.
        let (tasks, _) = self.take_tasks();
        for task in tasks {
            task(&mut self);
        }

        let live: Vec<Arc<Channel>> = self
            .sources
            .drain()
            .filter_map(|(_, source)| source.upgrade())
            .collect();
        if !live.is_empty() {
            tracing::debug!(count = live.len(), "io: shutting down channels still registered");
        }
        for channel in live {
            channel.shut_down();
        }
        tracing::debug!("io: I/O thread exited");
    }
}

/// A dedicated I/O thread that channels run their transport I/O on
///
/// Several channels may share one context. Dropping the context shuts down
/// every channel still registered with it and joins the thread.
pub struct IoContext {
    shared: Arc<IoShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IoContext {
    /// Spawn the I/O thread
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let shared = Arc::new(IoShared {
            poller: Poller::new()?,
            tasks: Mutex::new(TaskQueue {
                queue: VecDeque::new(),
                closed: false,
            }),
            thread_id: OnceLock::new(),
            next_key: AtomicUsize::new(1),
        });

        let name = name.into();
        let io_loop = IoLoop {
            shared: Arc::clone(&shared),
            sources: HashMap::new(),
        };
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _ = io_loop.shared.thread_id.set(thread::current().id());
            io_loop.run();
        })?;
        // The id must be known before anyone asks is_current().
        let _ = shared.thread_id.set(handle.thread().id());

        tracing::debug!(thread = %name, "io: I/O thread started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Whether the caller is running on this context's I/O thread
    pub fn is_current(&self) -> bool {
        self.shared.is_current()
    }

    /// Stop the I/O thread
    ///
    /// Tasks already posted still run, then every channel still registered is
    /// shut down. Joins the thread unless called from it. Idempotent.
    pub fn shut_down(&self) {
        {
            let mut tasks = lock(&self.shared.tasks);
            if tasks.closed && lock(&self.thread).is_none() {
                return;
            }
            tasks.closed = true;
        }
        if let Err(e) = self.shared.poller.notify() {
            tracing::warn!(error = %e, "io: failed to wake I/O thread for shutdown");
        }
        if self.is_current() {
            return;
        }
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("io: I/O thread panicked");
            }
        }
    }

    pub(crate) fn shared(&self) -> &Arc<IoShared> {
        &self.shared
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        self.shut_down();
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("thread_id", &self.shared.thread_id.get())
            .finish()
    }
}
