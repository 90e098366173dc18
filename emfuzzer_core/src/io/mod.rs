//! Readiness multiplexer draining any number of readable resources on one thread.

pub mod stream;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use stream::StreamLogger;

const WAKER: Token = Token(0);

#[derive(Error, Debug)]
pub enum IoLoopError {
    #[error("Failed to set up readiness wait: {0}")]
    Setup(#[from] std::io::Error),
}

/// Identity handed out by [`Multiplexer::register`]; never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(usize);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something the [`Multiplexer`] can wait on and drain.
///
/// `read` is called on the multiplexer thread whenever the resource is reported
/// ready and must consume everything currently available without blocking.
pub trait Selectable: Send {
    fn name(&self) -> &str;

    /// The pollable handle, or `None` once closed.
    fn source(&mut self) -> Option<&mut dyn Source>;

    fn read(&mut self);

    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

enum Command {
    Register(ResourceId, Box<dyn Selectable>),
    Close(ResourceId),
}

type Resources = HashMap<ResourceId, Box<dyn Selectable>>;

/// Shared reactor for subprocess and remote-command output.
///
/// Registration and close requests may come from any thread; they are queued and
/// applied by the loop thread on its next cycle, in submission order.
pub struct Multiplexer {
    commands: Mutex<Sender<Command>>,
    waker: Waker,
    stop_requested: Arc<AtomicBool>,
    next_id: AtomicUsize,
    thread: Mutex<Option<JoinHandle<Resources>>>,
}

impl Multiplexer {
    pub fn start() -> Result<Self, IoLoopError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let (sender, receiver) = mpsc::channel();
        let stop_requested = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            poll,
            commands: receiver,
            resources: HashMap::new(),
            stop_requested: Arc::clone(&stop_requested),
        };

        info!("Starting subprocess read thread");
        let thread = thread::Builder::new()
            .name("io-reader".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            commands: Mutex::new(sender),
            waker,
            stop_requested,
            next_id: AtomicUsize::new(1),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Hands `resource` over to the loop. It is polled from the next cycle on.
    pub fn register(&self, resource: Box<dyn Selectable>) -> ResourceId {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("Registering <{}> as {id}", resource.name());
        self.submit(Command::Register(id, resource));
        id
    }

    /// Schedules an explicit close of a registered resource.
    pub fn close(&self, id: ResourceId) {
        self.submit(Command::Close(id));
    }

    /// Stops the loop thread and closes every resource still registered.
    /// Safe to call more than once.
    pub fn stop(&self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(thread) = thread else {
            return;
        };

        info!("Stopping subprocess read thread");
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wake();

        let resources = match thread.join() {
            Ok(resources) => resources,
            Err(_) => {
                error!("Subprocess read thread panicked");
                HashMap::new()
            }
        };

        for (id, mut resource) in resources {
            debug!("Closing <{}> ({id}) on shutdown", resource.name());
            resource.close();
        }
        info!("Stopped subprocess read thread");
    }

    fn submit(&self, command: Command) {
        let sent = self
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(command);
        match sent {
            Ok(()) => self.wake(),
            Err(mpsc::SendError(command)) => {
                warn!("Subprocess read thread is not running, closing immediately");
                if let Command::Register(_, mut resource) = command {
                    resource.close();
                }
            }
        }
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            error!("Failed to wake subprocess read thread: {e}");
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    poll: Poll,
    commands: Receiver<Command>,
    resources: Resources,
    stop_requested: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self) -> Resources {
        let mut events = Events::with_capacity(64);

        while !self.stop_requested.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("Readiness wait failed: {e}");
                break;
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                self.dispatch(ResourceId(event.token().0));
            }
            self.apply_commands();
            self.clean_closed();
        }

        self.apply_registrations_only();
        self.resources
    }

    fn dispatch(&mut self, id: ResourceId) {
        let Some(resource) = self.resources.get_mut(&id) else {
            warn!("Processing of non-existing resource {id}");
            return;
        };
        if !resource.is_closed() {
            resource.read();
        }
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Register(id, resource) => self.attach(id, resource),
                Command::Close(id) => self.detach(id),
            }
        }
    }

    /// On shutdown only take ownership of queued resources so they get closed.
    fn apply_registrations_only(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Register(id, resource) = command {
                self.resources.insert(id, resource);
            }
        }
    }

    fn attach(&mut self, id: ResourceId, mut resource: Box<dyn Selectable>) {
        let name = resource.name().to_string();
        let registered = match resource.source() {
            Some(source) => self
                .poll
                .registry()
                .register(source, Token(id.0), Interest::READABLE),
            None => {
                debug!("<{name}> was closed before registration");
                return;
            }
        };
        if let Err(e) = registered {
            error!("Failed to register <{name}>: {e}");
            resource.close();
            return;
        }
        // Data may already be waiting; edge-triggered readiness would not report it.
        resource.read();
        self.resources.insert(id, resource);
    }

    fn detach(&mut self, id: ResourceId) {
        let Some(mut resource) = self.resources.remove(&id) else {
            debug!("Close requested for resource {id} which is already gone");
            return;
        };
        self.deregister(resource.as_mut());
        resource.close();
    }

    fn clean_closed(&mut self) {
        let closed: Vec<ResourceId> = self
            .resources
            .iter()
            .filter(|(_, resource)| resource.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            if let Some(resource) = self.resources.remove(&id) {
                debug!("Dropping closed <{}> ({id})", resource.name());
            }
        }
    }

    fn deregister(&self, resource: &mut dyn Selectable) {
        let name = resource.name().to_string();
        if let Some(source) = resource.source() {
            if let Err(e) = self.poll.registry().deregister(source) {
                debug!("Failed to deregister <{name}>: {e}");
            }
        }
    }
}
