//! Asynchronous hostname resolution.
//!
//! Lookups run on a small worker pool; completions travel back to the
//! queue thread through a self-pipe, so continuations stay `!Send` and
//! run where every other callback runs. The pipe registration is armed
//! only while requests are in flight, keeping an idle resolver from
//! pinning the dispatch loop open.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::callback::{guard, Handler};
use crate::error::{Error, Result, DNS_ERR_NOTEXIST, DNS_ERR_SHUTDOWN, DNS_ERR_TIMEOUT};
use crate::event::EventFlags;
use crate::queue::{Core, EventQueue, Registration, SlotId};

const WORKERS: usize = 2;

/// Address family filter for [`pick_addr`] and
/// [`connect_hostname`](crate::bufev::BufferEventRef::connect_hostname).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Unspec,
    Inet4,
    Inet6,
}

impl Family {
    fn matches(self, ip: &IpAddr) -> bool {
        match self {
            Family::Unspec => true,
            Family::Inet4 => ip.is_ipv4(),
            Family::Inet6 => ip.is_ipv6(),
        }
    }
}

/// First resolved address matching `family`, combined with `port`.
pub fn pick_addr(addrs: &[IpAddr], family: Family, port: u16) -> Option<SocketAddr> {
    addrs
        .iter()
        .find(|ip| family.matches(ip))
        .map(|ip| SocketAddr::new(*ip, port))
}

/// Outcome of one lookup: addresses, or a DNS_ERR_* code.
pub type Lookup = std::result::Result<Vec<IpAddr>, i32>;

type Continuation = Box<dyn FnOnce(Lookup)>;

struct Job {
    id: u64,
    host: String,
}

struct DnsShared {
    results: Mutex<Vec<(u64, Lookup)>>,
    write_fd: OwnedFd,
}

struct Pending {
    continuations: HashMap<u64, Continuation>,
    next_id: u64,
}

/// Handle to the resolver. Dropping it stops the workers and completes
/// every in-flight request with [`DNS_ERR_SHUTDOWN`].
pub struct Dns {
    pending: Rc<RefCell<Pending>>,
    shared: Arc<DnsShared>,
    jobs: Option<mpsc::Sender<Job>>,
    core: Weak<Core>,
    slot: SlotId,
    timeout: Cell<Option<Duration>>,
    _read_fd: OwnedFd,
}

impl Dns {
    pub fn new(queue: &EventQueue) -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(Error::init("dns pipe", io::Error::last_os_error()));
        }
        let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        let shared = Arc::new(DnsShared {
            results: Mutex::new(Vec::new()),
            write_fd,
        });

        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..WORKERS {
            let rx = rx.clone();
            let shared = shared.clone();
            thread::spawn(move || worker(rx, shared));
        }

        let pending = Rc::new(RefCell::new(Pending {
            continuations: HashMap::new(),
            next_id: 1,
        }));

        let core = queue.core().clone();
        // the slot id is not known until the registration is inserted,
        // but the handler needs it to disarm itself when idle
        let slot_cell = Rc::new(Cell::new(0 as SlotId));
        let handler = {
            let pending = pending.clone();
            let shared = shared.clone();
            let weak_core = Rc::downgrade(&core);
            let slot_cell = slot_cell.clone();
            Handler::from_mut(move |fd, _| {
                if let Some(fd) = fd {
                    drain_pipe(fd);
                }
                deliver(&pending, &shared);
                if pending.borrow().continuations.is_empty() {
                    if let Some(core) = weak_core.upgrade() {
                        core.disarm(slot_cell.get());
                    }
                }
            })
        };
        let slot = core.insert(Registration::new(
            Some(read_fd.as_raw_fd()),
            None,
            EventFlags::READ | EventFlags::PERSIST,
            handler,
        ));
        slot_cell.set(slot);

        Ok(Self {
            pending,
            shared,
            jobs: Some(tx),
            core: Rc::downgrade(&core),
            slot,
            timeout: Cell::new(None),
            _read_fd: read_fd,
        })
    }

    /// Cap every subsequent lookup at `limit`. A request past the cap
    /// completes with [`DNS_ERR_TIMEOUT`]; a worker answer arriving
    /// later is discarded.
    pub fn set_timeout(&self, limit: Option<Duration>) {
        self.timeout.set(limit);
    }

    /// Resolve `host`, calling `f` on the queue thread when done.
    pub fn resolve<F>(&self, host: &str, f: F) -> Result<()>
    where
        F: FnOnce(Lookup) + 'static,
    {
        let core = self
            .core
            .upgrade()
            .expect("resolver used after its queue was dropped");

        let id = {
            let mut pending = self.pending.borrow_mut();
            let id = pending.next_id;
            pending.next_id += 1;
            pending.continuations.insert(id, Box::new(f));
            id
        };

        // keep the loop alive while a request is in flight
        if let Err(e) = core.arm(self.slot, None) {
            self.pending.borrow_mut().continuations.remove(&id);
            return Err(e);
        }

        let sent = self
            .jobs
            .as_ref()
            .expect("resolver already shut down")
            .send(Job {
                id,
                host: host.to_owned(),
            });
        if sent.is_err() {
            self.pending.borrow_mut().continuations.remove(&id);
            return Err(Error::dns(DNS_ERR_SHUTDOWN));
        }

        if let Some(limit) = self.timeout.get() {
            let pending = self.pending.clone();
            let weak = self.core.clone();
            let slot = self.slot;
            let watchdog = Handler::from_once(move |_, _| {
                let f = pending.borrow_mut().continuations.remove(&id);
                if let Some(f) = f {
                    guard("dns timeout", || f(Err(DNS_ERR_TIMEOUT)));
                    if pending.borrow().continuations.is_empty() {
                        if let Some(core) = weak.upgrade() {
                            core.disarm(slot);
                        }
                    }
                }
            });
            // internal: a finished lookup must not leave the loop
            // pinned open until the watchdog expires
            let timer = core.insert(
                Registration::new(None, None, EventFlags::TIMEOUT, watchdog)
                    .transient()
                    .internal(),
            );
            if let Err(e) = core.arm(timer, Some(limit)) {
                log::warn!("arming dns timeout failed: {}", e);
                core.remove_slot(timer);
            }
        }
        Ok(())
    }

    /// Requests still waiting for an answer.
    pub fn in_flight(&self) -> usize {
        self.pending.borrow().continuations.len()
    }
}

impl Drop for Dns {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(core) = self.core.upgrade() {
            core.remove_slot(self.slot);
        }

        let leftovers: Vec<Continuation> = {
            let mut pending = self.pending.borrow_mut();
            pending.continuations.drain().map(|(_, f)| f).collect()
        };
        for f in leftovers {
            guard("dns shutdown", || f(Err(DNS_ERR_SHUTDOWN)));
        }
    }
}

fn worker(rx: Arc<Mutex<mpsc::Receiver<Job>>>, shared: Arc<DnsShared>) {
    loop {
        let job = match rx.lock().unwrap().recv() {
            Ok(job) => job,
            Err(_) => return,
        };

        let lookup = match (job.host.as_str(), 0u16).to_socket_addrs() {
            Ok(addrs) => {
                let ips: Vec<IpAddr> = addrs.map(|sa| sa.ip()).collect();
                if ips.is_empty() {
                    Err(DNS_ERR_NOTEXIST)
                } else {
                    Ok(ips)
                }
            }
            Err(_) => Err(DNS_ERR_NOTEXIST),
        };

        shared.results.lock().unwrap().push((job.id, lookup));
        let byte = 1u8;
        unsafe {
            libc::write(
                shared.write_fd.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            );
        }
    }
}

fn drain_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

fn deliver(pending: &Rc<RefCell<Pending>>, shared: &Arc<DnsShared>) {
    let done: Vec<(u64, Lookup)> = {
        let mut results = shared.results.lock().unwrap();
        results.drain(..).collect()
    };

    let mut ready: Vec<(Continuation, Lookup)> = Vec::new();
    {
        let mut p = pending.borrow_mut();
        for (id, lookup) in done {
            if let Some(f) = p.continuations.remove(&id) {
                ready.push((f, lookup));
            }
        }
    }
    for (f, lookup) in ready {
        guard("dns completion", || f(lookup));
    }
}
