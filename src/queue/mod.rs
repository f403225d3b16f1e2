//! Event queue.
//!
//! A single-threaded reactor: registrations for fd readiness, timeouts
//! and posix signals are armed on the queue, and [`EventQueue::dispatch`]
//! runs their callbacks on the dispatching thread until no armed
//! registration remains or the loop is broken.
//!
//! The queue is not `Send`. The only cross-thread surface is [`Waker`],
//! handed out by [`EventQueue::waker`] when the queue was built with
//! [`QueueConfig::enable_threads`]: other threads may wake the loop,
//! break it, or inject a closure to run on the queue's thread.
//!
//! Internally one poller registration exists per fd, carrying the union
//! of interest over all armed registrations on that fd. Interest is
//! recomputed lazily: mutations mark the fd dirty and the set is flushed
//! right before each poller wait.

mod poll;
mod signal;
mod timer;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use polling::{Events, Poller};

use crate::callback::{guard, Handler, PanicPayload};
use crate::error::{Error, Result};
use crate::event::EventFlags;

use poll::{Interest, Mux};
use signal::Relay;
use timer::TimerHeap;

pub(crate) type SlotId = u64;

/// Flags controlling one [`EventQueue::run_loop`] invocation.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct LoopFlags(u8);

impl LoopFlags {
    pub const NONE: Self = Self(0);
    /// Return after the first batch of callbacks has run.
    pub const ONCE: Self = Self(0x01);
    /// Poll without blocking, run what is ready, return.
    pub const NONBLOCK: Self = Self(0x02);
    /// Keep looping even when no registration is armed.
    pub const NO_EXIT_ON_EMPTY: Self = Self(0x04);

    #[inline]
    pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }
}

impl std::ops::BitOr for LoopFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
}

/// Builder for an [`EventQueue`].
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    n_priorities: usize,
    threads: bool,
}

impl Default for QueueConfig {
    fn default() -> Self { Self::new() }
}

impl QueueConfig {
    pub const fn new() -> Self {
        Self {
            n_priorities: 1,
            threads: false,
        }
    }

    /// Number of priority levels, `1..=256`. Lower numbers run first.
    pub fn priorities(mut self, n: usize) -> Self {
        assert!((1..=256).contains(&n), "priority levels must be 1..=256");
        self.n_priorities = n;
        self
    }

    /// Allow cross-thread use through [`EventQueue::waker`].
    pub const fn enable_threads(mut self) -> Self {
        self.threads = true;
        self
    }

    pub fn build(self) -> Result<EventQueue> {
        let mux = Mux::new().map_err(|e| Error::init("event queue", e))?;
        let poller = mux.poller();
        Ok(EventQueue {
            core: Rc::new(Core {
                mux,
                slots: RefCell::new(HashMap::new()),
                next_slot: Cell::new(1),
                fds: RefCell::new(HashMap::new()),
                dirty: RefCell::new(HashSet::new()),
                timers: RefCell::new(TimerHeap::new()),
                ready: RefCell::new((0..self.n_priorities).map(|_| VecDeque::new()).collect()),
                relay: RefCell::new(None),
                signal_slots: RefCell::new(HashMap::new()),
                armed: Cell::new(0),
                armed_internal: Cell::new(0),
                shared: Arc::new(Shared {
                    poller,
                    injected: Mutex::new(VecDeque::new()),
                    brk: AtomicBool::new(false),
                    alive: AtomicBool::new(true),
                }),
                brk: Cell::new(false),
                got_break: Cell::new(false),
                dispatching: Cell::new(false),
                sink: RefCell::new(None),
                n_priorities: self.n_priorities,
                threads: self.threads,
                now: Cell::new(Instant::now()),
            }),
        })
    }
}

pub(crate) struct Registration {
    pub(crate) fd: Option<RawFd>,
    pub(crate) signal: Option<i32>,
    pub(crate) flags: EventFlags,
    pub(crate) handler: Handler,
    pub(crate) priority: usize,
    /// Remove the slot entirely after its callback ran.
    pub(crate) transient: bool,
    /// Queue plumbing, not user work: does not keep the loop alive.
    pub(crate) internal: bool,
    armed: bool,
    /// Timeout passed at the last arm, reused by persistent reschedule.
    period: Option<Duration>,
    deadline: Option<Instant>,
    timer_gen: u64,
}

impl Registration {
    pub(crate) fn new(
        fd: Option<RawFd>,
        signal: Option<i32>,
        flags: EventFlags,
        handler: Handler,
    ) -> Self {
        Self {
            fd,
            signal,
            flags,
            handler,
            priority: 0,
            transient: false,
            internal: false,
            armed: false,
            period: None,
            deadline: None,
            timer_gen: 0,
        }
    }

    pub(crate) fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub(crate) fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

struct FdEntry {
    slots: Vec<SlotId>,
    registered: bool,
    edge: bool,
}

impl FdEntry {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            registered: false,
            edge: false,
        }
    }
}

enum Ready {
    Slot { id: SlotId, what: EventFlags },
    Task(Box<dyn FnOnce()>),
}

/// State shared with [`Waker`] handles on other threads.
pub(crate) struct Shared {
    poller: Arc<Poller>,
    injected: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    brk: AtomicBool,
    alive: AtomicBool,
}

pub(crate) struct Core {
    mux: Mux,
    slots: RefCell<HashMap<SlotId, Registration>>,
    next_slot: Cell<SlotId>,
    fds: RefCell<HashMap<RawFd, FdEntry>>,
    dirty: RefCell<HashSet<RawFd>>,
    timers: RefCell<TimerHeap>,
    /// One ready queue per priority level, drained in ascending order.
    ready: RefCell<Vec<VecDeque<Ready>>>,
    relay: RefCell<Option<Relay>>,
    signal_slots: RefCell<HashMap<i32, Vec<SlotId>>>,
    armed: Cell<usize>,
    armed_internal: Cell<usize>,
    shared: Arc<Shared>,
    brk: Cell<bool>,
    got_break: Cell<bool>,
    dispatching: Cell<bool>,
    sink: RefCell<Option<Box<dyn Fn(PanicPayload)>>>,
    n_priorities: usize,
    threads: bool,
    now: Cell<Instant>,
}

impl Core {
    pub(crate) fn insert(&self, reg: Registration) -> SlotId {
        let id = self.next_slot.get();
        self.next_slot.set(id + 1);
        self.slots.borrow_mut().insert(id, reg);
        id
    }

    pub(crate) fn remove_slot(&self, id: SlotId) {
        self.disarm(id);
        self.slots.borrow_mut().remove(&id);
    }

    /// Arm a registration, resetting its deadline to `timeout` from now
    /// (or clearing it when `None`). Arming an armed registration is a
    /// deadline reset, not an error.
    pub(crate) fn arm(&self, id: SlotId, timeout: Option<Duration>) -> Result<()> {
        let mut slots = self.slots.borrow_mut();
        let reg = slots.get_mut(&id).expect("registration removed from its queue");

        if !reg.armed {
            reg.armed = true;
            self.armed.set(self.armed.get() + 1);
            if reg.internal {
                self.armed_internal.set(self.armed_internal.get() + 1);
            }

            if let Some(fd) = reg.fd {
                let mut fds = self.fds.borrow_mut();
                let entry = fds.entry(fd).or_insert_with(FdEntry::new);
                if !entry.slots.contains(&id) {
                    entry.slots.push(id);
                }
                drop(fds);
                self.dirty.borrow_mut().insert(fd);
            }

            if let Some(sig) = reg.signal {
                if let Err(e) = self.arm_signal(sig, id) {
                    reg.armed = false;
                    self.armed.set(self.armed.get() - 1);
                    if reg.internal {
                        self.armed_internal.set(self.armed_internal.get() - 1);
                    }
                    return Err(e);
                }
            }
        } else if let Some(fd) = reg.fd {
            self.dirty.borrow_mut().insert(fd);
        }

        reg.period = timeout;
        match timeout {
            Some(t) => {
                let deadline = Instant::now() + t;
                reg.deadline = Some(deadline);
                reg.timer_gen = self.timers.borrow_mut().insert(deadline, id);
            }
            None => {
                reg.deadline = None;
                reg.timer_gen = 0;
            }
        }
        Ok(())
    }

    pub(crate) fn disarm(&self, id: SlotId) {
        let mut slots = self.slots.borrow_mut();
        if let Some(reg) = slots.get_mut(&id) {
            self.disarm_inner(id, reg);
        }
    }

    // Must not touch self.slots: callers hold that borrow.
    fn disarm_inner(&self, id: SlotId, reg: &mut Registration) {
        if !reg.armed {
            return;
        }
        reg.armed = false;
        self.armed.set(self.armed.get() - 1);
        if reg.internal {
            self.armed_internal.set(self.armed_internal.get() - 1);
        }
        reg.deadline = None;
        reg.timer_gen = 0;

        if let Some(fd) = reg.fd {
            if let Some(entry) = self.fds.borrow_mut().get_mut(&fd) {
                entry.slots.retain(|s| *s != id);
            }
            self.dirty.borrow_mut().insert(fd);
        }

        if let Some(sig) = reg.signal {
            let mut map = self.signal_slots.borrow_mut();
            if let Some(ids) = map.get_mut(&sig) {
                ids.retain(|s| *s != id);
                if ids.is_empty() {
                    map.remove(&sig);
                    if let Some(relay) = &*self.relay.borrow() {
                        relay.uninstall(sig);
                    }
                }
            }
        }
    }

    fn arm_signal(&self, sig: i32, id: SlotId) -> Result<()> {
        {
            let mut map = self.signal_slots.borrow_mut();
            let ids = map.entry(sig).or_default();
            let first = ids.is_empty();
            if !ids.contains(&id) {
                ids.push(id);
            }
            if !first {
                return Ok(());
            }
        }

        let mut relay = self.relay.borrow_mut();
        if relay.is_none() {
            let r = Relay::new().map_err(|e| Error::init("signal relay", e))?;
            self.mux
                .arm(
                    r.read_fd(),
                    Interest {
                        read: true,
                        write: false,
                        edge: false,
                    },
                    false,
                )
                .map_err(|e| Error::init("signal relay", e))?;
            *relay = Some(r);
        }

        if let Err(e) = relay.as_ref().unwrap().install(sig) {
            self.signal_slots.borrow_mut().remove(&sig);
            return Err(Error::io("sigaction", e));
        }
        Ok(())
    }

    /// Queue a callback run without touching the armed state. This is
    /// the manual-activation path.
    pub(crate) fn activate(&self, id: SlotId, what: EventFlags) {
        let priority = match self.slots.borrow().get(&id) {
            Some(reg) => reg.priority,
            None => return,
        };
        self.ready.borrow_mut()[priority].push_back(Ready::Slot { id, what });
    }

    /// Deliver a firing: disarm non-persistent registrations, reset the
    /// deadline of persistent ones, then queue the callback.
    fn fire(&self, id: SlotId, what: EventFlags) {
        let priority = {
            let mut slots = self.slots.borrow_mut();
            let Some(reg) = slots.get_mut(&id) else { return };
            if !reg.armed {
                return;
            }
            if reg.flags.contains(EventFlags::PERSIST) {
                if let Some(period) = reg.period {
                    let deadline = self.now.get() + period;
                    reg.deadline = Some(deadline);
                    reg.timer_gen = self.timers.borrow_mut().insert(deadline, id);
                }
            } else {
                self.disarm_inner(id, reg);
            }
            reg.priority
        };
        self.ready.borrow_mut()[priority].push_back(Ready::Slot { id, what });
    }

    /// Run `f` on the next dispatch iteration, before polling.
    pub(crate) fn defer_local(&self, f: Box<dyn FnOnce()>) {
        self.ready.borrow_mut()[0].push_back(Ready::Task(f));
    }

    /// Restrict which of READ/WRITE a registration's fd interest
    /// carries, leaving the other flags alone.
    pub(crate) fn set_io_interest(&self, id: SlotId, read: bool, write: bool) {
        let mut slots = self.slots.borrow_mut();
        let Some(reg) = slots.get_mut(&id) else { return };

        let mut flags = reg.flags.without(EventFlags::READ | EventFlags::WRITE);
        if read {
            flags |= EventFlags::READ;
        }
        if write {
            flags |= EventFlags::WRITE;
        }
        reg.flags = flags;

        if reg.armed {
            if let Some(fd) = reg.fd {
                self.dirty.borrow_mut().insert(fd);
            }
        }
    }

    pub(crate) fn pending(&self, id: SlotId, mask: EventFlags) -> EventFlags {
        let slots = self.slots.borrow();
        let Some(reg) = slots.get(&id) else {
            return EventFlags::NONE;
        };
        let mut out = EventFlags::NONE;
        if reg.armed {
            out |= reg.flags & (EventFlags::READ | EventFlags::WRITE | EventFlags::SIGNAL);
            if reg.deadline.is_some() {
                out |= EventFlags::TIMEOUT;
            }
        }
        out & mask
    }

    pub(crate) fn slot_fd(&self, id: SlotId) -> Option<RawFd> {
        self.slots.borrow().get(&id).and_then(|reg| reg.fd)
    }

    pub(crate) fn slot_flags(&self, id: SlotId) -> EventFlags {
        self.slots
            .borrow()
            .get(&id)
            .map(|reg| reg.flags)
            .unwrap_or(EventFlags::NONE)
    }

    pub(crate) fn time_remaining(&self, id: SlotId) -> Option<Duration> {
        self.slots
            .borrow()
            .get(&id)
            .and_then(|reg| reg.deadline)
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn set_priority(&self, id: SlotId, priority: usize) {
        assert!(
            priority < self.n_priorities,
            "priority {} out of range (queue has {} levels)",
            priority,
            self.n_priorities
        );
        if let Some(reg) = self.slots.borrow_mut().get_mut(&id) {
            reg.priority = priority;
        }
    }

    pub(crate) fn report(&self, payload: PanicPayload) {
        match &*self.sink.borrow() {
            Some(sink) => sink(payload),
            None => log::error!("deferred-task failure discarded, no error sink installed"),
        }
    }

    pub(crate) fn set_break(&self) {
        self.brk.set(true);
    }

    // Internal registrations (break timers, resolver watchdogs) never
    // keep the loop alive on their own.
    fn no_events(&self) -> bool {
        self.armed.get() == self.armed_internal.get()
            && self.ready.borrow().iter().all(|q| q.is_empty())
            && self.shared.injected.lock().unwrap().is_empty()
    }

    fn drain_injected(&self) {
        if self.shared.brk.swap(false, Ordering::AcqRel) {
            self.brk.set(true);
        }
        let tasks: Vec<_> = {
            let mut injected = self.shared.injected.lock().unwrap();
            injected.drain(..).collect()
        };
        if !tasks.is_empty() {
            let mut ready = self.ready.borrow_mut();
            for task in tasks {
                ready[0].push_back(Ready::Task(task));
            }
        }
    }

    fn expire_timers(&self) {
        let now = self.now.get();
        let expired = self.timers.borrow_mut().pop_expired(now);
        for (id, gen) in expired {
            let fired = {
                let mut slots = self.slots.borrow_mut();
                match slots.get_mut(&id) {
                    Some(reg) if reg.armed && reg.timer_gen == gen => {
                        if reg.flags.contains(EventFlags::PERSIST) {
                            match reg.period {
                                Some(period) => {
                                    let deadline = now + period;
                                    reg.deadline = Some(deadline);
                                    reg.timer_gen =
                                        self.timers.borrow_mut().insert(deadline, id);
                                }
                                None => {
                                    reg.deadline = None;
                                    reg.timer_gen = 0;
                                }
                            }
                        } else {
                            self.disarm_inner(id, reg);
                        }
                        true
                    }
                    // stale heap entry, deadline was reset or removed
                    _ => false,
                }
            };
            if fired {
                self.activate(id, EventFlags::TIMEOUT);
            }
        }
    }

    /// Push pending interest changes down to the poller.
    fn flush_dirty(&self) -> Result<()> {
        let dirty: Vec<RawFd> = self.dirty.borrow_mut().drain().collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let mut fds = self.fds.borrow_mut();
        let slots = self.slots.borrow();
        for fd in dirty {
            let Some(entry) = fds.get_mut(&fd) else { continue };
            entry.slots.retain(|id| slots.contains_key(id));

            if entry.slots.is_empty() {
                if entry.registered {
                    self.mux.remove(fd);
                }
                fds.remove(&fd);
                continue;
            }

            let mut interest = Interest::NONE;
            for id in &entry.slots {
                let reg = &slots[id];
                if !reg.armed {
                    continue;
                }
                if reg.flags.contains(EventFlags::READ) {
                    interest.read = true;
                }
                if reg.flags.contains(EventFlags::WRITE) {
                    interest.write = true;
                }
                if reg.flags.contains(EventFlags::EDGE) {
                    interest.edge = true;
                }
            }

            self.mux
                .arm(fd, interest, entry.registered)
                .map_err(|e| Error::io("update fd interest", e))?;
            entry.registered = true;
            entry.edge = interest.edge;
        }
        Ok(())
    }

    fn handle_wakeups(&self, events: &Events) {
        let relay_fd = self.relay.borrow().as_ref().map(|r| r.read_fd());

        for ev in events.iter() {
            if ev.key == usize::MAX {
                // poller notification token
                continue;
            }
            let fd = ev.key as RawFd;

            if Some(fd) == relay_fd {
                self.handle_signals();
                continue;
            }

            let mut fired: Vec<(SlotId, EventFlags)> = Vec::new();
            {
                let mut fds = self.fds.borrow_mut();
                let Some(entry) = fds.get_mut(&fd) else { continue };
                if !entry.edge {
                    // oneshot consumed, rearm before the next wait
                    self.dirty.borrow_mut().insert(fd);
                }
                let slots = self.slots.borrow();
                for id in &entry.slots {
                    let Some(reg) = slots.get(id) else { continue };
                    if !reg.armed {
                        continue;
                    }
                    let mut what = EventFlags::NONE;
                    if ev.readable && reg.flags.contains(EventFlags::READ) {
                        what |= EventFlags::READ;
                    }
                    if ev.writable && reg.flags.contains(EventFlags::WRITE) {
                        what |= EventFlags::WRITE;
                    }
                    if !what.is_empty() {
                        fired.push((*id, what));
                    }
                }
            }
            for (id, what) in fired {
                self.fire(id, what);
            }
        }
    }

    fn handle_signals(&self) {
        let signums = match &*self.relay.borrow() {
            Some(relay) => relay.drain(),
            None => return,
        };

        for sig in signums {
            let ids = match self.signal_slots.borrow().get(&sig) {
                Some(ids) => ids.clone(),
                None => continue,
            };
            for id in ids {
                self.fire(id, EventFlags::SIGNAL);
            }
        }

        // the relay registration is oneshot, rearm it
        if let Some(relay) = &*self.relay.borrow() {
            let rearm = self.mux.arm(
                relay.read_fd(),
                Interest {
                    read: true,
                    write: false,
                    edge: false,
                },
                true,
            );
            if let Err(e) = rearm {
                log::warn!("rearming signal relay failed: {}", e);
            }
        }
    }

    /// Drain one swapped batch of ready callbacks per priority level.
    /// Activations queued by callbacks land in fresh queues and run on
    /// the next iteration. Returns the number of callbacks run.
    fn process_ready(&self) -> usize {
        let mut count = 0;
        let mut batches: Vec<VecDeque<Ready>> = {
            let mut ready = self.ready.borrow_mut();
            ready.iter_mut().map(std::mem::take).collect()
        };

        for (priority, batch) in batches.iter_mut().enumerate() {
            while let Some(item) = batch.pop_front() {
                if self.brk.get() {
                    break;
                }
                match item {
                    Ready::Slot { id, what } => {
                        let info = {
                            let slots = self.slots.borrow();
                            slots
                                .get(&id)
                                .map(|reg| (reg.handler.clone(), reg.fd, reg.transient))
                        };
                        let Some((handler, fd, transient)) = info else { continue };
                        count += 1;
                        handler.invoke(fd, what);
                        if transient {
                            self.remove_slot(id);
                        }
                    }
                    Ready::Task(task) => {
                        count += 1;
                        if let Some(payload) = guard("deferred", task) {
                            self.report(payload);
                        }
                    }
                }
            }

            if !batch.is_empty() {
                // broken mid-batch: requeue the leftovers ahead of
                // anything the callbacks just activated
                let mut ready = self.ready.borrow_mut();
                while let Some(item) = batch.pop_back() {
                    ready[priority].push_front(item);
                }
            }
        }
        count
    }

    fn run(&self, flags: LoopFlags) -> Result<()> {
        assert!(
            !self.dispatching.replace(true),
            "dispatch re-entered from a callback"
        );
        let _guard = DispatchGuard(self);
        self.brk.set(false);
        self.got_break.set(false);

        let mut events = Events::new();
        let mut total_fired = 0usize;
        let mut polled = false;

        loop {
            self.now.set(Instant::now());
            self.drain_injected();
            self.expire_timers();
            total_fired += self.process_ready();

            if self.brk.get() {
                self.got_break.set(true);
                return Ok(());
            }
            if flags.contains(LoopFlags::ONCE) && total_fired > 0 {
                return Ok(());
            }
            if flags.contains(LoopFlags::NONBLOCK) && polled {
                return Ok(());
            }
            if self.no_events() && !flags.contains(LoopFlags::NO_EXIT_ON_EMPTY) {
                return Ok(());
            }

            let more_ready = self.ready.borrow().iter().any(|q| !q.is_empty());
            let timeout = if flags.contains(LoopFlags::NONBLOCK) || more_ready {
                Some(Duration::ZERO)
            } else {
                self.timers
                    .borrow()
                    .next_deadline()
                    .map(|d| d.saturating_duration_since(self.now.get()))
            };

            self.flush_dirty()?;
            self.mux
                .wait(&mut events, timeout)
                .map_err(|e| Error::io("poll", e))?;
            polled = true;
            self.now.set(Instant::now());
            self.handle_wakeups(&events);
        }
    }
}

struct DispatchGuard<'a>(&'a Core);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.dispatching.set(false);
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
        if let Some(relay) = self.relay.get_mut().take() {
            for sig in self.signal_slots.get_mut().keys() {
                relay.uninstall(*sig);
            }
            self.mux.remove(relay.read_fd());
        }
    }
}

/// The reactor. See the [module docs](self).
pub struct EventQueue {
    core: Rc<Core>,
}

impl EventQueue {
    /// A queue with the default configuration: one priority level, no
    /// cross-thread wakers.
    pub fn new() -> Result<Self> {
        QueueConfig::new().build()
    }

    pub fn with_config(config: QueueConfig) -> Result<Self> {
        config.build()
    }

    pub(crate) fn core(&self) -> &Rc<Core> {
        &self.core
    }

    /// Run callbacks until no registration is armed or the loop is
    /// broken. Returns `true` when the loop drained naturally.
    pub fn dispatch(&self) -> Result<bool> {
        self.core.run(LoopFlags::NONE)?;
        Ok(!self.core.got_break.get())
    }

    /// [`dispatch`](Self::dispatch) with explicit loop flags.
    pub fn run_loop(&self, flags: LoopFlags) -> Result<()> {
        self.core.run(flags)
    }

    /// Dispatch, but break the loop after `limit` even if registrations
    /// remain armed. The break timer itself does not keep the loop
    /// alive: a drained queue still returns right away.
    pub fn dispatch_timeout(&self, limit: Duration) -> Result<bool> {
        let weak = Rc::downgrade(&self.core);
        let handler = Handler::from_once(move |_, _| {
            if let Some(core) = weak.upgrade() {
                core.set_break();
            }
        });
        let id = self.core.insert(
            Registration::new(None, None, EventFlags::TIMEOUT, handler)
                .transient()
                .internal(),
        );
        self.core.arm(id, Some(limit))?;
        let out = self.dispatch();
        self.core.remove_slot(id);
        out
    }

    /// Stop the running loop after the current callback returns. Only
    /// meaningful from a callback on this queue; cross-thread breaking
    /// goes through [`Waker::break_loop`].
    pub fn break_loop(&self) {
        self.core.set_break();
    }

    /// Whether the last dispatch ended through a break rather than by
    /// running out of events.
    pub fn stopped(&self) -> bool {
        self.core.got_break.get()
    }

    /// Run `f` once, after `after` (immediately when `None`). The
    /// registration is removed after the callback runs.
    pub fn once<F>(&self, after: Option<Duration>, f: F) -> Result<()>
    where
        F: FnOnce() + 'static,
    {
        let handler = Handler::from_once(move |_, _| f());
        let id = self.core.insert(
            Registration::new(None, None, EventFlags::TIMEOUT, handler).transient(),
        );
        self.core.arm(id, Some(after.unwrap_or(Duration::ZERO)))
    }

    /// Run `f` once when `fd` matches `flags` (READ and/or WRITE), or
    /// when `timeout` expires first. PERSIST is ignored here.
    pub fn once_fd<F>(
        &self,
        fd: RawFd,
        flags: EventFlags,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(RawFd, EventFlags) + 'static,
    {
        let flags = flags.without(EventFlags::PERSIST);
        let handler = Handler::from_once(move |fd, what| f(fd.unwrap_or(-1), what));
        let id = self
            .core
            .insert(Registration::new(Some(fd), None, flags, handler).transient());
        self.core.arm(id, timeout)
    }

    /// Run `f` once on the queue behind `target`, after `after` on this
    /// queue. A panic inside `f` goes to the target queue's error sink;
    /// failure to hand `f` over (the target is gone) is reported to this
    /// queue's sink.
    pub fn once_to<F>(&self, target: &Waker, after: Option<Duration>, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let target = target.clone();
        let weak = Rc::downgrade(&self.core);
        self.once(after, move || {
            if !target.defer(f) {
                if let Some(core) = weak.upgrade() {
                    core.report(Box::new("requeue target queue is gone"));
                }
            }
        })
    }

    /// Receive failures from deferred work: panics out of injected
    /// closures and undeliverable [`once_to`](Self::once_to) handoffs.
    pub fn set_error_sink<F>(&self, sink: F)
    where
        F: Fn(PanicPayload) + 'static,
    {
        *self.core.sink.borrow_mut() = Some(Box::new(sink));
    }

    /// A `Send + Clone` handle for waking, breaking and injecting work
    /// from other threads.
    ///
    /// # Panics
    ///
    /// When the queue was not built with [`QueueConfig::enable_threads`].
    pub fn waker(&self) -> Waker {
        assert!(
            self.core.threads,
            "waker() requires QueueConfig::enable_threads()"
        );
        Waker {
            shared: self.core.shared.clone(),
        }
    }

    /// Number of armed user registrations. Queue plumbing such as the
    /// [`dispatch_timeout`](Self::dispatch_timeout) break timer is not
    /// counted.
    pub fn num_events(&self) -> usize {
        self.core.armed.get() - self.core.armed_internal.get()
    }

    pub fn num_priorities(&self) -> usize {
        self.core.n_priorities
    }

    /// The timestamp taken at the top of the current dispatch
    /// iteration. Cheap, and stable across one callback batch.
    pub fn now_cached(&self) -> Instant {
        self.core.now.get()
    }
}

/// Cross-thread handle to an [`EventQueue`].
#[derive(Clone)]
pub struct Waker {
    shared: Arc<Shared>,
}

impl Waker {
    /// Interrupt a blocking poll.
    pub fn wake(&self) {
        if let Err(e) = self.shared.poller.notify() {
            log::debug!("waker notify failed: {}", e);
        }
    }

    /// Stop the target queue's loop as soon as it notices.
    pub fn break_loop(&self) {
        self.shared.brk.store(true, Ordering::Release);
        self.wake();
    }

    /// Inject `f` to run on the target queue's thread. Returns `false`
    /// when the queue no longer exists; `f` is dropped unexecuted then.
    pub fn defer<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.shared.alive.load(Ordering::Acquire) {
            return false;
        }
        self.shared.injected.lock().unwrap().push_back(Box::new(f));
        self.wake();
        true
    }
}
