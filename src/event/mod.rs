//! Event registrations.
//!
//! [`Event`] is the owned handle: independent of its creation site,
//! movable, removed on drop. [`InlineEvent`] embeds the same handle as
//! a default-empty member so a struct can reserve the storage up front
//! and attach the registration later with `create*`.
//!
//! Both hold a weak reference to their queue. Using a handle after its
//! queue was dropped is a programming error and panics; dropping a
//! handle after the queue is gone is fine.

mod flags;

pub use flags::EventFlags;

use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::callback::{GenericHandler, TimerHandler};
use crate::error::Result;
use crate::queue::{Core, EventQueue, Registration, SlotId};

/// An owned registration on an [`EventQueue`].
pub struct Event {
    core: Weak<Core>,
    id: SlotId,
}

impl Event {
    /// An fd event. `flags` selects READ/WRITE plus PERSIST and EDGE.
    pub fn new(queue: &EventQueue, fd: RawFd, flags: EventFlags, handler: GenericHandler) -> Self {
        assert!(fd >= 0, "negative fd");
        let flags = flags
            & (EventFlags::READ
                | EventFlags::WRITE
                | EventFlags::PERSIST
                | EventFlags::EDGE
                | EventFlags::CLOSED);
        Self::register(queue.core(), Registration::new(Some(fd), None, flags, handler.0))
    }

    /// A pure timer. `flags` may carry PERSIST for a periodic timer.
    pub fn new_timer(queue: &EventQueue, flags: EventFlags, handler: TimerHandler) -> Self {
        let flags = (flags & EventFlags::PERSIST) | EventFlags::TIMEOUT;
        Self::register(queue.core(), Registration::new(None, None, flags, handler.0))
    }

    /// A signal watcher. Signal events are implicitly persistent.
    pub fn new_signal(queue: &EventQueue, signum: i32, handler: GenericHandler) -> Self {
        let flags = EventFlags::SIGNAL | EventFlags::PERSIST;
        Self::register(
            queue.core(),
            Registration::new(None, Some(signum), flags, handler.0),
        )
    }

    fn register(core: &Rc<Core>, reg: Registration) -> Self {
        let id = core.insert(reg);
        Self {
            core: Rc::downgrade(core),
            id,
        }
    }

    fn core(&self) -> Rc<Core> {
        self.core
            .upgrade()
            .expect("event used after its queue was dropped")
    }

    /// Arm without a timeout. Arming an armed event is an idempotent
    /// re-arm.
    pub fn add(&self) -> Result<()> {
        self.core().arm(self.id, None)
    }

    /// Arm with a timeout, (re)starting the deadline from now.
    pub fn add_timeout(&self, timeout: Duration) -> Result<()> {
        self.core().arm(self.id, Some(timeout))
    }

    /// Disarm. Harmless on an event that is not armed.
    pub fn remove(&self) {
        self.core().disarm(self.id);
    }

    /// The fd this registration watches, if any.
    pub fn fd(&self) -> Option<RawFd> {
        self.core().slot_fd(self.id)
    }

    pub fn flags(&self) -> EventFlags {
        self.core().slot_flags(self.id)
    }

    /// Which of `mask` the event is currently armed for.
    pub fn pending(&self, mask: EventFlags) -> bool {
        !self.core().pending(self.id, mask).is_empty()
    }

    /// Time until the pending deadline, if one is set.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.core().time_remaining(self.id)
    }

    /// Queue the callback by hand with the given flags, bypassing the
    /// armed state.
    pub fn active(&self, what: EventFlags) {
        self.core().activate(self.id, what);
    }

    /// Move the event to a priority level.
    ///
    /// # Panics
    ///
    /// When `priority` is outside the queue's configured levels.
    pub fn set_priority(&self, priority: usize) {
        self.core().set_priority(self.id, priority);
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // queue already gone: nothing left to unregister
        if let Some(core) = self.core.upgrade() {
            core.remove_slot(self.id);
        }
    }
}

/// A default-empty event slot for embedding in structs.
///
/// `Default::default()` allocates nothing and registers nothing; the
/// registration is attached later with one of the `create*` methods.
/// Dropping or [`remove`](Self::remove)-ing a never-created slot is a
/// no-op. Creating twice without [`clear`](Self::clear) panics.
#[derive(Default)]
pub struct InlineEvent {
    inner: Option<Event>,
}

impl InlineEvent {
    pub const fn empty() -> Self {
        Self { inner: None }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    pub fn create(
        &mut self,
        queue: &EventQueue,
        fd: RawFd,
        flags: EventFlags,
        handler: GenericHandler,
    ) {
        self.attach(Event::new(queue, fd, flags, handler));
    }

    pub fn create_timer(&mut self, queue: &EventQueue, flags: EventFlags, handler: TimerHandler) {
        self.attach(Event::new_timer(queue, flags, handler));
    }

    pub fn create_signal(&mut self, queue: &EventQueue, signum: i32, handler: GenericHandler) {
        self.attach(Event::new_signal(queue, signum, handler));
    }

    fn attach(&mut self, ev: Event) {
        assert!(
            self.inner.is_none(),
            "inline event created twice without clear()"
        );
        self.inner = Some(ev);
    }

    /// Disarm and detach the registration, returning the slot to its
    /// empty state.
    pub fn clear(&mut self) {
        self.inner = None;
    }

    /// Disarm if created; no-op otherwise.
    pub fn remove(&self) {
        if let Some(ev) = &self.inner {
            ev.remove();
        }
    }

    /// Access the created event.
    ///
    /// # Panics
    ///
    /// When the slot is still empty.
    pub fn get(&self) -> &Event {
        self.inner.as_ref().expect("inline event not created")
    }
}
