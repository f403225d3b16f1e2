//! Frame adapter.
//!
//! Glue between a [`FrameEngine`] and a buffered socket. After every
//! engine interaction the transport state must be reconciled exactly
//! once: pending outbox bytes move into the output buffer, and the
//! enabled directions are recomputed from what the engine wants, never
//! accumulated.

use crate::bufev::BufferEventRef;
use crate::event::EventFlags;

use super::engine::FrameEngine;

/// Reconcile transport interest with engine state. READ is enabled iff
/// the engine still expects inbound frames, WRITE iff bytes are
/// pending. Anything else deadlocks (a stale READ) or spins (a stale
/// WRITE on an idle socket).
pub(crate) fn io_update(bev: &BufferEventRef, engine: &mut FrameEngine) {
    if engine.wants_write() {
        bev.write(&engine.take_output());
    }

    let mut enable = EventFlags::NONE;
    let mut disable = EventFlags::NONE;

    if engine.wants_read() {
        enable |= EventFlags::READ;
    } else {
        disable |= EventFlags::READ;
    }
    if bev.output_len() > 0 {
        enable |= EventFlags::WRITE;
    } else {
        disable |= EventFlags::WRITE;
    }

    if !enable.is_empty() {
        bev.enable(enable);
    }
    if !disable.is_empty() {
        bev.disable(disable);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bufev::BufferEvent;
    use crate::frame::OpCode;
    use crate::queue::EventQueue;

    #[test]
    fn interest_follows_engine_state() {
        let queue = EventQueue::new().unwrap();
        let bev = BufferEvent::new(&queue);
        let href = bev.as_ref();
        let mut engine = FrameEngine::new();

        // nothing to send, frames still expected: READ stays on and
        // the default WRITE goes away
        io_update(&href, &mut engine);
        assert_eq!(href.enabled(), EventFlags::READ);

        // queued output turns WRITE back on
        engine.queue_msg(OpCode::Text, b"hi");
        io_update(&href, &mut engine);
        assert!(href.enabled().contains(EventFlags::READ));
        assert!(href.enabled().contains(EventFlags::WRITE));
        assert!(href.output_len() > 0);
        assert!(!engine.wants_write(), "outbox moved to the transport");
    }
}
