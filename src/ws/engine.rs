//! Frame engine.
//!
//! Sans-io websocket framing for the client side: encoded frames pile
//! up in an outbox, raw input is consumed frame by frame. No socket
//! anywhere in this module; the adapter moves bytes.
//!
//! Client frames are masked with a fresh random key each
//! ([RFC-6455 Section 5.3](https://datatracker.ietf.org/doc/html/rfc6455#section-5.3));
//! server frames must arrive unmasked. Pings are answered from here
//! automatically; a received close is echoed once.

use crate::error::FrameError;
use crate::frame::{mask, Fin, FrameHead, Mask, OpCode, PayloadLen};

/// A complete inbound event surfaced to the socket layer.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    Text(Vec<u8>),
    Binary(Vec<u8>),
    Pong(Vec<u8>),
    /// Peer close, with the status code when one was carried.
    Close(Option<u16>),
}

pub(crate) struct FrameEngine {
    partial: Vec<u8>,
    partial_op: Option<OpCode>,
    outbox: Vec<u8>,
    close_sent: bool,
    close_received: bool,
}

impl FrameEngine {
    pub(crate) fn new() -> Self {
        Self {
            partial: Vec::new(),
            partial_op: None,
            outbox: Vec::new(),
            close_sent: false,
            close_received: false,
        }
    }

    pub(crate) fn close_sent(&self) -> bool {
        self.close_sent
    }

    pub(crate) fn close_received(&self) -> bool {
        self.close_received
    }

    /// More inbound frames are expected.
    pub(crate) fn wants_read(&self) -> bool {
        !self.close_received
    }

    /// Encoded frames are waiting in the outbox.
    pub(crate) fn wants_write(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub(crate) fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbox)
    }

    /// Queue one unfragmented data frame.
    pub(crate) fn queue_msg(&mut self, opcode: OpCode, payload: &[u8]) {
        debug_assert!(matches!(opcode, OpCode::Text | OpCode::Binary));
        if self.close_sent {
            log::debug!("message dropped, close already sent");
            return;
        }
        self.queue_frame(opcode, payload);
    }

    pub(crate) fn queue_ping(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= 125);
        if !self.close_sent {
            self.queue_frame(OpCode::Ping, payload);
        }
    }

    /// Queue a close frame. Only the first close goes out.
    pub(crate) fn queue_close(&mut self, code: u16, reason: &[u8]) {
        if self.close_sent {
            return;
        }
        self.close_sent = true;
        let reason = &reason[..reason.len().min(123)];
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason);
        self.queue_frame(OpCode::Close, &payload);
    }

    fn queue_frame(&mut self, opcode: OpCode, payload: &[u8]) {
        let key = mask::new_mask_key();
        let head = FrameHead::new(
            Fin::Y,
            opcode,
            Mask::Key(key),
            PayloadLen::from_num(payload.len() as u64),
        );
        head.encode(&mut self.outbox);
        let beg = self.outbox.len();
        self.outbox.extend_from_slice(payload);
        mask::apply_mask(key, &mut self.outbox[beg..]);
    }

    /// Consume every complete frame in `input`, leaving a trailing
    /// partial frame (if any) in place. Fragmented messages are
    /// reassembled; pings are answered into the outbox.
    pub(crate) fn recv_step(&mut self, input: &mut Vec<u8>) -> Result<Vec<Incoming>, FrameError> {
        let mut out = Vec::new();

        loop {
            let (head, head_len) = match FrameHead::decode(input) {
                Ok(v) => v,
                Err(FrameError::NotEnoughData) => break,
                Err(e) => return Err(e),
            };

            // server-to-client frames are never masked
            if let Mask::Key(_) = head.mask {
                return Err(FrameError::IllegalMask);
            }

            // length is attacker-controlled; compare in u64, never add
            if ((input.len() - head_len) as u64) < head.length.to_num() {
                break;
            }
            let len = head.length.to_num() as usize;
            let payload = input[head_len..head_len + len].to_vec();
            input.drain(..head_len + len);

            match head.opcode {
                OpCode::Text | OpCode::Binary => {
                    if self.partial_op.is_some() {
                        // a new data frame inside an open fragment run
                        return Err(FrameError::IllegalOpCode);
                    }
                    match head.fin {
                        Fin::Y => out.push(data_event(head.opcode, payload)),
                        Fin::N => {
                            self.partial_op = Some(head.opcode);
                            self.partial = payload;
                        }
                    }
                }
                OpCode::Continue => {
                    let Some(op) = self.partial_op else {
                        return Err(FrameError::UnexpectedContinue);
                    };
                    self.partial.extend_from_slice(&payload);
                    if let Fin::Y = head.fin {
                        let whole = std::mem::take(&mut self.partial);
                        self.partial_op = None;
                        out.push(data_event(op, whole));
                    }
                }
                OpCode::Ping => {
                    if !self.close_sent {
                        self.queue_frame(OpCode::Pong, &payload);
                    }
                }
                OpCode::Pong => out.push(Incoming::Pong(payload)),
                OpCode::Close => {
                    self.close_received = true;
                    let code = (payload.len() >= 2)
                        .then(|| u16::from_be_bytes([payload[0], payload[1]]));
                    if !self.close_sent {
                        self.close_sent = true;
                        self.queue_frame(OpCode::Close, &payload);
                    }
                    out.push(Incoming::Close(code));
                    // anything after a close frame is ignored
                    break;
                }
            }
        }
        Ok(out)
    }
}

fn data_event(opcode: OpCode, payload: Vec<u8>) -> Incoming {
    match opcode {
        OpCode::Text => Incoming::Text(payload),
        _ => Incoming::Binary(payload),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // encode an unmasked server frame
    fn server_frame(fin: Fin, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let head = FrameHead::new(
            fin,
            opcode,
            Mask::None,
            PayloadLen::from_num(payload.len() as u64),
        );
        let mut buf = Vec::new();
        head.encode(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn queued_frames_are_masked() {
        let mut engine = FrameEngine::new();
        engine.queue_msg(OpCode::Text, b"hello");

        let out = engine.take_output();
        let (head, n) = FrameHead::decode(&out).unwrap();

        assert_eq!(head.fin, Fin::Y);
        assert_eq!(head.opcode, OpCode::Text);
        assert_eq!(head.length.to_num(), 5);

        let Mask::Key(key) = head.mask else {
            panic!("client frame must be masked")
        };
        let mut payload = out[n..].to_vec();
        mask::apply_mask(key, &mut payload);
        assert_eq!(&payload, b"hello");

        assert!(!engine.wants_write());
    }

    #[test]
    fn recv_single_frame() {
        let mut engine = FrameEngine::new();
        let mut input = server_frame(Fin::Y, OpCode::Text, b"hi");

        let got = engine.recv_step(&mut input).unwrap();
        assert_eq!(got, vec![Incoming::Text(b"hi".to_vec())]);
        assert!(input.is_empty());
    }

    #[test]
    fn recv_partial_then_rest() {
        let mut engine = FrameEngine::new();
        let frame = server_frame(Fin::Y, OpCode::Binary, &[1, 2, 3, 4]);

        let mut input = frame[..3].to_vec();
        assert!(engine.recv_step(&mut input).unwrap().is_empty());
        assert_eq!(input.len(), 3);

        input.extend_from_slice(&frame[3..]);
        let got = engine.recv_step(&mut input).unwrap();
        assert_eq!(got, vec![Incoming::Binary(vec![1, 2, 3, 4])]);
    }

    #[test]
    fn recv_fragmented_message() {
        let mut engine = FrameEngine::new();
        let mut input = server_frame(Fin::N, OpCode::Text, b"he");
        input.extend(server_frame(Fin::N, OpCode::Continue, b"ll"));
        input.extend(server_frame(Fin::Y, OpCode::Continue, b"o"));

        let got = engine.recv_step(&mut input).unwrap();
        assert_eq!(got, vec![Incoming::Text(b"hello".to_vec())]);
    }

    #[test]
    fn recv_huge_advertised_length_waits() {
        let mut engine = FrameEngine::new();

        // a 10-byte head announcing a near-u64::MAX payload
        let mut input = vec![0x82, 0x7f];
        input.extend_from_slice(&(u64::MAX - 5).to_be_bytes());

        let got = engine.recv_step(&mut input).unwrap();
        assert!(got.is_empty());
        assert_eq!(input.len(), 10);
    }

    #[test]
    fn recv_rejects_masked_server_frame() {
        let mut engine = FrameEngine::new();
        let head = FrameHead::new(
            Fin::Y,
            OpCode::Text,
            Mask::Key([1, 2, 3, 4]),
            PayloadLen::from_num(0),
        );
        let mut input = Vec::new();
        head.encode(&mut input);

        assert!(matches!(
            engine.recv_step(&mut input),
            Err(FrameError::IllegalMask)
        ));
    }

    #[test]
    fn recv_rejects_stray_continue() {
        let mut engine = FrameEngine::new();
        let mut input = server_frame(Fin::Y, OpCode::Continue, b"x");

        assert!(matches!(
            engine.recv_step(&mut input),
            Err(FrameError::UnexpectedContinue)
        ));
    }

    #[test]
    fn ping_is_answered() {
        let mut engine = FrameEngine::new();
        let mut input = server_frame(Fin::Y, OpCode::Ping, b"ka");

        let got = engine.recv_step(&mut input).unwrap();
        assert!(got.is_empty());
        assert!(engine.wants_write());

        let out = engine.take_output();
        let (head, n) = FrameHead::decode(&out).unwrap();
        assert_eq!(head.opcode, OpCode::Pong);

        let Mask::Key(key) = head.mask else { panic!() };
        let mut payload = out[n..].to_vec();
        mask::apply_mask(key, &mut payload);
        assert_eq!(&payload, b"ka");
    }

    #[test]
    fn close_is_echoed_once() {
        let mut engine = FrameEngine::new();
        let mut input = server_frame(Fin::Y, OpCode::Close, &1000u16.to_be_bytes());

        let got = engine.recv_step(&mut input).unwrap();
        assert_eq!(got, vec![Incoming::Close(Some(1000))]);
        assert!(engine.close_received());
        assert!(engine.close_sent());

        let echo = engine.take_output();
        let (head, _) = FrameHead::decode(&echo).unwrap();
        assert_eq!(head.opcode, OpCode::Close);

        // initiating a close after the echo queues nothing
        engine.queue_close(1000, b"");
        assert!(!engine.wants_write());
    }

    #[test]
    fn close_initiated_locally() {
        let mut engine = FrameEngine::new();
        engine.queue_close(1001, b"going away");
        assert!(engine.close_sent());

        // data after close is dropped
        engine.take_output();
        engine.queue_msg(OpCode::Text, b"late");
        assert!(!engine.wants_write());
    }
}
