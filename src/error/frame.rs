use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    IllegalFin,

    IllegalMask,

    IllegalOpCode,

    NotEnoughData,

    /// Control frame payload above 125 bytes.
    ControlTooLong,

    /// Continuation frame without a message in progress, or a new data
    /// frame while one is still being assembled.
    UnexpectedContinue,
}

impl Display for FrameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use FrameError::*;
        match self {
            IllegalFin => write!(f, "Illegal fin value"),
            IllegalMask => write!(f, "Illegal mask value"),
            IllegalOpCode => write!(f, "Illegal opcode value"),
            NotEnoughData => write!(f, "Not enough data to parse"),
            ControlTooLong => write!(f, "Control frame payload too long"),
            UnexpectedContinue => write!(f, "Unexpected continuation state"),
        }
    }
}

// use default impl
impl std::error::Error for FrameError {}
