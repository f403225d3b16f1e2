use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum HandshakeError {
    // http error
    HttpVersion,

    /// Response head did not carry a status code.
    HttpStatusCode,

    // websocket error
    SecWebSocketAccept,

    // read
    NotEnoughData,

    TooManyHeaders,

    Httparse(httparse::Error),
}

impl Display for HandshakeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use HandshakeError::*;
        match self {
            HttpVersion => write!(f, "Illegal http version"),

            HttpStatusCode => write!(f, "Missing http status code"),

            SecWebSocketAccept => {
                write!(f, "Missing or illegal sec-websocket-accept header")
            }

            NotEnoughData => write!(f, "Not enough data to parse"),

            TooManyHeaders => write!(f, "Too many headers in response"),

            Httparse(e) => write!(f, "Http parse error: {}", e),
        }
    }
}

impl From<httparse::Error> for HandshakeError {
    fn from(e: httparse::Error) -> Self { HandshakeError::Httparse(e) }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let HandshakeError::Httparse(e) = self {
            Some(e)
        } else {
            None
        }
    }
}
