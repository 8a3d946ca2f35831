//! The HTTP/1.x request cycle.
//!
//! [`request`] drives one request/response exchange over a buffered socket
//! stream: request line, headers through a pluggable [`headers::HeaderReader`],
//! body framing selection, gateway dispatch, and response writing with
//! chunked encoding and keep-alive bookkeeping.

pub mod headers;
pub mod request;
pub mod response;
pub mod target;

pub use headers::{DefaultHeaderReader, DropUnderscoreHeaderReader, HeaderReader};
pub use request::Request;
pub use response::{Response, ResponseBody};
pub use target::RequestTarget;
