//! The application boundary.
//!
//! A [`Gateway`] is the callable the engine hands each parsed request to.
//! It receives a [`Request`] view (method, target, headers, a lazy body
//! reader, peer identity) and returns a [`Response`] whose body shape
//! decides the wire framing. Environment construction for a specific
//! application protocol (WSGI-style dictionaries and the like) belongs to
//! the layer above; the engine only surfaces the raw material.

use crate::http::response::Response;

pub use crate::http::request::Request;

/// Errors a gateway may return.
///
/// Before response headers have gone out, a gateway error is answered with
/// `500 Internal Server Error` (or the status of the body-read failure
/// that caused it); afterwards the connection is closed without a partial
/// response.
pub type GatewayError = Box<dyn std::error::Error + Send + Sync>;

/// The application callable dispatched once per request.
///
/// Implementations run on worker threads and may block arbitrarily; the
/// selector loop is never behind this call.
pub trait Gateway: Send + Sync + 'static {
    fn handle(&self, req: &mut Request<'_>) -> Result<Response, GatewayError>;
}

impl<F> Gateway for F
where
    F: Fn(&mut Request<'_>) -> Result<Response, GatewayError> + Send + Sync + 'static,
{
    fn handle(&self, req: &mut Request<'_>) -> Result<Response, GatewayError> {
        self(req)
    }
}
