//! A trait-object seam so `KvSession` and `HttpSession` can hold either
//! a plain TCP socket or a TLS stream behind the same field, instead of
//! duplicating every read/write call site per transport.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that reads and writes bytes asynchronously and can cross a
/// thread boundary. Blanket-implemented for every type that already
/// satisfies the bounds, so `TcpStream` and
/// `tokio_rustls::client::TlsStream<TcpStream>` both qualify for free.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// The boxed form actually stored in session state.
pub type BoxedStream = Box<dyn AsyncStream>;
