pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod state;
pub mod ws;

#[cfg(test)]
mod tests;

pub use buffer::{ChunkedBuffer, Cursor, CHUNK_SIZE};
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::{BoltError, BoltResult};
pub use state::{MessageType, ProtocolState};

/// Error returned by most functions.
///
/// When writing a real application, one might want to consider a specialized
/// error handling crate or defining an error type as an `enum` of causes.
/// However, for our example, using a boxed `std::error::Error` is sufficient.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for top-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Bolt protocol magic preamble a client sends before any handshake bytes.
pub const BOLT_MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Driving a connection end to end: handshake, then a read/reply loop until
/// the peer closes.
///
/// ```rust,no_run
/// use bolt_session::{Connection, ConnectionConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let listener = tokio::net::TcpListener::bind("127.0.0.1:7687").await?;
///     let (socket, _) = listener.accept().await?;
///
///     let mut conn = Connection::new(socket, ConnectionConfig::default());
///     conn.handshake().await?;
///
///     while let Some(_message) = conn.read_message().await? {
///         // Decode the structure, run it, and reply via conn.reply_for(...).
///     }
///
///     Ok(())
/// }
/// ```
pub mod prelude {
    pub use crate::{BoltError, BoltResult, Connection, ConnectionConfig, MessageType, ProtocolState};
}
