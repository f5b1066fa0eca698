/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding the datagram socket failed.
    #[error("bind failed: {0}")]
    BindFailed(#[source] std::io::Error),

    /// Sending a datagram failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving a datagram failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// `bind` was requested on a bridge that already owns a socket.
    #[error("bridge is already bound to {0}")]
    AlreadyBound(std::net::SocketAddr),

    /// The I/O context has exited; its channels are closed.
    #[error("transport shut down")]
    Shutdown,
}
