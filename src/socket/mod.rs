pub mod frame_socket;

pub use frame_socket::FrameSocket;

/// Lifecycle of the framed transport. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    Connecting,
    HandshakeInProgress,
    Ready,
    Closing,
    Closed,
}

impl SocketState {
    pub fn is_closed_or_closing(self) -> bool {
        matches!(self, SocketState::Closing | SocketState::Closed)
    }
}
