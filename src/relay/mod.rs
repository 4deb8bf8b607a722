// Relay core
pub mod error;   // listener / session failure taxonomy
pub mod server;  // acceptor: tcp listen + websocket handshake per connection
pub mod session; // per-client subscription state machine and poll/drain cycle

pub use server::Relay;
