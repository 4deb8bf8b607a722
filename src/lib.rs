// Crate entrypoint
pub mod config;    // startup configuration (port, poll interval, book depth)
pub mod relay;     // websocket acceptor + per-client snapshot sessions
pub mod telemetry; // tracing / metrics bootstrap
pub mod upstream;  // Deribit HTTP client + snapshot fetcher boundary
