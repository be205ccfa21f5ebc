//! HTTP surface for Pylon: the client-facing proxy listener and the
//! management listener, wired over `pylon-core`.

pub mod admin;
pub mod proxy_app;
pub mod state;

pub use state::AppState;
