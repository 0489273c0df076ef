//! termhub: a broker for persistent terminal sessions.
//!
//! Shell processes live in server-side PTYs that outlast the WebSocket
//! connections viewing them. Clients create, attach to, detach from and kill
//! sessions; late joiners get a scrollback replay before live output.

pub mod activity;
pub mod api;
pub mod coalescer;
pub mod config;
pub mod connection;
pub mod pty;
pub mod reaper;
pub mod registry;
pub mod scrollback;
pub mod session;
pub mod store;
