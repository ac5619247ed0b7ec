//! Autopump — dashboard counters with a self-rescheduling growth simulator.
//!
//! Three cumulative counters (conversations, accounts, revenue) are stored as
//! singleton records. Admins edit them directly; the autopump daemon raises
//! them by bounded random steps on per-metric intervals.

pub mod auth;
pub mod config;
pub mod error;
pub mod pump;
pub mod service;
pub mod state;
pub mod types;
