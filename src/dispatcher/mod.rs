//! Front-end request dispatcher and the ring-reweighting loop.

pub mod handler;
pub mod redistribution;
pub mod server;

pub use redistribution::Redistributor;
pub use server::{BalancerServer, DispatcherState};
