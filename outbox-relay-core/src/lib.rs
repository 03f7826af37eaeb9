#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod config;
pub mod entities;
pub mod framework;
pub mod limiter;
pub mod metrics;
pub mod processors;
pub mod shutdown;
pub mod sinks;
pub mod store;
pub mod transform;
