#![allow(clippy::result_large_err)]

extern crate self as switchyard;

pub mod backpressure;
pub mod breaker;
pub mod codec;
pub mod config;
pub mod domain;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod router;
pub mod schema;
pub mod telemetry;
pub mod transform;
