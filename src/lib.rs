pub mod builder;
pub mod cli;
pub mod config;
pub mod director;
pub mod error;
pub mod limiter;
pub mod runtime;
pub mod scenario;
pub mod sip;
pub mod stats;
pub mod template;
pub mod tester;
pub mod testutil;
pub mod transport;
