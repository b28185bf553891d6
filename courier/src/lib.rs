//! Courier: a notification delivery service.
//!
//! Submissions arrive over HTTP, are queued on a per-service topic, and are delivered
//! as HTTP GETs by a bounded pool of retrying runners. Deliveries that run out of
//! attempts are reported on the service's error topic.
pub mod app;
pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod logger;
pub mod message;
pub mod metrics;
pub mod notify;
pub mod pool;
pub mod runnable;
pub mod runner;
pub mod server;

pub use app::App;
pub use config::Config;
