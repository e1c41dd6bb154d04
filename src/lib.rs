pub mod annotation;
pub mod binder;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod key_generator;
pub mod middleware;
pub mod rate_limiter;
pub mod redis;
pub mod response;
pub mod schema;
pub mod server;
pub mod store;
pub mod trace;
pub mod validation;

pub use binder::{BindError, Binder, InboundRequest};
pub use config::Config;
pub use envelope::{Envelope, EnvelopeConfig};
pub use error::{Fault, FaultClass, IntoFault};
pub use rate_limiter::{FixedWindowLimiter, RateLimitRecord};
pub use schema::{Fields, Schema};
pub use server::{build_router, AppState, Server};
pub use middleware::RequestLoggingConfig;
pub use trace::{Trace, TraceConfig};
pub use validation::{RecursiveValidator, Traverse, ValidationError};
