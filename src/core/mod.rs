pub mod admission;
pub mod gateway;
pub mod ip_network;
pub mod load_balancer;
pub mod lock;
pub mod pipeline;
pub mod policy_registry;
pub mod rate_limiter;
pub mod rejection;
pub mod route_table;
pub mod sync;
pub mod telemetry;

pub use admission::{AdmissionFilter, AdmissionPolicy};
pub use gateway::{BootstrapReport, GatewayService};
pub use lock::{DistributedLock, LockMode};
pub use pipeline::GatewayPipeline;
pub use policy_registry::PolicyRegistry;
pub use rate_limiter::{BucketPolicy, DistributedRateLimiter};
pub use rejection::Rejection;
pub use route_table::{Route, RouteTable};
pub use telemetry::RequestTelemetry;
