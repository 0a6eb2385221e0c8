pub mod admin_api;
pub mod http_client;
pub mod http_handler;
pub mod memory_store;
pub mod redis_store;

/// Re-export commonly used types from adapters
pub use admin_api::AdminState;
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use memory_store::MemoryCoordinationStore;
pub use redis_store::RedisCoordinationStore;
