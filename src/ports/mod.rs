pub mod clock;
pub mod coordination_store;
pub mod http_client;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordination_store::{CoordinationStore, MessageStream, StoreError, StoreResult};
pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
