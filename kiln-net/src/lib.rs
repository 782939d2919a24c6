// kiln-net/src/lib.rs
pub mod http;
pub mod retry;
pub mod validation;

pub use http::{fetch_verified, Fetcher, HttpFetcher};
pub use retry::RetryPolicy;
pub use validation::validate_url;
