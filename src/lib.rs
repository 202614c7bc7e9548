pub mod client;
pub mod config;
pub mod correlation;
pub mod csrf;
pub mod error;
pub mod session;
pub mod utils;

use std::future::Future;
use std::pin::Pin;

/// Boxed future used at the crate's dynamic seams (the unauthorized
/// callback and the session backend).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
