pub mod activity;
pub mod controller;
pub mod timers;

use crate::BoxFuture;

/// Externally owned authentication operations consumed by the controller.
///
/// The embedding application's auth store owns the authenticated flag and
/// the actual refresh/logout endpoints; this layer only calls them.
pub trait SessionBackend: Send + Sync + 'static {
    /// Extend the server-side session.
    fn refresh_session(&self) -> BoxFuture<'static, anyhow::Result<()>>;

    /// Terminate the server-side session.
    fn logout(&self) -> BoxFuture<'static, anyhow::Result<()>>;
}
