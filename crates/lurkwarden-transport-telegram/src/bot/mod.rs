/// Moderation command handlers
pub mod handlers;
/// Reply delivery with automatic retry
pub mod resilient;
/// Unauthorized command flood protection
pub mod unauthorized_cache;
/// Member updates and group messages
pub mod updates;
/// HTML replies
pub mod views;

pub use unauthorized_cache::UnauthorizedCache;
