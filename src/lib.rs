pub mod error;
pub mod feedrelay;

pub use error::{ErrorCode, FeedError, Result};
