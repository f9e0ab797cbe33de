//! Postflow - scheduled publishing to social platforms
//!
//! This library provides the publishing pipeline: a scheduler that decides
//! when posts are due, a rate limiter shared by every worker, platform
//! adapters hiding each provider's upload and publish protocol, and a
//! monitor that reconciles what the platforms report afterwards.

pub mod accounts;
pub mod api_manager;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod logging;
pub mod media;
pub mod monitor;
pub mod notify;
pub mod platforms;
pub mod rate_limiter;
pub mod scheduler;
pub mod scheduling;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{ErrorCode, PlatformError, PostflowError, Result};
pub use service::PostflowService;
pub use types::{NewScheduledPost, Platform, PostStatus, ScheduledPost};
