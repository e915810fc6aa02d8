pub mod catalog;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod package;
pub mod platform;
pub mod protocol;
pub mod reviews;
pub mod rooms;
