// ─── Copy-trading relay ───
pub mod cache;
pub mod command_bus;
pub mod config;
pub mod executor;
pub mod follower;
pub mod intent;
pub mod messages;
pub mod notifier;
pub mod position;
pub mod refresh;
pub mod rest;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod translator;
pub mod types;
