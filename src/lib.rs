pub mod bot;
pub mod config;
pub mod notify;
pub mod portal;
pub mod server;
pub mod snapshot;
pub mod subscription;
pub mod watch;
