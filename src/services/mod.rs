pub mod auth;
pub mod download;
pub mod ipc;
pub mod notification;
pub mod player;
pub mod session;
pub mod watch_history;
pub mod worker;
