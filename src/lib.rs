pub mod booking;
pub mod config;
pub mod http;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod registry;
pub mod sync;
pub mod wal;
