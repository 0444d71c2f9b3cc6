pub mod api;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod jobs;
pub mod notify;

pub use dispatcher::{Dispatcher, DispatcherConfig};
