#![forbid(unsafe_code)]

pub mod batch;
pub mod cli;
pub mod config;
pub mod diff;
pub mod extract;
pub mod fetch;
pub mod formats;
pub mod keywords;
pub mod links;
pub mod logging;
pub mod monitor;
pub mod notify;
pub mod retry;
pub mod store;
