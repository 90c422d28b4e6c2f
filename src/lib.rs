pub mod accounts;
pub mod aggregator;
pub mod app;
pub mod cli;
pub mod config;
pub mod foreground;
pub mod process_guard;
pub mod tracker;
pub mod util;
pub mod writer;
