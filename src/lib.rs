pub mod app;
pub mod batch;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod ftp;
pub mod layout;
pub mod output;
pub mod process;
pub mod progress;
pub mod sort;
pub mod table;
pub mod task;
pub mod transfer;
pub mod tui;
