pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod extract;
pub mod http;
pub mod inventory;
pub mod scheduler;
pub mod series;
pub mod session;
pub mod sink;
