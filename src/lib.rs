pub mod config;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod generate;
pub mod message;
pub mod parsers;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod rules;
