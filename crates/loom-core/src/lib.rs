pub mod command;
pub mod config;
pub mod consent;
pub mod decompose;
pub mod error;
pub mod io;
pub mod ledger;
pub mod monitor;
pub mod orchestrator;
pub mod paths;
pub mod synthesis;
pub mod task;
pub mod transport;
pub mod types;
pub mod work;
pub mod worker;

pub use error::{LoomError, Result};
pub use orchestrator::{AdvanceReport, Loom};
