pub mod config;
pub mod envelope;
pub mod error;
pub mod types;

pub use config::Config;
pub use envelope::*;
pub use error::QuestlineError;
pub use types::*;
