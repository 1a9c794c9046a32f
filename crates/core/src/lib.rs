pub mod config;
pub mod error;
pub mod time;
pub mod update;

pub use config::Config;
pub use error::*;
pub use time::*;
pub use update::*;
