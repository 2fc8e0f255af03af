pub mod config;
pub mod movement;
pub mod types;

pub use config::PlbConfig;
pub use movement::*;
pub use types::*;
