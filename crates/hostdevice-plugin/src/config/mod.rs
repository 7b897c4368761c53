pub mod cli;
pub mod daemon;
pub mod resources;

pub use cli::*;
pub use daemon::*;
pub use resources::*;
