//! External-process workers: spawning, monitoring and resource limits

pub mod limits;
#[cfg(unix)]
pub mod monitor;
#[cfg(unix)]
pub mod spawner;

pub use limits::ResourceLimits;
#[cfg(unix)]
pub use monitor::ShelfProcessMonitor;
#[cfg(unix)]
pub use spawner::{ShelfProcessSpawner, SpawnedShelf};
