//! Directory watching and file-stability detection (spec §4.5).

pub mod directory;
pub mod stability;

pub use directory::DirectoryWatcher;
pub use stability::StabilityDetector;
