//! Daemon lifecycle pieces shared by the `hearthd` binary and its tests.

pub mod lifecycle;
pub mod reload;

pub use lifecycle::{PidFile, PidFileError};
pub use reload::ReloadableLlm;
