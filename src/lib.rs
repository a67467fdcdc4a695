pub mod base_system;
pub mod descramble;
pub mod download;
pub mod plugin;
pub mod sites;
