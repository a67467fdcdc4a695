pub mod fs_name;
pub mod interrupt;
pub mod logging;
