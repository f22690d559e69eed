pub mod fs;
pub mod ssh;
pub mod watch;
