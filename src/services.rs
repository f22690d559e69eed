pub mod console;
pub mod sync_repo;
pub mod watch;
