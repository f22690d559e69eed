pub mod aggregate;
pub mod path;
pub mod schedule;
pub mod task;
