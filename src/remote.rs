pub mod command;
pub mod error;
pub mod integrity;
pub mod pool;
pub mod transfer;
pub mod transport;

#[cfg(test)]
pub mod testing;
