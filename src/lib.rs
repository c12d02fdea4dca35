pub mod bus;
pub mod catalog;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod shiftboss;
