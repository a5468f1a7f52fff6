pub mod bridge;
pub mod btle;
pub mod codec;
pub mod connection;
pub mod constants;
pub mod radio;
pub mod scanner;
pub mod store;
pub mod timers;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;
