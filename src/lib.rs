pub mod console;
pub mod mqtt;
pub mod peer;
pub mod persistence;
