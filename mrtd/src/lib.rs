pub mod codec;
pub mod config;
pub mod coordinator;
pub mod ipc;
pub mod kernel;
pub mod store;
pub mod test_util;
pub mod validation;
