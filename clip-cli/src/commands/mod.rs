//! CLI command implementations.

pub mod init;
pub mod pair;
pub mod send;
pub mod serve;
pub mod status;
pub mod unpair;
