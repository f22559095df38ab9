//! End-client side helpers.

mod dirclient;

pub use dirclient::DirectoryClient;
