pub mod client;

pub use client::{RemoteFilter, RemoteStore, RestRemoteStore};
