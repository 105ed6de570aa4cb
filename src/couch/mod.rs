pub mod client;

pub use client::CouchStore;
