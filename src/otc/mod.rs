pub mod client;

pub use client::OtcSource;
