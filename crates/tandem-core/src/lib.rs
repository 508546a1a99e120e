#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod channel;
mod client;
mod codec;
mod config;
mod context;
mod frame;
mod method;
mod server;
mod session;
mod status;
mod streaming;
mod transport;

pub use client::*;
pub use codec::*;
pub use config::*;
pub use context::*;
pub use frame::*;
pub use method::*;
pub use server::*;
pub use session::*;
pub use status::*;
pub use streaming::*;
pub use transport::*;
