#![doc = include_str!("../README.md")]

pub mod handler;
pub mod net;
pub mod poller;

pub use handler::{ConnectionState, SocketHandler};
pub use poller::{Event, EventName, Poller};
