//! Sockspawn - a Unix socket server that runs one program per connection
//!
//! This library provides the pieces of a UCSPI-style Unix-domain server:
//! - Binds a listening socket with a configurable backlog and optionally
//!   drops to another user and group afterwards
//! - Spawns a fresh worker process for every accepted connection, with the
//!   connection as the worker's stdin and stdout
//! - Bounds the number of simultaneously running workers; at the limit new
//!   connections wait in the kernel backlog until a worker exits
//! - Reaps workers as they exit and reports status changes line by line
//! - Exports the connection's local and peer details to each worker's
//!   environment

pub mod cli;
pub mod config;
pub mod controller;
pub mod env;
pub mod error;
pub mod listener;
pub mod server;
pub mod signals;
pub mod status;
pub mod worker;
