//! Domain Layer
//!
//! Request and instance types, selection algorithms and outbound ports.
//! Nothing in here touches sockets, timers or storage.

pub mod entities;
pub mod errors;
pub mod ports;
pub mod services;
pub mod value_objects;
