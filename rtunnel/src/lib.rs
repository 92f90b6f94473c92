#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate atomic_enum;

#[macro_use]
mod macros;

pub mod api;
pub mod channel;
pub mod dag;
pub mod functions;
pub mod metrics;
pub mod runtime;
pub mod storage;
pub mod utils;
