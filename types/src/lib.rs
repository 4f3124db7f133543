//!
//! Device contract shared by `gpu-suballoc` and its backends.
//!

mod device;
mod types;

pub use self::{device::*, types::*};
