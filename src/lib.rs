#![no_std]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod command;
pub mod stream;

#[cfg(feature = "slave")]
pub mod slave;
#[cfg(feature = "master")]
pub mod master;
