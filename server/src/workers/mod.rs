//! Built-in CPU workers.
//!
//! Hardware back-ends live outside this crate and plug in through the same
//! [`Worker`](crate::worker::Worker) contract these reference workers
//! implement.

pub mod base64_decode;
pub mod base64_encode;
pub mod cpu;
pub mod echo;
pub mod echo_multi;
pub mod invert_image;
pub mod responder;
