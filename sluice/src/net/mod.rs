//! The networking modules handle all the byte traffic between peers and
//! the gateway: buffered socket I/O, the Wait/Fatal error plumbing, and
//! the readiness reactor tying detection, sessions and handlers together.

pub mod buffer;
pub mod reactor;
pub mod support;
