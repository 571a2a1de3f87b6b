//! In-tree device drivers.
//!
//! Real MAC and serial drivers live in the platform ports; the loopback
//! pair here exercises the same descriptor, buffer-pool and network-task
//! seams and is what hosted images and the test suite drive.

pub mod loopback;
