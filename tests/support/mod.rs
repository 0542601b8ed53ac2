//! Helpers shared by integration tests.
#![allow(dead_code)]

pub mod fakes;
pub mod socket_guard;
