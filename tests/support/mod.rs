#![allow(dead_code)]

pub mod fake_source;
pub mod socket_guard;
