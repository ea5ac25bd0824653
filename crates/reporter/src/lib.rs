//! dmon-reporter service components shared by the binary and its tests

pub mod api;
