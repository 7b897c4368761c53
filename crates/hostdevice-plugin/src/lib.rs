//! Kubernetes device plugin advertising host devices selected by udev properties.

pub mod config;
pub mod control_loop;
pub mod device;
pub mod plugin;

#[cfg(test)]
pub(crate) mod testing;
