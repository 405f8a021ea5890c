//! # offload-core — Trait definitions for the disk offloader
//!
//! This crate defines the trait boundaries for every axis of variability
//! in the offload engine. Each trait models one capability dimension:
//! how I/O reaches the kernel (`IoDriver`) and how buffer memory is owned
//! (`OffloadBuffer`). Default implementations live in `offload-module`.
//!
//! ## Design principle
//!
//! > "Program to the interface. Start safe. Optimize with a new impl,
//! >  not by modifying the existing one."
//!
//! The engine depends on the types in this crate, never on a concrete
//! backend. Adding a backend is a new `IoDriver` impl plus one variant in
//! the driver sum type.

pub mod entry;
pub mod completion;
pub mod region;
pub mod backend;
pub mod io_backend;
pub mod buffer;
pub mod env;
pub mod error;
