//! # Dynamic System Update service
//!
//! This crate implements the lifecycle management for a Generic System
//! Image (GSI) installed alongside the host system: a small set of
//! durable marker files records whether an image is installed and
//! whether the next boot may enter it, and a single service object
//! serializes installation sessions against concurrent queries and
//! cancellation requests.
//!
//! The bulk data path (partition-image writing, device mapping) lives
//! behind the [`install::Installer`] and [`image::ImageManager`] traits;
//! [`backend`] carries a file-backed reference implementation used by
//! the CLI and the end-to-end tests.

pub mod access;
pub mod backend;
pub mod boot;
pub mod error;
pub mod fstab;
pub mod image;
pub mod install;
pub mod paths;
pub mod progress;
pub mod service;
pub mod statestore;
