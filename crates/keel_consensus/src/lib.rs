//! Guarded access to the cluster metadata log.
//!
//! This crate provides the commit protocol used by the metadata layer. The
//! API surface is intentionally small: higher layers take a `Guard`, fill a
//! `Batch` with encoded mutations, and commit it through a `MetadataLog`.
//! The consensus engine behind the log is supplied by the embedder; a
//! single-process `LocalLog` is included for embedding and tests.

pub mod log;
