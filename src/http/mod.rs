//! HTTP layer for forgedrop.
//!
//! A small JSON API over the repository browser and the commit pipeline, for
//! a web UI to drive.

pub mod handler;
