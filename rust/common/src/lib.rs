//! Re-exports of commonly used dependencies so that member crates have a
//! single import surface and a single place where versions are managed.

pub use async_trait;
pub use bytes;
pub use clap;
pub use eyre;
pub use flate2;
pub use futures;
pub use indexmap;
pub use once_cell;
pub use rand;
pub use regex;
pub use serde;
pub use serde_json;
pub use serde_yaml;
pub use sha2;
pub use similar;
pub use strum;
pub use tempfile;
pub use thiserror;
pub use tokio;
pub use tokio_util;
pub use tracing;
pub use which;
