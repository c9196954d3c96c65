//! Library half of the `webdeps` tool.
//!
//! The `webdeps` binary lives in `main.rs`; this crate exposes the module
//! walker, the import rewriter, the registry adapters and the install
//! pipeline so that integration tests in `tests/` can drive them against a
//! mock CDN.

pub mod client;
pub mod config;
pub mod import_map;
pub mod imports;
pub mod install;
pub mod lock;
pub mod manifest;
pub mod package;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod rewrite;
pub mod store;
pub mod walker;
