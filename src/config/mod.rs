//! Layered configuration.
//!
//! There are two kinds of structs: the on-disk [`manifest::Configuration`],
//! loaded verbatim from `devdeploy.json` via `serde`, and the
//! [`rt::RtcServe`] runtime config, which is the on-disk model plus CLI
//! overrides and resolved, canonical paths — the only config shape the rest
//! of the server ever touches.

pub mod env;
pub mod manifest;
pub mod rt;

pub use manifest::Configuration;
pub use rt::RtcServe;
