//! Per-backend pattern tables. `common` holds the operator families every backend shares, each
//! backend module picks the dtype configs it supports and adds its own fusions.

pub mod common;
pub mod onednn;
