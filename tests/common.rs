#![allow(dead_code)]
extern crate flotilla;

use std::path::PathBuf;
use std::sync::Arc;

use flotilla::fs::RealFs;
use flotilla::state::{LoadOpts, Loader, Visitor};

/// Absolute path to a fixture manifest
pub fn fixture(rel: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(rel)
}

pub fn visitor(opts: LoadOpts) -> Visitor {
    Visitor::new(Loader::new(Arc::new(RealFs::default()), opts))
}

pub fn loader(opts: LoadOpts) -> Loader {
    Loader::new(Arc::new(RealFs::default()), opts)
}
