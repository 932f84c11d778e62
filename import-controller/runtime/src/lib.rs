#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use import_controller_core as core;
pub use import_controller_k8s_api as k8s;

mod apply;
mod args;
mod controller;
mod hub;
mod lease;
mod metrics;
mod probe;

pub use self::{apply::KubeApplier, args::Args, hub::KubeHub};
