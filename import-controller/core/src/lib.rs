#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod autoimport;
pub mod bootstrap;
pub mod bundle;
pub mod ca;
pub mod certs;
mod error;
pub mod kubeconfig;
pub mod reaper;
pub mod render;
pub mod state;
pub mod time;
pub mod work;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::error::{Error, Result};
pub use import_controller_k8s_api as k8s;

/// Field manager used for every server-side apply issued by the controller.
pub const FIELD_MANAGER: &str = "managedcluster-import-controller";

/// Joins documents in the rendered import YAML.
pub const YAML_SEPARATOR: &str = "\n---\n";
