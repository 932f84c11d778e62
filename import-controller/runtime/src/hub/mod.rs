//! Kubernetes-backed implementations of the engine's hub traits.

use crate::{
    core::{Error, Result},
    k8s::Client,
};

mod clusters;
mod namespaces;
mod secrets;
mod tokens;
mod topology;
mod works;

/// Reads and writes hub objects through a shared client.
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
}

// === impl KubeHub ===

impl KubeHub {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

pub(crate) fn remote(error: kube::Error) -> Error {
    Error::Remote(error.into())
}

/// Treats a 404 as an empty result, for reads of kinds that may not be
/// installed on the hub.
pub(crate) fn or_absent<T: Default>(res: kube::Result<T>) -> Result<T> {
    match res {
        Ok(v) => Ok(v),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(T::default()),
        Err(error) => Err(remote(error)),
    }
}

fn encode(what: &str, error: serde_json::Error) -> Error {
    Error::malformed(format!("failed to encode {what}: {error}"))
}
