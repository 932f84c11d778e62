use crate::{
    core::FIELD_MANAGER,
    k8s::{self, Deployment, ObjectMeta, Resource},
};
use anyhow::{Context, Result};
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::PatchParams;
use std::sync::Arc;
use tokio::{sync::watch, time};

pub const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    lease_name: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    // The controller's own Deployment owns the Lease so that it is removed
    // with the controller.
    let api = k8s::Api::<Deployment>::namespaced(runtime.client(), ns);
    let deployment = api.get(deployment_name).await?;
    let owner = deployment
        .controller_owner_ref(&())
        .context("deployment has no name or uid")?;

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(lease_name.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(
                [("app".to_string(), FIELD_MANAGER.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &kube::api::Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => {
            return Err(error.into());
        }
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, lease_name)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

/// Whether this replica currently holds the lease.
#[derive(Clone, Debug)]
pub struct Leader {
    claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    hostname: String,
}

// === impl Leader ===

impl Leader {
    pub fn new(claims: watch::Receiver<Arc<kubert::lease::Claim>>, hostname: String) -> Self {
        Self { claims, hostname }
    }

    pub fn is_current(&self) -> bool {
        self.claims.borrow().is_current_for(&self.hostname)
    }

    /// Resolves once this replica holds the lease.
    pub async fn acquired(&self) -> Result<()> {
        let mut claims = self.claims.clone();
        while !claims.borrow_and_update().is_current_for(&self.hostname) {
            claims.changed().await?;
        }
        Ok(())
    }
}
