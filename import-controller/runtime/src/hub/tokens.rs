use super::{remote, KubeHub};
use crate::{
    core::{
        bootstrap::{IssuedToken, TokenSource},
        time, Error, Result,
    },
    k8s::{Api, Secret, ServiceAccount, TokenRequest, TokenRequestSpec},
};
use chrono::Utc;
use kube::api::{ListParams, PostParams};

#[async_trait::async_trait]
impl TokenSource for KubeHub {
    async fn secrets(&self, ns: &str) -> Result<Vec<Secret>> {
        let api = Api::<Secret>::namespaced(self.client(), ns);
        let list = api.list(&ListParams::default()).await.map_err(remote)?;
        Ok(list.items)
    }

    async fn request_token(&self, ns: &str, sa: &str, expiration_seconds: i64) -> Result<IssuedToken> {
        let api = Api::<ServiceAccount>::namespaced(self.client(), ns);
        let request = TokenRequest {
            spec: TokenRequestSpec {
                expiration_seconds: Some(expiration_seconds),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = Utc::now();
        let issued = api
            .create_token_request(sa, &PostParams::default(), &request)
            .await
            .map_err(remote)?;
        let status = issued
            .status
            .ok_or_else(|| Error::malformed(format!("token request for {ns}/{sa} has no status")))?;
        if status.token.is_empty() {
            return Err(Error::malformed(format!("token request for {ns}/{sa} returned no token")));
        }
        Ok(IssuedToken {
            token: status.token,
            created: Some(created),
            expiration: time::to_utc(&status.expiration_timestamp),
        })
    }
}
