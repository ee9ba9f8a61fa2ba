//! SigV4 signing for the AppSync Events endpoints.
//!
//! AppSync authorizes realtime operations with the header set of a signed
//! HTTP POST against the events endpoint: the connect handshake signs an
//! empty JSON object, each subscribe signs `{"channel": …}`, and publishes
//! are ordinary signed POSTs. This module produces those header sets.

use std::collections::BTreeMap;
use std::time::SystemTime;

use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;

use crate::error::{Error, Result};

const SERVICE: &str = "appsync";

/// Credentials and region used to sign AppSync requests.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    credentials: SharedCredentialsProvider,
    region: String,
}

impl AuthConfig {
    /// Creates an auth config from an explicit provider and region.
    pub fn new(credentials: SharedCredentialsProvider, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
        }
    }

    /// Extracts provider and region from a loaded SDK config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompleteConfig`] if the config has no region or no
    /// credentials provider.
    pub fn from_sdk_config(cfg: &aws_config::SdkConfig) -> Result<Self> {
        let region = cfg
            .region()
            .ok_or(Error::IncompleteConfig("region is not set"))?
            .to_string();
        let credentials = cfg
            .credentials_provider()
            .ok_or(Error::IncompleteConfig("no credentials provider"))?;
        Ok(Self::new(credentials, region))
    }

    /// Signs a connect/subscribe authorization payload.
    ///
    /// Returns the header set AppSync expects inside the `authorization`
    /// field (and, base64url-encoded, in the WebSocket subprotocol):
    /// `accept`, `content-encoding`, `content-type`, `host`, `x-amz-date`,
    /// `Authorization`, and `X-Amz-Security-Token` when present.
    pub(crate) async fn authorization(
        &self,
        url: &str,
        body: &[u8],
    ) -> Result<BTreeMap<String, String>> {
        self.sign_headers(
            url,
            body,
            &[
                ("accept", "application/json, text/javascript"),
                ("content-encoding", "amz-1.0"),
                ("content-type", "application/json; charset=UTF-8"),
            ],
        )
        .await
    }

    /// Signs a publish POST and returns the full header set to send.
    pub(crate) async fn publish_headers(
        &self,
        url: &str,
        body: &[u8],
    ) -> Result<BTreeMap<String, String>> {
        self.sign_headers(url, body, &[("content-type", "application/json")])
            .await
    }

    async fn sign_headers(
        &self,
        url: &str,
        body: &[u8],
        base: &[(&str, &str)],
    ) -> Result<BTreeMap<String, String>> {
        let credentials = self
            .credentials
            .provide_credentials()
            .await
            .map_err(Error::Credentials)?;
        let identity: Identity = credentials.into();

        let host = url::host_of(url)?;
        let mut headers: Vec<(String, String)> = base
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        headers.push(("host".to_string(), host));

        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(SERVICE)
            .time(SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| Error::Signing(e.to_string()))?
            .into();

        let signable = SignableRequest::new(
            "POST",
            url,
            headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            SignableBody::Bytes(body),
        )
        .map_err(|e| Error::Signing(e.to_string()))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| Error::Signing(e.to_string()))?
            .into_parts();

        let mut out: BTreeMap<String, String> = headers.into_iter().collect();
        for (name, value) in instructions.headers() {
            // AppSync expects these two with their canonical casing.
            let name = match name {
                "authorization" => "Authorization".to_string(),
                "x-amz-security-token" => "X-Amz-Security-Token".to_string(),
                other => other.to_string(),
            };
            out.insert(name, value.to_string());
        }
        Ok(out)
    }
}

mod url {
    use crate::error::{Error, Result};

    /// Extracts `host[:port]` from an absolute URL without pulling in a full
    /// URL parser.
    pub(super) fn host_of(url: &str) -> Result<String> {
        let rest = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| Error::Signing(format!("not an absolute url: {url}")))?;
        let host = rest.split(['/', '?']).next().unwrap_or(rest);
        if host.is_empty() {
            return Err(Error::Signing(format!("url has no host: {url}")));
        }
        Ok(host.to_string())
    }

    #[cfg(test)]
    mod tests {
        use super::host_of;

        #[test]
        fn extracts_host_and_port() {
            assert_eq!(
                host_of("https://abc.appsync-api.us-east-1.amazonaws.com/event").unwrap(),
                "abc.appsync-api.us-east-1.amazonaws.com"
            );
            assert_eq!(host_of("http://127.0.0.1:8080/event").unwrap(), "127.0.0.1:8080");
        }

        #[test]
        fn rejects_relative_urls() {
            assert!(host_of("/event").is_err());
        }
    }
}
