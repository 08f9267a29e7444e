//! Azure Files share client (REST, Shared Key authorization).
//!
//! Only the two share-level calls the driver needs are implemented:
//!
//! ```text
//! PUT    https://<account>.file.<base>/<share>?restype=share   201 | 409 ShareAlreadyExists
//! DELETE https://<account>.file.<base>/<share>?restype=share   202 | 404 ShareNotFound
//! ```

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose};
use reqwest::{Client, Method, StatusCode};
use ring::hmac;
use tracing::{debug, info, instrument};

use crate::error::VolumeError;
use crate::mount::AccountKey;
use crate::share::ShareClient;

/// REST API version sent in `x-ms-version`.
pub const API_VERSION: &str = "2019-02-02";

const ERROR_CODE_HEADER: &str = "x-ms-error-code";
const SHARE_ALREADY_EXISTS: &str = "ShareAlreadyExists";
const SHARE_NOT_FOUND: &str = "ShareNotFound";

/// Shared Key authenticated client for one storage account.
pub struct AzureFileClient {
    http: Client,
    account: String,
    endpoint: String,
    signing_key: hmac::Key,
}

impl AzureFileClient {
    /// Client for `https://<account>.file.<storage_base>`.
    pub fn new(
        account: &str,
        key: &AccountKey,
        storage_base: &str,
    ) -> Result<Self, VolumeError> {
        let endpoint = format!("https://{account}.file.{storage_base}");
        Self::with_endpoint(account, key, endpoint)
    }

    /// Client for an explicit service endpoint (emulators, tests).
    pub fn with_endpoint(
        account: &str,
        key: &AccountKey,
        endpoint: impl Into<String>,
    ) -> Result<Self, VolumeError> {
        let raw_key = general_purpose::STANDARD
            .decode(key.expose())
            .map_err(|e| VolumeError::Config(format!("account key is not valid base64: {e}")))?;

        Ok(Self {
            http: Client::new(),
            account: account.to_owned(),
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            signing_key: hmac::Key::new(hmac::HMAC_SHA256, &raw_key),
        })
    }

    /// Shared Key string-to-sign for a body-less share request.
    ///
    /// The eleven standard header slots between the verb and the
    /// canonicalized headers are all empty: no body, no conditionals.
    fn string_to_sign(&self, method: &Method, date: &str, share: &str) -> String {
        format!(
            "{method}\n{slots}x-ms-date:{date}\nx-ms-version:{API_VERSION}\n/{account}/{share}\nrestype:share",
            slots = "\n".repeat(11),
            account = self.account,
        )
    }

    fn sign(&self, string_to_sign: &str) -> String {
        let tag = hmac::sign(&self.signing_key, string_to_sign.as_bytes());
        general_purpose::STANDARD.encode(tag.as_ref())
    }

    /// Send a signed share-level request and return its status and
    /// `x-ms-error-code`.
    async fn send(
        &self,
        method: Method,
        share: &str,
    ) -> Result<(StatusCode, Option<String>), VolumeError> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let signature = self.sign(&self.string_to_sign(&method, &date, share));
        let url = format!("{}/{share}?restype=share", self.endpoint);

        debug!(%method, %url, "azure file request");
        let resp = self
            .http
            .request(method, &url)
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header(
                "authorization",
                format!("SharedKey {}:{signature}", self.account),
            )
            .body(Vec::<u8>::new())
            .send()
            .await
            .map_err(|e| VolumeError::Remote(format!("request to {url} failed: {e}")))?;

        let code = resp
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok((resp.status(), code))
    }
}

#[async_trait]
impl ShareClient for AzureFileClient {
    #[instrument(skip(self))]
    async fn create_share_if_absent(&self, share: &str) -> Result<bool, VolumeError> {
        match self.send(Method::PUT, share).await? {
            (StatusCode::CREATED, _) => {
                info!(%share, "created azure file share");
                Ok(true)
            }
            (StatusCode::CONFLICT, Some(code)) if code == SHARE_ALREADY_EXISTS => {
                debug!(%share, "azure file share already exists");
                Ok(false)
            }
            (status, code) => Err(unexpected("creating", share, status, code)),
        }
    }

    #[instrument(skip(self))]
    async fn delete_share_if_present(&self, share: &str) -> Result<bool, VolumeError> {
        match self.send(Method::DELETE, share).await? {
            (StatusCode::ACCEPTED, _) => {
                info!(%share, "removed azure file share");
                Ok(true)
            }
            (StatusCode::NOT_FOUND, Some(code)) if code == SHARE_NOT_FOUND => {
                debug!(%share, "azure file share already absent");
                Ok(false)
            }
            (status, code) => Err(unexpected("removing", share, status, code)),
        }
    }
}

fn unexpected(action: &str, share: &str, status: StatusCode, code: Option<String>) -> VolumeError {
    VolumeError::Remote(format!(
        "error {action} azure file share {share:?}: {status} ({})",
        code.as_deref().unwrap_or("no error code")
    ))
}
