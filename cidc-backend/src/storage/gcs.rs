use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use url::Url;

use super::{Error, Result, iam::Policy};

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";
const STORAGE_HOST: &str = "https://storage.googleapis.com";
const IAM_CREDENTIALS_API: &str = "https://iamcredentials.googleapis.com/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
/// Tokens this close to expiry are refreshed before use.
const TOKEN_EXPIRY_MARGIN_SECONDS: i64 = 60;

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignBlobResponse {
    signed_blob: String,
}

/// Bucket IAM and URL signing over the Cloud Storage JSON API.
pub struct Client {
    http: reqwest::Client,
    bucket: String,
    service_account: String,
    static_token: Option<String>,
    token: Mutex<Option<CachedToken>>,
}

impl Client {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        bucket: &str,
        service_account: &str,
        static_token: Option<&str>,
    ) -> Self {
        Self {
            http,
            bucket: bucket.to_string(),
            service_account: service_account.to_string(),
            static_token: static_token.map(str::to_string),
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String> {
        if let Some(token) = &self.static_token {
            return Ok(token.clone());
        }

        let mut cached = self.token.lock().await;
        let fresh_until = Utc::now() + Duration::seconds(TOKEN_EXPIRY_MARGIN_SECONDS);
        if let Some(token) = cached.as_ref().filter(|t| t.expires_at > fresh_until) {
            return Ok(token.value.clone());
        }

        let MetadataToken {
            access_token,
            expires_in,
        } = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        tracing::debug!(expires_in, "fetched storage access token");

        *cached = Some(CachedToken {
            value: access_token.clone(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        });

        Ok(access_token)
    }

    fn iam_url(&self) -> String {
        format!("{STORAGE_API}/b/{}/iam", self.bucket)
    }

    /// # Errors
    pub async fn get_policy(&self) -> Result<Policy> {
        let token = self.access_token().await?;

        let policy = self
            .http
            .get(self.iam_url())
            .query(&[("optionsRequestedPolicyVersion", "3")])
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(policy)
    }

    /// # Errors
    pub async fn set_policy(&self, policy: &Policy) -> Result<()> {
        let token = self.access_token().await?;

        self.http
            .put(self.iam_url())
            .bearer_auth(token)
            .json(policy)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    async fn sign_blob(&self, payload: &[u8]) -> Result<String> {
        let token = self.access_token().await?;
        let url = format!(
            "{IAM_CREDENTIALS_API}/projects/-/serviceAccounts/{}:signBlob",
            self.service_account
        );

        let SignBlobResponse { signed_blob } = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&json!({"payload": STANDARD.encode(payload)}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(signed_blob)
    }

    /// A V2 signed GET URL for `object_name` that downloads as an attachment
    /// and stops working at `expires`.
    ///
    /// # Errors
    pub async fn signed_url(&self, object_name: &str, expires: DateTime<Utc>) -> Result<String> {
        let unsigned = UnsignedUrl::new(&self.bucket, object_name, expires)?;
        let signature = self.sign_blob(unsigned.string_to_sign().as_bytes()).await?;

        Ok(unsigned.sign(&self.service_account, &signature))
    }
}

/// The pieces of a V2 signed URL that are known before signing.
pub(super) struct UnsignedUrl {
    url: Url,
    expires: i64,
    disposition: String,
}

impl UnsignedUrl {
    pub(super) fn new(bucket: &str, object_name: &str, expires: DateTime<Utc>) -> Result<Self> {
        let mut url = Url::parse(STORAGE_HOST)?;
        url.path_segments_mut()
            .map_err(|()| Error::Signing {
                message: format!("{STORAGE_HOST} cannot hold a path"),
            })?
            .push(bucket)
            .extend(object_name.split('/'));

        let file_name = object_name.replace(['/', '"', ' '], "_");

        Ok(Self {
            url,
            expires: expires.timestamp(),
            disposition: format!(r#"attachment; filename="{file_name}""#),
        })
    }

    fn disposition_query(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("response-content-disposition", &self.disposition)
            .finish()
    }

    pub(super) fn string_to_sign(&self) -> String {
        format!(
            "GET\n\n\n{}\n{}?{}",
            self.expires,
            self.url.path(),
            self.disposition_query()
        )
    }

    pub(super) fn sign(mut self, service_account: &str, signature: &str) -> String {
        self.url
            .query_pairs_mut()
            .append_pair("GoogleAccessId", service_account)
            .append_pair("Expires", &self.expires.to_string())
            .append_pair("Signature", signature)
            .append_pair("response-content-disposition", &self.disposition);

        self.url.into()
    }
}
