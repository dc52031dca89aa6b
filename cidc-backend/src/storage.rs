//! Data bucket access: expiring IAM grants and signed download URLs.

use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use crate::config::{
    Config, DOWNLOAD_URL_EXPIRY_MINUTES, GOOGLE_DOWNLOAD_ROLE, GOOGLE_MAX_DOWNLOAD_PERMISSIONS,
    MAX_REVOKE_ALL_ITERATIONS,
};

pub mod gcs;
pub mod iam;

use iam::{Policy, upload_prefix};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("failed to sign URL: {message}")]
    Signing { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

enum Backend {
    Gcs(gcs::Client),
    /// Keeps the policy in memory and logs every change instead of calling
    /// Google.
    Dry(Mutex<Policy>),
}

pub struct Storage {
    bucket: String,
    lister_role: String,
    backend: Backend,
}

impl Storage {
    #[must_use]
    pub fn gcs(config: &Config, http: reqwest::Client) -> Self {
        Self {
            bucket: config.gcs_data_bucket().to_string(),
            lister_role: config.gcs_lister_role().to_string(),
            backend: Backend::Gcs(gcs::Client::new(
                http,
                config.gcs_data_bucket(),
                config.gcs_service_account(),
                config.gcs_access_token(),
            )),
        }
    }

    #[must_use]
    pub fn dry(bucket: &str, lister_role: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            lister_role: lister_role.to_string(),
            backend: Backend::Dry(Mutex::new(Policy::default())),
        }
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Fetch the bucket policy, let `edit` change it and write it back.
    async fn edit_policy<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Policy) + Send,
    {
        match &self.backend {
            Backend::Gcs(client) => {
                let mut policy = client.get_policy().await?;
                edit(&mut policy);
                client.set_policy(&policy).await
            }
            Backend::Dry(policy) => {
                let mut policy = policy.lock().await;
                edit(&mut *policy);
                tracing::info!(
                    bucket = %self.bucket,
                    n_bindings = policy.bindings.len(),
                    "would have set bucket IAM policy"
                );
                Ok(())
            }
        }
    }

    /// Grant (or extend) download access on a trial and upload type. A
    /// `None` trial or upload type covers all of them.
    ///
    /// # Errors
    pub async fn grant_download_access(
        &self,
        email: &str,
        trial_id: Option<&str>,
        upload_type: Option<&str>,
    ) -> Result<()> {
        let prefix = upload_prefix(trial_id, upload_type);
        tracing::info!(email, %prefix, "granting download access");

        let now = Utc::now();
        self.edit_policy(|policy| {
            policy.grant(&self.bucket, Some(&prefix), GOOGLE_DOWNLOAD_ROLE, email, now);
        })
        .await
    }

    /// # Errors
    pub async fn revoke_download_access(
        &self,
        email: &str,
        trial_id: Option<&str>,
        upload_type: Option<&str>,
    ) -> Result<()> {
        let prefix = upload_prefix(trial_id, upload_type);
        tracing::info!(email, %prefix, "revoking download access");

        self.edit_policy(|policy| {
            let n_removed = policy.revoke(
                Some(&prefix),
                GOOGLE_DOWNLOAD_ROLE,
                email,
                GOOGLE_MAX_DOWNLOAD_PERMISSIONS,
            );
            if n_removed == 0 {
                tracing::warn!(email, %prefix, "tried to revoke a nonexistent download binding");
            }
        })
        .await
    }

    /// Remove every download binding `email` holds on the bucket.
    ///
    /// # Errors
    pub async fn revoke_all_download_access(&self, email: &str) -> Result<()> {
        tracing::info!(email, "revoking all download access");

        self.edit_policy(|policy| {
            policy.revoke(Some(""), GOOGLE_DOWNLOAD_ROLE, email, MAX_REVOKE_ALL_ITERATIONS);
        })
        .await
    }

    /// Let `email` list the bucket's objects.
    ///
    /// # Errors
    pub async fn grant_lister_access(&self, email: &str) -> Result<()> {
        tracing::info!(email, "granting lister access");

        let now = Utc::now();
        self.edit_policy(|policy| policy.grant(&self.bucket, None, &self.lister_role, email, now))
            .await
    }

    /// # Errors
    pub async fn revoke_lister_access(&self, email: &str) -> Result<()> {
        tracing::info!(email, "revoking lister access");

        self.edit_policy(|policy| {
            policy.find_and_pop(None, &self.lister_role, email);
        })
        .await
    }

    /// # Errors
    pub async fn signed_download_url(&self, object_name: &str) -> Result<String> {
        let expires = Utc::now() + Duration::minutes(DOWNLOAD_URL_EXPIRY_MINUTES);

        let url = match &self.backend {
            Backend::Gcs(client) => client.signed_url(object_name, expires).await?,
            Backend::Dry(_) => {
                let unsigned = gcs::UnsignedUrl::new(&self.bucket, object_name, expires)?;
                tracing::info!(object_name, "would have signed a download URL");
                unsigned.sign("dry-run", "unsigned")
            }
        };

        tracing::info!(object_name, "generated signed download URL");

        Ok(url)
    }

    #[cfg(test)]
    pub(crate) async fn dry_policy(&self) -> Policy {
        match &self.backend {
            Backend::Dry(policy) => policy.lock().await.clone(),
            Backend::Gcs(_) => Policy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};

    use super::*;

    const EMAIL: &str = "someone@example.com";
    const LISTER_ROLE: &str = "projects/cidc/roles/CIDCObjectLister";

    #[fixture]
    fn storage() -> Storage {
        Storage::dry("cidc-data", LISTER_ROLE)
    }

    fn roles(policy: &Policy) -> Vec<&str> {
        policy.bindings.iter().map(|b| b.role.as_str()).collect()
    }

    #[rstest]
    #[tokio::test]
    async fn grant_then_revoke(storage: Storage) {
        storage.grant_lister_access(EMAIL).await.unwrap();
        storage
            .grant_download_access(EMAIL, Some("10021"), Some("wes_fastq"))
            .await
            .unwrap();
        storage
            .grant_download_access(EMAIL, Some("10021"), Some("wes_bam"))
            .await
            .unwrap();

        let policy = storage.dry_policy().await;
        assert_eq!(roles(&policy), [LISTER_ROLE, GOOGLE_DOWNLOAD_ROLE]);
        assert_eq!(policy.version, iam::POLICY_VERSION);

        storage
            .revoke_download_access(EMAIL, Some("10021"), Some("wes_fastq"))
            .await
            .unwrap();
        assert_eq!(roles(&storage.dry_policy().await), [LISTER_ROLE]);

        storage.revoke_lister_access(EMAIL).await.unwrap();
        assert!(storage.dry_policy().await.bindings.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn revoke_all_keeps_lister_access(storage: Storage) {
        storage.grant_lister_access(EMAIL).await.unwrap();
        for trial_id in ["10021", "10022", "E4412"] {
            storage
                .grant_download_access(EMAIL, Some(trial_id), None)
                .await
                .unwrap();
        }

        storage.revoke_all_download_access(EMAIL).await.unwrap();

        assert_eq!(roles(&storage.dry_policy().await), [LISTER_ROLE]);
    }

    #[rstest]
    #[tokio::test]
    async fn dry_signed_url_names_the_attachment(storage: Storage) {
        let url = storage
            .signed_download_url("10021/olink/assay_npx.xlsx")
            .await
            .unwrap();

        assert!(url.starts_with("https://storage.googleapis.com/cidc-data/10021/olink/assay_npx.xlsx?"));
        assert!(url.contains("10021_olink_assay_npx.xlsx"));
    }
}
