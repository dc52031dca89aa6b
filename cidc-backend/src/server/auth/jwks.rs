use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header,
    jwk::{Jwk, JwkSet},
};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::Error;

const JWKS_MAX_AGE_HOURS: i64 = 1;
/// Unknown key ids trigger at most one refetch per this many seconds.
const JWKS_MIN_REFETCH_SECONDS: i64 = 60;

#[derive(Deserialize)]
struct Claims {
    email: Option<String>,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: DateTime<Utc>,
}

impl CachedJwks {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at > Duration::hours(JWKS_MAX_AGE_HOURS)
    }

    fn may_refetch(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at >= Duration::seconds(JWKS_MIN_REFETCH_SECONDS)
    }
}

/// Verifies OIDC id tokens against the identity provider's published keys.
pub struct Verifier {
    http: reqwest::Client,
    jwks_url: String,
    issuer: String,
    audience: String,
    cache: RwLock<Option<CachedJwks>>,
}

impl Verifier {
    #[must_use]
    pub fn new(http: reqwest::Client, auth_domain: &str, client_id: &str) -> Self {
        Self {
            http,
            jwks_url: format!("https://{auth_domain}/.well-known/jwks.json"),
            issuer: format!("https://{auth_domain}/"),
            audience: client_id.to_string(),
            cache: RwLock::new(None),
        }
    }

    /// Whether the key set may be fetched again, which is throttled unless
    /// the cached set is missing or stale.
    async fn may_refresh(&self) -> bool {
        let cache = self.cache.read().await;

        cache.as_ref().is_none_or(|c| c.may_refetch(Utc::now()))
    }

    async fn cached_key(&self, kid: &str) -> Option<Jwk> {
        let cache = self.cache.read().await;
        let cached = cache.as_ref().filter(|c| !c.is_stale(Utc::now()))?;

        cached.keys.find(kid).cloned()
    }

    async fn refresh(&self) -> Result<(), Error> {
        let keys: JwkSet = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(Error::jwks)?
            .json()
            .await
            .map_err(Error::jwks)?;

        tracing::debug!(n_keys = keys.keys.len(), "fetched signing keys");

        *self.cache.write().await = Some(CachedJwks {
            keys,
            fetched_at: Utc::now(),
        });

        Ok(())
    }

    /// The key with id `kid`, refetching the key set when it is stale or
    /// does not know `kid`.
    async fn key(&self, kid: &str) -> Result<Jwk, Error> {
        if let Some(key) = self.cached_key(kid).await {
            return Ok(key);
        }

        if self.may_refresh().await {
            self.refresh().await?;
        } else {
            tracing::debug!(kid, "not refetching signing keys so soon");
        }

        self.cached_key(kid).await.ok_or_else(|| Error::InvalidToken {
            message: format!("no signing key with id {kid}"),
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);

        validation
    }

    /// The email an id token was issued to.
    ///
    /// # Errors
    /// [`Error::InvalidToken`] for anything but a current, correctly signed
    /// token for this client that carries an email.
    pub async fn email(&self, token: &str) -> Result<String, Error> {
        let header = decode_header(token).map_err(Error::invalid_token)?;
        let Some(kid) = header.kid else {
            return Err(Error::InvalidToken {
                message: "token header has no key id".to_string(),
            });
        };

        let jwk = self.key(&kid).await?;
        let key = DecodingKey::from_jwk(&jwk).map_err(Error::invalid_token)?;

        let claims = decode::<Claims>(token, &key, &self.validation())
            .map_err(Error::invalid_token)?
            .claims;

        claims.email.ok_or_else(|| Error::InvalidToken {
            message: "token has no email claim".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn verifier() -> Verifier {
        Verifier::new(reqwest::Client::new(), "cidc.example.auth0.com", "client-id")
    }

    #[test]
    fn endpoints_follow_auth_domain() {
        let verifier = verifier();

        assert_eq!(
            verifier.jwks_url,
            "https://cidc.example.auth0.com/.well-known/jwks.json"
        );
        assert_eq!(verifier.issuer, "https://cidc.example.auth0.com/");
    }

    #[test]
    fn key_set_goes_stale_after_an_hour() {
        let now = Utc::now();
        let cached = CachedJwks {
            keys: JwkSet { keys: Vec::new() },
            fetched_at: now - Duration::minutes(59),
        };

        assert!(!cached.is_stale(now));
        assert!(cached.is_stale(now + Duration::minutes(2)));
    }

    #[test]
    fn refetches_are_throttled_to_one_a_minute() {
        let now = Utc::now();
        let cached = CachedJwks {
            keys: JwkSet { keys: Vec::new() },
            fetched_at: now - Duration::seconds(30),
        };

        assert!(!cached.may_refetch(now));
        assert!(cached.may_refetch(now + Duration::seconds(30)));
    }

    #[tokio::test]
    async fn unknown_key_id_is_rejected_without_refetching() {
        let verifier = verifier();
        *verifier.cache.write().await = Some(CachedJwks {
            keys: JwkSet { keys: Vec::new() },
            fetched_at: Utc::now(),
        });

        let err = verifier.key("unknown").await.unwrap_err();

        assert!(matches!(err, Error::InvalidToken { .. }));
    }

    #[tokio::test]
    async fn garbage_token_is_rejected_without_fetching_keys() {
        let err = verifier().email("not-a-jwt").await.unwrap_err();

        assert!(matches!(err, Error::InvalidToken { .. }));
    }
}
