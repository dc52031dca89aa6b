//! Expiring, prefix-conditioned bindings on a bucket IAM policy.

use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::INACTIVE_USER_DAYS;

/// Conditional bindings are only honored on policy version 3.
pub const POLICY_VERSION: i32 = 3;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub expression: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Binding {
    fn expression(&self) -> &str {
        self.condition
            .as_ref()
            .map(|c| c.expression.as_str())
            .unwrap_or_default()
    }

    fn matches(&self, prefix: Option<&str>, role: &str, member: &str) -> bool {
        let member_matches = matches!(self.members.as_slice(), [m] if m == member);
        let prefix_matches = prefix.is_none_or(|p| self.expression().contains(p));

        self.role == role && member_matches && prefix_matches
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Policy {
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    /// `etag`, `kind` and `resourceId` are passed back untouched.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// The object prefix a (trial, upload type) scope grants access to. A
/// missing trial or upload type becomes `*`, and only the first
/// `_`-separated word of the upload type is kept, so that `wes_bam` and
/// `wes_fastq` share the `wes` prefix.
#[must_use]
pub fn upload_prefix(trial_id: Option<&str>, upload_type: Option<&str>) -> String {
    let trial_id = trial_id.unwrap_or("*");
    let upload_type = upload_type.unwrap_or("*").to_lowercase().replace(' ', "_");
    let broad_type = upload_type.split('_').next().unwrap_or_default();

    format!("{trial_id}/{broad_type}")
}

#[must_use]
pub fn member(email: &str) -> String {
    format!("user:{email}")
}

/// A binding of `role` to `email` that expires `INACTIVE_USER_DAYS` after
/// `now`, restricted to objects under `prefix` if one is given.
#[must_use]
pub fn binding_with_expiry(
    bucket: &str,
    prefix: Option<&str>,
    role: &str,
    email: &str,
    now: DateTime<Utc>,
) -> Binding {
    let expiry_date = (now + Days::new(INACTIVE_USER_DAYS.unsigned_abs())).date_naive();

    let mut expression = format!(r#"request.time < timestamp("{expiry_date}T00:00:00Z")"#);
    if let Some(prefix) = prefix {
        expression.push_str(&format!(
            r#" && resource.name.startsWith("projects/_/buckets/{bucket}/objects/{prefix}")"#
        ));
    }

    Binding {
        role: role.to_string(),
        members: vec![member(email)],
        condition: Some(Condition {
            title: format!(
                "{role} access on {} until {expiry_date}",
                prefix.unwrap_or("bucket")
            ),
            description: format!("Auto-updated by the CIDC API on {now}"),
            expression,
        }),
    }
}

impl Policy {
    /// Remove and return the binding of `role` held by `email` alone whose
    /// condition mentions `prefix`. A `None` prefix matches any binding.
    pub fn find_and_pop(&mut self, prefix: Option<&str>, role: &str, email: &str) -> Option<Binding> {
        let member = member(email);

        let mut matching = self
            .bindings
            .iter()
            .enumerate()
            .filter(|(_, b)| b.matches(prefix, role, &member))
            .map(|(i, _)| i);

        let index = matching.next()?;
        if matching.next().is_some() {
            tracing::warn!(
                email,
                prefix,
                role,
                "found multiple conditional bindings for one user and prefix"
            );
        }

        Some(self.bindings.remove(index))
    }

    /// Replace any existing binding for this scope with a fresh one.
    pub fn grant(
        &mut self,
        bucket: &str,
        prefix: Option<&str>,
        role: &str,
        email: &str,
        now: DateTime<Utc>,
    ) {
        self.version = POLICY_VERSION;
        self.find_and_pop(prefix, role, email);
        self.bindings
            .push(binding_with_expiry(bucket, prefix, role, email, now));
    }

    /// Pop up to `max` matching bindings, returning how many were removed.
    pub fn revoke(&mut self, prefix: Option<&str>, role: &str, email: &str, max: usize) -> usize {
        self.version = POLICY_VERSION;

        let mut n_removed = 0;
        while n_removed < max && self.find_and_pop(prefix, role, email).is_some() {
            n_removed += 1;
        }

        n_removed
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;
    use crate::config::GOOGLE_DOWNLOAD_ROLE;

    const BUCKET: &str = "cidc-data";
    const EMAIL: &str = "someone@example.com";

    #[fixture]
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap()
    }

    #[rstest]
    #[case(Some("10021"), Some("wes_bam"), "10021/wes")]
    #[case(Some("10021"), Some("Participants Info"), "10021/participants")]
    #[case(None, Some("olink"), "*/olink")]
    #[case(Some("10021"), None, "10021/*")]
    #[case(None, None, "*/*")]
    fn prefixes(
        #[case] trial_id: Option<&str>,
        #[case] upload_type: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(upload_prefix(trial_id, upload_type), expected);
    }

    #[rstest]
    fn prefixed_binding(now: DateTime<Utc>) {
        let binding = binding_with_expiry(BUCKET, Some("10021/wes"), GOOGLE_DOWNLOAD_ROLE, EMAIL, now);
        let condition = binding.condition.unwrap();

        assert_eq!(binding.members, [format!("user:{EMAIL}")]);
        assert_eq!(
            condition.expression,
            r#"request.time < timestamp("2025-03-11T00:00:00Z") && resource.name.startsWith("projects/_/buckets/cidc-data/objects/10021/wes")"#
        );
        assert_eq!(
            condition.title,
            "roles/storage.objectViewer access on 10021/wes until 2025-03-11"
        );
    }

    #[rstest]
    fn bucket_wide_binding(now: DateTime<Utc>) {
        let binding = binding_with_expiry(BUCKET, None, "roles/storage.objectLister", EMAIL, now);
        let condition = binding.condition.unwrap();

        assert_eq!(
            condition.expression,
            r#"request.time < timestamp("2025-03-11T00:00:00Z")"#
        );
        assert!(condition.title.ends_with("access on bucket until 2025-03-11"));
    }

    #[rstest]
    fn regrant_replaces_binding(now: DateTime<Utc>) {
        let mut policy = Policy::default();
        policy.grant(BUCKET, Some("10021/wes"), GOOGLE_DOWNLOAD_ROLE, EMAIL, now);
        policy.grant(
            BUCKET,
            Some("10021/wes"),
            GOOGLE_DOWNLOAD_ROLE,
            EMAIL,
            now + Days::new(5),
        );

        assert_eq!(policy.version, POLICY_VERSION);
        assert_eq!(policy.bindings.len(), 1);
        assert!(
            policy.bindings[0]
                .condition
                .as_ref()
                .unwrap()
                .title
                .ends_with("2025-03-16")
        );
    }

    #[rstest]
    fn revoke_only_touches_matching_bindings(now: DateTime<Utc>) {
        let mut policy = Policy::default();
        policy.grant(BUCKET, Some("10021/wes"), GOOGLE_DOWNLOAD_ROLE, EMAIL, now);
        policy.grant(BUCKET, Some("10021/olink"), GOOGLE_DOWNLOAD_ROLE, EMAIL, now);
        policy.grant(BUCKET, Some("10021/wes"), GOOGLE_DOWNLOAD_ROLE, "other@example.com", now);
        policy.grant(BUCKET, None, "roles/storage.objectLister", EMAIL, now);

        assert_eq!(policy.revoke(Some("10021/wes"), GOOGLE_DOWNLOAD_ROLE, EMAIL, 20), 1);
        assert_eq!(policy.bindings.len(), 3);

        // an empty prefix is contained in every expression
        assert_eq!(policy.revoke(Some(""), GOOGLE_DOWNLOAD_ROLE, EMAIL, 250), 1);
        assert_eq!(policy.bindings.len(), 2);
        assert!(
            policy
                .bindings
                .iter()
                .all(|b| b.role != GOOGLE_DOWNLOAD_ROLE || b.members != [member(EMAIL)])
        );
    }

    #[test]
    fn shared_bindings_are_never_popped() {
        let mut policy: Policy = serde_json::from_value(json!({
            "version": 1,
            "etag": "CAE=",
            "bindings": [
                {"role": GOOGLE_DOWNLOAD_ROLE, "members": [member(EMAIL), "user:x@example.com"]}
            ]
        }))
        .unwrap();

        assert_eq!(policy.find_and_pop(None, GOOGLE_DOWNLOAD_ROLE, EMAIL), None);
        assert_eq!(policy.other.get("etag"), Some(&json!("CAE=")));
    }
}
