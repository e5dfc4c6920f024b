//! Grant scope and the policy document rendered for it.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::CredentialError;

const MAX_KEY_BYTES: usize = 1024;

/// Object-store action a grant may permit.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantAction {
    /// Read the staged object.
    GetObject,
    /// Write the staged object.
    PutObject,
    /// Abort a multi-part write of the staged object.
    AbortMultipartUpload,
}

impl GrantAction {
    /// IAM action name.
    #[must_use]
    pub const fn iam_action(self) -> &'static str {
        match self {
            Self::GetObject => "s3:GetObject",
            Self::PutObject => "s3:PutObject",
            Self::AbortMultipartUpload => "s3:AbortMultipartUpload",
        }
    }
}

/// What a grant permits: a fixed action set on exactly one object.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GrantScope {
    /// Staging bucket.
    pub bucket: String,
    /// Staged object key.
    pub key: String,
    /// Permitted actions.
    pub actions: Vec<GrantAction>,
}

impl GrantScope {
    /// Scope letting the target read one staged object.
    #[must_use]
    pub fn target_read(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            actions: vec![GrantAction::GetObject],
        }
    }

    /// Scope letting the target write one staged object.
    #[must_use]
    pub fn target_write(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            actions: vec![GrantAction::PutObject, GrantAction::AbortMultipartUpload],
        }
    }

    /// Checks that the scope names one concrete object and at least one
    /// action.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidScope`] describing the first
    /// violation.
    pub fn validate(&self) -> Result<(), CredentialError> {
        let invalid = |reason: &str| {
            Err(CredentialError::InvalidScope {
                reason: reason.to_owned(),
            })
        };
        if !is_valid_bucket_name(&self.bucket) {
            return invalid("bucket name must be 3-63 lowercase letters, digits, '-' or '.'");
        }
        if self.key.is_empty() || self.key.len() > MAX_KEY_BYTES {
            return invalid("object key must be between 1 and 1024 bytes");
        }
        if self.key.contains(['*', '?']) {
            return invalid("object key must not contain wildcards");
        }
        if self.actions.is_empty() {
            return invalid("at least one action is required");
        }
        Ok(())
    }

    /// ARN of the single object the scope covers.
    #[must_use]
    pub fn resource_arn(&self) -> String {
        format!("arn:aws:s3:::{}/{}", self.bucket, self.key)
    }

    /// Renders the policy document, valid until `expires_at`.
    #[must_use]
    pub fn document(&self, expires_at: DateTime<Utc>) -> Value {
        let actions = self
            .actions
            .iter()
            .map(|action| action.iam_action())
            .collect::<Vec<_>>();
        json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": "SluiceStagedTransfer",
                "Effect": "Allow",
                "Action": actions,
                "Resource": self.resource_arn(),
                "Condition": {
                    "DateLessThan": {
                        "aws:CurrentTime": expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
                    }
                }
            }]
        })
    }
}

fn is_valid_bucket_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '.'))
        && !name.starts_with(['-', '.'])
        && !name.ends_with(['-', '.'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case(GrantScope::target_read("sluice-staging-eu-west-1", "transfers/a/*"))]
    #[case(GrantScope::target_read("sluice-staging-eu-west-1", ""))]
    #[case(GrantScope::target_read("Bad_Bucket", "transfers/a/file"))]
    #[case(GrantScope {
        bucket: String::from("sluice-staging"),
        key: String::from("transfers/a/file"),
        actions: Vec::new(),
    })]
    fn validate_rejects_broad_or_empty_scopes(#[case] scope: GrantScope) {
        assert!(matches!(
            scope.validate(),
            Err(CredentialError::InvalidScope { .. })
        ));
    }

    #[test]
    fn document_is_limited_to_one_object_and_expiry() {
        let scope = GrantScope::target_write("sluice-staging", "transfers/r1/data.bin");
        let expires = Utc
            .with_ymd_and_hms(2026, 10, 18, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        let document = scope.document(expires);
        let statement = &document["Statement"][0];

        assert_eq!(
            statement["Resource"],
            "arn:aws:s3:::sluice-staging/transfers/r1/data.bin"
        );
        assert_eq!(
            statement["Action"],
            json!(["s3:PutObject", "s3:AbortMultipartUpload"])
        );
        assert_eq!(
            statement["Condition"]["DateLessThan"]["aws:CurrentTime"],
            "2026-10-18T12:00:00Z"
        );
    }
}
