//! `aws iam` backed [`AuthorizationStore`].

use super::AwsCli;
use crate::cloud::{AuthorizationStore, CloudFuture, GrantPolicy};
use crate::runner::CommandRunner;

impl<R: CommandRunner> AuthorizationStore for AwsCli<R> {
    fn put_policy<'a>(&'a self, policy: &'a GrantPolicy) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let document = policy.document.to_string();
            let resource = format!("role {}", policy.principal);
            self.call(
                &resource,
                &[
                    "iam",
                    "put-role-policy",
                    "--role-name",
                    &policy.principal,
                    "--policy-name",
                    &policy.name,
                    "--policy-document",
                    &document,
                ],
            )
            .await?;
            Ok(())
        })
    }

    fn delete_policy<'a>(&'a self, principal: &'a str, name: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let resource = format!("policy {name} on role {principal}");
            self.call(
                &resource,
                &[
                    "iam",
                    "delete-role-policy",
                    "--role-name",
                    principal,
                    "--policy-name",
                    name,
                ],
            )
            .await?;
            Ok(())
        })
    }
}
