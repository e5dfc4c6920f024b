//! `aws ec2` and `aws ssm` backed [`InstanceCatalog`].
//!
//! Instance facts come from `ec2 describe-instances`; agent reachability and
//! platform come from `ssm describe-instance-information`. The role behind an
//! instance profile is looked up once per distinct profile.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Deserialize;
use tracing::warn;

use super::AwsCli;
use crate::cloud::{CloudError, CloudFuture, InstanceCatalog};
use crate::instance::{Instance, Platform, Reachability};
use crate::runner::CommandRunner;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<RawInstance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInstance {
    instance_id: String,
    #[serde(default)]
    private_ip_address: Option<String>,
    #[serde(default)]
    platform_details: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    iam_instance_profile: Option<ProfileRef>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProfileRef {
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInformationOutput {
    #[serde(default)]
    instance_information_list: Vec<AgentInformation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentInformation {
    instance_id: String,
    #[serde(default)]
    ping_status: String,
    #[serde(default)]
    platform_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetProfileOutput {
    instance_profile: InstanceProfile,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceProfile {
    #[serde(default)]
    roles: Vec<ProfileRole>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProfileRole {
    role_name: String,
}

impl RawInstance {
    fn profile_name(&self) -> Option<&str> {
        self.iam_instance_profile
            .as_ref()
            .and_then(|profile| profile.arn.rsplit_once('/'))
            .map(|(_, name)| name)
    }

    fn into_instance(
        self,
        agents: &BTreeMap<String, AgentInformation>,
        roles: &BTreeMap<String, Option<String>>,
    ) -> Instance {
        let agent = agents.get(&self.instance_id);
        let reachability = agent.map_or(Reachability::NoAgent, |info| {
            Reachability::from_raw(&info.ping_status)
        });
        let platform = agent
            .and_then(|info| info.platform_type.as_deref())
            .or(self.platform_details.as_deref())
            .map_or(Platform::Linux, Platform::from_raw);
        let iam_role = self
            .profile_name()
            .and_then(|profile| roles.get(profile).cloned().flatten());
        let name = self
            .tags
            .iter()
            .find(|tag| tag.key == "Name")
            .map(|tag| tag.value.clone());
        Instance {
            id: self.instance_id,
            name,
            reachability,
            platform,
            address: self
                .private_ip_address
                .as_deref()
                .and_then(|raw| raw.parse::<IpAddr>().ok()),
            iam_role,
        }
    }
}

impl<R: CommandRunner> AwsCli<R> {
    async fn describe_raw(&self, filter: &[&str]) -> Result<Vec<RawInstance>, CloudError> {
        let mut args = vec!["ec2", "describe-instances"];
        args.extend_from_slice(filter);
        let output: DescribeInstancesOutput = self.call_json("instances", &args).await?;
        Ok(output
            .reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .collect())
    }

    async fn agents(&self, filter: &[&str]) -> Result<BTreeMap<String, AgentInformation>, CloudError> {
        let mut args = vec!["ssm", "describe-instance-information"];
        args.extend_from_slice(filter);
        let output: DescribeInformationOutput =
            self.call_json("instance information", &args).await?;
        Ok(output
            .instance_information_list
            .into_iter()
            .map(|info| (info.instance_id.clone(), info))
            .collect())
    }

    /// Resolves each distinct instance profile to its first role. Profiles
    /// that cannot be read map to `None`; staged transfers to such targets
    /// fail later for lack of a principal.
    async fn roles(&self, raw: &[RawInstance]) -> BTreeMap<String, Option<String>> {
        let mut roles = BTreeMap::new();
        for profile in raw.iter().filter_map(RawInstance::profile_name) {
            if roles.contains_key(profile) {
                continue;
            }
            let resource = format!("instance profile {profile}");
            let role = match self
                .call_json::<GetProfileOutput>(
                    &resource,
                    &["iam", "get-instance-profile", "--instance-profile-name", profile],
                )
                .await
            {
                Ok(output) => output
                    .instance_profile
                    .roles
                    .into_iter()
                    .next()
                    .map(|role| role.role_name),
                Err(err) => {
                    warn!(profile, error = %err, "failed to resolve instance profile role");
                    None
                }
            };
            roles.insert(profile.to_owned(), role);
        }
        roles
    }
}

impl<R: CommandRunner> InstanceCatalog for AwsCli<R> {
    fn list_instances(&self) -> CloudFuture<'_, Vec<Instance>> {
        Box::pin(async move {
            let raw = self
                .describe_raw(&["--filters", "Name=instance-state-name,Values=running"])
                .await?;
            let agents = self.agents(&[]).await?;
            let roles = self.roles(&raw).await;
            Ok(raw
                .into_iter()
                .map(|instance| instance.into_instance(&agents, &roles))
                .collect())
        })
    }

    fn describe_instance<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, Option<Instance>> {
        Box::pin(async move {
            let raw = match self.describe_raw(&["--instance-ids", instance_id]).await {
                Ok(raw) => raw,
                Err(CloudError::NotFound { .. }) => return Ok(None),
                Err(err) => return Err(err),
            };
            let id_filter = format!("Key=InstanceIds,Values={instance_id}");
            let agents = self.agents(&["--filters", &id_filter]).await?;
            let roles = self.roles(&raw).await;
            Ok(raw
                .into_iter()
                .find(|instance| instance.instance_id == instance_id)
                .map(|instance| instance.into_instance(&agents, &roles)))
        })
    }
}
