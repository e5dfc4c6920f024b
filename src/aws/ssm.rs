//! `aws ssm` backed [`SessionBroker`].

use serde::Deserialize;
use serde_json::json;

use super::AwsCli;
use crate::cloud::{
    CloudError, CloudFuture, CommandHandle, InvocationState, InvocationStatus, RemoteCommand,
    SessionBroker,
};
use crate::runner::CommandRunner;

const RUN_SHELL_DOCUMENT: &str = "AWS-RunShellScript";

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendCommandOutput {
    command: SentCommand,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SentCommand {
    command_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvocationOutput {
    status: String,
    #[serde(default)]
    response_code: Option<i32>,
    #[serde(default)]
    standard_output_content: String,
    #[serde(default)]
    standard_error_content: String,
}

impl From<InvocationOutput> for InvocationStatus {
    fn from(raw: InvocationOutput) -> Self {
        let state = InvocationState::from_raw(&raw.status);
        // The agent reports -1 until the script has exited.
        let exit_code = raw
            .response_code
            .filter(|code| *code >= 0 && state.is_terminal());
        Self {
            state,
            exit_code,
            stdout: raw.standard_output_content,
            stderr: raw.standard_error_content,
        }
    }
}

impl<R: CommandRunner> SessionBroker for AwsCli<R> {
    fn send_command<'a>(
        &'a self,
        instance_id: &'a str,
        command: &'a RemoteCommand,
    ) -> CloudFuture<'a, CommandHandle> {
        Box::pin(async move {
            let timeout = command.execution_timeout.as_secs().max(1).to_string();
            let parameters = json!({
                "commands": [command.script],
                "executionTimeout": [timeout],
            })
            .to_string();
            let resource = format!("instance {instance_id}");
            let sent: SendCommandOutput = self
                .call_json(
                    &resource,
                    &[
                        "ssm",
                        "send-command",
                        "--instance-ids",
                        instance_id,
                        "--document-name",
                        RUN_SHELL_DOCUMENT,
                        "--comment",
                        "sluice",
                        "--parameters",
                        &parameters,
                    ],
                )
                .await?;
            Ok(CommandHandle {
                command_id: sent.command.command_id,
                instance_id: instance_id.to_owned(),
            })
        })
    }

    fn poll_command<'a>(&'a self, handle: &'a CommandHandle) -> CloudFuture<'a, InvocationStatus> {
        Box::pin(async move {
            let resource = format!("command {}", handle.command_id);
            let polled = self
                .call_json::<InvocationOutput>(
                    &resource,
                    &[
                        "ssm",
                        "get-command-invocation",
                        "--command-id",
                        &handle.command_id,
                        "--instance-id",
                        &handle.instance_id,
                    ],
                )
                .await;
            match polled {
                Ok(raw) => Ok(raw.into()),
                // Invocations are not visible for a moment after submission.
                Err(CloudError::NotFound { .. }) => Ok(InvocationStatus::pending()),
                Err(err) => Err(err),
            }
        })
    }
}
