//! Unit tests for the `sluice` CLI binary implementation.
//!
//! Keeping these tests in a separate module helps keep `src/main.rs` focused
//! on dispatch.

use super::*;
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use sluice::executor::{CommandOutcome, TargetOutcome};
use sluice::test_support::{FakeCloud, instance};
use sluice::transfer::TransferFailure;
use tempfile::TempDir;

use crate::cli::UploadArgs;

struct Workspace {
    _tmp: TempDir,
    root: Utf8PathBuf,
    config: SluiceConfig,
    cloud: Arc<FakeCloud>,
}

#[fixture]
fn workspace() -> Workspace {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    let config = SluiceConfig {
        registry_dir: Some(root.join("state").into_string()),
        grant_propagation_secs: 0,
        ..SluiceConfig::with_region("eu-west-1")
    };
    let cloud = Arc::new(FakeCloud::new());
    cloud.add_instance(instance("i-0aaa", Some("web-1")));
    cloud.add_instance(instance("i-0bbb", Some("web-2")));
    Workspace {
        _tmp: tmp,
        root,
        config,
        cloud,
    }
}

fn rendered(buffer: Vec<u8>) -> String {
    String::from_utf8(buffer).expect("utf8 output")
}

#[test]
fn validate_command_args_rejects_control_characters() {
    let err =
        validate_command_args(&[String::from("echo\tbad")]).expect_err("tab should be rejected");

    assert!(
        matches!(err, CliError::InvalidCommand(ref message) if message.contains("control characters")),
        "unexpected error: {err}"
    );
}

#[test]
fn validate_command_args_accepts_safe_arguments() {
    assert!(validate_command_args(&[String::from("echo"), String::from("ok")]).is_ok());
}

#[test]
fn render_remote_command_escapes_arguments() {
    let args = vec![
        String::from("echo"),
        String::from("a b"),
        String::from("c'd"),
    ];

    assert_eq!(render_remote_command(&args), "echo 'a b' 'c'\\''d'");
}

#[rstest]
#[case("2\n", Ok(1))]
#[case("1\n", Ok(0))]
#[case("\n", Err(SelectionCancelled))]
#[case("3\n", Err(SelectionCancelled))]
#[case("0\n", Err(SelectionCancelled))]
#[case("web\n", Err(SelectionCancelled))]
fn prompt_selection_is_one_based(
    #[case] answer: &str,
    #[case] expected: Result<usize, SelectionCancelled>,
) {
    let items = [instance("i-0aaa", Some("web")), instance("i-0bbb", Some("web"))];
    let mut prompt = Vec::new();

    let chosen = choose(answer.as_bytes(), &mut prompt, &items);

    assert_eq!(chosen, expected);
    let shown = rendered(prompt);
    assert!(shown.contains("1) web (i-0aaa)"), "prompt: {shown}");
    assert!(shown.contains("2) web (i-0bbb)"), "prompt: {shown}");
}

#[rstest]
#[case(Some("entry-1"), true)]
#[case(None, false)]
fn transfer_errors_mention_cleanup_when_an_entry_remains(
    #[case] entry_id: Option<&str>,
    #[case] hinted: bool,
) {
    let err = CliError::from(TransferError::new(
        "req-1",
        "i-0001",
        entry_id,
        TransferFailure::Interrupted,
    ));
    let mut buf = Vec::new();

    write_error(&mut buf, &err);

    let shown = rendered(buf);
    assert!(shown.starts_with("error: transfer req-1 on i-0001 failed"), "shown: {shown}");
    assert_eq!(shown.contains("sluice cleanup"), hinted, "shown: {shown}");
}

fn outcome(target: &str, result: Result<&str, i32>) -> TargetOutcome {
    TargetOutcome {
        target: target.to_owned(),
        result: result
            .map(|stdout| CommandOutcome {
                target: target.to_owned(),
                stdout: stdout.to_owned(),
                stderr: String::new(),
            })
            .map_err(|code| ExecError::RemoteExit {
                target: target.to_owned(),
                code: Some(code),
                stdout: String::new(),
                stderr: String::from("boom\n"),
            }),
    }
}

#[rstest]
#[case(vec![Ok("a"), Ok("b")], 0)]
#[case(vec![Ok("a"), Err(7)], EXIT_PARTIAL)]
#[case(vec![Err(1), Err(7)], EXIT_FAILURE)]
fn exec_exit_codes(#[case] results: Vec<Result<&str, i32>>, #[case] expected: i32) {
    let report = RunManyReport {
        outcomes: results
            .into_iter()
            .enumerate()
            .map(|(index, result)| outcome(&format!("i-{index}"), result))
            .collect(),
    };

    assert_eq!(exit_code_for(report), expected);
}

#[test]
fn exec_report_lists_output_and_a_row_per_target() {
    let report = RunManyReport {
        outcomes: vec![outcome("i-0aaa", Ok("hello\n")), outcome("i-0bbb", Err(7))],
    };
    let mut buf = Vec::new();

    write_exec_report(&mut buf, &report).expect("write report");

    let shown = rendered(buf);
    assert!(shown.contains("[i-0aaa] hello"), "shown: {shown}");
    assert!(shown.contains("exit     status 7 boom"), "shown: {shown}");
    assert!(shown.ends_with("1 succeeded, 1 failed\n"), "shown: {shown}");
}

#[rstest]
#[tokio::test]
async fn instances_lists_the_catalog(workspace: Workspace) {
    let mut out = Vec::new();

    let code = run(
        Arc::clone(&workspace.cloud),
        &workspace.config,
        Command::Instances,
        &mut out,
    )
    .await
    .expect("list instances");

    assert_eq!(code, 0);
    let shown = rendered(out);
    assert!(shown.contains("i-0aaa"), "shown: {shown}");
    assert!(shown.contains("web-2"), "shown: {shown}");
}

#[rstest]
#[tokio::test]
async fn exec_resolves_names_and_runs_everywhere(workspace: Workspace) {
    let mut out = Vec::new();
    let command = Command::Exec(ExecCommand {
        targets: vec![String::from("web-1"), String::from("i-0bbb")],
        concurrency: Some(2),
        timeout: Some(30),
        command: vec![String::from("echo"), String::from("hi")],
    });

    let code = run(Arc::clone(&workspace.cloud), &workspace.config, command, &mut out)
        .await
        .expect("exec");

    assert_eq!(code, 0);
    let shown = rendered(out);
    assert!(shown.contains("[i-0aaa] hi"), "shown: {shown}");
    assert!(shown.contains("[i-0bbb] hi"), "shown: {shown}");
}

#[rstest]
#[tokio::test]
async fn upload_writes_the_remote_file(workspace: Workspace) {
    let local = workspace.root.join("notes.txt");
    std::fs::write(&local, b"small payload").expect("write local file");
    let mut out = Vec::new();
    let command = Command::Transfer(TransferCommand::Upload(UploadArgs {
        target: String::from("web-1"),
        local: local.to_string(),
        remote: String::from("/srv/notes.txt"),
    }));

    let code = run(Arc::clone(&workspace.cloud), &workspace.config, command, &mut out)
        .await
        .expect("upload");

    assert_eq!(code, 0);
    assert_eq!(
        workspace.cloud.remote_file("i-0aaa", "/srv/notes.txt").as_deref(),
        Some(b"small payload".as_slice())
    );
    assert!(rendered(out).contains("direct route"));
}

#[rstest]
#[tokio::test]
async fn missing_local_file_is_reported(workspace: Workspace) {
    let mut out = Vec::new();
    let command = Command::Transfer(TransferCommand::Upload(UploadArgs {
        target: String::from("i-0aaa"),
        local: workspace.root.join("absent.bin").into_string(),
        remote: String::from("/srv/absent.bin"),
    }));

    let err = run(Arc::clone(&workspace.cloud), &workspace.config, command, &mut out)
        .await
        .expect_err("missing file");

    assert!(matches!(err, CliError::LocalFile { .. }), "unexpected error: {err}");
}

#[rstest]
#[tokio::test]
async fn cleanup_prints_a_summary(workspace: Workspace) {
    let mut out = Vec::new();

    let code = run(
        Arc::clone(&workspace.cloud),
        &workspace.config,
        Command::Cleanup,
        &mut out,
    )
    .await
    .expect("cleanup");

    assert_eq!(code, 0);
    assert!(rendered(out).starts_with("cleanup: removed 0 entries"));
}
