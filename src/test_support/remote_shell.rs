//! Interpreter for the shell snippets sent to targets.
//!
//! Only the shapes produced by the transfer paths are understood, plus
//! `echo`, `true`, `false` and `exit` for ad-hoc commands. Object-store copies
//! made by the target are checked against the policies attached to the
//! target's role, so tests observe the effect of granting and revoking.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::fake_cloud::{FakeState, Fault};
use crate::cloud::{InvocationState, InvocationStatus};
use crate::instance::Instance;

#[derive(Debug, Default)]
pub(super) struct ShellOutcome {
    code: i32,
    stdout: String,
    stderr: String,
}

impl ShellOutcome {
    fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub(super) fn into_status(self) -> InvocationStatus {
        InvocationStatus {
            state: if self.code == 0 {
                InvocationState::Success
            } else {
                InvocationState::Failed
            },
            exit_code: Some(self.code),
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Returns `true` when the script copies to or from the object store.
pub(super) fn is_remote_copy(script: &str) -> bool {
    tokenize(script)
        .windows(2)
        .any(|pair| matches!(pair, [s3, cp] if s3 == "s3" && cp == "cp"))
}

/// Runs `script` on `target` against the fake state.
pub(super) fn execute(state: &mut FakeState, target: &Instance, script: &str) -> ShellOutcome {
    let tokens = tokenize(script);
    if tokens.first().map(String::as_str) == Some("printf")
        && tokens.get(1).map(String::as_str) == Some("%s  %s\\n")
    {
        return commit(state, target, &tokens);
    }

    let mut stdout = String::new();
    for segment in tokens.split(|token| token == "&&") {
        let outcome = run_segment(state, target, segment);
        stdout.push_str(&outcome.stdout);
        if outcome.code != 0 {
            return ShellOutcome { stdout, ..outcome };
        }
    }
    ShellOutcome::ok(stdout)
}

fn file_key(target: &Instance, path: &str) -> (String, String) {
    (target.id.clone(), path.to_owned())
}

fn missing(path: &str) -> ShellOutcome {
    ShellOutcome::fail(1, format!("{path}: No such file or directory\n"))
}

fn run_segment(state: &mut FakeState, target: &Instance, tokens: &[String]) -> ShellOutcome {
    let words = tokens.iter().map(String::as_str).collect::<Vec<_>>();
    match words.as_slice() {
        ["mkdir", "-p", _] | ["true"] => ShellOutcome::ok(""),
        ["false"] => ShellOutcome::fail(1, ""),
        ["exit", code] => ShellOutcome::fail(code.parse().unwrap_or(1), ""),
        ["echo", rest @ ..] => ShellOutcome::ok(format!("{}\n", rest.join(" "))),
        [":", ">", path] => {
            state.files.insert(file_key(target, path), Vec::new());
            ShellOutcome::ok("")
        }
        ["rm", "-f", path] => {
            state.files.remove(&file_key(target, path));
            ShellOutcome::ok("")
        }
        ["printf", "%s", encoded, "|", "base64", "-d", ">>", path] => {
            match STANDARD.decode(encoded) {
                Ok(bytes) => {
                    state
                        .files
                        .entry(file_key(target, path))
                        .or_default()
                        .extend_from_slice(&bytes);
                    ShellOutcome::ok("")
                }
                Err(err) => ShellOutcome::fail(1, format!("base64: invalid input: {err}\n")),
            }
        }
        ["stat", "-c", "%s", path] => state
            .files
            .get(&file_key(target, path))
            .map_or_else(|| missing(path), |bytes| ShellOutcome::ok(format!("{}\n", bytes.len()))),
        ["sha256sum", path, "|", "cut", "-d", " ", "-f", "1"] => state
            .files
            .get(&file_key(target, path))
            .map_or_else(|| missing(path), |bytes| ShellOutcome::ok(format!("{}\n", sha256_hex(bytes)))),
        ["dd", input, block, skip, "count=1", "2>/dev/null", "|", "base64", "|", "tr", "-d", "\\n"] => {
            read_block(state, target, input, block, skip)
        }
        [_, "s3", "cp", source, destination, ..] => copy(state, target, source, destination),
        [program, ..] => ShellOutcome::fail(127, format!("sh: {program}: command not found\n")),
        [] => ShellOutcome::ok(""),
    }
}

fn read_block(
    state: &FakeState,
    target: &Instance,
    input: &str,
    block: &str,
    skip: &str,
) -> ShellOutcome {
    let parsed = (
        input.strip_prefix("if="),
        block.strip_prefix("bs=").and_then(|raw| raw.parse::<usize>().ok()),
        skip.strip_prefix("skip=").and_then(|raw| raw.parse::<usize>().ok()),
    );
    let (Some(path), Some(size), Some(index)) = parsed else {
        return ShellOutcome::fail(1, "dd: invalid operand\n");
    };
    let Some(bytes) = state.files.get(&file_key(target, path)) else {
        return ShellOutcome::ok("");
    };
    let start = size.saturating_mul(index).min(bytes.len());
    let end = start.saturating_add(size).min(bytes.len());
    ShellOutcome::ok(STANDARD.encode(bytes.get(start..end).unwrap_or_default()))
}

fn commit(state: &mut FakeState, target: &Instance, tokens: &[String]) -> ShellOutcome {
    let (Some(expected), Some(tmp), Some(destination)) =
        (tokens.get(2), tokens.get(3), tokens.last())
    else {
        return ShellOutcome::fail(2, "malformed commit\n");
    };
    let tmp_key = file_key(target, tmp);
    let matches = state
        .files
        .get(&tmp_key)
        .is_some_and(|bytes| sha256_hex(bytes) == *expected);
    if !matches {
        state.files.remove(&tmp_key);
        return ShellOutcome::fail(3, "checksum mismatch\n");
    }
    if let Some(bytes) = state.files.remove(&tmp_key) {
        state.files.insert(file_key(target, destination), bytes);
    }
    ShellOutcome::ok("")
}

fn copy(state: &mut FakeState, target: &Instance, source: &str, destination: &str) -> ShellOutcome {
    if state.faults.contains(&Fault::RemoteCopy) {
        return ShellOutcome::fail(1, "upload failed: connection reset by peer\n");
    }

    if let Some((bucket, key)) = parse_url(source) {
        if !authorized(state, target, bucket, key, "s3:GetObject") {
            return access_denied("GetObject");
        }
        let Some(bytes) = state.objects.get(&(bucket.to_owned(), key.to_owned())).cloned() else {
            return ShellOutcome::fail(1, "fatal error: An error occurred (404) when calling the HeadObject operation\n");
        };
        state.files.insert(file_key(target, destination), bytes);
        return ShellOutcome::ok("");
    }

    if let Some((bucket, key)) = parse_url(destination) {
        if !authorized(state, target, bucket, key, "s3:PutObject") {
            return access_denied("PutObject");
        }
        let Some(bytes) = state.files.get(&file_key(target, source)).cloned() else {
            return ShellOutcome::fail(1, format!("The user-provided path {source} does not exist.\n"));
        };
        if !state.buckets.contains_key(bucket) {
            return ShellOutcome::fail(1, "An error occurred (NoSuchBucket)\n");
        }
        state.objects.insert((bucket.to_owned(), key.to_owned()), bytes);
        return ShellOutcome::ok("");
    }

    ShellOutcome::fail(1, "local to local copies are not supported\n")
}

fn access_denied(operation: &str) -> ShellOutcome {
    ShellOutcome::fail(
        1,
        format!("An error occurred (AccessDenied) when calling the {operation} operation\n"),
    )
}

fn parse_url(url: &str) -> Option<(&str, &str)> {
    url.strip_prefix("s3://")?.split_once('/')
}

fn authorized(state: &FakeState, target: &Instance, bucket: &str, key: &str, action: &str) -> bool {
    let Some(role) = target.iam_role.as_deref() else {
        return false;
    };
    let resource = format!("arn:aws:s3:::{bucket}/{key}");
    let now = Utc::now();
    state
        .policies
        .iter()
        .filter(|((principal, _), _)| principal == role)
        .any(|(_, document)| statement_allows(document, &resource, action, now))
}

fn statement_allows(document: &Value, resource: &str, action: &str, now: DateTime<Utc>) -> bool {
    let Some(statements) = document.get("Statement").and_then(Value::as_array) else {
        return false;
    };
    statements.iter().any(|statement| {
        let allows = statement.get("Effect").and_then(Value::as_str) == Some("Allow");
        let covers = statement.get("Resource").and_then(Value::as_str) == Some(resource);
        let permits = statement
            .get("Action")
            .and_then(Value::as_array)
            .is_some_and(|actions| actions.iter().any(|item| item.as_str() == Some(action)));
        let current = statement
            .pointer("/Condition/DateLessThan/aws:CurrentTime")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .is_none_or(|expiry| now < expiry);
        allows && covers && permits && current
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Splits a script into words, honouring single quotes, double quotes and
/// backslash escapes the way a POSIX shell would for the snippets used here.
fn tokenize(script: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = script.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_token = true;
                for inner in chars.by_ref() {
                    if inner == '\'' {
                        break;
                    }
                    current.push(inner);
                }
            }
            '"' => {
                in_token = true;
                while let Some(inner) = chars.next() {
                    match inner {
                        '"' => break,
                        '\\' => current.extend(chars.next()),
                        other => current.push(other),
                    }
                }
            }
            '\\' => {
                in_token = true;
                current.extend(chars.next());
            }
            ch if ch.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}
