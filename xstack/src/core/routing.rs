//! Runner argv formatting, output routing, and the optional-bundle coercion.

use std::path::Path;

use serde_json::{Value, json};

use super::extensions::{COMPATX_RUNNER, RunnerFamily};
use super::refusal::Refusal;

/// Gate command that forwards runner argv unmodified.
pub const SNAPSHOT_GATE_COMMAND: &str = "snapshot";

/// Substitute `{repo_root}`/`{profile}` and swap a leading `python`/`python3`
/// token for `interpreter`.
pub fn format_argv(
    command: &[String],
    repo_root: &str,
    profile: &str,
    interpreter: &str,
) -> Result<Vec<String>, Refusal> {
    let Some(head) = command.first() else {
        return Err(Refusal::InvalidRunnerCommand("empty command".to_string()));
    };
    if head.trim().is_empty() {
        return Err(Refusal::InvalidRunnerCommand(
            "command has an empty program token".to_string(),
        ));
    }
    let mut argv = Vec::with_capacity(command.len());
    for (index, token) in command.iter().enumerate() {
        if index == 0 && (token == "python" || token == "python3") {
            argv.push(interpreter.to_string());
            continue;
        }
        argv.push(
            token
                .replace("{repo_root}", repo_root)
                .replace("{profile}", profile),
        );
    }
    Ok(argv)
}

/// Directory name under `artifacts/` for a node.
pub fn artifact_dir_name<'a>(runner_id: &'a str, group_id: &'a str) -> &'a str {
    if group_id.is_empty() {
        runner_id
    } else {
        group_id
    }
}

/// Output flags for a family as `(flag, value)` pairs rooted at `artifact_dir`.
pub fn routing_flags(family: RunnerFamily, artifact_dir: &Path) -> Vec<(&'static str, String)> {
    let file = |name: &str| artifact_dir.join(name).display().to_string();
    let dir = artifact_dir.display().to_string();
    match family {
        RunnerFamily::Policy => vec![
            ("--proof-manifest-out", file("proof_manifest.json")),
            ("--profile-out", file("REPOX_PROFILE.json")),
        ],
        RunnerFamily::Tests => vec![
            ("--summary-json", file("TESTX_SUMMARY.json")),
            ("--summary-md", file("TESTX_SUMMARY.md")),
            ("--run-meta-json", file("TESTX_RUN_META.json")),
        ],
        RunnerFamily::Audit | RunnerFamily::Performance | RunnerFamily::Compatibility => {
            vec![("--output-root", dir)]
        }
        RunnerFamily::Security => vec![("--output-dir", dir)],
    }
}

/// Append the family's routing flags that `argv` does not already carry.
///
/// Snapshot mode and runners without a family are returned unmodified.
pub fn route_output(
    mut argv: Vec<String>,
    gate_command: &str,
    family: Option<RunnerFamily>,
    artifact_dir: &Path,
) -> Vec<String> {
    if gate_command == SNAPSHOT_GATE_COMMAND {
        return argv;
    }
    let Some(family) = family else {
        return argv;
    };
    for (flag, value) in routing_flags(family, artifact_dir) {
        let present = argv
            .iter()
            .any(|token| token == flag || token.starts_with(&format!("{flag}=")));
        if !present {
            argv.push(flag.to_string());
            argv.push(value);
        }
    }
    argv
}

/// Downgrade a compatibility-runner optional-bundle refusal to a non-gating skip.
///
/// Returns the replacement `(exit_code, output)` when every condition holds:
/// the runner is `compatx_runner`, it exited non-zero, its output is a JSON
/// object with `result == "refused"`, and its refusal codes include
/// `refuse.bundle_optional_flag`.
pub fn coerce_optional_refusal(
    runner_id: &str,
    exit_code: i32,
    output: &str,
) -> Option<(i32, String)> {
    if runner_id != COMPATX_RUNNER || exit_code == 0 {
        return None;
    }
    let mut payload: Value = serde_json::from_str(output.trim()).ok()?;
    let object = payload.as_object_mut()?;
    if object.get("result").and_then(Value::as_str) != Some("refused") {
        return None;
    }
    let optional = Refusal::BundleOptionalFlag.code();
    if !refusal_codes(object).iter().any(|code| code == optional) {
        return None;
    }
    object.insert("result".to_string(), json!("skipped_optional"));
    object.insert("non_gating".to_string(), json!(true));
    object.insert("original_exit_code".to_string(), json!(exit_code));
    let annotated = crate::core::canonical::canonical_json(&payload).ok()?;
    Some((0, annotated))
}

/// Refusal codes from `refusal_codes: [..]`, `refusals: [{code}]`, or `refusal: {code}`.
fn refusal_codes(object: &serde_json::Map<String, Value>) -> Vec<String> {
    let mut codes = Vec::new();
    if let Some(items) = object.get("refusal_codes").and_then(Value::as_array) {
        codes.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
    }
    if let Some(items) = object.get("refusals").and_then(Value::as_array) {
        codes.extend(
            items
                .iter()
                .filter_map(|item| item.get("code").and_then(Value::as_str))
                .map(str::to_string),
        );
    }
    if let Some(code) = object
        .get("refusal")
        .and_then(|refusal| refusal.get("code"))
        .and_then(Value::as_str)
    {
        codes.push(code.to_string());
    }
    codes
}
