use std::process::Command;

const UNKNOWN: &str = "unknown";

fn main() {
    let built_at = command_stdout("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])
        .or_else(|| {
            command_stdout(
                "powershell",
                &[
                    "-Command",
                    "(Get-Date).ToUniversalTime().ToString('yyyy-MM-ddTHH:mm:ssZ')",
                ],
            )
        })
        .unwrap_or_else(|| UNKNOWN.into());
    println!("cargo:rustc-env=BUILD_TIMESTAMP={built_at}");

    let git_sha = command_stdout("git", &["rev-parse", "--short", "HEAD"])
        .unwrap_or_else(|| UNKNOWN.into());
    println!("cargo:rustc-env=BUILD_GIT_SHA={git_sha}");

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");
}

/// Trimmed stdout of a successful command, `None` if it is missing or fails.
fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
