//! Remote command assembly for in-guest exec. Session environment written at
//! start time is sourced first, explicit env comes next in sorted order, and
//! the argv itself is single-quoted so guest shells never reinterpret it.

use std::collections::BTreeMap;

const SESSION_ENV: &str = "/etc/sbx/session-env.sh";

/// Single-quotes one word for POSIX sh, escaping embedded quotes as
/// `'"'"'`.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r#"'"'"'"#))
}

/// Builds the one-line command string run on the guest.
pub fn build_remote_command(
    argv: &[String],
    env: &BTreeMap<String, String>,
    working_dir: Option<&str>,
) -> String {
    let mut cmd = format!("[ -f {SESSION_ENV} ] && . {SESSION_ENV}; ");
    for (key, value) in env {
        cmd.push_str("export ");
        cmd.push_str(key);
        cmd.push('=');
        cmd.push_str(&shell_quote(value));
        cmd.push_str("; ");
    }
    if let Some(dir) = working_dir {
        cmd.push_str("cd ");
        cmd.push_str(&shell_quote(dir));
        cmd.push_str(" && ");
    }
    let quoted: Vec<String> = argv.iter().map(|a| shell_quote(a)).collect();
    cmd.push_str(&quoted.join(" "));
    cmd
}
