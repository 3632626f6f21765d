//! General utilities shared across the satellite.

use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

// ─────────────────────────────────────────────────────────────────────────────
// Time & Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Nanoseconds since the Unix epoch; used for connection ids and debug
/// recording filenames. Returns 0 if the clock is before the epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Trigger Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Runs a configured trigger command, feeding `input` on stdin when given.
///
/// Failures are logged and swallowed: a broken user command must never take
/// the satellite down.
pub async fn run_event_command(command: &Option<Vec<String>>, input: Option<&str>) {
    let Some(command) = command else {
        return;
    };
    let Some((program, args)) = command.split_first() else {
        return;
    };

    log::debug!("Running {:?}", command);
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            log::error!("Could not run {:?}: {}", command, err);
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Some(input) = input {
            let _ = stdin.write_all(input.as_bytes()).await;
        }
        drop(stdin); // close stdin so the command can finish
    }

    if let Err(err) = child.wait().await {
        log::error!("Error waiting for {:?}: {}", command, err);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wake Word Names
// ─────────────────────────────────────────────────────────────────────────────

/// Normalizes a wake word name for comparison: lower-case, strip a trailing
/// version suffix (`v1`, `v0.2`), map non-alphanumerics to spaces and
/// collapse runs of whitespace.
///
/// `"ok_nabu_v0.1"`, `"OK Nabu"` and `"ok-nabu"` all normalize to
/// `"ok nabu"`.
pub fn normalize_wake_word(name: &str) -> String {
    let lowered = name.to_lowercase();
    let stripped = strip_version_suffix(&lowered);

    let mut normalized = String::with_capacity(stripped.len());
    let mut last_was_space = true;
    for ch in stripped.chars() {
        if ch.is_alphanumeric() {
            normalized.push(ch);
            last_was_space = false;
        } else if !last_was_space {
            normalized.push(' ');
            last_was_space = true;
        }
    }
    while normalized.ends_with(' ') {
        normalized.pop();
    }
    normalized
}

/// Removes a trailing `v<digits>` or `v<digits>.<digits>` version token.
fn strip_version_suffix(name: &str) -> &str {
    let bytes = name.as_bytes();
    let mut idx = bytes.len();

    let mut digits = 0;
    while idx > 0 && bytes[idx - 1].is_ascii_digit() {
        idx -= 1;
        digits += 1;
    }
    if digits == 0 {
        return name;
    }

    // Optional minor version: "<digits>.<digits>".
    if idx > 1 && bytes[idx - 1] == b'.' {
        let mut major_end = idx - 1;
        let mut major_digits = 0;
        while major_end > 0 && bytes[major_end - 1].is_ascii_digit() {
            major_end -= 1;
            major_digits += 1;
        }
        if major_digits > 0 {
            idx = major_end;
        }
    }

    if idx == 0 || bytes[idx - 1] != b'v' {
        return name;
    }
    idx -= 1;

    // The version must be its own token, not the tail of a word.
    if idx > 0 && bytes[idx - 1].is_ascii_alphanumeric() {
        return name;
    }
    &name[..idx]
}

// ─────────────────────────────────────────────────────────────────────────────
// Command Lines
// ─────────────────────────────────────────────────────────────────────────────

/// Splits a command line into argv, honoring single and double quotes.
/// Returns `None` for empty input.
pub fn split_command(command: &str) -> Option<Vec<String>> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for ch in command.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        argv.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if in_word {
        argv.push(current);
    }

    if argv.is_empty() {
        None
    } else {
        Some(argv)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Network Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the MAC address of the first non-loopback interface as plain hex
/// (no separators). Used as the default zeroconf instance name.
pub fn mac_address_hex() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
            let mut names: Vec<_> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name != "lo")
                .collect();
            names.sort();
            for name in names {
                let path = format!("/sys/class/net/{name}/address");
                if let Ok(address) = std::fs::read_to_string(path) {
                    let hex: String = address
                        .trim()
                        .chars()
                        .filter(char::is_ascii_hexdigit)
                        .collect();
                    if hex.len() == 12 && hex.chars().any(|c| c != '0') {
                        return hex.to_lowercase();
                    }
                }
            }
        }
    }
    "000000000000".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_versioned_names() {
        assert_eq!(normalize_wake_word("ok_nabu_v0.1"), "ok nabu");
        assert_eq!(normalize_wake_word("hey_jarvis_v2"), "hey jarvis");
        assert_eq!(normalize_wake_word("Alexa v1.0"), "alexa");
    }

    #[test]
    fn normalizes_separators_and_case() {
        assert_eq!(normalize_wake_word("OK Nabu"), "ok nabu");
        assert_eq!(normalize_wake_word("ok-nabu"), "ok nabu");
        assert_eq!(normalize_wake_word("ok__nabu"), "ok nabu");
    }

    #[test]
    fn keeps_digits_that_are_not_versions() {
        // "v" glued to a word is not a version token.
        assert_eq!(normalize_wake_word("nabuv2"), "nabuv2");
        assert_eq!(normalize_wake_word("agent_007"), "agent 007");
    }

    #[test]
    fn splits_quoted_commands() {
        assert_eq!(
            split_command("aplay -D 'front speaker' -r 22050"),
            Some(vec![
                "aplay".to_string(),
                "-D".to_string(),
                "front speaker".to_string(),
                "-r".to_string(),
                "22050".to_string(),
            ])
        );
        assert_eq!(split_command("   "), None);
        assert_eq!(split_command("true"), Some(vec!["true".to_string()]));
    }

    #[tokio::test]
    async fn missing_trigger_command_is_noop() {
        run_event_command(&None, Some("ignored")).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn trigger_command_consumes_stdin() {
        // `cat > /dev/null` would need a shell; plain `cat` is enough since
        // we only assert the command completes after stdin closes.
        run_event_command(&Some(vec!["cat".to_string()]), Some("hello")).await;
    }

    #[test]
    fn mac_address_is_twelve_hex_chars() {
        let mac = mac_address_hex();
        assert_eq!(mac.len(), 12);
        assert!(mac.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
