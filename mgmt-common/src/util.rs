//! Shared utilities for the harness.

use std::borrow::Cow;

fn find_value_end(s: &str) -> usize {
    let mut end = 0;
    let mut in_quote = None;
    let mut escaped = false;

    for c in s.chars() {
        let char_len = c.len_utf8();

        if escaped {
            escaped = false;
            end += char_len;
            continue;
        }

        if c == '\\' {
            escaped = true;
            end += char_len;
            continue;
        }

        if let Some(q) = in_quote {
            if c == q {
                in_quote = None;
            }
            end += char_len;
            continue;
        }

        if c == '"' || c == '\'' {
            in_quote = Some(c);
            end += char_len;
            continue;
        }

        if c.is_whitespace() {
            break;
        }

        end += char_len;
    }
    end
}

/// Mask credentials in a command string before logging.
///
/// Storage CLIs and the manager client take keys and tokens on the command
/// line; the value after each known key or flag is replaced with `***`.
pub fn mask_sensitive_command(cmd: &str) -> String {
    let patterns = [
        // Environment variable patterns
        ("AWS_SECRET_ACCESS_KEY=", "AWS_SECRET_ACCESS_KEY=***"),
        ("AWS_ACCESS_KEY_ID=", "AWS_ACCESS_KEY_ID=***"),
        ("AWS_SESSION_TOKEN=", "AWS_SESSION_TOKEN=***"),
        ("AZURE_STORAGE_KEY=", "AZURE_STORAGE_KEY=***"),
        ("AZURE_STORAGE_CONNECTION_STRING=", "AZURE_STORAGE_CONNECTION_STRING=***"),
        ("GOOGLE_APPLICATION_CREDENTIALS=", "GOOGLE_APPLICATION_CREDENTIALS=***"),
        ("SCYLLA_MANAGER_AUTH_TOKEN=", "SCYLLA_MANAGER_AUTH_TOKEN=***"),
        ("CQLSH_PASSWORD=", "CQLSH_PASSWORD=***"),
        ("PASSWORD=", "PASSWORD=***"),
        ("TOKEN=", "TOKEN=***"),
        ("SECRET=", "SECRET=***"),
        // Command-line argument patterns
        ("--auth-token ", "--auth-token ***"),
        ("--auth-token=", "--auth-token=***"),
        ("--account-key ", "--account-key ***"),
        ("--account-key=", "--account-key=***"),
        ("--token ", "--token ***"),
        ("--token=", "--token=***"),
        ("--password ", "--password ***"),
        ("--password=", "--password=***"),
        ("-p ", "-p ***"),
    ];

    let mut result = cmd.to_string();
    for (pattern, replacement) in patterns {
        // Track the search position; the replacement contains the pattern.
        let mut search_start = 0;
        while search_start < result.len() {
            let Some(start) = result[search_start..].find(pattern) else {
                break;
            };
            let abs_start = search_start + start;

            // The short flag only counts as its own token; "--top-p 5" is left alone.
            let at_boundary = abs_start == 0
                || result[..abs_start]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_whitespace() || c == ';' || c == '&');
            if pattern == "-p " && !at_boundary {
                search_start = abs_start + pattern.len();
                continue;
            }

            let value_start = abs_start + pattern.len();
            let value_end = value_start + find_value_end(&result[value_start..]);

            result = format!(
                "{}{}{}",
                &result[..abs_start],
                replacement,
                &result[value_end..]
            );
            search_start = abs_start + replacement.len();
        }
    }

    result
}

/// Quote one argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(arg))
}

/// Format a percentage as "NN%".
pub fn format_percent(value: f64) -> String {
    format!("{:.0}%", value.clamp(0.0, 100.0))
}
