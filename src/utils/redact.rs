use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

const REDACTION: &str = "***";

static SENSITIVE_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "password",
        "passphrase",
        "privateKey",
        "private_key",
        "secret",
        "token",
    ]
    .into_iter()
    .collect()
});

static SUDO_PIPE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"echo\s+"[^"]*"\s*\|"#).expect("sudo pipe regex"));

/// Mask sensitive argument fields before they reach the log stream.
pub fn redact_args(args: &Value) -> Value {
    match args {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                if SENSITIVE_KEYS.contains(key.as_str()) {
                    out.insert(key.clone(), Value::String(REDACTION.to_string()));
                } else {
                    out.insert(key.clone(), redact_args(value));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_args).collect()),
        other => other.clone(),
    }
}

/// Strip an injected sudo password from a command line before logging it.
pub fn redact_command(command: &str) -> String {
    SUDO_PIPE_PATTERN
        .replace_all(command, "echo \"***\" |")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_sensitive_keys_recursively() {
        let args = serde_json::json!({
            "host": "db1",
            "password": "hunter2",
            "nested": {"privateKey": "-----BEGIN-----"},
        });
        let out = redact_args(&args);
        assert_eq!(out["password"], "***");
        assert_eq!(out["nested"]["privateKey"], "***");
        assert_eq!(out["host"], "db1");
    }

    #[test]
    fn hides_injected_sudo_password() {
        let cmd = "echo \"hunter2\" | sudo -S id 2>/dev/null";
        assert_eq!(redact_command(cmd), "echo \"***\" | sudo -S id 2>/dev/null");
    }
}
