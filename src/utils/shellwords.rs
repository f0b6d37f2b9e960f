//! Minimal POSIX-ish shell lexing used by the Docker and tmux classifiers.

/// Split a command line into words honoring single quotes, double quotes and
/// backslash escapes. Lines with unclosed quotes fall back to plain
/// whitespace tokenization.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                started = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                started = true;
            }
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    started = true;
                }
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if started {
                    tokens.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }

    if in_single || in_double {
        return line.split_whitespace().map(|s| s.to_string()).collect();
    }
    if started {
        tokens.push(current);
    }
    tokens
}

/// Split a line on `&&`, `||` and `;` that sit outside quotes. Separators are
/// dropped; empty segments are discarded.
pub fn split_unquoted(line: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            '\\' if !in_single => {
                current.push(ch);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '&' | '|' if !in_single && !in_double && chars.peek() == Some(&ch) => {
                chars.next();
                segments.push(std::mem::take(&mut current));
            }
            ';' if !in_single && !in_double => {
                segments.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    segments.push(current);

    segments
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Quote a value for a remote POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Quote only when the bare value would not survive the shell.
pub fn quote_if_needed(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c));
    if safe {
        value.to_string()
    } else {
        shell_quote(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_quoted_words() {
        assert_eq!(
            tokenize("docker exec -e 'K=a b' web sh"),
            vec!["docker", "exec", "-e", "K=a b", "web", "sh"]
        );
    }

    #[test]
    fn unclosed_quote_falls_back_to_whitespace() {
        assert_eq!(
            tokenize("echo 'oops"),
            vec!["echo".to_string(), "'oops".to_string()]
        );
    }

    #[test]
    fn splits_on_unquoted_separators_only() {
        assert_eq!(
            split_unquoted("a && b || c ; d"),
            vec!["a", "b", "c", "d"]
        );
        assert_eq!(
            split_unquoted("echo 'a && b' && ls"),
            vec!["echo 'a && b'", "ls"]
        );
    }

    #[test]
    fn single_pipe_is_not_a_separator() {
        assert_eq!(split_unquoted("ps aux | grep x"), vec!["ps aux | grep x"]);
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(quote_if_needed("/srv"), "/srv");
        assert_eq!(quote_if_needed("a b"), "'a b'");
        assert_eq!(quote_if_needed("it's"), "'it'\\''s'");
    }
}
