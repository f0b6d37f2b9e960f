//! Classification and output shaping for remote tmux commands.

use crate::utils::shellwords::{split_unquoted, tokenize};
use once_cell::sync::Lazy;
use regex::Regex;

static BLOCKING_PANE_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(vim|nano|less|more|top|htop|man)$").expect("pane command regex"));

static PROMPT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.*[\$#>]\s+").expect("prompt line regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TmuxKind {
    SendKeys { target: String, presses_enter: bool },
    NewSession { name: Option<String> },
    KillSession { name: Option<String> },
    HasSession { name: Option<String> },
    CapturePane { target: Option<String> },
    Compound,
    Other,
}

/// Classify a command line as a tmux operation, or `None` when tmux is not
/// involved at all.
pub fn classify(command: &str) -> Option<TmuxKind> {
    let segments = split_unquoted(command);
    let tmux_segments = segments
        .iter()
        .filter(|s| tokenize(s).first().map(|t| t == "tmux").unwrap_or(false))
        .count();
    if tmux_segments == 0 {
        return None;
    }
    if segments.len() > 1 {
        return Some(TmuxKind::Compound);
    }

    let tokens = tokenize(command);
    let sub = tokens.get(1).map(|s| s.as_str()).unwrap_or("");
    Some(match sub {
        "send-keys" => TmuxKind::SendKeys {
            target: flag_value(&tokens, "-t").unwrap_or_default(),
            presses_enter: tokens
                .last()
                .map(|t| t == "Enter" || t == "C-m")
                .unwrap_or(false),
        },
        "new-session" => TmuxKind::NewSession {
            name: flag_value(&tokens, "-s"),
        },
        "kill-session" => TmuxKind::KillSession {
            name: flag_value(&tokens, "-t"),
        },
        "has-session" => TmuxKind::HasSession {
            name: flag_value(&tokens, "-t"),
        },
        "capture-pane" => TmuxKind::CapturePane {
            target: flag_value(&tokens, "-t"),
        },
        _ => TmuxKind::Other,
    })
}

fn flag_value(tokens: &[String], flag: &str) -> Option<String> {
    tokens
        .iter()
        .position(|t| t == flag)
        .and_then(|idx| tokens.get(idx + 1))
        .cloned()
}

/// First pane row of `tmux list-panes -F "#{pane_pid} #{pane_current_command}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneProbe {
    pub pid: i64,
    pub command: String,
}

pub fn parse_pane_probe(stdout: &str) -> Option<PaneProbe> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let mut parts = line.trim().splitn(2, ' ');
    let pid = parts.next()?.parse::<i64>().ok()?;
    let command = parts.next().unwrap_or("").trim().to_string();
    Some(PaneProbe { pid, command })
}

pub fn is_blocking_pane_command(command: &str) -> bool {
    BLOCKING_PANE_COMMAND.is_match(command.trim())
}

/// `ps -o state=` letters that mean the pane must not receive keys:
/// uninterruptible sleep, stopped, paging.
pub fn is_blocked_process_state(state: &str) -> bool {
    matches!(state.trim().chars().next(), Some('D') | Some('T') | Some('W'))
}

pub fn is_prompt_line(line: &str) -> bool {
    PROMPT_LINE.is_match(line)
}

/// Lines present in `after` beyond the longest common line-wise prefix with
/// `before`.
pub fn appended_lines(before: &str, after: &str) -> Vec<String> {
    let before_lines: Vec<&str> = before.lines().collect();
    let after_lines: Vec<&str> = after.lines().collect();
    let mut common = 0;
    while common < before_lines.len()
        && common < after_lines.len()
        && before_lines[common] == after_lines[common]
    {
        common += 1;
    }
    after_lines[common..].iter().map(|l| l.to_string()).collect()
}

/// Trailing window of `before` bounded by the two most recent prompt-like
/// lines, capped at `max_lines`.
pub fn context_window(before: &str, max_lines: usize) -> Vec<String> {
    let lines: Vec<&str> = before.lines().collect();
    let prompt_positions: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| is_prompt_line(l))
        .map(|(idx, _)| idx)
        .collect();
    let start = match prompt_positions.len() {
        0 => lines.len().saturating_sub(max_lines),
        1 => prompt_positions[0],
        n => prompt_positions[n - 2],
    };
    let start = start.max(lines.len().saturating_sub(max_lines));
    lines[start..].iter().map(|l| l.to_string()).collect()
}

/// Assemble the enriched result of a send-keys: recent prompt context plus
/// whatever the pane appended after the keys landed.
pub fn render_send_keys_output(before: &str, after: &str, max_context: usize) -> String {
    let mut out = context_window(before, max_context);
    out.extend(appended_lines(before, after));
    out.join("\n")
}

/// Concise summaries for the non-send-keys tmux operations.
pub fn summarize(kind: &TmuxKind, exit_code: i64, stdout: &str) -> Option<String> {
    let name_of = |name: &Option<String>| name.clone().unwrap_or_else(|| "(unnamed)".to_string());
    match kind {
        TmuxKind::NewSession { name } => Some(if exit_code == 0 {
            format!("tmux session '{}' created", name_of(name))
        } else {
            format!("failed to create tmux session '{}'", name_of(name))
        }),
        TmuxKind::KillSession { name } => Some(if exit_code == 0 {
            format!("tmux session '{}' killed", name_of(name))
        } else {
            format!("failed to kill tmux session '{}'", name_of(name))
        }),
        TmuxKind::HasSession { name } => Some(if exit_code == 0 {
            format!("tmux session '{}' exists", name_of(name))
        } else {
            format!("tmux session '{}' does not exist", name_of(name))
        }),
        TmuxKind::CapturePane { target } => Some(format!(
            "captured {} lines from pane '{}'\n{}",
            stdout.lines().count(),
            target.clone().unwrap_or_default(),
            stdout
        )),
        TmuxKind::Compound => Some(format!(
            "tmux compound command finished with exit code {}\n{}",
            exit_code, stdout
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_send_keys_with_target_and_enter() {
        let kind = classify("tmux send-keys -t s 'ls' Enter").expect("tmux");
        assert_eq!(
            kind,
            TmuxKind::SendKeys {
                target: "s".to_string(),
                presses_enter: true,
            }
        );
    }

    #[test]
    fn send_keys_without_enter_is_not_flagged() {
        let kind = classify("tmux send-keys -t s C-c").expect("tmux");
        assert_eq!(
            kind,
            TmuxKind::SendKeys {
                target: "s".to_string(),
                presses_enter: false,
            }
        );
    }

    #[test]
    fn non_tmux_is_none_and_compound_is_detected() {
        assert_eq!(classify("ls -la"), None);
        assert_eq!(
            classify("tmux new-session -d -s w && tmux send-keys -t w ls Enter"),
            Some(TmuxKind::Compound)
        );
    }

    #[test]
    fn pane_probe_parses_pid_and_command() {
        let probe = parse_pane_probe("4242 vim\n").expect("probe");
        assert_eq!(probe.pid, 4242);
        assert_eq!(probe.command, "vim");
    }

    #[test]
    fn blocked_states_and_commands() {
        assert!(is_blocked_process_state("D"));
        assert!(is_blocked_process_state("T "));
        assert!(is_blocked_process_state("W"));
        assert!(!is_blocked_process_state("S"));
        assert!(!is_blocked_process_state("R+"));
        assert!(is_blocking_pane_command("vim"));
        assert!(is_blocking_pane_command("htop"));
        assert!(!is_blocking_pane_command("bash"));
        assert!(!is_blocking_pane_command("vimdiff"));
    }

    #[test]
    fn appended_lines_diff_by_common_prefix() {
        let before = "a\nb\n$ ";
        let after = "a\nb\n$ ls\nfile1\nfile2\n$ ";
        assert_eq!(
            appended_lines(before, after),
            vec!["$ ls", "file1", "file2", "$ "]
        );
    }

    #[test]
    fn context_window_bounded_by_second_latest_prompt() {
        let before = "out1\n[u@h ~]$ make\nbuild output\n[u@h ~]$ ";
        let window = context_window(before, 10);
        assert_eq!(
            window,
            vec!["[u@h ~]$ make", "build output", "[u@h ~]$ "]
        );
    }

    #[test]
    fn summaries_are_testable_strings() {
        assert_eq!(
            summarize(
                &TmuxKind::HasSession {
                    name: Some("s".to_string())
                },
                1,
                ""
            )
            .unwrap(),
            "tmux session 's' does not exist"
        );
        assert_eq!(
            summarize(
                &TmuxKind::NewSession {
                    name: Some("w".to_string())
                },
                0,
                ""
            )
            .unwrap(),
            "tmux session 'w' created"
        );
    }
}
