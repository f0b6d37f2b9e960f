//! Classification of remote command lines into Docker-aware shapes.

use crate::utils::shellwords::{quote_if_needed, split_unquoted, tokenize};

/// One parsed `docker exec` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerExecSpec {
    pub raw: String,
    pub container: String,
    pub inner_command: String,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub env: Vec<(String, String)>,
    pub passthrough_flags: Vec<String>,
}

impl DockerExecSpec {
    pub fn interactive(&self) -> bool {
        self.passthrough_flags
            .iter()
            .any(|f| matches!(f.as_str(), "-i" | "-t" | "-it" | "-ti"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Regular {
        command: String,
    },
    DockerExec {
        spec: DockerExecSpec,
    },
    DockerRun {
        command: String,
    },
    Compound {
        command: String,
        exec_segments: Vec<DockerExecSpec>,
        regular_segments: Vec<String>,
        needs_container_context: bool,
    },
}

#[derive(Debug, Clone)]
enum Segment {
    Regular(String),
    Exec(DockerExecSpec),
    Run(String),
}

pub fn parse_command_line(command: &str) -> ParsedCommand {
    let segments = split_unquoted(command);
    if segments.len() <= 1 {
        return match classify_segment(command.trim()) {
            Segment::Regular(cmd) => ParsedCommand::Regular { command: cmd },
            Segment::Exec(spec) => ParsedCommand::DockerExec { spec },
            Segment::Run(cmd) => ParsedCommand::DockerRun { command: cmd },
        };
    }

    let mut exec_segments = Vec::new();
    let mut regular_segments = Vec::new();
    let mut has_run = false;
    for segment in &segments {
        match classify_segment(segment) {
            Segment::Exec(spec) => exec_segments.push(spec),
            Segment::Run(_) => has_run = true,
            Segment::Regular(cmd) => regular_segments.push(cmd),
        }
    }

    if exec_segments.is_empty() && !has_run {
        return ParsedCommand::Regular {
            command: command.to_string(),
        };
    }

    let needs_container_context = !exec_segments.is_empty() && !regular_segments.is_empty();
    ParsedCommand::Compound {
        command: command.to_string(),
        exec_segments,
        regular_segments,
        needs_container_context,
    }
}

fn classify_segment(segment: &str) -> Segment {
    let tokens = tokenize(segment);
    if tokens.len() >= 2 && tokens[0] == "docker" {
        match tokens[1].as_str() {
            "exec" => {
                if let Some(spec) = parse_exec_tokens(segment, &tokens[2..]) {
                    return Segment::Exec(spec);
                }
                return Segment::Regular(segment.to_string());
            }
            "run" => return Segment::Run(segment.to_string()),
            _ => {}
        }
    }
    Segment::Regular(segment.to_string())
}

// Options mirror the docker CLI surface the broker rewrites: workdir, user
// and env are interpreted, -p/-v/--name keep their value, anything else
// short stays as an opaque flag.
fn parse_exec_tokens(raw: &str, tokens: &[String]) -> Option<DockerExecSpec> {
    let mut workdir = None;
    let mut user = None;
    let mut env = Vec::new();
    let mut passthrough_flags = Vec::new();
    let mut container = None;
    let mut inner = Vec::new();
    let mut iter = tokens.iter();

    while let Some(token) = iter.next() {
        if container.is_none() {
            match token.as_str() {
                "-w" | "--workdir" => {
                    workdir = iter.next().cloned();
                    continue;
                }
                "-u" | "--user" => {
                    user = iter.next().cloned();
                    continue;
                }
                "-e" | "--env" => {
                    if let Some(pair) = iter.next() {
                        env.push(split_env_pair(pair));
                    }
                    continue;
                }
                "-p" | "-v" | "--name" => {
                    passthrough_flags.push(token.clone());
                    if let Some(arg) = iter.next() {
                        passthrough_flags.push(arg.clone());
                    }
                    continue;
                }
                _ => {}
            }
            if let Some(value) = token.strip_prefix("--workdir=") {
                workdir = Some(value.to_string());
                continue;
            }
            if let Some(value) = token.strip_prefix("--user=") {
                user = Some(value.to_string());
                continue;
            }
            if let Some(value) = token.strip_prefix("--env=") {
                env.push(split_env_pair(value));
                continue;
            }
            if token.starts_with('-') {
                passthrough_flags.push(token.clone());
                continue;
            }
            container = Some(token.clone());
        } else {
            inner.push(token.clone());
        }
    }

    let container = container?;
    let inner_command = inner
        .iter()
        .map(|token| quote_if_needed(token))
        .collect::<Vec<_>>()
        .join(" ");
    Some(DockerExecSpec {
        raw: raw.to_string(),
        container,
        inner_command,
        workdir,
        user,
        env,
        passthrough_flags,
    })
}

fn split_env_pair(pair: &str) -> (String, String) {
    match pair.split_once('=') {
        Some((key, value)) => (key.to_string(), value.to_string()),
        None => (pair.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command_is_regular() {
        assert_eq!(
            parse_command_line("ls -la /tmp"),
            ParsedCommand::Regular {
                command: "ls -la /tmp".to_string()
            }
        );
    }

    #[test]
    fn docker_exec_parses_options_container_and_inner() {
        let parsed = parse_command_line("docker exec -it -w /app -u root -e K=V api ls -la");
        match parsed {
            ParsedCommand::DockerExec { spec } => {
                assert_eq!(spec.container, "api");
                assert_eq!(spec.inner_command, "ls -la");
                assert_eq!(spec.workdir.as_deref(), Some("/app"));
                assert_eq!(spec.user.as_deref(), Some("root"));
                assert_eq!(spec.env, vec![("K".to_string(), "V".to_string())]);
                assert!(spec.interactive());
            }
            other => panic!("expected docker exec, got {:?}", other),
        }
    }

    #[test]
    fn docker_run_is_passed_through() {
        let parsed = parse_command_line("docker run --rm alpine echo hi");
        assert_eq!(
            parsed,
            ParsedCommand::DockerRun {
                command: "docker run --rm alpine echo hi".to_string()
            }
        );
    }

    #[test]
    fn compound_with_exec_and_regular_needs_context() {
        let parsed = parse_command_line("docker exec -w /app api pwd && ls");
        match parsed {
            ParsedCommand::Compound {
                exec_segments,
                regular_segments,
                needs_container_context,
                ..
            } => {
                assert_eq!(exec_segments.len(), 1);
                assert_eq!(exec_segments[0].container, "api");
                assert_eq!(exec_segments[0].inner_command, "pwd");
                assert_eq!(exec_segments[0].workdir.as_deref(), Some("/app"));
                assert_eq!(regular_segments, vec!["ls".to_string()]);
                assert!(needs_container_context);
            }
            other => panic!("expected compound, got {:?}", other),
        }
    }

    #[test]
    fn compound_without_docker_stays_regular() {
        let parsed = parse_command_line("cd /tmp && ls");
        assert_eq!(
            parsed,
            ParsedCommand::Regular {
                command: "cd /tmp && ls".to_string()
            }
        );
    }

    #[test]
    fn quoted_separator_does_not_split() {
        let parsed = parse_command_line("docker exec api sh -c 'a && b'");
        match parsed {
            ParsedCommand::DockerExec { spec } => {
                assert_eq!(spec.container, "api");
                assert_eq!(spec.inner_command, "sh -c 'a && b'");
            }
            other => panic!("expected docker exec, got {:?}", other),
        }
    }

    #[test]
    fn name_flag_consumes_one_argument() {
        let parsed = parse_command_line("docker exec --name ignored web uptime");
        match parsed {
            ParsedCommand::DockerExec { spec } => {
                assert_eq!(spec.container, "web");
                assert_eq!(spec.inner_command, "uptime");
                assert_eq!(
                    spec.passthrough_flags,
                    vec!["--name".to_string(), "ignored".to_string()]
                );
            }
            other => panic!("expected docker exec, got {:?}", other),
        }
    }
}
