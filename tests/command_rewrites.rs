use ssh_broker::services::context::{build_exec, ContainerContext};
use ssh_broker::services::exec::rewrite_sudo;
use ssh_broker::services::transport::connection_id;
use ssh_broker::utils::docker_cmd::{parse_command_line, ParsedCommand};
use ssh_broker::utils::text::truncate_middle;

#[test]
fn sudo_autofill_matches_the_documented_shape() {
    assert_eq!(
        rewrite_sudo("sudo -n id", "p"),
        "echo \"p\" | sudo -S -n id 2>/dev/null"
    );
}

#[test]
fn connection_identity_is_stable_across_calls() {
    let a = connection_id("u", "h", 22);
    let b = connection_id("u", "h", 22);
    assert_eq!(a, b);
    assert_ne!(a, connection_id("u", "h", 23));
}

#[test]
fn truncator_keeps_first_and_last_three_thousand_chars() {
    let input: String = ('a'..='z').cycle().take(25_000).collect();
    let output = truncate_middle(&input, 10_000, 3_000, 3_000);
    assert!(output.starts_with(&input[..3_000]));
    assert!(output.ends_with(&input[25_000 - 3_000..]));
    assert!(output.contains("[19000 characters omitted]"));
}

#[test]
fn active_container_rewrites_later_commands() {
    let ctx = ContainerContext::new();
    let parsed = parse_command_line("docker exec -w /srv -u www-data web ls");
    let spec = match parsed {
        ParsedCommand::DockerExec { spec } => spec,
        other => panic!("expected docker exec, got {:?}", other),
    };
    ctx.set_context("conn", &spec);

    let active = ctx.active_container("conn").expect("active container");
    assert_eq!(active.container, "web");
    let rewritten = build_exec(&active.container, "ls", Some(&active), false);
    assert_eq!(rewritten, "docker exec -w /srv -u www-data web ls");

    ctx.exit_container("conn");
    assert!(ctx.active_container("conn").is_none());
}

#[test]
fn compound_docker_line_threads_the_context() {
    let parsed = parse_command_line("docker exec -w /app api pwd && ls");
    match parsed {
        ParsedCommand::Compound {
            exec_segments,
            regular_segments,
            needs_container_context,
            ..
        } => {
            assert!(needs_container_context);
            assert_eq!(exec_segments[0].container, "api");
            assert_eq!(exec_segments[0].workdir.as_deref(), Some("/app"));
            assert_eq!(regular_segments, vec!["ls".to_string()]);
        }
        other => panic!("expected compound, got {:?}", other),
    }
}
