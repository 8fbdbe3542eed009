//! Switch backend that drives the Open vSwitch command-line tools.
//!
//! Every call becomes one `ovs-vsctl` or `ovs-ofctl` invocation run through
//! `/bin/sh -c`, with arguments quoted by [`shellquote`]. A dry-run instance
//! records the commands without executing them.

use super::{ConnectionId, FlowMatch, FlowRule, FlowTableClient, SwitchTopologyClient};
use hostagent_common::{AgentError, AgentResult};
use hostagent_types::{LocalTag, NetworkType};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::fmt::Write as _;
use std::process::{Command, Stdio};

pub const OVS_VSCTL_CMD: &str = "/usr/bin/ovs-vsctl";
pub const OVS_OFCTL_CMD: &str = "/usr/bin/ovs-ofctl";

/// `ovs-vsctl br-exists` exit status for a missing bridge.
const BR_EXISTS_MISSING: i32 = 2;

/// Characters that need escaping inside shell double quotes.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for use as a single shell word.
///
/// ```
/// use hostagent::dataplane::shellquote;
///
/// assert_eq!(shellquote("br-tun"), "\"br-tun\"");
/// assert_eq!(shellquote("a$b"), "\"a\\$b\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of one command.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

fn exec(cmd: &str) -> std::io::Result<ExecResult> {
    tracing::debug!(command = %cmd, "Executing switch command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if !result.success() {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Switch command failed"
        );
    }
    Ok(result)
}

fn hex_payload(packet: &[u8]) -> String {
    let mut out = String::with_capacity(packet.len() * 2);
    for byte in packet {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Backend that shells out to `ovs-vsctl` and `ovs-ofctl`.
#[derive(Debug, Default)]
pub struct OvsCliDataplane {
    dry_run: bool,
    history: Mutex<Vec<String>>,
}

impl OvsCliDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records commands without running them. Every bridge reports as present.
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Commands issued so far, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    fn run(&self, operation: &str, cmd: String) -> AgentResult<ExecResult> {
        self.history.lock().push(cmd.clone());
        if self.dry_run {
            tracing::debug!(command = %cmd, "dry run");
            return Ok(ExecResult::default());
        }
        exec(&cmd).map_err(|e| AgentError::upstream(operation, format!("{}: {}", cmd, e)))
    }

    fn run_checked(&self, operation: &str, cmd: String) -> AgentResult<String> {
        let result = self.run(operation, cmd)?;
        if result.success() {
            Ok(result.stdout)
        } else {
            Err(AgentError::upstream(
                operation,
                format!("exit {}: {}", result.exit_code, result.combined_output()),
            ))
        }
    }
}

impl SwitchTopologyClient for OvsCliDataplane {
    fn bridge_exists(&self, bridge: &str) -> AgentResult<bool> {
        let cmd = format!("{} br-exists {}", OVS_VSCTL_CMD, shellquote(bridge));
        let result = self.run("bridge_exists", cmd)?;
        match result.exit_code {
            0 => Ok(true),
            BR_EXISTS_MISSING => Ok(false),
            code => Err(AgentError::upstream(
                "bridge_exists",
                format!("exit {}: {}", code, result.combined_output()),
            )),
        }
    }

    fn add_bridge(&self, bridge: &str) -> AgentResult<()> {
        let cmd = format!("{} --may-exist add-br {}", OVS_VSCTL_CMD, shellquote(bridge));
        self.run_checked("add_bridge", cmd).map(|_| ())
    }

    fn add_patch_port(&self, bridge: &str, port: &str, peer: &str) -> AgentResult<()> {
        let cmd = format!(
            "{vsctl} --may-exist add-port {bridge} {port} -- set interface {port} type=patch options:peer={peer}",
            vsctl = OVS_VSCTL_CMD,
            bridge = shellquote(bridge),
            port = shellquote(port),
            peer = shellquote(peer),
        );
        self.run_checked("add_patch_port", cmd).map(|_| ())
    }

    fn add_tunnel_port(&self, bridge: &str, port: &str, network_type: NetworkType) -> AgentResult<()> {
        let cmd = format!(
            "{vsctl} --may-exist add-port {bridge} {port} -- set interface {port} type={kind} \
             options:df_default=true options:egress_pkt_mark=0 options:in_key=flow \
             options:out_key=flow options:remote_ip=flow",
            vsctl = OVS_VSCTL_CMD,
            bridge = shellquote(bridge),
            port = shellquote(port),
            kind = network_type.as_str(),
        );
        self.run_checked("add_tunnel_port", cmd).map(|_| ())
    }

    fn attach_port(&self, port_name: &str, tag: LocalTag) -> AgentResult<()> {
        let cmd = format!("{} set port {} tag={}", OVS_VSCTL_CMD, shellquote(port_name), tag);
        self.run_checked("attach_port", cmd).map(|_| ())
    }

    fn detach_port(&self, port_name: &str) -> AgentResult<()> {
        let cmd = format!("{} clear port {} tag", OVS_VSCTL_CMD, shellquote(port_name));
        self.run_checked("detach_port", cmd).map(|_| ())
    }

    fn packet_out(
        &self,
        connection: ConnectionId,
        bridge: &str,
        out_port: u32,
        packet: &[u8],
    ) -> AgentResult<()> {
        tracing::debug!(connection, bridge, out_port, len = packet.len(), "packet-out");
        let spec = format!(
            "in_port=controller packet={} actions=output:{}",
            hex_payload(packet),
            out_port
        );
        let cmd = format!(
            "{} packet-out {} {}",
            OVS_OFCTL_CMD,
            shellquote(bridge),
            shellquote(&spec)
        );
        self.run_checked("packet_out", cmd).map(|_| ())
    }
}

impl FlowTableClient for OvsCliDataplane {
    fn install(&self, bridge: &str, rule: &FlowRule) -> AgentResult<()> {
        let cmd = format!(
            "{} add-flow {} {}",
            OVS_OFCTL_CMD,
            shellquote(bridge),
            shellquote(&rule.to_string())
        );
        self.run_checked("install_flow", cmd).map(|_| ())
    }

    fn remove(&self, bridge: &str, flow_match: &FlowMatch, strict: bool) -> AgentResult<()> {
        if strict && flow_match.priority.is_none() {
            return Err(AgentError::invalid_argument(
                "flow_match",
                "strict removal needs a priority",
            ));
        }
        let mut loose = flow_match.clone();
        if !strict {
            loose.priority = None;
        }
        let cmd = format!(
            "{} {}del-flows {} {}",
            OVS_OFCTL_CMD,
            if strict { "--strict " } else { "" },
            shellquote(bridge),
            shellquote(&loose.to_string())
        );
        self.run_checked("remove_flow", cmd).map(|_| ())
    }

    fn flow_exists(&self, bridge: &str, flow_match: &FlowMatch) -> AgentResult<bool> {
        let mut loose = flow_match.clone();
        loose.priority = None;
        let cmd = format!(
            "{} dump-flows {} {}",
            OVS_OFCTL_CMD,
            shellquote(bridge),
            shellquote(&loose.to_string())
        );
        let stdout = self.run_checked("flow_exists", cmd)?;
        Ok(stdout.lines().any(|line| line.contains("actions=")))
    }
}
