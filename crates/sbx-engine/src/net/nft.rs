//! nftables rules for sandbox egress. All sandboxes share the `sbx` table
//! (family ip); every rule carries the owning tap name in its text so
//! cleanup can surgically remove one sandbox's rules, including those placed
//! in the host-wide `DOCKER-USER` chain. Each install or cleanup is a single
//! `nft -f` invocation, which the kernel applies as one transaction.

use std::net::Ipv4Addr;
use std::process::Stdio;

use ipnet::Ipv4Net;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use sbx_types::{Error, Result};

use super::route;

const TABLE: &str = "sbx";
const DOCKER_USER: &str = "DOCKER-USER";

#[derive(Debug, Clone)]
pub struct NatSpec {
    pub tap: String,
    pub gateway: Ipv4Addr,
    pub vm_ip: Ipv4Addr,
}

#[derive(Debug, Clone)]
pub struct RedirectSpec {
    pub tap: String,
    pub gateway: Ipv4Addr,
    pub vm_ip: Ipv4Addr,
    pub http_port: u16,
    pub dns_port: u16,
}

/// Installs masquerading for the sandbox /24 plus forward accepts for the
/// tap. Forward accepts land in `DOCKER-USER` when Docker manages the host's
/// forward policy, otherwise in the sandbox table's own forward chain.
pub async fn install_nat(spec: &NatSpec) -> Result<()> {
    let oif = route::default_outbound_interface().await?;
    let docker_user = docker_user_chain_exists().await?;
    // A previous run of the same sandbox may have left rules behind.
    cleanup_nat(&spec.tap).await?;
    let ruleset = nat_ruleset(spec, &oif, docker_user);
    debug!(tap = %spec.tap, docker_user, "installing nat rules");
    apply_ruleset(&ruleset).await
}

/// Removes this sandbox's masquerade and forward rules. Missing tables,
/// chains, or rules are fine.
pub async fn cleanup_nat(tap: &str) -> Result<()> {
    delete_tagged_rules(&["list", "table", "ip", TABLE], tap).await?;
    delete_tagged_rules(&["list", "chain", "ip", "filter", DOCKER_USER], tap).await
}

/// Installs the PREROUTING DNAT rules steering guest HTTP/HTTPS/DNS into the
/// egress proxy listening on the gateway address.
pub async fn install_proxy_redirect(spec: &RedirectSpec) -> Result<()> {
    cleanup_proxy_redirect(&spec.tap).await?;
    let ruleset = redirect_ruleset(spec);
    debug!(tap = %spec.tap, "installing proxy redirect rules");
    apply_ruleset(&ruleset).await
}

/// Removes this sandbox's DNAT redirect rules. Missing state is fine.
pub async fn cleanup_proxy_redirect(tap: &str) -> Result<()> {
    delete_tagged_rules(&["list", "chain", "ip", TABLE, "prerouting"], tap).await
}

fn nat_ruleset(spec: &NatSpec, oif: &str, docker_user: bool) -> String {
    let subnet = Ipv4Net::new(spec.gateway, 24)
        .expect("/24 prefix is always valid")
        .trunc();
    let tap = &spec.tap;

    let mut s = String::new();
    s.push_str(&format!("table ip {TABLE} {{\n"));
    s.push_str("\tchain postrouting {\n");
    s.push_str("\t\ttype nat hook postrouting priority srcnat; policy accept;\n");
    s.push_str("\t}\n");
    if !docker_user {
        s.push_str("\tchain forward {\n");
        s.push_str("\t\ttype filter hook forward priority filter; policy accept;\n");
        s.push_str("\t}\n");
    }
    s.push_str("}\n");
    s.push_str(&format!(
        "add rule ip {TABLE} postrouting ip saddr {subnet} oifname \"{oif}\" masquerade comment \"{tap}\"\n"
    ));
    if docker_user {
        // Docker's forward policy drops by default; our accepts must come
        // ahead of it.
        s.push_str(&format!(
            "insert rule ip filter {DOCKER_USER} iifname \"{tap}\" accept\n"
        ));
        s.push_str(&format!(
            "insert rule ip filter {DOCKER_USER} oifname \"{tap}\" accept\n"
        ));
    } else {
        s.push_str(&format!(
            "add rule ip {TABLE} forward iifname \"{tap}\" accept\n"
        ));
        s.push_str(&format!(
            "add rule ip {TABLE} forward oifname \"{tap}\" accept\n"
        ));
    }
    s
}

fn redirect_ruleset(spec: &RedirectSpec) -> String {
    let RedirectSpec {
        tap,
        gateway,
        vm_ip,
        http_port,
        dns_port,
    } = spec;

    let mut s = String::new();
    s.push_str(&format!("table ip {TABLE} {{\n"));
    s.push_str("\tchain prerouting {\n");
    s.push_str("\t\ttype nat hook prerouting priority dstnat; policy accept;\n");
    s.push_str("\t}\n");
    s.push_str("}\n");
    for (proto, orig_port, target_port) in [
        ("tcp", 80u16, *http_port),
        ("tcp", 443, *http_port),
        ("udp", 53, *dns_port),
    ] {
        s.push_str(&format!(
            "add rule ip {TABLE} prerouting iifname \"{tap}\" ip saddr {vm_ip} {proto} dport {orig_port} dnat to {gateway}:{target_port}\n"
        ));
    }
    s
}

async fn docker_user_chain_exists() -> Result<bool> {
    let output = run_nft(&["list", "chain", "ip", "filter", DOCKER_USER], None).await?;
    Ok(output.status.success())
}

/// Lists the given table or chain with handles and deletes, in one
/// transaction, every rule whose text references `tap`. Listing failures
/// mean the scope was never created and there is nothing to delete.
async fn delete_tagged_rules(list_spec: &[&str], tap: &str) -> Result<()> {
    let mut args = vec!["-a"];
    args.extend_from_slice(list_spec);
    let output = run_nft(&args, None).await?;
    if !output.status.success() {
        return Ok(());
    }
    let listing = String::from_utf8_lossy(&output.stdout);
    let commands = delete_commands(&listing, list_spec, tap);
    if commands.is_empty() {
        return Ok(());
    }
    apply_ruleset(&commands.join("\n")).await
}

/// Pure text half of rule cleanup: walks an `nft -a list …` dump, tracking
/// the current chain, and emits `delete rule … handle N` lines for rules
/// mentioning the tap name.
fn delete_commands(listing: &str, list_spec: &[&str], tap: &str) -> Vec<String> {
    // list_spec is either ["list","table","ip",TABLE] or
    // ["list","chain","ip",FAMILY_TABLE,CHAIN].
    let table = list_spec[3];
    let mut chain = if list_spec[1] == "chain" {
        Some(list_spec[4].to_string())
    } else {
        None
    };

    let needle = format!("\"{tap}\"");
    let mut commands = Vec::new();
    for line in listing.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("chain ") {
            if let Some(name) = rest.split_whitespace().next() {
                chain = Some(name.to_string());
            }
            continue;
        }
        if !trimmed.contains(&needle) {
            continue;
        }
        let Some(handle) = trimmed
            .rsplit("# handle ")
            .next()
            .and_then(|h| h.trim().parse::<u64>().ok())
        else {
            continue;
        };
        if let Some(chain) = &chain {
            commands.push(format!("delete rule ip {table} {chain} handle {handle}"));
        }
    }
    commands
}

async fn apply_ruleset(ruleset: &str) -> Result<()> {
    let output = run_nft(&["-f", "-"], Some(ruleset)).await?;
    if !output.status.success() {
        return Err(Error::transport_msg(format!(
            "nft rejected ruleset: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

async fn run_nft(args: &[&str], stdin: Option<&str>) -> Result<std::process::Output> {
    let mut cmd = Command::new("nft");
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::transport("could not launch nft", e))?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| Error::transport("could not feed nft", e))?;
    }
    child
        .wait_with_output()
        .await
        .map_err(|e| Error::transport("nft did not finish", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nat_spec() -> NatSpec {
        NatSpec {
            tap: "sbx-0a0b".into(),
            gateway: Ipv4Addr::new(10, 10, 11, 1),
            vm_ip: Ipv4Addr::new(10, 10, 11, 2),
        }
    }

    #[test]
    fn nat_ruleset_without_docker_user_uses_own_forward_chain() {
        let text = nat_ruleset(&nat_spec(), "eth0", false);
        assert!(text.contains("type nat hook postrouting priority srcnat"));
        assert!(text.contains("type filter hook forward priority filter"));
        assert!(text.contains(
            "add rule ip sbx postrouting ip saddr 10.10.11.0/24 oifname \"eth0\" masquerade comment \"sbx-0a0b\""
        ));
        assert!(text.contains("add rule ip sbx forward iifname \"sbx-0a0b\" accept"));
        assert!(text.contains("add rule ip sbx forward oifname \"sbx-0a0b\" accept"));
        assert!(!text.contains("DOCKER-USER"));
    }

    #[test]
    fn nat_ruleset_with_docker_user_inserts_ahead_of_docker() {
        let text = nat_ruleset(&nat_spec(), "enp3s0", true);
        assert!(text.contains("insert rule ip filter DOCKER-USER iifname \"sbx-0a0b\" accept"));
        assert!(text.contains("insert rule ip filter DOCKER-USER oifname \"sbx-0a0b\" accept"));
        assert!(!text.contains("chain forward"));
    }

    #[test]
    fn redirect_ruleset_covers_http_https_and_dns() {
        let spec = RedirectSpec {
            tap: "sbx-0a0b".into(),
            gateway: Ipv4Addr::new(10, 10, 11, 1),
            vm_ip: Ipv4Addr::new(10, 10, 11, 2),
            http_port: 4080,
            dns_port: 4053,
        };
        let text = redirect_ruleset(&spec);
        assert!(text.contains("type nat hook prerouting priority dstnat"));
        assert!(text.contains(
            "iifname \"sbx-0a0b\" ip saddr 10.10.11.2 tcp dport 80 dnat to 10.10.11.1:4080"
        ));
        assert!(text.contains(
            "iifname \"sbx-0a0b\" ip saddr 10.10.11.2 tcp dport 443 dnat to 10.10.11.1:4080"
        ));
        assert!(text.contains(
            "iifname \"sbx-0a0b\" ip saddr 10.10.11.2 udp dport 53 dnat to 10.10.11.1:4053"
        ));
    }

    #[test]
    fn delete_commands_match_only_the_owning_tap() {
        let listing = "\
table ip sbx {
\tchain postrouting {
\t\ttype nat hook postrouting priority srcnat; policy accept;
\t\tip saddr 10.10.11.0/24 oifname \"eth0\" masquerade comment \"sbx-0a0b\" # handle 7
\t\tip saddr 10.20.21.0/24 oifname \"eth0\" masquerade comment \"sbx-1415\" # handle 8
\t}
\tchain forward {
\t\ttype filter hook forward priority filter; policy accept;
\t\tiifname \"sbx-0a0b\" accept # handle 11
\t\toifname \"sbx-0a0b\" accept # handle 12
\t}
}
";
        let commands = delete_commands(listing, &["list", "table", "ip", "sbx"], "sbx-0a0b");
        assert_eq!(
            commands,
            vec![
                "delete rule ip sbx postrouting handle 7",
                "delete rule ip sbx forward handle 11",
                "delete rule ip sbx forward handle 12",
            ]
        );
    }

    #[test]
    fn delete_commands_in_docker_user_keep_foreign_rules() {
        let listing = "\
table ip filter {
\tchain DOCKER-USER {
\t\tiifname \"sbx-0a0b\" accept # handle 31
\t\toifname \"sbx-0a0b\" accept # handle 32
\t\tiifname \"docker0\" accept # handle 2
\t\tcounter return # handle 1
\t}
}
";
        let commands = delete_commands(
            listing,
            &["list", "chain", "ip", "filter", "DOCKER-USER"],
            "sbx-0a0b",
        );
        assert_eq!(
            commands,
            vec![
                "delete rule ip filter DOCKER-USER handle 31",
                "delete rule ip filter DOCKER-USER handle 32",
            ]
        );
    }

    #[test]
    fn delete_commands_tolerate_an_empty_listing() {
        assert!(delete_commands("", &["list", "table", "ip", "sbx"], "sbx-0a0b").is_empty());
    }
}
