//! Guest init-script generation.
//!
//! The rootfs `/init` mounts proc/sys/dev and the bootstrap VirtioFS share,
//! then hands off to `/mnt/bootstrap/init.sh`, the program emitted here.
//! The emitter is deterministic: the same inputs produce byte-identical
//! scripts. Mount order is preserved, subdirectory creation is re-entrant
//! (`mkdir -p`), and network rule application runs exactly once.
//!
//! Non-critical steps (credential restore, path rewriting, logging) degrade
//! to warnings; the agent invocation itself runs with `set -e` disabled so
//! an agent crash cannot panic the kernel by killing PID 1's script.

use std::fmt::Write as _;

use crate::network::{extract_base_domain, Policy};
use crate::session::VmMount;

/// Everything the agent init script depends on.
#[derive(Debug)]
pub struct InitScriptParams<'a> {
    /// All VirtioFS mounts in order; the bootstrap mount comes first.
    pub mounts: &'a [VmMount],
    /// Guest path of the project tree; the agent starts here.
    pub project_dir: &'a str,
    pub policy: &'a Policy,
    /// Restore (and save back) credential files from the credentials share.
    pub persist_credentials: bool,
    /// Extra apk packages installed after networking is up.
    pub extra_deps: &'a [String],
}

/// Render the init script for an agent session.
pub fn render_agent_init(p: &InitScriptParams) -> String {
    let mut s = String::new();
    s.push_str("#!/bin/sh\n");
    s.push_str("# Faize agent init, invoked by the rootfs /init\n");
    s.push_str("set -e\n\n");

    emit_cleanup(&mut s, p.persist_credentials);
    emit_mounts(&mut s, p.mounts);
    emit_devpts(&mut s);
    emit_clock_sync(&mut s);
    emit_term_size(&mut s);
    emit_network(&mut s, p.policy);
    emit_extra_deps(&mut s, p.extra_deps);
    emit_log_collector(&mut s);
    emit_clipboard_shims(&mut s);
    emit_open_url_shim(&mut s);
    emit_agent_home(&mut s, p.project_dir);
    if p.persist_credentials {
        emit_credentials_restore(&mut s);
    }
    emit_path_rewrites(&mut s);
    emit_agent_launch(&mut s, p.project_dir);

    s
}

/// Render the init script for a plain shell session: mounts, clock,
/// networking, then an interactive shell on the console.
pub fn render_shell_init(mounts: &[VmMount], project_dir: &str, policy: &Policy) -> String {
    let mut s = String::new();
    s.push_str("#!/bin/sh\n");
    s.push_str("# Faize shell init, invoked by the rootfs /init\n");
    s.push_str("set -e\n\n");

    emit_mounts(&mut s, mounts);
    emit_clock_sync(&mut s);
    emit_network(&mut s, policy);

    if !project_dir.is_empty() {
        s.push_str("# Enter the project directory\n");
        let _ = writeln!(s, "cd {project_dir}\n");
    }

    s.push_str("# Interactive shell on the console\n");
    s.push_str("exec setsid /bin/sh </dev/console >/dev/console 2>&1\n");

    s
}

fn emit_cleanup(s: &mut String, persist_credentials: bool) {
    s.push_str("# Cleanup path: record changes, sync, power off\n");
    s.push_str("record_changes() {\n");
    s.push_str("  find / -type f -newer /mnt/bootstrap/init.sh \\\n");
    s.push_str("    -not -path '/proc/*' -not -path '/sys/*' -not -path '/dev/*' \\\n");
    s.push_str("    -not -path '/mnt/*' -not -path '/tmp/*' -not -path '/run/*' \\\n");
    s.push_str("    > /mnt/bootstrap/guest-changes.txt 2>/dev/null || true\n");
    s.push_str("}\n\n");

    s.push_str("cleanup() {\n");
    s.push_str("  echo 'Shutting down...'\n");
    s.push_str("  kill -TERM $(jobs -p) 2>/dev/null || true\n");
    s.push_str("  wait\n");
    if persist_credentials {
        s.push_str("  save_credentials\n");
    }
    s.push_str("  record_changes\n");
    s.push_str("  sync\n");
    s.push_str("  poweroff -f\n");
    s.push_str("}\n\n");
    s.push_str("trap cleanup TERM INT\n\n");
}

fn emit_mounts(s: &mut String, mounts: &[VmMount]) {
    s.push_str("# Mount VirtioFS shares\n");
    for (i, mount) in mounts.iter().enumerate() {
        let tag = if mount.tag.is_empty() {
            format!("mount{i}")
        } else {
            mount.tag.clone()
        };
        let opts = if mount.read_only { "ro" } else { "rw" };
        let _ = writeln!(s, "mkdir -p {}", mount.target);
        let _ = writeln!(s, "mount -t virtiofs {tag} {} -o {opts}", mount.target);
    }
    s.push('\n');
}

fn emit_devpts(s: &mut String) {
    s.push_str("# Mount devpts for PTY allocation\n");
    s.push_str("mkdir -p /dev/pts\n");
    s.push_str("mount -t devpts devpts /dev/pts -o gid=5,mode=620\n\n");
}

fn emit_clock_sync(s: &mut String) {
    s.push_str("# Seed the clock from the host\n");
    s.push_str("if [ -f /mnt/bootstrap/hosttime ]; then\n");
    s.push_str("  HOSTTIME=$(cat /mnt/bootstrap/hosttime)\n");
    s.push_str(
        "  date -s \"@$HOSTTIME\" >/dev/null 2>&1 && echo 'Clock synced from host' || echo 'Clock sync failed'\n",
    );
    s.push_str("fi\n\n");
}

fn emit_term_size(s: &mut String) {
    s.push_str("# Apply the host terminal size, then watch for changes\n");
    s.push_str("if [ -f /mnt/bootstrap/termsize ]; then\n");
    s.push_str("  TERMSIZE=$(cat /mnt/bootstrap/termsize 2>/dev/null) || true\n");
    s.push_str("  COLS=$(echo $TERMSIZE | cut -d' ' -f1)\n");
    s.push_str("  ROWS=$(echo $TERMSIZE | cut -d' ' -f2)\n");
    s.push_str(
        "  [ -n \"$COLS\" ] && [ -n \"$ROWS\" ] && stty cols $COLS rows $ROWS 2>/dev/null || true\n",
    );
    s.push_str("fi\n\n");

    // The watcher resizes the first PTY slave; the kernel delivers SIGWINCH
    // to its foreground process group.
    s.push_str("(\n");
    s.push_str("  LAST=''\n");
    s.push_str("  while :; do\n");
    s.push_str("    CUR=$(cat /mnt/bootstrap/termsize 2>/dev/null) || CUR=''\n");
    s.push_str("    if [ -n \"$CUR\" ] && [ \"$CUR\" != \"$LAST\" ]; then\n");
    s.push_str("      LAST=\"$CUR\"\n");
    s.push_str("      COLS=$(echo $CUR | cut -d' ' -f1)\n");
    s.push_str("      ROWS=$(echo $CUR | cut -d' ' -f2)\n");
    s.push_str(
        "      [ -e /dev/pts/0 ] && stty -F /dev/pts/0 cols $COLS rows $ROWS 2>/dev/null || true\n",
    );
    s.push_str("    fi\n");
    s.push_str("    sleep 1\n");
    s.push_str("  done\n");
    s.push_str(") &\n\n");
}

fn emit_network(s: &mut String, policy: &Policy) {
    s.push_str("# Bring up networking via DHCP\n");
    s.push_str("echo 'Setting up network...'\n");
    s.push_str("ifconfig lo 127.0.0.1 up\n");
    s.push_str("IFACE=$(ls /sys/class/net | grep -v lo | head -1)\n");
    s.push_str("if [ -n \"$IFACE\" ]; then\n");
    s.push_str("  ifconfig $IFACE up\n");
    s.push_str(
        "  udhcpc -i $IFACE -n -q -t 10 2>/dev/null && echo 'DHCP successful' || echo 'DHCP failed'\n",
    );
    s.push_str("fi\n\n");

    if policy.is_allow_all() {
        // No firewall. Install public resolvers only if DHCP supplied none.
        s.push_str("# Ensure DNS resolvers exist\n");
        s.push_str("grep -q nameserver /etc/resolv.conf 2>/dev/null || {\n");
        s.push_str("  echo 'nameserver 8.8.8.8' > /etc/resolv.conf\n");
        s.push_str("  echo 'nameserver 1.1.1.1' >> /etc/resolv.conf\n");
        s.push_str("}\n\n");
        return;
    }

    emit_dns_forwarder(s);
    emit_firewall(s, policy);
}

fn emit_dns_forwarder(s: &mut String) {
    s.push_str("# Local DNS forwarder with query logging\n");
    s.push_str("cat > /etc/dnsmasq.conf <<'EOF'\n");
    s.push_str("listen-address=127.0.0.1\n");
    s.push_str("bind-interfaces\n");
    s.push_str("no-resolv\n");
    s.push_str("server=8.8.8.8\n");
    s.push_str("server=1.1.1.1\n");
    s.push_str("log-queries\n");
    s.push_str("log-facility=/mnt/bootstrap/dns.log\n");
    s.push_str("EOF\n");
    s.push_str("dnsmasq 2>/dev/null || echo 'DNS forwarder failed to start'\n");
    s.push_str("echo 'nameserver 127.0.0.1' > /etc/resolv.conf\n\n");
}

fn emit_firewall(s: &mut String, policy: &Policy) {
    s.push_str("# Firewall: default-drop outbound, DNS to upstream resolvers only\n");
    s.push_str("iptables -P OUTPUT DROP\n");
    s.push_str("iptables -A OUTPUT -m state --state ESTABLISHED,RELATED -j ACCEPT\n");
    s.push_str("iptables -A OUTPUT -o lo -j ACCEPT\n");
    for resolver in ["8.8.8.8", "1.1.1.1"] {
        let _ = writeln!(s, "iptables -A OUTPUT -p udp -d {resolver} --dport 53 -j ACCEPT");
        let _ = writeln!(s, "iptables -A OUTPUT -p tcp -d {resolver} --dport 53 -j ACCEPT");
    }
    s.push('\n');

    match policy {
        Policy::BlockAll => {
            s.push_str("echo 'Applying network policy: blocked'\n");
            s.push_str(
                "iptables -A OUTPUT -m state --state NEW -j LOG --log-prefix 'FAIZE_DENY: '\n",
            );
            s.push_str("echo 'Network blocked (loopback only)'\n\n");
        }
        Policy::Allowlist { domains, wildcards } => {
            s.push_str("echo 'Applying network policy: domain allowlist'\n\n");

            s.push_str("FAIZE_DEBUG=0\n");
            s.push_str("[ -f /mnt/bootstrap/debug ] && FAIZE_DEBUG=1\n\n");

            s.push_str("allow_domain_ips() {\n");
            s.push_str("  domain=\"$1\"\n");
            s.push_str("  [ \"$FAIZE_DEBUG\" = '1' ] && echo \"Resolving $domain...\"\n");
            s.push_str("  # Temp file avoids subshell scoping issues with a pipe\n");
            s.push_str(
                "  nslookup \"$domain\" 127.0.0.1 2>/dev/null | awk 'NR>2 && /^Address:/ {print $2}' > /tmp/ips_$$ || true\n",
            );
            s.push_str("  while read ip; do\n");
            s.push_str("    # Skip IPv6: the guest kernel has it disabled\n");
            s.push_str("    if [ -n \"$ip\" ] && ! echo \"$ip\" | grep -q ':'; then\n");
            s.push_str("      [ \"$FAIZE_DEBUG\" = '1' ] && echo \"  Allowing $ip ($domain)\"\n");
            s.push_str(
                "      iptables -A OUTPUT -d \"$ip\" -m state --state NEW -j LOG --log-prefix 'FAIZE_NET: ' 2>/dev/null || true\n",
            );
            s.push_str(
                "      iptables -A OUTPUT -d \"$ip\" -j ACCEPT 2>/dev/null || echo \"  Failed to add rule for $ip\"\n",
            );
            s.push_str("    fi\n");
            s.push_str("  done < /tmp/ips_$$\n");
            s.push_str("  rm -f /tmp/ips_$$\n");
            s.push_str("}\n\n");

            s.push_str("# Brief wait for the forwarder to come up\n");
            s.push_str("sleep 1\n\n");

            if !domains.is_empty() {
                let joined = domains.join(" ");
                let _ = writeln!(s, "ALLOWED_DOMAINS=\"{joined}\"");
                s.push_str("for domain in $ALLOWED_DOMAINS; do\n");
                s.push_str("  allow_domain_ips \"$domain\"\n");
                s.push_str("done\n\n");
            }

            for pattern in wildcards {
                let base = extract_base_domain(pattern);
                let _ = writeln!(s, "# Wildcard {pattern}: match the TLS SNI on 443");
                let _ = writeln!(
                    s,
                    "iptables -A OUTPUT -p tcp --dport 443 -m string --algo bm --string '.{base}' -j ACCEPT"
                );
                let _ = writeln!(
                    s,
                    "iptables -A OUTPUT -p tcp --dport 443 -m string --algo bm --string '{base}' -j ACCEPT"
                );
                // A-record fallback for non-TLS traffic to the base domain.
                let _ = writeln!(s, "allow_domain_ips \"{base}\"");
            }
            if !wildcards.is_empty() {
                s.push('\n');
            }

            s.push_str(
                "iptables -A OUTPUT -m state --state NEW -j LOG --log-prefix 'FAIZE_DENY: '\n",
            );

            s.push_str("if [ \"$FAIZE_DEBUG\" = '1' ]; then\n");
            s.push_str("  echo '=== iptables OUTPUT rules ==='\n");
            s.push_str("  iptables -L OUTPUT -n 2>/dev/null | head -40 || true\n");
            s.push_str("fi\n");
            s.push_str("echo 'Network policy applied'\n\n");
        }
        Policy::AllowAll => unreachable!("allow-all handled before firewall emission"),
    }
}

fn emit_extra_deps(s: &mut String, extra_deps: &[String]) {
    if extra_deps.is_empty() {
        return;
    }
    s.push_str("# Install extra packages\n");
    let joined = extra_deps.join(" ");
    let _ = writeln!(
        s,
        "apk add --no-cache {joined} 2>/dev/null || echo 'Warning: failed to install extra packages'"
    );
    s.push('\n');
}

fn emit_log_collector(s: &mut String) {
    s.push_str("# Drain firewall log lines from dmesg into the bootstrap share\n");
    s.push_str("(\n");
    s.push_str("  while :; do\n");
    s.push_str("    dmesg -c 2>/dev/null | grep 'FAIZE_' >> /mnt/bootstrap/network.log || true\n");
    s.push_str("    sleep 2\n");
    s.push_str("  done\n");
    s.push_str(") &\n\n");
}

fn emit_clipboard_shims(s: &mut String) {
    s.push_str("# Clipboard shims backed by the bootstrap share\n");
    s.push_str("mkdir -p /usr/local/bin /mnt/bootstrap/clipboard\n");
    s.push_str("cat > /usr/local/bin/xclip <<'EOF'\n");
    s.push_str("#!/bin/sh\n");
    s.push_str("# Serve the host clipboard from the bootstrap share\n");
    s.push_str("case \"$*\" in\n");
    s.push_str("  *image/png*)\n");
    s.push_str("    cat /mnt/bootstrap/clipboard/clipboard-image 2>/dev/null ;;\n");
    s.push_str("  *-o*|*-out*)\n");
    s.push_str("    cat /mnt/bootstrap/clipboard/clipboard-text 2>/dev/null ;;\n");
    s.push_str("  *)\n");
    s.push_str("    cat > /dev/null ;;\n");
    s.push_str("esac\n");
    s.push_str("EOF\n");
    s.push_str("chmod 755 /usr/local/bin/xclip\n");
    s.push_str("cp /usr/local/bin/xclip /usr/local/bin/xsel\n\n");
}

fn emit_open_url_shim(s: &mut String) {
    s.push_str("# Browser-open shim: publish the URL, wait for the host ack\n");
    s.push_str("cat > /usr/local/bin/xdg-open <<'EOF'\n");
    s.push_str("#!/bin/sh\n");
    s.push_str("URL=\"$1\"\n");
    s.push_str("[ -n \"$URL\" ] || exit 1\n");
    s.push_str("printf '%s' \"$URL\" > /mnt/bootstrap/.open-url.tmp\n");
    s.push_str("mv /mnt/bootstrap/.open-url.tmp /mnt/bootstrap/open-url\n");
    s.push_str("# Host removes the file as acknowledgment\n");
    s.push_str("i=0\n");
    s.push_str("while [ $i -lt 20 ]; do\n");
    s.push_str("  [ -f /mnt/bootstrap/open-url ] || exit 0\n");
    s.push_str("  sleep 1\n");
    s.push_str("  i=$((i+1))\n");
    s.push_str("done\n");
    s.push_str("exit 0\n");
    s.push_str("EOF\n");
    s.push_str("chmod 755 /usr/local/bin/xdg-open\n");
    s.push_str("ln -sf /usr/local/bin/xdg-open /usr/local/bin/open\n\n");
}

fn emit_agent_home(s: &mut String, project_dir: &str) {
    s.push_str("# Fix ownership for the agent user\n");
    s.push_str("chown -R claude:claude /home/claude 2>/dev/null || true\n");
    s.push_str("chown -R claude:claude /opt/toolchain 2>/dev/null || true\n");
    if !project_dir.is_empty() {
        let _ = writeln!(s, "chown -R claude:claude {project_dir} 2>/dev/null || true");
    }
    s.push('\n');

    s.push_str("# Agent configuration directory\n");
    s.push_str("mkdir -p /home/claude/.claude\n");
    s.push_str("chown claude:claude /home/claude/.claude\n\n");

    s.push_str("# Symlink read-only configuration from the host share\n");
    for file in ["CLAUDE.md", "keybindings.json"] {
        let _ = writeln!(s, "if [ -e /mnt/host-claude/{file} ]; then");
        let _ = writeln!(s, "  ln -sf /mnt/host-claude/{file} /home/claude/.claude/{file}");
        s.push_str("fi\n");
    }
    s.push('\n');

    s.push_str("# Copy settings.json only if not already present\n");
    s.push_str(
        "if [ -f /mnt/host-claude/settings.json ] && [ ! -e /home/claude/.claude/settings.json ]; then\n",
    );
    s.push_str("  cp /mnt/host-claude/settings.json /home/claude/.claude/settings.json\n");
    s.push_str("  chown claude:claude /home/claude/.claude/settings.json\n");
    s.push_str("fi\n\n");

    s.push_str("# Writable directories seeded with host content\n");
    for dir in ["skills", "plugins"] {
        let _ = writeln!(s, "mkdir -p /home/claude/.claude/{dir}");
        let _ = writeln!(s, "if [ -d /mnt/host-claude/{dir} ]; then");
        let _ = writeln!(
            s,
            "  cp -r /mnt/host-claude/{dir}/. /home/claude/.claude/{dir}/ 2>/dev/null || true"
        );
        s.push_str("fi\n");
        let _ = writeln!(s, "chown -R claude:claude /home/claude/.claude/{dir}");
    }
    s.push('\n');
}

fn emit_credentials_restore(s: &mut String) {
    s.push_str("# Restore persisted credentials from the credentials share\n");
    s.push_str("if [ -f /mnt/host-credentials/.credentials.json ]; then\n");
    s.push_str(
        "  cp /mnt/host-credentials/.credentials.json /home/claude/.claude/.credentials.json 2>/dev/null || echo 'Warning: credentials restore failed'\n",
    );
    s.push_str(
        "  chown claude:claude /home/claude/.claude/.credentials.json 2>/dev/null || true\n",
    );
    s.push_str("fi\n\n");

    s.push_str("save_credentials() {\n");
    s.push_str("  if [ -f /home/claude/.claude/.credentials.json ]; then\n");
    s.push_str(
        "    cp /home/claude/.claude/.credentials.json /mnt/host-credentials/.credentials.json 2>/dev/null || echo 'Warning: credentials save failed'\n",
    );
    s.push_str("  fi\n");
    s.push_str("}\n\n");
}

fn emit_path_rewrites(s: &mut String) {
    s.push_str("# Rewrite host-style config paths to their in-guest equivalents\n");
    s.push_str("for f in /home/claude/.claude/settings.json /home/claude/.claude/plugins/config.json; do\n");
    s.push_str("  if [ -f \"$f\" ]; then\n");
    s.push_str(
        "    sed -i 's|/Users/[^/\"]*/\\.claude|/home/claude/.claude|g' \"$f\" 2>/dev/null || echo \"Warning: path rewrite failed for $f\"\n",
    );
    s.push_str("  fi\n");
    s.push_str("done\n\n");
}

fn emit_agent_launch(s: &mut String, project_dir: &str) {
    if project_dir.is_empty() {
        s.push_str("cd /workspace\n\n");
    } else {
        let _ = writeln!(s, "cd {project_dir}\n");
    }

    s.push_str("# Launch the agent as the non-root user under a PTY.\n");
    s.push_str("# script(1) allocates the PTY the agent needs for raw mode;\n");
    s.push_str("# exit-on-error is disabled around it so an agent crash does\n");
    s.push_str("# not take down PID 1.\n");
    s.push_str("set +e\n");
    s.push_str(
        "script -q -c \"su -s /bin/sh claude -c 'export HOME=/home/claude && export PATH=/usr/local/bin:/usr/bin:/bin && cd \\${PWD} && exec claude'\" /dev/null\n",
    );
    s.push_str("AGENT_EXIT=$?\n");
    s.push_str("set -e\n\n");
    s.push_str("echo \"Agent exited with code: $AGENT_EXIT\"\n\n");
    s.push_str("cleanup\n");
}
