//! `/etc/hosts` rollout
//!
//! Every member of a fleet gets one line per address of every other member
//! so nodes can reach each other by `<cluster>-<node>` name. Managed lines
//! carry a trailing marker and are replaced wholesale on each rollout.

use super::collection::Collection;
use super::record::LifecycleState;
use crate::backend::ExecRequest;

/// Trailing marker identifying managed lines
pub const HOSTS_MARKER: &str = "# fleet-managed";

/// Replace every marked line of `/etc/hosts` with the lines on stdin
///
/// Rewrites in place; the file may be a bind mount.
const UPDATE_SCRIPT: &str = "grep -v '# fleet-managed$' /etc/hosts > /tmp/fleet-hosts; \
cat /tmp/fleet-hosts - > /etc/hosts && rm -f /tmp/fleet-hosts";

/// Reduce `name` to hostname characters
///
/// Anything outside `[A-Za-z0-9-]` becomes `-`, runs of dashes collapse and
/// leading or trailing dashes are dropped.
pub fn sanitize_hostname(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();

    let mut collapsed = String::with_capacity(mapped.len());
    for c in mapped.chars() {
        if c == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(c);
    }
    collapsed.trim_matches('-').to_string()
}

/// Hosts lines for every non-terminated instance in `members`
///
/// Private addresses map to `<cluster>-<n>`, public ones to
/// `<cluster>-<n>-pub`. Private lines come first, each group sorted by name.
pub fn render_hosts_entries(members: &Collection) -> Vec<String> {
    let mut private = Vec::new();
    let mut public = Vec::new();

    for record in members.with_not_state(&[LifecycleState::Terminated]).iter() {
        let Some(node_no) = record.node_no() else {
            continue;
        };
        let hostname = sanitize_hostname(&format!("{}-{}", record.cluster_name(), node_no));

        if let Some(ip) = &record.network.private {
            private.push((hostname.clone(), format_entry(ip, &hostname)));
        }
        if let Some(ip) = &record.network.public {
            let name = format!("{}-pub", hostname);
            public.push((name.clone(), format_entry(ip, &name)));
        }
    }

    private.sort();
    public.sort();
    private
        .into_iter()
        .chain(public)
        .map(|(_, entry)| entry)
        .collect()
}

fn format_entry(ip: &str, hostname: &str) -> String {
    format!("{:<15} {:<30} {}", ip, hostname, HOSTS_MARKER)
}

/// Command that installs `entries` as the managed block of `/etc/hosts`
pub fn hosts_update_request(entries: &[String]) -> ExecRequest {
    let mut stdin = entries.join("\n");
    if !stdin.is_empty() {
        stdin.push('\n');
    }
    ExecRequest::shell(UPDATE_SCRIPT).with_stdin(stdin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::record::{BackendType, Network, ResourceRecord};

    fn node(cluster: &str, n: u32, private: Option<&str>, public: Option<&str>) -> ResourceRecord {
        let mut record = ResourceRecord::instance(BackendType::Memory, cluster, n, format!("i-{n}"))
            .with_state(LifecycleState::Running);
        record.network = Network {
            public: public.map(str::to_string),
            private: private.map(str::to_string),
        };
        record
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("my_dc-1"), "my-dc-1");
        assert_eq!(sanitize_hostname("--a..b--"), "a-b");
        assert_eq!(sanitize_hostname("plain-2"), "plain-2");
    }

    #[test]
    fn test_render_orders_private_then_public() {
        let members: Collection = vec![
            node("mydc", 2, Some("10.0.0.2"), Some("1.1.1.2")),
            node("mydc", 1, Some("10.0.0.1"), None),
            node("mydc", 3, None, None).with_state(LifecycleState::Terminated),
        ]
        .into_iter()
        .collect();

        let entries = render_hosts_entries(&members);
        assert_eq!(entries.len(), 3);
        assert!(entries[0].starts_with("10.0.0.1        mydc-1 "));
        assert!(entries[1].starts_with("10.0.0.2        mydc-2 "));
        assert!(entries[2].starts_with("1.1.1.2         mydc-2-pub "));
        assert!(entries.iter().all(|e| e.ends_with(HOSTS_MARKER)));
    }

    #[test]
    fn test_update_request_feeds_entries_on_stdin() {
        let req = hosts_update_request(&["a".to_string(), "b".to_string()]);
        assert_eq!(req.stdin.as_deref(), Some("a\nb\n"));
        assert_eq!(req.command[0], "sh");
        assert!(req.command[2].contains("/etc/hosts"));
    }
}
