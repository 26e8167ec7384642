use std::{borrow::Cow, collections::HashMap};

use serde::Serialize;

/// Where in the stack a buffer was discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DropCategory {
    /// A netfilter verdict: iptables, nftables or a bare NF_DROP.
    Firewall,
    Stack,
}

impl DropCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            DropCategory::Firewall => "firewall",
            DropCategory::Stack => "stack",
        }
    }

    fn of(name: &str) -> Self {
        let name = name.to_ascii_uppercase();
        if ["NETFILTER", "IPTABLES", "NFTABLES"]
            .iter()
            .any(|marker| name.contains(marker))
        {
            DropCategory::Firewall
        } else {
            DropCategory::Stack
        }
    }
}

/// Kernel drop-reason codes to their symbolic names, without the
/// `SKB_DROP_REASON_` prefix.
#[derive(Debug, Default, Clone)]
pub struct DropReasons(HashMap<u32, String>);

impl DropReasons {
    /// Names of the low, long-stable codes of `enum skb_drop_reason`, for
    /// when neither BTF nor tracefs can be read.
    pub fn builtin() -> Self {
        [
            (2, "NOT_SPECIFIED"),
            (3, "NO_SOCKET"),
            (4, "PKT_TOO_SMALL"),
            (5, "TCP_CSUM"),
            (6, "SOCKET_FILTER"),
            (7, "UDP_CSUM"),
            (8, "NETFILTER_DROP"),
            (9, "OTHERHOST"),
            (10, "IP_CSUM"),
            (11, "IP_INHDR"),
            (12, "IP_RPFILTER"),
            (13, "UNICAST_IN_L2_MULTICAST"),
        ]
        .into_iter()
        .map(|(code, name)| (code, name.to_string()))
        .collect()
    }

    pub fn name(&self, code: u32) -> Cow<'_, str> {
        match self.0.get(&code) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("UNKNOWN({code})")),
        }
    }

    /// Unknown codes count as stack drops.
    pub fn category(&self, code: u32) -> DropCategory {
        self.0
            .get(&code)
            .map_or(DropCategory::Stack, |name| DropCategory::of(name))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u32, String)> for DropReasons {
    fn from_iter<I: IntoIterator<Item = (u32, String)>>(iter: I) -> Self {
        DropReasons(
            iter.into_iter()
                .map(|(code, name)| {
                    let name = match name.strip_prefix("SKB_DROP_REASON_") {
                        Some(short) => short.to_string(),
                        None => name,
                    };
                    (code, name)
                })
                .collect(),
        )
    }
}
