//! Announced network prefixes: a canonical, sorted set of CIDR ranges.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

/// Prefixes a node announces into the mesh. Duplicates collapse and host bits
/// are truncated on insertion, so two sets holding the same ranges compare
/// equal regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSet(BTreeSet<IpNet>);

impl PrefixSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-address prefix (/32 or /128) for `addr`.
    pub fn host(addr: IpAddr) -> Self {
        let mut set = Self::new();
        set.insert(IpNet::from(addr));
        set
    }

    /// Parse CIDR strings. Unparsable entries are skipped and returned
    /// alongside the set so the caller can report them.
    pub fn from_cidrs<I, S>(cidrs: I) -> (Self, Vec<String>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        let mut invalid = Vec::new();
        for cidr in cidrs {
            let cidr = cidr.as_ref().trim();
            if cidr.is_empty() {
                continue;
            }
            match cidr.parse::<IpNet>() {
                Ok(net) => {
                    set.insert(net);
                }
                Err(_) => invalid.push(cidr.to_string()),
            }
        }
        (set, invalid)
    }

    /// Insert a prefix. Returns false if it was already present.
    pub fn insert(&mut self, net: IpNet) -> bool {
        self.0.insert(net.trunc())
    }

    /// Union `other` into `self`, skipping prefixes already present.
    pub fn merge(&mut self, other: &PrefixSet) {
        for net in &other.0 {
            if !self.0.contains(net) {
                self.0.insert(*net);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpNet> {
        self.0.iter()
    }

    /// Canonical CIDR strings, sorted as strings.
    pub fn to_cidrs(&self) -> Vec<String> {
        let mut out: Vec<String> = self.0.iter().map(|n| n.to_string()).collect();
        out.sort();
        out
    }
}

impl fmt::Display for PrefixSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cidrs().join(","))
    }
}

impl FromIterator<IpNet> for PrefixSet {
    fn from_iter<T: IntoIterator<Item = IpNet>>(iter: T) -> Self {
        let mut set = Self::new();
        for net in iter {
            set.insert(net);
        }
        set
    }
}
