use std::collections::HashMap;

use serde::Serialize;

pub const SLOT_COUNT: u16 = 16384;

/// Hash slot of a key: CRC16/XMODEM of the key (or of its `{hash tag}` when
/// one is present and non-empty) modulo 16384.
pub fn key_slot(key: &str) -> u16 {
    let bytes = key.as_bytes();
    let hashed = match bytes.iter().position(|&b| b == b'{') {
        Some(open) => match bytes[open + 1..].iter().position(|&b| b == b'}') {
            Some(len) if len > 0 => &bytes[open + 1..open + 1 + len],
            _ => bytes,
        },
        None => bytes,
    };
    crc16(hashed) % SLOT_COUNT
}

fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in bytes {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Internal → external node address table for deployments behind NAT.
#[derive(Debug, Clone, Default)]
pub struct AddressRemap {
    table: HashMap<String, String>,
}

impl AddressRemap {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }

    /// Map `host:port`; an exact entry wins over a host-only entry, which keeps
    /// the original port unless the mapped value carries its own.
    pub fn apply(&self, addr: &str) -> String {
        if let Some(mapped) = self.table.get(addr) {
            return mapped.clone();
        }
        if let Some((host, port)) = addr.rsplit_once(':') {
            if let Some(mapped) = self.table.get(host) {
                return if mapped.contains(':') {
                    mapped.clone()
                } else {
                    format!("{mapped}:{port}")
                };
            }
        }
        addr.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub primary: String,
    pub replicas: Vec<String>,
}

/// Slot map of the cluster, with every address already remapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub ranges: Vec<SlotRange>,
}

impl Topology {
    /// A lone server owning every slot (cluster mode disabled).
    pub fn standalone(addr: String) -> Self {
        Self {
            ranges: vec![SlotRange {
                start: 0,
                end: SLOT_COUNT - 1,
                primary: addr,
                replicas: Vec::new(),
            }],
        }
    }

    /// Build the slot map from a `CLUSTER NODES` reply.
    ///
    /// `reporter` is the address the reply came from; it replaces the empty
    /// host some servers report for themselves (`:6379@16379`).
    pub fn from_cluster_nodes(
        text: &str,
        reporter: &str,
        remap: &AddressRemap,
    ) -> Result<Self, String> {
        let mut primaries: HashMap<&str, (String, Vec<(u16, u16)>)> = HashMap::new();
        let mut replicas: HashMap<&str, Vec<String>> = HashMap::new();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return Err(format!("short CLUSTER NODES line: {line:?}"));
            }
            let id = fields[0];
            let flags: Vec<&str> = fields[2].split(',').collect();
            if flags.iter().any(|f| matches!(*f, "fail" | "noaddr" | "handshake")) {
                continue;
            }
            let Some(addr) = node_address(fields[1], reporter) else {
                continue;
            };
            let addr = remap.apply(&addr);

            if flags.contains(&"master") {
                let mut slots = Vec::new();
                for span in &fields[8..] {
                    // Migrating/importing markers look like `[42->-id]`.
                    if span.starts_with('[') {
                        continue;
                    }
                    slots.push(parse_slot_span(span)?);
                }
                primaries.insert(id, (addr, slots));
            } else if flags.contains(&"slave") || flags.contains(&"replica") {
                replicas.entry(fields[3]).or_default().push(addr);
            }
        }

        let mut ranges = Vec::new();
        for (id, (primary, spans)) in &primaries {
            let node_replicas = replicas.get(id).cloned().unwrap_or_default();
            for &(start, end) in spans {
                ranges.push(SlotRange {
                    start,
                    end,
                    primary: primary.clone(),
                    replicas: node_replicas.clone(),
                });
            }
        }
        if ranges.is_empty() {
            return Err("CLUSTER NODES reported no slot owners".to_string());
        }
        ranges.sort_by_key(|r| r.start);
        Ok(Self { ranges })
    }

    pub fn range_for(&self, slot: u16) -> Option<&SlotRange> {
        let idx = self.ranges.partition_point(|r| r.end < slot);
        self.ranges.get(idx).filter(|r| r.start <= slot)
    }

    /// Every distinct node address, primaries first.
    pub fn nodes(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for range in &self.ranges {
            if !out.contains(&range.primary) {
                out.push(range.primary.clone());
            }
        }
        for range in &self.ranges {
            for replica in &range.replicas {
                if !out.contains(replica) {
                    out.push(replica.clone());
                }
            }
        }
        out
    }
}

/// `ip:port@cport[,hostname]` → `ip:port`.
fn node_address(field: &str, reporter: &str) -> Option<String> {
    let addr = field.split(['@', ',']).next()?;
    let (host, port) = addr.rsplit_once(':')?;
    if port.is_empty() || port == "0" {
        return None;
    }
    if host.is_empty() {
        let reporter_host = reporter.rsplit_once(':').map_or(reporter, |(h, _)| h);
        return Some(format!("{reporter_host}:{port}"));
    }
    Some(addr.to_string())
}

fn parse_slot_span(span: &str) -> Result<(u16, u16), String> {
    let parse = |s: &str| {
        s.parse::<u16>()
            .ok()
            .filter(|slot| *slot < SLOT_COUNT)
            .ok_or_else(|| format!("invalid slot {span:?}"))
    };
    match span.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (parse(start)?, parse(end)?);
            if start > end {
                return Err(format!("inverted slot range {span:?}"));
            }
            Ok((start, end))
        }
        None => {
            let slot = parse(span)?;
            Ok((slot, slot))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODES: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 10.0.0.4:6379@16379 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 10.0.0.2:6379@16379 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 10.0.0.3:6379@16379 master - 0 1426238318243 3 connected 10923-16383
6ec23923021cf3ffec47632106199cb7f496ce01 10.0.0.5:6379@16379 slave 67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 0 1426238316232 5 connected
824fe116063bc5fcf9f4ffd895bc17aee7731ac3 10.0.0.6:6379@16379 slave,fail 292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 0 1426238317741 6 connected
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca :6379@16379 myself,master - 0 0 1 connected 0-5460 [5461->-67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1]
";

    #[test]
    fn slot_of_known_keys() {
        assert_eq!(key_slot("foo"), 12182);
        assert_eq!(key_slot("123456789"), 12739);
        assert_eq!(key_slot(""), 0);
    }

    #[test]
    fn hash_tags_pin_slots() {
        assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
        assert_eq!(key_slot("{user1000}.following"), key_slot("user1000"));
        // Empty tag hashes the whole key.
        assert_eq!(key_slot("foo{}{bar}"), crc16(b"foo{}{bar}") % SLOT_COUNT);
        // Only the first `{` counts.
        assert_eq!(key_slot("foo{{bar}}zap"), key_slot("{bar"));
    }

    #[test]
    fn parses_cluster_nodes() {
        let topo =
            Topology::from_cluster_nodes(NODES, "10.0.0.1:6379", &AddressRemap::default()).unwrap();
        assert_eq!(topo.ranges.len(), 3);
        assert_eq!(
            topo.ranges[0],
            SlotRange {
                start: 0,
                end: 5460,
                primary: "10.0.0.1:6379".to_string(),
                replicas: vec!["10.0.0.4:6379".to_string()],
            }
        );
        assert_eq!(topo.ranges[1].primary, "10.0.0.2:6379");
        assert_eq!(topo.ranges[1].replicas, vec!["10.0.0.5:6379".to_string()]);
        // The failed replica is dropped.
        assert!(topo.ranges[2].replicas.is_empty());
        assert_eq!(topo.nodes().len(), 5);
    }

    #[test]
    fn remaps_discovered_addresses() {
        let remap = AddressRemap::new(HashMap::from([
            ("10.0.0.2:6379".to_string(), "redis-b.example.com:7002".to_string()),
            ("10.0.0.3".to_string(), "redis-c.example.com".to_string()),
        ]));
        let topo = Topology::from_cluster_nodes(NODES, "10.0.0.1:6379", &remap).unwrap();
        assert_eq!(topo.ranges[1].primary, "redis-b.example.com:7002");
        assert_eq!(topo.ranges[2].primary, "redis-c.example.com:6379");
        assert_eq!(remap.apply("10.0.0.9:6379"), "10.0.0.9:6379");
    }

    #[test]
    fn routes_slots_to_ranges() {
        let topo =
            Topology::from_cluster_nodes(NODES, "10.0.0.1:6379", &AddressRemap::default()).unwrap();
        assert_eq!(topo.range_for(0).unwrap().primary, "10.0.0.1:6379");
        assert_eq!(topo.range_for(5460).unwrap().primary, "10.0.0.1:6379");
        assert_eq!(topo.range_for(5461).unwrap().primary, "10.0.0.2:6379");
        assert_eq!(topo.range_for(16383).unwrap().primary, "10.0.0.3:6379");
    }

    #[test]
    fn uncovered_slots_have_no_owner() {
        let text = "aaa 10.0.0.1:6379@16379 master - 0 0 1 connected 0-99 200\n";
        let topo =
            Topology::from_cluster_nodes(text, "10.0.0.1:6379", &AddressRemap::default()).unwrap();
        assert!(topo.range_for(50).is_some());
        assert!(topo.range_for(150).is_none());
        assert!(topo.range_for(200).is_some());
        assert!(topo.range_for(201).is_none());
    }

    #[test]
    fn rejects_garbage() {
        let remap = AddressRemap::default();
        assert!(Topology::from_cluster_nodes("", "a:1", &remap).is_err());
        assert!(Topology::from_cluster_nodes("not a node line", "a:1", &remap).is_err());
        let bad_slot = "aaa 10.0.0.1:6379@16379 master - 0 0 1 connected 0-20000\n";
        assert!(Topology::from_cluster_nodes(bad_slot, "a:1", &remap).is_err());
    }

    #[test]
    fn standalone_owns_everything() {
        let topo = Topology::standalone("127.0.0.1:6379".to_string());
        assert_eq!(topo.range_for(0).unwrap().primary, "127.0.0.1:6379");
        assert_eq!(topo.range_for(SLOT_COUNT - 1).unwrap().primary, "127.0.0.1:6379");
    }
}
