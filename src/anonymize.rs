use regex::Regex;
use sha2::{Digest, Sha256};
use std::net::Ipv6Addr;
use std::sync::OnceLock;

fn ipv4_pattern() -> &'static Regex {
    static IPV4: OnceLock<Regex> = OnceLock::new();
    IPV4.get_or_init(|| {
        Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$").expect("valid IPv4 pattern")
    })
}

/// Truncates an address to its network prefix before it is stored.
///
/// Dotted-quad IPv4 keeps the first three octets (`a.b.c.0`). Anything
/// containing `:` keeps its first four groups and zeroes the remaining four.
/// Other input is returned unchanged.
pub fn anonymize_ip(ip: &str) -> String {
    if let Some(caps) = ipv4_pattern().captures(ip) {
        return format!("{}.{}.{}.0", &caps[1], &caps[2], &caps[3]);
    }

    if ip.contains(':') {
        return anonymize_ipv6(ip);
    }

    ip.to_string()
}

fn anonymize_ipv6(ip: &str) -> String {
    // Parsing expands `::` so the zeroed half really is the low 64 bits.
    if let Ok(addr) = ip.parse::<Ipv6Addr>() {
        if let Some(v4) = addr.to_ipv4_mapped() {
            return anonymize_ip(&v4.to_string());
        }
        let s = addr.segments();
        return format!("{:x}:{:x}:{:x}:{:x}:0:0:0:0", s[0], s[1], s[2], s[3]);
    }

    let mut groups: Vec<&str> = ip.split(':').take(4).collect();
    groups.resize(4, "0");
    format!("{}:0:0:0:0", groups.join(":"))
}

/// Salted SHA-256 of the full address, hex encoded. Tells clients apart
/// without keeping the address itself.
pub fn client_hash(ip: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(ip.as_bytes());
    format!("{:x}", hasher.finalize())
}
