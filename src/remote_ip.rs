use axum::http::HeaderMap;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

fn port_pattern() -> &'static Regex {
    static PORT: OnceLock<Regex> = OnceLock::new();
    PORT.get_or_init(|| {
        Regex::new(r"((\.\d+)|(\]))(?P<port>:[0-9]+)$").expect("valid port pattern")
    })
}

fn forwarded_pattern() -> &'static Regex {
    static FORWARDED: OnceLock<Regex> = OnceLock::new();
    FORWARDED.get_or_init(|| Regex::new(r"(?i)for=(?<for>[^;,]+)").expect("valid forwarded pattern"))
}

pub struct RemoteIp;

impl RemoteIp {
    /// Picks the client address, preferring what the reverse proxy reports
    /// over the socket peer. Header values that do not parse as an IP address
    /// are skipped.
    pub fn get(headers: &HeaderMap, socket_addr: &SocketAddr) -> String {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        if let Some(ip) = header("cf-connecting-ip").and_then(Self::parse_candidate) {
            return ip;
        }

        if let Some(ip) = header("x-forwarded-for").and_then(Self::first_forwarded_for) {
            return ip;
        }

        if let Some(forwarded) = header("forwarded") {
            let ip = forwarded_pattern()
                .captures(forwarded)
                .and_then(|caps| caps.name("for"))
                .and_then(|ip| Self::parse_candidate(ip.as_str().trim_matches('"')));
            if let Some(ip) = ip {
                return ip;
            }
        }

        socket_addr.ip().to_string()
    }

    fn parse_candidate(raw: &str) -> Option<String> {
        Self::clean_ip(raw)
            .parse::<IpAddr>()
            .ok()
            .map(|ip| ip.to_string())
    }

    fn clean_ip(ip_and_port: &str) -> String {
        let ip = match port_pattern()
            .captures(ip_and_port)
            .and_then(|caps| caps.name("port"))
        {
            Some(port) => &ip_and_port[..ip_and_port.len() - port.as_str().len()],
            None => ip_and_port,
        };

        ip.trim_start_matches('[').trim_end_matches(']').to_string()
    }

    fn first_forwarded_for(list: &str) -> Option<String> {
        list.split(',')
            .map(str::trim)
            .find(|s| !s.is_empty())
            .and_then(Self::parse_candidate)
    }
}
