use std::collections::{HashMap, HashSet};
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    /// `host:port` dialed for connections routed here.
    pub addr: String,
}

impl Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Upstream({}, {})", self.name, self.addr)
    }
}

#[derive(Debug, Default)]
pub struct Condition {
    pub domains: HashSet<String>,
    pub suffix_domains: HashSet<String>,
}

#[derive(Debug)]
pub struct RouteRule(pub Upstream, pub Option<Condition>);

pub type UpstreamName = String;

#[derive(Debug, Default)]
pub struct RouteTable {
    pub default: Option<Upstream>,
    pub upstream_dict: HashMap<UpstreamName, RouteRule>,
}

/// Lower-cases a sniffed host and strips a trailing dot and any `:port`.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = match host.strip_prefix('[') {
        Some(rest) => rest.split_once(']').map(|(addr, _)| addr).unwrap_or(rest),
        None => match host.rsplit_once(':') {
            Some((name, port))
                if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
            {
                name
            }
            _ => host,
        },
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

impl RouteTable {
    pub fn add<S: ToString>(&mut self, name: S, addr: S) {
        self.upstream_dict.insert(
            name.to_string(),
            RouteRule(
                Upstream {
                    name: name.to_string(),
                    addr: addr.to_string(),
                },
                None,
            ),
        );
    }

    /// Picks the upstream for `host`: an exact DOMAIN rule first, then the
    /// longest matching DOMAIN-SUFFIX rule, then the default.
    pub fn match_route(&self, host: &str) -> Option<&Upstream> {
        let domain = normalize_host(host);

        for RouteRule(upstream, rule) in self.upstream_dict.values() {
            if let Some(rule) = rule {
                if rule.domains.contains(&domain) {
                    return Some(upstream);
                }
            }
        }

        let mut suffix = domain.as_str();
        loop {
            for RouteRule(upstream, rule) in self.upstream_dict.values() {
                if let Some(rule) = rule {
                    if rule.suffix_domains.contains(suffix) {
                        return Some(upstream);
                    }
                }
            }
            match suffix.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => suffix = rest,
                _ => break,
            }
        }

        self.default.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        let mut route = RouteTable::default();
        route.add("edge", "10.0.0.1:443");
        route.add("internal", "10.0.0.2:443");
        route.add("fallback", "10.0.0.3:443");

        let edge = route.upstream_dict.get_mut("edge").unwrap();
        edge.1 = Some(Condition {
            domains: ["www.example.com".to_string()].into_iter().collect(),
            suffix_domains: ["example.com".to_string()].into_iter().collect(),
        });
        let internal = route.upstream_dict.get_mut("internal").unwrap();
        internal.1 = Some(Condition {
            domains: ["api.example.com".to_string()].into_iter().collect(),
            suffix_domains: ["corp.example.com".to_string()].into_iter().collect(),
        });
        route.default = Some(route.upstream_dict["fallback"].0.clone());
        route
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM"), "example.com");
        assert_eq!(normalize_host("example.com:8080"), "example.com");
        assert_eq!(normalize_host("example.com."), "example.com");
        assert_eq!(normalize_host("[::1]:443"), "::1");
        assert_eq!(normalize_host("::1"), "::1");
        assert_eq!(normalize_host(" example.com "), "example.com");
    }

    #[test]
    fn test_exact_beats_suffix() {
        let route = table();
        assert_eq!(route.match_route("api.example.com").unwrap().name, "internal");
        assert_eq!(route.match_route("www.example.com").unwrap().name, "edge");
    }

    #[test]
    fn test_longest_suffix_wins() {
        let route = table();
        assert_eq!(route.match_route("git.corp.example.com").unwrap().name, "internal");
        assert_eq!(route.match_route("blog.example.com").unwrap().name, "edge");
        assert_eq!(route.match_route("example.com:443").unwrap().name, "edge");
    }

    #[test]
    fn test_suffix_respects_label_boundary() {
        let route = table();
        assert_eq!(route.match_route("badexample.com").unwrap().name, "fallback");
    }

    #[test]
    fn test_no_default() {
        let mut route = table();
        route.default = None;
        assert!(route.match_route("unknown.test").is_none());
    }
}
