// ── Scan range parsing ──
//
// One entry per line: single address, CIDR block, dash range (full or
// shorthand right side), or a last-octet wildcard. `#` starts a comment.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Default cap on the number of addresses a range document may expand to.
pub const DEFAULT_MAX_ADDRESSES: usize = 4096;

/// A problem on one line of a range document (1-based).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct RangeError {
    pub line: usize,
    pub message: String,
}

/// Expand `text` into a de-duplicated address list, in order of first
/// appearance. Every malformed line is reported.
pub fn parse_ranges(text: &str, max_addresses: usize) -> Result<Vec<Ipv4Addr>, Vec<RangeError>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut errors = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let entry = raw.split('#').next().unwrap_or_default().trim();
        if entry.is_empty() {
            continue;
        }

        match expand_entry(entry, max_addresses) {
            Ok(addrs) => {
                for addr in addrs {
                    if seen.insert(addr) {
                        out.push(addr);
                    }
                }
                if out.len() > max_addresses {
                    errors.push(RangeError {
                        line,
                        message: format!("total address count exceeds the limit of {max_addresses}"),
                    });
                    out.truncate(max_addresses);
                }
            }
            Err(message) => errors.push(RangeError { line, message }),
        }
    }

    if errors.is_empty() {
        Ok(out)
    } else {
        Err(errors)
    }
}

/// Expand a single entry, refusing to produce more than `limit` addresses.
fn expand_entry(entry: &str, limit: usize) -> Result<Vec<Ipv4Addr>, String> {
    let (start, end) = if let Some((addr, prefix)) = entry.split_once('/') {
        cidr_bounds(addr.trim(), prefix.trim())?
    } else if let Some((left, right)) = entry.split_once('-') {
        dash_bounds(left.trim(), right.trim())?
    } else if let Some(base) = entry
        .strip_suffix(".x")
        .or_else(|| entry.strip_suffix(".X"))
        .or_else(|| entry.strip_suffix(".*"))
    {
        wildcard_bounds(base)?
    } else {
        let addr = parse_addr(entry)?;
        (u32::from(addr), u32::from(addr))
    };

    let count = usize::try_from(end - start).unwrap_or(usize::MAX).saturating_add(1);
    if count > limit {
        return Err(format!(
            "'{entry}' expands to {count} addresses, over the limit of {limit}"
        ));
    }
    Ok((start..=end).map(Ipv4Addr::from).collect())
}

fn parse_addr(s: &str) -> Result<Ipv4Addr, String> {
    s.parse()
        .map_err(|_| format!("'{s}' is not an IPv4 address"))
}

fn cidr_bounds(addr: &str, prefix: &str) -> Result<(u32, u32), String> {
    let base = u32::from(parse_addr(addr)?);
    let bits: u32 = prefix
        .parse()
        .ok()
        .filter(|b| *b <= 32)
        .ok_or_else(|| format!("'{prefix}' is not a valid prefix length"))?;

    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    let network = base & mask;
    let broadcast = network | !mask;

    // /31 and /32 have no network or broadcast address to skip.
    if bits >= 31 {
        Ok((network, broadcast))
    } else {
        Ok((network + 1, broadcast - 1))
    }
}

fn dash_bounds(left: &str, right: &str) -> Result<(u32, u32), String> {
    let start = parse_addr(left)?;
    let end = if let Ok(full) = right.parse::<Ipv4Addr>() {
        full
    } else {
        // Shorthand: the right side replaces the last N octets.
        let tail: Vec<&str> = right.split('.').collect();
        if tail.is_empty() || tail.len() > 3 {
            return Err(format!("'{right}' is not a valid range end"));
        }
        let mut octets = start.octets();
        let offset = 4 - tail.len();
        for (slot, part) in octets.iter_mut().skip(offset).zip(&tail) {
            *slot = part
                .parse::<u8>()
                .map_err(|_| format!("'{right}' is not a valid range end"))?;
        }
        Ipv4Addr::from(octets)
    };

    let (start, end) = (u32::from(start), u32::from(end));
    if end < start {
        return Err(format!("range end {right} is before start {left}"));
    }
    Ok((start, end))
}

fn wildcard_bounds(base: &str) -> Result<(u32, u32), String> {
    let prefix = parse_addr(&format!("{base}.0"))?;
    let network = u32::from(prefix);
    Ok((network + 1, network + 254))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ips(list: &[&str]) -> Vec<Ipv4Addr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn single_addresses_and_comments() {
        let text = "10.0.0.5\n# office printers\n\n10.0.0.6 # lobby\n10.0.0.5\n";
        assert_eq!(
            parse_ranges(text, DEFAULT_MAX_ADDRESSES).unwrap(),
            ips(&["10.0.0.5", "10.0.0.6"])
        );
    }

    #[test]
    fn cidr_skips_network_and_broadcast() {
        let out = parse_ranges("192.168.1.0/30", DEFAULT_MAX_ADDRESSES).unwrap();
        assert_eq!(out, ips(&["192.168.1.1", "192.168.1.2"]));

        let out = parse_ranges("192.168.1.8/31", DEFAULT_MAX_ADDRESSES).unwrap();
        assert_eq!(out, ips(&["192.168.1.8", "192.168.1.9"]));

        let out = parse_ranges("192.168.1.77/24", DEFAULT_MAX_ADDRESSES).unwrap();
        assert_eq!(out.len(), 254);
        assert_eq!(out[0], "192.168.1.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn dash_ranges() {
        assert_eq!(
            parse_ranges("10.0.0.5-7", DEFAULT_MAX_ADDRESSES).unwrap(),
            ips(&["10.0.0.5", "10.0.0.6", "10.0.0.7"])
        );
        assert_eq!(
            parse_ranges("10.0.0.254-1.1", DEFAULT_MAX_ADDRESSES).unwrap(),
            ips(&["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"])
        );
        assert_eq!(
            parse_ranges("10.0.0.1 - 10.0.0.2", DEFAULT_MAX_ADDRESSES).unwrap(),
            ips(&["10.0.0.1", "10.0.0.2"])
        );
    }

    #[test]
    fn wildcard_covers_hosts() {
        let out = parse_ranges("10.1.2.x", DEFAULT_MAX_ADDRESSES).unwrap();
        assert_eq!(out.len(), 254);
        assert_eq!(out.last().copied(), Some("10.1.2.254".parse().unwrap()));
        assert_eq!(parse_ranges("10.1.2.*", DEFAULT_MAX_ADDRESSES).unwrap(), out);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let errs = parse_ranges("10.0.0.1\nprinter.local\n10.0.0.9-3\n10.0.0.0/40", 100).unwrap_err();
        let lines: Vec<usize> = errs.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![2, 3, 4]);
        assert!(errs[0].to_string().starts_with("line 2:"));
    }

    #[test]
    fn limit_is_enforced() {
        let errs = parse_ranges("10.0.0.0/16", DEFAULT_MAX_ADDRESSES).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].message.contains("limit"));

        assert!(parse_ranges("10.0.0.1-4\n10.0.1.1-4", 6).is_err());
        assert_eq!(parse_ranges("10.0.0.1-4\n10.0.0.1-4", 4).unwrap().len(), 4);
    }
}
