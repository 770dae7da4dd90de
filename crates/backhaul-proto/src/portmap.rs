//! Public-port mapping grammar.
//!
//! Each entry names the local ports the server listens on and, optionally,
//! the remote port the tunneled bytes are addressed to:
//!
//! * `8080`: listen on 8080, forward to 8080
//! * `8080=22`: listen on 8080, forward to 22
//! * `9000:9002`: three listeners, each forwarding to its own port
//! * `[9000:9002]=22`: three listeners, all forwarding to 22
//!
//! An inverted range is a configuration-fatal error.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortMapError {
    #[error("invalid port mapping: {0}")]
    Invalid(String),

    #[error("invalid range {start}:{end} in mapping {entry}")]
    InvalidRange { entry: String, start: u16, end: u16 },
}

/// One parsed mapping entry. `remote_port` of `None` means every local
/// port forwards to the same-numbered remote port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub local_start: u16,
    pub local_end: u16,
    pub remote_port: Option<u16>,
}

fn grammar() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\[(\d+):(\d+)\](?:=(\d+))?|(\d+)(?::(\d+))?(?:=(\d+))?)$")
            .expect("port mapping grammar")
    })
}

impl PortMapping {
    pub fn parse(entry: &str) -> Result<Self, PortMapError> {
        let caps = grammar()
            .captures(entry)
            .ok_or_else(|| PortMapError::Invalid(entry.to_string()))?;

        // non-empty capture groups in order; u16 parse rejects ports > 65535
        let numbers = caps
            .iter()
            .skip(1)
            .flatten()
            .map(|m| {
                m.as_str()
                    .parse::<u16>()
                    .map_err(|_| PortMapError::Invalid(entry.to_string()))
            })
            .collect::<Result<Vec<u16>, _>>()?;

        let remapped = entry.contains('=');
        let (local_start, local_end, remote_port) = match (numbers.as_slice(), remapped) {
            ([start], false) => (*start, *start, None),
            ([start, end], false) => (*start, *end, None),
            ([start, remote], true) => (*start, *start, Some(*remote)),
            ([start, end, remote], true) => (*start, *end, Some(*remote)),
            _ => return Err(PortMapError::Invalid(entry.to_string())),
        };

        if local_start > local_end {
            return Err(PortMapError::InvalidRange {
                entry: entry.to_string(),
                start: local_start,
                end: local_end,
            });
        }

        Ok(Self {
            local_start,
            local_end,
            remote_port,
        })
    }

    /// One `(local port, remote port)` pair per listener this entry spawns.
    pub fn expand(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        let remote = self.remote_port;
        (self.local_start..=self.local_end).map(move |local| (local, remote.unwrap_or(local)))
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local_start == self.local_end {
            write!(f, "{}", self.local_start)?;
        } else {
            write!(f, "[{}:{}]", self.local_start, self.local_end)?;
        }
        if let Some(remote) = self.remote_port {
            write!(f, "={remote}")?;
        }
        Ok(())
    }
}

/// Parses every configured entry; the first bad one fails the whole set.
pub fn parse_mappings(entries: &[String]) -> Result<Vec<PortMapping>, PortMapError> {
    entries.iter().map(|e| PortMapping::parse(e)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_port() {
        let mapping = PortMapping::parse("8080").unwrap();
        assert_eq!(mapping.expand().collect::<Vec<_>>(), vec![(8080, 8080)]);
    }

    #[test]
    fn single_port_with_remap() {
        let mapping = PortMapping::parse("8080=22").unwrap();
        assert_eq!(mapping.expand().collect::<Vec<_>>(), vec![(8080, 22)]);
    }

    #[test]
    fn bare_range_forwards_same_ports() {
        let mapping = PortMapping::parse("9000:9002").unwrap();
        assert_eq!(
            mapping.expand().collect::<Vec<_>>(),
            vec![(9000, 9000), (9001, 9001), (9002, 9002)]
        );
    }

    #[test]
    fn bracketed_range_with_remap() {
        let mapping = PortMapping::parse("[9000:9002]=22").unwrap();
        assert_eq!(
            mapping.expand().collect::<Vec<_>>(),
            vec![(9000, 22), (9001, 22), (9002, 22)]
        );
    }

    #[test]
    fn eleven_listeners_all_pinned() {
        let mapping = PortMapping::parse("[100:110]=80").unwrap();
        let listeners: Vec<_> = mapping.expand().collect();
        assert_eq!(listeners.len(), 11);
        assert!(listeners.iter().all(|&(_, remote)| remote == 80));
    }

    #[test]
    fn display_round_trips() {
        for entry in ["8080", "8080=22", "[9000:9002]", "[100:110]=80"] {
            let mapping = PortMapping::parse(entry).unwrap();
            assert_eq!(PortMapping::parse(&mapping.to_string()), Ok(mapping));
        }
    }

    #[test]
    fn inverted_range_is_fatal() {
        assert!(matches!(
            PortMapping::parse("[9002:9000]"),
            Err(PortMapError::InvalidRange { .. })
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        for entry in ["", "abc", "8080-22", "[8080]", "70000", "1:2:3"] {
            assert!(PortMapping::parse(entry).is_err(), "accepted {entry:?}");
        }
    }

    #[test]
    fn set_parse_stops_on_first_error() {
        let entries = vec!["8080".to_string(), "bogus".to_string()];
        assert!(parse_mappings(&entries).is_err());
    }
}
