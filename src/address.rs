use std::collections::BTreeMap;
use std::str::FromStr;

use crate::{Error, Guid, Result};

/// `sun_path` length limit; longer unix socket paths cannot be represented.
const UNIX_PATH_MAX: usize = 108;

/// Highest `argvN` index accepted for `unixexec` addresses.
const EXEC_ARGV_MAX: usize = 256;

/// A single parsed D-Bus transport descriptor.
///
/// A D-Bus address string is a `;`-separated list of descriptors of the form
/// `type:key1=value1,key2=value2`, each describing one way to reach a bus.
/// [`Address::parse`] returns the list in order; callers try each entry until
/// one connects.
#[derive(Clone, Debug, PartialEq)]
pub struct Address {
    transport: Transport,
    guid: Option<Guid>,
}

/// The transport variant of a parsed [`Address`].
#[derive(Clone, Debug, PartialEq)]
pub enum Transport {
    /// Unix domain socket, filesystem path.
    Unix { path: String },
    /// Unix domain socket in the abstract namespace (no filesystem entry).
    UnixAbstract { name: String },
    /// Plain TCP.
    Tcp {
        host: String,
        port: u16,
        family: Option<TcpFamily>,
    },
    /// Spawn a command and speak D-Bus over its stdin/stdout.
    Exec { path: String, argv: Vec<String> },
    /// Kernel datagram transport, addressed by its device node.
    Kernel { path: String },
    /// The system bus inside a local container.
    Container { machine: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpFamily {
    Ipv4,
    Ipv6,
}

impl Address {
    /// Parse a D-Bus address string into its list of transport descriptors.
    ///
    /// Descriptors of unknown type are skipped, as are unknown keys inside a
    /// known type, per the D-Bus specification. Malformed descriptors of a
    /// known type are an error.
    pub fn parse(address: &str) -> Result<Vec<Address>> {
        let mut addresses = vec![];

        for entry in address.split(';') {
            if entry.is_empty() {
                continue;
            }
            if let Some(addr) = Self::parse_one(entry)? {
                addresses.push(addr);
            }
        }

        Ok(addresses)
    }

    /// The transport this address describes.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The expected server GUID, when the address pins one.
    pub fn guid(&self) -> Option<&Guid> {
        self.guid.as_ref()
    }

    fn parse_one(entry: &str) -> Result<Option<Address>> {
        let colon = match entry.find(':') {
            Some(i) => i,
            None => return Err(Error::Address(format!("missing transport type: {}", entry))),
        };
        let kind = &entry[..colon];
        let mut pairs = BTreeMap::new();

        for kv in entry[colon + 1..].split(',') {
            if kv.is_empty() {
                continue;
            }
            let eq = match kv.find('=') {
                Some(i) => i,
                None => return Err(Error::Address(format!("missing '=' in: {}", kv))),
            };
            pairs.insert(&kv[..eq], unescape(&kv[eq + 1..])?);
        }

        let guid = match pairs.get("guid") {
            Some(g) => Some(Guid::from_str(g)?),
            None => None,
        };

        let transport = match kind {
            "unix" => Some(Self::parse_unix(&pairs)?),
            "tcp" => Some(Self::parse_tcp(&pairs)?),
            "unixexec" => Some(Self::parse_exec(&pairs)?),
            "kernel" => Some(Transport::Kernel {
                path: required(&pairs, "kernel", "path")?,
            }),
            "x-container" => Some(Transport::Container {
                machine: required(&pairs, "x-container", "machine")?,
            }),
            // Unknown transport types are skipped, not rejected.
            _ => None,
        };

        Ok(transport.map(|transport| Address { transport, guid }))
    }

    fn parse_unix(pairs: &BTreeMap<&str, String>) -> Result<Transport> {
        match (pairs.get("path"), pairs.get("abstract")) {
            (Some(_), Some(_)) => Err(Error::Address(
                "unix: cannot have both path= and abstract=".into(),
            )),
            (Some(path), None) => {
                if path.len() >= UNIX_PATH_MAX {
                    return Err(Error::Address(format!("unix path too long: {}", path)));
                }
                Ok(Transport::Unix { path: path.clone() })
            }
            (None, Some(name)) => {
                // The leading NUL of the abstract namespace counts too.
                if name.len() >= UNIX_PATH_MAX - 1 {
                    return Err(Error::Address(format!("abstract name too long: {}", name)));
                }
                Ok(Transport::UnixAbstract { name: name.clone() })
            }
            (None, None) => Err(Error::Address(
                "unix: requires path= or abstract=".into(),
            )),
        }
    }

    fn parse_tcp(pairs: &BTreeMap<&str, String>) -> Result<Transport> {
        let host = required(pairs, "tcp", "host")?;
        let port = required(pairs, "tcp", "port")?
            .parse::<u16>()
            .map_err(|_| Error::Address("tcp: invalid port".into()))?;
        let family = match pairs.get("family").map(|s| s.as_str()) {
            None => None,
            Some("ipv4") => Some(TcpFamily::Ipv4),
            Some("ipv6") => Some(TcpFamily::Ipv6),
            Some(f) => return Err(Error::Address(format!("tcp: unknown family: {}", f))),
        };

        Ok(Transport::Tcp { host, port, family })
    }

    fn parse_exec(pairs: &BTreeMap<&str, String>) -> Result<Transport> {
        let path = required(pairs, "unixexec", "path")?;

        let mut argv_map = BTreeMap::new();
        for (key, value) in pairs.iter() {
            if let Some(n) = key.strip_prefix("argv") {
                let n = n
                    .parse::<usize>()
                    .map_err(|_| Error::Address(format!("unixexec: bad key: {}", key)))?;
                if n > EXEC_ARGV_MAX {
                    return Err(Error::Address(format!("unixexec: argv{} out of range", n)));
                }
                argv_map.insert(n, value.clone());
            }
        }

        // argv0 defaults to the binary path; all later indices must be
        // contiguous.
        let argc = argv_map.keys().next_back().map(|n| n + 1).unwrap_or(1);
        let mut argv = Vec::with_capacity(argc);
        for n in 0..argc {
            match argv_map.remove(&n) {
                Some(arg) => argv.push(arg),
                None if n == 0 => argv.push(path.clone()),
                None => {
                    return Err(Error::Address(format!(
                        "unixexec: gap in argv at index {}",
                        n
                    )))
                }
            }
        }

        Ok(Transport::Exec { path, argv })
    }
}

fn required(pairs: &BTreeMap<&str, String>, kind: &str, key: &str) -> Result<String> {
    pairs
        .get(key)
        .cloned()
        .ok_or_else(|| Error::Address(format!("{}: requires {}=", kind, key)))
}

/// Undo the `%HH` escaping D-Bus address values use.
fn unescape(value: &str) -> Result<String> {
    if !value.contains('%') {
        return Ok(value.to_string());
    }

    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();
    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }
        let hi = bytes.next().and_then(hex_val);
        let lo = bytes.next().and_then(hex_val);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
            _ => return Err(Error::Address(format!("malformed escape in: {}", value))),
        }
    }

    String::from_utf8(out).map_err(|_| Error::Address(format!("escape is not UTF-8: {}", value)))
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{Address, TcpFamily, Transport};

    #[test]
    fn unix_then_tcp() {
        let list =
            Address::parse("unix:path=/run/dbus/system_bus_socket;tcp:host=h,port=1").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(
            *list[0].transport(),
            Transport::Unix {
                path: "/run/dbus/system_bus_socket".to_string()
            }
        );
        assert_eq!(
            *list[1].transport(),
            Transport::Tcp {
                host: "h".to_string(),
                port: 1,
                family: None,
            }
        );
    }

    #[test]
    fn percent_decoding() {
        let list = Address::parse("x-container:machine=foo%2Fbar").unwrap();
        assert_eq!(
            *list[0].transport(),
            Transport::Container {
                machine: "foo/bar".to_string()
            }
        );
    }

    #[test]
    fn malformed_escape() {
        assert!(Address::parse("unix:path=%2").is_err());
        assert!(Address::parse("unix:path=%zz").is_err());
    }

    #[test]
    fn unknown_type_skipped() {
        let list = Address::parse("launchd:env=FOO;unix:abstract=/tmp/bus").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(
            *list[0].transport(),
            Transport::UnixAbstract {
                name: "/tmp/bus".to_string()
            }
        );
    }

    #[test]
    fn unknown_key_skipped() {
        let list = Address::parse("unix:path=/tmp/bus,frobnicate=1").unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn unix_exclusive_keys() {
        assert!(Address::parse("unix:path=/a,abstract=/b").is_err());
        assert!(Address::parse("unix:guid=a2a9b8c7d6e5f40312a9b8c7d6e5f403").is_err());
    }

    #[test]
    fn unix_path_limit() {
        let long = "x".repeat(200);
        assert!(Address::parse(&format!("unix:path=/{}", long)).is_err());
    }

    #[test]
    fn tcp_family() {
        let list = Address::parse("tcp:host=localhost,port=4444,family=ipv4").unwrap();
        match list[0].transport() {
            Transport::Tcp { family, .. } => assert_eq!(*family, Some(TcpFamily::Ipv4)),
            other => panic!("unexpected transport: {:?}", other),
        }
        assert!(Address::parse("tcp:host=h,port=70000").is_err());
        assert!(Address::parse("tcp:host=h,port=1,family=ipx").is_err());
    }

    #[test]
    fn exec_argv() {
        let list =
            Address::parse("unixexec:path=/bin/nc,argv1=-U,argv2=%2Ftmp%2Fbus").unwrap();
        match list[0].transport() {
            Transport::Exec { path, argv } => {
                assert_eq!(path, "/bin/nc");
                assert_eq!(argv, &["/bin/nc", "-U", "/tmp/bus"]);
            }
            other => panic!("unexpected transport: {:?}", other),
        }
    }

    #[test]
    fn exec_argv_gap() {
        assert!(Address::parse("unixexec:path=/bin/nc,argv2=oops").is_err());
    }

    #[test]
    fn guid_retained() {
        let list =
            Address::parse("unix:path=/tmp/bus,guid=a2a9b8c7d6e5f40312a9b8c7d6e5f403").unwrap();
        assert!(list[0].guid().is_some());
    }
}
