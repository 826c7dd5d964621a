//! Resource Limits
//!
//! Parses the `ulimit` property and applies it in the forked task before
//! exec. The property is a map-like list such as
//! `"nofile: 1024 2048; core: unlim unlim"`: per entry a soft and a hard
//! value, with `unlim`/`unlimited` for RLIM_INFINITY.

use nix::sys::resource::{setrlimit, Resource};

use crate::error::Error;
use crate::value::split_escaped;

/// One parsed rlimit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

fn resource_by_name(name: &str) -> Option<Resource> {
    let resource = match name {
        "as" => Resource::RLIMIT_AS,
        "core" => Resource::RLIMIT_CORE,
        "cpu" => Resource::RLIMIT_CPU,
        "data" => Resource::RLIMIT_DATA,
        "fsize" => Resource::RLIMIT_FSIZE,
        "locks" => Resource::RLIMIT_LOCKS,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        "msgqueue" => Resource::RLIMIT_MSGQUEUE,
        "nice" => Resource::RLIMIT_NICE,
        "nofile" => Resource::RLIMIT_NOFILE,
        "nproc" => Resource::RLIMIT_NPROC,
        "rss" => Resource::RLIMIT_RSS,
        "rtprio" => Resource::RLIMIT_RTPRIO,
        "sigpending" => Resource::RLIMIT_SIGPENDING,
        "stack" => Resource::RLIMIT_STACK,
        _ => return None,
    };
    Some(resource)
}

fn parse_limit_value(s: &str) -> Result<u64, Error> {
    match s {
        "unlim" | "unlimited" => Ok(libc::RLIM_INFINITY),
        _ => s
            .parse::<u64>()
            .map_err(|_| Error::invalid_value(format!("invalid rlimit value {}", s))),
    }
}

/// Parse the whole `ulimit` property string.
pub fn parse_ulimit(s: &str) -> Result<Vec<Rlimit>, Error> {
    let mut limits = Vec::new();

    for entry in split_escaped(s, ';') {
        let (name, values) = entry
            .split_once(':')
            .ok_or_else(|| Error::invalid_value(format!("invalid ulimit entry {}", entry)))?;

        let resource = resource_by_name(name.trim())
            .ok_or_else(|| Error::invalid_value(format!("unknown ulimit {}", name.trim())))?;

        let fields: Vec<&str> = values.split_whitespace().collect();
        let (soft, hard) = match fields.as_slice() {
            [soft, hard] => (parse_limit_value(soft)?, parse_limit_value(hard)?),
            [both] => {
                let v = parse_limit_value(both)?;
                (v, v)
            }
            _ => {
                return Err(Error::invalid_value(format!(
                    "invalid ulimit entry {}",
                    entry
                )))
            }
        };

        if hard != libc::RLIM_INFINITY && soft > hard {
            return Err(Error::invalid_value(format!(
                "ulimit {} soft above hard",
                name.trim()
            )));
        }

        limits.push(Rlimit {
            resource,
            soft,
            hard,
        });
    }

    Ok(limits)
}

/// Apply limits to the calling process. Task-side only.
pub fn apply_ulimits(limits: &[Rlimit]) -> Result<(), Error> {
    for limit in limits {
        setrlimit(limit.resource, limit.soft, limit.hard)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        let limits = parse_ulimit("nofile: 1024 2048").unwrap();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].resource, Resource::RLIMIT_NOFILE);
        assert_eq!(limits[0].soft, 1024);
        assert_eq!(limits[0].hard, 2048);
    }

    #[test]
    fn test_parse_single_value_and_unlim() {
        let limits = parse_ulimit("core: unlim; nproc: 500").unwrap();
        assert_eq!(limits[0].soft, libc::RLIM_INFINITY);
        assert_eq!(limits[0].hard, libc::RLIM_INFINITY);
        assert_eq!(limits[1].soft, 500);
        assert_eq!(limits[1].hard, 500);
    }

    #[test]
    fn test_parse_rejects() {
        assert!(parse_ulimit("bogus: 1 2").is_err());
        assert!(parse_ulimit("nofile 1 2").is_err());
        assert!(parse_ulimit("nofile: x y").is_err());
        assert!(parse_ulimit("nofile: 1 2 3").is_err());
        assert!(parse_ulimit("nofile: 10 5").is_err());
    }

    #[test]
    fn test_empty_is_empty() {
        assert!(parse_ulimit("").unwrap().is_empty());
    }
}
