//! Rtnetlink Client
//!
//! A small, stateful rtnetlink connection used to program traffic-control
//! objects: root qdiscs, htb classes, and the cgroup filter that binds a
//! net_cls classid to a class. Messages are built by hand; the kernel ABI
//! structures involved (`nlmsghdr`, `tcmsg`, `rtattr`, the tc_htb blobs)
//! are fixed-layout and packed here as byte runs.
//!
//! All mutations go through one connected socket, serialised by the
//! caller; every request asks for an ACK and failures surface the kernel
//! errno.

use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::AsRawFd;

use log::trace;

use crate::error::{Error, ErrorKind};

// ============================================================================
// Kernel Constants
// ============================================================================

pub const RTM_NEWQDISC: u16 = 36;
pub const RTM_DELQDISC: u16 = 37;
pub const RTM_NEWTCLASS: u16 = 40;
pub const RTM_DELTCLASS: u16 = 41;
pub const RTM_NEWTFILTER: u16 = 44;
pub const RTM_GETTCLASS: u16 = 42;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_NEWLINK: u16 = 16;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_DUMP: u16 = 0x300;
pub const NLM_F_MULTI: u16 = 0x02;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const TCA_KIND: u16 = 1;
pub const TCA_OPTIONS: u16 = 2;

pub const TCA_HTB_PARMS: u16 = 1;
pub const TCA_HTB_INIT: u16 = 2;
pub const TCA_HTB_RTAB: u16 = 3;
pub const TCA_HTB_CTAB: u16 = 4;

pub const TCA_STATS: u16 = 3;

pub const TC_H_ROOT: u32 = 0xFFFF_FFFF;

pub const IFLA_IFNAME: u16 = 3;

const NLMSG_HDRLEN: usize = 16;
const TCMSG_LEN: usize = 20;
const IFINFOMSG_LEN: usize = 16;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// A `major:minor` traffic-control handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcHandle {
    pub major: u16,
    pub minor: u16,
}

impl TcHandle {
    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn raw(self) -> u32 {
        ((self.major as u32) << 16) | self.minor as u32
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            major: (raw >> 16) as u16,
            minor: (raw & 0xFFFF) as u16,
        }
    }
}

impl std::fmt::Display for TcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}:{:x}", self.major, self.minor)
    }
}

// ============================================================================
// Message Builder
// ============================================================================

/// Byte-level builder for one netlink request.
#[derive(Debug)]
pub struct NlRequest {
    buf: Vec<u8>,
}

impl NlRequest {
    /// Start a request; the final length is patched in by [`finish`](Self::finish).
    pub fn new(msg_type: u16, flags: u16, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len, patched later
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&(flags | NLM_F_REQUEST).to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid: kernel fills
        Self { buf }
    }

    /// Append a `tcmsg` body: family, ifindex, handle, parent.
    pub fn tcmsg(mut self, ifindex: i32, handle: u32, parent: u32) -> Self {
        self.buf.push(libc::AF_UNSPEC as u8);
        self.buf.extend_from_slice(&[0u8; 3]); // padding
        self.buf.extend_from_slice(&ifindex.to_ne_bytes());
        self.buf.extend_from_slice(&handle.to_ne_bytes());
        self.buf.extend_from_slice(&parent.to_ne_bytes());
        self.buf.extend_from_slice(&0u32.to_ne_bytes()); // tcm_info
        self
    }

    /// Append an `ifinfomsg` body (link requests).
    pub fn ifinfomsg(mut self) -> Self {
        self.buf.push(libc::AF_UNSPEC as u8);
        self.buf.extend_from_slice(&[0u8; 3]);
        self.buf.extend_from_slice(&0u16.to_ne_bytes()); // ifi_type
        self.buf.extend_from_slice(&[0u8; 2]);
        self.buf.extend_from_slice(&0i32.to_ne_bytes()); // ifi_index
        self.buf.extend_from_slice(&0u32.to_ne_bytes()); // ifi_flags
        self.buf.extend_from_slice(&0u32.to_ne_bytes()); // ifi_change
        self
    }

    /// Append a flat attribute.
    pub fn attr(mut self, kind: u16, payload: &[u8]) -> Self {
        let len = 4 + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align4(self.buf.len()), 0);
        self
    }

    /// Append a NUL-terminated string attribute (`TCA_KIND` etc).
    pub fn attr_str(self, kind: u16, s: &str) -> Self {
        let mut payload = s.as_bytes().to_vec();
        payload.push(0);
        self.attr(kind, &payload)
    }

    /// Append a nested attribute built by `f`.
    pub fn nested(mut self, kind: u16, f: impl FnOnce(NlRequest) -> NlRequest) -> Self {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes()); // length, patched
        self.buf.extend_from_slice(&kind.to_ne_bytes());

        self = f(self);

        let nested_len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&nested_len.to_ne_bytes());
        self.buf.resize(align4(self.buf.len()), 0);
        self
    }

    /// Patch the total length and return the wire bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let total = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&total.to_ne_bytes());
        self.buf
    }
}

// ============================================================================
// Socket
// ============================================================================

/// A connected NETLINK_ROUTE socket.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkSocket {
    pub fn connect() -> Result<NetlinkSocket, Error> {
        // SAFETY: plain socket(2) call; the fd is checked below.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: raw is a live fd owned exclusively since the call above.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        // SAFETY: addr is a properly initialised sockaddr_nl with matching size.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(NetlinkSocket { fd, seq: 1 })
    }

    pub fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&self, msg: &[u8]) -> Result<(), Error> {
        // SAFETY: msg points at msg.len() valid bytes for the duration of the call.
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        // SAFETY: buf is writable for buf.len() bytes for the duration of the call.
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(n as usize)
    }

    /// Send one request and wait for its ACK.
    pub fn execute(&mut self, request: Vec<u8>) -> Result<(), Error> {
        self.send(&request)?;

        let mut buf = [0u8; 4096];
        let n = self.recv(&mut buf)?;

        let mut offset = 0usize;
        while offset + NLMSG_HDRLEN <= n {
            let len = u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            let msg_type =
                u16::from_ne_bytes(buf[offset + 4..offset + 6].try_into().unwrap());

            if msg_type == NLMSG_ERROR {
                let errno = i32::from_ne_bytes(
                    buf[offset + NLMSG_HDRLEN..offset + NLMSG_HDRLEN + 4]
                        .try_into()
                        .unwrap(),
                );
                if errno == 0 {
                    return Ok(());
                }
                trace!("netlink error {}", errno);
                return Err(Error::with_errno(
                    ErrorKind::Unknown,
                    -errno,
                    format!("netlink request failed: errno {}", -errno),
                ));
            }

            if len == 0 {
                break;
            }
            offset += align4(len);
        }

        Ok(())
    }

    /// Dump classes on one link and return the stats of `handle`.
    pub fn class_stats(
        &mut self,
        ifindex: i32,
        handle: u32,
    ) -> Result<Option<ClassStats>, Error> {
        let seq = self.next_seq();
        let request = NlRequest::new(RTM_GETTCLASS, NLM_F_DUMP, seq)
            .tcmsg(ifindex, 0, 0)
            .finish();
        self.send(&request)?;

        let mut found = None;
        let mut buf = vec![0u8; 1 << 16];

        'outer: loop {
            let n = self.recv(&mut buf)?;
            let mut offset = 0usize;

            while offset + NLMSG_HDRLEN <= n {
                let len =
                    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
                let msg_type =
                    u16::from_ne_bytes(buf[offset + 4..offset + 6].try_into().unwrap());
                let flags =
                    u16::from_ne_bytes(buf[offset + 6..offset + 8].try_into().unwrap());

                match msg_type {
                    NLMSG_DONE => break 'outer,
                    NLMSG_ERROR => {
                        return Err(Error::new(ErrorKind::Unknown, "class dump failed"))
                    }
                    RTM_NEWTCLASS => {
                        let body = &buf[offset + NLMSG_HDRLEN..offset + len];
                        if let Some(stats) = parse_class_stats(body, handle) {
                            found = Some(stats);
                        }
                    }
                    _ => {}
                }

                if len == 0 {
                    break;
                }
                offset += align4(len);

                if flags & NLM_F_MULTI == 0 && msg_type == RTM_NEWTCLASS {
                    break 'outer;
                }
            }
        }

        Ok(found)
    }

    /// Dump all links: (ifindex, name).
    pub fn links(&mut self) -> Result<Vec<(i32, String)>, Error> {
        let seq = self.next_seq();
        let request = NlRequest::new(RTM_GETLINK, NLM_F_DUMP, seq)
            .ifinfomsg()
            .finish();
        self.send(&request)?;

        let mut links = Vec::new();
        let mut buf = vec![0u8; 1 << 16];

        'outer: loop {
            let n = self.recv(&mut buf)?;
            let mut offset = 0usize;

            while offset + NLMSG_HDRLEN <= n {
                let len =
                    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
                let msg_type =
                    u16::from_ne_bytes(buf[offset + 4..offset + 6].try_into().unwrap());
                let flags =
                    u16::from_ne_bytes(buf[offset + 6..offset + 8].try_into().unwrap());

                match msg_type {
                    NLMSG_DONE => break 'outer,
                    NLMSG_ERROR => {
                        return Err(Error::new(ErrorKind::Unknown, "link dump failed"))
                    }
                    RTM_NEWLINK => {
                        let body = &buf[offset + NLMSG_HDRLEN..offset + len];
                        if let Some(link) = parse_link(body) {
                            links.push(link);
                        }
                    }
                    _ => {}
                }

                if len == 0 {
                    break;
                }
                offset += align4(len);

                // A non-multipart reply will not send NLMSG_DONE.
                if flags & NLM_F_MULTI == 0 && msg_type == RTM_NEWLINK {
                    break 'outer;
                }
            }
        }

        Ok(links)
    }
}

/// Byte counters of one htb class, from `struct tc_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub bytes: u64,
    pub packets: u32,
    pub drops: u32,
    pub overlimits: u32,
}

fn parse_class_stats(body: &[u8], handle: u32) -> Option<ClassStats> {
    if body.len() < TCMSG_LEN {
        return None;
    }
    let msg_handle = u32::from_ne_bytes(body[8..12].try_into().ok()?);
    if msg_handle != handle {
        return None;
    }

    let mut offset = TCMSG_LEN;
    while offset + 4 <= body.len() {
        let attr_len = u16::from_ne_bytes(body[offset..offset + 2].try_into().ok()?) as usize;
        let attr_type = u16::from_ne_bytes(body[offset + 2..offset + 4].try_into().ok()?);
        if attr_len < 4 || offset + attr_len > body.len() {
            break;
        }
        if attr_type == TCA_STATS && attr_len >= 4 + 20 {
            let payload = &body[offset + 4..offset + attr_len];
            return Some(ClassStats {
                bytes: u64::from_ne_bytes(payload[0..8].try_into().ok()?),
                packets: u32::from_ne_bytes(payload[8..12].try_into().ok()?),
                drops: u32::from_ne_bytes(payload[12..16].try_into().ok()?),
                overlimits: u32::from_ne_bytes(payload[16..20].try_into().ok()?),
            });
        }
        offset += align4(attr_len);
    }
    // The class exists but carries no stats attribute.
    Some(ClassStats::default())
}

fn parse_link(body: &[u8]) -> Option<(i32, String)> {
    if body.len() < IFINFOMSG_LEN {
        return None;
    }
    let ifindex = i32::from_ne_bytes(body[4..8].try_into().ok()?);

    let mut offset = IFINFOMSG_LEN;
    while offset + 4 <= body.len() {
        let attr_len = u16::from_ne_bytes(body[offset..offset + 2].try_into().ok()?) as usize;
        let attr_type = u16::from_ne_bytes(body[offset + 2..offset + 4].try_into().ok()?);
        if attr_len < 4 || offset + attr_len > body.len() {
            break;
        }
        if attr_type == IFLA_IFNAME {
            let raw = &body[offset + 4..offset + attr_len];
            let name = raw.split(|b| *b == 0).next()?;
            return Some((ifindex, String::from_utf8_lossy(name).to_string()));
        }
        offset += align4(attr_len);
    }
    None
}

// ============================================================================
// Htb Parameter Blobs
// ============================================================================

/// `tc_ratespec` + rate table, as libnl computes them: bytes-per-cell
/// lookup for 256 packet sizes with an 8-byte cell log.
pub fn ratespec(rate_bps: u64) -> [u8; 12] {
    let rate = rate_bps.min(u32::MAX as u64) as u32;
    let mut spec = [0u8; 12];
    spec[0] = 3; // cell_log: 8-byte cells
    spec[1] = 0; // linklayer: unspec
    // overhead, cell_align, mpu all zero
    spec[8..12].copy_from_slice(&rate.to_ne_bytes());
    spec
}

/// The 256-entry transmission-time table paired with a ratespec.
pub fn rate_table(rate_bps: u64) -> Vec<u8> {
    let rate = rate_bps.max(8);
    let mut table = Vec::with_capacity(256 * 4);
    for i in 0..256u64 {
        let size = (i + 1) << 3; // cell_log 3
        // Time to transmit `size` bytes, in ticks (usec granularity).
        let usec = size.saturating_mul(1_000_000) / rate;
        table.extend_from_slice(&(usec.min(u32::MAX as u64) as u32).to_ne_bytes());
    }
    table
}

/// `tc_htb_opt`: two ratespecs, two buffers, quantum, level, prio.
pub fn htb_opt(rate_bps: u64, ceil_bps: u64, prio: u32) -> Vec<u8> {
    let mut opt = Vec::with_capacity(44);
    opt.extend_from_slice(&ratespec(rate_bps));
    opt.extend_from_slice(&ratespec(ceil_bps));
    // buffer and cbuffer: 10ms worth of traffic, min one packet
    let buffer = |bps: u64| ((bps / 100).max(1600).min(u32::MAX as u64)) as u32;
    opt.extend_from_slice(&buffer(rate_bps).to_ne_bytes());
    opt.extend_from_slice(&buffer(ceil_bps).to_ne_bytes());
    opt.extend_from_slice(&0u32.to_ne_bytes()); // quantum: kernel default
    opt.extend_from_slice(&0u32.to_ne_bytes()); // level
    opt.extend_from_slice(&prio.to_ne_bytes());
    opt
}

/// `tc_htb_glob` for qdisc creation.
pub fn htb_glob(default_class: u32) -> Vec<u8> {
    let mut glob = Vec::with_capacity(20);
    glob.extend_from_slice(&3u32.to_ne_bytes()); // version
    glob.extend_from_slice(&0u32.to_ne_bytes()); // rate2quantum
    glob.extend_from_slice(&default_class.to_ne_bytes());
    glob.extend_from_slice(&0u32.to_ne_bytes()); // debug
    glob.extend_from_slice(&0u32.to_ne_bytes()); // direct_pkts
    glob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tc_handle() {
        let handle = TcHandle::new(1, 0x42);
        assert_eq!(handle.raw(), 0x0001_0042);
        assert_eq!(TcHandle::from_raw(handle.raw()), handle);
        assert_eq!(handle.to_string(), "1:42");
    }

    #[test]
    fn test_request_layout() {
        let msg = NlRequest::new(RTM_NEWTCLASS, NLM_F_CREATE | NLM_F_ACK, 7)
            .tcmsg(2, 0x0001_0005, 0x0001_0000)
            .attr_str(TCA_KIND, "htb")
            .finish();

        // Patched total length matches the buffer.
        let total = u32::from_ne_bytes(msg[0..4].try_into().unwrap()) as usize;
        assert_eq!(total, msg.len());

        // Header fields land where the kernel expects them.
        assert_eq!(u16::from_ne_bytes(msg[4..6].try_into().unwrap()), RTM_NEWTCLASS);
        let flags = u16::from_ne_bytes(msg[6..8].try_into().unwrap());
        assert_ne!(flags & NLM_F_REQUEST, 0);
        assert_ne!(flags & NLM_F_ACK, 0);
        assert_eq!(u32::from_ne_bytes(msg[8..12].try_into().unwrap()), 7);

        // tcmsg: ifindex at +4, handle at +8, parent at +12 of the body.
        let body = &msg[NLMSG_HDRLEN..];
        assert_eq!(i32::from_ne_bytes(body[4..8].try_into().unwrap()), 2);
        assert_eq!(
            u32::from_ne_bytes(body[8..12].try_into().unwrap()),
            0x0001_0005
        );

        // TCA_KIND attribute holds the NUL-terminated string.
        let attrs = &msg[NLMSG_HDRLEN + TCMSG_LEN..];
        let attr_len = u16::from_ne_bytes(attrs[0..2].try_into().unwrap()) as usize;
        assert_eq!(attr_len, 4 + 4); // "htb\0"
        assert_eq!(u16::from_ne_bytes(attrs[2..4].try_into().unwrap()), TCA_KIND);
        assert_eq!(&attrs[4..8], b"htb\0");
    }

    #[test]
    fn test_nested_attr_is_patched_and_aligned() {
        let msg = NlRequest::new(RTM_NEWQDISC, NLM_F_CREATE, 1)
            .tcmsg(1, 0, TC_H_ROOT)
            .nested(TCA_OPTIONS, |req| req.attr(TCA_HTB_INIT, &htb_glob(0)))
            .finish();

        assert_eq!(msg.len() % 4, 0);
        let nest = &msg[NLMSG_HDRLEN + TCMSG_LEN..];
        let nest_len = u16::from_ne_bytes(nest[0..2].try_into().unwrap()) as usize;
        assert_eq!(u16::from_ne_bytes(nest[2..4].try_into().unwrap()), TCA_OPTIONS);
        // 4 nest header + 4 attr header + 20 glob payload
        assert_eq!(nest_len, 28);
    }

    #[test]
    fn test_htb_opt_layout() {
        let opt = htb_opt(1_000_000, 2_000_000, 3);
        assert_eq!(opt.len(), 44);
        // rate at +8 of the first ratespec, ceil at +8 of the second
        assert_eq!(
            u32::from_ne_bytes(opt[8..12].try_into().unwrap()),
            1_000_000
        );
        assert_eq!(
            u32::from_ne_bytes(opt[20..24].try_into().unwrap()),
            2_000_000
        );
        assert_eq!(
            u32::from_ne_bytes(opt[40..44].try_into().unwrap()),
            3
        );
    }

    #[test]
    fn test_rate_table_shape() {
        let table = rate_table(1_000_000);
        assert_eq!(table.len(), 1024);
        // Larger packets take longer to send.
        let first = u32::from_ne_bytes(table[0..4].try_into().unwrap());
        let last = u32::from_ne_bytes(table[1020..1024].try_into().unwrap());
        assert!(last > first);
    }
}
