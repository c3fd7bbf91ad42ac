//! Wire codec for accounting queries and their attribute-stream replies.
//!
//! A message is `nlmsghdr` + `genlmsghdr` + a 4-byte-aligned sequence of
//! (length, type, value) attributes, nested at most one level for the
//! aggregate reply. The decoder validates the outer framing once, then walks
//! attributes tolerantly: unknown types are skipped so newer kernels that
//! append fields keep working, while inconsistent lengths surface as
//! [`CodecError::BadAttribute`] rather than a crash.

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::taskstats::{read_i32, read_u16, read_u32, Sample, StatsError, TargetKind, Taskstats};

// netlink framing
const NLMSG_HDRLEN: usize = 16;
const GENL_HDRLEN: usize = 4;
const NLA_HDRLEN: usize = 4;
const NLA_ALIGNTO: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

const NLM_F_REQUEST: u16 = 1;
const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

// generic-netlink controller
const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_VERSION: u8 = 1;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

// taskstats family (linux/taskstats.h)
/// Name the accounting family registers under.
pub const TASKSTATS_GENL_NAME: &str = "TASKSTATS";
const TASKSTATS_GENL_VERSION: u8 = 1;
const TASKSTATS_CMD_GET: u8 = 1;
const TASKSTATS_CMD_ATTR_PID: u16 = 1;
const TASKSTATS_CMD_ATTR_TGID: u16 = 2;
const TASKSTATS_TYPE_PID: u16 = 1;
const TASKSTATS_TYPE_TGID: u16 = 2;
const TASKSTATS_TYPE_STATS: u16 = 3;
const TASKSTATS_TYPE_AGGR_PID: u16 = 4;
const TASKSTATS_TYPE_AGGR_TGID: u16 = 5;

/// Errors decoding a netlink response.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("response too short: {size} bytes")]
    Truncated { size: usize },

    #[error("declared message length {declared} exceeds received {actual} bytes")]
    LengthOverrun { declared: usize, actual: usize },

    #[error("attribute framing inconsistent at offset {offset}")]
    BadAttribute { offset: usize },

    #[error("attribute type {atype} has unexpected length {len}")]
    BadLength { atype: u16, len: usize },

    #[error("aggregate reply carries no accounting record")]
    MissingStats,

    #[error(transparent)]
    Stats(#[from] StatsError),

    #[error("kernel reported error: {0}")]
    Kernel(std::io::Error),

    #[error("controller reply carries no family id")]
    FamilyMissing,
}

/// Builds accounting queries and decodes their replies.
///
/// Holds the resolved family id and assigns sequence numbers monotonically.
/// Sequence numbers are not checked on the response path: each worker's
/// socket only ever carries that worker's own exchange, so demultiplexing is
/// by command/family rather than sequence correlation.
pub struct QueryCodec {
    family_id: u16,
    portid: u32,
    seq: AtomicU32,
}

impl QueryCodec {
    /// Create a codec addressing the given accounting family id.
    pub fn new(family_id: u16) -> Self {
        Self {
            family_id,
            portid: std::process::id(),
            seq: AtomicU32::new(1),
        }
    }

    /// The resolved accounting family id this codec addresses.
    pub fn family_id(&self) -> u16 {
        self.family_id
    }

    /// Build a request for the accounting record of `id`, addressed by
    /// process id or thread-group id.
    pub fn encode_query(&self, kind: TargetKind, id: u32) -> Vec<u8> {
        let attr_type = match kind {
            TargetKind::Pid => TASKSTATS_CMD_ATTR_PID,
            TargetKind::Tgid => TASKSTATS_CMD_ATTR_TGID,
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        encode_message(
            self.family_id,
            seq,
            self.portid,
            TASKSTATS_CMD_GET,
            TASKSTATS_GENL_VERSION,
            &[(attr_type, &id.to_ne_bytes())],
        )
    }

    /// Decode one reply message.
    ///
    /// `Ok(Some(sample))` for a reply carrying an aggregate accounting
    /// record; `Ok(None)` for a well-formed reply without identifying fields
    /// (the kernel has no data for the target); `Err` for framing the caller
    /// should log and discard. Total over arbitrary input: never panics.
    pub fn decode_response(&self, data: &[u8]) -> Result<Option<Sample>, CodecError> {
        let Some(attrs) = genl_attr_stream(data)? else {
            return Ok(None);
        };

        let mut pid = 0u32;
        let mut tgid = 0u32;
        let mut stats = None;

        for attr in AttrIter::new(attrs) {
            let attr = attr?;
            match attr.atype {
                TASKSTATS_TYPE_AGGR_PID | TASKSTATS_TYPE_AGGR_TGID => {
                    parse_aggregate(attr.payload, &mut pid, &mut tgid, &mut stats)?;
                }
                // Unrecognized top-level attributes from newer kernels.
                _ => {}
            }
        }

        if pid == 0 && tgid == 0 {
            return Ok(None);
        }

        let stats = stats.ok_or(CodecError::MissingStats)?;

        Ok(Some(Sample {
            pid,
            tgid,
            captured_at_ns: crate::taskstats::now_ns(),
            stats,
        }))
    }
}

/// Walk an aggregate nest, filling in whichever identifying fields and
/// accounting record it carries. Unknown nested types are skipped.
fn parse_aggregate(
    data: &[u8],
    pid: &mut u32,
    tgid: &mut u32,
    stats: &mut Option<Taskstats>,
) -> Result<(), CodecError> {
    for attr in AttrIter::new(data) {
        let attr = attr?;
        match attr.atype {
            TASKSTATS_TYPE_PID => *pid = read_u32_attr(&attr)?,
            TASKSTATS_TYPE_TGID => *tgid = read_u32_attr(&attr)?,
            TASKSTATS_TYPE_STATS => *stats = Some(Taskstats::decode(attr.payload)?),
            _ => {}
        }
    }
    Ok(())
}

/// Build the one-time controller request resolving `name` to a family id.
pub fn encode_family_request(name: &str) -> Vec<u8> {
    let mut name_z = Vec::with_capacity(name.len() + 1);
    name_z.extend_from_slice(name.as_bytes());
    name_z.push(0);

    encode_message(
        GENL_ID_CTRL,
        0,
        std::process::id(),
        CTRL_CMD_GETFAMILY,
        CTRL_VERSION,
        &[(CTRL_ATTR_FAMILY_NAME, &name_z)],
    )
}

/// Extract the family id from a controller reply.
pub fn decode_family_reply(data: &[u8]) -> Result<u16, CodecError> {
    let Some(attrs) = genl_attr_stream(data)? else {
        return Err(CodecError::FamilyMissing);
    };

    for attr in AttrIter::new(attrs) {
        let attr = attr?;
        if attr.atype == CTRL_ATTR_FAMILY_ID {
            if attr.payload.len() < 2 {
                return Err(CodecError::BadLength {
                    atype: attr.atype,
                    len: attr.payload.len(),
                });
            }
            return Ok(read_u16(attr.payload, 0));
        }
    }

    Err(CodecError::FamilyMissing)
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Frame a generic-netlink request: nlmsghdr, genlmsghdr, then attributes.
fn encode_message(
    family_id: u16,
    seq: u32,
    portid: u32,
    cmd: u8,
    version: u8,
    attrs: &[(u16, &[u8])],
) -> Vec<u8> {
    let mut buf = vec![0u8; NLMSG_HDRLEN + GENL_HDRLEN];
    buf[16] = cmd;
    buf[17] = version;
    // genlmsghdr reserved field stays zero.

    for (atype, payload) in attrs {
        put_attr(&mut buf, *atype, payload);
    }

    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_ne_bytes());
    buf[4..6].copy_from_slice(&family_id.to_ne_bytes());
    buf[6..8].copy_from_slice(&NLM_F_REQUEST.to_ne_bytes());
    buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    buf[12..16].copy_from_slice(&portid.to_ne_bytes());
    buf
}

/// Append one attribute, padding the value to the 4-byte boundary.
fn put_attr(buf: &mut Vec<u8>, atype: u16, payload: &[u8]) {
    let len = (NLA_HDRLEN + payload.len()) as u16;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&atype.to_ne_bytes());
    buf.extend_from_slice(payload);
    while buf.len() % NLA_ALIGNTO != 0 {
        buf.push(0);
    }
}

/// Validate the outer nlmsghdr framing of one message and return its
/// attribute stream.
///
/// `Ok(None)` for control messages carrying no attributes (ACK, DONE, NOOP);
/// kernel error replies surface as [`CodecError::Kernel`].
fn genl_attr_stream(data: &[u8]) -> Result<Option<&[u8]>, CodecError> {
    if data.len() < NLMSG_HDRLEN {
        return Err(CodecError::Truncated { size: data.len() });
    }

    let msg_len = read_u32(data, 0) as usize;
    if msg_len < NLMSG_HDRLEN {
        return Err(CodecError::Truncated { size: msg_len });
    }
    if msg_len > data.len() {
        return Err(CodecError::LengthOverrun {
            declared: msg_len,
            actual: data.len(),
        });
    }

    match read_u16(data, 4) {
        NLMSG_ERROR => {
            if msg_len < NLMSG_HDRLEN + 4 {
                return Err(CodecError::Truncated { size: msg_len });
            }
            // Payload starts with the negative errno; 0 is a plain ACK.
            let errno = read_i32(data, NLMSG_HDRLEN);
            if errno == 0 {
                Ok(None)
            } else {
                Err(CodecError::Kernel(std::io::Error::from_raw_os_error(
                    -errno,
                )))
            }
        }
        NLMSG_DONE | NLMSG_NOOP => Ok(None),
        _ => {
            if msg_len < NLMSG_HDRLEN + GENL_HDRLEN {
                return Err(CodecError::Truncated { size: msg_len });
            }
            Ok(Some(&data[NLMSG_HDRLEN + GENL_HDRLEN..msg_len]))
        }
    }
}

struct Attr<'a> {
    atype: u16,
    payload: &'a [u8],
}

/// Iterator over a 4-byte-aligned attribute stream.
struct AttrIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> AttrIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<Attr<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let remaining = &self.data[self.offset..];
        if remaining.len() < NLA_HDRLEN {
            return Some(Err(CodecError::BadAttribute {
                offset: self.offset,
            }));
        }

        let len = read_u16(remaining, 0) as usize;
        // High bits carry nesting/byte-order flags, not the type.
        let atype = read_u16(remaining, 2) & NLA_TYPE_MASK;

        if len < NLA_HDRLEN || len > remaining.len() {
            return Some(Err(CodecError::BadAttribute {
                offset: self.offset,
            }));
        }

        let payload = &remaining[NLA_HDRLEN..len];
        self.offset += next_multiple_of_4(len);

        Some(Ok(Attr { atype, payload }))
    }
}

fn next_multiple_of_4(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

fn read_u32_attr(attr: &Attr<'_>) -> Result<u32, CodecError> {
    if attr.payload.len() < 4 {
        return Err(CodecError::BadLength {
            atype: attr.atype,
            len: attr.payload.len(),
        });
    }
    Ok(read_u32(attr.payload, 0))
}
