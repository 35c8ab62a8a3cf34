//! Wire layout for the kernel's process-event connector protocol, and the
//! frame decoder that turns a raw datagram into an `ExecEvent`.
//!
//! The three headers plus payload are concatenated with no inserted
//! padding, native-endian, matching `struct nlmsghdr` / `struct cn_msg` /
//! `struct proc_event` from the kernel's connector ABI. Laid out here as
//! hand-rolled packed structs with explicit size assertions rather than a
//! derive macro, since parsing this layout correctly is the thing under
//! test.

use std::mem::size_of;

/// `struct nlmsghdr`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NlMsgHdr {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

pub const NLMSG_HDR_LEN: usize = size_of::<NlMsgHdr>();
const _: () = assert!(NLMSG_HDR_LEN == 16);

/// `NLMSG_DONE`: the message type used for the subscription control
/// message. Kernel connector listeners commonly accept this value; if a
/// target build rejects it, `NLMSG_CONNECTOR_DOCUMENTED` is the documented
/// alternative — isolated here as a named constant rather than silently
/// guessed.
pub const NLMSG_DONE: u16 = 0x3;
#[allow(dead_code)]
pub const NLMSG_CONNECTOR_DOCUMENTED: u16 = 0x4; // NLMSG_MIN_TYPE-ish fallback value

/// Connector multiplex id: selects which connector (idx, val) within the
/// shared netlink connector bus.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbId {
    pub idx: u32,
    pub val: u32,
}

pub const CN_IDX_PROC: u32 = 0x1;
pub const CN_VAL_PROC: u32 = 0x1;
pub const PROC_CN_ID: CbId = CbId {
    idx: CN_IDX_PROC,
    val: CN_VAL_PROC,
};

/// `struct cn_msg` (connector header).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CnMsg {
    pub id: CbId,
    pub seq: u32,
    pub ack: u32,
    pub len: u16,
    pub flags: u16,
}

pub const CN_MSG_HDR_LEN: usize = size_of::<CnMsg>();
const _: () = assert!(CN_MSG_HDR_LEN == 20);

/// Operation codes for the proc connector multicast subscription payload.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcCnMcastOp {
    Listen = 1,
    Ignore = 2,
}

/// Process-event header: `what`, `cpu`, monotonic timestamp.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProcEventHeader {
    pub what: u32,
    pub cpu: u32,
    pub timestamp_ns: u64,
}

pub const PROC_EVENT_HDR_LEN: usize = size_of::<ProcEventHeader>();
const _: () = assert!(PROC_EVENT_HDR_LEN == 16);

pub const PROC_EVENT_FORK: u32 = 0x0000_0001;
pub const PROC_EVENT_EXEC: u32 = 0x0000_0002;
pub const PROC_EVENT_UID: u32 = 0x0000_0004;
pub const PROC_EVENT_GID: u32 = 0x0000_0040;
pub const PROC_EVENT_EXIT: u32 = 0x8000_0000;

/// `struct exec_proc_event`: the EXEC-specific payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExecProcEvent {
    pub process_pid: i32,
    pub process_tgid: i32,
}

pub const EXEC_PROC_EVENT_LEN: usize = size_of::<ExecProcEvent>();
const _: () = assert!(EXEC_PROC_EVENT_LEN == 8);

/// An EXEC event, the only kind the core acts on. FORK, UID, GID, and EXIT
/// events are decoded just far enough to be recognized and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecEvent {
    pub pid: i32,
    pub cpu: u32,
    pub timestamp_ns: u64,
}

/// Builds the subscription message: outer header + connector header + 4-byte
/// op code, concatenated with no padding, native-endian.
pub fn build_subscription_message(op: ProcCnMcastOp, self_pid: u32, seq: u32) -> Vec<u8> {
    let payload_len = 4u16;
    let cn_len = CN_MSG_HDR_LEN as u32 + payload_len as u32;
    let total_len = NLMSG_HDR_LEN as u32 + cn_len;

    let nl_hdr = NlMsgHdr {
        nlmsg_len: total_len,
        nlmsg_type: NLMSG_DONE,
        nlmsg_flags: 0,
        nlmsg_seq: seq,
        nlmsg_pid: self_pid,
    };
    let cn_msg = CnMsg {
        id: PROC_CN_ID,
        seq,
        ack: 0,
        len: payload_len,
        flags: 0,
    };
    let op_code = op as u32;

    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend_from_slice(struct_as_bytes(&nl_hdr));
    buf.extend_from_slice(struct_as_bytes(&cn_msg));
    buf.extend_from_slice(&op_code.to_ne_bytes());
    buf
}

/// Reads `T` out of a native-endian byte buffer without relying on
/// language-default alignment of the *source* bytes: the value is built
/// field-by-field from raw slices rather than transmuted in place, since a
/// received datagram buffer has no alignment guarantee for a packed
/// in-kernel layout.
fn struct_as_bytes<T>(value: &T) -> &[u8] {
    // SAFETY: all header structs here are `#[repr(C)]` with only primitive
    // integer fields and no padding (asserted above), so reading their
    // representation as bytes is well-defined.
    unsafe {
        std::slice::from_raw_parts((value as *const T) as *const u8, std::mem::size_of::<T>())
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_ne_bytes(b.try_into().unwrap()))
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_ne_bytes(b.try_into().unwrap()))
}

fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    buf.get(offset..offset + 8)
        .map(|b| u64::from_ne_bytes(b.try_into().unwrap()))
}

fn read_i32(buf: &[u8], offset: usize) -> Option<i32> {
    buf.get(offset..offset + 4)
        .map(|b| i32::from_ne_bytes(b.try_into().unwrap()))
}

/// Why a frame was dropped, for warn-level logging at the call site. Unknown
/// or partial frames are dropped with a warning rather than treated as
/// fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    ShortOuterHeader,
    ShortConnectorHeader,
    ConnectorIdMismatch,
    ShortProcEventHeader,
    ShortExecPayload,
    NotExec,
}

/// Parses one received datagram into an `ExecEvent`, or `None` with a
/// reason if the frame is not a (fully-formed) EXEC event.
pub fn decode_frame(buf: &[u8]) -> Result<ExecEvent, DropReason> {
    if buf.len() < NLMSG_HDR_LEN {
        return Err(DropReason::ShortOuterHeader);
    }
    let outer_len = read_u32(buf, 0).unwrap() as usize;
    if outer_len < NLMSG_HDR_LEN || buf.len() < outer_len {
        return Err(DropReason::ShortOuterHeader);
    }

    let cn_start = NLMSG_HDR_LEN;
    if buf.len() < cn_start + CN_MSG_HDR_LEN {
        return Err(DropReason::ShortConnectorHeader);
    }
    let idx = read_u32(buf, cn_start).unwrap();
    let val = read_u32(buf, cn_start + 4).unwrap();
    if idx != CN_IDX_PROC || val != CN_VAL_PROC {
        return Err(DropReason::ConnectorIdMismatch);
    }
    let cn_payload_len = read_u16(buf, cn_start + 16).unwrap() as usize;

    let ev_start = cn_start + CN_MSG_HDR_LEN;
    if buf.len() < ev_start + PROC_EVENT_HDR_LEN || cn_payload_len < PROC_EVENT_HDR_LEN {
        return Err(DropReason::ShortProcEventHeader);
    }
    let what = read_u32(buf, ev_start).unwrap();
    let cpu = read_u32(buf, ev_start + 4).unwrap();
    let timestamp_ns = read_u64(buf, ev_start + 8).unwrap();

    if what != PROC_EVENT_EXEC {
        return Err(DropReason::NotExec);
    }

    let payload_start = ev_start + PROC_EVENT_HDR_LEN;
    if buf.len() < payload_start + EXEC_PROC_EVENT_LEN {
        return Err(DropReason::ShortExecPayload);
    }
    let pid = read_i32(buf, payload_start).unwrap();

    Ok(ExecEvent {
        pid,
        cpu,
        timestamp_ns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(what: u32, pid: i32) -> Vec<u8> {
        let ev_payload_len = PROC_EVENT_HDR_LEN + EXEC_PROC_EVENT_LEN;
        let cn_len = CN_MSG_HDR_LEN + ev_payload_len;
        let total_len = NLMSG_HDR_LEN + cn_len;

        let mut buf = Vec::with_capacity(total_len);
        buf.extend_from_slice(&(total_len as u32).to_ne_bytes());
        buf.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());

        buf.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
        buf.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&(ev_payload_len as u16).to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());

        buf.extend_from_slice(&what.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // cpu
        buf.extend_from_slice(&42u64.to_ne_bytes()); // timestamp

        buf.extend_from_slice(&pid.to_ne_bytes());
        buf.extend_from_slice(&pid.to_ne_bytes()); // tgid == pid

        buf
    }

    #[test]
    fn decodes_valid_exec_event() {
        let buf = encode_frame(PROC_EVENT_EXEC, 4242);
        let event = decode_frame(&buf).unwrap();
        assert_eq!(event.pid, 4242);
        assert_eq!(event.timestamp_ns, 42);
    }

    #[test]
    fn non_exec_events_are_dropped() {
        let buf = encode_frame(PROC_EVENT_FORK, 4242);
        assert_eq!(decode_frame(&buf), Err(DropReason::NotExec));
    }

    #[test]
    fn short_outer_header_is_dropped_silently() {
        let buf = vec![0u8; NLMSG_HDR_LEN - 1];
        assert_eq!(decode_frame(&buf), Err(DropReason::ShortOuterHeader));
    }

    #[test]
    fn mismatched_connector_id_is_dropped() {
        let mut buf = encode_frame(PROC_EVENT_EXEC, 1);
        // corrupt idx field
        buf[NLMSG_HDR_LEN..NLMSG_HDR_LEN + 4].copy_from_slice(&99u32.to_ne_bytes());
        assert_eq!(decode_frame(&buf), Err(DropReason::ConnectorIdMismatch));
    }

    #[test]
    fn subscription_message_has_no_padding() {
        let msg = build_subscription_message(ProcCnMcastOp::Listen, 1234, 1);
        assert_eq!(msg.len(), NLMSG_HDR_LEN + CN_MSG_HDR_LEN + 4);
    }
}
