//! Device status codes carried in `status_or_param1` of replies.

pub const OK: u32 = 0;
pub const INVALID_MODEL_ID: u32 = 1;
pub const INVALID_DESCRIPTOR_TYPE: u32 = 2;
pub const OVER_OUTPUT_SIZE: u32 = 3;
pub const MEM_ALLOCATION_FAIL: u32 = 4;
pub const KAPP_ABORT: u32 = 5;
pub const KAPP_ERR: u32 = 6;
/// Returned by a status query for a session id the device does not know.
pub const BAD_SESSION: u32 = 0xF8;
pub const OTHER: u32 = 8888;

const FID_BASE: u32 = 100;
const DB_BASE: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Transient,
    Rejected,
}

/// Maps a reply status to an outcome. Only codes listed in `transient` are
/// retryable; every other non-zero code is a hard rejection.
pub fn classify(code: u32, transient: &[u32]) -> Outcome {
    if code == OK {
        Outcome::Ok
    } else if transient.contains(&code) {
        Outcome::Transient
    } else {
        Outcome::Rejected
    }
}

pub fn describe(code: u32) -> &'static str {
    match code {
        OK => "success",
        INVALID_MODEL_ID => "invalid model id",
        INVALID_DESCRIPTOR_TYPE => "invalid descriptor type",
        OVER_OUTPUT_SIZE => "output exceeds buffer (hard reset required)",
        MEM_ALLOCATION_FAIL => "memory allocation failed (hard reset required)",
        KAPP_ABORT => "application aborted",
        KAPP_ERR => "application error",
        BAD_SESSION => "unknown session id",
        OTHER => "unspecified device error (hard reset required)",
        c if (FID_BASE..DB_BASE).contains(&c) => "face-id application error",
        c if (DB_BASE..DB_BASE + 100).contains(&c) => "face database error",
        _ => "unknown status",
    }
}
