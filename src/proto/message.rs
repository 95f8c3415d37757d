//! Typed requests and bounds-checked reply decoders.
//!
//! Every request maps onto `{param1, param2, data}` of one command frame,
//! optionally followed by bulk bytes once the device acknowledges it.

use crate::error::{LinkError, Result};
use crate::proto::command::Command;

/// Reset mode that tears down the active streaming or session mode.
pub const RESET_END_MODE: u32 = 255;
/// `mode` flag selecting asynchronous session execution.
pub const DME_MODE_ASYNC: u16 = 1;
/// `ready` flag reported by a session status query.
pub const DME_STATUS_DONE: u16 = 1;

#[derive(Debug, Clone)]
pub struct Request<'a> {
    pub command: Command,
    pub param1: u32,
    pub param2: u32,
    pub data: Vec<u8>,
    /// Sent after the device acknowledges the command frame.
    pub bulk: Option<&'a [u8]>,
}

impl<'a> Request<'a> {
    pub fn new(command: Command, param1: u32, param2: u32) -> Self {
        Self {
            command,
            param1,
            param2,
            data: Vec::new(),
            bulk: None,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn with_bulk(mut self, bulk: &'a [u8]) -> Self {
        self.bulk = Some(bulk);
        self
    }

    /// Whether `param1` of the reply is a status code rather than a value.
    pub fn reply_has_status(&self) -> bool {
        !matches!(
            self.command,
            Command::SystemStatus | Command::GetKnNum | Command::GetModelInfo | Command::QueryApps
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: Command,
    pub status_or_param1: u32,
    pub param2: u32,
    pub data: Vec<u8>,
}

impl Response {
    pub fn data_u16(&self, at: usize) -> Result<u16> {
        let b = self.field(at, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn data_u32(&self, at: usize) -> Result<u32> {
        let b = self.field(at, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn field(&self, at: usize, len: usize) -> Result<&[u8]> {
        self.data.get(at..at + len).ok_or_else(|| {
            LinkError::violation(format!(
                "{} reply carries {} data bytes, field at {at} needs {len}",
                self.command,
                self.data.len()
            ))
        })
    }
}

// ---- Image streaming

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    pub app_id: u32,
    /// Per-image result buffer the device should reserve.
    pub result_size: u32,
    pub width: u16,
    pub height: u16,
    pub format: u32,
}

pub fn isi_start(profile: &StreamProfile) -> Request<'static> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&profile.width.to_le_bytes());
    data.extend_from_slice(&profile.height.to_le_bytes());
    data.extend_from_slice(&profile.format.to_le_bytes());
    Request::new(Command::IsiStart, profile.app_id, profile.result_size).with_data(data)
}

/// Window capacity negotiated by `isi_start`.
pub fn isi_start_reply(rsp: &Response) -> u32 {
    rsp.param2
}

pub fn isi_config(model_id: u32, param: u32) -> Request<'static> {
    Request::new(Command::IsiConfig, model_id, param)
}

pub fn isi_send_image(image_id: u32, image: &[u8]) -> Request<'_> {
    Request::new(Command::IsiSendImage, image.len() as u32, image_id).with_bulk(image)
}

/// Remaining window capacity reported after a submission. Signed on the wire.
pub fn isi_send_image_reply(rsp: &Response) -> i32 {
    rsp.param2 as i32
}

pub fn isi_get_results(image_id: u32) -> Request<'static> {
    Request::new(Command::IsiGetResults, image_id, 0)
}

/// Byte length of the raw result that follows the reply.
pub fn isi_get_results_reply(rsp: &Response) -> usize {
    rsp.param2 as usize
}

// ---- Dynamic model execution

pub fn dme_start<'a>(model: &'a [u8], fw_info: &[u8]) -> Request<'a> {
    Request::new(Command::DmeStart, model.len() as u32, 0)
        .with_data(fw_info.to_vec())
        .with_bulk(model)
}

pub fn dme_config(config: &[u8]) -> Request<'static> {
    Request::new(Command::DmeConfig, config.len() as u32, 0).with_data(config.to_vec())
}

pub fn dme_send_image(image: &[u8], mode: u16, model_id: u16) -> Request<'_> {
    let mode_and_model = mode as u32 | (model_id as u32) << 16;
    Request::new(Command::DmeSendImage, image.len() as u32, mode_and_model).with_bulk(image)
}

/// Session id assigned to an asynchronous submission.
pub fn dme_send_image_reply(rsp: &Response) -> Result<u16> {
    u16::try_from(rsp.param2)
        .map_err(|_| LinkError::violation(format!("session id {} out of range", rsp.param2)))
}

pub fn dme_get_status(session: u16) -> Request<'static> {
    Request::new(Command::DmeGetStatus, session as u32, 0)
}

/// A fresh status read. Never reused across polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub session: u16,
    pub ready: bool,
    pub result_size: u32,
}

/// The size word is only present once the session is done.
pub fn dme_get_status_reply(rsp: &Response) -> Result<SessionStatus> {
    let session = (rsp.param2 & 0xFFFF) as u16;
    let ready = (rsp.param2 >> 16) as u16 == DME_STATUS_DONE;
    let result_size = if ready { rsp.data_u32(0)? } else { 0 };
    Ok(SessionStatus {
        session,
        ready,
        result_size,
    })
}

/// Pull request for `len` raw result bytes; answered by bulk data only.
pub fn data_pull(addr: u32, len: u32) -> Request<'static> {
    Request::new(Command::AckNack, addr, 0).with_data(len.to_le_bytes().to_vec())
}

// ---- System

pub fn reset(mode: u32, check_code: u32) -> Request<'static> {
    Request::new(Command::Reset, mode, check_code)
}

pub fn system_status() -> Request<'static> {
    Request::new(Command::SystemStatus, 0, 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemStatus {
    pub firmware_id: u32,
    pub build_id: u32,
    pub sys_status: u16,
    pub app_status: u16,
}

pub fn system_status_reply(rsp: &Response) -> Result<SystemStatus> {
    Ok(SystemStatus {
        firmware_id: rsp.status_or_param1,
        build_id: rsp.param2,
        sys_status: rsp.data_u16(0)?,
        app_status: rsp.data_u16(2)?,
    })
}

pub fn kn_number() -> Request<'static> {
    Request::new(Command::GetKnNum, 0, 0)
}
