// Copyright 2020 Joyent, Inc.

//! Call framing around the marshal streams.
//!
//! A request is:
//!
//! * VERSION     1-byte integer.  The only supported value is 0x0.
//!
//! * INTEGRITY   1-byte boolean.  Whether the client requires codebase
//!             integrity to be verified when the call is unmarshaled.
//!
//! * a marshal stream holding the method hash (long) followed by one object
//!   per declared parameter.
//!
//! A reply is:
//!
//! * STATUS      1-byte integer:
//!
//!     * STATUS_RETURN  0x1  the method returned normally
//!
//!     * STATUS_THROWN  0x2  the method threw an application exception
//!
//!     * STATUS_FAILED  0x3  the call never reached the method, or its
//!                         result could not be returned
//!
//! * a marshal stream holding a single object: the return value, or a
//!   `RemoteException` for the two failure statuses.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::error::{Error, Result};

pub const PROTOCOL_VERSION: u8 = 0x0;

#[derive(Debug, Clone, Copy, PartialEq, FromPrimitive, ToPrimitive)]
pub enum ReplyStatus {
    Return = 1,
    Thrown = 2,
    Failed = 3,
}

pub fn write_request_header(out: &mut dyn Write, integrity: bool) -> Result<()> {
    out.write_all(&[PROTOCOL_VERSION, integrity as u8])?;
    Ok(())
}

/// Reads the request header, returning the client's integrity flag.
pub fn read_request_header(input: &mut dyn Read) -> Result<bool> {
    let version = input.read_u8()?;
    if version != PROTOCOL_VERSION {
        let msg = format!("unsupported protocol version {:#04x}", version);
        return Err(Error::InvalidObject(msg));
    }

    match input.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(Error::InvalidObject(format!("invalid integrity flag {}", b))),
    }
}

pub fn write_reply_status(out: &mut dyn Write, status: ReplyStatus) -> Result<()> {
    let status_u8 = status
        .to_u8()
        .ok_or_else(|| Error::InvalidObject(String::from("invalid status")))?;
    out.write_all(&[status_u8])?;
    Ok(())
}

pub fn read_reply_status(input: &mut dyn Read) -> Result<ReplyStatus> {
    let raw = input.read_u8()?;
    FromPrimitive::from_u8(raw).ok_or_else(|| {
        let msg = format!("Failed to parse reply status {:#04x}", raw);
        Error::InvalidObject(msg)
    })
}
