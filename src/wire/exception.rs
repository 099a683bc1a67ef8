//! Serialized error payload carried by exception envelopes.
//!
//! CBOR map with string keys so either side can evolve fields
//! independently; unknown keys are skipped on decode.

use std::convert::Infallible;

use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::error::CallError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionPayload {
    pub error_type: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ExceptionCodecError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

impl ExceptionPayload {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn from_call_error(err: &CallError) -> Self {
        match err {
            CallError::Remote {
                error_type,
                message,
            } => Self::new(error_type.clone(), message.clone()),
            other => Self::new(other.error_type(), other.to_string()),
        }
    }

    pub fn into_call_error(self) -> CallError {
        CallError::Remote {
            error_type: self.error_type,
            message: self.message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ExceptionCodecError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2)?;
        enc.str("type")?;
        enc.str(&self.error_type)?;
        enc.str("message")?;
        enc.str(&self.message)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ExceptionCodecError> {
        let mut dec = Decoder::new(bytes);
        let map_len = dec
            .map()?
            .ok_or(minicbor::decode::Error::message("indefinite map"))?;

        let mut error_type = None;
        let mut message = None;
        for _ in 0..map_len {
            let key = dec.str()?;
            match key {
                "type" => error_type = Some(dec.str()?.to_string()),
                "message" => message = Some(dec.str()?.to_string()),
                _ => {
                    dec.skip()?;
                }
            }
        }

        Ok(Self {
            error_type: error_type.ok_or(ExceptionCodecError::MissingField("type"))?,
            message: message.ok_or(ExceptionCodecError::MissingField("message"))?,
        })
    }
}
