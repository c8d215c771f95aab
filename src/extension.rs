// Copyright (c) 2019 Parity Technologies (UK) Ltd.
// Copyright (c) 2016 twist developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The RFC6455 §9 extension seam. No concrete extension ships enabled by
//! default (permessage-deflate in particular is out of scope), but the
//! trait and registration API stay so a host can plug one in.

use std::{borrow::Cow, error::Error};

use crate::opcode::OpCode;

/// A websocket extension as per RFC 6455, section 9.
///
/// Unlike a buffer-owning `Frame` type, extensions here operate on the
/// engine's header and the borrowed payload slice directly, since the core
/// never owns a frame's bytes - they live in the host's receive/output buffer.
pub trait Extension: std::fmt::Debug {
    /// Is this extension enabled?
    fn is_enabled(&self) -> bool;

    /// The name of this extension.
    fn name(&self) -> &str;

    /// The parameters this extension wants to send for negotiation.
    fn params(&self) -> &[Param];

    /// Configure this extension with the parameters received from negotiation.
    fn configure(&mut self, params: &[Param]) -> Result<(), Box<dyn Error + Send>>;

    /// Transform `payload` in place before it is sent, given the frame's opcode.
    fn encode(&mut self, opcode: OpCode, payload: &mut [u8]) -> Result<(), Box<dyn Error + Send>>;

    /// Transform `payload` in place after it is received, given the frame's opcode.
    fn decode(&mut self, opcode: OpCode, payload: &mut [u8]) -> Result<(), Box<dyn Error + Send>>;

    /// The reserved bits this extension uses.
    fn reserved_bits(&self) -> (bool, bool, bool) {
        (false, false, false)
    }

    /// The reserved opcode of this extension (must be one of `OpCode::Reserved*`).
    fn reserved_opcode(&self) -> Option<OpCode> {
        None
    }
}

impl<E: Extension + ?Sized> Extension for Box<E> {
    fn is_enabled(&self) -> bool {
        (**self).is_enabled()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn params(&self) -> &[Param] {
        (**self).params()
    }

    fn configure(&mut self, params: &[Param]) -> Result<(), Box<dyn Error + Send>> {
        (**self).configure(params)
    }

    fn encode(&mut self, opcode: OpCode, payload: &mut [u8]) -> Result<(), Box<dyn Error + Send>> {
        (**self).encode(opcode, payload)
    }

    fn decode(&mut self, opcode: OpCode, payload: &mut [u8]) -> Result<(), Box<dyn Error + Send>> {
        (**self).decode(opcode, payload)
    }

    fn reserved_bits(&self) -> (bool, bool, bool) {
        (**self).reserved_bits()
    }

    fn reserved_opcode(&self) -> Option<OpCode> {
        (**self).reserved_opcode()
    }
}

/// Extension parameter (used for negotiation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param<'a> {
    pub(crate) name: Cow<'a, str>,
    pub(crate) value: Option<Cow<'a, str>>
}

impl<'a> Param<'a> {
    pub fn new(name: impl Into<Cow<'a, str>>) -> Self {
        Param { name: name.into(), value: None }
    }

    pub fn with_value(mut self, value: impl Into<Cow<'a, str>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_ref().map(|v| v.as_ref())
    }
}
