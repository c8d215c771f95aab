// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A minimal parser for the `(ws|wss|http|https)://host[:port][/path[?query]]`
//! grammar spec §6 defines. Kept deliberately narrow: this is glue for the
//! handshake, not a general-purpose URL library (the teacher depends on
//! `http` only for `StatusCode`, never pulls in a URL crate, and the
//! original C library parses this by hand as well).

use std::fmt;

/// The schema part of a websocket URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Ws,
    Wss,
    Http,
    Https
}

impl Schema {
    /// The default port for this schema when none is given explicitly.
    pub fn default_port(self) -> u16 {
        match self {
            Schema::Ws | Schema::Http => 80,
            Schema::Wss | Schema::Https => 443
        }
    }

    /// Does this schema imply a TLS transport?
    pub fn is_secure(self) -> bool {
        matches!(self, Schema::Wss | Schema::Https)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Schema::Ws => "ws",
            Schema::Wss => "wss",
            Schema::Http => "http",
            Schema::Https => "https"
        })
    }
}

/// Errors produced while parsing a URL.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum UrlError {
    #[error("missing '://' schema separator")]
    MissingSchemaSeparator,
    #[error("unknown schema: {0}")]
    UnknownSchema(String),
    #[error("empty host")]
    EmptyHost,
    #[error("unterminated ipv6 literal")]
    UnterminatedIpv6Literal,
    #[error("invalid port")]
    InvalidPort
}

/// A parsed websocket (or plain HTTP, used for the handshake's intermediate
/// form) URL: `schema://host[:port][/path[?query]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    schema: Schema,
    host: String,
    port: u16,
    path: String
}

impl Url {
    /// Parse a URL per spec §6's grammar.
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let sep = input.find("://").ok_or(UrlError::MissingSchemaSeparator)?;
        let schema = match &input[.. sep] {
            "ws" => Schema::Ws,
            "wss" => Schema::Wss,
            "http" => Schema::Http,
            "https" => Schema::Https,
            other => return Err(UrlError::UnknownSchema(other.to_string()))
        };
        let rest = &input[sep + 3 ..];

        let (host_port, path) = match rest.find('/') {
            Some(i) => (&rest[.. i], &rest[i ..]),
            None => (rest, "/")
        };

        if host_port.is_empty() {
            return Err(UrlError::EmptyHost)
        }

        let (host, port) = if host_port.starts_with('[') {
            let end = host_port.find(']').ok_or(UrlError::UnterminatedIpv6Literal)?;
            let host = host_port[.. end + 1].to_string();
            let port = match host_port[end + 1 ..].strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| UrlError::InvalidPort)?,
                None => schema.default_port()
            };
            (host, port)
        } else {
            match host_port.rfind(':') {
                Some(i) => {
                    let port = host_port[i + 1 ..].parse().map_err(|_| UrlError::InvalidPort)?;
                    (host_port[.. i].to_string(), port)
                }
                None => (host_port.to_string(), schema.default_port())
            }
        };

        if host.is_empty() {
            return Err(UrlError::EmptyHost)
        }

        Ok(Url { schema, host, port, path: path.to_string() })
    }

    pub fn schema(&self) -> Schema {
        self.schema
    }

    pub fn hostname(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The request-target, i.e. path plus optional query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The value to send in the `Host` header: `host` if the port is the
    /// schema's default, `host:port` otherwise.
    pub fn host_header_value(&self) -> String {
        if self.port == self.schema.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}", self.schema, self.host_header_value())?;
        f.write_str(&self.path)
    }
}
