// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The connection state machine and public API surface: `init`/`start`/
//! `parse`/`send`/`close`, per spec §4.4 and §4.6.

use http::StatusCode;
use smallvec::SmallVec;

use crate::{
    access_control::Policy,
    buffer::{BufferType, HostCallbacks},
    extension::Extension,
    frame::{Codec as FrameCodec, FrameError, Header, MAX_HEADER_SIZE},
    handshake::{self, HandshakeError, HandshakeFailure},
    header::HeaderList,
    opcode::OpCode,
    url::Url,
    utf8::{Utf8Error, Validator}
};

/// The connection's role: which side of the handshake it drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server
}

/// Connection lifecycle state, per spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Ready,
    Open,
    Closing,
    Closed
}

/// Every fallible engine operation returns this. Maps onto spec §4.6's
/// status enum (`SUCCESS` is simply `Ok(())`).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("operation not valid in the current connection state")]
    BadState,
    #[error("payload exceeds the configured maximum or the output buffer's capacity")]
    TooLarge,
    #[error("no output buffer currently available")]
    WouldBlock,
    #[error("invalid input")]
    BadInput,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    Url(#[from] crate::url::UrlError)
}

struct FragmentContext {
    opcode: OpCode,
    validator: Option<Validator>,
    accumulated: u64
}

/// Configuration carried into [`Engine::new`]; mirrors the teacher's own
/// `connection::Builder` shape (`set_max_message_size`, `set_max_frame_size`).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_frame_size: u64,
    pub max_message_size: u64
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { max_frame_size: 16 * 1024 * 1024, max_message_size: 64 * 1024 * 1024 }
    }
}

/// The protocol engine. Generic over the host callback implementation so
/// there is no dynamic dispatch on the hot path; `'h` is the lifetime of
/// the host-owned receive buffer and any borrowed registration data.
pub struct Engine<'h, H: HostCallbacks> {
    role: Role,
    state: ConnectionState,
    url: Url,
    redirect_url: Option<Url>,
    config: EngineConfig,
    headers: HeaderList<'h>,
    policy: Option<&'h dyn Policy>,
    extensions: Vec<Box<dyn Extension + 'h>>,
    callbacks: H,
    recv_buffer: &'h mut [u8],
    recv_len: usize,
    frame_codec: FrameCodec,
    nonce: [u8; handshake::NONCE_LEN],
    fragment: Option<FragmentContext>,
    sent_close: bool,
    received_close: bool,
    close_code_reported: bool,
    peer_headers: Vec<(String, Vec<u8>)>,
    send_validator: Option<Validator>,
    /// Opcode of the outgoing message currently being fragmented across
    /// multiple `send_text`/`send_binary` calls (`None` between messages).
    send_fragment: Option<OpCode>
}

impl<'h, H: HostCallbacks> Engine<'h, H> {
    /// Create a new engine instance. Fails if `url`'s schema does not match `role`'s
    /// expectations is left to the caller; any well-formed [`Url`] is accepted here.
    pub fn new(role: Role, url: Url, recv_buffer: &'h mut [u8], callbacks: H) -> Self {
        Engine {
            role,
            state: ConnectionState::Init,
            url,
            redirect_url: None,
            config: EngineConfig::default(),
            headers: HeaderList::new(),
            policy: None,
            extensions: Vec::new(),
            callbacks,
            recv_buffer,
            recv_len: 0,
            frame_codec: FrameCodec::new(),
            nonce: [0; handshake::NONCE_LEN],
            fragment: None,
            sent_close: false,
            received_close: false,
            close_code_reported: false,
            peer_headers: Vec::new(),
            send_validator: None,
            send_fragment: None
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a Host-header access control policy (server role only).
    pub fn with_access_control(mut self, policy: &'h dyn Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Register an [`Extension`] (RFC 6455 §9). Registration only records the
    /// extension for [`Engine::extensions`]/[`Engine::extensions_mut`]; no
    /// concrete extension is negotiated or driven over the wire by this
    /// engine (see spec's Non-goals) - a host wiring one up does the
    /// negotiation and the per-frame `encode`/`decode` calls itself.
    pub fn with_extension(mut self, extension: Box<dyn Extension + 'h>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Extensions registered via [`Engine::with_extension`], in registration order.
    pub fn extensions(&self) -> &[Box<dyn Extension + 'h>] {
        &self.extensions
    }

    /// Mutable access to registered extensions, e.g. so a host can call
    /// `configure`/`encode`/`decode` on the one it negotiated.
    pub fn extensions_mut(&mut self) -> &mut [Box<dyn Extension + 'h>] {
        &mut self.extensions
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn redirect_url(&self) -> Option<&Url> {
        self.redirect_url.as_ref()
    }

    pub fn next_header(&self, index: usize) -> Option<(&str, &[u8])> {
        self.peer_headers.get(index).map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    /// Register a user handshake header. Only valid before [`start`](Engine::start).
    pub fn set_header(&mut self, name: &'h str, value: &'h [u8]) -> Result<(), EngineError> {
        if self.state != ConnectionState::Init {
            return Err(EngineError::BadState)
        }
        if !self.headers.push(name, value) {
            return Err(EngineError::BadInput)
        }
        Ok(())
    }

    fn random_u32(&mut self) -> u32 {
        self.callbacks.rand()
    }

    /// INIT -> READY. Client role emits the handshake request; server role
    /// arms the parser to accept one.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.state != ConnectionState::Init {
            return Err(EngineError::BadState)
        }

        match self.role {
            Role::Client => {
                let random = self.random_u32().to_ne_bytes();
                let random2 = self.random_u32().to_ne_bytes();
                let random3 = self.random_u32().to_ne_bytes();
                let random4 = self.random_u32().to_ne_bytes();
                let mut key = [0u8; 16];
                key[0 .. 4].copy_from_slice(&random);
                key[4 .. 8].copy_from_slice(&random2);
                key[8 .. 12].copy_from_slice(&random3);
                key[12 .. 16].copy_from_slice(&random4);
                handshake::generate_nonce(key, &mut self.nonce);

                let nonce = self.nonce;
                let url = &self.url;
                let headers = &self.headers;
                let mut built_len = 0usize;
                let mut build_err = None;
                let ok = self.callbacks.on_buffer_send(BufferType::User, 0, &mut |buf| {
                    let nonce_str = std::str::from_utf8(&nonce).expect("base64 output is ascii");
                    match handshake::write_client_request(buf, url, nonce_str, headers) {
                        Ok(n) => {
                            built_len = n;
                            n
                        }
                        Err(e) => {
                            build_err = Some(e);
                            0
                        }
                    }
                });
                if let Some(e) = build_err {
                    return Err(e.into())
                }
                if !ok {
                    return Err(EngineError::WouldBlock)
                }
                let _ = built_len;
                self.state = ConnectionState::Ready;
            }
            Role::Server => {
                self.state = ConnectionState::Ready;
            }
        }
        Ok(())
    }

    /// Signal that the underlying transport has gone away; synthesises a
    /// 1006 abnormal close (spec §7).
    pub fn notify_transport_closed(&mut self) {
        if self.state == ConnectionState::Closed {
            return
        }
        if self.state == ConnectionState::Ready {
            self.callbacks.on_handshake_failure(HandshakeFailure::Abnormal2);
        } else if !self.close_code_reported {
            self.close_code_reported = true;
            self.callbacks.on_close(1006, &[]);
        }
        self.state = ConnectionState::Closed;
    }

    /// Feed inbound bytes. Returns the number of bytes consumed.
    pub fn parse(&mut self, bytes: &[u8]) -> Result<usize, EngineError> {
        match self.state {
            ConnectionState::Init => Err(EngineError::BadState),
            ConnectionState::Closed => Ok(0),
            ConnectionState::Ready => self.parse_handshake(bytes),
            ConnectionState::Open | ConnectionState::Closing => self.parse_frames(bytes)
        }
    }

    fn append_to_recv(&mut self, bytes: &[u8]) -> usize {
        let space = self.recv_buffer.len() - self.recv_len;
        let n = bytes.len().min(space);
        self.recv_buffer[self.recv_len .. self.recv_len + n].copy_from_slice(&bytes[.. n]);
        self.recv_len += n;
        n
    }

    fn parse_handshake(&mut self, bytes: &[u8]) -> Result<usize, EngineError> {
        let consumed = self.append_to_recv(bytes);

        let result = match self.role {
            Role::Client => {
                let nonce = self.nonce;
                let nonce_str = std::str::from_utf8(&nonce).expect("base64 output is ascii");
                handshake::parse_server_response(&self.recv_buffer[.. self.recv_len], nonce_str).map(|r| r.headers)
            }
            Role::Server => {
                handshake::parse_client_request(&self.recv_buffer[.. self.recv_len], self.policy).map(|r| {
                    self.finish_server_handshake(&r.accept[.. r.accept_len]);
                    r.headers
                })
            }
        };

        match result {
            Ok(headers) => {
                self.peer_headers = headers;
                self.recv_len = 0;
                log::debug!("handshake complete, role={:?}", self.role);
                self.state = ConnectionState::Open;
                self.callbacks.on_open();
            }
            Err(HandshakeError::Incomplete) => {
                // Wait for more bytes; nothing to report yet.
            }
            Err(HandshakeError::Informational { consumed: n }) => {
                // Stray 1xx: drop it from the buffer and keep waiting (spec §4.2).
                self.recv_buffer.copy_within(n .. self.recv_len, 0);
                self.recv_len -= n;
            }
            Err(HandshakeError::Redirect { location }) => {
                self.redirect_url = Url::parse(&location).ok();
                self.recv_len = 0;
                self.state = ConnectionState::Closed;
                self.callbacks.on_handshake_failure(HandshakeFailure::Upgrade);
            }
            Err(e) => {
                log::debug!("handshake failed: {}", e);
                if self.role == Role::Server {
                    self.send_server_rejection(&e);
                }
                self.recv_len = 0;
                self.state = ConnectionState::Closed;
                self.callbacks.on_handshake_failure(e.failure_kind());
            }
        }

        Ok(consumed)
    }

    fn finish_server_handshake(&mut self, accept: &[u8]) {
        let mut accept_buf = SmallVec::<[u8; 32]>::new();
        accept_buf.extend_from_slice(accept);
        let ok = self.callbacks.on_buffer_send(BufferType::User, 0, &mut |buf| {
            handshake::write_server_accept(buf, &accept_buf).map(|n| n).unwrap_or(0)
        });
        if !ok {
            log::warn!("no output buffer available to send handshake response");
        }
    }

    fn send_server_rejection(&mut self, err: &HandshakeError) {
        let status = match err {
            HandshakeError::UnexpectedHeader { name, .. } if *name == "Sec-WebSocket-Version" => {
                StatusCode::UPGRADE_REQUIRED
            }
            _ => StatusCode::BAD_REQUEST
        };
        let _ = self.callbacks.on_buffer_send(BufferType::User, 0, &mut |buf| {
            handshake::write_server_reject(buf, status).unwrap_or(0)
        });
    }

    fn parse_frames(&mut self, bytes: &[u8]) -> Result<usize, EngineError> {
        let mut total_consumed = 0usize;
        let mut input = bytes;

        loop {
            if self.state == ConnectionState::Closed {
                break
            }

            let n = self.append_to_recv(input);
            total_consumed += n;
            input = &input[n ..];

            loop {
                let decoded = self.frame_codec.decode_header(&self.recv_buffer[.. self.recv_len]);
                let (header, offset) = match decoded {
                    Ok(crate::frame::Parsing::NeedMore(_)) => break,
                    Ok(crate::frame::Parsing::Done { value, offset }) => (value, offset),
                    Err(e) => {
                        self.fail_protocol(frame_error_close_code(&e));
                        return Ok(total_consumed)
                    }
                };

                let frame_total = offset + header.payload_len() as usize;
                if header.payload_len() > self.config.max_frame_size
                    || frame_total > self.recv_buffer.len()
                {
                    self.fail_protocol(1009);
                    return Ok(total_consumed)
                }
                if frame_total > self.recv_len {
                    break // payload not fully arrived yet
                }

                if let Err(close_code) = self.validate_masking(&header) {
                    self.fail_protocol(close_code);
                    return Ok(total_consumed)
                }

                if header.is_masked() {
                    let mask = header.mask();
                    FrameCodec::apply_mask(mask, &mut self.recv_buffer[offset .. frame_total]);
                }

                if let Err(close_code) = self.handle_frame(&header, offset, frame_total) {
                    self.fail_protocol(close_code);
                    return Ok(total_consumed)
                }

                self.recv_buffer.copy_within(frame_total .. self.recv_len, 0);
                self.recv_len -= frame_total;
            }

            if input.is_empty() || self.recv_len == self.recv_buffer.len() {
                break
            }
        }

        Ok(total_consumed)
    }

    fn validate_masking(&self, header: &Header) -> Result<(), u16> {
        let expected_masked = self.role == Role::Server;
        if header.is_masked() != expected_masked {
            return Err(1002)
        }
        Ok(())
    }

    fn handle_frame(&mut self, header: &Header, offset: usize, frame_total: usize) -> Result<(), u16> {
        match header.opcode() {
            OpCode::Close => self.handle_close(&self.recv_buffer[offset .. frame_total].to_vec()),
            OpCode::Ping => {
                let payload = self.recv_buffer[offset .. frame_total].to_vec();
                self.send_pong(&payload);
                Ok(())
            }
            OpCode::Pong => {
                self.callbacks.on_pong(&self.recv_buffer[offset .. frame_total]);
                Ok(())
            }
            OpCode::Text | OpCode::Binary | OpCode::Continue => {
                self.handle_data_frame(header, offset, frame_total)
            }
            _ => Err(1002)
        }
    }

    fn handle_data_frame(&mut self, header: &Header, offset: usize, frame_total: usize) -> Result<(), u16> {
        let opcode = header.opcode();
        let fin = header.fin();

        match opcode {
            OpCode::Continue if self.fragment.is_none() => return Err(1002),
            OpCode::Text | OpCode::Binary if self.fragment.is_some() => return Err(1002),
            OpCode::Text => {
                self.fragment =
                    Some(FragmentContext { opcode: OpCode::Text, validator: Some(Validator::new()), accumulated: 0 })
            }
            OpCode::Binary => {
                self.fragment = Some(FragmentContext { opcode: OpCode::Binary, validator: None, accumulated: 0 })
            }
            _ => {}
        }

        let logical_opcode = self.fragment.as_ref().map(|f| f.opcode).unwrap_or(opcode);
        let payload_len = (frame_total - offset) as u64;

        if let Some(frag) = self.fragment.as_mut() {
            frag.accumulated += payload_len;
            if frag.accumulated > self.config.max_message_size {
                return Err(1009)
            }
        }

        if logical_opcode == OpCode::Text {
            let validator = self.fragment.as_mut().and_then(|f| f.validator.as_mut()).expect("text fragment has a validator");
            if validator.push_slice(&self.recv_buffer[offset .. frame_total]).is_err() {
                return Err(1007)
            }
            if fin && !validator.is_clean() {
                return Err(1007)
            }
        }

        let deliver_ok = if logical_opcode == OpCode::Text {
            self.callbacks.on_text(fin, &self.recv_buffer[offset .. frame_total])
        } else {
            self.callbacks.on_binary(fin, &self.recv_buffer[offset .. frame_total])
        };

        if fin {
            self.fragment = None;
        }

        if !deliver_ok {
            return Err(1008)
        }

        Ok(())
    }

    fn handle_close(&mut self, payload: Vec<u8>) -> Result<(), u16> {
        let (code, reason) = parse_close_payload(&payload)?;
        self.received_close = true;

        if !self.close_code_reported {
            self.close_code_reported = true;
            self.callbacks.on_close(code, reason);
        }

        match self.state {
            ConnectionState::Open => {
                let answer = close_answer(code);
                self.enqueue_close(answer, &[], BufferType::CloseResponse);
                self.state = ConnectionState::Closing;
            }
            ConnectionState::Closing => {
                self.state = ConnectionState::Closed;
                self.callbacks.on_close_transport();
            }
            _ => {}
        }
        Ok(())
    }

    fn send_pong(&mut self, payload: &[u8]) {
        self.send_control_frame(OpCode::Pong, payload, BufferType::Pong);
    }

    fn fail_protocol(&mut self, close_code: u16) {
        log::debug!("protocol error, closing with code {}", close_code);
        if self.state == ConnectionState::Open {
            self.enqueue_close(close_code, &[], BufferType::Close);
            self.sent_close = true;
            self.state = ConnectionState::Closing;
            if !self.close_code_reported {
                self.close_code_reported = true;
                self.callbacks.on_close(close_code, &[]);
            }
        }
    }

    /// Enqueue a data frame. Fails with [`EngineError::BadState`] unless OPEN.
    pub fn send_text(&mut self, fin: bool, data: &[u8]) -> Result<(), EngineError> {
        self.send_data(OpCode::Text, fin, data)
    }

    pub fn send_binary(&mut self, fin: bool, data: &[u8]) -> Result<(), EngineError> {
        self.send_data(OpCode::Binary, fin, data)
    }

    fn send_data(&mut self, opcode: OpCode, fin: bool, data: &[u8]) -> Result<(), EngineError> {
        if self.state != ConnectionState::Open {
            return Err(EngineError::BadState)
        }

        // A message already in progress continues with the same logical
        // opcode but CONT on the wire (spec §3's fragmentation rule); a
        // mismatched opcode mid-message is a caller error, not a protocol
        // violation, since nothing has gone out on the wire yet.
        let wire_opcode = match self.send_fragment {
            Some(expected) if expected == opcode => OpCode::Continue,
            Some(_) => return Err(EngineError::BadState),
            None => opcode
        };

        if opcode == OpCode::Text {
            let validator = self.send_validator.get_or_insert_with(Validator::new);
            if validator.push_slice(data).is_err() {
                self.send_validator = None;
                return Err(EngineError::BadInput)
            }
            if fin && !validator.is_clean() {
                self.send_validator = None;
                return Err(EngineError::BadInput)
            }
        }

        let masked = self.role == Role::Client;
        let mask = if masked { self.random_u32().to_ne_bytes() } else { [0; 4] };

        let mut header = Header::new(wire_opcode, data.len() as u64);
        header.set_fin(fin);
        if masked {
            header.set_mask(mask);
        }

        let header_len = header.encoded_len();
        let total = header_len + data.len();
        if total > self.config.max_frame_size as usize {
            return Err(EngineError::TooLarge)
        }

        let frame_codec = self.frame_codec;
        let mut failed_too_small = false;
        let ok = self.callbacks.on_buffer_send(BufferType::User, total, &mut |buf| {
            if buf.len() < total {
                failed_too_small = true;
                return 0
            }
            let mut hdr_bytes = [0u8; MAX_HEADER_SIZE];
            let n = frame_codec.encode_header(&header, &mut hdr_bytes);
            buf[.. n].copy_from_slice(&hdr_bytes[.. n]);
            buf[n .. n + data.len()].copy_from_slice(data);
            if masked {
                FrameCodec::apply_mask(mask, &mut buf[n .. n + data.len()]);
            }
            n + data.len()
        });

        if failed_too_small {
            return Err(EngineError::TooLarge)
        }
        if !ok {
            return Err(EngineError::WouldBlock)
        }

        self.send_fragment = if fin { None } else { Some(opcode) };
        if fin {
            self.send_validator = None;
        }
        Ok(())
    }

    /// Send an unsolicited PING with `payload` (spec §1 Non-goals: the engine
    /// itself never schedules keepalive pings, but the host may send one at
    /// any time while OPEN). `payload` must be at most 125 bytes, the
    /// control-frame limit.
    pub fn send_ping(&mut self, payload: &[u8]) -> Result<(), EngineError> {
        if self.state != ConnectionState::Open {
            return Err(EngineError::BadState)
        }
        if payload.len() > crate::frame::MAX_CONTROL_FRAME_PAYLOAD as usize {
            return Err(EngineError::TooLarge)
        }
        self.send_control_frame(OpCode::Ping, payload, BufferType::Ping);
        Ok(())
    }

    /// Initiate a close handshake with code 1000 and no reason.
    pub fn close(&mut self) -> Result<(), EngineError> {
        self.close_with_reason(1000, &[])
    }

    /// Initiate a close handshake with an explicit code/reason. Idempotent:
    /// calling this again once CLOSING/CLOSED has no effect.
    pub fn close_with_reason(&mut self, code: u16, reason: &[u8]) -> Result<(), EngineError> {
        if reason.len() > 123 {
            return Err(EngineError::BadInput)
        }
        if crate::utf8::validate_complete(reason).is_err() {
            return Err(EngineError::BadInput)
        }
        if !is_sendable_close_code(code) {
            return Err(EngineError::BadInput)
        }

        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => Ok(()),
            ConnectionState::Open => {
                self.enqueue_close(code, reason, BufferType::Close);
                self.sent_close = true;
                self.state = ConnectionState::Closing;
                // A locally-initiated close reports its own code immediately,
                // so it wins the tie-break if the peer's CLOSE is parsed
                // afterward (spec §4.4: "first delivered to on_close wins").
                if !self.close_code_reported {
                    self.close_code_reported = true;
                    self.callbacks.on_close(code, reason);
                }
                Ok(())
            }
            _ => Err(EngineError::BadState)
        }
    }

    fn enqueue_close(&mut self, code: u16, reason: &[u8], buf_type: BufferType) {
        self.send_control_frame_with_code(code, reason, buf_type)
    }

    fn send_control_frame(&mut self, opcode: OpCode, payload: &[u8], buf_type: BufferType) {
        let masked = self.role == Role::Client;
        let mask = if masked { self.random_u32().to_ne_bytes() } else { [0; 4] };
        let mut header = Header::new(opcode, payload.len() as u64);
        if masked {
            header.set_mask(mask);
        }
        let header_len = header.encoded_len();
        let total = header_len + payload.len();
        let frame_codec = self.frame_codec;
        let _ = self.callbacks.on_buffer_send(buf_type, total, &mut |buf| {
            if buf.len() < total {
                return 0
            }
            let mut hdr_bytes = [0u8; MAX_HEADER_SIZE];
            let n = frame_codec.encode_header(&header, &mut hdr_bytes);
            buf[.. n].copy_from_slice(&hdr_bytes[.. n]);
            buf[n .. n + payload.len()].copy_from_slice(payload);
            if masked {
                FrameCodec::apply_mask(mask, &mut buf[n .. n + payload.len()]);
            }
            n + payload.len()
        });
    }

    fn send_control_frame_with_code(&mut self, code: u16, reason: &[u8], buf_type: BufferType) {
        let mut payload = SmallVec::<[u8; 125]>::new();
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason);
        self.send_control_frame(OpCode::Close, &payload, buf_type);
    }
}

impl<'h, H: HostCallbacks> std::fmt::Debug for Engine<'h, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("url", &self.url)
            .finish()
    }
}

fn frame_error_close_code(e: &FrameError) -> u16 {
    match e {
        FrameError::ReservedBitsSet => 1002,
        FrameError::UnknownOpCode(_) => 1002,
        FrameError::ControlFrameTooLarge => 1002,
        FrameError::FragmentedControlFrame => 1002,
        FrameError::ReservedOpCode(_) => 1003,
        FrameError::InvalidPayloadLength => 1002
    }
}

/// CLOSE frame payload must be empty, or a 2-byte code plus UTF-8 reason
/// (spec §3). Returns the code (defaulting implicitly to none-sent by the
/// caller treating empty as "no code") and the reason slice.
fn parse_close_payload(payload: &[u8]) -> Result<(u16, &[u8]), u16> {
    if payload.is_empty() {
        return Ok((1005, &[]))
    }
    if payload.len() == 1 {
        return Err(1002)
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = &payload[2 ..];
    if crate::utf8::validate_complete(reason).is_err() {
        return Err(1007)
    }
    if !is_valid_received_code(code) {
        return Err(1002)
    }
    Ok((code, reason))
}

fn is_valid_received_code(code: u16) -> bool {
    matches!(code, 1000 ..= 1003 | 1007 ..= 1011) || (3000 ..= 4999).contains(&code)
}

/// Codes the engine itself may place on the wire (spec §3): 1004/1005/1006/1015
/// are meaningless without a frame and must never be sent.
fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000 ..= 1003 | 1007 ..= 1011) || (3000 ..= 4999).contains(&code)
}

/// Derive the code to echo back for a received CLOSE, per spec §4.3 /
/// grounded in the teacher's `close_answer`.
fn close_answer(code: u16) -> u16 {
    if code == 1005 || is_sendable_close_code(code) {
        1000
    } else {
        1002
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::buffer::HostCallbacks;

    struct TestHost {
        sent: Vec<(BufferType, Vec<u8>)>,
        opened: bool,
        closed: Option<(u16, Vec<u8>)>,
        texts: Vec<(bool, Vec<u8>)>,
        next_rand: u32
    }

    impl TestHost {
        fn new() -> Self {
            TestHost { sent: Vec::new(), opened: false, closed: None, texts: Vec::new(), next_rand: 1 }
        }
    }

    impl HostCallbacks for TestHost {
        fn on_buffer_send(&mut self, buf_type: BufferType, min_size: usize, f: &mut dyn FnMut(&mut [u8]) -> usize) -> bool {
            let mut buf = vec![0u8; min_size.max(256)];
            let n = f(&mut buf);
            buf.truncate(n);
            self.sent.push((buf_type, buf));
            true
        }

        fn on_close_transport(&mut self) {}

        fn rand(&mut self) -> u32 {
            self.next_rand
        }

        fn on_open(&mut self) {
            self.opened = true;
        }

        fn on_close(&mut self, code: u16, reason: &[u8]) {
            self.closed = Some((code, reason.to_vec()));
        }

        fn on_text(&mut self, fin: bool, data: &[u8]) -> bool {
            self.texts.push((fin, data.to_vec()));
            true
        }
    }

    fn client_engine(buf: &mut [u8]) -> Engine<'_, TestHost> {
        let url = Url::parse("ws://example.com/chat").unwrap();
        Engine::new(Role::Client, url, buf, TestHost::new())
    }

    #[derive(Debug)]
    struct NoopExtension;

    impl crate::extension::Extension for NoopExtension {
        fn is_enabled(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "noop"
        }

        fn params(&self) -> &[crate::extension::Param] {
            &[]
        }

        fn configure(&mut self, _params: &[crate::extension::Param]) -> Result<(), Box<dyn std::error::Error + Send>> {
            Ok(())
        }

        fn encode(&mut self, _opcode: OpCode, _payload: &mut [u8]) -> Result<(), Box<dyn std::error::Error + Send>> {
            Ok(())
        }

        fn decode(&mut self, _opcode: OpCode, _payload: &mut [u8]) -> Result<(), Box<dyn std::error::Error + Send>> {
            Ok(())
        }
    }

    #[test]
    fn with_extension_registers_it_for_later_retrieval() {
        let mut buf = [0u8; 512];
        let e = client_engine(&mut buf).with_extension(Box::new(NoopExtension));
        assert_eq!(e.extensions().len(), 1);
        assert_eq!(e.extensions()[0].name(), "noop");
    }

    #[test]
    fn s1_handshake_transitions_to_open() {
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        e.start().unwrap();
        let (_, req) = e.callbacks.sent.last().unwrap();
        let req_text = std::str::from_utf8(req).unwrap();
        assert!(req_text.starts_with("GET /chat HTTP/1.1\r\n"));

        // Extract the nonce the engine generated and build a valid response.
        let nonce_line = req_text.lines().find(|l| l.starts_with("Sec-WebSocket-Key: ")).unwrap();
        let nonce = nonce_line.trim_start_matches("Sec-WebSocket-Key: ");

        let mut expected = [0u8; 28];
        let accept_len = {
            let mut hasher = sha1::Sha1::new();
            hasher.update(nonce.as_bytes());
            hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
            base64::encode_config_slice(&hasher.digest().bytes(), base64::STANDARD, &mut expected)
        };
        let accept = std::str::from_utf8(&expected[.. accept_len]).unwrap();

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept
        );
        let consumed = e.parse(response.as_bytes()).unwrap();
        assert_eq!(consumed, response.len());
        assert_eq!(e.state(), ConnectionState::Open);
        assert!(e.callbacks.opened);
    }

    #[test]
    fn s2_echo_text_delivers_hello() {
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        // The canonical RFC6455 example is a masked client->server frame,
        // so the receiving side must be in the server role to accept it.
        e.role = Role::Server;
        e.state = ConnectionState::Open;
        let masked_hello = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let consumed = e.parse(&masked_hello).unwrap();
        assert_eq!(consumed, masked_hello.len());
        assert_eq!(e.callbacks.texts, vec![(true, b"Hello".to_vec())]);
    }

    #[test]
    fn s3_fragmented_utf8_reassembles() {
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        // Unmasked fragments, so receive as the client role.
        e.state = ConnectionState::Open;
        let frag1 = [0x01, 0x01, 0xc2];
        let frag2 = [0x80, 0x01, 0xa2];
        e.parse(&frag1).unwrap();
        e.parse(&frag2).unwrap();
        assert_eq!(e.callbacks.texts, vec![(false, vec![0xc2]), (true, vec![0xa2])]);
    }

    #[test]
    fn s4_invalid_utf8_closes_with_1007() {
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        e.state = ConnectionState::Open;
        let frame = [0x81, 0x02, 0xc0, 0xaf];
        e.parse(&frame).unwrap();
        assert_eq!(e.state(), ConnectionState::Closing);
        assert_eq!(e.callbacks.texts.len(), 0);
    }

    #[test]
    fn s5_redirect_reports_location_and_closes() {
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        e.state = ConnectionState::Ready;
        let resp = b"HTTP/1.1 302 Found\r\nLocation: ws://other/\r\n\r\n";
        e.parse(resp).unwrap();
        assert_eq!(e.state(), ConnectionState::Closed);
        assert_eq!(e.redirect_url().unwrap().to_string(), "ws://other/");
    }

    #[test]
    fn close_derivation_echoes_valid_codes_and_maps_others_to_1002() {
        assert_eq!(close_answer(1000), 1000);
        assert_eq!(close_answer(1001), 1000);
        assert_eq!(close_answer(1005), 1000);
        assert_eq!(close_answer(4000), 1000);
        assert_eq!(close_answer(9999), 1002);
    }

    #[test]
    fn close_is_idempotent_once_closing() {
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        e.state = ConnectionState::Open;
        e.close().unwrap();
        assert_eq!(e.state(), ConnectionState::Closing);
        e.close().unwrap();
        assert_eq!(e.state(), ConnectionState::Closing);
    }

    #[test]
    fn locally_initiated_close_wins_the_code_race_against_a_later_peer_close() {
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        e.state = ConnectionState::Open;

        // Locally initiate the close first...
        e.close_with_reason(4000, b"bye").unwrap();
        assert_eq!(e.callbacks.closed, Some((4000, b"bye".to_vec())));

        // ...then the peer's own CLOSE (code 1000, unmasked, client role) arrives.
        let peer_close = [0x88, 0x02, 0x03, 0xe8];
        e.parse(&peer_close).unwrap();

        // spec §4.4: "first delivered to on_close wins" - the locally-chosen
        // 4000 must still be what the host was told, not the peer's 1000.
        assert_eq!(e.callbacks.closed, Some((4000, b"bye".to_vec())));
    }

    #[test]
    fn send_rejects_when_not_open() {
        let _ = env_logger::try_init();
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        assert_matches!(e.send_text(true, b"hi"), Err(EngineError::BadState));
    }

    #[test]
    fn fragmented_send_uses_continuation_opcode_on_the_wire() {
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        e.state = ConnectionState::Open;
        e.send_text(false, b"hel").unwrap();
        e.send_text(true, b"lo").unwrap();

        let frames: Vec<_> = e.callbacks.sent.iter().map(|(_, bytes)| bytes[0] & 0x0f).collect();
        assert_eq!(frames, vec![u8::from(OpCode::Text), u8::from(OpCode::Continue)]);
        // Second frame has FIN set.
        assert_eq!(e.callbacks.sent[1].1[0] & 0x80, 0x80);
    }

    #[test]
    fn send_ping_enqueues_a_ping_frame() {
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        e.state = ConnectionState::Open;
        e.send_ping(b"abc").unwrap();
        let (buf_type, bytes) = e.callbacks.sent.last().unwrap();
        assert_eq!(*buf_type, BufferType::Ping);
        assert_eq!(bytes[0] & 0x0f, u8::from(OpCode::Ping));
    }

    #[test]
    fn send_ping_rejects_oversized_payload() {
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        e.state = ConnectionState::Open;
        let payload = vec![0u8; 126];
        assert_matches!(e.send_ping(&payload), Err(EngineError::TooLarge));
    }

    #[test]
    fn fragmented_send_rejects_mismatched_opcode_mid_message() {
        let mut buf = [0u8; 512];
        let mut e = client_engine(&mut buf);
        e.state = ConnectionState::Open;
        e.send_text(false, b"hel").unwrap();
        assert!(matches!(e.send_binary(true, b"lo"), Err(EngineError::BadState)));
    }

    quickcheck::quickcheck! {
        // Spec §8, property 3: splitting the inbound byte stream at any
        // point produces the same delivered text as feeding it whole.
        fn parse_is_split_invariant(text: String, split_at: u8) -> bool {
            let text = if text.len() > 400 { text[.. 400].to_string() } else { text };
            let mut frame = vec![0x81u8];
            let len = text.len();
            if len <= 125 {
                frame.push(len as u8);
            } else if len <= 65535 {
                frame.push(126);
                frame.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                frame.push(127);
                frame.extend_from_slice(&(len as u64).to_be_bytes());
            }
            frame.extend_from_slice(text.as_bytes());

            let whole = {
                let mut buf = vec![0u8; frame.len() + 16];
                let mut e = Engine::new(Role::Client, Url::parse("ws://x/").unwrap(), &mut buf, TestHost::new());
                e.state = ConnectionState::Open;
                e.parse(&frame).unwrap();
                e.callbacks.texts.clone()
            };

            let split = {
                let mut buf = vec![0u8; frame.len() + 16];
                let mut e = Engine::new(Role::Client, Url::parse("ws://x/").unwrap(), &mut buf, TestHost::new());
                e.state = ConnectionState::Open;
                let k = if frame.is_empty() { 0 } else { (split_at as usize) % frame.len() };
                e.parse(&frame[.. k]).unwrap();
                e.parse(&frame[k ..]).unwrap();
                e.callbacks.texts.clone()
            };

            whole == split
        }
    }
}
