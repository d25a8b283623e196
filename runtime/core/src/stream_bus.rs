// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! The bridge to host process by JSON object per line.
//!
//! Inbound frames are requests to verbs, replies to outbound calls, and events. Outbound frames
//! are calls to the other services and replies to requests.

use {
    super::{engine::*, error::*, request::*, router::*},
    glib::Error,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    std::{cell::RefCell, io::Write, rc::Rc},
    tracing::{debug, warn},
};

pub type SharedWriter = Rc<RefCell<dyn Write>>;

/// The frame from host process.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum HostFrame {
    Request {
        request: u64,
        verb: String,
        #[serde(default)]
        args: Value,
    },
    Reply {
        reply: u64,
        #[serde(default)]
        error: bool,
        #[serde(default)]
        result: Value,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

impl HostFrame {
    pub fn parse(line: &str) -> Result<Self, Error> {
        serde_json::from_str(line).map_err(|e| {
            let msg = format!("malformed frame: {}: {}", e, line);
            Error::new(HalError::Decode, &msg)
        })
    }
}

#[derive(Serialize, Debug)]
struct CallFrame<'a> {
    call: u64,
    api: &'a str,
    verb: &'a str,
    args: &'a Value,
}

#[derive(Serialize, Debug)]
struct ReplyFrame<'a> {
    reply_to: u64,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    info: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<&'a Value>,
}

fn write_frame<T: Serialize>(writer: &SharedWriter, frame: &T) -> std::io::Result<()> {
    let mut w = writer.borrow_mut();
    serde_json::to_writer(&mut *w, frame)?;
    w.write_all(b"\n")?;
    w.flush()
}

/// The transport over the stream to host process.
pub struct StreamBus {
    apis: Vec<String>,
    writer: SharedWriter,
}

impl StreamBus {
    pub fn new(apis: &[String], writer: SharedWriter) -> Self {
        Self {
            apis: apis.to_vec(),
            writer,
        }
    }

    /// Create request, whose reply is written to the stream.
    pub fn request(&self, id: u64, verb: &str, args: Value) -> Request {
        let writer = self.writer.clone();
        Request::new(verb, args, move |reply| {
            let frame = match &reply {
                Reply::Success { response, info } => ReplyFrame {
                    reply_to: id,
                    status: reply.status(),
                    info: info.as_deref(),
                    response: response.as_ref(),
                },
                Reply::Failure { status, info } => ReplyFrame {
                    reply_to: id,
                    status: status.as_str(),
                    info: Some(info.as_str()),
                    response: None,
                },
            };
            if let Err(e) = write_frame(&writer, &frame) {
                warn!(reply_to = id, "fail to write reply: {}", e);
            }
        })
    }

    /// Dispatch the frame to the engine.
    pub fn handle_frame<M>(&mut self, engine: &mut HalEngine<M>, line: &str)
    where
        M: CtlModel + TransportModel,
    {
        match HostFrame::parse(line) {
            Ok(HostFrame::Request { request, verb, args }) => {
                debug!(request, verb = verb.as_str());
                let req = self.request(request, &verb, args);
                engine.handle_request(self, req);
            }
            Ok(HostFrame::Reply {
                reply,
                error,
                result,
            }) => {
                let outcome = CallOutcome { is_error: error, result };
                engine.handle_reply(self, CallToken::from_raw(reply), outcome);
            }
            Ok(HostFrame::Event { event, data }) => engine.handle_event(&event, &data),
            Err(err) => warn!("{}", err),
        }
    }
}

impl ServiceBus for StreamBus {
    fn has_api(&self, api: &str) -> bool {
        self.apis.iter().any(|a| a == api)
    }

    fn call(&mut self, token: CallToken, api: &str, verb: &str, args: Value) -> Result<(), Error> {
        if !self.has_api(api) {
            let msg = format!("{} is not reachable", api);
            return Err(Error::new(HalError::TransportUnavailable, &msg));
        }

        let frame = CallFrame {
            call: token.raw(),
            api,
            verb,
            args: &args,
        };
        write_frame(&self.writer, &frame).map_err(|e| {
            let msg = format!("fail to write call to {}/{}: {}", api, verb, e);
            Error::new(HalError::TransportUnavailable, &msg)
        })
    }
}

/// The buffer to split bytes from the stream into lines.
#[derive(Default, Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    // The bytes before the offset include no terminator.
    scanned: usize,
    // The rest of line over the limit is discarded till the next terminator.
    discarding: bool,
}

impl LineBuffer {
    /// The maximum length of line, excluding terminator.
    pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

    /// Split lines. The line over the limit is dropped as decode error.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<String, Error>> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf[self.scanned..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| self.scanned + pos)
        {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
            } else if pos > Self::MAX_LINE_LENGTH {
                lines.push(Err(Self::overflow_error()));
            } else {
                let line = String::from_utf8_lossy(&raw[..pos]).trim().to_string();
                if !line.is_empty() {
                    lines.push(Ok(line));
                }
            }
        }

        if self.buf.len() > Self::MAX_LINE_LENGTH {
            if !self.discarding {
                lines.push(Err(Self::overflow_error()));
                self.discarding = true;
            }
            self.buf.clear();
        }
        self.scanned = self.buf.len();

        lines
    }

    /// Take the rest without terminator at the end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }

    fn overflow_error() -> Error {
        let msg = format!("line exceeds {} bytes", Self::MAX_LINE_LENGTH);
        Error::new(HalError::Decode, &msg)
    }
}
