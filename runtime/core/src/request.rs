// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Request delivered by the framework, answered exactly once.

use {
    super::error::*,
    glib::Error,
    serde_json::Value,
    tracing::warn,
};

/// The answer to request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success {
        response: Option<Value>,
        info: Option<String>,
    },
    Failure {
        status: String,
        info: String,
    },
}

impl Reply {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The status code; "success" or the code of failure.
    pub fn status(&self) -> &str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { status, .. } => status,
        }
    }
}

type Responder = Box<dyn FnOnce(Reply)>;

/// The request to verb. It is consumed by the reply, thus no request is answered twice. The
/// request dropped without any reply is answered as aborted.
pub struct Request {
    verb: String,
    args: Value,
    responder: Option<Responder>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("verb", &self.verb)
            .field("args", &self.args)
            .finish()
    }
}

impl Request {
    pub const ABORTED: &'static str = "aborted";

    pub fn new<F>(verb: &str, args: Value, responder: F) -> Self
    where
        F: FnOnce(Reply) + 'static,
    {
        Self {
            verb: verb.to_string(),
            args,
            responder: Some(Box::new(responder)),
        }
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    /// The value of argument, if the arguments are given as object.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    pub fn success(mut self, response: Option<Value>, info: Option<String>) {
        self.reply(Reply::Success { response, info });
    }

    pub fn fail(mut self, status: &str, info: &str) {
        self.reply(Reply::Failure {
            status: status.to_string(),
            info: info.to_string(),
        });
    }

    pub fn fail_with(self, error: &Error) {
        let status = error_status(error);
        self.fail(status, error.message());
    }

    fn reply(&mut self, reply: Reply) {
        if let Some(responder) = self.responder.take() {
            responder(reply);
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.responder.is_some() {
            warn!(verb = self.verb.as_str(), "request is dropped without reply");
            self.reply(Reply::Failure {
                status: Self::ABORTED.to_string(),
                info: format!("{} is not answered", self.verb),
            });
        }
    }
}
