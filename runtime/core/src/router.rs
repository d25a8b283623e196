// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Correlation of outbound calls with their completions, and routing of inbound events.
//!
//! Any outbound call to the other service is issued by [`Router::call_async()`] with context
//! of the caller. The context is kept in the router till the completion of call, then returned
//! back to the caller exactly once. When the call can not be issued at all, the router queues
//! failure instead, thus the completion is never lost.

use {
    glib::Error,
    serde_json::{json, Value},
    std::collections::{BTreeMap, VecDeque},
    tracing::{debug, warn},
};

/// The opaque token to correlate outbound call with its completion.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CallToken(u64);

impl CallToken {
    /// For transports to carry the token.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The result of outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub is_error: bool,
    pub result: Value,
}

impl CallOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            is_error: false,
            result,
        }
    }

    pub fn failure(result: Value) -> Self {
        Self {
            is_error: true,
            result,
        }
    }

    /// The "response" member of result.
    pub fn response(&self) -> Option<&Value> {
        self.result.get("response").filter(|resp| !resp.is_null())
    }

    /// The "info" member in "request" member of result.
    pub fn info(&self) -> Option<&str> {
        self.result
            .get("request")
            .and_then(|req| req.get("info"))
            .and_then(|info| info.as_str())
    }
}

/// The transport to the other services, reachable by name of API.
pub trait ServiceBus {
    /// Whether the API is reachable.
    fn has_api(&self, api: &str) -> bool;

    /// Issue the call. The completion is expected later with the same token.
    fn call(&mut self, token: CallToken, api: &str, verb: &str, args: Value) -> Result<(), Error>;
}

#[derive(Debug)]
struct PendingCall<C> {
    api: String,
    verb: String,
    context: C,
}

/// The table of pending calls.
#[derive(Debug)]
pub struct Router<C> {
    next_token: u64,
    pending: BTreeMap<CallToken, PendingCall<C>>,
    ready: VecDeque<CallToken>,
    failures: BTreeMap<CallToken, CallOutcome>,
}

impl<C> Default for Router<C> {
    fn default() -> Self {
        Self {
            next_token: 1,
            pending: Default::default(),
            ready: Default::default(),
            failures: Default::default(),
        }
    }
}

impl<C> Router<C> {
    pub fn call_async(
        &mut self,
        bus: &mut dyn ServiceBus,
        api: &str,
        verb: &str,
        args: Value,
        context: C,
    ) -> CallToken {
        let token = CallToken(self.next_token);
        self.next_token += 1;

        self.pending.insert(
            token,
            PendingCall {
                api: api.to_string(),
                verb: verb.to_string(),
                context,
            },
        );

        let res = bus.call(token, api, verb, args);
        debug!(token = token.0, api, verb, ?res);

        if let Err(err) = res {
            warn!(token = token.0, api, verb, "fail to issue call: {}", err);
            let outcome = CallOutcome::failure(json!({
                "error": err.message(),
                "api": api,
                "verb": verb,
            }));
            self.failures.insert(token, outcome);
            self.ready.push_back(token);
        }

        token
    }

    /// Take the context for the completion. Unknown or already completed token is dropped.
    pub fn complete(&mut self, token: CallToken, outcome: CallOutcome) -> Option<(C, CallOutcome)> {
        match self.pending.remove(&token) {
            Some(call) => {
                debug!(
                    token = token.0,
                    api = call.api.as_str(),
                    verb = call.verb.as_str(),
                    is_error = outcome.is_error
                );
                // The completion from transport wins over the queued failure.
                if self.failures.remove(&token).is_some() {
                    self.ready.retain(|t| *t != token);
                }
                Some((call.context, outcome))
            }
            None => {
                warn!(token = token.0, "completion for unknown call is dropped");
                None
            }
        }
    }

    /// Take the context for the call which the transport refused.
    pub fn take_ready(&mut self) -> Option<(C, CallOutcome)> {
        let token = self.ready.pop_front()?;
        let outcome = self.failures.remove(&token)?;
        self.complete(token, outcome)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, token: CallToken) -> bool {
        self.pending.contains_key(&token)
    }
}

/// The ordered table of topic prefixes. The longest prefix matches at first.
#[derive(Debug)]
pub struct TopicRoutes<H: Copy> {
    routes: Vec<(String, H)>,
}

impl<H: Copy> Default for TopicRoutes<H> {
    fn default() -> Self {
        Self {
            routes: Default::default(),
        }
    }
}

impl<H: Copy> TopicRoutes<H> {
    pub fn add(&mut self, prefix: &str, handler: H) {
        self.routes.push((prefix.to_string(), handler));
        // Stable, thus the order of addition decides among prefixes with the same length.
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// The handler and the rest of topic after the prefix.
    pub fn route<'a>(&self, topic: &'a str) -> Option<(H, &'a str)> {
        self.routes.iter().find_map(|(prefix, handler)| {
            topic
                .strip_prefix(prefix.as_str())
                .map(|suffix| (*handler, suffix))
        })
    }
}
