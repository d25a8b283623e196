// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Dispatch of verbs, completions and events for the sound card.
//!
//! The engine validates requests against the registry of controls, converts values by the
//! normalizer of sound card, then issues outbound calls to ALSA control service. A request
//! with any invalid entry is rejected as a whole, and no outbound call is issued for it.

use {
    super::{ctl_table::*, error::*, normalizer::*, registry::*, request::*, router::*},
    glib::Error,
    serde::Deserialize,
    serde_json::{json, Value},
    std::convert::TryFrom,
    tracing::{debug, debug_span, error, info, warn},
};

/// The name of API for ALSA control service.
pub const ALSACORE_API: &str = "alsacore";

const ALSACORE_TOPIC_PREFIX: &str = "alsacore/";

/// The status for unknown verb.
pub const VERB_UNKNOWN: &str = "verb-unknown";

/// The operation of sound card for its controls.
pub trait CtlModel {
    fn card(&self) -> &SoundCard;

    /// Notify the change of value. Return true when the model handles the control.
    fn write(&mut self, ctl: &ControlDescriptor, value: &NormalizedValue) -> Result<bool, Error>;
}

/// The operation of sound card for its transport service.
pub trait TransportModel {
    /// The context of outbound call issued by the model.
    type Context;

    /// The prefix of topic for events from the transport, like "UNICENS/".
    fn notified_topic_prefix(&self) -> &'static str;

    fn init(&mut self, outbound: &mut Outbound<Self::Context>) -> Result<(), Error>;

    fn parse_notification(&mut self, topic: &str, payload: &Value) -> Result<(), Error>;

    fn call_completed(
        &mut self,
        context: Self::Context,
        outcome: CallOutcome,
        outbound: &mut Outbound<Self::Context>,
    ) -> Result<(), Error>;
}

/// The context of outbound call, resumed at completion.
#[derive(Debug)]
pub enum Continuation<T> {
    Registration(Value),
    CardValues,
    Subscription(Request),
    CtlGet { request: Request, tags: Vec<HalCtlTag> },
    CtlSet { request: Request, tag: HalCtlTag },
    Model(T),
}

/// The handle for the model to issue outbound calls.
pub struct Outbound<'a, T> {
    router: &'a mut Router<Continuation<T>>,
    bus: &'a mut dyn ServiceBus,
}

impl<'a, T> Outbound<'a, T> {
    pub fn has_api(&self, api: &str) -> bool {
        self.bus.has_api(api)
    }

    pub fn call(&mut self, api: &str, verb: &str, args: Value, context: T) -> CallToken {
        self.router
            .call_async(&mut *self.bus, api, verb, args, Continuation::Model(context))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum EventSource {
    AlsaCore,
    Transport,
}

/// The values of control element, reported by ALSA control service.
#[derive(Deserialize, Debug)]
struct CtlValues {
    id: u32,
    val: Vec<i32>,
}

/// The control element resolved by ALSA control service at registration.
#[derive(Deserialize, Debug)]
struct ResolvedCtl {
    name: String,
    numid: u32,
}

pub struct HalEngine<M>
where
    M: CtlModel + TransportModel,
{
    api: String,
    registry: Registry,
    router: Router<Continuation<M::Context>>,
    routes: TopicRoutes<EventSource>,
    model: M,
}

impl<M> HalEngine<M>
where
    M: CtlModel + TransportModel,
{
    pub fn new(api: &str, model: M) -> Result<Self, Error> {
        let registry = Registry::register(model.card().ctls)?;

        let mut routes = TopicRoutes::default();
        routes.add(ALSACORE_TOPIC_PREFIX, EventSource::AlsaCore);
        routes.add(model.notified_topic_prefix(), EventSource::Transport);

        Ok(Self {
            api: api.to_string(),
            registry,
            router: Default::default(),
            routes,
            model,
        })
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pending_count(&self) -> usize {
        self.router.pending_count()
    }

    fn normalizer(&self) -> &dyn ValueNormalizer {
        static LINEAR: LinearNormalizer = LinearNormalizer;
        self.model.card().normalizer.as_deref().unwrap_or(&LINEAR)
    }

    /// Register the sound card to ALSA control service, then initialize the model.
    pub fn init(&mut self, bus: &mut dyn ServiceBus) -> Result<(), Error> {
        let _enter = debug_span!("init").entered();

        if !bus.has_api(ALSACORE_API) {
            let msg = format!("{} API is not available", ALSACORE_API);
            return Err(Error::new(HalError::Init, &msg));
        }

        let query = json!({
            "prefix": self.api,
            "name": self.model.card().name,
        });
        self.router.call_async(
            bus,
            ALSACORE_API,
            "registerHal",
            query.clone(),
            Continuation::Registration(query),
        );

        let mut outbound = Outbound {
            router: &mut self.router,
            bus: &mut *bus,
        };
        self.model.init(&mut outbound)?;

        self.drain_ready(bus);

        Ok(())
    }

    pub fn handle_request(&mut self, bus: &mut dyn ServiceBus, request: Request) {
        let verb = request.verb().to_string();
        let _enter = debug_span!("request", verb = verb.as_str()).entered();

        match verb.as_str() {
            "ping" => {
                let args = request.args().clone();
                request.success(Some(args), None);
            }
            "getcontrol" => match parse_ctl_list(request.args()) {
                Ok((devid, tags)) => {
                    self.get_control(bus, &devid, &tags, request);
                }
                Err(err) => request.fail_with(&err),
            },
            "setvolume" => match self.parse_volume(request.args()) {
                Ok((tag, value)) => {
                    self.set_control(bus, tag, value, request);
                }
                Err(err) => request.fail_with(&err),
            },
            "getvolume" => match parse_pcm(request.args()) {
                Ok(tag) => {
                    let devid = self.model.card().devid;
                    self.get_control(bus, devid, &[tag], request);
                }
                Err(err) => request.fail_with(&err),
            },
            "subscribe" => self.subscribe(bus, request),
            _ => {
                let msg = format!("{} is not available", verb);
                request.fail(VERB_UNKNOWN, &msg);
            }
        }

        self.drain_ready(bus);
    }

    /// Read current values of the controls. The whole batch is rejected when any control is
    /// invalid.
    pub fn get_control(
        &mut self,
        bus: &mut dyn ServiceBus,
        devid: &str,
        tags: &[HalCtlTag],
        request: Request,
    ) -> Option<CallToken> {
        let res = {
            let _enter = debug_span!("validate").entered();
            self.validate_ctl_list(bus, devid, tags)
        };

        match res {
            Ok(ctls) => {
                let _enter = debug_span!("dispatch").entered();
                let args = json!({
                    "devid": devid,
                    "mode": 0,
                    "ctl": ctls,
                });
                let cont = Continuation::CtlGet {
                    request,
                    tags: tags.to_vec(),
                };
                Some(self.router.call_async(bus, ALSACORE_API, "ctlget", args, cont))
            }
            Err(err) => {
                debug!(devid, "rejected: {}", err);
                request.fail_with(&err);
                None
            }
        }
    }

    fn validate_ctl_list(
        &self,
        bus: &dyn ServiceBus,
        devid: &str,
        tags: &[HalCtlTag],
    ) -> Result<Vec<Value>, Error> {
        if !self.model.card().matches(devid) {
            let msg = format!("devid={} is not for {}", devid, self.model.card().name);
            return Err(Error::new(HalError::UnknownDevice, &msg));
        }

        let ctls = tags
            .iter()
            .map(|&tag| {
                let ctl = self.lookup_ctl(tag)?;
                if !ctl.access.readable() {
                    let msg = format!("{} is not readable", tag.label());
                    Err(Error::new(HalError::AccessDenied, &msg))
                } else {
                    Ok(self.ctl_ident(ctl))
                }
            })
            .collect::<Result<Vec<Value>, Error>>()?;

        check_transport(bus)?;

        Ok(ctls)
    }

    /// Change the value of control. The result is delivered to the request later.
    pub fn set_control(
        &mut self,
        bus: &mut dyn ServiceBus,
        tag: HalCtlTag,
        value: NormalizedValue,
        request: Request,
    ) -> Option<CallToken> {
        let res = self.prepare_ctl_value(bus, tag, &value);

        match res {
            Ok((ctl, raw)) => {
                let enter = debug_span!("callback").entered();
                match self.model.write(ctl, &value) {
                    Ok(handled) => debug!(tag = tag.label(), ?value, handled),
                    Err(err) => warn!(tag = tag.label(), "value callback fails: {}", err),
                }
                enter.exit();

                let _enter = debug_span!("dispatch").entered();
                let mut ident = self.ctl_ident(ctl);
                ident["val"] = json!(raw);
                let args = json!({
                    "devid": self.model.card().devid,
                    "ctl": ident,
                });
                let cont = Continuation::CtlSet { request, tag };
                Some(self.router.call_async(bus, ALSACORE_API, "ctlset", args, cont))
            }
            Err(err) => {
                debug!(tag = tag.label(), "rejected: {}", err);
                request.fail_with(&err);
                None
            }
        }
    }

    fn prepare_ctl_value(
        &self,
        bus: &dyn ServiceBus,
        tag: HalCtlTag,
        value: &NormalizedValue,
    ) -> Result<(&'static ControlDescriptor, Vec<i32>), Error> {
        let enter = debug_span!("validate").entered();
        let ctl = self.lookup_ctl(tag)?;
        if !ctl.access.writable() {
            let msg = format!("{} is not writable", tag.label());
            return Err(Error::new(HalError::AccessDenied, &msg));
        }
        enter.exit();

        let enter = debug_span!("convert").entered();
        let raw = self.normalizer().to_device(ctl, value)?;
        debug!(tag = tag.label(), ?raw);
        enter.exit();

        check_transport(bus)?;

        Ok((ctl, raw))
    }

    fn subscribe(&mut self, bus: &mut dyn ServiceBus, request: Request) {
        let res = request
            .value("devid")
            .and_then(|devid| devid.as_str())
            .ok_or_else(|| Error::new(HalError::DevidMissing, "devid=hw:xxx missing"))
            .and_then(|devid| {
                if self.model.card().matches(devid) {
                    Ok(())
                } else {
                    let msg = format!("devid={} is not for {}", devid, self.model.card().name);
                    Err(Error::new(HalError::UnknownDevice, &msg))
                }
            })
            .and_then(|_| check_transport(bus));

        match res {
            Ok(_) => {
                let args = request.args().clone();
                self.router.call_async(
                    bus,
                    ALSACORE_API,
                    "subctl",
                    args,
                    Continuation::Subscription(request),
                );
            }
            Err(err) => request.fail_with(&err),
        }
    }

    fn lookup_ctl(&self, tag: HalCtlTag) -> Result<&'static ControlDescriptor, Error> {
        self.registry.lookup_by_tag(tag).ok_or_else(|| {
            let msg = format!("{} is not available in {}", tag.label(), self.model.card().name);
            Error::new(HalError::UnknownControl, &msg)
        })
    }

    fn ctl_ident(&self, ctl: &ControlDescriptor) -> Value {
        match self.registry.numid(ctl.tag) {
            Some(numid) => json!({ "id": numid }),
            None => json!({ "name": ctl.name }),
        }
    }

    fn parse_volume(&self, args: &Value) -> Result<(HalCtlTag, NormalizedValue), Error> {
        let tag = parse_pcm(args)?;
        let vol = args
            .get("vol")
            .filter(|vol| !vol.is_null())
            .ok_or_else(|| Error::new(HalError::ArgumentMissing, "vol=[0,100] missing"))?;
        let ctl = self.lookup_ctl(tag)?;

        let mut levels = parse_levels(vol)?;
        // A single level is for all channels.
        if levels.len() == 1 && ctl.count > 1 {
            levels = vec![levels[0]; ctl.count];
        }

        Ok((tag, NormalizedValue::Level(levels)))
    }

    /// Handle completion of outbound call from the transport.
    pub fn handle_reply(&mut self, bus: &mut dyn ServiceBus, token: CallToken, outcome: CallOutcome) {
        let _enter = debug_span!("reply", token = token.raw()).entered();

        if let Some((context, outcome)) = self.router.complete(token, outcome) {
            self.fire(bus, context, outcome);
        }

        self.drain_ready(bus);
    }

    fn drain_ready(&mut self, bus: &mut dyn ServiceBus) {
        while let Some((context, outcome)) = self.router.take_ready() {
            self.fire(bus, context, outcome);
        }
    }

    fn fire(
        &mut self,
        bus: &mut dyn ServiceBus,
        context: Continuation<M::Context>,
        outcome: CallOutcome,
    ) {
        match context {
            Continuation::Registration(query) => self.registered(bus, &query, &outcome),
            Continuation::CardValues => self.card_values_arrived(&outcome),
            Continuation::Subscription(request) => subscribed(request, &outcome),
            Continuation::CtlGet { request, tags } => self.ctl_values_arrived(request, &tags, &outcome),
            Continuation::CtlSet { request, tag } => ctl_value_changed(request, tag, &outcome),
            Continuation::Model(context) => {
                let mut outbound = Outbound {
                    router: &mut self.router,
                    bus,
                };
                if let Err(err) = self.model.call_completed(context, outcome, &mut outbound) {
                    error!("completion of transport call fails: {}", err);
                }
            }
        }
    }

    fn registered(&mut self, bus: &mut dyn ServiceBus, query: &Value, outcome: &CallOutcome) {
        if outcome.is_error {
            warn!("registration alsaHAL query=[{}] Fail", query);
        } else {
            debug!("registration alsaHAL card=[{}] Success", query);

            if let Some(Value::Array(entries)) = outcome.response() {
                entries.iter().for_each(|entry| {
                    let res = ResolvedCtl::deserialize(entry)
                        .map_err(|e| Error::new(HalError::Decode, &e.to_string()))
                        .and_then(|resolved| {
                            match self.registry.lookup_by_name(&resolved.name) {
                                Some(ctl) => self.registry.resolve_numid(ctl.tag, resolved.numid),
                                None => Ok(()),
                            }
                        });
                    if let Err(err) = res {
                        warn!("fail to resolve numid: {}", err);
                    }
                });
            }
        }

        self.registry.seal();

        if !outcome.is_error {
            let args = json!({
                "devid": self.model.card().devid,
                "mode": 0,
            });
            self.router
                .call_async(bus, ALSACORE_API, "ctlget", args, Continuation::CardValues);
        }
    }

    fn card_values_arrived(&mut self, outcome: &CallOutcome) {
        if outcome.is_error {
            warn!("fail to request card values: {}", outcome.result);
            return;
        }

        match outcome.response() {
            Some(Value::Array(entries)) => entries.iter().for_each(|entry| {
                if let Err(err) = self.apply_ctl_values(entry) {
                    warn!("{}", err);
                }
            }),
            Some(entry @ Value::Object(_)) => {
                if let Err(err) = self.apply_ctl_values(entry) {
                    warn!("{}", err);
                }
            }
            _ => error!("unknown response type: {}", outcome.result),
        }
    }

    fn ctl_values_arrived(&mut self, request: Request, tags: &[HalCtlTag], outcome: &CallOutcome) {
        if outcome.is_error {
            let info = outcome
                .info()
                .map(|info| info.to_string())
                .unwrap_or_else(|| outcome.result.to_string());
            request.fail(HalError::Remote.status(), &info);
            return;
        }

        match self.decode_ctl_values(tags, outcome) {
            Ok(values) => request.success(Some(Value::Array(values)), None),
            Err(err) => {
                warn!("{}", err);
                request.fail_with(&err);
            }
        }
    }

    fn decode_ctl_values(
        &self,
        tags: &[HalCtlTag],
        outcome: &CallOutcome,
    ) -> Result<Vec<Value>, Error> {
        let entries = match outcome.response() {
            Some(Value::Array(entries)) => entries.iter().collect::<Vec<&Value>>(),
            Some(entry @ Value::Object(_)) => vec![entry],
            _ => Vec::new(),
        };

        if entries.len() != tags.len() {
            let msg = format!(
                "{} values for {} controls: {}",
                entries.len(),
                tags.len(),
                outcome.result
            );
            return Err(Error::new(HalError::Decode, &msg));
        }

        tags.iter()
            .zip(entries)
            .map(|(&tag, entry)| {
                let values = CtlValues::deserialize(entry)
                    .map_err(|e| Error::new(HalError::Decode, &e.to_string()))?;
                let ctl = self.lookup_ctl(tag)?;
                if let Some(numid) = self.registry.numid(tag) {
                    if numid != values.id {
                        let msg = format!("numid {} for {}", values.id, tag.label());
                        return Err(Error::new(HalError::Decode, &msg));
                    }
                }
                let value = self.normalizer().to_abstract(ctl, &values.val)?;
                Ok(json!([tag.code(), value.to_json()]))
            })
            .collect()
    }

    /// Apply the values of control element to the model.
    fn apply_ctl_values(&mut self, payload: &Value) -> Result<(), Error> {
        let values = CtlValues::deserialize(payload).map_err(|e| {
            let msg = format!("{}: {}", e, payload);
            Error::new(HalError::Decode, &msg)
        })?;
        let ctl = self.registry.lookup_by_numid(values.id).ok_or_else(|| {
            let msg = format!("numid {} is not in the table", values.id);
            Error::new(HalError::Decode, &msg)
        })?;
        let value = self.normalizer().to_abstract(ctl, &values.val)?;
        let handled = self.model.write(ctl, &value)?;
        debug!(tag = ctl.tag.label(), ?value, handled);
        Ok(())
    }

    /// Handle event from the other services. Malformed event is dropped.
    pub fn handle_event(&mut self, topic: &str, payload: &Value) {
        let _enter = debug_span!("event", topic).entered();

        match self.routes.route(topic) {
            Some((EventSource::AlsaCore, _)) => {
                if let Err(err) = self.apply_ctl_values(payload) {
                    warn!(topic, "event is dropped: {}", err);
                }
            }
            Some((EventSource::Transport, suffix)) => {
                if let Err(err) = self.model.parse_notification(suffix, payload) {
                    warn!(topic, "event is dropped: {}", err);
                }
            }
            None => info!(topic, "unhandled event: {}", payload),
        }
    }
}

fn check_transport(bus: &dyn ServiceBus) -> Result<(), Error> {
    if bus.has_api(ALSACORE_API) {
        Ok(())
    } else {
        let msg = format!("{} API is not reachable", ALSACORE_API);
        Err(Error::new(HalError::TransportUnavailable, &msg))
    }
}

fn subscribed(request: Request, outcome: &CallOutcome) {
    let info = outcome.info().map(|info| info.to_string());
    info!(is_error = outcome.is_error, "result=[{}]", outcome.result);

    if outcome.is_error {
        let info = info.unwrap_or_else(|| outcome.result.to_string());
        request.fail(HalError::Remote.status(), &info);
    } else {
        request.success(outcome.response().cloned(), info);
    }
}

fn ctl_value_changed(request: Request, tag: HalCtlTag, outcome: &CallOutcome) {
    if outcome.is_error {
        let info = outcome
            .info()
            .map(|info| info.to_string())
            .unwrap_or_else(|| format!("{} is not changed: {}", tag.label(), outcome.result));
        request.fail(HalError::Remote.status(), &info);
    } else {
        request.success(None, None);
    }
}

/// Parse the arguments of "getcontrol"; the device and the list of [tag, value].
fn parse_ctl_list(args: &Value) -> Result<(String, Vec<HalCtlTag>), Error> {
    let devid = args
        .get("devid")
        .and_then(|devid| devid.as_str())
        .ok_or_else(|| {
            let msg = format!("No DevID given query=[{}]", args);
            Error::new(HalError::DevidMissing, &msg)
        })?;

    let ctls = args
        .get("ctls")
        .and_then(|ctls| ctls.as_array())
        .filter(|ctls| !ctls.is_empty())
        .ok_or_else(|| {
            let msg = format!("No Controls given query=[{}]", args);
            Error::new(HalError::CtlsNotFound, &msg)
        })?;

    let tags = ctls
        .iter()
        .map(|ctl| {
            ctl.as_array()
                .filter(|entry| entry.len() == 2)
                .and_then(|entry| entry[0].as_i64())
                .ok_or_else(|| {
                    let msg = format!("Invalid Control devid={} ctl=[{}]", devid, ctl);
                    Error::new(HalError::CtlInvalid, &msg)
                })
                .and_then(HalCtlTag::try_from)
        })
        .collect::<Result<Vec<HalCtlTag>, Error>>()?;

    Ok((devid.to_string(), tags))
}

fn parse_pcm(args: &Value) -> Result<HalCtlTag, Error> {
    let pcm = args
        .get("pcm")
        .and_then(|pcm| pcm.as_str())
        .unwrap_or("Master");

    match pcm {
        "Master" => Ok(HalCtlTag::MasterPlaybackVolume),
        "PCM" => Ok(HalCtlTag::PcmPlaybackVolume),
        "Capture" => Ok(HalCtlTag::CaptureVolume),
        _ => {
            let msg = format!("pcm={} is not available", pcm);
            Err(Error::new(HalError::CtlInvalid, &msg))
        }
    }
}

fn parse_levels(vol: &Value) -> Result<Vec<i32>, Error> {
    match vol {
        Value::Array(vals) => vals.iter().map(parse_level).collect(),
        _ => parse_level(vol).map(|level| vec![level]),
    }
}

fn parse_level(val: &Value) -> Result<i32, Error> {
    let level = match val {
        Value::Number(num) => num.as_i64(),
        Value::String(literal) => literal.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        let msg = format!("vol={} is not integer", val);
        Error::new(HalError::CtlInvalid, &msg)
    })?;

    i32::try_from(level).map_err(|_| {
        let msg = format!("vol={} is out of range", level);
        Error::new(HalError::OutOfRange, &msg)
    })
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{request::test::request, router::test::MockBus},
        std::{cell::RefCell, rc::Rc},
    };

    static TEST_CTLS: [ControlDescriptor; 4] = [
        ControlDescriptor {
            tag: HalCtlTag::MasterPlaybackVolume,
            numid: CtlNumid::Auto,
            group: CtlGroup::OutputVolume,
            elem_type: CtlElemType::Integer {
                min: 0,
                max: 100,
                step: 1,
            },
            count: 1,
            value: 50,
            name: "Master Playback Volume",
            info: "master",
            access: CtlAccess::ReadWrite,
        },
        ControlDescriptor {
            tag: HalCtlTag::PcmPlaybackVolume,
            numid: CtlNumid::Fixed(2),
            group: CtlGroup::PcmVolume,
            elem_type: CtlElemType::Integer {
                min: 0,
                max: 100,
                step: 1,
            },
            count: 6,
            value: 100,
            name: "PCM Playback Volume",
            info: "pcm",
            access: CtlAccess::ReadWrite,
        },
        ControlDescriptor {
            tag: HalCtlTag::MasterOnOffSwitch,
            numid: CtlNumid::Fixed(3),
            group: CtlGroup::Switch,
            elem_type: CtlElemType::Boolean,
            count: 1,
            value: 1,
            name: "Master Playback Switch",
            info: "switch",
            access: CtlAccess::ReadWrite,
        },
        ControlDescriptor {
            tag: HalCtlTag::CaptureVolume,
            numid: CtlNumid::Fixed(4),
            group: CtlGroup::InputVolume,
            elem_type: CtlElemType::Integer {
                min: 0,
                max: 255,
                step: 1,
            },
            count: 1,
            value: 0,
            name: "Capture Volume",
            info: "capture",
            access: CtlAccess::ReadOnly,
        },
    ];

    const DEVID: &str = "hw:9";

    #[derive(Debug)]
    struct TestModel {
        card: SoundCard,
        written: Vec<(HalCtlTag, NormalizedValue)>,
        notified: Vec<(String, Value)>,
        completed: Vec<(u32, CallOutcome)>,
    }

    impl TestModel {
        fn new(normalizer: Option<Box<dyn ValueNormalizer>>) -> Self {
            Self {
                card: SoundCard {
                    name: "Test Card",
                    devid: DEVID,
                    info: "",
                    ctls: &TEST_CTLS,
                    normalizer,
                },
                written: Default::default(),
                notified: Default::default(),
                completed: Default::default(),
            }
        }
    }

    impl CtlModel for TestModel {
        fn card(&self) -> &SoundCard {
            &self.card
        }

        fn write(&mut self, ctl: &ControlDescriptor, value: &NormalizedValue) -> Result<bool, Error> {
            self.written.push((ctl.tag, value.clone()));
            Ok(true)
        }
    }

    impl TransportModel for TestModel {
        type Context = u32;

        fn notified_topic_prefix(&self) -> &'static str {
            "TRANSPORT/"
        }

        fn init(&mut self, outbound: &mut Outbound<u32>) -> Result<(), Error> {
            if outbound.has_api("TRANSPORT") {
                outbound.call("TRANSPORT", "start", json!({}), 7);
            }
            Ok(())
        }

        fn parse_notification(&mut self, topic: &str, payload: &Value) -> Result<(), Error> {
            if payload.is_object() {
                self.notified.push((topic.to_string(), payload.clone()));
                Ok(())
            } else {
                Err(Error::new(HalError::Decode, "not object"))
            }
        }

        fn call_completed(
            &mut self,
            context: u32,
            outcome: CallOutcome,
            _: &mut Outbound<u32>,
        ) -> Result<(), Error> {
            self.completed.push((context, outcome));
            Ok(())
        }
    }

    /// Double the abstract level.
    #[derive(Debug)]
    struct DoublingNormalizer;

    impl ValueNormalizer for DoublingNormalizer {
        fn to_device(
            &self,
            ctl: &ControlDescriptor,
            value: &NormalizedValue,
        ) -> Result<Vec<i32>, Error> {
            match value {
                NormalizedValue::Level(vals) => vals
                    .iter()
                    .map(|&val| check_abstract_level(ctl, val).map(|_| val * 2))
                    .collect(),
                NormalizedValue::Switch(vals) => Ok(vals.iter().map(|&v| v as i32).collect()),
            }
        }

        fn to_abstract(
            &self,
            _: &ControlDescriptor,
            raw: &[i32],
        ) -> Result<NormalizedValue, Error> {
            Ok(NormalizedValue::Level(raw.iter().map(|&val| val / 2).collect()))
        }
    }

    fn engine() -> HalEngine<TestModel> {
        HalEngine::new("hal-test", TestModel::new(None)).unwrap()
    }

    fn last_reply(replies: &Rc<RefCell<Vec<Reply>>>) -> Reply {
        let replies = replies.borrow();
        assert_eq!(replies.len(), 1);
        replies[0].clone()
    }

    #[test]
    fn ping() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let (req, replies) = request("ping", json!({"hello": 1}));
        engine.handle_request(&mut bus, req);
        assert_eq!(
            last_reply(&replies),
            Reply::Success {
                response: Some(json!({"hello": 1})),
                info: None
            }
        );
        assert!(bus.calls.is_empty());
    }

    #[test]
    fn unknown_verb() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let (req, replies) = request("reboot", Value::Null);
        engine.handle_request(&mut bus, req);
        assert_eq!(last_reply(&replies).status(), VERB_UNKNOWN);
    }

    #[test]
    fn set_volume_out_of_range() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let (req, replies) = request("setvolume", json!({"vol": 150}));
        engine.handle_request(&mut bus, req);

        assert_eq!(last_reply(&replies).status(), "out-of-range");
        assert!(bus.calls.is_empty());
        assert!(engine.model().written.is_empty());
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn set_volume_missing() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let (req, replies) = request("setvolume", json!({"pcm": "Master"}));
        engine.handle_request(&mut bus, req);
        assert_eq!(last_reply(&replies).status(), "argument-missing");

        let (req, replies) = request("setvolume", json!({"pcm": "Surround", "vol": 10}));
        engine.handle_request(&mut bus, req);
        assert_eq!(last_reply(&replies).status(), "ctl-invalid");

        let (req, replies) = request("setvolume", json!({"vol": "loud"}));
        engine.handle_request(&mut bus, req);
        assert_eq!(last_reply(&replies).status(), "ctl-invalid");

        assert!(bus.calls.is_empty());
    }

    #[test]
    fn set_volume() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let (req, replies) = request("setvolume", json!({"vol": 50}));
        engine.handle_request(&mut bus, req);

        // Fire-and-forget; the reply comes with the completion.
        assert!(replies.borrow().is_empty());
        assert_eq!(bus.calls.len(), 1);
        let (token, api, verb, args) = bus.calls[0].clone();
        assert_eq!(api, ALSACORE_API);
        assert_eq!(verb, "ctlset");
        assert_eq!(
            args,
            json!({
                "devid": DEVID,
                "ctl": {"name": "Master Playback Volume", "val": [50]},
            })
        );
        assert_eq!(
            engine.model().written,
            vec![(
                HalCtlTag::MasterPlaybackVolume,
                NormalizedValue::Level(vec![50])
            )]
        );

        engine.handle_reply(&mut bus, token, CallOutcome::success(json!({"response": null})));
        assert_eq!(
            last_reply(&replies),
            Reply::Success {
                response: None,
                info: None
            }
        );
        assert_eq!(engine.pending_count(), 0);

        // The repeated completion is dropped.
        engine.handle_reply(&mut bus, token, CallOutcome::success(Value::Null));
        assert_eq!(replies.borrow().len(), 1);
    }

    #[test]
    fn set_pcm_volume_for_all_channels() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let (req, _) = request("setvolume", json!({"pcm": "PCM", "vol": "30"}));
        engine.handle_request(&mut bus, req);

        assert_eq!(bus.calls.len(), 1);
        assert_eq!(
            bus.calls[0].3,
            json!({"devid": DEVID, "ctl": {"id": 2, "val": [30, 30, 30, 30, 30, 30]}})
        );

        let (req, replies) = request("setvolume", json!({"pcm": "PCM", "vol": [1, 2, 3]}));
        engine.handle_request(&mut bus, req);
        assert_eq!(last_reply(&replies).status(), "ctl-invalid");
        assert_eq!(bus.calls.len(), 1);
    }

    #[test]
    fn set_control_read_only() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let (req, replies) = request("setvolume", json!({"pcm": "Capture", "vol": 10}));
        engine.handle_request(&mut bus, req);
        assert_eq!(last_reply(&replies).status(), "access-denied");
        assert!(bus.calls.is_empty());
    }

    #[test]
    fn set_switch() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let (req, _) = request("setswitch", Value::Null);
        let token = engine.set_control(
            &mut bus,
            HalCtlTag::MasterOnOffSwitch,
            NormalizedValue::Switch(vec![false]),
            req,
        );
        assert!(token.is_some());
        assert_eq!(
            bus.calls[0].3,
            json!({"devid": DEVID, "ctl": {"id": 3, "val": [0]}})
        );
    }

    #[test]
    fn set_volume_without_transport() {
        let mut bus = MockBus::new(&[]);
        let mut engine = engine();

        let (req, replies) = request("setvolume", json!({"vol": 20}));
        engine.handle_request(&mut bus, req);
        assert_eq!(last_reply(&replies).status(), "transport-unavailable");
        assert!(bus.calls.is_empty());
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn set_volume_refused_by_transport() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        bus.refuse = true;
        let mut engine = engine();

        let (req, replies) = request("setvolume", json!({"vol": 20}));
        engine.handle_request(&mut bus, req);

        // The completion fires with failure.
        assert_eq!(last_reply(&replies).status(), "remote-failure");
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn set_volume_remote_failure() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let (req, replies) = request("setvolume", json!({"vol": 20}));
        engine.handle_request(&mut bus, req);
        let token = bus.calls[0].0;

        let outcome = CallOutcome::failure(json!({"request": {"info": "ioctl failed"}}));
        engine.handle_reply(&mut bus, token, outcome);
        assert_eq!(
            last_reply(&replies),
            Reply::Failure {
                status: "remote-failure".to_string(),
                info: "ioctl failed".to_string()
            }
        );
    }

    #[test]
    fn custom_normalizer() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let model = TestModel::new(Some(Box::new(DoublingNormalizer)));
        let mut engine = HalEngine::new("hal-test", model).unwrap();

        let (req, _) = request("setvolume", json!({"vol": 40}));
        engine.handle_request(&mut bus, req);
        assert_eq!(bus.calls[0].3["ctl"]["val"], json!([80]));

        engine.handle_event("alsacore/ctlchanged", &json!({"id": 2, "val": [2, 4, 6, 8, 10, 12]}));
        assert_eq!(
            engine.model().written[1],
            (
                HalCtlTag::PcmPlaybackVolume,
                NormalizedValue::Level(vec![1, 2, 3, 4, 5, 6])
            )
        );
    }

    #[test]
    fn get_control_malformed() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        [
            (json!({"ctls": [[1, 0]]}), "devid-missing"),
            (json!({"devid": DEVID}), "ctls-notfound"),
            (json!({"devid": DEVID, "ctls": []}), "ctls-notfound"),
            (json!({"devid": DEVID, "ctls": [[1]]}), "ctl-invalid"),
            (json!({"devid": DEVID, "ctls": [[1, 0], [9, 0]]}), "ctl-invalid"),
            (json!({"devid": DEVID, "ctls": [[0, 0]]}), "ctl-invalid"),
            (json!({"devid": "hw:0", "ctls": [[1, 0]]}), "devid-unknown"),
        ]
        .iter()
        .for_each(|(args, status)| {
            let (req, replies) = request("getcontrol", args.clone());
            engine.handle_request(&mut bus, req);
            assert_eq!(last_reply(&replies).status(), *status, "{}", args);
        });

        assert!(bus.calls.is_empty());
    }

    #[test]
    fn get_control_rejects_whole_batch() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        // PCM_Playback_Switch is valid tag, but not in the table.
        let args = json!({"devid": DEVID, "ctls": [[1, 0], [2, 0], [3, 0]]});
        let (req, replies) = request("getcontrol", args);
        engine.handle_request(&mut bus, req);

        assert_eq!(last_reply(&replies).status(), "ctl-unknown");
        assert!(bus.calls.is_empty());
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn get_control() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let args = json!({"devid": "Test Card", "ctls": [[1, 0], [4, 0]]});
        let (req, replies) = request("getcontrol", args);
        engine.handle_request(&mut bus, req);

        assert_eq!(bus.calls.len(), 1);
        let (token, _, verb, args) = bus.calls[0].clone();
        assert_eq!(verb, "ctlget");
        assert_eq!(
            args,
            json!({
                "devid": "Test Card",
                "mode": 0,
                "ctl": [{"name": "Master Playback Volume"}, {"id": 4}],
            })
        );

        let outcome = CallOutcome::success(json!({
            "response": [{"id": 1, "val": [25]}, {"id": 4, "val": [255]}],
        }));
        engine.handle_reply(&mut bus, token, outcome);
        assert_eq!(
            last_reply(&replies),
            Reply::Success {
                response: Some(json!([[1, [25]], [4, [100]]])),
                info: None
            }
        );
    }

    #[test]
    fn get_control_malformed_response() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let args = json!({"devid": DEVID, "ctls": [[2, 0]]});
        let (req, replies) = request("getcontrol", args);
        engine.handle_request(&mut bus, req);
        let token = bus.calls[0].0;

        let outcome = CallOutcome::success(json!({"response": {"id": 2, "val": [1, 2, 3]}}));
        engine.handle_reply(&mut bus, token, outcome);
        assert_eq!(last_reply(&replies).status(), "decode-failure");
    }

    #[test]
    fn get_volume() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let (req, replies) = request("getvolume", json!({"pcm": "PCM"}));
        engine.handle_request(&mut bus, req);
        let (token, _, verb, args) = bus.calls[0].clone();
        assert_eq!(verb, "ctlget");
        assert_eq!(args["ctl"], json!([{"id": 2}]));

        let outcome = CallOutcome::success(json!({
            "response": {"id": 2, "val": [10, 20, 30, 40, 50, 60]},
        }));
        engine.handle_reply(&mut bus, token, outcome);
        assert_eq!(
            last_reply(&replies),
            Reply::Success {
                response: Some(json!([[2, [10, 20, 30, 40, 50, 60]]])),
                info: None
            }
        );
    }

    #[test]
    fn alsacore_event() {
        let mut engine = engine();

        engine.handle_event("alsacore/ctlget", &json!({"id": 2, "val": [0, 10, 20, 30, 40, 50]}));
        assert_eq!(
            engine.model().written,
            vec![(
                HalCtlTag::PcmPlaybackVolume,
                NormalizedValue::Level(vec![0, 10, 20, 30, 40, 50])
            )]
        );

        // Dropped.
        engine.handle_event(
            "alsacore/ctlget",
            &json!({"id": 2, "val": [0, 10, 20, 30, 40, 50, 60]}),
        );
        engine.handle_event("alsacore/ctlget", &json!({"id": 2, "val": []}));
        engine.handle_event("alsacore/ctlget", &json!([0, 10, 20, 30, 40, 50]));
        engine.handle_event("alsacore/ctlget", &json!({"id": 99, "val": [1]}));
        assert_eq!(engine.model().written.len(), 1);
    }

    #[test]
    fn transport_event() {
        let mut engine = engine();

        engine.handle_event("TRANSPORT/node", &json!({"node": 1}));
        engine.handle_event("TRANSPORT/node", &json!(42));
        engine.handle_event("OTHER/node", &json!({"node": 1}));

        assert_eq!(
            engine.model().notified,
            vec![("node".to_string(), json!({"node": 1}))]
        );
        assert!(engine.model().written.is_empty());
    }

    #[test]
    fn subscribe() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        let (req, replies) = request("subscribe", json!({}));
        engine.handle_request(&mut bus, req);
        assert_eq!(last_reply(&replies).status(), "devid-missing");

        let (req, replies) = request("subscribe", json!({"devid": "hw:0"}));
        engine.handle_request(&mut bus, req);
        assert_eq!(last_reply(&replies).status(), "devid-unknown");
        assert!(bus.calls.is_empty());

        let (req, replies) = request("subscribe", json!({"devid": DEVID}));
        engine.handle_request(&mut bus, req);
        let (token, _, verb, args) = bus.calls[0].clone();
        assert_eq!(verb, "subctl");
        assert_eq!(args, json!({"devid": DEVID}));

        let outcome = CallOutcome::success(json!({
            "request": {"status": "success", "info": "subscribed"},
            "response": {"events": 2},
        }));
        engine.handle_reply(&mut bus, token, outcome);
        assert_eq!(
            last_reply(&replies),
            Reply::Success {
                response: Some(json!({"events": 2})),
                info: Some("subscribed".to_string()),
            }
        );
    }

    #[test]
    fn init() {
        let mut bus = MockBus::new(&[ALSACORE_API, "TRANSPORT"]);
        let mut engine = engine();

        engine.init(&mut bus).unwrap();
        assert_eq!(bus.calls.len(), 2);
        let (token, api, verb, args) = bus.calls[0].clone();
        assert_eq!((api.as_str(), verb.as_str()), (ALSACORE_API, "registerHal"));
        assert_eq!(args, json!({"prefix": "hal-test", "name": "Test Card"}));
        assert_eq!(bus.calls[1].2, "start");
        assert!(!engine.registry().is_sealed());

        let outcome = CallOutcome::success(json!({
            "response": [{"name": "Master Playback Volume", "numid": 1}],
        }));
        engine.handle_reply(&mut bus, token, outcome);
        assert!(engine.registry().is_sealed());
        assert_eq!(
            engine.registry().numid(HalCtlTag::MasterPlaybackVolume),
            Some(1)
        );

        // The values of card are requested.
        assert_eq!(bus.calls.len(), 3);
        let (token, _, verb, args) = bus.calls[2].clone();
        assert_eq!(verb, "ctlget");
        assert_eq!(args, json!({"devid": DEVID, "mode": 0}));

        let outcome = CallOutcome::success(json!({
            "response": [{"id": 1, "val": [40]}, {"id": 3, "val": [0]}],
        }));
        engine.handle_reply(&mut bus, token, outcome);
        assert_eq!(
            engine.model().written,
            vec![
                (
                    HalCtlTag::MasterPlaybackVolume,
                    NormalizedValue::Level(vec![40])
                ),
                (
                    HalCtlTag::MasterOnOffSwitch,
                    NormalizedValue::Switch(vec![false])
                ),
            ]
        );

        let token = bus.calls[1].0;
        engine.handle_reply(&mut bus, token, CallOutcome::success(Value::Null));
        assert_eq!(engine.model().completed, vec![(7, CallOutcome::success(Value::Null))]);
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn init_registration_failure() {
        let mut bus = MockBus::new(&[ALSACORE_API]);
        let mut engine = engine();

        engine.init(&mut bus).unwrap();
        assert_eq!(bus.calls.len(), 1);
        let token = bus.calls[0].0;

        engine.handle_reply(&mut bus, token, CallOutcome::failure(Value::Null));
        assert!(engine.registry().is_sealed());
        assert_eq!(bus.calls.len(), 1);
    }

    #[test]
    fn init_without_alsacore() {
        let mut bus = MockBus::new(&[]);
        let mut engine = engine();

        let err = engine.init(&mut bus).unwrap_err();
        assert_eq!(err.kind::<HalError>(), Some(HalError::Init));
        assert!(bus.calls.is_empty());
    }
}
