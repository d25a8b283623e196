// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    glib::Error,
    runtime_core::{
        ctl_table::*, engine::*, error::*, normalizer::*, router::CallOutcome,
    },
    serde::Deserialize,
    serde_json::{json, Value},
    std::collections::BTreeMap,
    tracing::{debug, error, info},
};

pub const CARD_NAME: &str = "Microchip MOST:1";
pub const DEVICE_ID: &str = "hw:1";
pub const PCM_MAX_CHANNELS: usize = 6;

pub const UNICENS_API: &str = "UNICENS";
pub const DEFAULT_CONFIG_PATH: &str = "/usr/share/unicens2-binding/data";

const NODE_AVAILABILITY_TOPIC: &str = "node-availibility";

pub static MOST_CTLS: [ControlDescriptor; 3] = [
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
        info: "Sets master playback volume",
        access: CtlAccess::ReadWrite,
    },
    ControlDescriptor {
        tag: HalCtlTag::PcmPlaybackVolume,
        numid: CtlNumid::Auto,
        group: CtlGroup::PcmVolume,
        elem_type: CtlElemType::Integer {
            min: 0,
            max: 100,
            step: 1,
        },
        count: PCM_MAX_CHANNELS,
        value: 100,
        name: "PCM Playback Volume",
        info: "Sets PCM playback volume",
        access: CtlAccess::ReadWrite,
    },
    ControlDescriptor {
        tag: HalCtlTag::MasterOnOffSwitch,
        numid: CtlNumid::Auto,
        group: CtlGroup::Switch,
        elem_type: CtlElemType::Boolean,
        count: 1,
        value: 1,
        name: "Master Playback Switch",
        info: "Sets master playback switch",
        access: CtlAccess::ReadWrite,
    },
];

/// The volume of sound card, and availability of nodes in MOST network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeState {
    pub master: i32,
    pub switch: bool,
    pub pcm: [i32; PCM_MAX_CHANNELS],
    pub nodes: BTreeMap<u32, bool>,
}

impl Default for VolumeState {
    fn default() -> Self {
        Self {
            master: MOST_CTLS[0].value,
            switch: MOST_CTLS[2].value > 0,
            pcm: [MOST_CTLS[1].value; PCM_MAX_CHANNELS],
            nodes: Default::default(),
        }
    }
}

impl VolumeState {
    /// The nodes available in the network.
    pub fn available_nodes(&self) -> Vec<u32> {
        self.nodes
            .iter()
            .filter(|(_, &available)| available)
            .map(|(&node, _)| node)
            .collect()
    }
}

/// The stage of UNICENS initialization, carried by the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnicensCall {
    ListConfig,
    Subscribe(String),
    Initialise(String),
}

#[derive(Deserialize, Debug)]
struct ConfigFile {
    path: String,
}

#[derive(Deserialize, Debug)]
struct ConfigList {
    cfgfiles: Vec<ConfigFile>,
}

#[derive(Deserialize, Debug)]
struct NodeAvailability {
    node: u32,
    available: bool,
}

#[derive(Debug)]
pub struct UnicensModel {
    card: SoundCard,
    config_path: String,
    state: VolumeState,
    initialized: bool,
}

impl UnicensModel {
    pub fn new(config_path: &str) -> Self {
        Self {
            card: SoundCard {
                name: CARD_NAME,
                devid: DEVICE_ID,
                info: "HAL for MICROCHIP MOST sound card controlled by UNICENS binding",
                ctls: &MOST_CTLS,
                normalizer: None,
            },
            config_path: config_path.to_string(),
            state: Default::default(),
            initialized: false,
        }
    }

    pub fn state(&self) -> &VolumeState {
        &self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn parse_config_list(outcome: &CallOutcome) -> Result<String, Error> {
        let resp = outcome.response().ok_or_else(|| {
            let msg = format!("no configuration in response: {}", outcome.result);
            Error::new(HalError::Decode, &msg)
        })?;
        let list = ConfigList::deserialize(resp).map_err(|e| {
            let msg = format!("{}: {}", e, resp);
            Error::new(HalError::Decode, &msg)
        })?;
        list.cfgfiles
            .into_iter()
            .next()
            .map(|file| file.path)
            .ok_or_else(|| Error::new(HalError::Init, "Failed to retrieve configuration"))
    }
}

impl CtlModel for UnicensModel {
    fn card(&self) -> &SoundCard {
        &self.card
    }

    fn write(&mut self, ctl: &ControlDescriptor, value: &NormalizedValue) -> Result<bool, Error> {
        match (ctl.tag, value) {
            (HalCtlTag::MasterPlaybackVolume, NormalizedValue::Level(vals)) if vals.len() == 1 => {
                self.state.master = vals[0];
                info!(
                    nodes = ?self.state.available_nodes(),
                    "master_volume: value={}",
                    self.state.master
                );
                Ok(true)
            }
            (HalCtlTag::PcmPlaybackVolume, NormalizedValue::Level(vals))
                if vals.len() == PCM_MAX_CHANNELS =>
            {
                self.state.pcm.copy_from_slice(vals);
                info!(
                    nodes = ?self.state.available_nodes(),
                    "pcm_vol: {:?}",
                    self.state.pcm
                );
                Ok(true)
            }
            (HalCtlTag::MasterOnOffSwitch, NormalizedValue::Switch(vals)) if vals.len() == 1 => {
                self.state.switch = vals[0];
                info!("master_switch: value={}", self.state.switch);
                Ok(true)
            }
            (HalCtlTag::MasterOnOffSwitch, NormalizedValue::Level(vals)) if vals.len() == 1 => {
                self.state.switch = vals[0] > 0;
                info!("master_switch: value={}", self.state.switch);
                Ok(true)
            }
            _ => {
                let msg = format!("{}: INVALID STRING {}", ctl.tag.label(), value.to_json());
                Err(Error::new(HalError::CtlInvalid, &msg))
            }
        }
    }
}

impl TransportModel for UnicensModel {
    type Context = UnicensCall;

    fn notified_topic_prefix(&self) -> &'static str {
        "UNICENS/"
    }

    fn init(&mut self, outbound: &mut Outbound<UnicensCall>) -> Result<(), Error> {
        info!("Initializing HAL-MOST-UNICENS-BINDING");

        if !outbound.has_api(UNICENS_API) {
            return Err(Error::new(HalError::Init, "Failed to access UNICENS API"));
        }

        let args = json!({ "cfgpath": self.config_path });
        outbound.call(UNICENS_API, "listconfig", args, UnicensCall::ListConfig);

        Ok(())
    }

    fn parse_notification(&mut self, topic: &str, payload: &Value) -> Result<(), Error> {
        if topic == NODE_AVAILABILITY_TOPIC {
            let avail = NodeAvailability::deserialize(payload).map_err(|e| {
                let msg = format!("{}: {}", e, payload);
                Error::new(HalError::Decode, &msg)
            })?;
            info!(
                "Node-Availability: node={:#05x}, available={}",
                avail.node, avail.available
            );
            self.state.nodes.insert(avail.node, avail.available);
        } else {
            debug!(topic, "{}", payload);
        }

        Ok(())
    }

    fn call_completed(
        &mut self,
        context: UnicensCall,
        outcome: CallOutcome,
        outbound: &mut Outbound<UnicensCall>,
    ) -> Result<(), Error> {
        if outcome.is_error {
            let msg = match context {
                UnicensCall::ListConfig => "Failed to retrieve configuration",
                UnicensCall::Subscribe(_) => "Failed to subscribe to UNICENS binding",
                UnicensCall::Initialise(_) => "Failed to initialize UNICENS binding",
            };
            error!("{}: {}", msg, outcome.result);
            return Err(Error::new(HalError::Init, msg));
        }

        match context {
            UnicensCall::ListConfig => {
                let config_file = Self::parse_config_list(&outcome)?;
                info!("Found configuration: {}", config_file);
                outbound.call(
                    UNICENS_API,
                    "subscribe",
                    json!({}),
                    UnicensCall::Subscribe(config_file),
                );
            }
            UnicensCall::Subscribe(config_file) => {
                let args = json!({ "filename": config_file });
                outbound.call(
                    UNICENS_API,
                    "initialise",
                    args,
                    UnicensCall::Initialise(config_file),
                );
            }
            UnicensCall::Initialise(config_file) => {
                self.initialized = true;
                info!(
                    config_file = config_file.as_str(),
                    "Initializing HAL-MOST-UNICENS-BINDING done"
                );
            }
        }

        Ok(())
    }
}
