// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Vocabulary to declare the table of controls in sound card.
//!
//! Each sound card declares a static table of [`ControlDescriptor`] which maps the abstract,
//! card-independent tag of control to the control element of ALSA control device.

use {
    super::{error::*, normalizer::ValueNormalizer},
    glib::Error,
    std::convert::TryFrom,
};

/// The abstract identifier of logical control, independent of sound card.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum HalCtlTag {
    MasterPlaybackVolume,
    PcmPlaybackVolume,
    PcmPlaybackSwitch,
    CaptureVolume,
    MasterOnOffSwitch,
}

impl HalCtlTag {
    /// The code for the start marker, never valid.
    pub const START_CODE: i64 = 0;
    /// The code for the end marker, never valid.
    pub const END_CODE: i64 = 6;

    pub const ALL: &'static [Self] = &[
        Self::MasterPlaybackVolume,
        Self::PcmPlaybackVolume,
        Self::PcmPlaybackSwitch,
        Self::CaptureVolume,
        Self::MasterOnOffSwitch,
    ];

    pub fn code(&self) -> i64 {
        match self {
            Self::MasterPlaybackVolume => 1,
            Self::PcmPlaybackVolume => 2,
            Self::PcmPlaybackSwitch => 3,
            Self::CaptureVolume => 4,
            Self::MasterOnOffSwitch => 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::MasterPlaybackVolume => "Master_Playback_Volume",
            Self::PcmPlaybackVolume => "PCM_Playback_Volume",
            Self::PcmPlaybackSwitch => "PCM_Playback_Switch",
            Self::CaptureVolume => "Capture_Volume",
            Self::MasterOnOffSwitch => "Master_OnOff_Switch",
        }
    }
}

impl TryFrom<i64> for HalCtlTag {
    type Error = Error;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .find(|tag| tag.code() == code)
            .copied()
            .ok_or_else(|| {
                let msg = format!(
                    "Invalid control {}, should be in ({}, {})",
                    code,
                    Self::START_CODE,
                    Self::END_CODE
                );
                Error::new(HalError::CtlInvalid, &msg)
            })
    }
}

impl From<HalCtlTag> for i64 {
    fn from(tag: HalCtlTag) -> Self {
        tag.code()
    }
}

/// The group of control.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CtlGroup {
    OutputVolume,
    PcmVolume,
    InputVolume,
    Switch,
}

/// The access permission of control.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CtlAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl CtlAccess {
    pub fn readable(&self) -> bool {
        *self != Self::WriteOnly
    }

    pub fn writable(&self) -> bool {
        *self != Self::ReadOnly
    }
}

/// The numeric identifier of control element.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CtlNumid {
    /// Resolved by the name of control element at registration.
    Auto,
    Fixed(u32),
}

/// The kind of control element.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CtlElemType {
    Integer { min: i32, max: i32, step: i32 },
    Boolean,
}

/// The declaration of control.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlDescriptor {
    pub tag: HalCtlTag,
    pub numid: CtlNumid,
    pub group: CtlGroup,
    pub elem_type: CtlElemType,
    /// The number of values in the control element.
    pub count: usize,
    /// The initial value in device range.
    pub value: i32,
    /// The name of control element, used to resolve numeric identifier.
    pub name: &'static str,
    pub info: &'static str,
    pub access: CtlAccess,
}

impl ControlDescriptor {
    /// The range of value in device.
    pub fn range(&self) -> (i32, i32) {
        match self.elem_type {
            CtlElemType::Integer { min, max, .. } => (min, max),
            CtlElemType::Boolean => (0, 1),
        }
    }
}

/// The sound card handled by the service.
#[derive(Debug)]
pub struct SoundCard {
    /// The name of sound card. It should match with the output of 'aplay -l'.
    pub name: &'static str,
    /// The identifier of ALSA control device, like 'hw:1'.
    pub devid: &'static str,
    pub info: &'static str,
    pub ctls: &'static [ControlDescriptor],
    /// The normalizer used instead of the linear one for all of controls.
    pub normalizer: Option<Box<dyn ValueNormalizer>>,
}

impl SoundCard {
    /// Whether the identifier points to the sound card.
    pub fn matches(&self, devid: &str) -> bool {
        devid == self.devid || devid == self.name
    }
}
