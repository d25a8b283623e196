// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Transformation between abstract value and value in device range.

use {
    super::{ctl_table::*, error::*},
    glib::Error,
    serde_json::Value,
    std::fmt::Debug,
};

/// The minimum of abstract level.
pub const ABSTRACT_MIN: i32 = 0;
/// The maximum of abstract level.
pub const ABSTRACT_MAX: i32 = 100;

/// The value of control in abstract range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedValue {
    /// The levels in [ABSTRACT_MIN, ABSTRACT_MAX].
    Level(Vec<i32>),
    Switch(Vec<bool>),
}

impl NormalizedValue {
    pub fn len(&self) -> usize {
        match self {
            Self::Level(vals) => vals.len(),
            Self::Switch(vals) => vals.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Level(vals) => Value::from(vals.clone()),
            Self::Switch(vals) => Value::from(vals.clone()),
        }
    }
}

/// The transformation of value for all controls in sound card.
pub trait ValueNormalizer: Debug {
    fn to_device(
        &self,
        ctl: &ControlDescriptor,
        value: &NormalizedValue,
    ) -> Result<Vec<i32>, Error>;
    fn to_abstract(&self, ctl: &ControlDescriptor, raw: &[i32]) -> Result<NormalizedValue, Error>;
}

/// The linear transformation, used unless the sound card has its own.
#[derive(Default, Debug, Copy, Clone)]
pub struct LinearNormalizer;

impl LinearNormalizer {
    fn scale_to_device(ctl: &ControlDescriptor, val: i32, min: i32, max: i32) -> Result<i32, Error> {
        let span = (i64::from(max) - i64::from(min)) as f64;
        let raw = (f64::from(val) / f64::from(ABSTRACT_MAX) * span).round() as i64 + i64::from(min);
        i32::try_from(raw).map_err(|_| {
            let msg = format!("{} can not express {} in [{}, {}]", ctl.tag.label(), val, min, max);
            Error::new(HalError::OutOfRange, &msg)
        })
    }

    fn scale_to_abstract(raw: i32, min: i32, max: i32) -> i32 {
        // Any value is the minimum in degenerated range.
        if max == min {
            return ABSTRACT_MIN;
        }
        let span = (i64::from(max) - i64::from(min)) as f64;
        let offset = (i64::from(raw) - i64::from(min)) as f64;
        // The raw value is in the range, thus the result is in the abstract range.
        (offset * f64::from(ABSTRACT_MAX) / span).round() as i32
    }
}

impl ValueNormalizer for LinearNormalizer {
    fn to_device(
        &self,
        ctl: &ControlDescriptor,
        value: &NormalizedValue,
    ) -> Result<Vec<i32>, Error> {
        check_count(ctl, value.len(), HalError::CtlInvalid)?;

        match (&ctl.elem_type, value) {
            (CtlElemType::Integer { min, max, .. }, NormalizedValue::Level(vals)) => vals
                .iter()
                .map(|&val| {
                    check_abstract_level(ctl, val)
                        .and_then(|_| Self::scale_to_device(ctl, val, *min, *max))
                })
                .collect(),
            (CtlElemType::Boolean, NormalizedValue::Switch(vals)) => {
                Ok(vals.iter().map(|&val| val as i32).collect())
            }
            (CtlElemType::Boolean, NormalizedValue::Level(vals)) => vals
                .iter()
                .map(|&val| match val {
                    0 | 1 => Ok(val),
                    _ => {
                        let msg = format!("{} accepts 0 or 1, not {}", ctl.tag.label(), val);
                        Err(Error::new(HalError::OutOfRange, &msg))
                    }
                })
                .collect(),
            (CtlElemType::Integer { .. }, NormalizedValue::Switch(_)) => {
                let msg = format!("{} is not a switch", ctl.tag.label());
                Err(Error::new(HalError::CtlInvalid, &msg))
            }
        }
    }

    fn to_abstract(&self, ctl: &ControlDescriptor, raw: &[i32]) -> Result<NormalizedValue, Error> {
        check_count(ctl, raw.len(), HalError::Decode)?;

        let (min, max) = ctl.range();
        if let Some(val) = raw.iter().find(|&&val| val < min || val > max) {
            let msg = format!(
                "{} reports {} out of [{}, {}]",
                ctl.tag.label(),
                val,
                min,
                max
            );
            return Err(Error::new(HalError::Decode, &msg));
        }

        let value = match ctl.elem_type {
            CtlElemType::Integer { min, max, .. } => NormalizedValue::Level(
                raw.iter()
                    .map(|&val| Self::scale_to_abstract(val, min, max))
                    .collect(),
            ),
            CtlElemType::Boolean => NormalizedValue::Switch(raw.iter().map(|&val| val > 0).collect()),
        };

        Ok(value)
    }
}

/// Check the count of values against the declaration of control.
pub fn check_count(ctl: &ControlDescriptor, count: usize, cause: HalError) -> Result<(), Error> {
    if count != ctl.count {
        let msg = format!(
            "{} has {} values but {} given",
            ctl.tag.label(),
            ctl.count,
            count
        );
        Err(Error::new(cause, &msg))
    } else {
        Ok(())
    }
}

/// Check the abstract level. The value out of range is rejected, never truncated.
pub fn check_abstract_level(ctl: &ControlDescriptor, val: i32) -> Result<(), Error> {
    if val < ABSTRACT_MIN || val > ABSTRACT_MAX {
        let msg = format!(
            "{} accepts [{}, {}], not {}",
            ctl.tag.label(),
            ABSTRACT_MIN,
            ABSTRACT_MAX,
            val
        );
        Err(Error::new(HalError::OutOfRange, &msg))
    } else {
        Ok(())
    }
}
