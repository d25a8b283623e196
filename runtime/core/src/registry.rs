// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Lookup of control declarations by tag and by numeric identifier.

use {
    super::{ctl_table::*, error::*},
    glib::Error,
    std::collections::{BTreeMap, HashMap},
    tracing::debug,
};

/// The registry of controls in sound card. The auto-resolved numeric identifiers are
/// available to be resolved till sealed, then the registry is read-only.
#[derive(Debug)]
pub struct Registry {
    ctls: &'static [ControlDescriptor],
    by_tag: BTreeMap<HalCtlTag, usize>,
    by_numid: HashMap<u32, usize>,
    sealed: bool,
}

impl Registry {
    pub fn register(ctls: &'static [ControlDescriptor]) -> Result<Self, Error> {
        let mut by_tag = BTreeMap::new();
        let mut by_numid = HashMap::new();

        ctls.iter().enumerate().try_for_each(|(pos, ctl)| {
            validate_descriptor(ctl)?;

            if by_tag.insert(ctl.tag, pos).is_some() {
                let msg = format!("{} is declared twice", ctl.tag.label());
                return Err(Error::new(HalError::DuplicateTag, &msg));
            }

            if let CtlNumid::Fixed(numid) = ctl.numid {
                if let Some(prev) = by_numid.insert(numid, pos) {
                    let msg = format!(
                        "numid {} is shared by {} and {}",
                        numid,
                        ctls[prev].tag.label(),
                        ctl.tag.label()
                    );
                    return Err(Error::new(HalError::DuplicateNumid, &msg));
                }
            }

            debug!(tag = ctl.tag.label(), numid = ?ctl.numid, name = ctl.name);

            Ok(())
        })?;

        Ok(Self {
            ctls,
            by_tag,
            by_numid,
            sealed: false,
        })
    }

    pub fn lookup_by_tag(&self, tag: HalCtlTag) -> Option<&'static ControlDescriptor> {
        let ctls = self.ctls;
        self.by_tag.get(&tag).map(|&pos| &ctls[pos])
    }

    pub fn lookup_by_numid(&self, numid: u32) -> Option<&'static ControlDescriptor> {
        let ctls = self.ctls;
        self.by_numid.get(&numid).map(|&pos| &ctls[pos])
    }

    /// The numeric identifier of control, fixed or already resolved.
    pub fn numid(&self, tag: HalCtlTag) -> Option<u32> {
        let ctl = self.lookup_by_tag(tag)?;
        match ctl.numid {
            CtlNumid::Fixed(numid) => Some(numid),
            CtlNumid::Auto => self
                .by_numid
                .iter()
                .find(|(_, &pos)| self.ctls[pos].tag == tag)
                .map(|(&numid, _)| numid),
        }
    }

    /// Find the control by the name of control element.
    pub fn lookup_by_name(&self, name: &str) -> Option<&'static ControlDescriptor> {
        self.ctls.iter().find(|ctl| ctl.name == name)
    }

    pub fn resolve_numid(&mut self, tag: HalCtlTag, numid: u32) -> Result<(), Error> {
        assert!(!self.sealed, "registry is sealed, {} can not be resolved", tag.label());

        let pos = *self.by_tag.get(&tag).ok_or_else(|| {
            let msg = format!("{} is not in the table", tag.label());
            Error::new(HalError::UnknownControl, &msg)
        })?;

        if let CtlNumid::Fixed(fixed) = self.ctls[pos].numid {
            if fixed != numid {
                let msg = format!("{} has fixed numid {}, not {}", tag.label(), fixed, numid);
                return Err(Error::new(HalError::CtlInvalid, &msg));
            }
            return Ok(());
        }

        match self.by_numid.get(&numid).copied() {
            Some(prev) if prev != pos => {
                let msg = format!(
                    "numid {} is already used by {}",
                    numid,
                    self.ctls[prev].tag.label()
                );
                Err(Error::new(HalError::DuplicateNumid, &msg))
            }
            _ => {
                self.by_numid.retain(|_, p| *p != pos);
                self.by_numid.insert(numid, pos);
                debug!(tag = tag.label(), numid, "resolved");
                Ok(())
            }
        }
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static ControlDescriptor> {
        self.ctls.iter()
    }
}

fn validate_descriptor(ctl: &ControlDescriptor) -> Result<(), Error> {
    if ctl.count == 0 {
        let msg = format!("{} has no value", ctl.tag.label());
        return Err(Error::new(HalError::InvalidRange, &msg));
    }

    if let CtlElemType::Integer { min, max, step } = ctl.elem_type {
        if min > max {
            let msg = format!("{} has inverted range [{}, {}]", ctl.tag.label(), min, max);
            return Err(Error::new(HalError::InvalidRange, &msg));
        }
        if step <= 0 {
            let msg = format!("{} has invalid step {}", ctl.tag.label(), step);
            return Err(Error::new(HalError::InvalidRange, &msg));
        }
    }

    let (min, max) = ctl.range();
    if ctl.value < min || ctl.value > max {
        let msg = format!("{} has initial value out of range", ctl.tag.label());
        return Err(Error::new(HalError::InvalidRange, &msg));
    }

    Ok(())
}
