// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Error domain for operations of hardware abstraction layer.

use glib::{error::ErrorDomain, Error, Quark};

/// The cause of failure in hardware abstraction layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HalError {
    /// The device identifier is not given.
    DevidMissing,
    /// The mandatory argument is not given.
    ArgumentMissing,
    /// The list of controls is not given, or empty.
    CtlsNotFound,
    /// The control entry is malformed.
    CtlInvalid,
    /// The device identifier is not for the sound card.
    UnknownDevice,
    /// The control is not available in the sound card.
    UnknownControl,
    /// The value is out of the range of control.
    OutOfRange,
    /// The control is not writable.
    AccessDenied,
    /// The outbound call can not be issued.
    TransportUnavailable,
    /// The remote service reports failure.
    Remote,
    /// The payload is malformed.
    Decode,
    /// The service is not initialized.
    Init,
    DuplicateTag,
    DuplicateNumid,
    InvalidRange,
    Invalid(i32),
}

/// The class of error, to decide whom to report.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorClass {
    /// Rejected synchronously, never retried.
    Validation,
    /// Surfaced to the caller synchronously.
    Transport,
    /// Surfaced to the caller via the stored context.
    Remote,
    /// Logged, never propagated.
    Decode,
    /// Fatal at startup.
    Init,
    /// Programming error in the table of controls.
    Table,
}

impl HalError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::DevidMissing
            | Self::ArgumentMissing
            | Self::CtlsNotFound
            | Self::CtlInvalid
            | Self::UnknownDevice
            | Self::UnknownControl
            | Self::OutOfRange
            | Self::AccessDenied => ErrorClass::Validation,
            Self::TransportUnavailable => ErrorClass::Transport,
            Self::Remote | Self::Invalid(_) => ErrorClass::Remote,
            Self::Decode => ErrorClass::Decode,
            Self::Init => ErrorClass::Init,
            Self::DuplicateTag | Self::DuplicateNumid | Self::InvalidRange => ErrorClass::Table,
        }
    }

    /// The status code reported to the caller.
    pub fn status(&self) -> &'static str {
        match self {
            Self::DevidMissing => "devid-missing",
            Self::ArgumentMissing => "argument-missing",
            Self::CtlsNotFound => "ctls-notfound",
            Self::CtlInvalid => "ctl-invalid",
            Self::UnknownDevice => "devid-unknown",
            Self::UnknownControl => "ctl-unknown",
            Self::OutOfRange => "out-of-range",
            Self::AccessDenied => "access-denied",
            Self::TransportUnavailable => "transport-unavailable",
            Self::Remote => "remote-failure",
            Self::Decode => "decode-failure",
            Self::Init => "init-failure",
            Self::DuplicateTag => "duplicate-tag",
            Self::DuplicateNumid => "duplicate-numid",
            Self::InvalidRange => "invalid-range",
            Self::Invalid(_) => "failed",
        }
    }
}

impl ErrorDomain for HalError {
    fn domain() -> Quark {
        Quark::from_str("snd-hal-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            Self::DevidMissing => 0,
            Self::ArgumentMissing => 1,
            Self::CtlsNotFound => 2,
            Self::CtlInvalid => 3,
            Self::UnknownDevice => 4,
            Self::UnknownControl => 5,
            Self::OutOfRange => 6,
            Self::AccessDenied => 7,
            Self::TransportUnavailable => 8,
            Self::Remote => 9,
            Self::Decode => 10,
            Self::Init => 11,
            Self::DuplicateTag => 12,
            Self::DuplicateNumid => 13,
            Self::InvalidRange => 14,
            Self::Invalid(val) => val,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let enumeration = match code {
            0 => Self::DevidMissing,
            1 => Self::ArgumentMissing,
            2 => Self::CtlsNotFound,
            3 => Self::CtlInvalid,
            4 => Self::UnknownDevice,
            5 => Self::UnknownControl,
            6 => Self::OutOfRange,
            7 => Self::AccessDenied,
            8 => Self::TransportUnavailable,
            9 => Self::Remote,
            10 => Self::Decode,
            11 => Self::Init,
            12 => Self::DuplicateTag,
            13 => Self::DuplicateNumid,
            14 => Self::InvalidRange,
            _ => Self::Invalid(code),
        };

        Some(enumeration)
    }
}

/// Detect the status code for the error, including the ones out of the domain.
pub fn error_status(error: &Error) -> &'static str {
    error
        .kind::<HalError>()
        .map(|cause| cause.status())
        .unwrap_or("failed")
}
