// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2022 Takashi Sakamoto

use {
    super::{error::*, LogLevel, RuntimeOperation},
    clap::Parser,
    glib::{Error, FileError},
};

pub trait ServiceCmd<A, T, R>: Sized
where
    A: Parser,
    R: RuntimeOperation<T>,
{
    fn params(args: &A) -> (T, Option<LogLevel>);

    fn run() {
        let code = A::try_parse()
            .map_err(|err| err.to_string())
            .map(|args| Self::params(&args))
            .and_then(|(params, log_level)| {
                R::new(params, log_level)
                    .and_then(|mut runtime| {
                        runtime.listen()?;
                        runtime.run()?;
                        Ok(libc::EXIT_SUCCESS)
                    })
                    .map_err(|err| specific_err_to_string(&err))
            })
            .unwrap_or_else(|msg| {
                eprintln!("{}", msg);
                libc::EXIT_FAILURE
            });

        std::process::exit(code)
    }
}

fn specific_err_to_string(e: &Error) -> String {
    let (domain, cause) = if let Some(error) = e.kind::<FileError>() {
        (
            "Linux file operation error",
            match error {
                FileError::Acces => "Access permission",
                FileError::Isdir => "Is directory",
                FileError::Noent => "Not exists",
                _ => "",
            },
        )
    } else if let Some(error) = e.kind::<HalError>() {
        (
            "HAL service error",
            match error.class() {
                ErrorClass::Validation => "Invalid request",
                ErrorClass::Transport => "Service is not reachable",
                ErrorClass::Remote => "Service reports failure",
                ErrorClass::Decode => "Malformed data",
                ErrorClass::Init => "Initialization failure",
                ErrorClass::Table => "Malformed control table",
            },
        )
    } else {
        ("Unknown domain error", "")
    };
    format!("{}: {}, {}", domain, cause, e)
}
