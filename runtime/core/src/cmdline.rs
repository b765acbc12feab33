// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {super::*, clap::Parser};

pub trait ServiceCmd<A, T, R>: Sized
where
    A: Parser,
    R: RuntimeOperation<T>,
{
    fn params(args: &A) -> (T, Option<LogLevel>);

    fn run() {
        // NOTE: clap(v3.2)::Parser::parse() can exit process with 2 when
        // detecting any error or printing help.
        let args = A::parse();
        let (params, log_level) = Self::params(&args);

        let code = R::new(params, log_level)
            .and_then(|mut runtime| {
                runtime.listen()?;
                runtime.run()?;
                Ok(libc::EXIT_SUCCESS)
            })
            .unwrap_or_else(|err| {
                eprintln!("{}", err);
                libc::EXIT_FAILURE
            });

        std::process::exit(code)
    }
}
