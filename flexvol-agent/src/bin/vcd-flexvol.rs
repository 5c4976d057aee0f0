// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that the kubelet invokes for every FlexVolume callout.

use clap::error::ErrorKind;
use clap::Parser;
use flexvol_agent::dispatch::Args;
use flexvol_agent::ExecResult;

#[tokio::main]
async fn main() {
    let result = match Args::try_parse() {
        Ok(args) => args.exec().await,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            err.exit()
        }
        Err(err) => ExecResult::failure(&err.render()),
    };
    println!("{}", result.to_json());
    std::process::exit(result.exit_code());
}
