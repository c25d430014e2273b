use std::time::Duration;

use anyhow::{Context, bail};

use tether::SupportOptions;

use crate::cli::{ChildMode, EchoArgs};
use crate::error::CliResult;
use crate::launch::ChildLauncher;

pub const HELLO: &[u8] = b"hello";
pub const QUIT: &[u8] = b"quitquitquit";

pub async fn execute(
    args: EchoArgs,
    launcher: &ChildLauncher,
    options: SupportOptions,
) -> CliResult<()> {
    let launched = launcher
        .launch(ChildMode::Echo, options, Duration::from_secs(args.timeout))
        .await?;

    for round in 1..=args.rounds {
        launched.pipe.write_bytes(HELLO)?;
        let reply = launched
            .pipe
            .recv()
            .await
            .with_context(|| format!("no reply in round {round}"))?;
        let text = String::from_utf8_lossy(reply.payload());
        if reply.payload() != [HELLO, HELLO].concat() {
            bail!("unexpected reply in round {round}: {text:?}");
        }
        println!("{text}");
    }
    launched.pipe.write_bytes(QUIT)?;

    let status = launched.finish().await?;
    if !status.success() {
        bail!("child failed: {status}");
    }
    Ok(())
}
