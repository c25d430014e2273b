use std::io::{Read, Write};

use anyhow::{Context, bail};

use tether::{Error, IpcSupport, MessagePipe, PlatformHandle, SupportOptions, TransportHandle};

use crate::cli::{ChildArgs, ChildMode};
use crate::commands::echo::QUIT;
use crate::error::CliResult;

pub async fn execute(args: ChildArgs, options: SupportOptions) -> CliResult<()> {
    let handle = TransportHandle::from_parent_process()
        .context("not started by a tether parent")?;
    let support = IpcSupport::new(options)?;
    let pending = support.create_child_side(args.token);
    support.connect_to_parent(handle)?;
    let pipe = pending.wait().await.context("parent never offered the pipe")?;
    tracing::debug!(endpoint = %pipe.id(), "child pipe connected");

    let result = match args.mode {
        ChildMode::Echo => echo(&pipe).await,
        ChildMode::ReadFile => read_file(&pipe).await,
    };
    drop(pipe);
    support.shut_down();
    result
}

async fn echo(pipe: &MessagePipe) -> CliResult<()> {
    loop {
        let message = pipe.recv().await?;
        if message.payload() == QUIT {
            tracing::debug!("told to quit");
            return Ok(());
        }
        pipe.write_bytes(&[message.payload(), message.payload()].concat())?;
    }
}

async fn read_file(pipe: &MessagePipe) -> CliResult<()> {
    let mut message = pipe.recv().await?;
    let name = String::from_utf8_lossy(message.payload()).into_owned();
    let Some(mut file) = message.take_handles().into_iter().find_map(PlatformHandle::into_file) else {
        bail!("no file attached for {name}");
    };

    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .with_context(|| format!("failed to read {name}"))?;
    std::io::stdout().write_all(&contents)?;
    pipe.write_bytes(format!("read {} bytes of {name}", contents.len()).as_bytes())?;

    // Wait for the parent to hang up so the reply is not cut off.
    match pipe.recv().await {
        Err(Error::PeerClosed) => Ok(()),
        Err(e) => Err(e.into()),
        Ok(_) => bail!("unexpected second message"),
    }
}
