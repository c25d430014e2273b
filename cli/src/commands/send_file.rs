use std::fs::File;
use std::time::Duration;

use anyhow::{Context, bail};

use tether::{Message, MessageType, PlatformHandle, SupportOptions};

use crate::cli::{ChildMode, SendFileArgs};
use crate::error::CliResult;
use crate::launch::ChildLauncher;

pub async fn execute(
    args: SendFileArgs,
    launcher: &ChildLauncher,
    options: SupportOptions,
) -> CliResult<()> {
    let file = File::open(&args.path)
        .with_context(|| format!("failed to open {}", args.path.display()))?;
    let launched = launcher
        .launch(ChildMode::ReadFile, options, Duration::from_secs(args.timeout))
        .await?;

    let name = args.path.display().to_string();
    let mut message = Message::new(name.len(), 1, MessageType::Normal)?;
    message.payload_mut().copy_from_slice(name.as_bytes());
    message.set_handles(vec![PlatformHandle::from(file)])?;
    launched.pipe.write(message)?;

    let reply = launched
        .pipe
        .recv()
        .await
        .context("child did not acknowledge the file")?;
    tracing::info!(reply = %String::from_utf8_lossy(reply.payload()), "child read the file");

    let status = launched.finish().await?;
    if !status.success() {
        bail!("child failed: {status}");
    }
    Ok(())
}
