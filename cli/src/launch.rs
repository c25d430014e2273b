use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::time::Duration;

use anyhow::{Context, Result};
use smol::Task;

use tether::{
    IpcSupport, MessagePipe, SupportOptions, TransportHandle, generate_random_token,
    prepare_child_command,
};

use crate::cli::ChildMode;

/// Flags a child is relaunched with
pub struct ChildLauncher {
    pub config: Option<PathBuf>,
    pub verbose: bool,
}

/// A running child and the pipe connected to it
pub struct Launched {
    pub pipe: MessagePipe,
    pub exit: Task<std::io::Result<ExitStatus>>,
    pub support: IpcSupport,
}

impl ChildLauncher {
    /// Spawn this executable as a child in `mode` and wait for its pipe
    pub async fn launch(
        &self,
        mode: ChildMode,
        options: SupportOptions,
        timeout: Duration,
    ) -> Result<Launched> {
        let support = IpcSupport::new(options).context("failed to start the I/O thread")?;
        let (ours, theirs) = TransportHandle::pair().context("failed to create a socket pair")?;
        let token = generate_random_token();
        let child_token = generate_random_token();

        let exe = std::env::current_exe().context("failed to locate the tether binary")?;
        let mut command = Command::new(exe);
        command.arg("child").arg(mode.as_arg());
        if let Some(config) = &self.config {
            command.arg("--config").arg(config);
        }
        if self.verbose {
            command.arg("--verbose");
        }
        command.env("TETHER_PIPE_TOKEN", &token);
        prepare_child_command(&mut command, &theirs);

        let child = command.spawn().context("failed to spawn the child")?;
        drop(theirs);
        tracing::info!(pid = child.id(), mode = mode.as_arg(), "child launched");

        let pending = support.create_parent_side(token, &child_token);
        support
            .connect_to_child(child_token.clone(), ours)
            .context("failed to connect to the child")?;
        let exit = smol::spawn(support.watch_child(child_token, child));

        let pipe = pending
            .wait_timeout(timeout)
            .await
            .context("child never claimed its pipe")?;
        tracing::debug!(endpoint = %pipe.id(), "pipe connected");
        Ok(Launched {
            pipe,
            exit,
            support,
        })
    }
}

impl Launched {
    /// Close the pipe and wait for the child to exit
    pub async fn finish(self) -> Result<ExitStatus> {
        drop(self.pipe);
        let status = self.exit.await.context("failed to wait for the child")?;
        self.support.shut_down();
        tracing::info!(%status, "child exited");
        Ok(status)
    }
}
