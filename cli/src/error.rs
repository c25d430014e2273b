use std::process::ExitCode;

pub type CliResult<T> = anyhow::Result<T>;

/// Exit status when the child went away before the exchange finished
const CHILD_LOST: u8 = 3;

/// Convert a CliResult to an ExitCode, printing the cause chain to stderr
pub fn to_exit_code(result: CliResult<()>) -> ExitCode {
    let Err(e) = result else {
        return ExitCode::SUCCESS;
    };
    eprintln!("error: {e}");
    for cause in e.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
    let child_lost = e.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<tether::Error>(),
            Some(tether::Error::PeerClosed | tether::Error::PeerProcessExited)
        )
    });
    if child_lost {
        ExitCode::from(CHILD_LOST)
    } else {
        ExitCode::FAILURE
    }
}
