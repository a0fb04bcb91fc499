use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;

use streambroker::{QuantaClock, Server, ServerConfig};

/// Storage daemon: append-only bytestream broker.
#[derive(Parser, Debug)]
#[command(name = "storaged", version, about)]
struct Args {
    /// Absolute path of the IPC socket to listen on.
    ipc_socket_path: PathBuf,
    /// Rollover threshold for segment files, in bytes.
    max_segment_size: u64,
    /// Nonzero when running inline under another process: log errors only.
    inline_mode: i32,
    /// Supervisor socket to announce readiness to; an EXIT datagram from it
    /// shuts the daemon down cleanly.
    #[arg(long)]
    supervisor: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if !args.ipc_socket_path.is_absolute() {
        bail!("invalid socket path `{}'", args.ipc_socket_path.display());
    }
    if args.max_segment_size == 0 {
        bail!("invalid max segment size `0'");
    }

    let mut builder = env_logger::Builder::from_default_env();
    if args.inline_mode != 0 {
        builder.filter_level(log::LevelFilter::Error);
    }
    builder.init();

    set_process_title("STORAGE");
    install_signal_handlers();

    let mut cfg = ServerConfig::new(args.ipc_socket_path.clone(), args.max_segment_size);
    cfg.supervisor = args.supervisor;
    let mut server =
        Server::with_clock(cfg, QuantaClock::new()).context("starting storage daemon")?;
    server.run().context("storage daemon failed")?;
    Ok(())
}

fn set_process_title(title: &str) {
    #[cfg(target_os = "linux")]
    {
        let name = std::ffi::CString::new(title).expect("title without NUL");
        unsafe {
            libc::prctl(libc::PR_SET_NAME, name.as_ptr(), 0, 0, 0);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = title;
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        // the runtime masks SIGPIPE by default; restore termination so the
        // daemon exits with its peers
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}
