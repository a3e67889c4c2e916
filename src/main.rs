use std::sync::mpsc;
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;
use tokio::runtime::Runtime;

use dcfs::{Backend, Context, Dispatcher, HttpBackend, Namespace};

/// Mounts a chat guild's text channels as a directory tree at `mountpoint`.
#[derive(Parser)]
#[command(version, about = "Mount a chat guild as a POSIX filesystem")]
struct Cli {
    mountpoint: std::path::PathBuf,

    /// Let other users on the host access the mount (requires `user_allow_other`
    /// in /etc/fuse.conf).
    #[arg(long)]
    allow_other: bool,

    /// Run in the foreground instead of forking the mount off into the
    /// background.
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Accepted for CLI compatibility with other FUSE filesystems; `fuser`
    /// always services one request at a time, so this has no further
    /// effect here.
    #[arg(short = 's', long)]
    singlethread: bool,

    /// Additional raw mount option, e.g. `-o ro` or `-o max_read=65536`.
    /// May be given more than once.
    #[arg(short = 'o', value_name = "OPT")]
    mount_options: Vec<String>,
}

fn main() -> std::process::ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.singlethread {
        log::debug!("--singlethread given; fuser already services one request at a time");
    }

    let ctx = Context::from_env()?;
    let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(&ctx.token, &ctx.base_url)?);

    // Namespace::prime needs its own runtime; the dispatcher builds a
    // second one for the lifetime of the mount, mirroring the teacher's
    // one-shot `Runtime::new().unwrap().block_on(build_file_tree(..))`
    // followed by a synchronous, already-built `FileTree`.
    let namespace = Runtime::new()?.block_on(Namespace::prime(backend.as_ref(), ctx.guild_id, ctx.uid, ctx.gid))?;

    let dispatcher = Dispatcher::new(ctx, backend, namespace)?;

    let mut options = vec![MountOption::FSName("dcfs".to_string()), MountOption::AutoUnmount];
    if cli.allow_other {
        options.push(MountOption::AllowOther);
    }
    for opt in &cli.mount_options {
        options.push(MountOption::CUSTOM(opt.clone()));
    }

    if cli.foreground {
        log::info!("mounting at {} (foreground)", cli.mountpoint.display());
        fuser::mount2(dispatcher, &cli.mountpoint, &options)?;
        log::info!("unmounted");
        return Ok(());
    }

    let _session = fuser::spawn_mount2(dispatcher, &cli.mountpoint, &options)?;
    log::info!("mounted at {}", cli.mountpoint.display());

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    rx.recv().ok();

    log::info!("unmounting");
    Ok(())
}
