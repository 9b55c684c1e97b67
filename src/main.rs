use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fuse3::path::Session;
use fuse3::MountOptions;
#[cfg(unix)]
use futures_util::future::poll_fn;
use futures_util::Future;
#[cfg(unix)]
use std::pin::Pin;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
#[cfg(unix)]
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use wimfs::archive::WimArchive;
use wimfs::fs::WimFs;
use wimfs::ops::{MountConfig, MountContext, StreamInterface};
use wimfs::unmount;

#[derive(Parser, Debug)]
#[command(name = "wimfs")]
#[command(about = "Mount an image from a WIM archive as a live filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new archive holding one empty image.
    Create {
        /// Archive file to create.
        wim: PathBuf,

        /// Name recorded for the image.
        #[arg(long, default_value = "image")]
        name: String,
    },

    /// Mount one image out of an archive.
    Mount {
        /// Archive file to mount.
        wim: PathBuf,

        /// Mount point for the filesystem.
        mountpoint: PathBuf,

        /// Image index to mount (1-based).
        #[arg(long, default_value_t = 1)]
        image: usize,

        /// Enable the staging store and commit pipeline.
        #[arg(long, default_value_t = false)]
        read_write: bool,

        /// Verbose tracing.
        #[arg(long, default_value_t = false)]
        debug: bool,

        /// How alternate data streams are addressed.
        #[arg(long, value_enum, default_value = "xattr")]
        stream_interface: StreamInterface,
    },

    /// Tell a mounted filesystem to unmount, committing or discarding.
    Unmount {
        /// Mount point of the running filesystem.
        mountpoint: PathBuf,

        /// Commit changes back into the archive.
        #[arg(long, default_value_t = false)]
        commit: bool,

        /// Verify the rewritten archive afterwards.
        #[arg(long, default_value_t = false)]
        check_integrity: bool,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug { "wimfs=debug" } else { "wimfs=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default.parse().unwrap()),
        )
        .init();
}

// The FUSE loop is deliberately single-threaded: no two callbacks ever run
// concurrently, which is what the in-memory model is written against.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Create { wim, name } => {
            init_tracing(false);
            WimArchive::create(&wim, &name)?;
            Ok(())
        }
        Commands::Unmount {
            mountpoint,
            commit,
            check_integrity,
        } => {
            init_tracing(false);
            unmount::unmount(&mountpoint, commit, check_integrity)?;
            Ok(())
        }
        Commands::Mount {
            wim,
            mountpoint,
            image,
            read_write,
            debug,
            stream_interface,
        } => {
            init_tracing(debug);

            let archive = WimArchive::open(&wim)?;
            let config = MountConfig {
                read_write,
                stream_interface,
                mountpoint: mountpoint.clone(),
                image_index: image,
            };
            let ctx = MountContext::new(archive, config)?;
            let fs = WimFs::new(ctx);

            let mut mount_opts = MountOptions::default();
            mount_opts.fs_name("wimfs");
            mount_opts.read_only(!read_write);

            let session = Session::new(mount_opts);
            let handle = session.mount(fs, mountpoint).await?;

            #[cfg(unix)]
            {
                // Unmount cleanly on termination signals so the destroy
                // callback (and with it the commit handshake) always runs.
                let (unmount_tx, unmount_rx) = oneshot::channel::<()>();

                let mut mount_task = tokio::spawn(async move {
                    let mut handle = Some(handle);
                    let mut handle_future = poll_fn(|cx| {
                        let handle = handle.as_mut().expect("mount handle missing");
                        Pin::new(handle).poll(cx)
                    });

                    let res = tokio::select! {
                        res = &mut handle_future => res,
                        _ = unmount_rx => {
                            let handle = handle.take().expect("mount handle missing");
                            handle.unmount().await
                        }
                    };

                    res.map_err(anyhow::Error::from)
                });

                let mut sigint = signal(SignalKind::interrupt())?;
                let mut sigterm = signal(SignalKind::terminate())?;

                let signals = async {
                    tokio::select! {
                        _ = sigint.recv() => (),
                        _ = sigterm.recv() => (),
                    }
                };
                tokio::pin!(signals);

                let result = tokio::select! {
                    res = &mut mount_task => res,
                    _ = &mut signals => {
                        let _ = unmount_tx.send(());
                        mount_task.await
                    }
                };

                result??;
            }

            #[cfg(not(unix))]
            {
                handle.await?;
            }

            Ok(())
        }
    }
}
