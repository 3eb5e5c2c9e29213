//! Filesystem watcher
//!
//! Prints one line per change under each path until SIGINT. Directories
//! are watched for entries being created, deleted or written; files for
//! writes, attribute changes and deletion.
//!
//! Usage:
//!     fs-watch <path>...

use std::path::Path;

use nix::sys::signal::Signal;
use pollcomm::prelude::*;

fn run(paths: &[String]) -> CommResult<()> {
    let comm = Communicator::new();

    let mut watch = FsWatchConnection::new(|_: &mut ConnectionBase, event: &FileEvent, _: &Communicator| {
        println!("{:?} {}", event.events, event.path.display());
    })?;
    for path in paths {
        let path = Path::new(path);
        if path.is_dir() {
            watch.watch_directory(path, FileEvents::CREATED | FileEvents::DELETED | FileEvents::WRITE)?;
        } else {
            watch.watch_file(path, FileEvents::WRITE | FileEvents::ATTRIBUTES | FileEvents::DELETED)?;
        }
        tracing::info!(path = %path.display(), "watching");
    }
    let watch = comm.add(watch)?;
    let watch_id = watch.borrow().base().id();

    let stop = SignalConnection::new(
        comm.signals(),
        Signal::SIGINT,
        move |base: &mut ConnectionBase, _: &SignalInfo, comm: &Communicator| {
            comm.remove_connection(watch_id);
            base.mark_done();
        },
    )?;
    comm.add(stop)?;

    comm.run()
}

fn main() {
    pollcomm::init_logging();
    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("usage: fs-watch <path>...");
        std::process::exit(2);
    }
    if let Err(e) = run(&paths) {
        tracing::error!(error = %e, "fs-watch failed");
        std::process::exit(1);
    }
}
