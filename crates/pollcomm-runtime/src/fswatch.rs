//! Filesystem-change connection
//!
//! One inotify instance per connection. Watches are keyed by path:
//! watching a path again widens its event set instead of adding a second
//! watch.
//!
//! Semantic events and their inotify masks:
//!
//! | `FileEvents` | inotify                                          |
//! |--------------|--------------------------------------------------|
//! | `ATTRIBUTES` | `IN_ATTRIB`                                      |
//! | `READ`       | `IN_ACCESS`                                      |
//! | `WRITE`      | `IN_MODIFY`                                      |
//! | `CREATED`    | `IN_CREATE`, `IN_MOVED_TO`, `IN_MOVE_SELF`       |
//! | `DELETED`    | `IN_DELETE`, `IN_DELETE_SELF`, `IN_MOVED_FROM`, `IN_MOVE_SELF` |
//! | `ACCESS`     | `IN_OPEN`, `IN_CLOSE_WRITE`, `IN_CLOSE_NOWRITE`  |
//! | `DIRECTORY`  | `IN_ISDIR` (reported only)                       |
//! | `GONE`       | `IN_DELETE_SELF` (reported only)                 |
//! | `UNMOUNTED`  | `IN_UNMOUNT` (reported only)                     |

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::communicator::Communicator;
use crate::connection::{Connection, ConnectionBase};
use crate::error::CommResult;

bitflags! {
    /// Semantic filesystem events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileEvents: u32 {
        const ATTRIBUTES = 1 << 0;
        const READ       = 1 << 1;
        const WRITE      = 1 << 2;
        const CREATED    = 1 << 3;
        const DELETED    = 1 << 4;
        const ACCESS     = 1 << 5;

        const DIRECTORY  = 1 << 6;
        const GONE       = 1 << 7;
        const UNMOUNTED  = 1 << 8;
    }
}

impl FileEvents {
    /// Categories a caller can ask for.
    pub const WATCHABLE: FileEvents = FileEvents::ATTRIBUTES
        .union(FileEvents::READ)
        .union(FileEvents::WRITE)
        .union(FileEvents::CREATED)
        .union(FileEvents::DELETED)
        .union(FileEvents::ACCESS);
}

/// One decoded change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path the watch was registered with.
    pub watched: PathBuf,
    /// `watched` joined with the entry name for events inside a directory.
    pub path: PathBuf,
    pub events: FileEvents,
    /// Pairs the two halves of a rename.
    pub cookie: u32,
}

pub trait FsHandler {
    fn on_event(&mut self, base: &mut ConnectionBase, event: &FileEvent, comm: &Communicator);
}

impl<F> FsHandler for F
where
    F: FnMut(&mut ConnectionBase, &FileEvent, &Communicator),
{
    fn on_event(&mut self, base: &mut ConnectionBase, event: &FileEvent, comm: &Communicator) {
        self(base, event, comm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    File,
    Symlink,
    Directory,
}

#[derive(Debug)]
struct Watch {
    path: PathBuf,
    events: FileEvents,
    os_mask: u32,
    wd: sys::Wd,
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod sys {
            use std::ffi::OsString;
            use std::os::fd::{AsFd, AsRawFd, RawFd};
            use std::path::Path;

            use nix::errno::Errno;
            use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};

            use super::{FileEvents, WatchKind};
            use crate::error::{CommError, CommResult};

            pub type Wd = WatchDescriptor;

            pub struct RawEvent {
                pub wd: Wd,
                pub mask: u32,
                pub cookie: u32,
                pub name: Option<OsString>,
            }

            const MAPPING: [(FileEvents, u32); 6] = [
                (FileEvents::ATTRIBUTES, libc::IN_ATTRIB),
                (FileEvents::READ, libc::IN_ACCESS),
                (FileEvents::WRITE, libc::IN_MODIFY),
                (FileEvents::CREATED, libc::IN_CREATE | libc::IN_MOVED_TO | libc::IN_MOVE_SELF),
                (
                    FileEvents::DELETED,
                    libc::IN_DELETE | libc::IN_DELETE_SELF | libc::IN_MOVED_FROM | libc::IN_MOVE_SELF,
                ),
                (FileEvents::ACCESS, libc::IN_OPEN | libc::IN_CLOSE_WRITE | libc::IN_CLOSE_NOWRITE),
            ];

            pub fn to_os(events: FileEvents) -> u32 {
                MAPPING
                    .iter()
                    .filter(|(e, _)| events.contains(*e))
                    .fold(0, |mask, (_, m)| mask | m)
            }

            pub fn from_os(mask: u32) -> FileEvents {
                let mut events = MAPPING
                    .iter()
                    .filter(|(_, m)| mask & m != 0)
                    .fold(FileEvents::empty(), |acc, (e, _)| acc | *e);
                if mask & libc::IN_ISDIR != 0 {
                    events |= FileEvents::DIRECTORY;
                }
                if mask & libc::IN_DELETE_SELF != 0 {
                    events |= FileEvents::GONE;
                }
                if mask & libc::IN_UNMOUNT != 0 {
                    events |= FileEvents::UNMOUNTED;
                }
                events
            }

            pub fn is_overflow(mask: u32) -> bool {
                mask & libc::IN_Q_OVERFLOW != 0
            }

            pub fn is_ignored(mask: u32) -> bool {
                mask & libc::IN_IGNORED != 0
            }

            pub struct Watcher(Inotify);

            impl Watcher {
                pub fn new() -> CommResult<Self> {
                    let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
                        .map_err(|errno| CommError::Os { op: "inotify_init1", errno })?;
                    Ok(Self(inotify))
                }

                pub fn fd(&self) -> RawFd {
                    self.0.as_fd().as_raw_fd()
                }

                /// Install `os_mask` on `path`, replacing any mask already set there.
                pub fn add(&self, path: &Path, os_mask: u32, kind: WatchKind) -> CommResult<Wd> {
                    let mut flags = AddWatchFlags::from_bits_retain(os_mask);
                    match kind {
                        WatchKind::File => {}
                        WatchKind::Symlink => flags |= AddWatchFlags::IN_DONT_FOLLOW,
                        WatchKind::Directory => flags |= AddWatchFlags::IN_ONLYDIR,
                    }
                    self.0
                        .add_watch(path, flags)
                        .map_err(|errno| CommError::Os { op: "inotify_add_watch", errno })
                }

                pub fn remove(&self, wd: Wd) -> CommResult<()> {
                    self.0
                        .rm_watch(wd)
                        .map_err(|errno| CommError::Os { op: "inotify_rm_watch", errno })
                }

                /// Drain every queued event.
                pub fn read(&self) -> CommResult<Vec<RawEvent>> {
                    let mut all = Vec::new();
                    loop {
                        match self.0.read_events() {
                            Ok(events) => all.extend(events.into_iter().map(|e| RawEvent {
                                wd: e.wd,
                                mask: e.mask.bits(),
                                cookie: e.cookie,
                                name: e.name,
                            })),
                            Err(Errno::EAGAIN) => return Ok(all),
                            Err(Errno::EINTR) => continue,
                            Err(errno) => return Err(CommError::Os { op: "inotify read", errno }),
                        }
                    }
                }
            }
        }
    } else {
        mod sys {
            use std::ffi::OsString;
            use std::os::fd::RawFd;
            use std::path::Path;

            use super::{FileEvents, WatchKind};
            use crate::error::{CommError, CommResult};

            pub type Wd = i32;

            pub struct RawEvent {
                pub wd: Wd,
                pub mask: u32,
                pub cookie: u32,
                pub name: Option<OsString>,
            }

            pub fn to_os(_events: FileEvents) -> u32 {
                0
            }

            pub fn from_os(_mask: u32) -> FileEvents {
                FileEvents::empty()
            }

            pub fn is_overflow(_mask: u32) -> bool {
                false
            }

            pub fn is_ignored(_mask: u32) -> bool {
                false
            }

            pub struct Watcher;

            impl Watcher {
                pub fn new() -> CommResult<Self> {
                    Err(CommError::Unsupported("filesystem watch"))
                }

                pub fn fd(&self) -> RawFd {
                    -1
                }

                pub fn add(&self, _path: &Path, _os_mask: u32, _kind: WatchKind) -> CommResult<Wd> {
                    Err(CommError::Unsupported("filesystem watch"))
                }

                pub fn remove(&self, _wd: Wd) -> CommResult<()> {
                    Ok(())
                }

                pub fn read(&self) -> CommResult<Vec<RawEvent>> {
                    Ok(Vec::new())
                }
            }
        }
    }
}

pub struct FsWatchConnection<H> {
    base: ConnectionBase,
    watcher: Option<sys::Watcher>,
    watches: HashMap<PathBuf, Watch>,
    by_wd: HashMap<sys::Wd, PathBuf>,
    handler: H,
}

impl<H: FsHandler> FsWatchConnection<H> {
    pub fn new(handler: H) -> CommResult<Self> {
        Ok(Self {
            base: ConnectionBase::new("fs watch"),
            watcher: Some(sys::Watcher::new()?),
            watches: HashMap::new(),
            by_wd: HashMap::new(),
            handler,
        })
    }

    /// Watch a file, following symlinks.
    pub fn watch_file(&mut self, path: impl AsRef<Path>, events: FileEvents) -> CommResult<()> {
        self.watch(path.as_ref(), events, WatchKind::File)
    }

    /// Watch a symlink itself rather than its target.
    pub fn watch_symlink(&mut self, path: impl AsRef<Path>, events: FileEvents) -> CommResult<()> {
        self.watch(path.as_ref(), events, WatchKind::Symlink)
    }

    /// Watch a directory and the entries inside it. Fails if `path` is
    /// not a directory.
    pub fn watch_directory(&mut self, path: impl AsRef<Path>, events: FileEvents) -> CommResult<()> {
        self.watch(path.as_ref(), events, WatchKind::Directory)
    }

    /// Stop watching `path`. Returns whether it was watched.
    pub fn stop_watch(&mut self, path: impl AsRef<Path>) -> CommResult<bool> {
        let Some(watch) = self.watches.remove(path.as_ref()) else {
            return Ok(false);
        };
        self.by_wd.remove(&watch.wd);
        if let Some(watcher) = &self.watcher {
            watcher.remove(watch.wd)?;
        }
        Ok(true)
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Events requested for `path`, if watched.
    pub fn watched_events(&self, path: impl AsRef<Path>) -> Option<FileEvents> {
        self.watches.get(path.as_ref()).map(|w| w.events)
    }

    pub fn close(&mut self) {
        self.watcher = None;
        self.watches.clear();
        self.by_wd.clear();
    }

    fn watch(&mut self, path: &Path, events: FileEvents, kind: WatchKind) -> CommResult<()> {
        let Some(watcher) = &self.watcher else {
            return Err(crate::error::CommError::InvalidSocket(self.base.name().to_string()));
        };
        let events = events & FileEvents::WATCHABLE;

        if let Some(watch) = self.watches.get_mut(path) {
            let merged = watch.events | events;
            let os_mask = sys::to_os(merged);
            watcher.add(path, os_mask, kind)?;
            watch.events = merged;
            watch.os_mask = os_mask;
            tracing::debug!(path = %path.display(), events = ?merged, "watch widened");
            return Ok(());
        }

        let os_mask = sys::to_os(events);
        let wd = watcher.add(path, os_mask, kind)?;
        // two paths naming the same inode share one descriptor
        if let Some(previous) = self.by_wd.insert(wd, path.to_path_buf()) {
            self.watches.remove(&previous);
        }
        self.watches.insert(
            path.to_path_buf(),
            Watch {
                path: path.to_path_buf(),
                events,
                os_mask,
                wd,
            },
        );
        tracing::debug!(path = %path.display(), events = ?events, os_mask, "watch added");
        Ok(())
    }
}

impl<H: FsHandler> Connection for FsWatchConnection<H> {
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectionBase {
        &mut self.base
    }

    fn socket(&self) -> Option<RawFd> {
        self.watcher.as_ref().map(|w| w.fd())
    }

    fn is_reader(&self) -> bool {
        true
    }

    fn on_read_ready(&mut self, comm: &Communicator) {
        let Some(watcher) = &self.watcher else {
            return;
        };
        let raw = match watcher.read() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(connection = %self.base.name(), error = %e, "watch read failed");
                self.on_error(comm);
                return;
            }
        };

        for event in raw {
            if sys::is_overflow(event.mask) {
                tracing::warn!(connection = %self.base.name(), "watch queue overflowed, events were lost");
                continue;
            }
            let Some(watched) = self.by_wd.get(&event.wd).cloned() else {
                continue;
            };
            if sys::is_ignored(event.mask) {
                tracing::debug!(path = %watched.display(), "watch dropped by the kernel");
                self.by_wd.remove(&event.wd);
                self.watches.remove(&watched);
                continue;
            }
            let Some(watch) = self.watches.get(&watched) else {
                continue;
            };
            let events = sys::from_os(event.mask);
            let requested = watch.events | FileEvents::DIRECTORY | FileEvents::GONE | FileEvents::UNMOUNTED;
            if !events.intersects(requested) {
                continue;
            }
            let path = match &event.name {
                Some(name) => watch.path.join(name),
                None => watch.path.clone(),
            };
            let event = FileEvent {
                watched,
                path,
                events: events & requested,
                cookie: event.cookie,
            };
            self.handler.on_event(&mut self.base, &event, comm);
        }
    }

    fn on_removed(&mut self, _comm: &Communicator) {
        self.close();
    }
}
