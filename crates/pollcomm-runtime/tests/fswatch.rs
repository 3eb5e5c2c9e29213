#![cfg(target_os = "linux")]

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use pollcomm_core::config::CommConfig;
use pollcomm_runtime::{Communicator, ConnectionBase, FileEvent, FileEvents, FsWatchConnection, TimerConnection};

#[test]
fn test_directory_create_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let comm = Communicator::with_config(CommConfig::new());
    let seen: Rc<RefCell<Vec<(PathBuf, FileEvents)>>> = Rc::new(RefCell::new(Vec::new()));

    let s = seen.clone();
    let mut watch = FsWatchConnection::new(move |base: &mut ConnectionBase, event: &FileEvent, _: &Communicator| {
        s.borrow_mut().push((event.path.clone(), event.events));
        if event.events.contains(FileEvents::DELETED) {
            base.mark_done();
        }
    })
    .unwrap();
    // the second call widens the first watch
    watch.watch_directory(dir.path(), FileEvents::CREATED).unwrap();
    watch.watch_directory(dir.path(), FileEvents::DELETED).unwrap();
    assert_eq!(watch.watch_count(), 1);
    comm.add(watch).unwrap();

    let file = dir.path().join("note.txt");
    let f = file.clone();
    let step = Rc::new(RefCell::new(0));
    // touch the directory from inside the loop so the watch is live
    comm.add(
        TimerConnection::new(5_000, move |base: &mut ConnectionBase, _: &Communicator| {
            let mut step = step.borrow_mut();
            match *step {
                0 => std::fs::write(&f, b"hello").unwrap(),
                1 => std::fs::remove_file(&f).unwrap(),
                _ => base.mark_done(),
            }
            *step += 1;
        })
        .unwrap(),
    )
    .unwrap();

    comm.run().unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.first(), Some(&(file.clone(), FileEvents::CREATED)));
    assert_eq!(seen.last(), Some(&(file, FileEvents::DELETED)));
}

#[test]
fn test_file_write_is_reported() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let comm = Communicator::with_config(CommConfig::new());
    let writes = Rc::new(RefCell::new(0));

    let w = writes.clone();
    let mut watch = FsWatchConnection::new(move |base: &mut ConnectionBase, event: &FileEvent, _: &Communicator| {
        assert!(event.events.contains(FileEvents::WRITE));
        assert_eq!(event.path, event.watched);
        *w.borrow_mut() += 1;
        base.mark_done();
    })
    .unwrap();
    watch.watch_file(file.path(), FileEvents::WRITE).unwrap();
    comm.add(watch).unwrap();

    std::fs::write(file.path(), b"changed").unwrap();
    comm.run().unwrap();
    // truncate and write may each be reported
    assert!(*writes.borrow() >= 1);
}
