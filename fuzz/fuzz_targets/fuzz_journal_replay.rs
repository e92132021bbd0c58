#![no_main]

use libfuzzer_sys::fuzz_target;
use wasmgate_broker::journal::Journal;

fuzz_target!(|data: &[u8]| {
    // A journal file with arbitrary contents must replay without panicking
    // and leave the file usable for appends.
    let Ok(dir) = tempfile::tempdir() else { return };
    let path = dir.path().join("journal.log");
    if std::fs::write(&path, data).is_err() {
        return;
    }
    if let Ok((mut journal, _records)) = Journal::open(&path) {
        let _ = journal.append(b"post-recovery record");
    }
});
