// Test helpers shared by service tests

use std::path::{Path, PathBuf};

/// Write an executable `/bin/sh` script standing in for FFmpeg. It ignores its arguments.
#[cfg(unix)]
pub(crate) fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-ffmpeg");
    {
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        file.sync_all().unwrap();
    }
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
