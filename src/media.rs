// Local storage for one download: the temporary per-track stream files and the final output path.

use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use crate::VodgrabError;
use crate::manifest::TrackKind;


/// Container extension of the muxed output.
pub(crate) const OUTPUT_EXTENSION: &str = "mp4";


// The temporary file is deleted when the returned handle is dropped, so every exit path (success,
// fetch error, mux error) releases it.
pub(crate) fn track_tempfile(dir: Option<&Path>, kind: TrackKind) -> Result<NamedTempFile, VodgrabError> {
    let prefix = format!("vodgrab-{kind}-");
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix)
        .suffix(".mp4")
        .rand_bytes(6);
    let tmp = match dir {
        Some(d) => builder.tempfile_in(d),
        None => builder.tempfile(),
    };
    tmp.map_err(|e| VodgrabError::Io(e, format!("creating temporary {kind} file")))
}

/// The output file for a download named `base_name`, placed in `dir`. The name is sanitised to be
/// usable as a file name on all platforms, and receives the container extension.
pub fn output_path(dir: &Path, base_name: &str) -> PathBuf {
    use sanitise_file_name::{sanitise_with_options, Options};

    let mut sanitize_opts = Options::DEFAULT;
    sanitize_opts.length_limit = 150;
    let mut name = sanitise_with_options(base_name.trim(), &sanitize_opts);
    if name.is_empty() {
        name = String::from("video");
    }
    dir.join(format!("{name}.{OUTPUT_EXTENSION}"))
}
