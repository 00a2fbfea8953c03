//! Reader for SpikeGLX recordings.
//!
//! A recording is a pair of files sharing a stem: `<stem>.bin` holds the
//! channel-interleaved integer samples and `<stem>.meta` holds `key=value`
//! metadata. Every entry point accepts either path.

mod digital;
mod meta;
mod reader;
mod topology;
pub mod types;

use std::path::Path;

// Re-export types
pub use types::*;

pub use digital::{detect_events, read_digital, unpack_bits};
pub use meta::{parse_chan_map, parse_geom_map, parse_imro_table, parse_meta, read_meta};
pub use reader::{read_analog, read_bin, resolve_paths};
pub use topology::{get_channel_idx, get_gain, get_uv_per_bit, DEFAULT_MAX_INT};

/// Opens a SpikeGLX recording and parses its metadata.
///
/// Sample data is not read until one of the `read_*` methods is called.
///
/// # Examples
///
/// ```no_run
/// use spikeglx_importer::load;
///
/// let result = load("path/to/run_g0_t0.imec0.ap.meta");
/// match result {
///     Ok(recording) => println!("Saved channels: {:?}", recording.meta().n_saved_chans()),
///     Err(e) => println!("Error loading file: {}", e),
/// }
/// ```
pub fn load<P: AsRef<Path>>(file_path: P) -> Result<SpikeGlxFile> {
    SpikeGlxFile::open(file_path)
}
