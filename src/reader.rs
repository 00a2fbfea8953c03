use memmap2::MmapOptions;
use ndarray::{Array1, Array2, Axis};
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::meta::read_meta;
use crate::topology::{get_channel_idx, get_uv_per_bit};
use crate::types::*;

/// Resolves the `.bin` and `.meta` paths of a recording from either one.
///
/// # Errors
///
/// * [`SpikeGlxError::InvalidFilename`] if the path has neither suffix
/// * [`SpikeGlxError::FileNotFound`] if either file of the pair is missing
pub fn resolve_paths<P: AsRef<Path>>(path: P) -> Result<(PathBuf, PathBuf)> {
    let path = path.as_ref();
    let (bin_path, meta_path) = match path.extension().and_then(|ext| ext.to_str()) {
        Some("bin") => (path.to_path_buf(), path.with_extension("meta")),
        Some("meta") => (path.with_extension("bin"), path.to_path_buf()),
        _ => return Err(SpikeGlxError::InvalidFilename(path.to_path_buf())),
    };

    if !bin_path.exists() {
        return Err(SpikeGlxError::FileNotFound(bin_path));
    }
    if !meta_path.exists() {
        return Err(SpikeGlxError::FileNotFound(meta_path));
    }

    Ok((bin_path, meta_path))
}

/// Number of whole sample frames in a binary file of `file_size` bytes.
pub(crate) fn samples_in_file<T: Sample>(file_size: u64, channel_count: usize) -> usize {
    let frame_bytes = (channel_count * T::WIDTH) as u64;
    if frame_bytes == 0 {
        return 0;
    }
    if file_size % frame_bytes != 0 {
        tracing::warn!(
            file_size,
            frame_bytes,
            "Binary file does not hold a whole number of frames, ignoring trailing bytes"
        );
    }
    (file_size / frame_bytes) as usize
}

/// Reads raw samples from a SpikeGLX binary file.
///
/// Only the requested sample window is memory-mapped. The selected columns
/// are copied into a new array and the mapping is released before returning.
///
/// # Arguments
///
/// * `path` - Path to the `.bin` file
/// * `channel_count` - Number of interleaved channels per frame (`nSavedChans`)
/// * `channels` - Columns to keep, in output order; `None` keeps all
/// * `sample_range` - Frames to read; `None` reads the whole file
///
/// # Returns
///
/// An array of shape `[n_samples, n_selected_channels]`.
pub fn read_bin<T: Sample, P: AsRef<Path>>(
    path: P,
    channel_count: usize,
    channels: Option<&ChannelSelection>,
    sample_range: Option<Range<usize>>,
) -> Result<Array2<T>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(SpikeGlxError::FileNotFound(path.to_path_buf()));
    }
    if channel_count == 0 {
        return Err(SpikeGlxError::ZeroChannels);
    }

    let selected = match channels {
        Some(selection) => selection.resolve(channel_count)?,
        None => (0..channel_count).collect(),
    };

    let file = File::open(path)?;
    let available = samples_in_file::<T>(file.metadata()?.len(), channel_count);
    let range = sample_range.unwrap_or(0..available);
    if range.start > range.end || range.end > available {
        return Err(SpikeGlxError::InvalidSampleRange {
            start: range.start,
            end: range.end,
            available,
        });
    }

    let n_samples = range.end - range.start;
    let frame_bytes = channel_count * T::WIDTH;
    tracing::debug!(
        path = %path.display(),
        start = range.start,
        end = range.end,
        channels = selected.len(),
        "Reading binary window"
    );

    if n_samples == 0 || selected.is_empty() {
        return Ok(Array2::default((n_samples, selected.len())));
    }

    let offset = (range.start * frame_bytes) as u64;
    // SAFETY: the map is read-only and dropped before this function returns.
    let window = unsafe {
        MmapOptions::new()
            .offset(offset)
            .len(n_samples * frame_bytes)
            .map(&file)?
    };

    let data = Array2::from_shape_fn((n_samples, selected.len()), |(sample, column)| {
        let start = sample * frame_bytes + selected[column] * T::WIDTH;
        T::from_le(&window[start..start + T::WIDTH])
    });
    drop(window);

    Ok(data)
}

/// Reads analog channels and converts them to microvolts.
///
/// # Arguments
///
/// * `path` - Path to either the `.bin` or the `.meta` file
/// * `channels` - Channels to read; `None` reads every analog channel
/// * `sample_range` - Frames to read; `None` reads the whole file
///
/// # Returns
///
/// An array of shape `[n_samples, n_selected_channels]` in μV.
pub fn read_analog<T: Sample, P: AsRef<Path>>(
    path: P,
    channels: Option<ChannelSelection>,
    sample_range: Option<Range<usize>>,
) -> Result<Array2<f64>> {
    let (bin_path, meta_path) = resolve_paths(path)?;
    let meta = read_meta(&meta_path)?;
    read_analog_with_meta::<T>(&bin_path, &meta, channels, sample_range)
}

/// Analog read against already-parsed metadata.
pub(crate) fn read_analog_with_meta<T: Sample>(
    bin_path: &Path,
    meta: &Metadata,
    channels: Option<ChannelSelection>,
    sample_range: Option<Range<usize>>,
) -> Result<Array2<f64>> {
    let tic = Instant::now();

    let channel_count = meta.n_saved_chans()?;
    let selection = match channels {
        Some(selection) => selection,
        None => ChannelSelection::Range(get_channel_idx(meta, true)?),
    };

    let uv_per_bit = get_uv_per_bit(meta)?;
    let selected = selection.resolve(channel_count.min(uv_per_bit.len()))?;
    let scale = Array1::from_iter(selected.iter().map(|&c| uv_per_bit[c]));

    let raw = read_bin::<T, _>(bin_path, channel_count, Some(&selection), sample_range)?;
    let data = scale_to_microvolts(&raw, &scale);

    tracing::info!(
        samples = data.nrows(),
        channels = data.ncols(),
        elapsed_ms = tic.elapsed().as_millis() as u64,
        "Decoded analog data"
    );

    Ok(data)
}

impl SpikeGlxFile {
    /// Resolves the file pair from either path and parses the metadata.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (bin_path, meta_path) = resolve_paths(path)?;
        tracing::info!(path = %bin_path.display(), "Opening SpikeGLX recording");

        let meta = read_meta(&meta_path)?;
        log_meta_summary(&meta);

        Ok(SpikeGlxFile {
            bin_path,
            meta_path,
            meta,
        })
    }

    /// Number of whole sample frames in the binary file for element type `T`.
    pub fn num_samples<T: Sample>(&self) -> Result<usize> {
        let file_size = std::fs::metadata(&self.bin_path)?.len();
        Ok(samples_in_file::<T>(file_size, self.meta.n_saved_chans()?))
    }

    /// Recording duration in seconds.
    pub fn duration<T: Sample>(&self) -> Result<f64> {
        Ok(self.num_samples::<T>()? as f64 / self.meta.sample_rate()?)
    }

    /// Raw integer samples; `None` selects every saved channel.
    pub fn read_raw<T: Sample>(
        &self,
        channels: Option<ChannelSelection>,
        sample_range: Option<Range<usize>>,
    ) -> Result<Array2<T>> {
        read_bin::<T, _>(
            &self.bin_path,
            self.meta.n_saved_chans()?,
            channels.as_ref(),
            sample_range,
        )
    }

    /// Samples in μV; `None` selects the analog channels.
    pub fn read_analog<T: Sample>(
        &self,
        channels: Option<ChannelSelection>,
        sample_range: Option<Range<usize>>,
    ) -> Result<Array2<f64>> {
        read_analog_with_meta::<T>(&self.bin_path, &self.meta, channels, sample_range)
    }
}

/// Multiplies every column of `raw` by its per-channel scale factor.
fn scale_to_microvolts<T: Sample>(raw: &Array2<T>, scale: &Array1<f64>) -> Array2<f64> {
    let mut data: Array2<f64> = raw.mapv(|v| v.into());
    data *= &scale.view().insert_axis(Axis(0));
    data
}

/// Logs the parts of the metadata that drive decoding.
pub(crate) fn log_meta_summary(meta: &Metadata) {
    let recording_type = meta.get_str("typeThis").unwrap_or("unknown");
    let saved = meta.get_int("nSavedChans").unwrap_or(0);
    let sample_rate = meta.sample_rate().unwrap_or(0.0);

    tracing::info!(
        recording_type,
        saved_channels = saved,
        sample_rate_khz = sample_rate / 1000.0,
        "Found SpikeGLX recording"
    );

    if let Some(table) = meta.imro_table() {
        tracing::info!(
            probe_type = table.probe_type,
            readout_channels = table.channels.len(),
            "Found imec readout table"
        );
    }
}
