//! Channel layout and scaling derived from parsed metadata.

use ndarray::{s, Array1};
use std::ops::Range;

use crate::types::*;

/// Max integer code used when neither `imMaxInt` nor `niMaxInt` is present.
pub const DEFAULT_MAX_INT: f64 = 512.0;

const MICROVOLTS_PER_VOLT: f64 = 1_000_000.0;

const AP_BAND_SUFFIX: &str = ".ap.bin";
const LF_BAND_SUFFIX: &str = ".lf.bin";

fn missing(key: &str) -> SpikeGlxError {
    SpikeGlxError::MissingField(key.to_string())
}

fn nonzero_float(meta: &Metadata, key: &str) -> Option<f64> {
    meta.get_float(key).filter(|v| *v != 0.0)
}

fn imec_counts(meta: &Metadata) -> Result<ImecCounts> {
    meta.imec_counts().ok_or_else(|| missing("snsApLfSy"))
}

fn ni_counts(meta: &Metadata) -> Result<NiCounts> {
    meta.ni_counts().ok_or_else(|| missing("snsMnMaXaDw"))
}

/// Returns the analog (`analog == true`) or digital channel range.
///
/// For imec streams the AP and LF channels are analog and the SY channels
/// digital. For NI-DAQ streams MN, MA and XA are analog and DW digital.
pub fn get_channel_idx(meta: &Metadata, analog: bool) -> Result<Range<usize>> {
    let topology = ChannelTopology::from_meta(meta)?;
    Ok(if analog {
        topology.analog
    } else {
        topology.digital
    })
}

impl ChannelTopology {
    /// Splits the saved channels of a recording into analog and digital ranges.
    pub fn from_meta(meta: &Metadata) -> Result<Self> {
        let recording_type = meta.recording_type()?;
        let (n_analog, n_digital) = match recording_type {
            RecordingType::Imec => {
                let counts = imec_counts(meta)?;
                (counts.ap + counts.lf, counts.sy)
            }
            RecordingType::Nidq => {
                let counts = ni_counts(meta)?;
                (counts.mn + counts.ma + counts.xa, counts.dw)
            }
        };

        Ok(ChannelTopology {
            recording_type,
            analog: 0..n_analog,
            digital: n_analog..n_analog + n_digital,
        })
    }
}

/// Returns the gain of every channel.
///
/// Imec gains come from the readout table, using the band named by the
/// `fileName` suffix; sync channels that follow the neural channels get 1.0.
/// NI-DAQ gains are `niMNGain` for MN channels, `niMAGain` for MA channels,
/// and 1.0 for everything else.
pub fn get_gain(meta: &Metadata) -> Result<Array1<f64>> {
    match meta.recording_type()? {
        RecordingType::Imec => imec_gain(meta),
        RecordingType::Nidq => nidq_gain(meta),
    }
}

fn imec_gain(meta: &Metadata) -> Result<Array1<f64>> {
    let table = meta.imro_table().ok_or_else(|| missing("imroTbl"))?;
    let file_name = meta.get_str("fileName").ok_or_else(|| missing("fileName"))?;

    let mut gains: Vec<f64> = if file_name.ends_with(AP_BAND_SUFFIX) {
        table.ap_gains().into_iter().map(f64::from).collect()
    } else if file_name.ends_with(LF_BAND_SUFFIX) {
        table
            .lf_gains()
            .ok_or_else(|| missing("lfgain"))?
            .into_iter()
            .map(f64::from)
            .collect()
    } else {
        return Err(SpikeGlxError::UnrecognizedFileKind(file_name.to_string()));
    };

    // One readout-table entry per neural channel; only sync channels get 1.0.
    if let Some(counts) = meta.imec_counts() {
        let neural = counts.ap + counts.lf;
        if gains.len() != neural {
            return Err(SpikeGlxError::GainChannelMismatch {
                gains: gains.len(),
                channels: neural,
            });
        }
        gains.resize(neural + counts.sy, 1.0);
    }

    Ok(Array1::from(gains))
}

fn nidq_gain(meta: &Metadata) -> Result<Array1<f64>> {
    let counts = ni_counts(meta)?;
    let mn_gain = meta.get_float("niMNGain").ok_or_else(|| missing("niMNGain"))?;
    let ma_gain = meta.get_float("niMAGain").ok_or_else(|| missing("niMAGain"))?;

    let total = counts.mn + counts.ma + counts.xa + counts.dw;
    let mut gains = Array1::<f64>::ones(total);
    gains.slice_mut(s![..counts.mn]).fill(mn_gain);
    gains
        .slice_mut(s![counts.mn..counts.mn + counts.ma])
        .fill(ma_gain);

    Ok(gains)
}

/// Returns the microvolts represented by one integer step on each channel.
///
/// `1e6 * AiRangeMax / MaxInt / gain`, with the imec keys checked before the
/// NI-DAQ keys and `MaxInt` falling back to 512. Zero values count as absent.
pub fn get_uv_per_bit(meta: &Metadata) -> Result<Array1<f64>> {
    let range_max = nonzero_float(meta, "imAiRangeMax")
        .or_else(|| nonzero_float(meta, "niAiRangeMax"))
        .ok_or_else(|| missing("imAiRangeMax"))?;
    let max_int = nonzero_float(meta, "imMaxInt")
        .or_else(|| nonzero_float(meta, "niMaxInt"))
        .unwrap_or(DEFAULT_MAX_INT);

    let gains = get_gain(meta)?;
    Ok(gains.mapv(|gain| MICROVOLTS_PER_VOLT * range_max / max_int / gain))
}
