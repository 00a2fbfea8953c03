use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::ops::Range;
use std::path::PathBuf;
use thiserror::Error;

/// Recording stream that produced a `.bin`/`.meta` pair.
///
/// SpikeGLX writes one file pair per imec probe stream and one for the
/// NI-DAQ stream. The value comes from the `typeThis` metadata key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingType {
    /// Neuropixels probe stream (`typeThis=imec`)
    Imec,
    /// National Instruments DAQ stream (`typeThis=nidq`)
    Nidq,
}

impl RecordingType {
    /// Parses the `typeThis` value.
    pub fn from_type_this(value: &str) -> Result<Self> {
        match value {
            "imec" => Ok(RecordingType::Imec),
            "nidq" => Ok(RecordingType::Nidq),
            other => Err(SpikeGlxError::UnknownRecordingType(other.to_string())),
        }
    }
}

/// Field layout of an imec readout table, selected by probe type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeLayout {
    /// NP 1.0-like probes, 6 fields per channel
    Np1,
    /// NP 2.0 single multiplexed shank, 4 fields per channel
    Np2SingleShank,
    /// NP 2.0 four-shank, 5 fields per channel
    Np2MultiShank,
}

impl ProbeLayout {
    /// Returns the layout for a probe type, or `None` for unknown hardware.
    pub fn from_probe_type(probe_type: u32) -> Option<Self> {
        match probe_type {
            0 | 1020 | 1030 | 1100 | 1120 | 1121 | 1122 | 1123 | 1200 | 1300 => {
                Some(ProbeLayout::Np1)
            }
            21 | 2003 | 2004 => Some(ProbeLayout::Np2SingleShank),
            24 | 2013 | 2014 => Some(ProbeLayout::Np2MultiShank),
            _ => None,
        }
    }

    /// Number of integers in one channel entry for this layout.
    pub fn field_count(self) -> usize {
        match self {
            ProbeLayout::Np1 => 6,
            ProbeLayout::Np2SingleShank => 4,
            ProbeLayout::Np2MultiShank => 5,
        }
    }
}

/// AP band gain of every NP 2.0 channel. These probes have no LF band.
pub const NP2_AP_GAIN: u32 = 80;

/// One channel entry of the imec readout table (`imroTbl`).
///
/// The variant is chosen by the probe type in the table header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImroEntry {
    /// NP 1.0-like channel
    Np1 {
        /// Channel ID
        channel: u32,
        /// Bank number of the connected electrode
        bank: u32,
        /// Reference ID index (0=ext, 1=tip, [2..4]=on-shank ref)
        ref_id: u32,
        /// AP band gain
        ap_gain: u32,
        /// LF band gain
        lf_gain: u32,
        /// Whether the AP highpass filter is applied
        ap_filter: bool,
    },
    /// NP 2.0 single multiplexed shank channel
    Np2SingleShank {
        /// Channel ID
        channel: u32,
        /// Bank mask (OR of 1=bank-0, 2=bank-1, 4=bank-2, 8=bank-3)
        bank_mask: u32,
        /// Reference ID index
        ref_id: u32,
        /// Electrode ID in [0, 1279]
        electrode: u32,
    },
    /// NP 2.0 four-shank channel
    Np2MultiShank {
        /// Channel ID
        channel: u32,
        /// Shank ID (shank-0 is left-most with tips pointing down)
        shank: u32,
        /// Bank ID
        bank: u32,
        /// Reference ID index
        ref_id: u32,
        /// Electrode ID in [0, 1279] on its shank
        electrode: u32,
    },
}

impl ImroEntry {
    /// Channel ID of this entry.
    pub fn channel(&self) -> u32 {
        match self {
            ImroEntry::Np1 { channel, .. }
            | ImroEntry::Np2SingleShank { channel, .. }
            | ImroEntry::Np2MultiShank { channel, .. } => *channel,
        }
    }

    /// AP band gain of this entry.
    pub fn ap_gain(&self) -> u32 {
        match self {
            ImroEntry::Np1 { ap_gain, .. } => *ap_gain,
            ImroEntry::Np2SingleShank { .. } | ImroEntry::Np2MultiShank { .. } => NP2_AP_GAIN,
        }
    }

    /// LF band gain of this entry; NP 2.0 probes have none.
    pub fn lf_gain(&self) -> Option<u32> {
        match self {
            ImroEntry::Np1 { lf_gain, .. } => Some(*lf_gain),
            _ => None,
        }
    }
}

/// Imec readout table parsed from `imroTbl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GainTable {
    /// Probe type code from the table header
    pub probe_type: u32,
    /// Channel count from the table header
    pub num_channels: u32,
    /// Channel entries. Empty when the probe type is not recognized.
    pub channels: Vec<ImroEntry>,
}

impl GainTable {
    /// Layout selected by the probe type, if known.
    pub fn layout(&self) -> Option<ProbeLayout> {
        ProbeLayout::from_probe_type(self.probe_type)
    }

    /// AP gains in table order.
    pub fn ap_gains(&self) -> Vec<u32> {
        self.channels.iter().map(ImroEntry::ap_gain).collect()
    }

    /// LF gains in table order, or `None` if any entry lacks an LF band.
    pub fn lf_gains(&self) -> Option<Vec<u32>> {
        self.channels.iter().map(ImroEntry::lf_gain).collect()
    }
}

/// Header of a `snsChanMap` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChanMapHeader {
    /// Five-field NI-DAQ header
    Nidq {
        /// Multiplexed neural channels
        mn_channels: u32,
        /// Multiplexed auxiliary channels
        ma_channels: u32,
        /// Multiplexing factor
        mux_channels: u32,
        /// Auxiliary analog channels
        xa_channels: u32,
        /// Digital words
        xd_words: u32,
    },
    /// Three-field imec header
    Imec {
        /// AP band channels
        ap_channels: u32,
        /// LF band channels
        lf_channels: u32,
        /// Sync channels
        sy_channels: u32,
    },
}

/// One `(name;channel:order)` entry of the channel map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChanMapEntry {
    /// Channel name as shown in SpikeGLX (e.g. "AP0")
    pub name: String,
    /// Saved channel index
    pub channel: u32,
    /// Display order
    pub order: u32,
}

/// Channel name map parsed from `snsChanMap`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelNameMap {
    /// Channel-type counts from the leading group
    pub header: ChanMapHeader,
    /// One entry per saved channel, in file order
    pub channel_map: Vec<ChanMapEntry>,
}

/// Header of a `snsGeomMap` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeomHeader {
    /// Probe part number (e.g. "NP1000")
    pub part_number: String,
    /// Number of shanks
    pub shank_count: u32,
    /// Center-to-center shank spacing (μm)
    pub shank_spacing: i32,
    /// Width of each shank (μm)
    pub per_shank_width: i32,
}

/// Physical placement of one electrode.
///
/// Coordinates are relative to the shank's own origin: X from the left edge
/// of the shank, Z from the center of the bottom-most electrode row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Electrode {
    /// Zero-based shank number
    pub shank: u32,
    /// X coordinate of the electrode center (μm)
    pub x: i32,
    /// Z coordinate of the electrode center (μm)
    pub z: i32,
    /// Whether the electrode is used
    pub used: bool,
}

impl Electrode {
    /// X coordinate across the whole probe, given the shank spacing.
    pub fn absolute_x(&self, shank_spacing: i32) -> i32 {
        self.x + self.shank as i32 * shank_spacing
    }
}

/// Electrode geometry parsed from `snsGeomMap`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryMap {
    /// Probe-wide dimensions
    pub header: GeomHeader,
    /// One electrode per saved neural channel
    pub electrodes: Vec<Electrode>,
}

impl GeometryMap {
    /// Absolute (x, z) position of every electrode, in file order.
    pub fn positions(&self) -> Vec<(i32, i32)> {
        self.electrodes
            .iter()
            .map(|e| (e.absolute_x(self.header.shank_spacing), e.z))
            .collect()
    }
}

/// NI-DAQ channel sub-counts from `snsMnMaXaDw` / `acqMnMaXaDw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiCounts {
    /// Multiplexed neural channels
    pub mn: usize,
    /// Multiplexed auxiliary channels
    pub ma: usize,
    /// Auxiliary analog channels
    pub xa: usize,
    /// Digital words
    pub dw: usize,
}

/// Imec channel sub-counts from `snsApLfSy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImecCounts {
    /// AP band channels
    pub ap: usize,
    /// LF band channels
    pub lf: usize,
    /// Sync channels
    pub sy: usize,
}

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    /// Value that parsed as a whole number
    Int(i64),
    /// Value that parsed as a decimal number
    Float(f64),
    /// Anything else, verbatim
    Str(String),
    /// `imroTbl`
    ImroTable(GainTable),
    /// `snsChanMap`
    ChanMap(ChannelNameMap),
    /// `snsGeomMap`
    GeomMap(GeometryMap),
    /// `snsMnMaXaDw` / `acqMnMaXaDw`
    NiCounts(NiCounts),
    /// `snsApLfSy`
    ImecCounts(ImecCounts),
}

/// Parsed contents of a `.meta` file.
///
/// Built once by [`crate::parse_meta`] and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub(crate) entries: BTreeMap<String, MetaValue>,
}

impl Metadata {
    /// Raw value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.entries.get(key)
    }

    /// Whether `key` was present in the file (without any `~` prefix).
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the file held no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Integer value for `key`; `None` for floats and strings.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.entries.get(key)? {
            MetaValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value for `key`; integers widen to `f64`.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.entries.get(key)? {
            MetaValue::Int(v) => Some(*v as f64),
            MetaValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String value for `key`; numeric values are not stringified.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.entries.get(key)? {
            MetaValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Parsed readout table (`imroTbl`).
    pub fn imro_table(&self) -> Option<&GainTable> {
        match self.entries.get("imroTbl")? {
            MetaValue::ImroTable(v) => Some(v),
            _ => None,
        }
    }

    /// Parsed channel name map (`snsChanMap`).
    pub fn chan_map(&self) -> Option<&ChannelNameMap> {
        match self.entries.get("snsChanMap")? {
            MetaValue::ChanMap(v) => Some(v),
            _ => None,
        }
    }

    /// Parsed electrode geometry (`snsGeomMap`).
    pub fn geom_map(&self) -> Option<&GeometryMap> {
        match self.entries.get("snsGeomMap")? {
            MetaValue::GeomMap(v) => Some(v),
            _ => None,
        }
    }

    /// Saved NI-DAQ sub-counts (`snsMnMaXaDw`).
    pub fn ni_counts(&self) -> Option<NiCounts> {
        match self.entries.get("snsMnMaXaDw")? {
            MetaValue::NiCounts(v) => Some(*v),
            _ => None,
        }
    }

    /// Saved imec sub-counts (`snsApLfSy`).
    pub fn imec_counts(&self) -> Option<ImecCounts> {
        match self.entries.get("snsApLfSy")? {
            MetaValue::ImecCounts(v) => Some(*v),
            _ => None,
        }
    }

    /// Recording type from `typeThis`.
    pub fn recording_type(&self) -> Result<RecordingType> {
        let value = self
            .get_str("typeThis")
            .ok_or_else(|| SpikeGlxError::MissingField("typeThis".to_string()))?;
        RecordingType::from_type_this(value)
    }

    /// Number of channels interleaved in the binary file (`nSavedChans`).
    pub fn n_saved_chans(&self) -> Result<usize> {
        self.get_int("nSavedChans")
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| SpikeGlxError::MissingField("nSavedChans".to_string()))
    }

    /// Sample rate in Hz, from `imSampRate` or else `niSampRate`.
    pub fn sample_rate(&self) -> Result<f64> {
        self.get_float("imSampRate")
            .or_else(|| self.get_float("niSampRate"))
            .ok_or_else(|| SpikeGlxError::MissingField("imSampRate".to_string()))
    }
}

/// A SpikeGLX recording: the resolved `.bin`/`.meta` pair and its metadata.
///
/// This is the struct returned by [`crate::load`].
///
/// # Examples
///
/// ```no_run
/// use spikeglx_importer::load;
///
/// let recording = load("path/to/run_g0_t0.imec0.ap.bin").unwrap();
/// println!("Sample rate: {} Hz", recording.meta().sample_rate().unwrap());
///
/// let data = recording.read_analog::<i16>(None, Some(0..3000)).unwrap();
/// println!("First sample: {} μV", data[[0, 0]]);
/// ```
#[derive(Debug, Clone)]
pub struct SpikeGlxFile {
    pub(crate) bin_path: PathBuf,
    pub(crate) meta_path: PathBuf,
    pub(crate) meta: Metadata,
}

impl SpikeGlxFile {
    /// Parsed metadata
    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    /// Path of the binary sample file
    pub fn bin_path(&self) -> &std::path::Path {
        &self.bin_path
    }

    /// Path of the metadata file
    pub fn meta_path(&self) -> &std::path::Path {
        &self.meta_path
    }

    pub fn recording_type(&self) -> Result<RecordingType> {
        self.meta.recording_type()
    }

    /// Analog and digital channel ranges of this recording.
    pub fn topology(&self) -> Result<ChannelTopology> {
        ChannelTopology::from_meta(&self.meta)
    }
}

/// Discrete digital event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// Falling edge (bit went 1 → 0)
    Offset = 0,
    /// Rising edge (bit went 0 → 1)
    Onset = 1,
}

impl From<bool> for EventType {
    fn from(level: bool) -> Self {
        if level {
            EventType::Onset
        } else {
            EventType::Offset
        }
    }
}

/// One transition on a digital bit line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event time in seconds (`sample / sample_rate`)
    pub time: f64,
    /// Index of the first sample after the transition
    pub sample: usize,
    /// Bit line index (`word * bits_per_word + bit`)
    pub channel: usize,
    /// Onset or offset
    pub kind: EventType,
}

/// Analog and digital index ranges over the saved channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTopology {
    pub recording_type: RecordingType,
    /// Continuous-valued channels
    pub analog: Range<usize>,
    /// Bit-packed digital word channels
    pub digital: Range<usize>,
}

impl ChannelTopology {
    /// Total channel count covered by both ranges.
    pub fn total(&self) -> usize {
        self.digital.end
    }
}

/// Which saved channels to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSelection {
    /// A contiguous block of channels
    Range(Range<usize>),
    /// An explicit list of channel indices, in output column order
    Indices(Vec<usize>),
}

impl ChannelSelection {
    /// Expands to explicit indices, checking each against `channel_count`.
    pub fn resolve(&self, channel_count: usize) -> Result<Vec<usize>> {
        let indices: Vec<usize> = match self {
            ChannelSelection::Range(r) => r.clone().collect(),
            ChannelSelection::Indices(v) => v.clone(),
        };
        if let Some(&bad) = indices.iter().find(|&&c| c >= channel_count) {
            return Err(SpikeGlxError::ChannelOutOfRange {
                channel: bad,
                channel_count,
            });
        }
        Ok(indices)
    }
}

impl From<Range<usize>> for ChannelSelection {
    fn from(range: Range<usize>) -> Self {
        ChannelSelection::Range(range)
    }
}

impl From<Vec<usize>> for ChannelSelection {
    fn from(indices: Vec<usize>) -> Self {
        ChannelSelection::Indices(indices)
    }
}

impl From<&[usize]> for ChannelSelection {
    fn from(indices: &[usize]) -> Self {
        ChannelSelection::Indices(indices.to_vec())
    }
}

/// Fixed-width little-endian integer stored in a SpikeGLX binary file.
///
/// Analog data is normally `i16`; digital words are read as `u16`.
pub trait Sample: Copy + Default + Into<f64> + Send + Sync + 'static {
    /// Width of one element in bytes
    const WIDTH: usize;

    /// Decodes one element from the first `WIDTH` bytes of `bytes`.
    fn from_le(bytes: &[u8]) -> Self;

    /// Raw bit pattern, zero-extended.
    fn bits(self) -> u64;
}

impl Sample for u8 {
    const WIDTH: usize = 1;

    fn from_le(bytes: &[u8]) -> Self {
        bytes[0]
    }

    fn bits(self) -> u64 {
        self as u64
    }
}

impl Sample for i8 {
    const WIDTH: usize = 1;

    fn from_le(bytes: &[u8]) -> Self {
        bytes[0] as i8
    }

    fn bits(self) -> u64 {
        self as u8 as u64
    }
}

macro_rules! impl_sample {
    ($ty:ty, $unsigned:ty, $width:expr, $read:ident) => {
        impl Sample for $ty {
            const WIDTH: usize = $width;

            fn from_le(bytes: &[u8]) -> Self {
                LittleEndian::$read(bytes)
            }

            fn bits(self) -> u64 {
                self as $unsigned as u64
            }
        }
    };
}

impl_sample!(i16, u16, 2, read_i16);
impl_sample!(u16, u16, 2, read_u16);
impl_sample!(i32, u32, 4, read_i32);
impl_sample!(u32, u32, 4, read_u32);

/// Errors raised while reading SpikeGLX files.
#[derive(Error, Debug)]
pub enum SpikeGlxError {
    /// Path ends in neither `.bin` nor `.meta`
    #[error("Filename must end with either '.meta' or '.bin': {}", .0.display())]
    InvalidFilename(PathBuf),

    /// One of the paired files does not exist
    #[error("The file {} does not exist", .0.display())]
    FileNotFound(PathBuf),

    /// A metadata line without `=`
    #[error("Malformed metadata line {line}: {content:?}")]
    MalformedLine { line: usize, content: String },

    /// A compound value whose header could not be parsed
    #[error("Invalid header format in {key}")]
    MalformedHeader { key: String },

    /// A compound value with an unparseable field or entry
    #[error("Invalid field {field:?} in {key}")]
    MalformedField { key: String, field: String },

    /// A metadata key required for the computation is absent
    #[error("Missing required metadata field: {0}")]
    MissingField(String),

    /// Imec binary filename has no recognized band suffix
    #[error("Unrecognized file type for imec recording: {0}")]
    UnrecognizedFileKind(String),

    /// `typeThis` is neither `imec` nor `nidq`
    #[error("Unrecognized recording type: {0}")]
    UnknownRecordingType(String),

    /// Sample range is reversed or runs past the end of the file
    #[error("Invalid sample range {start}..{end}: file holds {available} samples")]
    InvalidSampleRange {
        start: usize,
        end: usize,
        available: usize,
    },

    /// Selected channel index is not a saved channel
    #[error("Channel {channel} out of range for {channel_count} saved channels")]
    ChannelOutOfRange { channel: usize, channel_count: usize },

    /// Binary layout declares no channels
    #[error("Channel count must be positive")]
    ZeroChannels,

    /// Readout table does not supply one gain per neural channel
    #[error("Readout table gives {gains} gains for {channels} neural channels")]
    GainChannelMismatch { gains: usize, channels: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SpikeGlxError>;
