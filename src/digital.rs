//! Digital event extraction.
//!
//! Each digital channel stores a packed word per sample. Words are split into
//! bit lines (least significant bit first) and every change of a line between
//! two consecutive samples becomes an [`EventRecord`].

use ndarray::Array2;
use std::path::Path;

use crate::meta::read_meta;
use crate::reader::{read_bin, resolve_paths};
use crate::topology::get_channel_idx;
use crate::types::*;

/// Reads the digital channels of a recording and returns their transitions.
///
/// Events are ordered by sample, then by bit line. The first sample never
/// produces an event since there is nothing before it to compare against.
///
/// # Examples
///
/// ```no_run
/// use spikeglx_importer::{read_digital, EventType};
///
/// let events = read_digital::<u16, _>("run_g0_t0.nidq.bin").unwrap();
/// for event in events.iter().filter(|e| e.kind == EventType::Onset) {
///     println!("line {} went high at {:.4} s", event.channel, event.time);
/// }
/// ```
pub fn read_digital<T: Sample, P: AsRef<Path>>(path: P) -> Result<Vec<EventRecord>> {
    let (bin_path, meta_path) = resolve_paths(path)?;
    let meta = read_meta(&meta_path)?;
    read_digital_with_meta::<T>(&bin_path, &meta)
}

pub(crate) fn read_digital_with_meta<T: Sample>(
    bin_path: &Path,
    meta: &Metadata,
) -> Result<Vec<EventRecord>> {
    let channel_count = meta.n_saved_chans()?;
    let sample_rate = meta.sample_rate()?;
    let selection = ChannelSelection::Range(get_channel_idx(meta, false)?);

    let words = read_bin::<T, _>(bin_path, channel_count, Some(&selection), None)?;
    let bits = unpack_bits(&words);
    let events = detect_events(&bits, sample_rate);

    tracing::info!(
        lines = bits.ncols(),
        samples = bits.nrows(),
        events = events.len(),
        "Extracted digital events"
    );

    Ok(events)
}

impl SpikeGlxFile {
    /// Transitions on every digital bit line of this recording.
    pub fn read_digital<T: Sample>(&self) -> Result<Vec<EventRecord>> {
        read_digital_with_meta::<T>(self.bin_path(), self.meta())
    }
}

/// Expands every word into its bits.
///
/// Column `word * bits_per_word + bit` of the result holds bit `bit` of
/// column `word` of the input, counting from the least significant bit.
pub fn unpack_bits<T: Sample>(words: &Array2<T>) -> Array2<bool> {
    let bits_per_word = T::WIDTH * 8;
    let n_lines = words.ncols() * bits_per_word;

    Array2::from_shape_fn((words.nrows(), n_lines), |(sample, line)| {
        let word = words[[sample, line / bits_per_word]].bits();
        (word >> (line % bits_per_word)) & 1 == 1
    })
}

/// Finds every level change in a `[n_samples, n_lines]` bit matrix.
///
/// An event is stamped with the first sample at the new level, and its kind
/// is that new level.
pub fn detect_events(bits: &Array2<bool>, sample_rate: f64) -> Vec<EventRecord> {
    let mut events = Vec::new();

    for sample in 1..bits.nrows() {
        let before = bits.row(sample - 1);
        let after = bits.row(sample);
        for (channel, (&prev, &next)) in before.iter().zip(after.iter()).enumerate() {
            if prev != next {
                events.push(EventRecord {
                    time: sample as f64 / sample_rate,
                    sample,
                    channel,
                    kind: EventType::from(next),
                });
            }
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_unpack_bits_lsb_first() {
        let words = arr2(&[[0b0000_0101u8, 0b1000_0000]]);
        let bits = unpack_bits(&words);
        assert_eq!(bits.shape(), &[1, 16]);

        let high: Vec<usize> = (0..16).filter(|&line| bits[[0, line]]).collect();
        assert_eq!(high, vec![0, 2, 15]);
    }

    #[test]
    fn test_unpack_bits_multibyte_word() {
        let words = arr2(&[[0x0100u16], [-1i16 as u16]]);
        let bits = unpack_bits(&words);
        assert_eq!(bits.shape(), &[2, 16]);
        assert!(bits[[0, 8]]);
        assert_eq!(bits.row(0).iter().filter(|&&b| b).count(), 1);
        assert!(bits.row(1).iter().all(|&b| b));
    }

    #[test]
    fn test_single_onset() {
        let bits = arr2(&[[false], [true]]);
        let events = detect_events(&bits, 1000.0);
        assert_eq!(
            events,
            vec![EventRecord {
                time: 0.001,
                sample: 1,
                channel: 0,
                kind: EventType::Onset,
            }]
        );
    }

    #[test]
    fn test_events_ordered_by_sample_then_channel() {
        let bits = arr2(&[
            [true, false, false],
            [true, true, false],
            [false, false, true],
            [false, false, true],
        ]);
        let events = detect_events(&bits, 10.0);

        let summary: Vec<(usize, usize, EventType)> =
            events.iter().map(|e| (e.sample, e.channel, e.kind)).collect();
        assert_eq!(
            summary,
            vec![
                (1, 1, EventType::Onset),
                (2, 0, EventType::Offset),
                (2, 1, EventType::Offset),
                (2, 2, EventType::Onset),
            ]
        );
        assert!(events.iter().all(|e| e.sample > 0));
        assert!((events[1].time - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_no_events_for_short_or_constant_input() {
        assert!(detect_events(&arr2(&[[true, false]]), 1.0).is_empty());
        assert!(detect_events(&Array2::from_elem((0, 3), false), 1.0).is_empty());
        assert!(detect_events(&Array2::from_elem((5, 3), true), 1.0).is_empty());
    }
}
