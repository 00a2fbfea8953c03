//! Parser for SpikeGLX `.meta` files.
//!
//! A meta file is a list of `key=value` lines. Keys may carry a leading `~`
//! marker, which is dropped. Most values are plain numbers or strings; a few
//! keys hold small parenthesized tables that are parsed into typed records.

use std::fs;
use std::path::Path;

use crate::types::*;

/// Marker SpikeGLX puts in front of keys that the user should not edit.
const KEY_MARKER: char = '~';

/// Reads and parses a `.meta` file.
///
/// A path ending in `.bin` is redirected to its sibling `.meta` file.
pub fn read_meta<P: AsRef<Path>>(path: P) -> Result<Metadata> {
    let path = path.as_ref();
    let meta_path = if path.extension().is_some_and(|ext| ext == "bin") {
        path.with_extension("meta")
    } else {
        path.to_path_buf()
    };

    if !meta_path.exists() {
        return Err(SpikeGlxError::FileNotFound(meta_path));
    }

    let text = fs::read_to_string(&meta_path)?;
    let meta = parse_meta(&text)?;
    tracing::debug!(path = %meta_path.display(), keys = meta.len(), "Parsed meta file");
    Ok(meta)
}

/// Parses the text of a `.meta` file.
///
/// Fails on the first malformed line; no partial metadata is returned.
pub fn parse_meta(text: &str) -> Result<Metadata> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut meta = Metadata::default();

    for (index, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| SpikeGlxError::MalformedLine {
            line: index + 1,
            content: line.to_string(),
        })?;
        let key = key.strip_prefix(KEY_MARKER).unwrap_or(key);

        let parsed = parse_value(key, value)?;
        meta.entries.insert(key.to_string(), parsed);
    }

    Ok(meta)
}

/// Dispatches a single value to the grammar its key calls for.
fn parse_value(key: &str, value: &str) -> Result<MetaValue> {
    let parsed = match key {
        "imroTbl" => MetaValue::ImroTable(parse_imro_table(value)?),
        "snsChanMap" => MetaValue::ChanMap(parse_chan_map(value)?),
        "snsGeomMap" => MetaValue::GeomMap(parse_geom_map(value)?),
        "acqMnMaXaDw" | "snsMnMaXaDw" => {
            let [mn, ma, xa, dw] = parse_counts::<4>(key, value)?;
            MetaValue::NiCounts(NiCounts { mn, ma, xa, dw })
        }
        "snsApLfSy" => {
            let [ap, lf, sy] = parse_counts::<3>(key, value)?;
            MetaValue::ImecCounts(ImecCounts { ap, lf, sy })
        }
        _ => parse_scalar(value),
    };
    Ok(parsed)
}

/// Integer, then float, then the string itself.
fn parse_scalar(value: &str) -> MetaValue {
    if let Ok(v) = value.parse::<i64>() {
        MetaValue::Int(v)
    } else if let Ok(v) = value.parse::<f64>() {
        MetaValue::Float(v)
    } else {
        MetaValue::Str(value.to_string())
    }
}

/// Parses exactly `N` comma-separated counts.
fn parse_counts<const N: usize>(key: &str, value: &str) -> Result<[usize; N]> {
    let mut counts = [0usize; N];
    let mut fields = value.split(',');
    for slot in counts.iter_mut() {
        let field = fields.next().ok_or_else(|| malformed_field(key, value))?;
        *slot = parse_field(key, field)?;
    }
    if fields.next().is_some() {
        return Err(malformed_field(key, value));
    }
    Ok(counts)
}

/// Contents of every `(...)` group, in order.
///
/// Each group runs from a `(` to the next `)`.
fn paren_groups(value: &str) -> Vec<&str> {
    let mut groups = Vec::new();
    let mut rest = value;
    while let Some(open) = rest.find('(') {
        let after = &rest[open + 1..];
        match after.find(')') {
            Some(close) => {
                groups.push(&after[..close]);
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    groups
}

fn parse_field<T: std::str::FromStr>(key: &str, field: &str) -> Result<T> {
    field
        .trim()
        .parse()
        .map_err(|_| malformed_field(key, field))
}

fn malformed_field(key: &str, field: &str) -> SpikeGlxError {
    SpikeGlxError::MalformedField {
        key: key.to_string(),
        field: field.to_string(),
    }
}

fn malformed_header(key: &str) -> SpikeGlxError {
    SpikeGlxError::MalformedHeader {
        key: key.to_string(),
    }
}

/// Parses the imec readout table.
///
/// Entries whose field count does not match the probe layout are skipped, and
/// an unknown probe type yields an empty channel list.
pub fn parse_imro_table(value: &str) -> Result<GainTable> {
    const KEY: &str = "imroTbl";

    let groups = paren_groups(value);
    let (header, entries) = groups.split_first().ok_or_else(|| malformed_header(KEY))?;

    let header_fields: Vec<&str> = header.split(',').collect();
    let [probe_type, num_channels] = header_fields.as_slice() else {
        return Err(malformed_header(KEY));
    };
    let probe_type: u32 = probe_type.trim().parse().map_err(|_| malformed_header(KEY))?;
    let num_channels: u32 = num_channels.trim().parse().map_err(|_| malformed_header(KEY))?;

    let layout = ProbeLayout::from_probe_type(probe_type);
    if layout.is_none() {
        tracing::warn!(probe_type, "Unknown probe type, readout table has no channels");
    }

    let mut channels = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = entry
            .split_whitespace()
            .map(|f| parse_field::<u32>(KEY, f))
            .collect::<Result<Vec<u32>>>()?;

        let parsed = match (layout, fields.as_slice()) {
            (Some(ProbeLayout::Np1), &[channel, bank, ref_id, ap_gain, lf_gain, ap_filter]) => {
                Some(ImroEntry::Np1 {
                    channel,
                    bank,
                    ref_id,
                    ap_gain,
                    lf_gain,
                    ap_filter: ap_filter != 0,
                })
            }
            (Some(ProbeLayout::Np2SingleShank), &[channel, bank_mask, ref_id, electrode]) => {
                Some(ImroEntry::Np2SingleShank {
                    channel,
                    bank_mask,
                    ref_id,
                    electrode,
                })
            }
            (Some(ProbeLayout::Np2MultiShank), &[channel, shank, bank, ref_id, electrode]) => {
                Some(ImroEntry::Np2MultiShank {
                    channel,
                    shank,
                    bank,
                    ref_id,
                    electrode,
                })
            }
            _ => None,
        };

        match (parsed, layout) {
            (Some(parsed), _) => channels.push(parsed),
            (None, Some(layout)) => tracing::debug!(
                expected = layout.field_count(),
                got = fields.len(),
                "Skipping readout entry with unexpected field count"
            ),
            (None, None) => {}
        }
    }

    Ok(GainTable {
        probe_type,
        num_channels,
        channels,
    })
}

/// Parses the channel name map.
///
/// The header is the leading group: five counts for NI-DAQ, three for imec.
/// Channel entries have the form `(name;channel:order)`.
pub fn parse_chan_map(value: &str) -> Result<ChannelNameMap> {
    const KEY: &str = "snsChanMap";

    let header = value
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .map(|(inner, _)| inner)
        .ok_or_else(|| malformed_header(KEY))?;

    let counts = header
        .split(',')
        .map(|f| if is_digits(f) { f.parse::<u32>().ok() } else { None })
        .collect::<Option<Vec<u32>>>()
        .ok_or_else(|| malformed_header(KEY))?;

    let header = match counts.as_slice() {
        &[mn_channels, ma_channels, mux_channels, xa_channels, xd_words] => ChanMapHeader::Nidq {
            mn_channels,
            ma_channels,
            mux_channels,
            xa_channels,
            xd_words,
        },
        &[ap_channels, lf_channels, sy_channels] => ChanMapHeader::Imec {
            ap_channels,
            lf_channels,
            sy_channels,
        },
        _ => return Err(malformed_header(KEY)),
    };

    let mut channel_map = Vec::new();
    for group in paren_groups(value) {
        let Some((name, indices)) = group.split_once(';') else {
            continue;
        };
        let Some((channel, order)) = indices.split_once(':') else {
            continue;
        };
        if name.is_empty() || !is_digits(channel) || !is_digits(order) {
            continue;
        }
        channel_map.push(ChanMapEntry {
            name: name.to_string(),
            channel: parse_field(KEY, channel)?,
            order: parse_field(KEY, order)?,
        });
    }

    Ok(ChannelNameMap {
        header,
        channel_map,
    })
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parses the electrode geometry map.
///
/// Header: `(part_number,shank_count,shank_spacing,per_shank_width)`.
/// Electrodes: `(shank:x:z:used)`.
pub fn parse_geom_map(value: &str) -> Result<GeometryMap> {
    const KEY: &str = "snsGeomMap";

    let groups: Vec<&str> = paren_groups(value)
        .into_iter()
        .filter(|g| !g.is_empty())
        .collect();
    let (header, entries) = groups.split_first().ok_or_else(|| malformed_header(KEY))?;

    let fields: Vec<&str> = header.split(',').collect();
    if fields.len() < 4 {
        return Err(malformed_header(KEY));
    }
    let header = GeomHeader {
        part_number: fields[0].to_string(),
        shank_count: fields[1].trim().parse().map_err(|_| malformed_header(KEY))?,
        shank_spacing: fields[2].trim().parse().map_err(|_| malformed_header(KEY))?,
        per_shank_width: fields[3].trim().parse().map_err(|_| malformed_header(KEY))?,
    };

    let electrodes = entries
        .iter()
        .map(|entry| -> Result<Electrode> {
            let fields: Vec<&str> = entry.split(':').collect();
            let [shank, x, z, used] = fields.as_slice() else {
                return Err(malformed_field(KEY, entry));
            };
            Ok(Electrode {
                shank: parse_field(KEY, shank)?,
                x: parse_field(KEY, x)?,
                z: parse_field(KEY, z)?,
                used: parse_field::<i32>(KEY, used)? != 0,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(GeometryMap { header, electrodes })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NP1_META: &str = "\
acqApLfSy=384,384,1
imAiRangeMax=0.6
imMaxInt=512
imSampRate=30000
nSavedChans=385
snsApLfSy=384,0,1
typeThis=imec
fileName=D:/data/run_g0/run_g0_t0.imec0.ap.bin
~imroTbl=(0,384)(0 0 0 500 250 1)(1 0 0 500 250 1)(2 1 0 1000 50 0)
~snsChanMap=(384,0,1)(AP0;0:0)(AP1;1:1)(SY0;384:384)
~snsGeomMap=(NP1000,1,0,70)(0:27:0:1)(0:59:0:1)(0:11:20:0)
";

    #[test]
    fn test_parse_strips_marker_and_types_scalars() {
        let meta = parse_meta(NP1_META).unwrap();

        assert!(meta.contains_key("imroTbl"));
        assert!(!meta.contains_key("~imroTbl"));
        assert_eq!(meta.get_int("nSavedChans"), Some(385));
        assert_eq!(meta.get("imAiRangeMax"), Some(&MetaValue::Float(0.6)));
        assert_eq!(meta.get_float("imSampRate"), Some(30000.0));
        assert_eq!(meta.get_str("typeThis"), Some("imec"));
        // acqApLfSy has no dedicated grammar and falls through to a string
        assert_eq!(meta.get_str("acqApLfSy"), Some("384,384,1"));
        assert_eq!(meta.len(), 11);
    }

    #[test]
    fn test_parse_is_deterministic() {
        assert_eq!(parse_meta(NP1_META).unwrap(), parse_meta(NP1_META).unwrap());
    }

    #[test]
    fn test_line_without_equals_is_malformed() {
        let err = parse_meta("nSavedChans=385\nthis line is broken\n").unwrap_err();
        match err {
            SpikeGlxError::MalformedLine { line, content } => {
                assert_eq!(line, 2);
                assert_eq!(content, "this line is broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_value_splits_on_first_equals_only() {
        let meta = parse_meta("userNotes=a=b\n").unwrap();
        assert_eq!(meta.get_str("userNotes"), Some("a=b"));
    }

    #[test]
    fn test_blank_lines_and_bom_are_ignored() {
        let meta = parse_meta("\u{feff}nSavedChans=2\n\n   \ntypeThis=nidq\r\n").unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.get_str("typeThis"), Some("nidq"));
    }

    #[test]
    fn test_np1_gains_round_trip() {
        let table = parse_imro_table("(0,384)(0 0 0 500 250 1)(1 0 0 500 250 1)(2 1 0 1000 50 0)")
            .unwrap();

        assert_eq!(table.probe_type, 0);
        assert_eq!(table.num_channels, 384);
        assert_eq!(table.layout(), Some(ProbeLayout::Np1));
        assert_eq!(table.ap_gains(), vec![500, 500, 1000]);
        assert_eq!(table.lf_gains(), Some(vec![250, 250, 50]));
        assert_eq!(
            table.channels[2],
            ImroEntry::Np1 {
                channel: 2,
                bank: 1,
                ref_id: 0,
                ap_gain: 1000,
                lf_gain: 50,
                ap_filter: false,
            }
        );
    }

    #[test]
    fn test_np2_entries_use_fixed_ap_gain() {
        let single = parse_imro_table("(21,384)(0 1 0 0)(1 1 0 1)").unwrap();
        assert_eq!(single.channels.len(), 2);
        assert_eq!(single.ap_gains(), vec![80, 80]);
        assert_eq!(single.lf_gains(), None);

        let multi = parse_imro_table("(24,384)(0 2 0 0 96)").unwrap();
        assert_eq!(
            multi.channels,
            vec![ImroEntry::Np2MultiShank {
                channel: 0,
                shank: 2,
                bank: 0,
                ref_id: 0,
                electrode: 96,
            }]
        );
    }

    #[test]
    fn test_imro_entries_with_wrong_field_count_are_dropped() {
        let table =
            parse_imro_table("(0,384)(0 0 0 500 250 1)(1 0 0 500)(2 0 0 500 250 1)").unwrap();
        let channels: Vec<u32> = table.channels.iter().map(ImroEntry::channel).collect();
        assert_eq!(channels, vec![0, 2]);
    }

    #[test]
    fn test_unknown_probe_type_yields_empty_table() {
        let table = parse_imro_table("(9999,384)(0 0 0 500 250 1)(1 0 0 500 250 1)").unwrap();
        assert_eq!(table.probe_type, 9999);
        assert_eq!(table.num_channels, 384);
        assert!(table.channels.is_empty());
    }

    #[test]
    fn test_imro_bad_header_and_field() {
        assert!(matches!(
            parse_imro_table("no groups"),
            Err(SpikeGlxError::MalformedHeader { .. })
        ));
        assert!(matches!(
            parse_imro_table("(0,384,7)(0 0 0 500 250 1)"),
            Err(SpikeGlxError::MalformedHeader { .. })
        ));
        assert!(matches!(
            parse_imro_table("(0,384)(0 0 x 500 250 1)"),
            Err(SpikeGlxError::MalformedField { .. })
        ));
    }

    #[test]
    fn test_chan_map_imec_header() {
        let map = parse_chan_map("(384,0,1)(AP0;0:0)(AP1;1:1)(SY0;384:384)").unwrap();
        assert_eq!(
            map.header,
            ChanMapHeader::Imec {
                ap_channels: 384,
                lf_channels: 0,
                sy_channels: 1,
            }
        );
        assert_eq!(map.channel_map.len(), 3);
        assert_eq!(map.channel_map[0].name, "AP0");
        assert_eq!(map.channel_map[2].channel, 384);
        assert_eq!(map.channel_map[2].order, 384);
    }

    #[test]
    fn test_chan_map_nidq_header() {
        let map = parse_chan_map("(0,0,1,2,1)(XA0;0:0)(XA1;1:1)(XD0;2:2)").unwrap();
        assert_eq!(
            map.header,
            ChanMapHeader::Nidq {
                mn_channels: 0,
                ma_channels: 0,
                mux_channels: 1,
                xa_channels: 2,
                xd_words: 1,
            }
        );
        let names: Vec<&str> = map.channel_map.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["XA0", "XA1", "XD0"]);
    }

    #[test]
    fn test_chan_map_bad_header() {
        assert!(matches!(
            parse_chan_map("(1,2)(AP0;0:0)"),
            Err(SpikeGlxError::MalformedHeader { .. })
        ));
        assert!(matches!(
            parse_chan_map("AP0;0:0"),
            Err(SpikeGlxError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_geom_map() {
        let geom = parse_geom_map("(NP2014,4,250,70)(0:27:0:1)(3:59:15:0)").unwrap();
        assert_eq!(geom.header.part_number, "NP2014");
        assert_eq!(geom.header.shank_count, 4);
        assert_eq!(geom.header.shank_spacing, 250);
        assert_eq!(geom.header.per_shank_width, 70);
        assert_eq!(geom.electrodes.len(), 2);
        assert!(geom.electrodes[0].used);
        assert!(!geom.electrodes[1].used);
        assert_eq!(geom.positions(), vec![(27, 0), (809, 15)]);
    }

    #[test]
    fn test_geom_map_errors() {
        assert!(matches!(
            parse_geom_map(""),
            Err(SpikeGlxError::MalformedHeader { .. })
        ));
        assert!(matches!(
            parse_geom_map("(NP1000,1,0,70)(0:27:0)"),
            Err(SpikeGlxError::MalformedField { .. })
        ));
    }

    #[test]
    fn test_counts() {
        let meta =
            parse_meta("snsMnMaXaDw=0,0,8,1\nacqMnMaXaDw=0,0,8,1\nsnsApLfSy=384,0,1\n").unwrap();
        assert_eq!(
            meta.ni_counts(),
            Some(NiCounts { mn: 0, ma: 0, xa: 8, dw: 1 })
        );
        assert!(matches!(meta.get("acqMnMaXaDw"), Some(MetaValue::NiCounts(_))));
        assert_eq!(meta.imec_counts(), Some(ImecCounts { ap: 384, lf: 0, sy: 1 }));

        let err = parse_meta("snsApLfSy=384,0\n").unwrap_err();
        assert!(matches!(err, SpikeGlxError::MalformedField { ref key, .. } if key == "snsApLfSy"));
    }
}
