//! Conversion of drained tap data into subscriber replies

use crate::engine::property::{lookup_or_log, Tag, TRIGGER_NAME};
use crate::taps::DataSet;
use crate::types::{Acquisition, AcquisitionMode, STREAMING_TRIGGER_NAME, UNKNOWN_UNIT};
use crate::worker::cache::StreamingMetadata;

/// Name of the first timing event carrying a trigger name, or empty
pub fn find_trigger_name(tags: &[Tag]) -> String {
    tags.iter()
        .filter(|tag| tag.get(TRIGGER_NAME).is_some())
        .find_map(|tag| lookup_or_log::<String>(&tag.map, TRIGGER_NAME))
        .unwrap_or_default()
}

/// Reply for one streaming batch
///
/// Values are narrowed to `f32`; error and time-base arrays are zero-filled.
pub fn build_streaming_reply(
    metadata: &StreamingMetadata,
    requested_name: &str,
    samples: &[f64],
) -> Acquisition {
    Acquisition {
        acq_trigger_name: STREAMING_TRIGGER_NAME.to_string(),
        channel_name: metadata
            .signal_name
            .clone()
            .unwrap_or_else(|| requested_name.to_string()),
        channel_unit: metadata
            .signal_unit
            .clone()
            .unwrap_or_else(|| UNKNOWN_UNIT.to_string()),
        channel_range_min: metadata.signal_min.unwrap_or(f32::MIN),
        channel_range_max: metadata.signal_max.unwrap_or(f32::MAX),
        channel_value: samples.iter().map(|v| *v as f32).collect(),
        channel_error: vec![0.0; samples.len()],
        channel_time_base: vec![0; samples.len()],
        acq_local_time_stamp: 0,
    }
}

/// Reply for one dataset, or `None` when the dataset does not carry the
/// requested signal in [`AcquisitionMode::DataSet`] mode
///
/// Windowed modes fall back to the first signal. Only dataset mode slices
/// the value and error arrays down to the requested signal; a slice running
/// past the end of the data yields an empty array.
pub fn build_dataset_reply(
    mode: AcquisitionMode,
    requested_name: &str,
    dataset: &DataSet,
) -> Option<Acquisition> {
    let found = dataset.signal_names.iter().position(|n| n == requested_name);
    if mode == AcquisitionMode::DataSet && found.is_none() {
        return None;
    }
    let idx = found.unwrap_or(0);

    let mut reply = Acquisition {
        acq_trigger_name: dataset
            .timing_events
            .get(idx)
            .map(|events| find_trigger_name(events))
            .unwrap_or_default(),
        channel_name: dataset
            .signal_names
            .get(idx)
            .cloned()
            .unwrap_or_else(|| requested_name.to_string()),
        channel_unit: dataset
            .signal_units
            .get(idx)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_UNIT.to_string()),
        ..Acquisition::default()
    };

    if let Some([min, max]) = dataset.signal_ranges.get(idx).map(Vec::as_slice) {
        reply.channel_range_min = *min as f32;
        reply.channel_range_max = *max as f32;
    }

    let (values, errors) = if mode == AcquisitionMode::DataSet {
        let samples = dataset.samples_per_signal();
        let offset = idx * samples;
        (
            slice_or_empty(&dataset.signal_values, offset, samples),
            slice_or_empty(&dataset.signal_errors, offset, samples),
        )
    } else {
        (&dataset.signal_values[..], &dataset.signal_errors[..])
    };

    reply.channel_value = values.iter().map(|v| *v as f32).collect();
    reply.channel_error = errors.iter().map(|v| *v as f32).collect();
    reply.channel_time_base = vec![0; values.len()];
    Some(reply)
}

fn slice_or_empty(data: &[f64], offset: usize, len: usize) -> &[f64] {
    data.get(offset..offset + len).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::property::PropertyMap;

    fn two_signal_dataset() -> DataSet {
        let values: Vec<f64> = (0..200).map(f64::from).collect();
        DataSet {
            signal_names: vec!["A".into(), "B".into()],
            signal_units: vec!["V".into(), "A".into()],
            signal_ranges: vec![vec![-1.0, 1.0], vec![-5.0, 5.0]],
            extents: vec![2, 100],
            signal_errors: vec![0.5; values.len()],
            signal_values: values,
            timing_events: vec![
                vec![],
                vec![Tag::new(3, crate::property_map! { TRIGGER_NAME => "T1" })],
            ],
        }
    }

    #[test]
    fn test_streaming_reply_defaults() {
        let reply = build_streaming_reply(&StreamingMetadata::default(), "A", &[1.0, 2.5]);
        assert_eq!(reply.acq_trigger_name, "STREAMING");
        assert_eq!(reply.channel_name, "A");
        assert_eq!(reply.channel_unit, "N/A");
        assert_eq!(reply.channel_range_min, f32::MIN);
        assert_eq!(reply.channel_range_max, f32::MAX);
        assert_eq!(reply.channel_value, vec![1.0, 2.5]);
        assert_eq!(reply.channel_error, vec![0.0, 0.0]);
        assert_eq!(reply.channel_time_base, vec![0, 0]);
    }

    #[test]
    fn test_streaming_reply_uses_metadata() {
        let meta = StreamingMetadata {
            signal_name: Some("voltage".into()),
            signal_unit: Some("V".into()),
            signal_min: Some(-3.0),
            signal_max: Some(3.0),
        };
        let reply = build_streaming_reply(&meta, "A", &[0.0]);
        assert_eq!(reply.channel_name, "voltage");
        assert_eq!(reply.channel_unit, "V");
        assert_eq!(reply.channel_range_min, -3.0);
        assert_eq!(reply.channel_range_max, 3.0);
    }

    #[test]
    fn test_dataset_mode_slices_requested_signal() {
        let reply = build_dataset_reply(AcquisitionMode::DataSet, "B", &two_signal_dataset()).unwrap();
        assert_eq!(reply.channel_name, "B");
        assert_eq!(reply.channel_unit, "A");
        assert_eq!(reply.channel_value.len(), 100);
        assert_eq!(reply.channel_value[0], 100.0);
        assert_eq!(reply.channel_value[99], 199.0);
        assert_eq!(reply.channel_error.len(), 100);
        assert_eq!(reply.channel_time_base.len(), 100);
        assert_eq!(reply.channel_range_min, -5.0);
        assert_eq!(reply.acq_trigger_name, "T1");
    }

    #[test]
    fn test_dataset_mode_skips_absent_signal() {
        assert!(build_dataset_reply(AcquisitionMode::DataSet, "C", &two_signal_dataset()).is_none());
    }

    #[test]
    fn test_windowed_mode_falls_back_to_first_signal() {
        let reply =
            build_dataset_reply(AcquisitionMode::Triggered, "C", &two_signal_dataset()).unwrap();
        assert_eq!(reply.channel_name, "A");
        assert_eq!(reply.channel_unit, "V");
        // no slicing outside dataset mode
        assert_eq!(reply.channel_value.len(), 200);
        assert_eq!(reply.acq_trigger_name, "");
    }

    #[test]
    fn test_dataset_slice_out_of_range_is_empty() {
        let mut ds = two_signal_dataset();
        ds.signal_values.truncate(150);
        let reply = build_dataset_reply(AcquisitionMode::DataSet, "B", &ds).unwrap();
        assert!(reply.channel_value.is_empty());
        assert_eq!(reply.channel_error.len(), 100);
    }

    #[test]
    fn test_missing_units_and_ranges() {
        let ds = DataSet {
            signal_names: vec!["A".into(), "B".into()],
            signal_units: vec!["V".into()],
            signal_ranges: vec![vec![0.0, 1.0], vec![2.0]],
            extents: vec![2, 1],
            signal_values: vec![1.0, 2.0],
            ..DataSet::default()
        };
        let reply = build_dataset_reply(AcquisitionMode::DataSet, "B", &ds).unwrap();
        assert_eq!(reply.channel_unit, "N/A");
        assert_eq!(reply.channel_range_min, f32::MIN);
        assert_eq!(reply.channel_range_max, f32::MAX);
        assert_eq!(reply.channel_value, vec![2.0]);
    }

    #[test]
    fn test_unnamed_dataset_uses_requested_name() {
        let ds = DataSet {
            extents: vec![1, 2],
            signal_values: vec![1.0, 2.0],
            ..DataSet::default()
        };
        let reply = build_dataset_reply(AcquisitionMode::Snapshot, "X", &ds).unwrap();
        assert_eq!(reply.channel_name, "X");
    }

    #[test]
    fn test_find_trigger_name_skips_untagged_and_mistyped() {
        let tags = vec![
            Tag::new(0, PropertyMap::new()),
            Tag::new(1, crate::property_map! { TRIGGER_NAME => 3i64 }),
            Tag::new(2, crate::property_map! { TRIGGER_NAME => "T2" }),
        ];
        assert_eq!(find_trigger_name(&tags), "T2");
        assert_eq!(find_trigger_name(&[]), "");
    }
}
