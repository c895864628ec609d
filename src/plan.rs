//! The sync decision engine: compare what is on disk to what the sidecar
//! says and compute the minimal set of writes.

use {
    crate::{
        media::{Gps, MediaFile, MediaState},
        sidecar::SidecarRecord,
    },
    chrono::{DateTime, Utc},
};

/// Instants this close together are considered equal, absorbing the
/// timezone and rounding skew the export introduces.
pub const TIME_TOLERANCE_SECS: i64 = 60;

/// Coordinates this close together (in degrees) are considered equal.
pub const GPS_EPSILON: f64 = 1e-4;

/// Pending writes for one media file.  An empty plan means the file is
/// already in sync.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncPlan {
    pub write_exif_datetime: bool,
    pub write_exif_gps: bool,
    pub write_video_metadata: bool,
    pub write_fs_timestamps: bool,
    pub target: DateTime<Utc>,
    pub target_gps: Option<Gps>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        !(self.write_exif_datetime
            || self.write_exif_gps
            || self.write_video_metadata
            || self.write_fs_timestamps)
    }

    /// Short human-readable list of the pending writes, for logging.
    pub fn describe(&self) -> String {
        let mut pending = Vec::new();

        if self.write_exif_datetime {
            pending.push("EXIF datetime");
        }

        if self.write_exif_gps {
            pending.push("EXIF GPS");
        }

        if self.write_video_metadata {
            pending.push("video metadata");
        }

        if self.write_fs_timestamps {
            pending.push("file timestamps");
        }

        pending.join(", ")
    }
}

pub fn instants_match(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_seconds().abs() <= TIME_TOLERANCE_SECS
}

fn gps_matches(a: Gps, b: Gps) -> bool {
    (a.latitude - b.latitude).abs() <= GPS_EPSILON && (a.longitude - b.longitude).abs() <= GPS_EPSILON
}

/// Compute the minimal write set bringing `media` in sync with `sidecar`.
///
/// Metadata writes are narrowed by the family's capability table; the
/// filesystem timestamp write applies to every format.
pub fn plan(media: &MediaFile, state: &MediaState, sidecar: &SidecarRecord) -> SyncPlan {
    let target = sidecar.target_instant();
    let capabilities = media.family.capabilities();

    let datetime_stale = state
        .datetime
        .map_or(true, |current| !instants_match(current, target));

    let gps_stale = sidecar.gps.map_or(false, |target_gps| {
        state
            .gps
            .map_or(true, |current| !gps_matches(current, target_gps))
    });

    let write_exif_datetime = capabilities.write_datetime && datetime_stale;
    let write_exif_gps = capabilities.write_gps && gps_stale;
    let write_video_metadata = capabilities.write_video_metadata && datetime_stale;

    // Metadata writes rewrite the container, which refreshes the file's
    // mtime, so any of them forces the timestamp write as well.
    let metadata_write = write_exif_datetime || write_exif_gps || write_video_metadata;

    SyncPlan {
        write_exif_datetime,
        write_exif_gps,
        write_video_metadata,
        write_fs_timestamps: metadata_write
            || !instants_match(media.mtime, target)
            || !instants_match(media.atime, target),
        target,
        target_gps: sidecar.gps,
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::media::FormatFamily, std::path::PathBuf};

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn media(family: FormatFamily, times: DateTime<Utc>) -> MediaFile {
        MediaFile {
            path: PathBuf::from("IMG_0001.JPG"),
            family,
            mtime: times,
            atime: times,
        }
    }

    fn sidecar(
        taken_at: Option<DateTime<Utc>>,
        created_at: Option<DateTime<Utc>>,
        gps: Option<Gps>,
    ) -> SidecarRecord {
        SidecarRecord {
            taken_at,
            created_at,
            gps,
            gps_sentinel: gps.is_none(),
        }
    }

    /// Simulate applying `plan` and return the resulting on-disk view.
    fn applied(media: &MediaFile, state: &MediaState, plan: &SyncPlan) -> (MediaFile, MediaState) {
        let mut media = media.clone();
        let mut state = *state;

        if plan.write_exif_datetime || plan.write_video_metadata {
            state.datetime = Some(plan.target);
        }

        if plan.write_exif_gps {
            state.gps = plan.target_gps;
        }

        // Rewriting the container refreshes the filesystem mtime.
        if plan.write_exif_datetime || plan.write_exif_gps || plan.write_video_metadata {
            media.mtime = at(8_888_888);
            media.atime = at(8_888_888);
        }

        if plan.write_fs_timestamps {
            media.mtime = plan.target;
            media.atime = plan.target;
        }

        (media, state)
    }

    #[test]
    fn tolerance_boundary_is_sixty_seconds() {
        let target = at(1_000_000);

        assert!(instants_match(at(1_000_060), target));
        assert!(instants_match(at(999_940), target));
        assert!(!instants_match(at(1_000_061), target));
        assert!(!instants_match(at(999_939), target));
    }

    #[test]
    fn in_sync_file_yields_empty_plan() {
        let target = at(1_000_000);
        let media = media(FormatFamily::ExifCapableImage, at(1_000_030));
        let state = MediaState {
            datetime: Some(at(999_950)),
            gps: None,
        };

        let plan = plan(&media, &state, &sidecar(Some(target), None, None));

        assert!(plan.is_empty());
    }

    #[test]
    fn missing_exif_datetime_and_stale_mtime_requests_both_writes() {
        // Media with no EXIF datetime whose mtime is far from the target:
        // datetime and timestamps get written, GPS does not (the sidecar
        // carried the zero sentinel).
        let target = at(1_000_000);
        let media = media(FormatFamily::ExifCapableImage, at(2_000_000));

        let plan = plan(
            &media,
            &MediaState::default(),
            &sidecar(Some(target), None, None),
        );

        assert!(plan.write_exif_datetime);
        assert!(plan.write_fs_timestamps);
        assert!(!plan.write_exif_gps);
        assert!(!plan.write_video_metadata);
        assert_eq!(plan.target, target);
    }

    #[test]
    fn gps_written_when_absent_or_stale() {
        let target = at(1_000_000);
        let fix = Gps {
            latitude: 52.5,
            longitude: 13.4,
        };
        let media = media(FormatFamily::ExifCapableImage, target);
        let record = sidecar(Some(target), None, Some(fix));

        // No current fix.
        let state = MediaState {
            datetime: Some(target),
            gps: None,
        };

        assert!(plan(&media, &state, &record).write_exif_gps);

        // Current fix beyond the epsilon.
        let state = MediaState {
            datetime: Some(target),
            gps: Some(Gps {
                latitude: 52.501,
                longitude: 13.4,
            }),
        };

        assert!(plan(&media, &state, &record).write_exif_gps);

        // Current fix within the epsilon.
        let state = MediaState {
            datetime: Some(target),
            gps: Some(Gps {
                latitude: 52.50001,
                longitude: 13.40001,
            }),
        };

        assert!(!plan(&media, &state, &record).write_exif_gps);
    }

    #[test]
    fn absent_sidecar_gps_never_requests_a_gps_write() {
        let target = at(1_000_000);
        let media = media(FormatFamily::ExifCapableImage, at(2_000_000));

        // The parser already collapses the (0.0, 0.0) sentinel to None.
        let plan = plan(
            &media,
            &MediaState::default(),
            &sidecar(Some(target), None, None),
        );

        assert!(!plan.write_exif_gps);
        assert_eq!(plan.target_gps, None);
    }

    #[test]
    fn videos_only_sync_filesystem_timestamps() {
        let target = at(1_000_000);
        let media = media(FormatFamily::Video, at(2_000_000));

        let plan = plan(
            &media,
            &MediaState::default(),
            &sidecar(None, Some(target), None),
        );

        assert!(!plan.write_exif_datetime);
        assert!(!plan.write_exif_gps);
        assert!(!plan.write_video_metadata);
        assert!(plan.write_fs_timestamps);
    }

    #[test]
    fn video_with_close_mtime_is_already_in_sync() {
        // creationTime fallback, mtime within tolerance: nothing to do.
        let target = at(1_000_000);
        let media = media(FormatFamily::Video, at(1_000_059));

        let plan = plan(
            &media,
            &MediaState::default(),
            &sidecar(None, Some(target), None),
        );

        assert!(plan.is_empty());
    }

    #[test]
    fn metadata_write_forces_a_timestamp_write() {
        // EXIF datetime absent but mtime already at the target: writing the
        // tags will bump mtime, so the timestamps must be rewritten too.
        let target = at(1_000_000);
        let media = media(FormatFamily::ExifCapableImage, target);

        let plan = plan(
            &media,
            &MediaState::default(),
            &sidecar(Some(target), None, None),
        );

        assert!(plan.write_exif_datetime);
        assert!(plan.write_fs_timestamps);
    }

    #[test]
    fn plans_are_idempotent() {
        let target = at(1_000_000);
        let fix = Gps {
            latitude: -33.9,
            longitude: 151.2,
        };

        for (family, state, times) in [
            (FormatFamily::ExifCapableImage, MediaState::default(), at(7_000_000)),
            (
                FormatFamily::ExifCapableImage,
                MediaState {
                    datetime: Some(at(5)),
                    gps: Some(Gps {
                        latitude: 1.0,
                        longitude: 2.0,
                    }),
                },
                at(7_000_000),
            ),
            // Fresh mtime but stale metadata: the metadata write refreshes
            // mtime, so the plan must rewrite the timestamps too.
            (FormatFamily::ExifCapableImage, MediaState::default(), target),
            (FormatFamily::TimestampOnlyImage, MediaState::default(), at(7_000_000)),
            (FormatFamily::Video, MediaState::default(), at(7_000_000)),
        ] {
            let media = media(family, times);
            let record = sidecar(Some(target), Some(at(3)), Some(fix));

            let first = plan(&media, &state, &record);
            let (media, state) = applied(&media, &state, &first);

            assert!(
                plan(&media, &state, &record).is_empty(),
                "re-planning after apply should be a no-op for {:?}",
                family
            );
        }
    }
}
