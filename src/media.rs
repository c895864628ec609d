//! Format families and the metadata/timestamp adapters.
//!
//! Everything here is synchronous and may block on file I/O (gexiv2 and
//! mp4parse both read the file directly), so callers run these functions
//! under `task::spawn_blocking`.

use {
    anyhow::{anyhow, Result},
    chrono::{DateTime, Utc},
    filetime::FileTime,
    lazy_static::lazy_static,
    regex::Regex,
    rexiv2::{GpsInfo, Metadata as ExifMetadata},
    std::{
        fs::File,
        io,
        path::{Path, PathBuf},
    },
    tracing::debug,
};

/// Closed set of supported format families, resolved once from the file
/// extension at scan time and carried immutably on the [`MediaFile`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatFamily {
    /// Images whose container carries writable EXIF tags (JPEG, TIFF).
    ExifCapableImage,
    /// Images we only sync filesystem timestamps for (PNG, BMP).
    TimestampOnlyImage,
    /// Video containers.  Creation time is readable for MP4/MOV; in-container
    /// writes are an optional capability the current adapter does not provide.
    Video,
}

/// Per-family write capabilities consulted by the decision engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub write_datetime: bool,
    pub write_gps: bool,
    pub write_video_metadata: bool,
}

impl FormatFamily {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_lowercase();

        match extension.as_str() {
            "jpg" | "jpeg" | "tif" | "tiff" => Some(Self::ExifCapableImage),
            "png" | "bmp" => Some(Self::TimestampOnlyImage),
            "mp4" | "mov" | "avi" | "mkv" | "webm" | "m4v" | "3gp" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::ExifCapableImage => Capabilities {
                write_datetime: true,
                write_gps: true,
                write_video_metadata: false,
            },
            Self::TimestampOnlyImage | Self::Video => Capabilities {
                write_datetime: false,
                write_gps: false,
                write_video_metadata: false,
            },
        }
    }
}

/// GPS fix in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gps {
    pub latitude: f64,
    pub longitude: f64,
}

/// Immutable snapshot of one media file on disk, taken when its task starts.
#[derive(Clone, Debug)]
pub struct MediaFile {
    pub path: PathBuf,
    pub family: FormatFamily,
    pub mtime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
}

impl MediaFile {
    pub fn snapshot(path: PathBuf, family: FormatFamily) -> io::Result<Self> {
        let (mtime, atime) = get_times(&path)?;

        Ok(Self {
            path,
            family,
            mtime,
            atime,
        })
    }
}

/// Current in-file metadata state.  Unreadable metadata is reported as
/// absent, not as an error -- absence just means the tags will be written.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MediaState {
    pub datetime: Option<DateTime<Utc>>,
    pub gps: Option<Gps>,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("format does not support writing {0}")]
    Unsupported(&'static str),

    #[error("metadata write failed: {0}")]
    Write(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn exif_datetime(metadata: &ExifMetadata) -> Option<DateTime<Utc>> {
    let datetime = metadata
        .get_tag_string("Exif.Photo.DateTimeOriginal")
        .or_else(|_| metadata.get_tag_string("Exif.Image.DateTimeOriginal"))
        .or_else(|_| metadata.get_tag_string("Exif.Image.DateTime"))
        .ok()?;

    lazy_static! {
        static ref DATE_TIME_PATTERN: Regex =
            Regex::new(r"(\d{4}):(\d{2}):(\d{2}) (\d{2}):(\d{2}):(\d{2})").unwrap();
    };

    DATE_TIME_PATTERN
        .captures(&datetime)
        .map(|c| {
            format!(
                "{}-{}-{}T{}:{}:{}Z",
                &c[1], &c[2], &c[3], &c[4], &c[5], &c[6]
            )
        })?
        .parse()
        .ok()
}

const SECONDS_FROM_1904_TO_1970: u64 = 2_082_844_800;

fn mp4_datetime(path: &Path) -> Result<DateTime<Utc>> {
    let creation = mp4parse::read_mp4(&mut File::open(path)?)?
        .creation
        .ok_or_else(|| anyhow!("missing creation time"))?
        .0;

    let seconds = i64::try_from(creation.saturating_sub(SECONDS_FROM_1904_TO_1970))?;

    DateTime::from_timestamp(seconds, 0).ok_or_else(|| anyhow!("creation time out of range"))
}

/// Read the current in-file metadata for `path`.
pub fn read_state(path: &Path, family: FormatFamily) -> MediaState {
    match family {
        FormatFamily::ExifCapableImage => match ExifMetadata::new_from_path(path) {
            Ok(metadata) => MediaState {
                datetime: exif_datetime(&metadata),
                gps: metadata.get_gps_info().map(|gps| Gps {
                    latitude: gps.latitude,
                    longitude: gps.longitude,
                }),
            },

            Err(e) => {
                debug!("unable to read metadata for {}: {:?}", path.display(), e);

                MediaState::default()
            }
        },

        FormatFamily::Video => MediaState {
            datetime: match mp4_datetime(path) {
                Ok(datetime) => Some(datetime),
                Err(e) => {
                    debug!(
                        "unable to read creation time for {}: {:?}",
                        path.display(),
                        e
                    );

                    None
                }
            },
            gps: None,
        },

        FormatFamily::TimestampOnlyImage => MediaState::default(),
    }
}

const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Write the taken-at instant into the file's metadata tags.
pub fn write_datetime(
    path: &Path,
    family: FormatFamily,
    target: DateTime<Utc>,
) -> Result<(), MetadataError> {
    match family {
        FormatFamily::ExifCapableImage => {
            let metadata = open_for_write(path)?;
            let value = target.format(EXIF_DATETIME_FORMAT).to_string();

            for tag in ["Exif.Photo.DateTimeOriginal", "Exif.Image.DateTime"] {
                metadata
                    .set_tag_string(tag, &value)
                    .map_err(|e| MetadataError::Write(e.to_string()))?;
            }

            save(&metadata, path)
        }

        _ => Err(MetadataError::Unsupported("datetime tags")),
    }
}

/// Write a GPS fix into the file's metadata tags.
pub fn write_gps(path: &Path, family: FormatFamily, gps: Gps) -> Result<(), MetadataError> {
    match family {
        FormatFamily::ExifCapableImage => {
            let metadata = open_for_write(path)?;

            metadata
                .set_gps_info(&GpsInfo {
                    latitude: gps.latitude,
                    longitude: gps.longitude,
                    altitude: 0.0,
                })
                .map_err(|e| MetadataError::Write(e.to_string()))?;

            save(&metadata, path)
        }

        _ => Err(MetadataError::Unsupported("GPS tags")),
    }
}

/// In-container video metadata writes.  No current family reports this
/// capability (see [`FormatFamily::capabilities`]), so the decision engine
/// never requests it; a future MP4 writer slots in here.
pub fn write_video_datetime(
    _path: &Path,
    _family: FormatFamily,
    _target: DateTime<Utc>,
) -> Result<(), MetadataError> {
    Err(MetadataError::Unsupported("video container metadata"))
}

fn open_for_write(path: &Path) -> Result<ExifMetadata, MetadataError> {
    ExifMetadata::new_from_path(path).map_err(|e| MetadataError::Write(e.to_string()))
}

fn save(metadata: &ExifMetadata, path: &Path) -> Result<(), MetadataError> {
    metadata
        .save_to_file(path)
        .map_err(|e| MetadataError::Write(e.to_string()))
}

/// Filesystem timestamp adapter: read (mtime, atime).
pub fn get_times(path: &Path) -> io::Result<(DateTime<Utc>, DateTime<Utc>)> {
    let metadata = std::fs::metadata(path)?;

    Ok((
        from_file_time(FileTime::from_last_modification_time(&metadata)),
        from_file_time(FileTime::from_last_access_time(&metadata)),
    ))
}

/// Filesystem timestamp adapter: set (mtime, atime).
pub fn set_times(path: &Path, mtime: DateTime<Utc>, atime: DateTime<Utc>) -> io::Result<()> {
    filetime::set_file_times(path, to_file_time(atime), to_file_time(mtime))
}

fn from_file_time(time: FileTime) -> DateTime<Utc> {
    DateTime::from_timestamp(time.unix_seconds(), 0).unwrap_or_default()
}

fn to_file_time(time: DateTime<Utc>) -> FileTime {
    FileTime::from_unix_time(time.timestamp(), 0)
}
