//! Sidecar resolution and parsing.
//!
//! Takeout exports truncate and rename sidecar filenames in inconsistent
//! ways (suffix stripping, counter insertion like `(1)`, extension
//! duplication), so matching a media file to its sidecar is a ranked search
//! over the JSON files in the same directory.  The resolver is a pure
//! function over filenames so the ranking stays independently testable.

use {
    crate::media::Gps,
    anyhow::{anyhow, Result},
    chrono::{DateTime, Utc},
    lazy_static::lazy_static,
    regex::Regex,
    serde_derive::Deserialize,
};

/// Outcome of resolving a media filename against its sibling JSON files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Matched {
        name: String,
        /// True when another candidate tied at the winning score; the
        /// lexicographically smallest name was chosen.
        ambiguous: bool,
    },
    Unmatched,
}

/// Match quality, worst to best.  `Prefix` carries the common prefix length
/// so longer truncation matches outrank shorter ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Score {
    Counter,
    Prefix(usize),
    Exact,
}

fn strip_json(name: &str) -> Option<&str> {
    let split = name.len().checked_sub(".json".len())?;

    if name.is_char_boundary(split) && name[split..].eq_ignore_ascii_case(".json") {
        Some(&name[..split])
    } else {
        None
    }
}

/// The takeout dedup shape: `IMG_0001(1).JPG` is exported next to
/// `IMG_0001.JPG(1).json`, with the counter moved after the media extension.
fn counter_variant(media_name: &str) -> Option<String> {
    lazy_static! {
        static ref COUNTER_PATTERN: Regex = Regex::new(r"^(.*)\((\d+)\)(\.[^.]+)$").unwrap();
    };

    COUNTER_PATTERN
        .captures(media_name)
        .map(|c| format!("{}{}({})", &c[1], &c[3], &c[2]))
}

fn score(candidate: &str, media_name: &str, counter: Option<&str>) -> Option<Score> {
    if candidate == media_name {
        Some(Score::Exact)
    } else if !candidate.is_empty()
        && (media_name.starts_with(candidate) || candidate.starts_with(media_name))
    {
        Some(Score::Prefix(candidate.len().min(media_name.len())))
    } else if counter == Some(candidate) {
        Some(Score::Counter)
    } else {
        None
    }
}

/// Find the best-matching sidecar for `media_name` among `siblings`.
///
/// Deterministic: exact match beats the longest-common-prefix match beats
/// the counter-suffix match, and ties are broken by the lexicographically
/// smallest name.
pub fn resolve(media_name: &str, siblings: &[String]) -> Resolution {
    let counter = counter_variant(media_name);

    let mut best: Option<(Score, &str)> = None;
    let mut ambiguous = false;

    for sibling in siblings {
        let Some(candidate) = strip_json(sibling) else {
            continue;
        };

        let Some(score) = score(candidate, media_name, counter.as_deref()) else {
            continue;
        };

        match &mut best {
            None => best = Some((score, sibling)),

            Some((best_score, best_name)) => {
                if score > *best_score {
                    best = Some((score, sibling));
                    ambiguous = false;
                } else if score == *best_score {
                    ambiguous = true;

                    if sibling.as_str() < *best_name {
                        *best_name = sibling.as_str();
                    }
                }
            }
        }
    }

    match best {
        Some((_, name)) => Resolution::Matched {
            name: name.to_owned(),
            ambiguous,
        },

        None => Resolution::Unmatched,
    }
}

/// Parsed representation of one JSON sidecar.
#[derive(Clone, Debug, PartialEq)]
pub struct SidecarRecord {
    pub taken_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub gps: Option<Gps>,
    /// The export writes exactly (0.0, 0.0) when the location is unknown;
    /// that sentinel is reported here instead of as a fix.
    pub gps_sentinel: bool,
}

impl SidecarRecord {
    /// The instant the media item should be stamped with.  [`parse`]
    /// guarantees at least one of the two timestamps is present.
    pub fn target_instant(&self) -> DateTime<Utc> {
        debug_assert!(
            self.taken_at.is_some() || self.created_at.is_some(),
            "record constructed without a timestamp"
        );

        self.taken_at.or(self.created_at).unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct RawSidecar {
    #[serde(rename = "photoTakenTime")]
    photo_taken_time: Option<RawTime>,

    #[serde(rename = "creationTime")]
    creation_time: Option<RawTime>,

    #[serde(rename = "geoData")]
    geo_data: Option<RawGeo>,
}

#[derive(Deserialize)]
struct RawTime {
    timestamp: Option<RawTimestamp>,
}

// The export writes epoch seconds sometimes as a string and sometimes as a
// number.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Number(i64),
    Text(String),
}

#[derive(Deserialize)]
struct RawGeo {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl RawTime {
    fn instant(&self) -> Option<DateTime<Utc>> {
        let seconds = match self.timestamp.as_ref()? {
            RawTimestamp::Number(number) => *number,
            RawTimestamp::Text(text) => text.parse().ok()?,
        };

        DateTime::from_timestamp(seconds, 0)
    }
}

/// Parse sidecar JSON, requiring at least one usable timestamp.
pub fn parse(bytes: &[u8]) -> Result<SidecarRecord> {
    let raw = serde_json::from_slice::<RawSidecar>(bytes)?;

    let taken_at = raw.photo_taken_time.as_ref().and_then(RawTime::instant);
    let created_at = raw.creation_time.as_ref().and_then(RawTime::instant);

    if taken_at.is_none() && created_at.is_none() {
        return Err(anyhow!(
            "sidecar has neither a photoTakenTime nor a creationTime timestamp"
        ));
    }

    let (gps, gps_sentinel) = match raw.geo_data {
        Some(geo) => {
            let latitude = geo.latitude.unwrap_or(0.0);
            let longitude = geo.longitude.unwrap_or(0.0);

            if latitude == 0.0 && longitude == 0.0 {
                (None, true)
            } else {
                (
                    Some(Gps {
                        latitude,
                        longitude,
                    }),
                    false,
                )
            }
        }

        None => (None, false),
    };

    Ok(SidecarRecord {
        taken_at,
        created_at,
        gps,
        gps_sentinel,
    })
}
