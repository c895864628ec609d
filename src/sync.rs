//! The task scheduler: walk the takeout tree, run one synchronization task
//! per media file across a bounded worker pool, and aggregate the outcomes.
//!
//! Tasks are independent; the collector loop below is the only writer of the
//! [`RunReport`].  Per-file failures are recorded and never abort the run.

use {
    crate::{
        media::{self, FormatFamily, MediaFile, MetadataError},
        plan::{self, SyncPlan},
        sidecar::{self, Resolution},
    },
    anyhow::{anyhow, Result},
    futures::{future::BoxFuture, stream, FutureExt, StreamExt},
    indicatif::{ProgressBar, ProgressStyle},
    std::{
        fmt,
        path::{Path, PathBuf},
        sync::Arc,
        time::Instant,
    },
    tokio::{fs, task},
    tracing::{debug, info, warn},
};

/// Where in the per-file pipeline a failure occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Parse,
    Scan,
    Apply,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Resolve => "sidecar resolution",
            Self::Parse => "sidecar parsing",
            Self::Scan => "file inspection",
            Self::Apply => "write",
        })
    }
}

#[derive(Clone, Debug)]
pub struct Failure {
    pub path: PathBuf,
    pub stage: Stage,
    pub message: String,
}

/// Aggregate outcome of one run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub processed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Sidecars whose GPS was the (0.0, 0.0) "unknown location" sentinel.
    pub gps_skipped: usize,
    pub failures: Vec<Failure>,
}

struct Task {
    file_name: String,
    path: PathBuf,
    family: FormatFamily,
    siblings: Arc<Vec<String>>,
}

enum OutcomeKind {
    Updated,
    InSync,
    Failed(Stage, String),
}

struct TaskResult {
    path: PathBuf,
    gps_sentinel: bool,
    kind: OutcomeKind,
}

impl TaskResult {
    fn failed(path: PathBuf, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            path,
            gps_sentinel: false,
            kind: OutcomeKind::Failed(stage, message.into()),
        }
    }
}

// Unreadable directories are skipped with a warning; only the root path is
// validated by the caller.
fn find_media(dir: PathBuf, result: &mut Vec<Task>) -> BoxFuture<'_, ()> {
    async move {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,

            Err(e) => {
                warn!("skipping unreadable directory {}: {}", dir.display(), e);

                return;
            }
        };

        let mut json_names = Vec::new();
        let mut media = Vec::new();
        let mut subdirectories = Vec::new();

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,

                Err(e) => {
                    warn!("error while reading {}: {}", dir.display(), e);

                    break;
                }
            };

            let path = entry.path();

            if path.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    let lowercase = name.to_lowercase();

                    if lowercase.starts_with(".trashed-") {
                        continue;
                    }

                    if lowercase.ends_with(".json") {
                        json_names.push(name.to_owned());
                    } else if let Some(family) = FormatFamily::from_path(&path) {
                        media.push((name.to_owned(), path, family));
                    }
                }
            } else if path.is_dir() {
                subdirectories.push(path);
            }
        }

        // Directory iteration order is platform-dependent; sort so a given
        // tree always enumerates the same way.
        media.sort_by(|a, b| a.0.cmp(&b.0));
        subdirectories.sort();

        let siblings = Arc::new(json_names);

        for (file_name, path, family) in media {
            result.push(Task {
                file_name,
                path,
                family,
                siblings: siblings.clone(),
            });
        }

        for subdirectory in subdirectories {
            find_media(subdirectory, result).await;
        }
    }
    .boxed()
}

/// Run `write`, retrying once on failure to absorb transient file-lock
/// contention.
fn with_retry(mut write: impl FnMut() -> Result<(), MetadataError>) -> Result<(), MetadataError> {
    write().or_else(|first| {
        warn!("write failed ({}); retrying once", first);

        write()
    })
}

fn apply(media: &MediaFile, plan: &SyncPlan) -> Result<(), MetadataError> {
    if plan.write_exif_datetime {
        with_retry(|| media::write_datetime(&media.path, media.family, plan.target))?;
    }

    if plan.write_exif_gps {
        if let Some(gps) = plan.target_gps {
            with_retry(|| media::write_gps(&media.path, media.family, gps))?;
        }
    }

    if plan.write_video_metadata {
        with_retry(|| media::write_video_datetime(&media.path, media.family, plan.target))?;
    }

    // Last, since the metadata writes above refresh the file's mtime.
    if plan.write_fs_timestamps {
        with_retry(|| {
            media::set_times(&media.path, plan.target, plan.target)?;

            Ok(())
        })?;
    }

    Ok(())
}

async fn process_file(task: Task, dry_run: bool) -> TaskResult {
    let Task {
        file_name,
        path,
        family,
        siblings,
    } = task;

    let sidecar_name = match sidecar::resolve(&file_name, &siblings) {
        Resolution::Matched { name, ambiguous } => {
            if ambiguous {
                warn!(
                    "ambiguous sidecar match for {}: using {}",
                    path.display(),
                    name
                );
            }

            name
        }

        Resolution::Unmatched => return TaskResult::failed(path, Stage::Resolve, "no sidecar found"),
    };

    let sidecar_path = path.with_file_name(&sidecar_name);

    let record = match fs::read(&sidecar_path).await {
        Ok(bytes) => match sidecar::parse(&bytes) {
            Ok(record) => record,

            Err(e) => {
                return TaskResult::failed(
                    path,
                    Stage::Parse,
                    format!("{}: {}", sidecar_path.display(), e),
                )
            }
        },

        Err(e) => {
            return TaskResult::failed(
                path,
                Stage::Parse,
                format!("unable to read {}: {}", sidecar_path.display(), e),
            )
        }
    };

    let gps_sentinel = record.gps_sentinel;

    // gexiv2 and mp4parse block on file I/O.
    let snapshot = {
        let path = path.clone();

        task::spawn_blocking(move || -> Result<_> {
            let media = MediaFile::snapshot(path, family)?;
            let state = media::read_state(&media.path, media.family);

            Ok((media, state))
        })
        .await
    };

    let (media, state) = match snapshot {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => return TaskResult::failed(path, Stage::Scan, e.to_string()),
        Err(e) => return TaskResult::failed(path, Stage::Scan, format!("worker panicked: {}", e)),
    };

    let plan = plan::plan(&media, &state, &record);

    if plan.is_empty() {
        debug!("{} already in sync", path.display());

        return TaskResult {
            path,
            gps_sentinel,
            kind: OutcomeKind::InSync,
        };
    }

    if dry_run {
        info!("would update {} ({})", path.display(), plan.describe());

        return TaskResult {
            path,
            gps_sentinel,
            kind: OutcomeKind::Updated,
        };
    }

    match task::spawn_blocking(move || apply(&media, &plan)).await {
        Ok(Ok(())) => {
            info!("updated {} ({})", path.display(), plan.describe());

            TaskResult {
                path,
                gps_sentinel,
                kind: OutcomeKind::Updated,
            }
        }

        Ok(Err(e)) => TaskResult::failed(path, Stage::Apply, e.to_string()),
        Err(e) => TaskResult::failed(path, Stage::Apply, format!("worker panicked: {}", e)),
    }
}

/// Synchronize every media file under `root`, running up to `workers` tasks
/// in parallel.  `dry_run` computes and reports pending changes without
/// writing anything.
///
/// Returns an error only for structural problems (`root` missing or not a
/// directory); per-file failures are recorded in the report.
pub async fn run(root: &Path, workers: usize, dry_run: bool) -> Result<RunReport> {
    if !root.is_dir() {
        return Err(anyhow!(
            "{} does not exist or is not a directory",
            root.display()
        ));
    }

    info!("scanning for media files in {}", root.display());

    let mut tasks = Vec::new();

    find_media(root.to_path_buf(), &mut tasks).await;

    info!("found {} media files", tasks.len());

    let then = Instant::now();

    let progress = ProgressBar::new(tasks.len() as u64);

    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("█▓░"),
    );

    let mut results = stream::iter(tasks.into_iter().map(|task| {
        let path = task.path.clone();

        task::spawn(process_file(task, dry_run)).map(move |joined| match joined {
            Ok(result) => result,
            Err(e) => TaskResult::failed(path, Stage::Scan, format!("worker panicked: {}", e)),
        })
    }))
    .buffer_unordered(workers.max(1));

    let mut report = RunReport::default();

    while let Some(result) = results.next().await {
        report.processed += 1;

        if result.gps_sentinel {
            report.gps_skipped += 1;
        }

        match result.kind {
            OutcomeKind::Updated => report.updated += 1,
            OutcomeKind::InSync => report.skipped += 1,

            OutcomeKind::Failed(stage, message) => {
                debug!("{} failed at {}: {}", result.path.display(), stage, message);

                report.failed += 1;

                report.failures.push(Failure {
                    path: result.path,
                    stage,
                    message,
                });
            }
        }

        progress.inc(1);
    }

    progress.finish_and_clear();

    // Completion order varies with scheduling; keep the report deterministic.
    report.failures.sort_by(|a, b| a.path.cmp(&b.path));

    info!(
        "run took {:?} ({} processed; {} updated; {} skipped; {} failed)",
        then.elapsed(),
        report.processed,
        report.updated,
        report.skipped,
        report.failed
    );

    Ok(report)
}

#[cfg(test)]
mod test {
    use {super::*, std::fs as std_fs, tempfile::TempDir};

    #[test]
    fn retry_succeeds_on_second_attempt() {
        let mut attempts = 0;

        let result = with_retry(|| {
            attempts += 1;

            if attempts == 1 {
                Err(MetadataError::Write("transient".into()))
            } else {
                Ok(())
            }
        });

        assert!(result.is_ok());
        assert_eq!(attempts, 2);
    }

    #[test]
    fn retry_gives_up_after_two_attempts() {
        let mut attempts = 0;

        let result = with_retry(|| {
            attempts += 1;

            Err(MetadataError::Write("persistent".into()))
        });

        assert!(result.is_err());
        assert_eq!(attempts, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn walk_collects_media_with_their_siblings() -> Result<()> {
        let dir = TempDir::new()?;

        std_fs::create_dir(dir.path().join("nested"))?;
        std_fs::write(dir.path().join("a.png"), b"x")?;
        std_fs::write(dir.path().join("a.png.json"), b"{}")?;
        std_fs::write(dir.path().join("notes.txt"), b"x")?;
        std_fs::write(dir.path().join(".trashed-b.png"), b"x")?;
        std_fs::write(dir.path().join("nested").join("b.mp4"), b"x")?;

        let mut tasks = Vec::new();

        find_media(dir.path().to_path_buf(), &mut tasks).await;

        let mut names = tasks
            .iter()
            .map(|task| task.file_name.clone())
            .collect::<Vec<_>>();

        names.sort();

        assert_eq!(names, ["a.png", "b.mp4"]);

        let a = tasks.iter().find(|task| task.file_name == "a.png").unwrap();

        assert_eq!(a.family, FormatFamily::TimestampOnlyImage);
        assert_eq!(a.siblings.as_slice(), ["a.png.json"]);

        let b = tasks.iter().find(|task| task.file_name == "b.mp4").unwrap();

        assert_eq!(b.family, FormatFamily::Video);
        assert!(b.siblings.is_empty());

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn walk_skips_unreadable_directories() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new()?;
        let locked = dir.path().join("locked");

        std_fs::create_dir(&locked)?;
        std_fs::write(locked.join("hidden.png"), b"x")?;
        std_fs::write(dir.path().join("outer.png"), b"x")?;

        std_fs::set_permissions(&locked, std_fs::Permissions::from_mode(0o000))?;

        let mut tasks = Vec::new();

        find_media(dir.path().to_path_buf(), &mut tasks).await;

        std_fs::set_permissions(&locked, std_fs::Permissions::from_mode(0o755))?;

        // The readable part of the tree is still collected.
        assert!(tasks.iter().any(|task| task.file_name == "outer.png"));

        Ok(())
    }
}
