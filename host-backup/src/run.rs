//! One backup run for one host.
//!
//! Order of work: read the partial count, pick the backup type, plan every
//! data-set against the catalog, transfer them in configuration order into
//! a new generation, mark it complete, thin the catalog, reconcile run logs,
//! and finally persist the new partial count.

use crate::catalog::marker::{GenerationMarker, MarkerStatus};
use crate::catalog::timestamp::Timestamp;
use crate::catalog::GenerationCatalog;
use crate::config::HostConfig;
use crate::executor::{run_transfer, TransferCommand, TransferOutcome};
use crate::fs::probe::FsProbe;
use crate::planner::{BackupType, TransferPlan, TransferPlanner};
use crate::reconcile::reconcile_logs;
use crate::retention;
use crate::state::StateStore;
use crate::utils::errors::{BackupError, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Identity of a run, carried into every log event through its span.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub host: String,
    pub run_id: Uuid,
    pub timestamp: Timestamp,
    pub dry_run: bool,
}

impl RunContext {
    pub fn new(host: &str, timestamp: Timestamp, dry_run: bool) -> Self {
        Self {
            host: host.to_string(),
            run_id: Uuid::new_v4(),
            timestamp,
            dry_run,
        }
    }

    pub fn span(&self) -> Span {
        info_span!(
            "backup",
            host = %self.host,
            run_id = %self.run_id,
            generation = %self.timestamp,
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Ignore the partial count and run Full
    pub force_full: bool,
}

/// Summary of a finished run
#[derive(Debug)]
pub struct RunReport {
    pub timestamp: Timestamp,
    pub backup_type: BackupType,
    pub datasets: usize,
    pub output_lines: usize,
    pub evicted: Vec<Timestamp>,
    pub abandoned: Vec<Timestamp>,
    pub removed_logs: usize,
    /// Generations and logs that could not be deleted
    pub failed_removals: usize,
    /// Count persisted at the end; `None` on a dry run
    pub partial_count: Option<u64>,
}

/// Run a backup of `config`'s data-sets into a new generation named by
/// `ctx.timestamp`.
pub async fn run_backup<P: FsProbe>(
    config: &HostConfig,
    ctx: &RunContext,
    options: RunOptions,
    probe: &P,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let span = ctx.span();
    run_inner(config, ctx, options, probe, cancel).instrument(span).await
}

async fn run_inner<P: FsProbe>(
    config: &HostConfig,
    ctx: &RunContext,
    options: RunOptions,
    probe: &P,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    ensure_target_root(&config.target_dir, ctx.dry_run)?;

    let state = StateStore::in_dir(&config.log_dir);
    let ordinal = state.run_ordinal();
    let backup_type = if options.force_full {
        BackupType::Full
    } else {
        BackupType::for_partial_count(ordinal, config.max_partials)
    };
    debug!(ordinal, max_partials = config.max_partials, %backup_type, "Selected backup type");

    let catalog = GenerationCatalog::scan(&config.target_dir)?;
    catalog.check_next(&ctx.timestamp)?;
    let generation = catalog.generation_path(&ctx.timestamp);

    let plans = TransferPlanner::new(config, probe).plan(&catalog, backup_type, &generation)?;

    let mut marker = GenerationMarker::running(
        &ctx.host,
        &ctx.run_id.to_string(),
        backup_type.as_str(),
        plans.iter().map(|p| p.dataset.dst.clone()).collect(),
    );
    if !ctx.dry_run {
        std::fs::create_dir_all(&generation)?;
        marker.write(&generation)?;
    }

    let mut output_lines = 0;
    for plan in &plans {
        if cancel.is_cancelled() {
            abandon(&mut marker, &generation, ctx.dry_run);
            return Err(BackupError::Cancelled);
        }

        let span = info_span!(
            "dataset",
            dataset = %plan.dataset.dst,
            source = %plan.dataset.src.display(),
        );
        match transfer_dataset(config, ctx, backup_type, plan, cancel).instrument(span).await {
            Ok(outcome) => output_lines += outcome.stdout_lines,
            Err(e) => {
                abandon(&mut marker, &generation, ctx.dry_run);
                return Err(e);
            }
        }
    }

    if !ctx.dry_run {
        marker.finish(MarkerStatus::Complete);
        marker.write(&generation)?;
    }
    info!("Generation {} complete", ctx.timestamp);

    let mut catalog = GenerationCatalog::scan(&config.target_dir)?;
    if ctx.dry_run {
        catalog = catalog.with_pending(&ctx.timestamp);
    }
    let retained = apply_retention(config, &catalog, ctx.dry_run);

    let partial_count = if ctx.dry_run {
        None
    } else {
        let next = backup_type.next_partial_count(state.get_partial_count());
        state.set_partial_count(next)?;
        Some(next)
    };

    let report = RunReport {
        timestamp: ctx.timestamp.clone(),
        backup_type,
        datasets: plans.len(),
        output_lines,
        evicted: retained.evicted,
        abandoned: retained.abandoned,
        removed_logs: retained.removed_logs,
        failed_removals: retained.failed_removals,
        partial_count,
    };

    info!(
        backup_type = %report.backup_type,
        datasets = report.datasets,
        evicted = report.evicted.len(),
        abandoned = report.abandoned.len(),
        removed_logs = report.removed_logs,
        failed_removals = report.failed_removals,
        "Backup run finished"
    );

    Ok(report)
}

async fn transfer_dataset(
    config: &HostConfig,
    ctx: &RunContext,
    backup_type: BackupType,
    plan: &TransferPlan,
    cancel: &CancellationToken,
) -> Result<TransferOutcome> {
    info!(
        "=== {} backup of '{}' to '{}'. ===",
        backup_type,
        plan.dataset.src.display(),
        plan.destination.display()
    );
    debug!(src_kind = %plan.src_kind, dst_kind = %plan.dst_kind, "Resolved transfer options");

    let command = TransferCommand::new(&config.transfer_program, plan.args(&config.excludes));
    debug!("{}", command.display());

    if ctx.dry_run {
        info!("Dry run, not executing: {}", command.display());
        return Ok(TransferOutcome::default());
    }

    std::fs::create_dir_all(&plan.destination)?;

    run_transfer(
        &command,
        &plan.dataset.dst,
        cancel,
        |line| info!(target: "transfer", "{}", line),
        |line| warn!(target: "transfer", "{}", line),
    )
    .await
}

struct RetentionSummary {
    evicted: Vec<Timestamp>,
    abandoned: Vec<Timestamp>,
    removed_logs: usize,
    failed_removals: usize,
}

/// Thin `catalog`, then drop the run logs of every generation that did not
/// survive. A generation whose removal failed still loses its log.
fn apply_retention(config: &HostConfig, catalog: &GenerationCatalog, dry_run: bool) -> RetentionSummary {
    let thinned = retention::thin(catalog, &config.retention, dry_run);

    let survivors: Vec<&Timestamp> = thinned.survivors.iter().map(|g| &g.timestamp).collect();
    debug!("timestamps: {:?}", survivors);

    let (removed_logs, failed_logs) = match reconcile_logs(&config.log_dir, &config.host, survivors, dry_run) {
        Ok(outcome) => (outcome.removed.len(), outcome.failed.len()),
        Err(e) => {
            warn!("Failed to reconcile logs in {}: {}", config.log_dir.display(), e);
            (0, 0)
        }
    };

    RetentionSummary {
        evicted: thinned.evicted.iter().map(|g| g.timestamp.clone()).collect(),
        abandoned: thinned.abandoned.iter().map(|g| g.timestamp.clone()).collect(),
        removed_logs,
        failed_removals: thinned.failed.len() + failed_logs,
    }
}

fn ensure_target_root(target_dir: &Path, dry_run: bool) -> Result<()> {
    if target_dir.exists() {
        if !target_dir.is_dir() {
            return Err(BackupError::NotADirectory(target_dir.to_path_buf()));
        }
    } else if !dry_run {
        std::fs::create_dir_all(target_dir)?;
    }
    Ok(())
}

/// Best-effort: mark a generation that will not be finished.
fn abandon(marker: &mut GenerationMarker, generation: &Path, dry_run: bool) {
    if dry_run {
        return;
    }
    marker.finish(MarkerStatus::Failed);
    if let Err(e) = marker.write(generation) {
        error!("Failed to mark {} as failed: {}", generation.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::GenerationState;
    use crate::config::{DataSet, TransferOptionRule};
    use crate::fs::probe::StaticProbe;
    use crate::reconcile::run_log_path;
    use crate::retention::{RetentionMode, RetentionPolicy};
    use crate::utils::logger::{run_log_layer, RunLogSink};
    use std::fs;
    use tempfile::TempDir;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    struct Fixture {
        _temp_dir: TempDir,
        config: HostConfig,
        probe: StaticProbe,
    }

    /// Host with two data-sets whose transfer tool is `echo`, so each
    /// transfer prints its own arguments and succeeds.
    fn fixture(max_backups: usize, max_tail: usize, max_partials: u64) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let home = root.join("src/home");
        let etc = root.join("src/etc");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(&etc).unwrap();

        let config = HostConfig {
            host: "lappy".to_string(),
            uid: "root".to_string(),
            target_dir: root.join("backups/lappy"),
            log_dir: root.join("bk_logs/lappy"),
            log_level: "info".to_string(),
            data: vec![
                DataSet {
                    src: home,
                    dst: "home".to_string(),
                },
                DataSet {
                    src: etc,
                    dst: "etc".to_string(),
                },
            ],
            excludes: vec![".cache".to_string()],
            rsync_opt_map: vec![TransferOptionRule {
                src_fs_type: vec!["ext4".to_string()],
                dst_fs_type: vec!["nfs4".to_string()],
                options: vec!["-a".to_string()],
            }],
            max_partials,
            retention: RetentionPolicy {
                max_backups,
                max_tail,
                mode: RetentionMode::Thin,
            },
            transfer_program: "echo".to_string(),
        };

        let probe = StaticProbe::new()
            .with(root.join("src"), "ext4")
            .with(root.join("backups"), "nfs4");

        Fixture {
            _temp_dir: temp_dir,
            config,
            probe,
        }
    }

    fn stamp(i: u32) -> Timestamp {
        Timestamp::parse(&format!("2024-03-{:02}--12:00:00", i)).unwrap()
    }

    async fn run(f: &Fixture, i: u32, options: RunOptions) -> Result<RunReport> {
        let ctx = RunContext::new("lappy", stamp(i), false);
        run_backup(&f.config, &ctx, options, &f.probe, &CancellationToken::new()).await
    }

    fn generation_names(f: &Fixture) -> Vec<String> {
        GenerationCatalog::scan(&f.config.target_dir)
            .unwrap()
            .generations()
            .iter()
            .map(|g| g.timestamp.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_first_run_is_full() {
        let f = fixture(4, 1, 4);
        let report = run(&f, 1, RunOptions::default()).await.unwrap();

        assert_eq!(report.backup_type, BackupType::Full);
        assert_eq!(report.datasets, 2);
        // `echo` prints one line per transfer.
        assert_eq!(report.output_lines, 2);
        assert_eq!(report.partial_count, Some(0));

        let generation = f.config.target_dir.join(stamp(1).as_str());
        assert!(generation.join("home").is_dir());
        assert!(generation.join("etc").is_dir());

        let catalog = GenerationCatalog::scan(&f.config.target_dir).unwrap();
        assert_eq!(catalog.generations()[0].state, GenerationState::Complete);
    }

    #[tokio::test]
    async fn test_cadence_and_partial_count() {
        let f = fixture(20, 1, 4);
        let state = StateStore::in_dir(&f.config.log_dir);

        let mut types = Vec::new();
        let mut counts = Vec::new();
        for i in 1..=9 {
            let report = run(&f, i, RunOptions::default()).await.unwrap();
            types.push(report.backup_type);
            counts.push(state.get_partial_count());
        }

        use BackupType::{Full as F, Incremental as I};
        assert_eq!(types, vec![F, I, I, I, F, I, I, I, F]);
        assert_eq!(counts, vec![0, 1, 2, 3, 0, 1, 2, 3, 0]);
    }

    #[tokio::test]
    async fn test_incremental_links_previous_generation() {
        let f = fixture(4, 1, 4);
        run(&f, 1, RunOptions::default()).await.unwrap();

        let log_dir = f.config.log_dir.clone();
        let report = run(&f, 2, RunOptions::default()).await.unwrap();
        assert_eq!(report.backup_type, BackupType::Incremental);
        assert_eq!(report.partial_count, Some(1));
        assert!(log_dir.join(".partials").exists());
    }

    #[tokio::test]
    async fn test_force_full_resets_count() {
        let f = fixture(4, 1, 4);
        run(&f, 1, RunOptions::default()).await.unwrap();
        run(&f, 2, RunOptions::default()).await.unwrap();

        let report = run(&f, 3, RunOptions { force_full: true }).await.unwrap();
        assert_eq!(report.backup_type, BackupType::Full);
        assert_eq!(report.partial_count, Some(0));
    }

    #[tokio::test]
    async fn test_retention_and_log_reconciliation() {
        let f = fixture(4, 1, 100);
        fs::create_dir_all(&f.config.log_dir).unwrap();

        for i in 1..=6 {
            // Stand-in for the run log the binary writes.
            fs::write(run_log_path(&f.config.log_dir, "lappy", &stamp(i)), b"log").unwrap();
            run(&f, i, RunOptions::default()).await.unwrap();
        }

        assert_eq!(
            generation_names(&f),
            vec![
                "2024-03-03--12:00:00",
                "2024-03-04--12:00:00",
                "2024-03-05--12:00:00",
                "2024-03-06--12:00:00",
            ]
        );
        for i in 1..=2 {
            assert!(!run_log_path(&f.config.log_dir, "lappy", &stamp(i)).exists());
        }
        for i in 3..=6 {
            assert!(run_log_path(&f.config.log_dir, "lappy", &stamp(i)).exists());
        }
    }

    #[tokio::test]
    async fn test_missing_baseline_for_new_dataset() {
        let mut f = fixture(4, 1, 4);
        run(&f, 1, RunOptions::default()).await.unwrap();

        let opt = f.config.target_dir.parent().unwrap().parent().unwrap().join("src/opt");
        fs::create_dir_all(&opt).unwrap();
        f.config.data.push(DataSet {
            src: opt,
            dst: "opt".to_string(),
        });

        let err = run(&f, 2, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackupError::MissingBaseline { ref dataset } if dataset == "opt"));

        // Nothing was written for the refused run, and the count is unchanged.
        assert_eq!(generation_names(&f), vec!["2024-03-01--12:00:00"]);
        assert_eq!(StateStore::in_dir(&f.config.log_dir).get_partial_count(), 0);

        // A forced Full run picks the new data-set up.
        run(&f, 3, RunOptions { force_full: true }).await.unwrap();
        assert!(f.config.target_dir.join(stamp(3).as_str()).join("opt").is_dir());
    }

    #[tokio::test]
    async fn test_failed_transfer_leaves_unusable_generation() {
        let mut f = fixture(4, 1, 4);
        run(&f, 1, RunOptions::default()).await.unwrap();

        f.config.transfer_program = "false".to_string();
        let err = run(&f, 2, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackupError::TransferFailed { ref dataset, .. } if dataset == "home"));

        // Second data-set never started.
        let failed = f.config.target_dir.join(stamp(2).as_str());
        assert!(failed.join("home").is_dir());
        assert!(!failed.join("etc").exists());
        assert_eq!(StateStore::in_dir(&f.config.log_dir).get_partial_count(), 0);

        let catalog = GenerationCatalog::scan(&f.config.target_dir).unwrap();
        assert_eq!(catalog.generations()[1].state, GenerationState::Incomplete);
        // The failed generation is never a baseline.
        assert_eq!(catalog.baseline_for("home").unwrap().timestamp, stamp(1));

        // The next good run clears it away.
        f.config.transfer_program = "echo".to_string();
        let report = run(&f, 3, RunOptions::default()).await.unwrap();
        assert_eq!(report.abandoned, vec![stamp(2)]);
        assert_eq!(
            generation_names(&f),
            vec!["2024-03-01--12:00:00", "2024-03-03--12:00:00"]
        );
    }

    #[tokio::test]
    async fn test_unmatched_fs_pair_mutates_nothing() {
        let mut f = fixture(4, 1, 4);
        f.config.rsync_opt_map.clear();

        let err = run(&f, 1, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackupError::NoTransferOptions { .. }));
        assert!(generation_names(&f).is_empty());
    }

    #[tokio::test]
    async fn test_target_not_a_directory() {
        let mut f = fixture(4, 1, 4);
        let file = f.config.target_dir.parent().unwrap().join("not-a-dir");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"x").unwrap();
        f.config.target_dir = file.clone();

        let err = run(&f, 1, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackupError::NotADirectory(ref p) if *p == file));
    }

    #[tokio::test]
    async fn test_timestamp_must_increase() {
        let f = fixture(4, 1, 4);
        run(&f, 2, RunOptions::default()).await.unwrap();

        let err = run(&f, 1, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackupError::TimestampNotIncreasing { .. }));
    }

    #[tokio::test]
    async fn test_dry_run_mutates_nothing() {
        let f = fixture(4, 1, 4);
        // The mount exists; the host directory under it does not yet.
        fs::create_dir_all(f.config.target_dir.parent().unwrap()).unwrap();

        let ctx = RunContext::new("lappy", stamp(1), true);
        let report = run_backup(&f.config, &ctx, RunOptions::default(), &f.probe, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.backup_type, BackupType::Full);
        assert_eq!(report.partial_count, None);
        assert!(!f.config.target_dir.exists());
        assert!(!f.config.log_dir.join(".partials").exists());
    }

    #[tokio::test]
    async fn test_dry_run_reports_real_evictions() {
        let f = fixture(4, 1, 100);
        for i in 1..=4 {
            run(&f, i, RunOptions::default()).await.unwrap();
        }

        let ctx = RunContext::new("lappy", stamp(5), true);
        let dry = run_backup(&f.config, &ctx, RunOptions::default(), &f.probe, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(dry.evicted, vec![stamp(1)]);
        assert_eq!(generation_names(&f).len(), 4);

        let real = run(&f, 5, RunOptions::default()).await.unwrap();
        assert_eq!(real.evicted, dry.evicted);
    }

    #[tokio::test]
    async fn test_failed_removal_still_drops_its_log() {
        let f = fixture(4, 1, 100);
        fs::create_dir_all(&f.config.log_dir).unwrap();
        for i in 1..=4 {
            fs::write(run_log_path(&f.config.log_dir, "lappy", &stamp(i)), b"log").unwrap();
            run(&f, i, RunOptions::default()).await.unwrap();
        }
        fs::create_dir(f.config.target_dir.join(stamp(5).as_str())).unwrap();
        fs::write(run_log_path(&f.config.log_dir, "lappy", &stamp(5)), b"log").unwrap();

        let catalog = GenerationCatalog::scan(&f.config.target_dir).unwrap();

        // The oldest generation turns into a plain file after the scan, so
        // removing it as a directory fails.
        let oldest = f.config.target_dir.join(stamp(1).as_str());
        fs::remove_dir_all(&oldest).unwrap();
        fs::write(&oldest, b"in the way").unwrap();

        let summary = apply_retention(&f.config, &catalog, false);

        assert_eq!(summary.evicted, vec![stamp(1)]);
        assert_eq!(summary.failed_removals, 1);
        assert_eq!(summary.removed_logs, 1);
        assert!(oldest.exists());
        assert!(!run_log_path(&f.config.log_dir, "lappy", &stamp(1)).exists());
        for i in 2..=5 {
            assert!(run_log_path(&f.config.log_dir, "lappy", &stamp(i)).exists());
        }
    }

    #[tokio::test]
    async fn test_transfer_output_streams_into_run_log() {
        let f = fixture(4, 1, 4);
        fs::create_dir_all(&f.config.log_dir).unwrap();
        let log_path = run_log_path(&f.config.log_dir, "lappy", &stamp(1));

        let sink = RunLogSink {
            file: fs::File::create(&log_path).unwrap(),
            level: "info".to_string(),
        };
        let (layer, _) = run_log_layer::<Registry>(sink);
        let subscriber = tracing_subscriber::registry().with(layer);

        let guard = tracing::subscriber::set_default(subscriber);
        run(&f, 1, RunOptions::default()).await.unwrap();
        drop(guard);

        let log = fs::read_to_string(&log_path).unwrap();
        let transfers: Vec<&str> = log.lines().filter(|line| line.contains(" transfer: ")).collect();

        assert_eq!(transfers.len(), 2);
        assert!(transfers[0].contains("src/home/ "));
        assert!(transfers[0].ends_with("/home"));
        assert!(transfers[1].contains("src/etc/ "));
        assert!(transfers[1].ends_with("/etc"));
        assert!(log.contains("Backup run finished"));
    }

    #[tokio::test]
    async fn test_cancelled_before_transfer() {
        let f = fixture(4, 1, 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ctx = RunContext::new("lappy", stamp(1), false);
        let err = run_backup(&f.config, &ctx, RunOptions::default(), &f.probe, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));

        let catalog = GenerationCatalog::scan(&f.config.target_dir).unwrap();
        assert_eq!(catalog.generations().len(), 1);
        assert!(!catalog.generations()[0].is_usable());
    }
}
