use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use serde::Serialize;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::capabilities::CatalogClient;
use crate::config::ResolvedConfig;
use crate::error::PackError;
use crate::manifest::{self, ManifestRow};
use crate::plan::{DownloadItem, build_plan};
use crate::transfer::{TransferClient, TransferOutcome};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunSummary {
    pub planned: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub no_data: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub rows: Vec<ManifestRow>,
}

/// Sequences one full run: discover, plan, download (unless discovery-only),
/// report. Per-item failures are recorded, never propagated; only discovery
/// and manifest writing can fail the run.
pub struct PackRunner<C: CatalogClient, T: TransferClient> {
    config: ResolvedConfig,
    catalog: C,
    transfer: T,
}

impl<C: CatalogClient, T: TransferClient> PackRunner<C, T> {
    pub fn new(config: ResolvedConfig, catalog: C, transfer: T) -> Self {
        Self {
            config,
            catalog,
            transfer,
        }
    }

    pub fn run(&self, cancel: &CancelToken) -> Result<RunReport, PackError> {
        info!(base_url = %self.config.base_url, "discovering catalog");
        let typenames = self.catalog.feature_type_names()?;
        let coverage_ids = if self.config.include_rasters {
            self.catalog.coverage_ids()?
        } else {
            Vec::new()
        };
        info!(
            feature_types = typenames.len(),
            coverages = coverage_ids.len(),
            "discovery complete"
        );

        let mut items = build_plan(
            &typenames,
            &coverage_ids,
            &self.config.patterns,
            &self.config.pack_dir,
            &self.config.base_url,
            self.config.include_rasters,
        );
        info!(planned = items.len(), "plan built");

        fs::create_dir_all(self.config.pack_dir.as_std_path())
            .map_err(|err| PackError::Filesystem(err.to_string()))?;
        // Inventory written up front so even an interrupted run leaves one.
        manifest::write_manifest(&self.config.pack_dir, &items)?;
        manifest::write_readme(
            &self.config.pack_dir,
            &self.config.raw_patterns,
            self.config.include_rasters,
            &self.config.base_url,
        )?;

        let mut summary = RunSummary {
            planned: items.len(),
            ..RunSummary::default()
        };

        if !self.config.discover_only {
            self.execute(&mut items, cancel, &mut summary);
            manifest::write_manifest(&self.config.pack_dir, &items)?;
        }

        info!(
            planned = summary.planned,
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            failed = summary.failed,
            "run complete"
        );
        Ok(RunReport {
            rows: manifest::rows_for(&items, &self.config.pack_dir),
            summary,
        })
    }

    fn execute(&self, items: &mut [DownloadItem], cancel: &CancelToken, summary: &mut RunSummary) {
        let mut pending = Vec::new();
        for (index, item) in items.iter().enumerate() {
            if !self.config.force && materialized(item) {
                summary.skipped += 1;
                continue;
            }
            pending.push(index);
        }

        let cursor = AtomicUsize::new(0);
        let results = Mutex::new(Vec::<(usize, TransferOutcome)>::new());
        let workers = self.config.concurrency.min(pending.len().max(1));
        {
            let shared: &[DownloadItem] = items;
            thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(|| {
                        loop {
                            if cancel.is_cancelled() {
                                break;
                            }
                            let next = cursor.fetch_add(1, Ordering::SeqCst);
                            let Some(&index) = pending.get(next) else {
                                break;
                            };
                            let item = &shared[index];
                            info!(kind = %item.kind, name = %item.name, "downloading");
                            let outcome = self.transfer.fetch(item, cancel);
                            match &outcome {
                                TransferOutcome::Downloaded { bytes } => {
                                    info!(kind = %item.kind, name = %item.name, bytes, "downloaded");
                                }
                                TransferOutcome::NoData => {
                                    info!(kind = %item.kind, name = %item.name, "no data");
                                }
                                TransferOutcome::Cancelled => {
                                    warn!(kind = %item.kind, name = %item.name, "cancelled");
                                }
                                TransferOutcome::Failed {
                                    class,
                                    message,
                                    attempts,
                                } => {
                                    warn!(
                                        kind = %item.kind,
                                        name = %item.name,
                                        %class,
                                        attempts,
                                        %message,
                                        "failed"
                                    );
                                }
                            }
                            results.lock().unwrap().push((index, outcome));
                            if !self.config.sleep_between.is_zero() && !cancel.is_cancelled() {
                                thread::sleep(self.config.sleep_between);
                            }
                        }
                    });
                }
            });
        }

        for (index, outcome) in results.into_inner().unwrap() {
            match outcome {
                TransferOutcome::Downloaded { .. } => summary.downloaded += 1,
                TransferOutcome::NoData => summary.no_data += 1,
                TransferOutcome::Cancelled => summary.cancelled += 1,
                TransferOutcome::Failed { .. } => summary.failed += 1,
            }
            items[index].last_error = outcome.error_text();
        }
    }
}

/// Disk state is authoritative: present with non-zero size means done.
fn materialized(item: &DownloadItem) -> bool {
    fs::metadata(item.out_path.as_std_path())
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use camino::Utf8PathBuf;

    use crate::config::PackConfig;
    use crate::transfer::ErrorClass;

    use super::*;

    struct FixedCatalog {
        typenames: Vec<String>,
        coverages: Vec<String>,
    }

    impl CatalogClient for FixedCatalog {
        fn feature_type_names(&self) -> Result<Vec<String>, PackError> {
            Ok(self.typenames.clone())
        }

        fn coverage_ids(&self) -> Result<Vec<String>, PackError> {
            Ok(self.coverages.clone())
        }
    }

    struct WritingTransfer {
        calls: AtomicUsize,
    }

    impl TransferClient for WritingTransfer {
        fn fetch(&self, item: &DownloadItem, _cancel: &CancelToken) -> TransferOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(item.out_path.parent().unwrap().as_std_path()).unwrap();
            fs::write(item.out_path.as_std_path(), b"payload").unwrap();
            TransferOutcome::Downloaded { bytes: 7 }
        }
    }

    struct FailingTransfer;

    impl TransferClient for FailingTransfer {
        fn fetch(&self, _item: &DownloadItem, _cancel: &CancelToken) -> TransferOutcome {
            TransferOutcome::Failed {
                class: ErrorClass::Permanent,
                message: "HTTP 404 Not Found".to_string(),
                attempts: 1,
            }
        }
    }

    fn config(pack_dir: Utf8PathBuf) -> ResolvedConfig {
        let mut config = PackConfig::new(
            "https://example-geoserver/ows",
            pack_dir,
            vec!["dakshina_kannada_".to_string()],
        );
        config.sleep_between = std::time::Duration::ZERO;
        config.resolve().unwrap()
    }

    fn pack_dir(temp: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(temp.path().join("pack")).unwrap()
    }

    fn catalog() -> FixedCatalog {
        FixedCatalog {
            typenames: vec![
                "ns:dakshina_kannada_sulya".to_string(),
                "ns:other_block".to_string(),
            ],
            coverages: Vec::new(),
        }
    }

    #[test]
    fn end_to_end_vector_pack() {
        let temp = tempfile::tempdir().unwrap();
        let dir = pack_dir(&temp);
        let transfer = WritingTransfer {
            calls: AtomicUsize::new(0),
        };
        let runner = PackRunner::new(config(dir.clone()), catalog(), transfer);

        let report = runner.run(&CancelToken::new()).unwrap();
        assert_eq!(report.summary.planned, 2);
        assert_eq!(report.summary.downloaded, 2);
        assert_eq!(report.summary.failed, 0);
        assert!(
            dir.join("vectors_geojson/ns_dakshina_kannada_sulya.geojson")
                .as_std_path()
                .exists()
        );
        assert!(
            dir.join("vectors_kml/ns_dakshina_kannada_sulya.kml")
                .as_std_path()
                .exists()
        );
        assert!(report.rows.iter().all(|row| row.exists));
        assert!(dir.join("manifest.csv").as_std_path().exists());
        assert!(dir.join("README.md").as_std_path().exists());
    }

    #[test]
    fn second_run_performs_no_transfers() {
        let temp = tempfile::tempdir().unwrap();
        let dir = pack_dir(&temp);

        let first = PackRunner::new(
            config(dir.clone()),
            catalog(),
            WritingTransfer {
                calls: AtomicUsize::new(0),
            },
        );
        first.run(&CancelToken::new()).unwrap();
        let first_manifest = fs::read_to_string(dir.join("manifest.csv").as_std_path()).unwrap();

        let second = PackRunner::new(
            config(dir.clone()),
            catalog(),
            WritingTransfer {
                calls: AtomicUsize::new(0),
            },
        );
        let report = second.run(&CancelToken::new()).unwrap();
        assert_eq!(report.summary.skipped, 2);
        assert_eq!(report.summary.downloaded, 0);
        let second_manifest = fs::read_to_string(dir.join("manifest.csv").as_std_path()).unwrap();
        assert_eq!(first_manifest, second_manifest);
    }

    #[test]
    fn force_redownloads_existing_items() {
        let temp = tempfile::tempdir().unwrap();
        let dir = pack_dir(&temp);
        PackRunner::new(
            config(dir.clone()),
            catalog(),
            WritingTransfer {
                calls: AtomicUsize::new(0),
            },
        )
        .run(&CancelToken::new())
        .unwrap();

        let mut forced = config(dir.clone());
        forced.force = true;
        let report = PackRunner::new(
            forced,
            catalog(),
            WritingTransfer {
                calls: AtomicUsize::new(0),
            },
        )
        .run(&CancelToken::new())
        .unwrap();
        assert_eq!(report.summary.downloaded, 2);
        assert_eq!(report.summary.skipped, 0);
    }

    #[test]
    fn per_item_failures_do_not_abort_the_run() {
        let temp = tempfile::tempdir().unwrap();
        let dir = pack_dir(&temp);
        let runner = PackRunner::new(config(dir.clone()), catalog(), FailingTransfer);

        let report = runner.run(&CancelToken::new()).unwrap();
        assert_eq!(report.summary.failed, 2);
        assert_eq!(report.summary.downloaded, 0);
        let manifest = fs::read_to_string(dir.join("manifest.csv").as_std_path()).unwrap();
        assert!(manifest.contains("HTTP 404 Not Found"));
        assert!(report.rows.iter().all(|row| !row.exists));
    }

    #[test]
    fn discover_only_skips_transfers() {
        let temp = tempfile::tempdir().unwrap();
        let dir = pack_dir(&temp);
        let mut discover = config(dir.clone());
        discover.discover_only = true;
        let transfer = WritingTransfer {
            calls: AtomicUsize::new(0),
        };
        let runner = PackRunner::new(discover, catalog(), transfer);

        let report = runner.run(&CancelToken::new()).unwrap();
        assert_eq!(report.summary.planned, 2);
        assert_eq!(report.summary.downloaded, 0);
        assert_eq!(runner.transfer.calls.load(Ordering::SeqCst), 0);
        assert!(dir.join("manifest.csv").as_std_path().exists());
    }

    #[test]
    fn discovery_failure_is_fatal() {
        struct BrokenCatalog;
        impl CatalogClient for BrokenCatalog {
            fn feature_type_names(&self) -> Result<Vec<String>, PackError> {
                Err(PackError::DiscoveryStatus {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            }

            fn coverage_ids(&self) -> Result<Vec<String>, PackError> {
                Ok(Vec::new())
            }
        }

        let temp = tempfile::tempdir().unwrap();
        let dir = pack_dir(&temp);
        let runner = PackRunner::new(config(dir.clone()), BrokenCatalog, FailingTransfer);
        let err = runner.run(&CancelToken::new()).unwrap_err();
        assert_matches::assert_matches!(err, PackError::DiscoveryStatus { status: 503, .. });
        // nothing planned, nothing written
        assert!(!dir.join("manifest.csv").as_std_path().exists());
    }

    #[test]
    fn cancelled_run_still_writes_the_manifest() {
        let temp = tempfile::tempdir().unwrap();
        let dir = pack_dir(&temp);
        let cancel = CancelToken::new();
        cancel.cancel();
        let runner = PackRunner::new(
            config(dir.clone()),
            catalog(),
            WritingTransfer {
                calls: AtomicUsize::new(0),
            },
        );

        let report = runner.run(&cancel).unwrap();
        assert_eq!(report.summary.downloaded, 0);
        assert_eq!(runner.transfer.calls.load(Ordering::SeqCst), 0);
        assert!(dir.join("manifest.csv").as_std_path().exists());
    }
}
