//! Batch delineation across regions of outlets.
//!
//! Each outlet moves through pending -> running -> collected, or is skipped
//! by the resume filters, or is recorded as failed against the fail budget.
//! Basin data loads lazily through the shared LRU. An interrupt flag is
//! checked between outlets only; on interrupt the in-progress region
//! flushes to a `_PARTIAL` output so nothing already delineated is lost.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};

use crate::basins::BasinIndex;
use crate::config::MasterConfig;
use crate::country::CountryLookup;
use crate::delineate::{DelineateOptions, DelineatedWatershed, delineate_outlet};
use crate::errors::DelineationError;
use crate::merit::{self, BasinDataCache};
use crate::output::{OutputWriter, WriteMode};

/// Counters and terminal state of a batch run.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub interrupted: bool,
    pub aborted_on_failures: bool,
}

impl BatchSummary {
    /// Conventional exit code: 0 all-success, 1 partial, 2 no successes or
    /// budget abort, 130 interrupt.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            130
        } else if self.aborted_on_failures {
            2
        } else if self.failed == 0 {
            0
        } else if self.processed > 0 {
            1
        } else {
            2
        }
    }
}

/// Resume behaviour for existing outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Fail when any region output already exists.
    FailIfExists,
    /// Skip outlets already present in the output, then append.
    SkipExisting,
    /// Overwrite all existing outputs.
    Force,
}

pub struct BatchDriver<'a> {
    config: &'a MasterConfig,
    writer: &'a OutputWriter,
    basin_index: &'a BasinIndex,
    basin_cache: &'a BasinDataCache,
    country: &'a dyn CountryLookup,
    options: DelineateOptions,
    resume: ResumeMode,
    skip_failed: bool,
    cancel: Arc<AtomicBool>,
}

impl<'a> BatchDriver<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a MasterConfig,
        writer: &'a OutputWriter,
        basin_index: &'a BasinIndex,
        basin_cache: &'a BasinDataCache,
        country: &'a dyn CountryLookup,
        options: DelineateOptions,
        resume: ResumeMode,
        skip_failed: bool,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            writer,
            basin_index,
            basin_cache,
            country,
            options,
            resume,
            skip_failed,
            cancel,
        }
    }

    pub fn run(&self) -> Result<BatchSummary> {
        // Fail-safe default: refuse to touch existing outputs unless a
        // resume mode was chosen explicitly.
        if self.resume == ResumeMode::FailIfExists {
            let existing: Vec<&str> = self
                .config
                .regions
                .iter()
                .filter(|region| self.writer.check_output_exists(&region.name))
                .map(|region| region.name.as_str())
                .collect();
            if !existing.is_empty() {
                bail!(
                    "output already exists for region(s) {}; \
                     use --skip-existing to resume or --force to overwrite",
                    existing.join(", ")
                );
            }
        }

        let failed_gauge_ids = if self.skip_failed {
            let ids = self.writer.load_failed_gauge_ids();
            if !ids.is_empty() {
                info!("Found {} previously failed outlet(s) to skip", ids.len());
            }
            ids
        } else {
            HashSet::new()
        };

        let data_dir = self.config.data_dir();
        let fdir_dir = merit::flowdir_dir(&data_dir);
        let accum_dir = merit::accum_dir(&data_dir);
        let max_fails = self.config.settings.max_fails;

        let mut summary = BatchSummary::default();
        let mut fail_count: u32 = 0;

        for (region_index, region) in self.config.regions.iter().enumerate() {
            info!(
                "[{}/{}] Processing region: {}",
                region_index + 1,
                self.config.regions.len(),
                region.name
            );

            let outlets = crate::config::load_outlets(Path::new(&region.outlets))
                .with_context(|| format!("loading outlets for region '{}'", region.name))?;

            let existing_ids = if self.resume == ResumeMode::SkipExisting {
                let ids = self.writer.read_existing_gauge_ids(&region.name);
                if !ids.is_empty() {
                    info!("Found {} existing outlet(s) to skip", ids.len());
                }
                ids
            } else {
                HashSet::new()
            };

            let write_mode = match self.resume {
                ResumeMode::Force => WriteMode::Overwrite,
                ResumeMode::SkipExisting if !existing_ids.is_empty() => WriteMode::Append,
                _ => WriteMode::Create,
            };

            let mut collected: Vec<DelineatedWatershed> = Vec::new();

            for outlet in &outlets {
                if self.cancel.load(Ordering::SeqCst) {
                    warn!("Interrupted while processing region '{}'", region.name);
                    self.flush_partial(&region.name, &collected, write_mode);
                    self.writer.finalize()?;
                    summary.interrupted = true;
                    return Ok(summary);
                }

                if self.resume == ResumeMode::SkipExisting
                    && existing_ids.contains(&outlet.gauge_id)
                {
                    summary.skipped += 1;
                    continue;
                }
                if self.skip_failed && failed_gauge_ids.contains(&outlet.gauge_id) {
                    summary.skipped += 1;
                    continue;
                }

                match self.delineate_one(outlet, &fdir_dir, &accum_dir) {
                    Ok(watershed) => {
                        info!(
                            "{}: {:.1} km², {}",
                            outlet.gauge_id, watershed.area_km2, watershed.country
                        );
                        collected.push(watershed);
                        summary.processed += 1;
                    }
                    Err(e) => {
                        self.writer.record_failure(
                            &region.name,
                            &outlet.gauge_id,
                            outlet.lat,
                            outlet.lng,
                            &e.to_string(),
                        );
                        summary.failed += 1;
                        fail_count += 1;

                        if let Some(budget) = max_fails
                            && fail_count >= budget
                        {
                            error!("Reached maximum failures ({budget}), aborting");
                            self.flush_region(&region.name, &collected, write_mode);
                            self.writer.finalize()?;
                            summary.aborted_on_failures = true;
                            return Ok(summary);
                        }
                    }
                }
            }

            info!(
                "Region '{}' complete: {} succeeded, {} failed so far",
                region.name,
                collected.len(),
                summary.failed
            );
            self.flush_region(&region.name, &collected, write_mode);
        }

        self.writer.finalize()?;
        Ok(summary)
    }

    fn delineate_one(
        &self,
        outlet: &crate::config::Outlet,
        fdir_dir: &Path,
        accum_dir: &Path,
    ) -> Result<DelineatedWatershed, DelineationError> {
        let basin = self
            .basin_index
            .basin_for_point(outlet.lat, outlet.lng)?
            .ok_or(DelineationError::NoRiverFound { lat: outlet.lat, lng: outlet.lng })?;
        let basin_data = self.basin_cache.get_or_load(basin)?;
        delineate_outlet(
            &outlet.gauge_id,
            outlet.lat,
            outlet.lng,
            &outlet.gauge_name,
            &basin_data,
            fdir_dir,
            accum_dir,
            &self.options,
            self.country,
        )
    }

    fn flush_region(&self, region: &str, collected: &[DelineatedWatershed], mode: WriteMode) {
        if collected.is_empty() {
            return;
        }
        match self.writer.write_region_output(region, collected, mode) {
            Ok(path) => info!("Wrote region output: {}", path.display()),
            // A write failure loses this region but not the whole batch.
            Err(e) => error!("Failed to write output for region '{region}': {e}"),
        }
    }

    fn flush_partial(&self, region: &str, collected: &[DelineatedWatershed], mode: WriteMode) {
        if collected.is_empty() {
            return;
        }
        let partial = format!("{region}_PARTIAL");
        warn!("Saving {} partial result(s) for {partial}", collected.len());
        if let Err(e) = self.writer.write_region_output(&partial, collected, mode) {
            error!("Failed to save partial results: {e}");
        }
    }
}
