// Log ingestor: drives the external extractor over an inclusive block range
// and lands ordered parquet batch files on disk, one per inner sub-range.
//
// Resumption protocol: the checkpoint is the source of truth for the start
// block. Before re-invoking the extractor we delete the batch file with the
// highest end block ("trim tail") because a prior run may have crashed while
// writing it; its filename can look complete while its contents are not.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{info, warn};
use tokio::process::Command;

use crate::error::{Result, WhitelistError};
use crate::protocols::ProtocolSpec;
use crate::rpc::BlockSource;
use crate::settings::Extractor;

/// Result of one ingest call: the inclusive end block actually covered and
/// the batch files whose events are newer than the checkpoint, in block
/// order.
#[derive(Debug)]
pub struct IngestOutcome {
    pub covered_end_block: u64,
    pub batch_files: Vec<PathBuf>,
}

pub struct LogIngestor {
    binary: String,
    inner_request_size: u64,
    timeout: Duration,
}

impl LogIngestor {
    pub fn new(config: &Extractor) -> Self {
        Self {
            binary: config.binary.clone(),
            inner_request_size: config.inner_request_size,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// Checks the extractor binary is invocable before the first ingest of a
    /// cycle.
    pub async fn preflight(&self) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                WhitelistError::ExtractorFailed(format!("'{}' not invocable: {e}", self.binary))
            })?;
        if !output.status.success() {
            return Err(WhitelistError::ExtractorFailed(format!(
                "'{} --version' exited with {}",
                self.binary, output.status
            )));
        }
        let version = String::from_utf8_lossy(&output.stdout);
        info!("[Ingestor] Extractor available: {}", version.trim());
        Ok(())
    }

    /// Runs the full resumption protocol for one (chain, protocol variant).
    ///
    /// `checkpoint` is the stored last end block, if any; `end_block_hint`
    /// overrides the finalized head when given.
    pub async fn ingest(
        &self,
        chain: &str,
        spec: &ProtocolSpec,
        rpc_url: &str,
        block_source: &dyn BlockSource,
        checkpoint: Option<u64>,
        end_block_hint: Option<u64>,
        output_dir: &Path,
    ) -> Result<IngestOutcome> {
        std::fs::create_dir_all(output_dir).map_err(|e| {
            WhitelistError::ExtractorFailed(format!(
                "cannot create output dir {}: {e}",
                output_dir.display()
            ))
        })?;

        // Crash safety: the last file on disk is not trusted.
        if let Some(removed) = trim_tail(output_dir)? {
            info!(
                "[Ingestor] {}/{}: trimmed tail file {}",
                chain,
                spec.variant,
                removed.display()
            );
        }

        let ck = checkpoint.unwrap_or(0);
        let start_block = match checkpoint {
            Some(ck) => (ck + 1).max(spec.deployment_block),
            None => spec.deployment_block,
        };

        let end_block = match end_block_hint {
            Some(hint) => hint,
            None => block_source.finalized_block_number().await?,
        };

        if start_block > end_block {
            info!(
                "[Ingestor] {}/{}: up to date (checkpoint {} >= head {})",
                chain, spec.variant, ck, end_block
            );
            return Ok(IngestOutcome {
                covered_end_block: ck,
                batch_files: Vec::new(),
            });
        }

        info!(
            "[Ingestor] {}/{}: fetching logs for blocks {}..={} ({} factories)",
            chain,
            spec.variant,
            start_block,
            end_block,
            spec.factories.len()
        );

        self.run_extractor(spec, rpc_url, start_block, end_block, output_dir)
            .await?;

        // Only files strictly past the checkpoint carry new events.
        let mut batch_files: Vec<(u64, u64, PathBuf)> = Vec::new();
        let entries = std::fs::read_dir(output_dir).map_err(|e| {
            WhitelistError::ExtractorFailed(format!(
                "cannot scan output dir {}: {e}",
                output_dir.display()
            ))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if let Some((s, e)) = parse_range_from_filename(name) {
                if checkpoint.map_or(true, |ck| e > ck) {
                    batch_files.push((s, e, path));
                }
            }
        }
        batch_files.sort_by_key(|(s, e, _)| (*s, *e));

        let covered_end_block = batch_files
            .iter()
            .map(|(_, e, _)| *e)
            .max()
            .unwrap_or(end_block);

        Ok(IngestOutcome {
            covered_end_block,
            batch_files: batch_files.into_iter().map(|(_, _, p)| p).collect(),
        })
    }

    async fn run_extractor(
        &self,
        spec: &ProtocolSpec,
        rpc_url: &str,
        start_block: u64,
        end_block: u64,
        output_dir: &Path,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("logs")
            .arg("--rpc")
            .arg(rpc_url)
            .arg("--inner-request-size")
            .arg(self.inner_request_size.to_string())
            .arg("--u256-types")
            .arg("binary")
            .arg("--blocks")
            .arg(format!("{start_block}:{end_block}"))
            .arg("--output-dir")
            .arg(output_dir);

        cmd.arg("--contract");
        for factory in &spec.factories {
            cmd.arg(format!("{:#x}", factory));
        }
        cmd.arg("--event").arg(format!("{:#x}", spec.topic));

        cmd.stdout(Stdio::null()).stderr(Stdio::piped());

        let child = cmd.output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                WhitelistError::ExtractorFailed(format!(
                    "{} timed out after {:?}",
                    self.binary, self.timeout
                ))
            })?
            .map_err(|e| {
                WhitelistError::ExtractorFailed(format!("failed to spawn {}: {e}", self.binary))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WhitelistError::ExtractorFailed(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Parses `<chain>__logs__<S>_to_<E>.<ext>` into the inclusive covered range.
pub fn parse_range_from_filename(name: &str) -> Option<(u64, u64)> {
    let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
    let (_, range) = stem.rsplit_once("__")?;
    let (start, end) = range.split_once("_to_")?;
    let start = start.parse::<u64>().ok()?;
    let end = end.parse::<u64>().ok()?;
    if start > end {
        return None;
    }
    Some((start, end))
}

/// Removes the batch file whose end block is maximal, returning its path.
/// No-op on an empty or missing directory.
pub fn trim_tail(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }
    let entries = std::fs::read_dir(dir).map_err(|e| {
        WhitelistError::ExtractorFailed(format!("cannot scan {}: {e}", dir.display()))
    })?;

    let mut tail: Option<(u64, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if let Some((_, end)) = parse_range_from_filename(name) {
            if tail.as_ref().map_or(true, |(max_end, _)| end > *max_end) {
                tail = Some((end, path));
            }
        }
    }

    match tail {
        Some((_, path)) => {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("[Ingestor] Could not trim {}: {e}", path.display());
                return Ok(None);
            }
            Ok(Some(path))
        }
        None => Ok(None),
    }
}
