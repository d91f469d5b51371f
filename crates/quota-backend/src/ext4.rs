//! ext4 project-quota backend, driven via `chattr` / `setquota` / `repquota`.

use crate::{run, Error, QuotaBackend, Result};
use domain::{ProjectId, QuotaReport, ReportKind};
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct Ext4Backend {
    mount: PathBuf,
}

impl Ext4Backend {
    pub fn new(mount: PathBuf) -> Self {
        Self { mount }
    }
}

impl QuotaBackend for Ext4Backend {
    fn set_project_id(&self, path: &Path, id: ProjectId) -> Result<()> {
        run(
            "chattr -R -p +P",
            Command::new("chattr").args([
                "-R",
                "-p",
                &id.to_string(),
                "+P",
                path.to_str().unwrap_or_default(),
            ]),
        )?;
        Ok(())
    }

    fn set_quota(&self, id: ProjectId, bytes: u64) -> Result<()> {
        let kilobytes = bytes.div_ceil(1024);
        run(
            "setquota",
            Command::new("setquota").args([
                "-P",
                &id.to_string(),
                &kilobytes.to_string(),
                &kilobytes.to_string(),
                "0",
                "0",
                &self.mount.to_string_lossy(),
            ]),
        )?;
        Ok(())
    }

    fn remove_quota(&self, path: &Path, id: ProjectId) -> Result<()> {
        run(
            "setquota clear",
            Command::new("setquota").args([
                "-P",
                &id.to_string(),
                "0",
                "0",
                "0",
                "0",
                &self.mount.to_string_lossy(),
            ]),
        )?;
        run(
            "chattr -p 0",
            Command::new("chattr").args(["-p", "0", path.to_str().unwrap_or_default()]),
        )?;
        run("chattr -P", Command::new("chattr").args(["-P", path.to_str().unwrap_or_default()]))?;
        Ok(())
    }

    fn fetch_all_reports(&self, kind: ReportKind) -> Result<Vec<QuotaReport>> {
        let output = run(
            "repquota",
            Command::new("repquota").args(["-P", "-n", &self.mount.to_string_lossy()]),
        )?;
        parse_report(&String::from_utf8_lossy(&output.stdout), kind)
    }
}

/// Parse `repquota -P -n` output.
///
/// Columns: `id [+-]? used soft hard grace inodes_used inodes_soft
/// inodes_hard inodes_grace`. Block columns are kilobytes and are
/// normalized to bytes; inode columns are already counts.
fn parse_report(text: &str, kind: ReportKind) -> Result<Vec<QuotaReport>> {
    let mut reports = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || !line.starts_with(['#', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9']) {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(raw_id) = fields.next() else { continue };
        let Ok(id) = raw_id.trim_start_matches('#').parse::<ProjectId>() else { continue };
        let mut fields = fields.peekable();
        if let Some(next) = fields.peek() {
            if next.len() == 1 && matches!(next.chars().next(), Some('+') | Some('-')) {
                fields.next();
            }
        }
        let (Some(block_used), _block_soft, Some(block_hard), _grace) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::UnparseableReport(line.to_string()));
        };
        let (Some(inode_used), _inode_soft, Some(inode_hard)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::UnparseableReport(line.to_string()));
        };
        let parse_u64 =
            |s: &str| s.parse::<u64>().map_err(|_| Error::UnparseableReport(line.to_string()));
        let (used, limit) = match kind {
            ReportKind::Blocks => (parse_u64(block_used)? * 1024, parse_u64(block_hard)? * 1024),
            ReportKind::Inodes => (parse_u64(inode_used)?, parse_u64(inode_hard)?),
        };
        reports.push(QuotaReport { id, used, limit });
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_block_columns_into_bytes() {
        let text = "\
*** Report for project quotas on device /dev/sda1
Block grace time: 7days; Inode grace time: 7days
                        Block limits                File limits
Project         used    soft    hard  grace    used  soft  hard  grace
----------------------------------------------------------------------
#42       --    2048    4096    8192          10     0     0      0\n";
        let reports = parse_report(text, ReportKind::Blocks).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, 42);
        assert_eq!(reports[0].used, 2048 * 1024);
        assert_eq!(reports[0].limit, 8192 * 1024);
    }

    #[test]
    fn parses_inode_columns_as_counts() {
        let text = "#7       --    2048    4096    8192          10     0     20      0\n";
        let reports = parse_report(text, ReportKind::Inodes).unwrap();
        assert_eq!(reports[0].used, 10);
        assert_eq!(reports[0].limit, 20);
    }
}
