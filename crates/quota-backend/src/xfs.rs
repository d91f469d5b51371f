//! XFS project-quota backend, driven via `xfs_quota`.

use crate::{run, Error, QuotaBackend, Result};
use domain::{ProjectId, QuotaReport, ReportKind};
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct XfsBackend {
    mount: PathBuf,
}

impl XfsBackend {
    pub fn new(mount: PathBuf) -> Self {
        Self { mount }
    }
}

impl QuotaBackend for XfsBackend {
    fn set_project_id(&self, path: &Path, id: ProjectId) -> Result<()> {
        run(
            "xfs_quota project",
            Command::new("xfs_quota").args([
                "-x",
                "-c",
                &format!("project -s -p {} {id}", path.display()),
                &self.mount.to_string_lossy(),
            ]),
        )?;
        Ok(())
    }

    fn set_quota(&self, id: ProjectId, bytes: u64) -> Result<()> {
        let kilobytes = bytes.div_ceil(1024);
        run(
            "xfs_quota limit",
            Command::new("xfs_quota").args([
                "-x",
                "-c",
                &format!("limit -p bhard={kilobytes} {id}"),
                &self.mount.to_string_lossy(),
            ]),
        )?;
        Ok(())
    }

    fn remove_quota(&self, _path: &Path, id: ProjectId) -> Result<()> {
        run(
            "xfs_quota limit 0",
            Command::new("xfs_quota").args([
                "-x",
                "-c",
                &format!("limit -p bhard=0 ihard=0 {id}"),
                &self.mount.to_string_lossy(),
            ]),
        )?;
        Ok(())
    }

    fn fetch_all_reports(&self, kind: ReportKind) -> Result<Vec<QuotaReport>> {
        let flag = match kind {
            ReportKind::Blocks => "-b",
            ReportKind::Inodes => "-i",
        };
        let output = run(
            "xfs_quota report",
            Command::new("xfs_quota").args([
                "-x",
                "-c",
                &format!("report -p -n -N {flag}"),
                &self.mount.to_string_lossy(),
            ]),
        )?;
        parse_report(&String::from_utf8_lossy(&output.stdout), kind)
    }
}

/// Parse `xfs_quota report -p -n -N` output.
///
/// Each line is `#<id> used soft hard warn grace`. Block units are
/// kilobytes and are normalized to bytes; inode units are plain counts.
fn parse_report(text: &str, kind: ReportKind) -> Result<Vec<QuotaReport>> {
    let mut reports = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(raw_id) = fields.next() else { continue };
        let Some(id_str) = raw_id.strip_prefix('#') else { continue };
        let Ok(id) = id_str.parse::<ProjectId>() else { continue };
        let Some(used_str) = fields.next() else {
            return Err(Error::UnparseableReport(line.to_string()));
        };
        let Some(hard_str) = fields.nth(1) else {
            return Err(Error::UnparseableReport(line.to_string()));
        };
        let used: u64 =
            used_str.parse().map_err(|_| Error::UnparseableReport(line.to_string()))?;
        let limit: u64 =
            hard_str.parse().map_err(|_| Error::UnparseableReport(line.to_string()))?;
        let (used, limit) = match kind {
            ReportKind::Blocks => (used * 1024, limit * 1024),
            ReportKind::Inodes => (used, limit),
        };
        reports.push(QuotaReport { id, used, limit });
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_block_report_into_bytes() {
        let text = "#42       1024       0          2048          00 [--------]\n";
        let reports = parse_report(text, ReportKind::Blocks).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, 42);
        assert_eq!(reports[0].used, 1024 * 1024);
        assert_eq!(reports[0].limit, 2048 * 1024);
    }

    #[test]
    fn parses_inode_report_as_counts() {
        let text = "#7       10       0          100          00 [--------]\n";
        let reports = parse_report(text, ReportKind::Inodes).unwrap();
        assert_eq!(reports[0].used, 10);
        assert_eq!(reports[0].limit, 100);
    }

    #[test]
    fn skips_header_and_blank_lines() {
        let text = "Project ID Used Soft Hard Warn/Grace\n---------- ----- ----- ----- -----\n\n";
        let reports = parse_report(text, ReportKind::Blocks).unwrap();
        assert!(reports.is_empty());
    }
}
