use std::fmt;

use chrono::Utc;

use crate::meta::rollover::{RolloverState, RolloverStatus};
use crate::migrator::MigrationReport;

/// rollover 进度报告（CLI 展示用）
#[derive(Clone, Debug)]
pub struct RolloverReport {
    pub status: RolloverStatus,
}

impl RolloverReport {
    pub fn new(status: RolloverStatus) -> Self {
        Self { status }
    }

    /// 已运行时长（秒）；终态时为开始到最后一次更新
    pub fn elapsed_secs(&self) -> i64 {
        let end = if self.status.state.is_terminal() {
            self.status.updated_at
        } else {
            Utc::now()
        };
        (end - self.status.started_at).num_seconds().max(0)
    }
}

fn human_secs(secs: i64) -> String {
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

fn group_line(group: Option<&crate::core::ShardGroup>) -> String {
    match group {
        Some(g) => format!("{} on {}", g.id, g.nodes().join(",")),
        None => "-".to_string(),
    }
}

impl fmt::Display for RolloverReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.status;
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           Rollover Report                        ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ kb:       {}", s.kbid)?;
        writeln!(f, "║ kind:     {}", s.kind)?;
        writeln!(f, "║ state:    {}", s.state)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║   indexed:      {:>10}", s.indexed)?;
        writeln!(f, "║   cursor:       {:>10}", s.cursor.as_deref().unwrap_or("-"))?;
        writeln!(f, "║   elapsed:      {:>10}", human_secs(self.elapsed_secs()))?;
        writeln!(f, "║   target:       {}", group_line(s.target_group.as_ref()))?;
        writeln!(f, "║   previous:     {}", group_line(s.previous_group.as_ref()))?;
        if !s.orphaned_shards.is_empty() {
            writeln!(f, "║   orphaned:     {}", s.orphaned_shards.join(","))?;
        }
        if s.state == RolloverState::Failed {
            writeln!(f, "║   error:        {}", s.error.as_deref().unwrap_or("-"))?;
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "target version:  {}", self.target)?;
        writeln!(f, "global applied:  {:?}", self.global_applied)?;
        writeln!(f, "kbs migrated:    {}", self.kbs_migrated)?;
        writeln!(f, "kb failures:     {}", self.kb_failures.len())?;
        for (kbid, err) in &self.kb_failures {
            writeln!(f, "  {}: {}", kbid, err)?;
        }
        Ok(())
    }
}
