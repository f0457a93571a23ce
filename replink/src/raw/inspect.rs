//! Device identity and filesystem listings.

use replink_proto::{DeviceInfo, FsNode, FsStats, parse_walk, script};

use super::RawRepl;
use crate::Result;

impl RawRepl<'_> {
    /// Board, firmware and `.mpy` capabilities.
    pub async fn device_info(&mut self) -> Result<DeviceInfo> {
        let out = self.exec(script::DEVICE_INFO).await?;
        Ok(DeviceInfo::parse(&out)?)
    }

    /// Usage of the filesystem holding `path`.
    pub async fn fs_stats(&mut self, path: &str) -> Result<FsStats> {
        let out = self.exec(&script::fs_stats(path)).await?;
        Ok(FsStats::parse(&out)?)
    }

    /// Every file and directory on the device as a tree.
    pub async fn walk_fs(&mut self) -> Result<Vec<FsNode>> {
        let out = self.exec(script::WALK_FS).await?;
        Ok(parse_walk(&out))
    }

    /// Markdown summary of machine, CPU, firmware and heap.
    pub async fn sysinfo_markdown(&mut self) -> Result<String> {
        self.exec(script::SYSINFO_MARKDOWN).await
    }
}
