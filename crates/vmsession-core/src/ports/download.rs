//! DownloadProvider port - メディアのダウンロード
//!
//! The session only depends on this contract: fetch bytes into a file or a
//! string, optionally driving a `VariableTask` with the transferred size,
//! and report failures with the shared status taxonomy.

use std::path::Path;

use crate::domain::HvStatus;
use crate::progress::VariableTask;

/// DownloadProvider はファイル/テキストを取得
///
/// # 進捗
/// `sink` が渡された場合、`set_max(total)` と `update(done)` で進捗を報告する。
#[async_trait::async_trait]
pub trait DownloadProvider: Send + Sync {
    async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        sink: Option<VariableTask>,
    ) -> Result<(), HvStatus>;

    async fn download_text(&self, url: &str, sink: Option<VariableTask>) -> Result<String, HvStatus>;
}
