//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **SimulatedHypervisor**: メモリ上の VM テーブル（障害注入つき）
//! - **StaticDownloadProvider**: 登録済みペイロードと `file://` を配信
//!
//! 本物の VirtualBox CLI や HTTP 転送はこのクレートの対象外です。

pub mod sim_hypervisor;
pub mod static_download;

// 主要な型を再エクスポート
pub use self::sim_hypervisor::{SimPower, SimulatedHypervisor};
pub use self::static_download::StaticDownloadProvider;
