//! Ports - 抽象化レイヤー
//!
//! このモジュールはセッションが依存する外部システムへの「ポート」を定義します。
//! 実装（開発用）は `impls` にあります。
//!
//! - **HypervisorControl**: 同期コマンド実行（FSM ワーカースレッドから呼ばれる）
//! - **DownloadProvider**: 非同期ダウンロード（進捗は VariableTask へ）
//! - **Clock**: エラー回復ウィンドウの時刻

pub mod clock;
pub mod download;
pub mod hypervisor;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::download::DownloadProvider;
pub use self::hypervisor::{exec_with_retry, parse_key_values, HypervisorControl};
